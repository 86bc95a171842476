//! The pool set and its dispatcher.
//!
//! A `Heap` is one complete allocator: a power-of-two array of pool
//! shards, sharded over threads, plus a page of configuration that is
//! written once and then mapped read-only.  Shard 0 is reserved for
//! concealed allocations; the rest serve the regular entry points.
//!
//! The process-global heap is created lazily by `api`; tests build
//! private heaps with their own option strings, which is why nothing in
//! here touches global state except the thread-id counter.
//!
//! Heaps are immortal by construction.  Every shard address is baked
//! into issued pointers' bookkeeping, so tearing one down could never
//! be safe; the handful of instances tests create just stay mapped.
use std::cell::{Cell, RefCell};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::ReentrantMutex;

use crate::chunk::{MIN_SHIFT, MIN_SIZE};
use crate::diag;
use crate::junk::SOME_FREEJUNK;
use crate::map::{self, page_round, PAGE_SIZE};
use crate::options::Options;
use crate::pool::Pool;
use crate::provider::{PageProvider, SystemProvider};
use crate::rng;

/// Upper bound on pool shards; the `+` option clamps here.
pub(crate) const MAX_POOLS: usize = 32;

static_assertions::const_assert!(MAX_POOLS.is_power_of_two());

/// The once-written configuration record.  It lives alone in a page
/// that is remapped read-only before the first allocation, so a write
/// primitive aimed at allocator state faults instead of succeeding.
#[repr(C)]
pub(crate) struct ReadonlyState {
    opts: Options,
    heap_canary: u32,
    junk_loc: u32,
    chunk_canary: u32,
    n_pools: u32,
    shards: [*mut Shard; MAX_POOLS],
}

// Written once before any sharing, read-only afterwards.
unsafe impl Sync for ReadonlyState {}

static_assertions::const_assert!(mem::size_of::<ReadonlyState>() <= PAGE_SIZE);

impl ReadonlyState {
    pub(crate) fn opts(&self) -> &Options {
        &self.opts
    }

    pub(crate) fn heap_canary(&self) -> u32 {
        self.heap_canary
    }

    pub(crate) fn junk_loc(&self) -> u32 {
        self.junk_loc
    }

    pub(crate) fn chunk_canaries(&self) -> bool {
        self.chunk_canary != 0
    }

    pub(crate) fn chunk_canary_byte(&self) -> u8 {
        self.chunk_canary as u8
    }

    pub(crate) fn n_pools(&self) -> usize {
        self.n_pools as usize
    }
}

/// Shared interior of a shard: the recursion counter and the pool,
/// both only touched while the reentrant lock is held.
pub(crate) struct ShardCell {
    active: Cell<u32>,
    pool: RefCell<Pool>,
}

pub(crate) struct Shard {
    lock: ReentrantMutex<ShardCell>,
}

// Shards are placed by address into a guard-paged mapping; their
// alignment requirement must fit the minimum placement granularity.
static_assertions::const_assert!(mem::align_of::<Shard>() <= MIN_SIZE);

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static THREAD_ID: u32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Monotonic per-thread id, used only to spread threads over shards.
fn current_thread_id() -> u32 {
    THREAD_ID.with(|t| *t)
}

/// One complete allocator instance.
pub struct Heap {
    ro: &'static ReadonlyState,
}

impl Heap {
    /// Builds a heap configured by `opts`, an option string in the
    /// same one-character format as the environment variable.
    pub fn new(opts: &str) -> Heap {
        let mut options = Options::default();
        options.parse(opts);
        Heap::with_options(options)
    }

    pub(crate) fn from_boot_sources(boot: Option<&str>) -> Heap {
        Heap::with_options(Options::from_sources(boot))
    }

    fn with_options(opts: Options) -> Heap {
        // Fail early if the host page size disagrees with the build.
        let _ = map::page_size();
        let provider = SystemProvider::new(false);

        let mut heap_canary = rng::random_u32();
        while heap_canary == 0 {
            heap_canary = rng::random_u32();
        }
        let junk_loc = rng::random_u32();
        let chunk_canary = if opts.chunk_canaries {
            // The low byte is the visible canary; it must not collide
            // with zero fill or the free-junk byte.
            loop {
                let c = rng::random_u32();
                if c as u8 != 0 && c as u8 != SOME_FREEJUNK {
                    break c;
                }
            }
        } else {
            0
        };

        let n = opts.n_pools as usize;
        debug_assert!(n >= 2 && n <= MAX_POOLS && n.is_power_of_two());

        // The shard array sits between two guard pages, at a random
        // minimum-size-aligned offset inside its first page, so its
        // absolute address is not derivable from the mapping base.
        let shards_bytes = n * mem::size_of::<Shard>();
        let block = match map::map_none(page_round(shards_bytes) + 2 * PAGE_SIZE) {
            Ok(p) => p,
            Err(e) => diag::fatal("init", format_args!("pool mmap failed (errno {})", e)),
        };
        if map::protect_rw(block + PAGE_SIZE, page_round(shards_bytes)).is_err() {
            diag::fatal("init", format_args!("pool mprotect failed"));
        }
        provider.immutable(block, (page_round(shards_bytes) + 2 * PAGE_SIZE) / PAGE_SIZE);

        let slack = (page_round(shards_bytes) - shards_bytes) >> MIN_SHIFT;
        let offset = if slack > 0 {
            (rng::random_uniform(slack as u32) as usize) << MIN_SHIFT
        } else {
            0
        };
        let shards_base = block + PAGE_SIZE + offset;

        let mut shards = [ptr::null_mut::<Shard>(); MAX_POOLS];
        for (i, slot) in shards.iter_mut().enumerate().take(n) {
            *slot = (shards_base + i * mem::size_of::<Shard>()) as *mut Shard;
        }

        // Write the configuration page, then seal it.
        let ro_page = match map::map_rw(PAGE_SIZE) {
            Ok(p) => p,
            Err(e) => diag::fatal("init", format_args!("options mmap failed (errno {})", e)),
        };
        unsafe {
            ptr::write(
                ro_page as *mut ReadonlyState,
                ReadonlyState {
                    opts,
                    heap_canary,
                    junk_loc,
                    chunk_canary,
                    n_pools: n as u32,
                    shards,
                },
            );
        }
        if map::protect_read(ro_page, PAGE_SIZE).is_err() {
            diag::fatal("init", format_args!("options mprotect failed"));
        }
        provider.immutable(ro_page, 1);

        let ro: &'static ReadonlyState = unsafe { &*(ro_page as *const ReadonlyState) };

        for (i, &shard) in shards.iter().enumerate().take(n) {
            unsafe {
                ptr::write(
                    shard,
                    Shard {
                        lock: ReentrantMutex::new(ShardCell {
                            active: Cell::new(0),
                            pool: RefCell::new(Pool::new(i as u32, ro)),
                        }),
                    },
                );
            }
            // The canaries depend on the pool's resting address, so
            // they can only be derived after placement.
            let cell = unsafe { &*shard }.lock.lock();
            cell.pool.borrow_mut().bind_canaries();
        }

        Heap { ro }
    }

    pub(crate) fn ro(&self) -> &'static ReadonlyState {
        self.ro
    }

    fn shard(&self, index: usize) -> &Shard {
        debug_assert!(index < self.ro.n_pools());
        unsafe { &*self.ro.shards[index] }
    }

    /// The shard serving the calling thread.  Shard 0 is reserved.
    pub(crate) fn shard_index_for_thread(&self) -> usize {
        1 + current_thread_id() as usize % (self.ro.n_pools() - 1)
    }

    /// Runs `f` on one pool with the lock held and the recursion trap
    /// armed.  `None` means the call re-entered an active pool and the
    /// one-shot report already fired; errno carries EDEADLK.
    pub(crate) fn with_pool<R>(
        &self,
        index: usize,
        op: &'static str,
        f: impl FnOnce(&mut Pool) -> R,
    ) -> Option<R> {
        let cell = self.shard(index).lock.lock();
        if cell.active.get() > 0 {
            diag::recursion(op);
            errno::set_errno(errno::Errno(libc::EDEADLK));
            return None;
        }
        cell.active.set(1);
        let ret = {
            let mut pool = cell.pool.borrow_mut();
            pool.func = op;
            f(&mut pool)
        };
        cell.active.set(0);
        Some(ret)
    }

    /// Locates the pool owning `ptr` and runs `f` on it under its
    /// lock.  Starts with the calling thread's shard, then walks the
    /// others in rotation, holding at most one lock at any instant.
    /// Aborts if no pool owns the pointer.
    pub(crate) fn with_owner<R>(
        &self,
        start: usize,
        op: &'static str,
        ptr: usize,
        f: impl Fn(&mut Pool, usize) -> R,
    ) -> Option<R> {
        let n = self.ro.n_pools();
        for step in 0..n {
            let index = (start + step) & (n - 1);
            let cell = self.shard(index).lock.lock();
            if cell.active.get() > 0 {
                diag::recursion(op);
                errno::set_errno(errno::Errno(libc::EDEADLK));
                return None;
            }
            cell.active.set(1);
            let found = {
                let mut pool = cell.pool.borrow_mut();
                if step == 0 {
                    pool.stats_mut().pool_searches += 1;
                }
                let saved = pool.func;
                pool.func = op;
                match pool.find_region(ptr) {
                    Some(region_index) => {
                        let out = f(&mut pool, region_index);
                        if step != 0 {
                            // A cross-pool hit borrows the entry-point
                            // label only for the duration of the call.
                            pool.func = saved;
                        }
                        Some(out)
                    }
                    None => {
                        if step == 0 {
                            // The pointer lives elsewhere; one search
                            // of the remaining shards begins.
                            pool.stats_mut().other_pool += 1;
                        }
                        pool.func = saved;
                        None
                    }
                }
            };
            cell.active.set(0);
            if let Some(out) = found {
                return Some(out);
            }
        }
        diag::fatal(op, format_args!("bogus pointer (double free?) {:#x}", ptr));
    }

    /// Drains quarantines and writes the statistics and leak report to
    /// the log sink.
    #[cfg(feature = "stats")]
    pub fn dump(&self) {
        let mut leaks = crate::stats::dump::new_leak_table();
        let verbose = self.ro.opts().verbose;
        for index in 0..self.ro.n_pools() {
            let _ = self.with_pool(index, "dump", |pool| {
                pool.drain_quarantine();
                crate::stats::dump::dump_pool(index as u32, pool, verbose, &mut leaks);
            });
        }
        crate::stats::dump::dump_leaks(&leaks);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn thread_ids_are_distinct_and_stable() {
        let here = current_thread_id();
        assert_eq!(here, current_thread_id());

        let other = std::thread::spawn(current_thread_id)
            .join()
            .expect("thread should run");
        assert_ne!(here, other);
    }

    #[test]
    fn shard_choice_avoids_the_concealed_pool() {
        let heap = Heap::new("");
        let index = heap.shard_index_for_thread();
        assert!(index >= 1 && index < heap.ro().n_pools());
    }

    #[test]
    fn heaps_are_independent() {
        let a = Heap::new("");
        let b = Heap::new("");

        let pa = a.malloc(100);
        let pb = b.malloc(100);
        assert!(!pa.is_null() && !pb.is_null());
        assert_ne!(pa, pb);

        unsafe {
            a.free(pa);
            b.free(pb);
        }
    }

    #[test]
    fn pool_count_option_is_honored() {
        let heap = Heap::new("--------");
        assert_eq!(heap.ro().n_pools(), 2);

        let heap = Heap::new("+");
        assert_eq!(heap.ro().n_pools(), 16);
    }
}
