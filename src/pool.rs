//! One allocator shard.
//!
//! A `Pool` owns everything a shard needs: the region directory, the
//! two page caches, the per-bucket chunk lists, a recycling list of
//! chunk-meta records, the delayed-free quarantine, and a small pool of
//! random bytes.  All of it is guarded by the shard lock in `heap`; the
//! methods here assume the caller holds it.
//!
//! Metadata never lives on pages user data can reach: chunk-meta records
//! come from the metadata heap and directory storage is mapped privately
//! and released back zeroed.
use std::ffi::c_void;
use std::fmt;
use std::ptr;
use std::ptr::NonNull;

use crate::cache::{
    small_cache_max, tag_fresh, untag, BigCache, SmallCache, MAX_BIG_CACHE_PAGES,
    MAX_SMALL_CACHE_PAGES,
};
use crate::chunk::{
    bucket_alloc, bucket_size, size_bucket, ChunkMeta, BUCKETS, CHUNK_LISTS, MAX_CHUNK, MIN_SIZE,
};
use crate::diag;
use crate::directory::{Directory, GrowRequest, Region, RegionSlot};
use crate::heap::ReadonlyState;
use crate::junk;
use crate::junk::{SOME_FREEJUNK, SOME_JUNK};
use crate::map::{explicit_bzero, page_round, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use crate::provider::{Access, PageProvider, SystemProvider};
use crate::rng;
use crate::stats::Stats;

/// Depth of the delayed-free quarantine.
pub(crate) const QUARANTINE_SLOTS: usize = 16;
const QUARANTINE_MASK: usize = QUARANTINE_SLOTS - 1;

const RBYTES: usize = 32;

static_assertions::const_assert!(QUARANTINE_SLOTS.is_power_of_two());

type MetaRef = NonNull<ChunkMeta>;

pub(crate) struct Pool {
    canary1: u32,
    canary2: u32,
    /// Name of the public operation currently running on this pool,
    /// for diagnostics.
    pub(crate) func: &'static str,
    /// Junk level for this shard; the concealed shard pins it to 2.
    junk: u32,
    provider: SystemProvider,
    ro: &'static ReadonlyState,

    regions: Directory,

    /// Chunk pages with free slots, `CHUNK_LISTS` lists per bucket.
    /// The most recently linked page sits at the back.
    chunk_dir: Vec<Vec<MetaRef>>,
    /// Retired chunk-meta records waiting for a new page.
    meta_recycle: Vec<MetaRef>,

    quarantine: [usize; QUARANTINE_SLOTS],

    rbytes: [u8; RBYTES],
    rbytes_used: usize,

    small: Vec<SmallCache>,
    big: BigCache,

    stats: Stats,
}

#[inline]
fn dir_index(bucket: u32, list: usize) -> usize {
    bucket as usize * CHUNK_LISTS + list
}

impl Pool {
    pub(crate) fn new(index: u32, ro: &'static ReadonlyState) -> Pool {
        let opts = ro.opts();
        let concealed = index == 0;

        let mut small = Vec::with_capacity(MAX_SMALL_CACHE_PAGES);
        for psz in 1..=MAX_SMALL_CACHE_PAGES {
            let max = if concealed {
                0
            } else {
                small_cache_max(opts.def_maxcache, psz)
            };
            small.push(SmallCache::new(max));
        }
        let big = BigCache::new(if concealed { 0 } else { opts.def_maxcache as usize });

        Pool {
            canary1: 0,
            canary2: 0,
            func: "init",
            junk: if concealed { 2 } else { opts.def_junk },
            provider: SystemProvider::new(concealed),
            ro,
            regions: Directory::new(),
            chunk_dir: vec![Vec::new(); (BUCKETS + 1) * CHUNK_LISTS],
            meta_recycle: Vec::new(),
            quarantine: [0; QUARANTINE_SLOTS],
            rbytes: [0; RBYTES],
            rbytes_used: RBYTES,
            small,
            big,
            stats: Stats::default(),
        }
    }

    /// Ties the pool canaries to the pool's resting address.  Called
    /// once, after the pool has been placed in its shard.
    pub(crate) fn bind_canaries(&mut self) {
        let addr = self as *mut Pool as usize as u32;
        self.canary1 = self.ro.heap_canary() ^ addr;
        self.canary2 = !self.canary1;
    }

    fn die(&self, args: fmt::Arguments) -> ! {
        diag::fatal(self.func, args)
    }

    /// Every entry point revalidates the pool's own header before
    /// trusting any of its bookkeeping.
    pub(crate) fn check_canaries(&self) {
        let addr = self as *const Pool as usize as u32;
        if self.ro.heap_canary() != self.canary1 ^ addr || self.canary1 != !self.canary2 {
            self.die(format_args!("internal struct corrupt"));
        }
    }

    // ---- randomness -----------------------------------------------

    fn rbytes_refill(&mut self) {
        rng::random_fill(&mut self.rbytes);
        // Skip a random prefix so consumption patterns do not line up
        // with refill boundaries.  Slot 0 feeds the skip itself.
        self.rbytes_used = 1 + (self.rbytes[0] as usize) % (RBYTES / 2);
    }

    fn random_byte(&mut self) -> u8 {
        if self.rbytes_used >= RBYTES {
            self.rbytes_refill();
        }
        let x = self.rbytes[self.rbytes_used];
        self.rbytes_used += 1;
        x
    }

    fn random_u16(&mut self) -> u16 {
        ((self.random_byte() as u16) << 8) | self.random_byte() as u16
    }

    // ---- region directory wrappers --------------------------------

    fn insert_region(&mut self, slot: RegionSlot) -> Result<(), ()> {
        if self.regions.needs_grow() {
            let req: GrowRequest = match self.regions.grow_request() {
                Some(req) => req,
                None => return Err(()),
            };
            // The table itself is never drawn from the page caches.
            let storage = match self.provider.map_rw(req.bytes >> PAGE_SHIFT) {
                Ok(p) => p,
                Err(_) => return Err(()),
            };
            self.stats.bytes_used += req.bytes;
            if let Some((old, old_bytes)) = self.regions.grow_into(storage, req) {
                // The retired table goes back through the normal release
                // path, wiped so stale metadata never reaches a reused
                // page.
                self.page_release(old, old_bytes, old_bytes);
            }
        }
        self.regions.insert(slot);
        self.stats.inserts += 1;
        Ok(())
    }

    pub(crate) fn find_region(&mut self, addr: usize) -> Option<usize> {
        self.check_canaries();
        self.stats.finds += 1;
        self.regions.find(addr)
    }

    fn delete_region(&mut self, index: usize) {
        self.stats.deletes += 1;
        self.regions.delete(index);
    }

    // ---- page caches ----------------------------------------------

    /// Gets `sz` bytes (a whole page run) from the caches or the
    /// provider.  Cached runs are junk-validated before reuse.
    fn page_acquire(&mut self, sz: usize, zero_fill: bool) -> Option<usize> {
        self.check_canaries();
        let psz = sz >> PAGE_SHIFT;
        if sz != page_round(sz) || psz == 0 {
            self.die(format_args!("map round"));
        }
        let junk_loc = self.ro.junk_loc();
        let freeunmap = self.ro.opts().freeunmap;

        if self.big.enabled() && psz > MAX_SMALL_CACHE_PAGES && psz <= MAX_BIG_CACHE_PAGES {
            let base = self.random_byte();
            if let Some(p) = self.big.lookup(base, psz) {
                if !freeunmap {
                    junk::validate_junk(self.junk, junk_loc, self.func, p, sz);
                } else if self.provider.protect(p, psz, Access::ReadWrite).is_err() {
                    self.die(format_args!("mprotect {:#x}", p));
                }
                if zero_fill {
                    unsafe { ptr::write_bytes(p as *mut u8, 0, sz) };
                } else if freeunmap {
                    junk::junk_free(self.junk, junk_loc, p, sz);
                }
                return Some(p);
            }
        }

        if psz <= MAX_SMALL_CACHE_PAGES && self.small[psz - 1].enabled() {
            if self.small[psz - 1].len() > 0 {
                let r = self.random_byte();
                let entry = self.small[psz - 1].take_random(r).expect("non-empty cache");
                let (p, fresh) = untag(entry);
                if !fresh && !freeunmap {
                    junk::validate_junk(self.junk, junk_loc, self.func, p, sz);
                }
                if freeunmap && self.provider.protect(p, psz, Access::ReadWrite).is_err() {
                    self.die(format_args!("mprotect {:#x}", p));
                }
                if zero_fill {
                    unsafe { ptr::write_bytes(p as *mut u8, 0, sz) };
                } else if freeunmap {
                    junk::junk_free(self.junk, junk_loc, p, sz);
                }
                return Some(p);
            }
            if psz == 1 {
                // Bootstrap: map a whole slot's worth of single pages,
                // park all but the last as fresh.
                let max = self.small[0].max();
                if let Ok(p) = self.provider.map_rw(max) {
                    self.stats.bytes_used += max * PAGE_SIZE;
                    for i in 0..max - 1 {
                        self.small[0].push(tag_fresh(p + i * PAGE_SIZE));
                    }
                    if max > 1 && freeunmap {
                        let _ = self.provider.protect(p, max - 1, Access::None);
                    }
                    // The returned page is freshly mapped; no zero fill
                    // needed.
                    return Some(p + (max - 1) * PAGE_SIZE);
                }
            }
        }

        match self.provider.map_rw(psz) {
            Ok(p) => {
                self.stats.bytes_used += sz;
                Some(p)
            }
            Err(_) => None,
        }
    }

    /// Returns a page run to the caches, or to the provider when it
    /// does not fit.  The leading `clear` bytes are wiped first; the
    /// rest is junked or protected away per the options.
    fn page_release(&mut self, p: usize, sz: usize, clear: usize) {
        let psz = sz >> PAGE_SHIFT;
        if sz != page_round(sz) || psz == 0 {
            self.die(format_args!("munmap round"));
        }
        let junk_loc = self.ro.junk_loc();
        let freeunmap = self.ro.opts().freeunmap;

        if self.big.enabled() && psz > MAX_SMALL_CACHE_PAGES && psz <= MAX_BIG_CACHE_PAGES {
            let base = self.random_byte();
            let i = self.big.choose_insert_slot(base);
            if let Some((victim, vpsz)) = self.big.evict(i) {
                let vsz = vpsz << PAGE_SHIFT;
                if !freeunmap {
                    junk::validate_junk(self.junk, junk_loc, self.func, victim, vsz);
                }
                if self.provider.unmap(victim, vpsz).is_err() {
                    self.die(format_args!("munmap {:#x}", victim));
                }
                self.stats.bytes_used -= vsz;
            }
            if clear > 0 {
                explicit_bzero(p, clear);
            }
            if freeunmap {
                if self.provider.protect(p, psz, Access::None).is_err() {
                    self.die(format_args!("mprotect {:#x}", p));
                }
            } else {
                junk::junk_free(self.junk, junk_loc, p, sz);
            }
            self.big.set(i, p, psz);
            return;
        }

        if psz > MAX_SMALL_CACHE_PAGES || !self.small[psz - 1].enabled() {
            if self.provider.unmap(p, psz).is_err() {
                self.die(format_args!("munmap {:#x}", p));
            }
            self.stats.bytes_used -= sz;
            return;
        }

        if clear > 0 {
            explicit_bzero(p, clear);
        }
        if freeunmap {
            if self.provider.protect(p, psz, Access::None).is_err() {
                self.die(format_args!("mprotect {:#x}", p));
            }
        } else {
            junk::junk_free(self.junk, junk_loc, p, sz);
        }
        if self.small[psz - 1].is_full() {
            let r = self.random_byte();
            let victim_entry = self.small[psz - 1].replace_random(r, p);
            let (victim, fresh) = untag(victim_entry);
            if !fresh && !freeunmap {
                junk::validate_junk(self.junk, junk_loc, self.func, victim, sz);
            }
            if self.provider.unmap(victim, psz).is_err() {
                self.die(format_args!("munmap {:#x}", victim));
            }
            self.stats.bytes_used -= sz;
        } else {
            self.small[psz - 1].push(p);
        }
    }

    // ---- chunk engine ---------------------------------------------

    fn grab_meta(&mut self) -> MetaRef {
        self.meta_recycle
            .pop()
            .unwrap_or_else(|| NonNull::from(Box::leak(Box::new(ChunkMeta::new()))))
    }

    fn chunk_link_head(&mut self, bucket: u32, list: usize, meta: MetaRef) {
        unsafe { (*meta.as_ptr()).list = list as u32 };
        self.chunk_dir[dir_index(bucket, list)].push(meta);
    }

    fn chunk_unlink(&mut self, meta: MetaRef) {
        let (bucket, list) = unsafe {
            let info = meta.as_ref();
            (info.bucket, info.list)
        };
        let entries = &mut self.chunk_dir[dir_index(bucket, list as usize)];
        match entries.iter().position(|&m| m == meta) {
            Some(pos) => {
                entries.swap_remove(pos);
            }
            None => self.die(format_args!("internal struct corrupt")),
        }
        unsafe { (*meta.as_ptr()).list = crate::chunk::NO_LIST };
    }

    /// Provisions one fresh page of `bucket` chunks and links it on
    /// `list`.
    fn make_chunk_page(&mut self, bucket: u32, list: usize) -> Option<MetaRef> {
        let pp = self.page_acquire(PAGE_SIZE, false)?;

        // The zero-size bucket serves pointers into a page that traps
        // on any access.
        if bucket == 0 && self.provider.protect(pp, 1, Access::None).is_err() {
            self.page_release(pp, PAGE_SIZE, 0);
            return None;
        }

        let meta = self.grab_meta();
        unsafe { (*meta.as_ptr()).reinit(pp, bucket, self.canary1 as u16) };

        if self
            .insert_region(RegionSlot::new_chunk(pp, bucket, meta))
            .is_err()
        {
            self.meta_recycle.push(meta);
            if bucket == 0 {
                let _ = self.provider.protect(pp, 1, Access::ReadWrite);
            }
            self.page_release(pp, PAGE_SIZE, 0);
            return None;
        }
        self.chunk_link_head(bucket, list, meta);

        if bucket > 0 && self.junk != 0 {
            unsafe { ptr::write_bytes(pp as *mut u8, SOME_FREEJUNK, PAGE_SIZE) };
        }
        Some(meta)
    }

    /// Serves one chunk of `size` bytes.
    fn chunk_alloc(&mut self, size: usize) -> Option<usize> {
        self.check_canaries();

        let bucket = size_bucket(size, self.ro.opts().round_buckets());
        let r = self.random_u16() as u32;
        let list = r as usize % CHUNK_LISTS;

        let meta = match self.chunk_dir[dir_index(bucket, list)].last().copied() {
            Some(meta) => meta,
            None => self.make_chunk_page(bucket, list)?,
        };

        let (k, page, now_full) = {
            let info = unsafe { &mut *meta.as_ptr() };
            if info.canary != self.canary1 as u16 {
                self.die(format_args!("chunk info corrupted"));
            }
            // The start point is biased because total is usually not a
            // power of two; that is fine for spreading allocations.
            let start = (r / CHUNK_LISTS as u32) % info.total;
            let k = info.find_free(start);
            info.take(k);
            if self.ro.chunk_canaries() && size > 0 {
                info.record_size(k, size);
            }
            (k, info.page, info.free == 0)
        };
        if now_full {
            self.chunk_unlink(meta);
        }

        let p = page + k as usize * bucket_alloc(bucket);
        if bucket > 0 {
            junk::validate_junk(
                self.junk,
                self.ro.junk_loc(),
                self.func,
                p,
                bucket_size(bucket),
            );
            if self.ro.chunk_canaries() {
                junk::fill_canary(self.ro.chunk_canary_byte(), p, size, bucket_size(bucket));
            }
        }
        Some(p)
    }

    /// Validates `ptr` against its chunk page and returns the chunk
    /// number.  Catches misaligned pointers, frees of free chunks, and
    /// (optionally) trailing-canary damage.
    fn chunk_index_checked(&self, meta: MetaRef, ptr: usize, canary_check: bool) -> u32 {
        let info = unsafe { meta.as_ref() };
        if info.canary != self.canary1 as u16 {
            self.die(format_args!("chunk info corrupted"));
        }
        let chunknum = ((ptr & PAGE_MASK) / bucket_alloc(info.bucket)) as u32;

        if ptr & (MIN_SIZE - 1) != 0 {
            self.die(format_args!("modified chunk-pointer {:#x}", ptr));
        }
        if info.is_free(chunknum) {
            self.die(format_args!("double free {:#x}", ptr));
        }
        if canary_check && info.bucket > 0 {
            junk::validate_canary(
                self.ro.chunk_canary_byte(),
                self.func,
                ptr,
                info.recorded_size(chunknum),
                bucket_size(info.bucket),
            );
        }
        chunknum
    }

    /// Returns a chunk to its page; releases the page once every chunk
    /// on it is free.
    fn chunk_free(&mut self, region_index: usize, ptr: usize) {
        let slot = self.regions.slot(region_index);
        let meta = match slot.region() {
            Some(Region::Chunk { meta, .. }) => meta,
            _ => self.die(format_args!("internal struct corrupt")),
        };
        let chunknum = self.chunk_index_checked(meta, ptr, false);

        let (first_free, all_free, bucket, page) = {
            let info = unsafe { &mut *meta.as_ptr() };
            info.release(chunknum);
            (
                info.free == 1,
                info.free == info.total,
                info.bucket,
                info.page,
            )
        };

        if first_free {
            // The page left the full state; give it a random list.
            let list = self.random_byte() as usize % CHUNK_LISTS;
            self.chunk_link_head(bucket, list, meta);
            return;
        }
        if !all_free {
            return;
        }

        self.chunk_unlink(meta);
        if bucket == 0 && !self.ro.opts().freeunmap {
            if self.provider.protect(page, 1, Access::ReadWrite).is_err() {
                self.die(format_args!("mprotect {:#x}", page));
            }
        }
        self.page_release(page, PAGE_SIZE, 0);
        self.delete_region(region_index);
        self.meta_recycle.push(meta);
    }

    // ---- allocation entry points ----------------------------------

    /// The common allocation path: chunk pages up to half a page,
    /// page-granular beyond.
    pub(crate) fn allocate(&mut self, sz: usize, zero_fill: bool) -> *mut c_void {
        if sz <= MAX_CHUNK {
            let p = match self.chunk_alloc(sz) {
                Some(p) => p,
                None => return ptr::null_mut(),
            };
            if zero_fill && sz > 0 {
                unsafe { ptr::write_bytes(p as *mut u8, 0, sz) };
            }
            return p as *mut c_void;
        }

        let guard = self.ro.opts().guard;
        if sz >= usize::MAX - guard - PAGE_SIZE {
            set_enomem();
            return ptr::null_mut();
        }
        let gsz = sz + guard;
        let psz = page_round(gsz);

        let p = match self.page_acquire(psz, zero_fill) {
            Some(p) => p,
            None => {
                set_enomem();
                return ptr::null_mut();
            }
        };
        if self.insert_region(RegionSlot::new_large(p, gsz)).is_err() {
            self.page_release(p, psz, 0);
            set_enomem();
            return ptr::null_mut();
        }
        if guard > 0 {
            if self
                .provider
                .protect(p + psz - guard, guard >> PAGE_SHIFT, Access::None)
                .is_err()
            {
                self.die(format_args!("mprotect {:#x}", p));
            }
            self.stats.bytes_guarded += guard;
        }

        if move_to_end(gsz, guard) {
            // Sub-page request: place it flush with the end of the
            // page so an overrun hits the guard immediately.
            if self.junk == 2 {
                unsafe { ptr::write_bytes(p as *mut u8, SOME_JUNK, psz - guard) };
            }
            let user = moved_address(p, gsz, guard);
            if zero_fill && self.junk == 2 {
                unsafe { ptr::write_bytes(user as *mut u8, 0, sz) };
            }
            return user as *mut c_void;
        }

        if self.junk == 2 {
            if zero_fill {
                unsafe { ptr::write_bytes((p + gsz - guard) as *mut u8, SOME_JUNK, psz - gsz) };
            } else {
                unsafe { ptr::write_bytes(p as *mut u8, SOME_JUNK, psz - guard) };
            }
        } else if self.ro.chunk_canaries() {
            junk::fill_canary(self.ro.chunk_canary_byte(), p, gsz - guard, psz - guard);
        }
        p as *mut c_void
    }

    /// Releases `ptr`, whose region lives at `region_index` in this
    /// pool's directory.  `check` enables the recorded-size validation
    /// used by the wiping entry points, with `argsz` the caller's claim.
    pub(crate) fn release(
        &mut self,
        region_index: usize,
        ptr: usize,
        mut clear: bool,
        check: bool,
        mut argsz: usize,
    ) {
        let slot = self.regions.slot(region_index);
        let sz = slot.real_size();
        let guard = self.ro.opts().guard;

        // Concealed allocations are always wiped in full.
        if self.provider.concealed() {
            clear = true;
            if !check {
                argsz = sz;
                if sz > MAX_CHUNK {
                    argsz -= guard;
                }
            }
        }

        if check {
            if sz <= MAX_CHUNK {
                if self.ro.chunk_canaries() && sz > 0 {
                    let meta = match slot.region() {
                        Some(Region::Chunk { meta, .. }) => meta,
                        _ => self.die(format_args!("internal struct corrupt")),
                    };
                    let chunknum = self.chunk_index_checked(meta, ptr, false);
                    let recorded = unsafe { meta.as_ref() }.recorded_size(chunknum);
                    if recorded < argsz {
                        self.die(format_args!("recorded size {} < {}", recorded, argsz));
                    }
                } else if sz < argsz {
                    self.die(format_args!("chunk size {} < {}", sz, argsz));
                }
            } else if sz - guard < argsz {
                self.die(format_args!("recorded size {} < {}", sz - guard, argsz));
            }
        }

        if sz > MAX_CHUNK {
            self.release_large(region_index, ptr, clear, argsz);
        } else {
            self.release_chunk_quarantined(region_index, slot, ptr, clear, argsz, sz);
        }
    }

    fn release_large(&mut self, region_index: usize, ptr: usize, clear: bool, argsz: usize) {
        let slot = self.regions.slot(region_index);
        let sz = slot.real_size();
        let guard = self.ro.opts().guard;
        let base = slot.page();

        if !move_to_end(sz, guard) {
            if base != ptr {
                self.die(format_args!("bogus pointer {:#x}", ptr));
            }
            if self.ro.chunk_canaries() {
                junk::validate_canary(
                    self.ro.chunk_canary_byte(),
                    self.func,
                    ptr,
                    sz - guard,
                    page_round(sz - guard),
                );
            }
        } else if ptr != moved_address(base, sz, guard) {
            self.die(format_args!("bogus moved pointer {:#x}", ptr));
        }

        if guard > 0 {
            if sz < guard {
                self.die(format_args!("guard size"));
            }
            if !self.ro.opts().freeunmap {
                let gaddr = base + page_round(sz) - guard;
                if self
                    .provider
                    .protect(gaddr, guard >> PAGE_SHIFT, Access::ReadWrite)
                    .is_err()
                {
                    self.die(format_args!("mprotect {:#x}", gaddr));
                }
            }
            self.stats.bytes_guarded -= guard;
        }

        self.page_release(base, page_round(sz), if clear { argsz } else { 0 });
        self.delete_region(region_index);
    }

    fn release_chunk_quarantined(
        &mut self,
        _region_index: usize,
        slot: RegionSlot,
        ptr: usize,
        clear: bool,
        argsz: usize,
        sz: usize,
    ) {
        let meta = match slot.region() {
            Some(Region::Chunk { bucket, meta }) => {
                // The key tag and the meta record must agree.
                if unsafe { meta.as_ref() }.bucket != bucket {
                    self.die(format_args!("internal struct corrupt"));
                }
                meta
            }
            _ => self.die(format_args!("internal struct corrupt")),
        };
        self.chunk_index_checked(meta, ptr, self.ro.chunk_canaries());

        if self.ro.opts().freecheck {
            // Extensive mode: the whole quarantine is revalidated on
            // every free.
            for i in 0..QUARANTINE_SLOTS {
                let tmp = self.quarantine[i];
                if tmp == ptr {
                    self.die(format_args!("double free {:#x}", ptr));
                }
                if tmp != 0 {
                    let idx = match self.find_region(tmp) {
                        Some(idx) => idx,
                        None => self.die(format_args!("bogus pointer (double free?) {:#x}", tmp)),
                    };
                    let tsz = self.regions.slot(idx).real_size();
                    junk::validate_junk(self.junk, self.ro.junk_loc(), self.func, tmp, tsz);
                }
            }
        }

        if clear && argsz > 0 {
            explicit_bzero(ptr, argsz);
        }
        junk::junk_free(self.junk, self.ro.junk_loc(), ptr, sz);

        // Swap into the quarantine; whatever falls out is what really
        // gets unlinked.
        let i = self.random_byte() as usize & QUARANTINE_MASK;
        let evicted = std::mem::replace(&mut self.quarantine[i], ptr);
        if evicted == ptr {
            self.die(format_args!("double free {:#x}", ptr));
        }
        if evicted != 0 {
            let idx = match self.find_region(evicted) {
                Some(idx) => idx,
                None => self.die(format_args!("bogus pointer (double free?) {:#x}", evicted)),
            };
            if !self.ro.opts().freecheck {
                let esz = self.regions.slot(idx).real_size();
                junk::validate_junk(self.junk, self.ro.junk_loc(), self.func, evicted, esz);
            }
            self.chunk_free(idx, evicted);
        }
    }

    /// Resize in place when the layout allows it, move otherwise.
    pub(crate) fn reallocate(
        &mut self,
        region_index: usize,
        ptr: usize,
        newsz: usize,
    ) -> *mut c_void {
        let slot = self.regions.slot(region_index);
        let mut oldsz = slot.real_size();
        let guard = self.ro.opts().guard;

        // Chunk bookkeeping needed by the same-bucket case below.
        let chunk_state: Option<(MetaRef, u32)> = match slot.region() {
            Some(Region::Chunk { meta, .. }) if self.ro.chunk_canaries() => {
                Some((meta, self.chunk_index_checked(meta, ptr, false)))
            }
            _ => None,
        };

        let goldsz = oldsz;
        if oldsz > MAX_CHUNK {
            if oldsz < guard {
                self.die(format_args!("guard size"));
            }
            oldsz -= guard;
        }
        let mut gnewsz = newsz;
        if gnewsz > MAX_CHUNK {
            gnewsz += guard;
        }

        let forced = self.ro.opts().always_realloc || self.provider.concealed();

        if newsz > MAX_CHUNK && oldsz > MAX_CHUNK && !forced {
            let base = slot.page();
            let roldsz = page_round(goldsz);
            let rnewsz = page_round(gnewsz);

            if rnewsz < roldsz
                && rnewsz > roldsz / 2
                && roldsz - rnewsz < self.ro.opts().def_maxcache as usize * PAGE_SIZE
                && guard == 0
            {
                // Modest shrink: not worth giving pages back.
                return ptr as *mut c_void;
            }

            if rnewsz > roldsz {
                if guard == 0 {
                    // Cheap grow: extend the mapping in place.
                    let hint = base + roldsz;
                    let needed = rnewsz - roldsz;
                    self.stats.cheap_realloc_tries += 1;
                    if let Ok(q) = self.provider.map_fixed_noreplace(hint, needed >> PAGE_SHIFT) {
                        debug_assert_eq!(q, hint);
                        self.stats.bytes_used += needed;
                        if self.junk == 2 {
                            unsafe { ptr::write_bytes(q as *mut u8, SOME_JUNK, needed) };
                        }
                        self.regions.slot_mut(region_index).set_large_size(gnewsz);
                        let mut p = ptr;
                        if base != ptr {
                            // The old block sat shifted toward the page
                            // end; pull it back to the base.
                            unsafe {
                                ptr::copy(ptr as *const u8, base as *mut u8, oldsz);
                            }
                            p = base;
                        }
                        if self.ro.chunk_canaries() {
                            junk::fill_canary(
                                self.ro.chunk_canary_byte(),
                                p,
                                newsz,
                                page_round(newsz),
                            );
                        }
                        self.stats.cheap_reallocs += 1;
                        return p as *mut c_void;
                    }
                }
            } else if rnewsz < roldsz {
                // Give back the tail pages.
                if guard > 0 {
                    let gaddr = base + rnewsz - guard;
                    if self
                        .provider
                        .protect(gaddr, guard >> PAGE_SHIFT, Access::None)
                        .is_err()
                    {
                        self.die(format_args!("mprotect {:#x}", gaddr));
                    }
                }
                if self
                    .provider
                    .unmap(base + rnewsz, (roldsz - rnewsz) >> PAGE_SHIFT)
                    .is_err()
                {
                    self.die(format_args!("munmap {:#x}", base + rnewsz));
                }
                self.stats.bytes_used -= roldsz - rnewsz;
                self.regions.slot_mut(region_index).set_large_size(gnewsz);
                if move_to_end(gnewsz, guard) {
                    let pp = moved_address(base, gnewsz, guard);
                    unsafe { ptr::copy(ptr as *const u8, pp as *mut u8, newsz) };
                    return pp as *mut c_void;
                }
                if self.ro.chunk_canaries() {
                    junk::fill_canary(self.ro.chunk_canary_byte(), ptr, newsz, page_round(newsz));
                }
                return ptr as *mut c_void;
            } else {
                // Same page count; only the in-page placement may move.
                self.regions.slot_mut(region_index).set_large_size(gnewsz);
                let pp = if move_to_end(gnewsz, guard) {
                    moved_address(base, gnewsz, guard)
                } else {
                    base
                };
                let mut p = ptr;
                if p != pp {
                    unsafe { ptr::copy(p as *const u8, pp as *mut u8, oldsz.min(newsz)) };
                    p = pp;
                }
                if p == base {
                    if newsz > oldsz && self.junk == 2 {
                        unsafe {
                            ptr::write_bytes(
                                (base + newsz) as *mut u8,
                                SOME_JUNK,
                                rnewsz - guard - newsz,
                            )
                        };
                    }
                    if self.ro.chunk_canaries() {
                        junk::fill_canary(self.ro.chunk_canary_byte(), p, newsz, page_round(newsz));
                    }
                }
                return p as *mut c_void;
            }
        }

        let round = self.ro.opts().round_buckets();
        if oldsz <= MAX_CHUNK
            && oldsz > 0
            && newsz <= MAX_CHUNK
            && newsz > 0
            && !forced
            && size_bucket(newsz, round) == size_bucket(oldsz, round)
        {
            // The new size fits the chunk already backing the pointer.
            if self.junk == 2 {
                unsafe { ptr::write_bytes((ptr + newsz) as *mut u8, SOME_JUNK, oldsz - newsz) };
            }
            if self.ro.chunk_canaries() {
                let (meta, chunknum) = match chunk_state {
                    Some(state) => state,
                    None => self.die(format_args!("internal struct corrupt")),
                };
                unsafe { (*meta.as_ptr()).record_size(chunknum, newsz) };
                let allocated = bucket_size(unsafe { meta.as_ref() }.bucket);
                junk::fill_canary(self.ro.chunk_canary_byte(), ptr, newsz, allocated);
            }
            return ptr as *mut c_void;
        }

        if newsz != oldsz || forced {
            let q = self.allocate(newsz, false);
            if q.is_null() {
                return q;
            }
            if newsz != 0 && oldsz != 0 {
                unsafe {
                    ptr::copy_nonoverlapping(ptr as *const u8, q as *mut u8, oldsz.min(newsz))
                };
            }
            // The directory may have moved underneath the allocation;
            // locate the old region afresh.
            let idx = match self.find_region(ptr) {
                Some(idx) => idx,
                None => self.die(format_args!("bogus pointer (double free?) {:#x}", ptr)),
            };
            self.release(idx, ptr, false, false, 0);
            return q;
        }

        // Only zero-size requests over zero-size regions end up here.
        if newsz != 0 {
            self.die(format_args!("realloc internal inconsistency"));
        }
        ptr as *mut c_void
    }

    /// Zeroing array resize with strict size validation.
    pub(crate) fn recalloc(
        &mut self,
        region_index: usize,
        ptr: usize,
        oldsize: usize,
        newsize: usize,
    ) -> *mut c_void {
        let slot = self.regions.slot(region_index);
        let sz = slot.real_size();
        let guard = self.ro.opts().guard;

        if sz <= MAX_CHUNK {
            if self.ro.chunk_canaries() && sz > 0 {
                let meta = match slot.region() {
                    Some(Region::Chunk { meta, .. }) => meta,
                    _ => self.die(format_args!("internal struct corrupt")),
                };
                let chunknum = self.chunk_index_checked(meta, ptr, false);
                let recorded = unsafe { meta.as_ref() }.recorded_size(chunknum);
                if recorded != oldsize {
                    self.die(format_args!("recorded size {} != {}", recorded, oldsize));
                }
            } else if sz < oldsize {
                self.die(format_args!("chunk size {} < {}", sz, oldsize));
            }
        } else {
            if sz - guard < oldsize {
                self.die(format_args!("recorded size {} < {}", sz - guard, oldsize));
            }
            if oldsize < (sz - guard) / 2 {
                self.die(format_args!(
                    "recorded size {} inconsistent with {}",
                    sz - guard,
                    oldsize
                ));
            }
        }

        if newsize <= oldsize {
            let d = oldsize - newsize;
            // Modest shrinks stay in place with a zeroed tail.
            if d < oldsize / 2 && d < PAGE_SIZE {
                if d > 0 {
                    explicit_bzero(ptr + newsize, d);
                }
                return ptr as *mut c_void;
            }
        }

        let newptr = self.allocate(newsize, false);
        if newptr.is_null() {
            return newptr;
        }

        if newsize > oldsize {
            unsafe {
                ptr::copy_nonoverlapping(ptr as *const u8, newptr as *mut u8, oldsize);
                ptr::write_bytes((newptr as usize + oldsize) as *mut u8, 0, newsize - oldsize);
            }
        } else {
            unsafe { ptr::copy_nonoverlapping(ptr as *const u8, newptr as *mut u8, newsize) };
        }

        let idx = match self.find_region(ptr) {
            Some(idx) => idx,
            None => self.die(format_args!("bogus pointer (double free?) {:#x}", ptr)),
        };
        self.release(idx, ptr, true, false, oldsize);
        newptr
    }

    /// Aligned allocation.  Alignments within a page ride on the power
    /// of two size classes; larger ones get a dedicated trimmed mapping.
    pub(crate) fn allocate_aligned(
        &mut self,
        alignment: usize,
        mut sz: usize,
        zero_fill: bool,
    ) -> *mut c_void {
        // Between half a page and a page the large path would shift the
        // block toward the page end and break the alignment.
        if sz > MAX_CHUNK && sz < PAGE_SIZE {
            sz = PAGE_SIZE;
        }

        if alignment <= PAGE_SIZE {
            // max(size, alignment) rounded up to a power of two is
            // naturally aligned: chunks sit at multiples of their own
            // size and large regions start on a page.
            let want = sz.max(alignment);
            let pof2 = if want < PAGE_SIZE {
                let mut pof2 = MIN_SIZE;
                while pof2 < want {
                    pof2 <<= 1;
                }
                pof2
            } else {
                want
            };
            return self.allocate(pof2, zero_fill);
        }

        let guard = self.ro.opts().guard;
        if sz >= usize::MAX - guard - PAGE_SIZE {
            set_enomem();
            return ptr::null_mut();
        }
        if sz < PAGE_SIZE {
            sz = PAGE_SIZE;
        }
        let gsz = sz + guard;
        let psz = page_round(gsz);

        let p = match self.map_aligned(alignment, psz, zero_fill) {
            Some(p) => p,
            None => {
                set_enomem();
                return ptr::null_mut();
            }
        };
        if self.insert_region(RegionSlot::new_large(p, gsz)).is_err() {
            self.page_release(p, psz, 0);
            set_enomem();
            return ptr::null_mut();
        }
        if guard > 0 {
            if self
                .provider
                .protect(p + psz - guard, guard >> PAGE_SHIFT, Access::None)
                .is_err()
            {
                self.die(format_args!("mprotect {:#x}", p));
            }
            self.stats.bytes_guarded += guard;
        }

        if self.junk == 2 {
            if zero_fill {
                unsafe { ptr::write_bytes((p + gsz - guard) as *mut u8, SOME_JUNK, psz - gsz) };
            } else {
                unsafe { ptr::write_bytes(p as *mut u8, SOME_JUNK, psz - guard) };
            }
        } else if self.ro.chunk_canaries() {
            junk::fill_canary(self.ro.chunk_canary_byte(), p, gsz - guard, psz - guard);
        }
        p as *mut c_void
    }

    /// Over-allocates by `alignment` and trims the misaligned head and
    /// the slack tail.
    fn map_aligned(&mut self, alignment: usize, sz: usize, zero_fill: bool) -> Option<usize> {
        if alignment < PAGE_SIZE || !alignment.is_power_of_two() {
            self.die(format_args!("mapalign bad alignment"));
        }
        if sz != page_round(sz) {
            self.die(format_args!("mapalign round"));
        }
        if alignment > usize::MAX - sz {
            return None;
        }

        let p = self.page_acquire(sz + alignment, zero_fill)?;
        let q = (p + alignment - 1) & !(alignment - 1);
        if q != p && self.provider.unmap(p, (q - p) >> PAGE_SHIFT).is_err() {
            self.die(format_args!("munmap {:#x}", p));
        }
        if self
            .provider
            .unmap(q + sz, (alignment - (q - p)) >> PAGE_SHIFT)
            .is_err()
        {
            self.die(format_args!("munmap {:#x}", q + sz));
        }
        self.stats.bytes_used -= alignment;
        Some(q)
    }

    // ---- introspection --------------------------------------------

    #[cfg(feature = "stats")]
    pub(crate) fn stats(&self) -> &Stats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut Stats {
        &mut self.stats
    }

    #[cfg(feature = "stats")]
    pub(crate) fn regions_len(&self) -> usize {
        self.regions.len()
    }

    #[cfg(feature = "stats")]
    pub(crate) fn regions_capacity(&self) -> usize {
        self.regions.capacity()
    }

    #[cfg(feature = "stats")]
    pub(crate) fn for_each_region(&self, f: impl FnMut(&RegionSlot)) {
        self.regions.for_each(f);
    }

    /// Pushes every quarantined pointer through the real free path.
    /// Used before leak accounting so quarantined chunks do not read as
    /// outstanding.
    #[cfg(feature = "stats")]
    pub(crate) fn drain_quarantine(&mut self) {
        for i in 0..QUARANTINE_SLOTS {
            let p = std::mem::replace(&mut self.quarantine[i], 0);
            if p != 0 {
                let idx = match self.find_region(p) {
                    Some(idx) => idx,
                    None => self.die(format_args!("bogus pointer (double free?) {:#x}", p)),
                };
                self.chunk_free(idx, p);
            }
        }
    }
}

/// Whether a region of gross size `gsz` is placed flush with the page
/// end rather than at the page base.
#[inline]
fn move_to_end(gsz: usize, guard: usize) -> bool {
    gsz - guard < PAGE_SIZE
}

/// The shifted user address for such a region.
#[inline]
fn moved_address(base: usize, gsz: usize, guard: usize) -> usize {
    base + ((PAGE_SIZE - (gsz - guard)) & !(MIN_SIZE - 1))
}

fn set_enomem() {
    errno::set_errno(errno::Errno(libc::ENOMEM));
}

// A pool is only ever touched under its shard lock.
unsafe impl Send for Pool {}
