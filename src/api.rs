//! The public allocation surface.
//!
//! Every entry point follows the same shape: save errno, resolve a
//! shard, run the pool operation under the shard lock with the
//! recursion trap armed, then restore errno on success and honor the
//! abort-on-exhaustion option on failure.  The free functions operate
//! on the lazily created process-global heap; the inherent methods let
//! callers (and the tests) drive private `Heap` instances.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Once;

use errno::{errno, set_errno, Errno};

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_live;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::chunk::MIN_SIZE;

use crate::diag;
use crate::heap::Heap;
use crate::map::PAGE_SIZE;

/// sqrt(SIZE_MAX + 1): if both factors are below this, their product
/// cannot overflow, and the division check is skipped.
const MUL_NO_OVERFLOW: usize = 1 << (mem::size_of::<usize>() * 4);

#[inline]
fn mul_overflows(a: usize, b: usize) -> bool {
    (a >= MUL_NO_OVERFLOW || b >= MUL_NO_OVERFLOW) && a > 0 && usize::MAX / a < b
}

lazy_static::lazy_static! {
    static ref BOOT_OPTIONS: std::sync::Mutex<Option<String>> = Default::default();
}

static GLOBAL: AtomicPtr<Heap> = AtomicPtr::new(ptr::null_mut());
static GLOBAL_INIT: Once = Once::new();

/// Supplies the programmatic option string, the equivalent of linking
/// in a compile-time configuration.  Only has an effect before the
/// first use of the global heap.
pub fn set_boot_options(opts: &str) {
    *BOOT_OPTIONS.lock().unwrap() = Some(opts.to_owned());
}

fn global() -> &'static Heap {
    GLOBAL_INIT.call_once(|| {
        let boot = BOOT_OPTIONS.lock().unwrap();
        let heap: &'static Heap = Box::leak(Box::new(Heap::from_boot_sources(boot.as_deref())));
        GLOBAL.store(heap as *const Heap as *mut Heap, Ordering::Release);

        #[cfg(feature = "stats")]
        {
            if heap.ro().opts().stats_dump {
                unsafe { libc::atexit(dump_at_exit) };
            }
        }
    });
    unsafe { &*GLOBAL.load(Ordering::Acquire) }
}

fn global_existing() -> Option<&'static Heap> {
    let p = GLOBAL.load(Ordering::Acquire);
    if p.is_null() {
        None
    } else {
        Some(unsafe { &*p })
    }
}

#[cfg(feature = "stats")]
extern "C" fn dump_at_exit() {
    if let Some(heap) = global_existing() {
        heap.dump();
    }
}

impl Heap {
    fn finish(&self, op: &'static str, r: *mut c_void, saved: Errno) -> *mut c_void {
        if r.is_null() {
            if self.ro().opts().xmalloc {
                diag::fatal(op, format_args!("out of memory"));
            }
        } else {
            set_errno(saved);
        }
        r
    }

    #[ensures(ret.is_null() || ret as usize % MIN_SIZE == 0)]
    #[ensures(ret.is_null() || debug_live::note_alloc(ret as usize, size))]
    pub fn malloc(&self, size: usize) -> *mut c_void {
        let saved = errno();
        let index = self.shard_index_for_thread();
        match self.with_pool(index, "malloc", |pool| pool.allocate(size, false)) {
            Some(r) => self.finish("malloc", r, saved),
            None => ptr::null_mut(),
        }
    }

    /// Like `malloc`, from the concealed pool: mappings are excluded
    /// from dumps, junk runs at full level, caches are off.
    #[ensures(ret.is_null() || debug_live::note_alloc(ret as usize, size))]
    pub fn malloc_conceal(&self, size: usize) -> *mut c_void {
        let saved = errno();
        match self.with_pool(0, "malloc_conceal", |pool| pool.allocate(size, false)) {
            Some(r) => self.finish("malloc_conceal", r, saved),
            None => ptr::null_mut(),
        }
    }

    #[ensures(ret.is_null() || debug_live::note_alloc(ret as usize, nmemb * size))]
    pub fn calloc(&self, nmemb: usize, size: usize) -> *mut c_void {
        let saved = errno();
        if mul_overflows(nmemb, size) {
            if self.ro().opts().xmalloc {
                diag::fatal("calloc", format_args!("out of memory"));
            }
            set_errno(Errno(libc::ENOMEM));
            return ptr::null_mut();
        }
        let total = nmemb * size;
        let index = self.shard_index_for_thread();
        match self.with_pool(index, "calloc", |pool| pool.allocate(total, true)) {
            Some(r) => self.finish("calloc", r, saved),
            None => ptr::null_mut(),
        }
    }

    #[ensures(ret.is_null() || debug_live::note_alloc(ret as usize, nmemb * size))]
    pub fn calloc_conceal(&self, nmemb: usize, size: usize) -> *mut c_void {
        let saved = errno();
        if mul_overflows(nmemb, size) {
            if self.ro().opts().xmalloc {
                diag::fatal("calloc_conceal", format_args!("out of memory"));
            }
            set_errno(Errno(libc::ENOMEM));
            return ptr::null_mut();
        }
        let total = nmemb * size;
        match self.with_pool(0, "calloc_conceal", |pool| pool.allocate(total, true)) {
            Some(r) => self.finish("calloc_conceal", r, saved),
            None => ptr::null_mut(),
        }
    }

    /// Releases `ptr`.  NULL is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be NULL or a live pointer previously returned by this
    /// heap.
    #[requires(ptr.is_null() || debug_live::note_free(ptr as usize))]
    pub unsafe fn free(&self, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        let saved = errno();
        let start = self.shard_index_for_thread();
        let done = self.with_owner(start, "free", ptr as usize, |pool, region_index| {
            pool.release(region_index, ptr as usize, false, false, 0)
        });
        if done.is_some() {
            set_errno(saved);
        }
    }

    /// Wipes `size` bytes behind `ptr` before releasing it, for data
    /// that must not linger.  The size claim is validated against the
    /// allocation's bookkeeping.
    ///
    /// # Safety
    ///
    /// As for [`Heap::free`]; additionally `size` must not exceed the
    /// allocated size.
    #[requires(ptr.is_null() || debug_live::note_free(ptr as usize))]
    pub unsafe fn freezero(&self, ptr: *mut c_void, size: usize) {
        if ptr.is_null() {
            return;
        }
        let saved = errno();
        let start = self.shard_index_for_thread();
        let done = self.with_owner(start, "freezero", ptr as usize, |pool, region_index| {
            pool.release(region_index, ptr as usize, true, true, size)
        });
        if done.is_some() {
            set_errno(saved);
        }
    }

    /// # Safety
    ///
    /// `ptr` must be NULL or a live pointer previously returned by this
    /// heap.
    #[ensures(ret.is_null() || debug_live::note_realloc(ptr as usize, ret as usize, size))]
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        let saved = errno();
        let start = self.shard_index_for_thread();

        if ptr.is_null() {
            return match self.with_pool(start, "realloc", |pool| pool.allocate(size, false)) {
                Some(r) => self.finish("realloc", r, saved),
                None => ptr::null_mut(),
            };
        }

        // Oversize requests are rejected before any size rounding can
        // wrap.
        if size >= usize::MAX - self.ro().opts().guard - PAGE_SIZE {
            set_errno(Errno(libc::ENOMEM));
            return self.finish("realloc", ptr::null_mut(), saved);
        }

        match self.with_owner(start, "realloc", ptr as usize, |pool, region_index| {
            pool.reallocate(region_index, ptr as usize, size)
        }) {
            Some(r) => self.finish("realloc", r, saved),
            None => ptr::null_mut(),
        }
    }

    /// Zeroing array resize: grown space reads as zero and the old
    /// buffer is wiped before release.  The old element count must
    /// match what the allocation was last known as.
    ///
    /// # Safety
    ///
    /// As for [`Heap::realloc`]; `oldnmemb` must be accurate.
    #[ensures(ret.is_null() || debug_live::note_realloc(ptr as usize, ret as usize, newnmemb * size))]
    pub unsafe fn recallocarray(
        &self,
        ptr: *mut c_void,
        oldnmemb: usize,
        newnmemb: usize,
        size: usize,
    ) -> *mut c_void {
        let saved = errno();
        let start = self.shard_index_for_thread();

        if mul_overflows(newnmemb, size) {
            if self.ro().opts().xmalloc {
                diag::fatal("recallocarray", format_args!("out of memory"));
            }
            set_errno(Errno(libc::ENOMEM));
            return ptr::null_mut();
        }
        let newsize = newnmemb * size;

        if ptr.is_null() {
            return match self.with_pool(start, "recallocarray", |pool| {
                pool.allocate(newsize, true)
            }) {
                Some(r) => self.finish("recallocarray", r, saved),
                None => ptr::null_mut(),
            };
        }

        if mul_overflows(oldnmemb, size) {
            set_errno(Errno(libc::EINVAL));
            return ptr::null_mut();
        }
        let oldsize = oldnmemb * size;

        if oldsize == newsize {
            set_errno(saved);
            return ptr;
        }

        match self.with_owner(start, "recallocarray", ptr as usize, |pool, region_index| {
            pool.recalloc(region_index, ptr as usize, oldsize, newsize)
        }) {
            Some(r) => self.finish("recallocarray", r, saved),
            None => ptr::null_mut(),
        }
    }

    /// `alignment` must be a power of two; `size` must be a multiple of
    /// `alignment`.
    #[ensures(ret.is_null() || ret as usize % alignment == 0)]
    #[ensures(ret.is_null() || debug_live::note_alloc(ret as usize, size))]
    pub fn aligned_alloc(&self, alignment: usize, size: usize) -> *mut c_void {
        let saved = errno();
        if alignment == 0 || !alignment.is_power_of_two() {
            set_errno(Errno(libc::EINVAL));
            return ptr::null_mut();
        }
        if size & (alignment - 1) != 0 {
            set_errno(Errno(libc::EINVAL));
            return ptr::null_mut();
        }
        let index = self.shard_index_for_thread();
        match self.with_pool(index, "aligned_alloc", |pool| {
            pool.allocate_aligned(alignment, size, false)
        }) {
            Some(r) => self.finish("aligned_alloc", r, saved),
            None => ptr::null_mut(),
        }
    }

    /// POSIX-shaped aligned allocation: the result goes through
    /// `memptr` and the return value is an error number.
    ///
    /// # Safety
    ///
    /// `memptr` must be valid for writes.
    pub unsafe fn posix_memalign(
        &self,
        memptr: *mut *mut c_void,
        alignment: usize,
        size: usize,
    ) -> i32 {
        if !alignment.is_power_of_two() || alignment < mem::size_of::<*mut c_void>() {
            return libc::EINVAL;
        }
        let saved = errno();
        let index = self.shard_index_for_thread();
        let r = match self.with_pool(index, "posix_memalign", |pool| {
            pool.allocate_aligned(alignment, size, false)
        }) {
            Some(r) => r,
            None => {
                let res = errno().0;
                set_errno(saved);
                return res;
            }
        };
        if r.is_null() {
            if self.ro().opts().xmalloc {
                diag::fatal("posix_memalign", format_args!("out of memory"));
            }
            let res = errno().0;
            set_errno(saved);
            return res;
        }
        set_errno(saved);
        *memptr = r;
        0
    }
}

// ---- process-global entry points ----------------------------------

pub fn malloc(size: usize) -> *mut c_void {
    global().malloc(size)
}

pub fn malloc_conceal(size: usize) -> *mut c_void {
    global().malloc_conceal(size)
}

pub fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    global().calloc(nmemb, size)
}

pub fn calloc_conceal(nmemb: usize, size: usize) -> *mut c_void {
    global().calloc_conceal(nmemb, size)
}

/// # Safety
///
/// `ptr` must be NULL or a live pointer from this allocator.
pub unsafe fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    match global_existing() {
        Some(heap) => heap.free(ptr),
        None => diag::fatal("free", format_args!("free() called before allocation")),
    }
}

/// # Safety
///
/// As for [`free`]; `size` must not exceed the allocated size.
pub unsafe fn freezero(ptr: *mut c_void, size: usize) {
    if ptr.is_null() {
        return;
    }
    match global_existing() {
        Some(heap) => heap.freezero(ptr, size),
        None => diag::fatal("freezero", format_args!("freezero() called before allocation")),
    }
}

/// # Safety
///
/// `ptr` must be NULL or a live pointer from this allocator.
pub unsafe fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    global().realloc(ptr, size)
}

/// # Safety
///
/// As for [`realloc`]; `oldnmemb` must be accurate.
pub unsafe fn recallocarray(
    ptr: *mut c_void,
    oldnmemb: usize,
    newnmemb: usize,
    size: usize,
) -> *mut c_void {
    global().recallocarray(ptr, oldnmemb, newnmemb, size)
}

pub fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    global().aligned_alloc(alignment, size)
}

/// # Safety
///
/// `memptr` must be valid for writes.
pub unsafe fn posix_memalign(memptr: *mut *mut c_void, alignment: usize, size: usize) -> i32 {
    // Validated before the heap exists so a bad call never triggers
    // initialization.
    if !alignment.is_power_of_two() || alignment < mem::size_of::<*mut c_void>() {
        return libc::EINVAL;
    }
    global().posix_memalign(memptr, alignment, size)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk::MIN_SIZE;
    use crate::map::PAGE_MASK;
    use proptest::collection::vec;
    use proptest::prelude::*;
    use std::collections::HashSet;

    lazy_static::lazy_static! {
        // One shared default-configured heap for the randomized tests,
        // so each proptest case does not map a fresh pool set.
        static ref SHARED: Heap = Heap::new("");
    }

    fn page_of(p: *mut c_void) -> usize {
        p as usize & !PAGE_MASK
    }

    #[test]
    fn smoke_test() {
        let heap = Heap::new("");
        for &size in &[1usize, 16, 17, 100, 2048, 2049, 4096, 100_000] {
            let p = heap.malloc(size);
            assert!(!p.is_null(), "malloc({}) failed", size);
            unsafe {
                std::ptr::write_bytes(p as *mut u8, 0x5a, size);
                assert_eq!(std::ptr::read(p as *const u8), 0x5a);
                assert_eq!(std::ptr::read((p as usize + size - 1) as *const u8), 0x5a);
                heap.free(p);
            }
        }
    }

    #[test]
    fn returned_pointers_are_min_aligned() {
        let heap = Heap::new("");
        let mut ptrs = Vec::new();
        for size in 1..200usize {
            let p = heap.malloc(size);
            assert!(!p.is_null());
            assert_eq!(p as usize % MIN_SIZE, 0, "size {}", size);
            ptrs.push(p);
        }
        for p in ptrs {
            unsafe { heap.free(p) };
        }
    }

    #[test]
    fn zero_size_allocations_are_distinct_and_freeable() {
        let heap = Heap::new("");
        let p = heap.malloc(0);
        let q = heap.malloc(0);
        assert!(!p.is_null() && !q.is_null());
        assert_ne!(p, q);
        assert_eq!(p as usize % MIN_SIZE, 0);
        unsafe {
            heap.free(p);
            heap.free(q);
        }
    }

    #[test]
    fn oversize_requests_fail_with_enomem() {
        let heap = Heap::new("");
        set_errno(Errno(0));
        assert!(heap.malloc(usize::MAX).is_null());
        assert_eq!(errno().0, libc::ENOMEM);

        set_errno(Errno(0));
        assert!(heap.malloc(usize::MAX - 2 * PAGE_SIZE).is_null());
        assert_eq!(errno().0, libc::ENOMEM);
    }

    #[test]
    fn errno_is_preserved_on_success() {
        let heap = Heap::new("");
        set_errno(Errno(libc::EBADF));
        let p = heap.malloc(64);
        assert!(!p.is_null());
        assert_eq!(errno().0, libc::EBADF);
        unsafe { heap.free(p) };
        assert_eq!(errno().0, libc::EBADF);
    }

    #[test]
    fn calloc_zero_fills_and_rejects_overflow() {
        let heap = Heap::new("");
        let p = heap.calloc(10, 10);
        assert!(!p.is_null());
        for i in 0..100 {
            assert_eq!(unsafe { std::ptr::read((p as usize + i) as *const u8) }, 0);
        }
        unsafe { heap.free(p) };

        set_errno(Errno(0));
        assert!(heap.calloc(usize::MAX / 2, 3).is_null());
        assert_eq!(errno().0, libc::ENOMEM);

        // Degenerate counts behave like malloc(0).
        let z = heap.calloc(0, 123);
        assert!(!z.is_null());
        unsafe { heap.free(z) };
    }

    #[test]
    fn calloc_zero_fills_reused_chunks() {
        let heap = Heap::new("");
        // Dirty a chunk, free it, then force calloc to reuse the size
        // class; the result must read as zero regardless of history.
        for _ in 0..50 {
            let p = heap.malloc(64);
            unsafe {
                std::ptr::write_bytes(p as *mut u8, 0xff, 64);
                heap.free(p);
            }
            let q = heap.calloc(8, 8);
            for i in 0..64 {
                assert_eq!(unsafe { std::ptr::read((q as usize + i) as *const u8) }, 0);
            }
            unsafe { heap.free(q) };
        }
    }

    #[test]
    fn chunk_pages_are_shared_within_a_bucket() {
        let heap = Heap::new("--cfgjs");

        // 17 byte requests share the 32 byte bucket, 128 chunks to a
        // page.  With four chunk lists, 513 allocations fit in at most
        // ceil(r_i / 128) pages per list, 8 in total.
        const COUNT: usize = 513;
        let first: Vec<*mut c_void> = (0..COUNT).map(|_| heap.malloc(17)).collect();
        assert!(first.iter().all(|p| !p.is_null()));
        let pages: HashSet<usize> = first.iter().map(|&p| page_of(p)).collect();
        assert!(pages.len() >= COUNT / 128);
        assert!(pages.len() <= 8, "{} pages for {} chunks", pages.len(), COUNT);

        // Every chunk sits at a multiple of its bucket's 32 byte unit.
        assert!(first.iter().all(|&p| p as usize % 32 == 0));

        for &p in &first {
            unsafe { heap.free(p) };
        }

        // A second round stays within the same bound: freed pages are
        // recycled through the lists and the page cache rather than
        // accumulating.
        let second: Vec<*mut c_void> = (0..COUNT).map(|_| heap.malloc(17)).collect();
        let reused: HashSet<usize> = second.iter().map(|&p| page_of(p)).collect();
        assert!(reused.len() <= 9);

        for &p in &second {
            unsafe { heap.free(p) };
        }
    }

    #[test]
    fn freed_large_runs_are_recycled_from_the_cache() {
        let heap = Heap::new("--cfgjs");

        // Large frees bypass the quarantine, so a matching request
        // gets the exact run back from the small page cache.
        let p = heap.malloc(25 * PAGE_SIZE);
        assert!(!p.is_null());
        unsafe { heap.free(p) };
        let q = heap.malloc(25 * PAGE_SIZE);
        assert_eq!(q, p);
        unsafe { heap.free(q) };
    }

    #[test]
    fn realloc_null_and_same_size() {
        let heap = Heap::new("");
        let p = unsafe { heap.realloc(ptr::null_mut(), 40) };
        assert!(!p.is_null());
        unsafe { std::ptr::write_bytes(p as *mut u8, 7, 40) };

        // Same size stays put.
        let q = unsafe { heap.realloc(p, 40) };
        assert_eq!(q, p);
        // Same bucket stays put too.
        let q = unsafe { heap.realloc(p, 33) };
        assert_eq!(q, p);

        unsafe { heap.free(q) };
    }

    #[test]
    fn realloc_preserves_contents_across_buckets() {
        let heap = Heap::new("");
        let p = heap.malloc(40);
        for i in 0..40usize {
            unsafe { std::ptr::write((p as usize + i) as *mut u8, i as u8) };
        }
        let q = unsafe { heap.realloc(p, 3000) };
        assert!(!q.is_null());
        for i in 0..40usize {
            assert_eq!(
                unsafe { std::ptr::read((q as usize + i) as *const u8) },
                i as u8
            );
        }
        let r = unsafe { heap.realloc(q, 24) };
        assert!(!r.is_null());
        for i in 0..24usize {
            assert_eq!(
                unsafe { std::ptr::read((r as usize + i) as *const u8) },
                i as u8
            );
        }
        unsafe { heap.free(r) };
    }

    #[test]
    fn realloc_zero_size_yields_a_fresh_zero_chunk() {
        let heap = Heap::new("");
        let p = heap.malloc(200);
        let q = unsafe { heap.realloc(p, 0) };
        assert!(!q.is_null());
        unsafe { heap.free(q) };
    }

    #[test]
    fn realloc_large_grow_and_shrink_preserves_prefix() {
        let heap = Heap::new("");
        let p = heap.malloc(3 * PAGE_SIZE);
        assert!(!p.is_null());
        for i in 0..3 * PAGE_SIZE {
            unsafe { std::ptr::write((p as usize + i) as *mut u8, (i % 251) as u8) };
        }

        let q = unsafe { heap.realloc(p, 5 * PAGE_SIZE) };
        assert!(!q.is_null());
        for i in 0..3 * PAGE_SIZE {
            assert_eq!(
                unsafe { std::ptr::read((q as usize + i) as *const u8) },
                (i % 251) as u8,
                "byte {} after grow",
                i
            );
        }

        let r = unsafe { heap.realloc(q, 2 * PAGE_SIZE) };
        assert!(!r.is_null());
        for i in 0..2 * PAGE_SIZE {
            assert_eq!(
                unsafe { std::ptr::read((r as usize + i) as *const u8) },
                (i % 251) as u8,
                "byte {} after shrink",
                i
            );
        }
        unsafe { heap.free(r) };
    }

    #[test]
    fn forced_realloc_always_moves() {
        let heap = Heap::new("R");
        let p = heap.malloc(64);
        let q = unsafe { heap.realloc(p, 64) };
        assert!(!q.is_null());
        assert_ne!(q, p, "option R forbids in-place reuse");
        unsafe { heap.free(q) };
    }

    #[test]
    fn recallocarray_no_op_grow_and_small_shrink() {
        let heap = Heap::new("");
        let p = heap.calloc(4, 8);
        for i in 0..32usize {
            unsafe { std::ptr::write((p as usize + i) as *mut u8, 0xaa) };
        }

        // Identical geometry is a no-op.
        let q = unsafe { heap.recallocarray(p, 4, 4, 8) };
        assert_eq!(q, p);

        // Growth copies and zero-fills the tail.
        let q = unsafe { heap.recallocarray(p, 4, 8, 8) };
        assert!(!q.is_null());
        for i in 0..32usize {
            assert_eq!(unsafe { std::ptr::read((q as usize + i) as *const u8) }, 0xaa);
        }
        for i in 32..64usize {
            assert_eq!(unsafe { std::ptr::read((q as usize + i) as *const u8) }, 0);
        }

        // A modest shrink stays in place and zeroes the dropped tail.
        let r = unsafe { heap.recallocarray(q, 8, 6, 8) };
        assert_eq!(r, q);
        for i in 48..64usize {
            assert_eq!(unsafe { std::ptr::read((r as usize + i) as *const u8) }, 0);
        }

        // Overflowing old geometry is EINVAL.
        set_errno(Errno(0));
        assert!(unsafe { heap.recallocarray(r, usize::MAX / 4, 2, 8) }.is_null());
        assert_eq!(errno().0, libc::EINVAL);

        unsafe { heap.free(r) };
    }

    #[test]
    fn freezero_roundtrip() {
        let heap = Heap::new("");
        let p = heap.malloc(128);
        unsafe {
            std::ptr::write_bytes(p as *mut u8, 0x55, 128);
            // Claiming less than the allocation is allowed.
            heap.freezero(p, 100);
        }
        let q = heap.malloc(5 * PAGE_SIZE);
        unsafe {
            std::ptr::write_bytes(q as *mut u8, 0x55, 5 * PAGE_SIZE);
            heap.freezero(q, 5 * PAGE_SIZE);
        }
    }

    #[test]
    fn aligned_alloc_validates_and_aligns() {
        let heap = Heap::new("");

        set_errno(Errno(0));
        assert!(heap.aligned_alloc(3, 9).is_null());
        assert_eq!(errno().0, libc::EINVAL);

        set_errno(Errno(0));
        assert!(heap.aligned_alloc(32, 33).is_null());
        assert_eq!(errno().0, libc::EINVAL);

        for &(align, size) in &[
            (16usize, 64usize),
            (64, 64),
            (256, 512),
            (4096, 4096),
            (8192, 8192),
            (16384, 32768),
        ] {
            let p = heap.aligned_alloc(align, size);
            assert!(!p.is_null(), "aligned_alloc({}, {})", align, size);
            assert_eq!(p as usize % align, 0);
            unsafe {
                std::ptr::write_bytes(p as *mut u8, 1, size);
                heap.free(p);
            }
        }
    }

    #[test]
    fn posix_memalign_validates_and_aligns() {
        let heap = Heap::new("");
        let mut out: *mut c_void = ptr::null_mut();

        assert_eq!(unsafe { heap.posix_memalign(&mut out, 3, 64) }, libc::EINVAL);
        assert_eq!(
            unsafe { heap.posix_memalign(&mut out, mem::size_of::<*mut c_void>() / 2, 64) },
            libc::EINVAL
        );

        assert_eq!(unsafe { heap.posix_memalign(&mut out, 64, 100) }, 0);
        assert!(!out.is_null());
        assert_eq!(out as usize % 64, 0);
        unsafe { heap.free(out) };
    }

    #[test]
    fn guard_pages_move_sub_page_blocks_to_the_end() {
        let heap = Heap::new("G");

        // A sub-page large request lands flush against the guard.
        let p = heap.malloc(3000);
        assert!(!p.is_null());
        assert_eq!(
            p as usize & PAGE_MASK,
            (PAGE_SIZE - 3000) & !(MIN_SIZE - 1)
        );
        unsafe {
            std::ptr::write_bytes(p as *mut u8, 9, 3000);
            heap.free(p);
        }

        // Page-multiple requests keep the page base.
        let q = heap.malloc(2 * PAGE_SIZE);
        assert_eq!(q as usize & PAGE_MASK, 0);
        unsafe {
            std::ptr::write_bytes(q as *mut u8, 9, 2 * PAGE_SIZE);
            heap.free(q);
        }

        // The tail of the accessible range is really the last byte
        // before the guard.
        let r = heap.malloc(PAGE_SIZE - 8);
        assert_eq!(r as usize & PAGE_MASK, 0);
        unsafe {
            std::ptr::write((r as usize + PAGE_SIZE - 9) as *mut u8, 1);
            heap.free(r);
        }
    }

    #[test]
    fn full_junk_marks_freed_chunks() {
        let heap = Heap::new("J");
        let p = heap.malloc(256);
        unsafe {
            std::ptr::write_bytes(p as *mut u8, 0x11, 256);
            heap.free(p);
        }
        // The chunk page is still mapped; the freed chunk now carries
        // the free-junk pattern.
        for i in 0..256usize {
            assert_eq!(
                unsafe { std::ptr::read((p as usize + i) as *const u8) },
                0xdf,
                "byte {}",
                i
            );
        }
    }

    #[test]
    fn chunk_canaries_sit_after_the_request() {
        let heap = Heap::new("C");
        let p = heap.malloc(20);
        assert!(!p.is_null());
        // 20 rounds to the 32 byte bucket; the slack carries the
        // canary byte.
        let first = unsafe { std::ptr::read((p as usize + 20) as *const u8) };
        for i in 20..32usize {
            assert_eq!(
                unsafe { std::ptr::read((p as usize + i) as *const u8) },
                first
            );
        }
        unsafe { heap.free(p) };
    }

    #[test]
    fn conceal_pool_serves_and_frees() {
        let heap = Heap::new("");
        let p = heap.malloc_conceal(300);
        assert!(!p.is_null());
        unsafe { std::ptr::write_bytes(p as *mut u8, 3, 300) };

        let q = heap.calloc_conceal(30, 10);
        assert!(!q.is_null());
        for i in 0..300 {
            assert_eq!(unsafe { std::ptr::read((q as usize + i) as *const u8) }, 0);
        }

        // The regular free path locates the concealed pool.
        unsafe {
            heap.free(p);
            heap.free(q);
        }
    }

    #[test]
    fn cross_pool_frees_from_swapped_threads() {
        let heap: &'static Heap = Box::leak(Box::new(Heap::new("")));
        let (tx_a, rx_a) = std::sync::mpsc::channel::<Vec<usize>>();
        let (tx_b, rx_b) = std::sync::mpsc::channel::<Vec<usize>>();

        let t1 = std::thread::spawn(move || {
            let mine: Vec<usize> = (0..1000).map(|i| heap.malloc(1 + i % 300) as usize).collect();
            assert!(mine.iter().all(|&p| p != 0));
            tx_a.send(mine).unwrap();
            let theirs = rx_b.recv().unwrap();
            for p in theirs {
                unsafe { heap.free(p as *mut c_void) };
            }
        });
        let t2 = std::thread::spawn(move || {
            let mine: Vec<usize> = (0..1000).map(|i| heap.malloc(1 + i % 300) as usize).collect();
            assert!(mine.iter().all(|&p| p != 0));
            tx_b.send(mine).unwrap();
            let theirs = rx_a.recv().unwrap();
            for p in theirs {
                unsafe { heap.free(p as *mut c_void) };
            }
        });
        t1.join().expect("thread 1 should finish");
        t2.join().expect("thread 2 should finish");
    }

    #[test]
    fn global_entry_points_work() {
        let p = malloc(100);
        assert!(!p.is_null());
        let p = unsafe { realloc(p, 200) };
        assert!(!p.is_null());
        unsafe { free(p) };

        let q = calloc(4, 4);
        assert!(!q.is_null());
        unsafe { freezero(q, 16) };

        let mut out: *mut c_void = ptr::null_mut();
        assert_eq!(unsafe { posix_memalign(&mut out, 1, 8) }, libc::EINVAL);
        assert_eq!(unsafe { posix_memalign(&mut out, 128, 128) }, 0);
        unsafe { free(out) };
    }

    proptest! {
        // Live allocations never overlap: every block holds its own
        // pattern across an arbitrary interleaving of allocs and frees.
        #[test]
        fn no_overlap_under_churn(ops in vec((1usize..6000, 0u8..4), 4..40)) {
            let heap = &*SHARED;
            let mut live: Vec<(usize, usize, u8)> = Vec::new();

            for (round, (size, action)) in ops.into_iter().enumerate() {
                if action == 0 && !live.is_empty() {
                    let (addr, len, pat) = live.swap_remove(round % live.len());
                    for i in 0..len {
                        prop_assert_eq!(unsafe { std::ptr::read((addr + i) as *const u8) }, pat);
                    }
                    unsafe { heap.free(addr as *mut c_void) };
                } else {
                    let p = heap.malloc(size) as usize;
                    prop_assert!(p != 0);
                    let pat = (round % 200 + 1) as u8;
                    unsafe { std::ptr::write_bytes(p as *mut u8, pat, size) };
                    live.push((p, size, pat));
                }

                for &(addr, len, pat) in &live {
                    prop_assert_eq!(unsafe { std::ptr::read(addr as *const u8) }, pat);
                    prop_assert_eq!(unsafe { std::ptr::read((addr + len - 1) as *const u8) }, pat);
                }
            }

            for (addr, _, _) in live {
                unsafe { heap.free(addr as *mut c_void) };
            }
        }

        // Realloc keeps the surviving prefix intact for arbitrary size
        // chains.
        #[test]
        fn realloc_chain_preserves_prefix(sizes in vec(1usize..5000, 2..12)) {
            let heap = &*SHARED;
            let mut p = heap.malloc(sizes[0]);
            prop_assert!(!p.is_null());
            let mut cur = sizes[0];
            unsafe { std::ptr::write_bytes(p as *mut u8, 0x61, cur) };

            for &next in &sizes[1..] {
                p = unsafe { heap.realloc(p, next) };
                prop_assert!(!p.is_null());
                let keep = cur.min(next);
                for i in 0..keep {
                    prop_assert_eq!(
                        unsafe { std::ptr::read((p as usize + i) as *const u8) },
                        0x61
                    );
                }
                unsafe { std::ptr::write_bytes(p as *mut u8, 0x61, next) };
                cur = next;
            }
            unsafe { heap.free(p) };
        }
    }
}
