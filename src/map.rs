//! Thin wrappers around the host's anonymous-mapping primitives.
//!
//! Everything here works in whole pages and reports failure with the raw
//! errno value, so callers can decide between surfacing ENOMEM and
//! aborting.  No allocation happens on these paths.
use std::ffi::c_void;
use std::ptr;

pub(crate) const PAGE_SHIFT: usize = 12;
pub(crate) const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub(crate) const PAGE_MASK: usize = PAGE_SIZE - 1;

static_assertions::const_assert!(PAGE_SIZE.is_power_of_two());

/// Rounds `sz` up to a whole number of pages.
#[inline]
pub(crate) fn page_round(sz: usize) -> usize {
    (sz + PAGE_MASK) & !PAGE_MASK
}

#[inline]
pub(crate) fn mask_page(addr: usize) -> usize {
    addr & !PAGE_MASK
}

fn host_page_size() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret <= 0 {
        panic!("unable to find the page size: errno={}", errno::errno().0);
    }
    ret as usize
}

lazy_static::lazy_static! {
    static ref HOST_PAGE_SIZE: usize = {
        let sz = host_page_size();
        // All the page math in this crate is compiled against 4K pages.
        assert_eq!(sz, PAGE_SIZE, "unsupported host page size {}", sz);
        sz
    };
}

/// Returns the system page size, after checking it matches the compiled-in
/// constant.
#[inline]
pub(crate) fn page_size() -> usize {
    *HOST_PAGE_SIZE
}

fn last_errno() -> i32 {
    errno::errno().0
}

fn mmap_anon(hint: usize, size: usize, prot: libc::c_int, extra: libc::c_int) -> Result<usize, i32> {
    debug_assert!(size > 0 && size % page_size() == 0);

    let p = unsafe {
        libc::mmap(
            hint as *mut c_void,
            size,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANON | extra,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        Err(last_errno())
    } else {
        Ok(p as usize)
    }
}

/// Maps `size` bytes of fresh read-write anonymous memory.
pub(crate) fn map_rw(size: usize) -> Result<usize, i32> {
    mmap_anon(0, size, libc::PROT_READ | libc::PROT_WRITE, 0)
}

/// Reserves `size` bytes of inaccessible address space.
pub(crate) fn map_none(size: usize) -> Result<usize, i32> {
    mmap_anon(0, size, libc::PROT_NONE, 0)
}

/// Attempts to map `size` bytes read-write exactly at `hint`, failing
/// rather than displacing an existing mapping.
#[cfg(target_os = "linux")]
pub(crate) fn map_fixed_noreplace(hint: usize, size: usize) -> Result<usize, i32> {
    mmap_anon(
        hint,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_FIXED_NOREPLACE,
    )
}

/// Hosts without a no-replace fixed mapping get a probe: take whatever the
/// kernel offers for the hint and back out if it landed elsewhere.
#[cfg(not(target_os = "linux"))]
pub(crate) fn map_fixed_noreplace(hint: usize, size: usize) -> Result<usize, i32> {
    let p = mmap_anon(hint, size, libc::PROT_READ | libc::PROT_WRITE, 0)?;
    if p != hint {
        let _ = unmap(p, size);
        return Err(libc::EEXIST);
    }
    Ok(p)
}

fn mprotect(addr: usize, size: usize, prot: libc::c_int) -> Result<(), i32> {
    debug_assert!(addr % page_size() == 0);

    let ret = unsafe { libc::mprotect(addr as *mut c_void, size, prot) };
    if ret != 0 {
        Err(last_errno())
    } else {
        Ok(())
    }
}

pub(crate) fn protect_none(addr: usize, size: usize) -> Result<(), i32> {
    mprotect(addr, size, libc::PROT_NONE)
}

pub(crate) fn protect_rw(addr: usize, size: usize) -> Result<(), i32> {
    mprotect(addr, size, libc::PROT_READ | libc::PROT_WRITE)
}

pub(crate) fn protect_read(addr: usize, size: usize) -> Result<(), i32> {
    mprotect(addr, size, libc::PROT_READ)
}

pub(crate) fn unmap(addr: usize, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }
    debug_assert!(size % page_size() == 0);

    let ret = unsafe { libc::munmap(addr as *mut c_void, size) };
    if ret != 0 {
        Err(last_errno())
    } else {
        Ok(())
    }
}

/// Asks the kernel to leave the range out of core dumps.  Advisory: hosts
/// that cannot honor it still get a functioning allocator.
#[cfg(target_os = "linux")]
pub(crate) fn exclude_from_dumps(addr: usize, size: usize) {
    unsafe {
        libc::madvise(addr as *mut c_void, size, libc::MADV_DONTDUMP);
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn exclude_from_dumps(_addr: usize, _size: usize) {}

/// Wipes `len` bytes in a way the optimizer may not elide.
pub(crate) fn explicit_bzero(addr: usize, len: usize) {
    let mut p = addr as *mut u8;
    let end = addr + len;
    while (p as usize) < end {
        unsafe {
            ptr::write_volatile(p, 0);
            p = p.add(1);
        }
    }
}
