//! Junk and canary byte handling.
//!
//! Freed memory is filled with a recognizable pattern and the pattern is
//! checked again before the memory is handed back out; a mismatch means
//! someone wrote through a dangling pointer.  Chunk allocations optionally
//! get a short canary stripe after the requested size, checked at free.
use crate::diag;
use crate::map::PAGE_SIZE;

/// Byte stored after allocation in the slack beyond the request.
pub(crate) const SOME_JUNK: u8 = 0xdb;
/// Byte stored over freed memory.
pub(crate) const SOME_FREEJUNK: u8 = 0xdf;
const SOME_FREEJUNK_WORD: u64 = 0xdfdf_dfdf_dfdf_dfdf;

/// How many bytes of canary to place after a chunk, at most.
pub(crate) const CHUNK_CHECK_LENGTH: usize = 32;

const WORD: usize = std::mem::size_of::<u64>();

// Level 1 stripes roughly four words per page instead of filling
// everything; `loc` varies the stripe phase so the touched offsets are
// not predictable.  Level 2 fills the whole range.
fn stride(junk: u32, len_words: usize) -> (usize, usize) {
    let mut words = len_words;
    let mut step = 1;
    if junk == 1 {
        if words > PAGE_SIZE / WORD {
            words = PAGE_SIZE / WORD;
        }
        step = (words / 4).max(1);
    }
    (words, step)
}

/// Writes free-junk over `sz` bytes at `p` according to the junk level.
pub(crate) fn junk_free(junk: u32, loc: u32, p: usize, sz: usize) {
    if junk == 0 || sz == 0 {
        return;
    }
    let (words, step) = stride(junk, sz / WORD);
    let lp = p as *mut u64;
    let mut i = loc as usize % step;
    while i < words {
        unsafe { lp.add(i).write(SOME_FREEJUNK_WORD) };
        i += step;
    }
}

/// Rechecks the pattern `junk_free` wrote.  Aborts on mismatch: the
/// memory was modified while free.
pub(crate) fn validate_junk(junk: u32, loc: u32, func: &str, p: usize, sz: usize) {
    if junk == 0 || sz == 0 {
        return;
    }
    let (words, step) = stride(junk, sz / WORD);
    let lp = p as *const u64;
    let mut i = loc as usize % step;
    while i < words {
        if unsafe { lp.add(i).read() } != SOME_FREEJUNK_WORD {
            diag::fatal(func, format_args!("write after free {:#x}", p));
        }
        i += step;
    }
}

/// Writes up to `CHUNK_CHECK_LENGTH` canary bytes into `[sz, allocated)`.
pub(crate) fn fill_canary(canary: u8, ptr: usize, sz: usize, allocated: usize) {
    let check_sz = (allocated - sz).min(CHUNK_CHECK_LENGTH);
    unsafe { std::ptr::write_bytes((ptr + sz) as *mut u8, canary, check_sz) };
}

/// Validates the canary stripe behind a chunk.  The allocation-junk byte
/// is also accepted: slack beyond the stripe keeps its original fill.
pub(crate) fn validate_canary(canary: u8, func: &str, ptr: usize, sz: usize, allocated: usize) {
    let check_sz = (allocated - sz).min(CHUNK_CHECK_LENGTH);
    for off in 0..check_sz {
        let b = unsafe { std::ptr::read((ptr + sz + off) as *const u8) };
        if b != canary && b != SOME_JUNK {
            diag::fatal(
                func,
                format_args!(
                    "canary corrupted {:#x} {:#x}@{:#x}{}",
                    ptr,
                    sz + off,
                    sz,
                    if b == SOME_FREEJUNK {
                        " (double free?)"
                    } else {
                        ""
                    }
                ),
            );
        }
    }
}
