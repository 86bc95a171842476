//! Contract-build ledger of live allocations.
//!
//! Backs the `#[ensures]`/`#[requires]` clauses on the public surface:
//! no address may be handed out twice while live.  Releases are
//! tolerant of unknown addresses because not every entry point carries
//! a contract; the ledger is an observer, never an authority.
use std::collections::HashMap;
use std::sync::Mutex;

lazy_static::lazy_static! {
    static ref LIVE: Mutex<HashMap<usize, usize>> = Default::default();
}

/// Records a fresh allocation.  False if the address was already live,
/// which would mean the allocator double-issued it.
pub(crate) fn note_alloc(addr: usize, size: usize) -> bool {
    LIVE.lock().unwrap().insert(addr, size).is_none()
}

/// Records a release.
pub(crate) fn note_free(addr: usize) -> bool {
    LIVE.lock().unwrap().remove(&addr);
    true
}

/// Records a resize: the old address dies, the result becomes live.
/// The two may be equal for in-place resizes.
pub(crate) fn note_realloc(old: usize, new: usize, size: usize) -> bool {
    let mut live = LIVE.lock().unwrap();
    live.remove(&old);
    live.insert(new, size).is_none()
}
