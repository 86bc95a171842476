//! A `PageProvider` hands page runs to the pools.  Each pool carries its
//! own provider so the concealed pool can request mappings that stay out
//! of core dumps.
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

use crate::map;
use crate::map::PAGE_SIZE;

/// Page protection states a provider can apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Access {
    None,
    ReadWrite,
}

#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub(crate) trait PageProvider {
    /// The mapping granularity.  Constant for the life of the process.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> usize;

    /// Maps `n_pages` of fresh, zero-filled, read-write memory.
    #[requires(n_pages > 0)]
    #[ensures(ret.is_ok() -> *ret.as_ref().unwrap() != 0, "mapped ranges never include NULL")]
    #[ensures(ret.is_ok() -> *ret.as_ref().unwrap() % PAGE_SIZE == 0, "mapped ranges are page aligned")]
    fn map_rw(&self, n_pages: usize) -> Result<usize, i32>;

    /// Reserves `n_pages` of inaccessible address space.
    #[requires(n_pages > 0)]
    #[ensures(ret.is_ok() -> *ret.as_ref().unwrap() % PAGE_SIZE == 0, "mapped ranges are page aligned")]
    fn map_none(&self, n_pages: usize) -> Result<usize, i32>;

    /// Maps `n_pages` read-write exactly at `hint`, without displacing
    /// anything already mapped there.
    #[requires(hint % PAGE_SIZE == 0 && n_pages > 0)]
    #[ensures(ret.is_ok() -> *ret.as_ref().unwrap() == hint, "a successful fixed map lands on the hint")]
    fn map_fixed_noreplace(&self, hint: usize, n_pages: usize) -> Result<usize, i32>;

    /// Changes the protection of an existing run.
    #[requires(addr % PAGE_SIZE == 0 && n_pages > 0)]
    fn protect(&self, addr: usize, n_pages: usize, access: Access) -> Result<(), i32>;

    /// Marks a run immutable where the host supports it.  Advisory
    /// elsewhere: the protection applied beforehand still stands.
    #[requires(addr % PAGE_SIZE == 0)]
    fn immutable(&self, addr: usize, n_pages: usize);

    /// Returns a run to the operating system.
    #[requires(addr % PAGE_SIZE == 0)]
    fn unmap(&self, addr: usize, n_pages: usize) -> Result<(), i32>;
}

/// The one real provider: anonymous private mappings, with an optional
/// conceal flag applied to every map.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SystemProvider {
    conceal: bool,
}

impl SystemProvider {
    pub(crate) fn new(conceal: bool) -> Self {
        Self { conceal }
    }

    pub(crate) fn concealed(&self) -> bool {
        self.conceal
    }

    fn apply_conceal(&self, addr: usize, n_pages: usize) {
        if self.conceal {
            map::exclude_from_dumps(addr, n_pages * PAGE_SIZE);
        }
    }
}

#[contract_trait]
impl PageProvider for SystemProvider {
    fn page_size(&self) -> usize {
        map::page_size()
    }

    fn map_rw(&self, n_pages: usize) -> Result<usize, i32> {
        let p = map::map_rw(n_pages * PAGE_SIZE)?;
        self.apply_conceal(p, n_pages);
        Ok(p)
    }

    fn map_none(&self, n_pages: usize) -> Result<usize, i32> {
        let p = map::map_none(n_pages * PAGE_SIZE)?;
        self.apply_conceal(p, n_pages);
        Ok(p)
    }

    fn map_fixed_noreplace(&self, hint: usize, n_pages: usize) -> Result<usize, i32> {
        let p = map::map_fixed_noreplace(hint, n_pages * PAGE_SIZE)?;
        self.apply_conceal(p, n_pages);
        Ok(p)
    }

    fn protect(&self, addr: usize, n_pages: usize, access: Access) -> Result<(), i32> {
        match access {
            Access::None => map::protect_none(addr, n_pages * PAGE_SIZE),
            Access::ReadWrite => map::protect_rw(addr, n_pages * PAGE_SIZE),
        }
    }

    fn immutable(&self, _addr: usize, _n_pages: usize) {
        // No portable immutability primitive.  The read-only protection
        // the caller already applied is the effective barrier.
    }

    fn unmap(&self, addr: usize, n_pages: usize) -> Result<(), i32> {
        map::unmap(addr, n_pages * PAGE_SIZE)
    }
}
