//! Allocation statistics.
//!
//! Counters are cheap enough to keep unconditionally; the dump path that
//! turns them and the outstanding regions into a report only compiles
//! with the `stats` feature and only runs when the `D` option asked for
//! it.
#[derive(Default)]
#[cfg_attr(not(feature = "stats"), allow(dead_code))]
pub(crate) struct Stats {
    pub inserts: usize,
    pub finds: usize,
    pub deletes: usize,
    pub cheap_realloc_tries: usize,
    pub cheap_reallocs: usize,
    pub pool_searches: usize,
    pub other_pool: usize,
    /// Bytes currently mapped on behalf of this pool.
    pub bytes_used: usize,
    /// Bytes spent on guard pages.
    pub bytes_guarded: usize,
}

#[cfg(feature = "stats")]
pub(crate) mod dump {
    use std::collections::BTreeMap;

    use crate::directory::Region;
    use crate::pool::Pool;

    #[derive(Default)]
    pub(crate) struct LeakLine {
        count: usize,
        total: usize,
    }

    /// Emits one pool's counters and folds its outstanding regions into
    /// `leaks`, keyed by live byte size.
    pub(crate) fn dump_pool(index: u32, pool: &Pool, verbose: bool, leaks: &mut BTreeMap<usize, LeakLine>) {
        let s = pool.stats();
        if verbose {
            log::info!(
                "pool {}: regions {}/{} finds {} inserts {} deletes {}",
                index,
                pool.regions_len(),
                pool.regions_capacity(),
                s.finds,
                s.inserts,
                s.deletes,
            );
            log::info!(
                "pool {}: cheap reallocs {}/{} other pool {}/{} in use {} guarded {}",
                index,
                s.cheap_reallocs,
                s.cheap_realloc_tries,
                s.other_pool,
                s.pool_searches,
                s.bytes_used,
                s.bytes_guarded,
            );
        }

        pool.for_each_region(|slot| {
            let (size, count) = match slot.region() {
                Some(Region::Large { size }) => (size, 1),
                Some(Region::Chunk { meta, .. }) => {
                    let meta = unsafe { meta.as_ref() };
                    (
                        crate::chunk::bucket_size(meta.bucket),
                        (meta.total - meta.free) as usize,
                    )
                }
                // The dump is an observer; a slot it cannot decode is
                // left out rather than dereferenced.
                None => return,
            };
            if count > 0 {
                let line = leaks.entry(size).or_default();
                line.count += count;
                line.total += size * count;
            }
        });
    }

    pub(crate) fn dump_leaks(leaks: &BTreeMap<usize, LeakLine>) {
        log::info!("leak report: size sum # avg");
        for (size, line) in leaks {
            log::info!(
                "{:>8} {:>8} {:>6} {:>8}",
                size,
                line.total,
                line.count,
                if line.count > 0 { line.total / line.count } else { 0 },
            );
        }
    }

    pub(crate) fn new_leak_table() -> BTreeMap<usize, LeakLine> {
        BTreeMap::new()
    }
}
