//! Runtime options.
//!
//! A handful of single-character flags tune the hardening/performance
//! trade-off.  They are read once per heap, from the environment (unless
//! the process is set-id) and then from the programmatic boot string,
//! with later sources overriding earlier ones.  After parsing, the
//! snapshot lives in the heap's read-only page and never changes.
use crate::cache::{DEFAULT_CACHE, MAX_CACHE};
use crate::heap::MAX_POOLS;
use crate::map::PAGE_SIZE;

/// Name of the environment variable consulted at first use.
pub(crate) const OPTIONS_ENV: &str = "PALISADE_OPTIONS";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Options {
    /// Pool shards, always a power of two in `[2, MAX_POOLS]`.
    pub n_pools: u32,
    /// Page-cache capacity knob; zero disables both caches.
    pub def_maxcache: u32,
    /// Default junk level: 0 off, 1 striped, 2 full.
    pub def_junk: u32,
    /// Place canary bytes after each chunk.
    pub chunk_canaries: bool,
    /// Walk the quarantine on every free.
    pub freecheck: bool,
    /// Keep freed cached pages inaccessible instead of junked.
    pub freeunmap: bool,
    /// Trailing guard bytes for page-granular allocations (0 or a page).
    pub guard: usize,
    /// Never reuse an allocation in place on realloc.
    pub always_realloc: bool,
    /// Abort instead of returning NULL on exhaustion.
    pub xmalloc: bool,
    /// Dump statistics when asked.
    pub stats_dump: bool,
    pub verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            n_pools: 8,
            def_maxcache: DEFAULT_CACHE,
            def_junk: 1,
            chunk_canaries: false,
            freecheck: false,
            freeunmap: false,
            guard: 0,
            always_realloc: false,
            xmalloc: false,
            stats_dump: false,
            verbose: false,
        }
    }
}

impl Options {
    fn apply(&mut self, opt: char) {
        match opt {
            '+' => {
                self.n_pools <<= 1;
                if self.n_pools > MAX_POOLS as u32 {
                    self.n_pools = MAX_POOLS as u32;
                }
            }
            '-' => {
                self.n_pools >>= 1;
                if self.n_pools < 2 {
                    self.n_pools = 2;
                }
            }
            '>' => {
                self.def_maxcache <<= 1;
                if self.def_maxcache > MAX_CACHE {
                    self.def_maxcache = MAX_CACHE;
                }
            }
            '<' => self.def_maxcache >>= 1,
            'c' => self.chunk_canaries = false,
            'C' => self.chunk_canaries = true,
            'd' => self.stats_dump = false,
            'D' => self.stats_dump = true,
            'f' => {
                self.freecheck = false;
                self.freeunmap = false;
            }
            'F' => {
                self.freecheck = true;
                self.freeunmap = true;
            }
            'g' => self.guard = 0,
            'G' => self.guard = PAGE_SIZE,
            'j' => self.def_junk = self.def_junk.saturating_sub(1),
            'J' => {
                if self.def_junk < 2 {
                    self.def_junk += 1;
                }
            }
            'r' => self.always_realloc = false,
            'R' => self.always_realloc = true,
            'u' => self.freeunmap = false,
            'U' => self.freeunmap = true,
            'v' => self.verbose = false,
            'V' => self.verbose = true,
            'x' => self.xmalloc = false,
            'X' => self.xmalloc = true,
            _ => {
                log::warn!("unknown character '{}' in allocator options", opt);
            }
        }
    }

    /// Applies one source string, expanding the `S`/`s` shorthands.
    pub(crate) fn parse(&mut self, opts: &str) {
        for c in opts.chars() {
            match c {
                'S' => {
                    for q in "CFGJ".chars() {
                        self.apply(q);
                    }
                    self.def_maxcache = 0;
                }
                's' => {
                    for q in "cfgj".chars() {
                        self.apply(q);
                    }
                    self.def_maxcache = DEFAULT_CACHE;
                }
                c => self.apply(c),
            }
        }
    }

    /// Builds the effective option set from all sources.
    pub(crate) fn from_sources(boot: Option<&str>) -> Self {
        let mut opts = Self::default();
        if !is_set_id() {
            if let Ok(env) = std::env::var(OPTIONS_ENV) {
                opts.parse(&env);
            }
        }
        if let Some(boot) = boot {
            opts.parse(boot);
        }
        opts
    }

    /// Whether chunk sizes go through the linear-log rounding curve.
    /// Tied to the cache so the strictest configuration also gets the
    /// tightest size classes.
    pub(crate) fn round_buckets(&self) -> bool {
        self.def_maxcache != 0
    }
}

/// Set-id processes must not take options from their caller's
/// environment.
fn is_set_id() -> bool {
    unsafe {
        libc::getuid() != libc::geteuid() || libc::getgid() != libc::getegid()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let opts = Options::default();
        assert_eq!(opts.n_pools, 8);
        assert_eq!(opts.def_maxcache, DEFAULT_CACHE);
        assert_eq!(opts.def_junk, 1);
        assert!(!opts.chunk_canaries);
        assert!(opts.round_buckets());
    }

    #[test]
    fn pool_count_clamps() {
        let mut opts = Options::default();
        opts.parse("++++++++");
        assert_eq!(opts.n_pools, MAX_POOLS as u32);
        opts.parse("----------");
        assert_eq!(opts.n_pools, 2);
    }

    #[test]
    fn cache_knob_clamps() {
        let mut opts = Options::default();
        opts.parse(">>>");
        assert_eq!(opts.def_maxcache, MAX_CACHE);
        opts.parse("<<<<<<<<<<");
        assert_eq!(opts.def_maxcache, 0);
        assert!(!opts.round_buckets());
    }

    #[test]
    fn junk_level_saturates() {
        let mut opts = Options::default();
        opts.parse("JJJ");
        assert_eq!(opts.def_junk, 2);
        opts.parse("jjjjj");
        assert_eq!(opts.def_junk, 0);
    }

    #[test]
    fn strict_shorthand() {
        let mut opts = Options::default();
        opts.parse("S");
        assert!(opts.chunk_canaries);
        assert!(opts.freecheck);
        assert!(opts.freeunmap);
        assert_eq!(opts.guard, PAGE_SIZE);
        assert_eq!(opts.def_junk, 2);
        assert_eq!(opts.def_maxcache, 0);

        opts.parse("s");
        assert!(!opts.chunk_canaries);
        assert!(!opts.freecheck);
        assert_eq!(opts.guard, 0);
        assert_eq!(opts.def_junk, 1);
        assert_eq!(opts.def_maxcache, DEFAULT_CACHE);
    }

    #[test]
    fn f_implies_both_free_checks_and_u_is_separable() {
        let mut opts = Options::default();
        opts.parse("F");
        assert!(opts.freecheck && opts.freeunmap);
        opts.parse("u");
        assert!(opts.freecheck && !opts.freeunmap);
        opts.parse("f");
        assert!(!opts.freecheck && !opts.freeunmap);
        opts.parse("U");
        assert!(!opts.freecheck && opts.freeunmap);
    }

    #[test]
    fn unknown_characters_are_ignored() {
        let mut opts = Options::default();
        let before = opts;
        opts.parse("zq9!");
        assert_eq!(opts, before);
    }
}
