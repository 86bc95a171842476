//! Randomness for placement decisions, canaries and junk nonces.
//!
//! Everything funnels through the operating system's generator: the
//! allocator's unpredictability claims are only as good as its entropy
//! source.
use rand::rngs::OsRng;
use rand::RngCore;

pub(crate) fn random_u32() -> u32 {
    OsRng.next_u32()
}

pub(crate) fn random_fill(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// A value in `[0, n)`.  The slight modulo bias is acceptable for slot
/// and offset choices, which only need to be hard to predict.
pub(crate) fn random_uniform(n: u32) -> u32 {
    if n <= 1 {
        0
    } else {
        OsRng.next_u32() % n
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uniform_stays_in_range() {
        for _ in 0..1000 {
            assert!(random_uniform(7) < 7);
        }
        assert_eq!(random_uniform(0), 0);
        assert_eq!(random_uniform(1), 0);
    }

    #[test]
    fn fill_covers_buffer() {
        // 32 zero bytes after filling would mean a broken source.
        let mut buf = [0u8; 32];
        random_fill(&mut buf);
        assert!(buf.iter().any(|&b| b != 0));
    }
}
