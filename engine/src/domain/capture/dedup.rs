//! Per-source perceptual-hash dedup
//!
//! Each source keeps a small window of recent hashes. A candidate frame is
//! accepted only when its Hamming distance to every recent hash exceeds the
//! live threshold; otherwise it is discarded before any disk or AI cost.

use std::collections::VecDeque;

use dashmap::DashMap;

use crate::core::constants::PHASH_WINDOW_SIZE;

use super::phash::hamming;

/// Per-source dedup state
#[derive(Default)]
pub struct SourceDedup {
    windows: DashMap<String, VecDeque<u64>>,
}

impl SourceDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a source's window from persisted hashes (newest first)
    pub fn seed(&self, source_key: &str, hashes: &[u64]) {
        let mut window = VecDeque::with_capacity(PHASH_WINDOW_SIZE);
        for &hash in hashes.iter().take(PHASH_WINDOW_SIZE) {
            window.push_front(hash);
        }
        self.windows.insert(source_key.to_string(), window);
    }

    /// Decide whether to accept a candidate hash; accepted hashes enter the
    /// window, displacing the oldest when full.
    pub fn accept(&self, source_key: &str, hash: u64, threshold: u32) -> bool {
        let mut window = self.windows.entry(source_key.to_string()).or_default();

        let duplicate = window.iter().any(|&recent| hamming(recent, hash) <= threshold);
        if duplicate {
            return false;
        }

        if window.len() == PHASH_WINDOW_SIZE {
            window.pop_front();
        }
        window.push_back(hash);
        true
    }

    /// Number of sources with active windows
    pub fn source_count(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_frame_accepted() {
        let dedup = SourceDedup::new();
        assert!(dedup.accept("screen:1", 0b1111, 3));
    }

    #[test]
    fn test_identical_hash_rejected() {
        let dedup = SourceDedup::new();
        assert!(dedup.accept("screen:1", 42, 3));
        assert!(!dedup.accept("screen:1", 42, 3));
    }

    #[test]
    fn test_threshold_boundary() {
        // Accepted iff distance to ALL recent hashes exceeds the threshold.
        // H' at distance 1 is rejected; H'' at distance 4 is accepted.
        let dedup = SourceDedup::new();
        let h = 0b0000u64;
        let h1 = 0b0001u64; // distance 1
        let h2 = 0b1111u64; // distance 4
        assert!(dedup.accept("s", h, 3));
        assert!(!dedup.accept("s", h1, 3));
        assert!(dedup.accept("s", h2, 3));
    }

    #[test]
    fn test_distance_equal_to_threshold_rejected() {
        let dedup = SourceDedup::new();
        assert!(dedup.accept("s", 0b000, 3));
        // Distance exactly 3 does not exceed the threshold
        assert!(!dedup.accept("s", 0b111, 3));
    }

    #[test]
    fn test_sources_are_independent() {
        let dedup = SourceDedup::new();
        assert!(dedup.accept("screen:1", 42, 3));
        assert!(dedup.accept("screen:2", 42, 3));
        assert_eq!(dedup.source_count(), 2);
    }

    #[test]
    fn test_window_is_bounded() {
        let dedup = SourceDedup::new();
        // Fill the window with mutually distant hashes
        for i in 0..PHASH_WINDOW_SIZE as u64 + 2 {
            let spread = u64::MAX.wrapping_shr(i as u32) ^ (i * 0x0101_0101);
            dedup.accept("s", spread, 0);
        }
        let window = dedup.windows.get("s").unwrap();
        assert!(window.len() <= PHASH_WINDOW_SIZE);
    }

    #[test]
    fn test_seed_prefills_window() {
        let dedup = SourceDedup::new();
        dedup.seed("s", &[42]);
        assert!(!dedup.accept("s", 42, 3));
    }
}
