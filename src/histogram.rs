//! Per-region pixel value histograms.
//!
//! Every region accumulates a fixed 256-bucket histogram per observation cycle. Merging is
//! elementwise addition, so the order in which tiles contribute does not matter.

/// Number of pixel value classes.
pub const BUCKETS: usize = 256;

/// Pixel below the detection threshold.
pub const BELOW_DETECTION: u8 = 0;

/// Land pixel.
pub const LAND: u8 = 254;

/// No data pixel.
pub const NO_DATA: u8 = 255;

/// Bucket counts for one region and cycle.
#[derive(Clone, PartialEq, Eq)]
pub struct Histogram {
    counts: [u64; BUCKETS],
}

impl Histogram {
    /// An empty accumulator.
    pub fn new() -> Self {
        Self {
            counts: [0; BUCKETS],
        }
    }

    /// Build from raw pixel values, one count per pixel.
    pub fn from_pixels<I>(pixels: I) -> Self
    where
        I: IntoIterator<Item = u8>,
    {
        let mut histogram = Self::new();
        for value in pixels {
            histogram.counts[value as usize] += 1;
        }
        histogram
    }

    /// Build from `(bucket, count)` pairs. Repeated buckets are summed.
    pub fn from_buckets<I>(buckets: I) -> Self
    where
        I: IntoIterator<Item = (u8, u64)>,
    {
        let mut histogram = Self::new();
        for (bucket, count) in buckets {
            histogram.add(bucket, count);
        }
        histogram
    }

    pub fn add(&mut self, bucket: u8, count: u64) {
        let slot = &mut self.counts[bucket as usize];
        *slot = slot.saturating_add(count);
    }

    /// Add another histogram into this one.
    pub fn merge(&mut self, other: &Histogram) {
        for (slot, count) in self.counts.iter_mut().zip(other.counts.iter()) {
            *slot = slot.saturating_add(*count);
        }
    }

    pub fn get(&self, bucket: u8) -> u64 {
        self.counts[bucket as usize]
    }

    pub fn counts(&self) -> &[u64; BUCKETS] {
        &self.counts
    }

    /// Total pixel count across all buckets.
    pub fn total(&self) -> u64 {
        self.counts.iter().fold(0u64, |acc, c| acc.saturating_add(*c))
    }

    pub fn is_empty(&self) -> bool {
        self.counts.iter().all(|c| *c == 0)
    }

    /// Non-zero buckets in ascending bucket order. These are the rows that get persisted.
    pub fn non_zero(&self) -> impl Iterator<Item = (u8, u64)> + '_ {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(bucket, count)| (bucket as u8, *count))
    }

    /// Number of non-zero buckets.
    pub fn non_zero_len(&self) -> usize {
        self.counts.iter().filter(|c| **c > 0).count()
    }

    /// Sum of buckets in `[start, end)`. Bounds past the last bucket are clamped.
    pub fn sum_range(&self, start: usize, end: usize) -> u64 {
        let end = end.min(BUCKETS);
        if start >= end {
            return 0;
        }
        self.counts[start..end]
            .iter()
            .fold(0u64, |acc, c| acc.saturating_add(*c))
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Histogram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.non_zero()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pixels() {
        let histogram = Histogram::from_pixels([0u8, 5, 5, 254, 255, 255, 255]);
        assert_eq!(histogram.get(BELOW_DETECTION), 1);
        assert_eq!(histogram.get(5), 2);
        assert_eq!(histogram.get(LAND), 1);
        assert_eq!(histogram.get(NO_DATA), 3);
        assert_eq!(histogram.total(), 7);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let a = Histogram::from_buckets([(1, 10), (100, 3)]);
        let b = Histogram::from_buckets([(1, 5), (200, 7)]);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab, ba);
        assert_eq!(ab.get(1), 15);
        assert_eq!(ab.total(), 25);
    }

    #[test]
    fn test_non_zero_skips_empty_buckets() {
        let histogram = Histogram::from_buckets([(0, 4), (17, 0), (253, 9)]);
        let rows: Vec<_> = histogram.non_zero().collect();
        assert_eq!(rows, vec![(0, 4), (253, 9)]);
        assert_eq!(histogram.non_zero_len(), 2);
    }

    #[test]
    fn test_sum_range() {
        let histogram = Histogram::from_buckets([(0, 1), (10, 2), (99, 3), (100, 4), (255, 5)]);
        assert_eq!(histogram.sum_range(0, 100), 6);
        assert_eq!(histogram.sum_range(100, 300), 9);
        assert_eq!(histogram.sum_range(50, 50), 0);
    }

    #[test]
    fn test_empty() {
        assert!(Histogram::new().is_empty());
        assert!(!Histogram::from_pixels([3u8]).is_empty());
    }
}
