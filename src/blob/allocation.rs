//! Capacity policies for record slots.
//!
//! A strategy only decides how many bytes to reserve. Every slot stores the
//! capacity it was given, so a file written under one strategy can be reopened
//! under another.

use std::fmt::Debug;

pub trait AllocationStrategy: Send + Sync + Debug {
    /// Largest capacity this strategy will hand out.
    fn max_capacity(&self) -> usize;

    /// Capacity for a brand new record of `payload_len` bytes.
    fn initial_capacity(&self, payload_len: usize) -> usize;

    /// Capacity for a record outgrowing `current_capacity` with a `payload_len` payload.
    fn relocation_capacity(&self, payload_len: usize, current_capacity: usize) -> usize {
        let _ = current_capacity;
        self.initial_capacity(payload_len)
    }
}

/// Reserves exactly the payload length.
#[derive(Debug, Clone)]
pub struct ExactFit {
    max_capacity: usize,
}

impl ExactFit {
    pub fn new(max_capacity: usize) -> Self {
        Self { max_capacity }
    }
}

impl Default for ExactFit {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl AllocationStrategy for ExactFit {
    fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    fn initial_capacity(&self, payload_len: usize) -> usize {
        payload_len
    }
}

/// Reserves a fixed percentage on top of the payload, with a floor.
#[derive(Debug, Clone)]
pub struct FixedPercent {
    min_capacity: usize,
    percent: usize,
    max_capacity: usize,
}

impl FixedPercent {
    pub fn new(min_capacity: usize, percent: usize, max_capacity: usize) -> Self {
        Self {
            min_capacity,
            percent,
            max_capacity,
        }
    }
}

impl Default for FixedPercent {
    fn default() -> Self {
        Self::new(64, 30, usize::MAX)
    }
}

impl AllocationStrategy for FixedPercent {
    fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    fn initial_capacity(&self, payload_len: usize) -> usize {
        let reserve = payload_len.saturating_mul(self.percent) / 100;
        payload_len
            .saturating_add(reserve)
            .max(self.min_capacity)
            .min(self.max_capacity)
    }

    fn relocation_capacity(&self, payload_len: usize, current_capacity: usize) -> usize {
        // A record that already outgrew its slot once is likely to keep growing
        let grown = current_capacity.saturating_add(current_capacity.saturating_mul(self.percent) / 100);
        self.initial_capacity(payload_len)
            .max(grown)
            .min(self.max_capacity)
    }
}

/// Rounds capacity up to the next power of two, starting at `min_bucket`.
#[derive(Debug, Clone)]
pub struct SizeBuckets {
    min_bucket: usize,
    max_capacity: usize,
}

impl SizeBuckets {
    pub fn new(min_bucket: usize, max_capacity: usize) -> Self {
        Self {
            min_bucket: min_bucket.max(1),
            max_capacity,
        }
    }
}

impl Default for SizeBuckets {
    fn default() -> Self {
        Self::new(32, usize::MAX)
    }
}

impl AllocationStrategy for SizeBuckets {
    fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    fn initial_capacity(&self, payload_len: usize) -> usize {
        let bucket = payload_len
            .max(self.min_bucket)
            .checked_next_power_of_two()
            .unwrap_or(usize::MAX);
        bucket.min(self.max_capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_fit() {
        let strategy = ExactFit::default();
        assert_eq!(strategy.initial_capacity(0), 0);
        assert_eq!(strategy.initial_capacity(5), 5);
        assert_eq!(strategy.relocation_capacity(13, 5), 13);
    }

    #[test]
    fn test_fixed_percent() {
        let strategy = FixedPercent::new(16, 50, 1000);
        assert_eq!(strategy.initial_capacity(4), 16);
        assert_eq!(strategy.initial_capacity(100), 150);
        assert_eq!(strategy.initial_capacity(900), 1000);
        // Relocation grows from the old capacity when that is larger
        assert_eq!(strategy.relocation_capacity(110, 100), 165);
        assert_eq!(strategy.relocation_capacity(200, 100), 300);
    }

    #[test]
    fn test_size_buckets() {
        let strategy = SizeBuckets::new(32, 4096);
        assert_eq!(strategy.initial_capacity(0), 32);
        assert_eq!(strategy.initial_capacity(33), 64);
        assert_eq!(strategy.initial_capacity(64), 64);
        assert_eq!(strategy.initial_capacity(3000), 4096);
        assert_eq!(strategy.initial_capacity(5000), 4096);
    }

    #[test]
    fn test_strategies_never_undershoot_within_max() {
        let strategies: Vec<Box<dyn AllocationStrategy>> = vec![
            Box::new(ExactFit::new(2000)),
            Box::new(FixedPercent::new(8, 25, 2000)),
            Box::new(SizeBuckets::new(16, 2000)),
        ];
        for strategy in &strategies {
            for len in [0, 1, 7, 100, 1023, 2000] {
                assert!(strategy.initial_capacity(len) >= len, "{strategy:?} at {len}");
                assert!(strategy.relocation_capacity(len, len / 2) >= len, "{strategy:?} at {len}");
            }
        }
    }
}
