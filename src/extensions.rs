use std::sync::Mutex;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::util::lock_unpoisoned;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Source of the multiplicative jitter factor applied to backoff delays.
///
/// Implementations must return a value in `[0.5, 1.5)`.
pub trait JitterSource: Send + Sync {
    fn jitter_factor(&self) -> f64;
}

#[derive(Debug, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn jitter_factor(&self) -> f64 {
        rand::rng().random_range(0.5..1.5)
    }
}

#[derive(Debug)]
pub struct SeededJitter {
    rng: Mutex<StdRng>,
}

impl SeededJitter {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl JitterSource for SeededJitter {
    fn jitter_factor(&self) -> f64 {
        lock_unpoisoned(&self.rng).random_range(0.5..1.5)
    }
}

#[cfg(test)]
mod tests {
    use super::{JitterSource, SeededJitter, ThreadRngJitter};

    #[test]
    fn seeded_jitter_is_reproducible() {
        let first = SeededJitter::new(7);
        let second = SeededJitter::new(7);
        for _ in 0..32 {
            assert_eq!(first.jitter_factor(), second.jitter_factor());
        }
    }

    #[test]
    fn jitter_factors_stay_in_range() {
        let seeded = SeededJitter::new(42);
        for _ in 0..512 {
            let factor = seeded.jitter_factor();
            assert!((0.5..1.5).contains(&factor));
            let factor = ThreadRngJitter.jitter_factor();
            assert!((0.5..1.5).contains(&factor));
        }
    }
}
