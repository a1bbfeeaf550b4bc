//! # Request Duration Model
//!
//! Produces one randomized service time per request from three percentile
//! tiers plus a percentage variance. The random source is pluggable so tests
//! can script the draws.

use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of uniform integers in `[0, max)`
pub trait RandomSource: Send + Sync {
    /// Draw a uniform integer below `max`; `max` is always greater than zero
    fn below(&self, max: u32) -> u32;
}

/// Thread-local entropy, the default source
#[derive(Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn below(&self, max: u32) -> u32 {
        rand::thread_rng().gen_range(0..max)
    }
}

/// Deterministic source seeded once at startup
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn below(&self, max: u32) -> u32 {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0..max),
            // a poisoned lock still holds a usable generator
            Err(poisoned) => poisoned.into_inner().gen_range(0..max),
        }
    }
}

/// Calculates randomised request durations
pub struct RequestDuration {
    percentile50: Duration,
    percentile90: Duration,
    percentile99: Duration,
    /// random variance for the request as a percentage of the tier
    variance: u32,
    random: Box<dyn RandomSource>,
}

impl std::fmt::Debug for RequestDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDuration")
            .field("percentile50", &self.percentile50)
            .field("percentile90", &self.percentile90)
            .field("percentile99", &self.percentile99)
            .field("variance", &self.variance)
            .finish()
    }
}

impl RequestDuration {
    /// Create a new duration model
    ///
    /// An unset (zero) tier inherits the tier below it, so configuring only
    /// the median gives a flat distribution.
    pub fn new(percentile50: Duration, percentile90: Duration, percentile99: Duration, variance: i64) -> Self {
        let percentile90 = if percentile90.is_zero() { percentile50 } else { percentile90 };
        let percentile99 = if percentile99.is_zero() { percentile90 } else { percentile99 };

        Self {
            percentile50,
            percentile90,
            percentile99,
            variance: u32::try_from(variance.max(0)).unwrap_or(u32::MAX),
            random: Box::new(ThreadRandom),
        }
    }

    /// Replace the random source
    pub fn with_random_source(mut self, random: impl RandomSource + 'static) -> Self {
        self.random = Box::new(random);
        self
    }

    /// Draw a new random request duration
    pub fn sample(&self) -> Duration {
        let tier = match self.random.below(100) {
            p if p < 90 => self.percentile50,
            p if p < 99 => self.percentile90,
            _ => self.percentile99,
        };

        let variance = if self.variance > 0 {
            self.random.below(self.variance)
        } else {
            0
        };

        let inflation = (tier / 100).saturating_mul(variance);
        tier.saturating_add(inflation)
    }

    pub fn percentiles(&self) -> (Duration, Duration, Duration) {
        (self.percentile50, self.percentile90, self.percentile99)
    }
}
