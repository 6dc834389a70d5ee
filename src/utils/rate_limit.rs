//! Lock-free token bucket rate limiter.
//!
//! Implemented as GCRA (generic cell rate algorithm): the bucket state is a single
//! "theoretical arrival time" stored in an `AtomicU64`, so concurrent callers never
//! take a lock. A bucket of `burst` tokens refilled at `rate` tokens per second
//! admits exactly the same traffic as the classic counter-based token bucket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Per-connection token bucket
#[derive(Debug)]
pub struct RateLimiter {
    origin: Instant,
    /// Nanoseconds between two tokens
    interval: u64,
    /// How far the arrival time may run ahead of now: (burst - 1) * interval
    tolerance: u64,
    tat: AtomicU64,
    enabled: bool,
}

impl RateLimiter {
    /// `rate` tokens per second with a bucket of `burst` tokens. A rate of zero
    /// (or below) disables limiting.
    pub fn new(rate: f64, burst: u32) -> Self {
        let enabled = rate > 0.0 && rate.is_finite();
        let interval = if enabled {
            ((NANOS_PER_SEC / rate) as u64).max(1)
        } else {
            0
        };
        let burst = u64::from(burst.max(1));
        Self {
            origin: Instant::now(),
            interval,
            tolerance: interval.saturating_mul(burst - 1),
            tat: AtomicU64::new(0),
            enabled,
        }
    }

    /// A limiter that admits everything
    pub fn unlimited() -> Self {
        Self::new(0.0, 1)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Take one token if available. Never blocks.
    pub fn try_acquire(&self) -> bool {
        if !self.enabled {
            return true;
        }
        let now = self.origin.elapsed().as_nanos() as u64;
        let mut tat = self.tat.load(Ordering::Acquire);
        loop {
            let base = tat.max(now);
            if base - now > self.tolerance {
                return false;
            }
            let next = base.saturating_add(self.interval);
            match self
                .tat
                .compare_exchange_weak(tat, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => tat = actual,
            }
        }
    }
}
