//! Accounting rate limiter.
//!
//! Records per-priority byte and request counters and hands every request
//! its full byte count back; it never actually sleeps. The library-side
//! limiter installed at open is separate.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use super::task::IoPriority;

#[derive(Debug, Default)]
struct Counters {
    bytes: AtomicU64,
    requests: AtomicU64,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    low: Counters,
    high: Counters,
    bytes_per_sec: AtomicI64,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: i64) -> Self {
        let limiter = RateLimiter::default();
        limiter.bytes_per_sec.store(bytes_per_sec, Ordering::Relaxed);
        limiter
    }

    fn counters(&self, prio: IoPriority) -> &Counters {
        match prio {
            IoPriority::Low => &self.low,
            IoPriority::High => &self.high,
        }
    }

    /// Account for a request of `bytes` at `prio`; returns the full
    /// amount (nothing is withheld).
    pub fn request_token(&self, bytes: u64, prio: IoPriority) -> u64 {
        let counters = self.counters(prio);
        counters.bytes.fetch_add(bytes, Ordering::Relaxed);
        counters.requests.fetch_add(1, Ordering::Relaxed);
        bytes
    }

    pub fn total_bytes(&self, prio: IoPriority) -> u64 {
        self.counters(prio).bytes.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self, prio: IoPriority) -> u64 {
        self.counters(prio).requests.load(Ordering::Relaxed)
    }

    /// Record a new rate. Only bookkeeping; throttling stays off.
    pub fn set_bytes_per_second(&self, rate: i64) {
        self.bytes_per_sec.store(rate, Ordering::Relaxed);
    }

    pub fn bytes_per_second(&self) -> i64 {
        self.bytes_per_sec.load(Ordering::Relaxed)
    }
}
