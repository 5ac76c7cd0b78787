//! Per-source token buckets checked right after the blacklist.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::canonical_ip;

pub const DEFAULT_RATE: f64 = 60.0;
pub const DEFAULT_BURST: f64 = 5.0;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket keyed by source IP.
///
/// A fresh source starts full at `rate + burst` tokens and refills
/// continuously at `rate` tokens per second up to that same cap.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<IpAddr, Bucket>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            rate,
            burst,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.rate + self.burst
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    pub fn allow_at(&self, ip: IpAddr, now: Instant) -> bool {
        let capacity = self.capacity();
        let mut bucket = self
            .buckets
            .entry(canonical_ip(ip))
            .or_insert(Bucket {
                tokens: capacity,
                last_refill: now,
            });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(capacity);
        if now > bucket.last_refill {
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently stored for `ip`, without refilling.
    pub fn tokens(&self, ip: IpAddr) -> Option<f64> {
        self.buckets
            .get(&canonical_ip(ip))
            .map(|bucket| bucket.tokens)
    }

    /// Drops buckets that would be full again and have been idle for `idle`.
    pub fn sweep_idle(&self, idle: Duration, now: Instant) -> usize {
        let capacity = self.capacity();
        let rate = self.rate;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let elapsed = now.saturating_duration_since(bucket.last_refill);
            let projected = bucket.tokens + elapsed.as_secs_f64() * rate;
            !(elapsed >= idle && projected >= capacity)
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_BURST)
    }
}
