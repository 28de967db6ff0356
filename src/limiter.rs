//! Lazy token-bucket rate limiting
//!
//! No background timer: each check refills from the elapsed time first,
//! then tests. Atomicity with respect to concurrent admissions comes from
//! the queue core's lock; the buckets themselves are plain state.

use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use crate::config::QueueConfig;

/// One token bucket. A bucket with `rate_per_min <= 0` is unlimited: it
/// always allows and never reports exhaustion.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_min: f64, burst: u32) -> Self {
        Self {
            capacity: f64::from(burst),
            tokens: f64::from(burst),
            rate_per_sec: rate_per_min / 60.0,
            last_refill: Instant::now(),
        }
    }

    /// An unlimited bucket (no configured rate for this scope).
    pub fn unlimited() -> Self {
        Self::new(0.0, 0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate_per_sec <= 0.0
    }

    fn refill(&mut self, now: Instant) {
        if self.is_unlimited() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Whether `cost` tokens are available at `now`, refilling first.
    /// Does not consume.
    pub fn peek_at(&mut self, now: Instant, cost: f64) -> bool {
        if self.is_unlimited() {
            return true;
        }
        self.refill(now);
        self.tokens >= cost
    }

    /// Consume `cost` tokens. Callers must have just seen `peek_at` succeed
    /// under the same lock.
    pub fn take(&mut self, cost: f64) {
        if self.is_unlimited() {
            return;
        }
        self.tokens -= cost;
    }

    /// Check-and-consume in one step.
    pub fn allow_at(&mut self, now: Instant, cost: f64) -> bool {
        if self.peek_at(now, cost) {
            self.take(cost);
            true
        } else {
            false
        }
    }

    /// Check-and-consume one token at the current time.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now(), 1.0)
    }
}

/// The global bucket plus one bucket per configured endpoint. Endpoints
/// without an entry are unlimited on their own scope (the global bucket
/// still applies).
#[derive(Debug)]
pub struct LimiterSet {
    global: TokenBucket,
    endpoints: HashMap<String, TokenBucket>,
}

impl LimiterSet {
    pub fn from_config(config: &QueueConfig) -> Self {
        let endpoints = config
            .endpoint_rates
            .iter()
            .map(|(endpoint, rate)| {
                (
                    endpoint.clone(),
                    TokenBucket::new(rate.rate_per_min, rate.burst),
                )
            })
            .collect();
        Self {
            global: TokenBucket::new(config.global_rate_per_min, config.global_burst),
            endpoints,
        }
    }

    /// Check both the global scope and the endpoint scope, consuming from
    /// both only when both allow. An admission blocked by its endpoint must
    /// not burn a global token, or unrelated endpoints would starve.
    pub fn admit_at(&mut self, endpoint: &str, now: Instant) -> bool {
        let global_ok = self.global.peek_at(now, 1.0);
        let endpoint_ok = match self.endpoints.get_mut(endpoint) {
            Some(bucket) => bucket.peek_at(now, 1.0),
            None => true,
        };

        if !(global_ok && endpoint_ok) {
            debug!(endpoint, global_ok, endpoint_ok, "Rate limiter denied admission");
            return false;
        }

        self.global.take(1.0);
        if let Some(bucket) = self.endpoints.get_mut(endpoint) {
            bucket.take(1.0);
        }
        true
    }

    /// Whether the global scope would deny any admission right now.
    pub fn global_blocked_at(&mut self, now: Instant) -> bool {
        !self.global.peek_at(now, 1.0)
    }
}
