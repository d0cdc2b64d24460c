//! A single token bucket.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::types::duration_ms;

/// Configuration of one named resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub resource_type: String,
    /// Maximum tokens the bucket can hold.
    pub max_tokens: u32,
    /// Tokens added per refill interval.
    pub refill_rate: u32,
    /// Cap on tokens recovered in a single refill pass.
    pub burst_size: u32,
    #[serde(with = "duration_ms")]
    pub refill_interval: Duration,
}

impl ResourceConfig {
    /// A resource refilled once per second.
    pub fn per_second(resource_type: impl Into<String>, max_tokens: u32, refill_rate: u32) -> Self {
        Self {
            resource_type: resource_type.into(),
            max_tokens,
            refill_rate,
            burst_size: max_tokens,
            refill_interval: Duration::from_secs(1),
        }
    }

    /// Set the burst cap.
    #[must_use]
    pub fn burst(mut self, burst_size: u32) -> Self {
        self.burst_size = burst_size;
        self
    }

    /// Set the refill interval.
    #[must_use]
    pub fn refill_interval(mut self, interval: Duration) -> Self {
        self.refill_interval = interval;
        self
    }
}

/// Usage statistics for one bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketStats {
    pub total_requests: u64,
    pub granted: u64,
    pub success_rate: f64,
    pub tokens_dispensed: u64,
    pub current_tokens: u32,
    pub max_tokens: u32,
    /// Fraction of capacity currently handed out (0.0-1.0).
    pub utilization: f64,
}

/// Token bucket state for one resource type. Callers serialize access; the
/// manager wraps each bucket in its own lock.
#[derive(Debug)]
pub struct TokenBucket {
    config: ResourceConfig,
    current: u32,
    last_refill: Instant,
    total_requests: u64,
    granted: u64,
    dispensed: u64,
}

impl TokenBucket {
    /// A new bucket starts full.
    pub fn new(config: ResourceConfig) -> Self {
        let current = config.max_tokens;
        Self {
            config,
            current,
            last_refill: Instant::now(),
            total_requests: 0,
            granted: 0,
            dispensed: 0,
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// Add tokens for every whole interval elapsed since the last refill.
    ///
    /// The per-pass gain is capped by `burst_size`, the level by
    /// `max_tokens`. `last_refill` advances only by the intervals actually
    /// consumed, so sub-interval remainders are never lost to drift.
    pub fn refill(&mut self, now: Instant) {
        let interval = self.config.refill_interval;
        if interval.is_zero() || self.config.refill_rate == 0 {
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        let intervals = (elapsed.as_nanos() / interval.as_nanos()) as u32;
        if intervals == 0 {
            return;
        }

        let earned = intervals.saturating_mul(self.config.refill_rate);
        let added = earned.min(self.config.burst_size);
        self.current = self
            .current
            .saturating_add(added)
            .min(self.config.max_tokens);
        self.last_refill += interval * intervals;
    }

    /// Record a request and try to take `tokens` after refilling.
    pub fn try_take(&mut self, tokens: u32, now: Instant) -> bool {
        self.total_requests += 1;
        self.refill(now);
        if self.current < tokens {
            return false;
        }
        self.current -= tokens;
        self.granted += 1;
        self.dispensed += u64::from(tokens);
        true
    }

    /// Return tokens to the bucket, clamped at `max_tokens`.
    pub fn give_back(&mut self, tokens: u32) {
        self.current = self
            .current
            .saturating_add(tokens)
            .min(self.config.max_tokens);
    }

    /// Count a request that was denied before reaching the bucket level
    /// check (quota rejections).
    pub fn count_denied_request(&mut self) {
        self.total_requests += 1;
    }

    pub fn stats(&self) -> BucketStats {
        let success_rate = if self.total_requests > 0 {
            self.granted as f64 / self.total_requests as f64
        } else {
            0.0
        };
        let utilization = if self.config.max_tokens > 0 {
            1.0 - f64::from(self.current) / f64::from(self.config.max_tokens)
        } else {
            0.0
        };
        BucketStats {
            total_requests: self.total_requests,
            granted: self.granted,
            success_rate,
            tokens_dispensed: self.dispensed,
            current_tokens: self.current,
            max_tokens: self.config.max_tokens,
            utilization,
        }
    }
}
