//! Composite token-bucket rate limiting
//!
//! Built on `governor` direct (unkeyed) limiters. A [`MultiRateLimiter`] is a
//! flattened sequence of leaf buckets: admission requires every leaf to allow,
//! and byte waits run sequentially through the leaves.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use thiserror::Error;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum RateLimitError {
    /// A single wait asked for more tokens than the bucket can ever hold.
    #[error("requested {requested} tokens exceeds bucket capacity")]
    InsufficientCapacity { requested: usize },
}

/// A sequence of leaf token buckets acting as one limiter.
///
/// Leaves are shared: merging copies references, so a merged view consumes
/// tokens from the same buckets as the original. An empty limiter allows
/// everything.
#[derive(Default)]
pub struct MultiRateLimiter {
    limiters: Vec<Arc<DirectLimiter>>,
}

impl MultiRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a leaf bucket refilling at `rate_per_sec` with the given burst.
    ///
    /// Non-positive rates are ignored; config validation rejects them before
    /// this point.
    pub fn add(&mut self, rate_per_sec: f64, burst: f64) {
        let Some(quota) = quota(rate_per_sec, burst) else {
            return;
        };
        self.limiters.push(Arc::new(RateLimiter::direct(quota)));
    }

    /// Flatten another composite limiter's leaves into this one, sharing
    /// their token state.
    pub fn merge(&mut self, other: &MultiRateLimiter) {
        self.limiters.extend(other.limiters.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Non-blocking admission check. Every leaf must allow; a refusing leaf
    /// does not refund tokens already taken from earlier leaves.
    pub fn allow(&self) -> bool {
        let mut allowed = true;
        for limiter in &self.limiters {
            allowed = limiter.check().is_ok() && allowed;
        }
        allowed
    }

    /// Wait until all leaves have `n` tokens available, consuming them.
    ///
    /// Cancellation happens by dropping the future, which the per-request
    /// deadline does for us.
    pub async fn wait_n(&self, n: usize) -> Result<(), RateLimitError> {
        let Some(tokens) = NonZeroU32::new(u32::try_from(n).unwrap_or(u32::MAX)) else {
            return Ok(());
        };
        for limiter in &self.limiters {
            limiter
                .until_n_ready(tokens)
                .await
                .map_err(|_| RateLimitError::InsufficientCapacity { requested: n })?;
        }
        Ok(())
    }
}

/// Build a quota from a fractional rate and burst, or `None` when unusable.
fn quota(rate_per_sec: f64, burst: f64) -> Option<Quota> {
    if !rate_per_sec.is_finite() || rate_per_sec <= 0.0 {
        return None;
    }
    let period = Duration::from_secs_f64(1.0 / rate_per_sec);
    let burst = burst.max(1.0).min(f64::from(u32::MAX)) as u32;
    let burst = NonZeroU32::new(burst.max(1))?;
    Quota::with_period(period).map(|q| q.allow_burst(burst))
}

/// Traffic limiter from `(avg MiB/s, burst MiB, max MiB/s)`.
///
/// One leaf at the average rate (burst defaults to `min(avg, 1)` MiB) and one
/// leaf at the max rate with burst equal to one second of it. Unset entries
/// are omitted.
pub fn create_traffic_rate_limiter(
    avg_mibps: Option<f64>,
    burst_mib: Option<f64>,
    max_mibps: Option<f64>,
) -> MultiRateLimiter {
    let mut limiter = MultiRateLimiter::new();
    if let Some(avg) = avg_mibps {
        let burst = burst_mib.unwrap_or_else(|| avg.min(1.0));
        limiter.add(avg * BYTES_PER_MIB, burst * BYTES_PER_MIB);
    }
    if let Some(max) = max_mibps {
        limiter.add(max * BYTES_PER_MIB, max * BYTES_PER_MIB);
    }
    limiter
}

/// Request-rate limiter from per-second / per-minute / per-hour counts.
pub fn create_request_rate_limiter(
    qps: Option<f64>,
    qpm: Option<f64>,
    qph: Option<f64>,
) -> MultiRateLimiter {
    let mut limiter = MultiRateLimiter::new();
    if let Some(qps) = qps {
        limiter.add(qps, qps);
    }
    if let Some(qpm) = qpm {
        limiter.add(qpm / 60.0, qpm);
    }
    if let Some(qph) = qph {
        limiter.add(qph / 60.0 / 60.0, qph);
    }
    limiter
}
