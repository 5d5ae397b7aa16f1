//! # Requeue Rate Limiting
//!
//! Retry delays are computed by a [`Backoff`] strategy from the key and the
//! number of consecutive failures recorded for it. The controller combines a
//! per-key exponential backoff with a token bucket shared by every key, and
//! waits for whichever of the two asks for longer.

use crate::tasks::config::QueueConfig;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Strategy deciding how long a key waits before its next attempt
pub trait Backoff<K>: Send + Sync {
    fn delay(&self, key: &K, failures: u32) -> Duration;
}

/// `base * 2^failures`, capped at `cap`
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }
}

impl<K> Backoff<K> for ExponentialBackoff {
    fn delay(&self, _key: &K, failures: u32) -> Duration {
        1u32.checked_shl(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refreshed: Instant,
}

/// Token bucket shared by all keys: `burst` immediate admissions, refilled at
/// `qps` tokens per second. Each call reserves one token and returns how long
/// the caller must wait for it.
#[derive(Debug)]
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                refreshed: Instant::now(),
            }),
        }
    }

    pub fn reserve(&self) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.refreshed).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.refreshed = now;
        state.tokens -= 1.0;

        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.qps)
        }
    }
}

impl<K> Backoff<K> for TokenBucket {
    fn delay(&self, _key: &K, _failures: u32) -> Duration {
        self.reserve()
    }
}

/// Longest delay of two strategies
pub struct MaxOf<A, B> {
    first: A,
    second: B,
}

impl<A, B> MaxOf<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<K, A: Backoff<K>, B: Backoff<K>> Backoff<K> for MaxOf<A, B> {
    fn delay(&self, key: &K, failures: u32) -> Duration {
        self.first
            .delay(key, failures)
            .max(self.second.delay(key, failures))
    }
}

/// Tracks consecutive failures per key and turns them into requeue delays
pub struct RateLimiter<K: Eq + Hash> {
    strategy: Box<dyn Backoff<K>>,
    failures: DashMap<K, u32>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> RateLimiter<K> {
    pub fn new(strategy: impl Backoff<K> + 'static) -> Self {
        Self {
            strategy: Box::new(strategy),
            failures: DashMap::new(),
        }
    }

    /// Exponential per-key backoff combined with the shared token bucket.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(MaxOf::new(
            ExponentialBackoff::new(config.base_delay(), config.max_delay()),
            TokenBucket::new(config.qps, config.burst),
        ))
    }

    /// Record a failure for `key` and return how long it should wait.
    pub fn when(&self, key: &K) -> Duration {
        let failures = {
            let mut entry = self.failures.entry(key.clone()).or_insert(0);
            let previous = *entry;
            *entry = previous.saturating_add(1);
            previous
        };
        let delay = self.strategy.delay(key, failures);
        debug!(?key, failures = failures + 1, ?delay, "Computed requeue delay");
        delay
    }

    /// Clear the failure history of `key` after it succeeded.
    pub fn forget(&self, key: &K) {
        self.failures.remove(key);
    }

    pub fn retries(&self, key: &K) -> u32 {
        self.failures.get(key).map_or(0, |entry| *entry)
    }
}
