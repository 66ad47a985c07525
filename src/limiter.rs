use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::sleep;

use crate::Result;
use crate::error::Error;
use crate::util::lock_unpoisoned;

/// Caller-chosen tag selecting which rate-limit bucket governs a call.
///
/// The tag carries no data of its own; it is purely a key into the active
/// [`Limiter`]. Exchange crates needing more buckets than the built-in
/// authenticated/unauthenticated split use [`EndpointLimit::Custom`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum EndpointLimit {
    #[default]
    Unset,
    Auth,
    UnAuth,
    Custom(u16),
}

/// Admission capability consulted before every outbound call.
///
/// `limit` suspends until one admission token for `endpoint` is available.
/// Cancellation is dropping the future; the executor bounds the wait with the
/// caller's deadline. Implementations that key on the classification must
/// fail fast with [`Error::EndpointLimitNotFound`] for tags they have no
/// bucket for, never treat them as unlimited.
#[async_trait]
pub trait Limiter: Send + Sync {
    async fn limit(&self, endpoint: EndpointLimit) -> Result<()>;
}

/// Token bucket refilled at `count / interval` tokens per second.
///
/// A zero `count` or zero `interval` means unlimited: `wait` never suspends
/// and no refill arithmetic runs, so the degenerate configurations cannot
/// divide by zero.
#[derive(Debug)]
pub struct RateLimit {
    rate: Option<f64>,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_at: Instant,
}

impl RateLimit {
    pub fn new(interval: Duration, count: u32) -> Self {
        let rate = if interval.is_zero() || count == 0 {
            None
        } else {
            Some(f64::from(count) / interval.as_secs_f64())
        };
        let burst = f64::from(count.max(1));
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill_at: Instant::now(),
            }),
        }
    }

    /// Configured refill rate in tokens per second; `None` when unlimited.
    pub fn rate(&self) -> Option<f64> {
        self.rate
    }

    pub(crate) async fn wait(&self) {
        let Some(rate) = self.rate else {
            return;
        };

        loop {
            let delay = {
                let mut state = lock_unpoisoned(&self.state);
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill_at).as_secs_f64();
                state.last_refill_at = now;
                state.tokens = (state.tokens + elapsed * rate).min(self.burst);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / rate)
            };
            sleep(delay).await;
        }
    }
}

/// Applies one shared bucket to every call, ignoring the classification.
///
/// Used for exchanges with a single global ceiling.
#[derive(Debug)]
pub struct BasicRateLimiter {
    bucket: RateLimit,
}

impl BasicRateLimiter {
    pub fn new(interval: Duration, count: u32) -> Self {
        Self {
            bucket: RateLimit::new(interval, count),
        }
    }
}

#[async_trait]
impl Limiter for BasicRateLimiter {
    async fn limit(&self, _endpoint: EndpointLimit) -> Result<()> {
        self.bucket.wait().await;
        Ok(())
    }
}

/// Holds one token bucket per endpoint classification.
#[derive(Debug, Default)]
pub struct EndpointRateLimiter {
    buckets: HashMap<EndpointLimit, RateLimit>,
}

impl EndpointRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(mut self, endpoint: EndpointLimit, bucket: RateLimit) -> Self {
        self.buckets.insert(endpoint, bucket);
        self
    }
}

#[async_trait]
impl Limiter for EndpointRateLimiter {
    async fn limit(&self, endpoint: EndpointLimit) -> Result<()> {
        match self.buckets.get(&endpoint) {
            Some(bucket) => {
                bucket.wait().await;
                Ok(())
            }
            None => Err(Error::EndpointLimitNotFound { endpoint }),
        }
    }
}

/// Installed when no limiter is configured, and stood in for the configured
/// limiter while rate limiting is disabled.
#[derive(Debug, Default)]
pub(crate) struct Unlimited;

#[async_trait]
impl Limiter for Unlimited {
    async fn limit(&self, _endpoint: EndpointLimit) -> Result<()> {
        Ok(())
    }
}
