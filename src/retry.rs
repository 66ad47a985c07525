use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;
use http::{HeaderMap, StatusCode};
use rand::Rng;
use thiserror::Error;

use crate::error::{BoxError, Error as RequestError};
use crate::util::parse_retry_after;

const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);
const DEFAULT_MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// One transport attempt as seen by the retry policy.
///
/// Exactly one of the two sides is populated: a response (status plus
/// headers) or the attempt's transport-level error.
#[derive(Debug)]
pub struct Attempt<'a> {
    pub status: Option<StatusCode>,
    pub headers: Option<&'a HeaderMap>,
    pub error: Option<&'a RequestError>,
}

/// Decides whether a failed attempt should be retried.
///
/// `Ok(true)` retries after backoff. `Ok(false)` accepts the response as the
/// terminal outcome — status interpretation belongs to the caller, so a
/// non-retryable response is decoded, not errored. `Err(cause)` aborts the
/// call immediately; the executor surfaces the cause wrapped in
/// [`RequestError::RetryAborted`].
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, attempt: &Attempt<'_>) -> std::result::Result<bool, BoxError>;
}

/// Why the default policy refused to honor a `Retry-After` header.
#[derive(Debug, Error)]
pub enum RetryAfterRejection {
    #[error("retry-after value {value:?} does not parse as a wait")]
    Unparseable { value: String },
    #[error("retry-after wait of {}s exceeds the {}s cap", .wait.as_secs(), .cap.as_secs())]
    ExceedsCap { wait: Duration, cap: Duration },
}

/// Retries transport failures and HTTP 429/5xx responses.
///
/// A response carrying `Retry-After` stays retryable only while the header
/// parses (delta-seconds or HTTP-date) to a wait within `max_retry_after`;
/// anything else is treated as non-recoverable and aborts the call rather
/// than retrying forever.
#[derive(Clone, Copy, Debug)]
pub struct DefaultRetryPolicy {
    max_retry_after: Duration,
}

impl DefaultRetryPolicy {
    pub const fn standard() -> Self {
        Self {
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
        }
    }

    pub const fn max_retry_after(mut self, max_retry_after: Duration) -> Self {
        self.max_retry_after = max_retry_after;
        self
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry(&self, attempt: &Attempt<'_>) -> std::result::Result<bool, BoxError> {
        if let Some(error) = attempt.error {
            return Ok(matches!(
                error,
                RequestError::Transport { .. }
                    | RequestError::Timeout { .. }
                    | RequestError::ReadBody { .. }
            ));
        }

        let Some(status) = attempt.status else {
            return Ok(false);
        };
        if status != StatusCode::TOO_MANY_REQUESTS && !status.is_server_error() {
            return Ok(false);
        }

        let Some(headers) = attempt.headers else {
            return Ok(true);
        };
        let Some(raw_value) = headers.get(RETRY_AFTER) else {
            return Ok(true);
        };
        match parse_retry_after(headers, SystemTime::now()) {
            Some(wait) if wait <= self.max_retry_after => Ok(true),
            Some(wait) => Err(Box::new(RetryAfterRejection::ExceedsCap {
                wait,
                cap: self.max_retry_after,
            })),
            None => Err(Box::new(RetryAfterRejection::Unparseable {
                value: String::from_utf8_lossy(raw_value.as_bytes()).into_owned(),
            })),
        }
    }
}

/// Wait inserted before retry attempt `attempt + 1`; attempts are 1-based.
///
/// A policy returning `Duration::ZERO` retries immediately.
pub type BackoffFn = Box<dyn Fn(u32) -> Duration + Send + Sync>;

/// Exponential backoff doubling from 100ms to a 2s cap, with equal jitter.
pub fn default_backoff() -> BackoffFn {
    Box::new(|attempt| {
        let capped_exponent = attempt.saturating_sub(1).min(31);
        let base_ms = DEFAULT_BASE_BACKOFF.as_millis() as u64;
        let max_ms = DEFAULT_MAX_BACKOFF.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1_u64 << capped_exponent).min(max_ms);
        if delay_ms <= 1 {
            return Duration::from_millis(delay_ms);
        }
        let mut rng = rand::rng();
        Duration::from_millis(rng.random_range(delay_ms / 2..=delay_ms))
    })
}
