use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use tokio::time::{sleep, timeout_at};
use tracing::{debug, trace, warn};

use crate::Result;
use crate::error::{BoxError, Error};
use crate::item::{Item, PreparedRequest};
use crate::jobs::{DEFAULT_MAX_REQUEST_JOBS, JobTracker};
use crate::limiter::{EndpointLimit, Limiter, Unlimited};
use crate::metrics::{RequesterMetrics, RequesterMetricsSnapshot};
use crate::nonce::{Nonce, NonceSource};
use crate::retry::{Attempt, BackoffFn, DefaultRetryPolicy, RetryPolicy, default_backoff};
use crate::transport::{Transport, TransportCallError};
use crate::util::{
    bounded_retry_delay, classify_transport_error, lock_unpoisoned, parse_retry_after,
    phase_timeout, truncate_body,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;
const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 10;
const DEFAULT_USER_AGENT: &str = concat!("reqgate/", env!("CARGO_PKG_VERSION"));

pub struct RequesterBuilder {
    name: String,
    user_agent: String,
    request_timeout: Duration,
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    max_response_body_bytes: usize,
    limiter: Option<Arc<dyn Limiter>>,
    retry_policy: Arc<dyn RetryPolicy>,
    backoff: BackoffFn,
    max_retry_attempts: u32,
    max_request_jobs: u32,
}

impl RequesterBuilder {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            limiter: None,
            retry_policy: Arc::new(DefaultRetryPolicy::standard()),
            backoff: default_backoff(),
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            max_request_jobs: DEFAULT_MAX_REQUEST_JOBS,
        }
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Per-attempt timeout covering the transport call and the body read.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host.max(1);
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn limiter(mut self, limiter: Arc<dyn Limiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn backoff<F>(mut self, backoff: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.backoff = Box::new(backoff);
        self
    }

    pub fn max_retry_attempts(mut self, max_retry_attempts: u32) -> Self {
        self.max_retry_attempts = max_retry_attempts.max(1);
        self
    }

    /// Ceiling on concurrently in-flight calls; zero declines every call.
    pub fn max_request_jobs(mut self, max_request_jobs: u32) -> Self {
        self.max_request_jobs = max_request_jobs;
        self
    }

    pub fn try_build(self) -> Result<Requester> {
        let transport = Transport::new(
            self.connect_timeout,
            self.pool_idle_timeout,
            self.pool_max_idle_per_host,
        )?;
        Ok(Requester {
            name: self.name,
            user_agent: self.user_agent,
            request_timeout: self.request_timeout,
            max_response_body_bytes: self.max_response_body_bytes,
            transport,
            limiter: self.limiter.unwrap_or_else(|| Arc::new(Unlimited)),
            limiter_disabled: AtomicBool::new(false),
            retry_policy: self.retry_policy,
            backoff: self.backoff,
            max_retry_attempts: self.max_retry_attempts,
            jobs: JobTracker::new(self.max_request_jobs),
            nonce: NonceSource::default(),
            metrics: RequesterMetrics::default(),
        })
    }

    pub fn build(self) -> Requester {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build reqgate requester: {error}"))
    }
}

/// Concurrency-safe request executor for one exchange API.
///
/// One `Requester` is created per logical API client and lives for the
/// process. It owns the transport, the active rate limiter, the retry and
/// backoff policies, the in-flight job ceiling, and the nonce counters; all
/// of them are safe to drive from any number of tasks at once.
pub struct Requester {
    name: String,
    user_agent: String,
    request_timeout: Duration,
    max_response_body_bytes: usize,
    transport: Transport,
    limiter: Arc<dyn Limiter>,
    limiter_disabled: AtomicBool,
    retry_policy: Arc<dyn RetryPolicy>,
    backoff: BackoffFn,
    max_retry_attempts: u32,
    jobs: JobTracker,
    nonce: NonceSource,
    metrics: RequesterMetrics,
}

impl Requester {
    pub fn builder(name: impl Into<String>) -> RequesterBuilder {
        RequesterBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Executes one logical call without an overall deadline.
    ///
    /// See [`send_payload_with_deadline`](Self::send_payload_with_deadline).
    pub async fn send_payload<G>(&self, endpoint: EndpointLimit, generate: G) -> Result<()>
    where
        G: FnOnce() -> std::result::Result<Item, BoxError> + Send,
    {
        self.send_payload_with_deadline(None, endpoint, generate)
            .await
    }

    /// Executes one logical call: admits a job slot, waits on the rate
    /// limiter for `endpoint`, and only then invokes `generate` — so a nonce
    /// or signature minted inside the generator reflects the actual send
    /// time. The resulting descriptor is validated and executed under the
    /// retry/backoff policy; on the terminal response the decode and
    /// header-passback targets are populated.
    ///
    /// `deadline` bounds the limiter wait, every attempt, and every backoff
    /// sleep; expiry surfaces [`Error::DeadlineExceeded`], which always takes
    /// precedence over the retry ceiling.
    pub async fn send_payload_with_deadline<G>(
        &self,
        deadline: Option<Instant>,
        endpoint: EndpointLimit,
        generate: G,
    ) -> Result<()>
    where
        G: FnOnce() -> std::result::Result<Item, BoxError> + Send,
    {
        self.metrics.record_request_started();
        let result = self.run(deadline, endpoint, generate).await;
        self.metrics.record_outcome(&result);
        result
    }

    /// Next strictly increasing nonce (Unix nanoseconds, tie-broken).
    pub fn get_nonce(&self) -> Nonce {
        self.nonce.next()
    }

    /// Next strictly increasing millisecond-resolution nonce.
    pub fn get_nonce_milli(&self) -> i64 {
        self.nonce.next_milli()
    }

    /// Installs `proxy` on the transport. An empty or unparseable URL is
    /// rejected and the previous transport configuration stays in place.
    pub fn set_proxy(&self, proxy: &str) -> Result<()> {
        let trimmed = proxy.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidProxy {
                proxy: proxy.to_owned(),
            });
        }
        let uri: Uri = trimmed.parse().map_err(|_| Error::InvalidProxy {
            proxy: proxy.to_owned(),
        })?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(Error::InvalidProxy {
                proxy: proxy.to_owned(),
            });
        }
        self.transport.set_proxy(uri)
    }

    /// Re-engages the configured limiter. Enabling a limiter that is not
    /// disabled is caller misuse and fails rather than being ignored.
    pub fn enable_rate_limiter(&self) -> Result<()> {
        self.limiter_disabled
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| Error::RateLimiterAlreadyEnabled)
    }

    /// Bypasses the configured limiter until re-enabled. Disabling twice
    /// fails rather than being ignored.
    pub fn disable_rate_limiter(&self) -> Result<()> {
        self.limiter_disabled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| Error::RateLimiterAlreadyDisabled)
    }

    pub fn metrics_snapshot(&self) -> RequesterMetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn run<G>(
        &self,
        deadline: Option<Instant>,
        endpoint: EndpointLimit,
        generate: G,
    ) -> Result<()>
    where
        G: FnOnce() -> std::result::Result<Item, BoxError> + Send,
    {
        let _slot = self.jobs.acquire()?;

        if !self.limiter_disabled.load(Ordering::SeqCst) {
            self.wait_for_limit(deadline, endpoint).await?;
        }

        let item = generate().map_err(|source| Error::Generator { source })?;
        let prepared = item.prepare(&self.user_agent)?;
        self.execute_with_retry(deadline, prepared).await
    }

    async fn wait_for_limit(
        &self,
        deadline: Option<Instant>,
        endpoint: EndpointLimit,
    ) -> Result<()> {
        match deadline {
            None => self.limiter.limit(endpoint).await,
            Some(deadline) => {
                match timeout_at(deadline.into(), self.limiter.limit(endpoint)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::DeadlineExceeded),
                }
            }
        }
    }

    async fn execute_with_retry(
        &self,
        deadline: Option<Instant>,
        mut prepared: PreparedRequest,
    ) -> Result<()> {
        let method = prepared.method.clone();
        let uri_text = prepared.uri.to_string();
        let started_at = Instant::now();

        for attempt in 1..=self.max_retry_attempts {
            let Some(attempt_timeout) = phase_timeout(self.request_timeout, deadline) else {
                return Err(Error::DeadlineExceeded);
            };
            let request = prepared.to_http_request()?;
            if prepared.verbose {
                debug!(
                    requester = %self.name,
                    method = %method,
                    uri = %uri_text,
                    attempt,
                    max_attempts = self.max_retry_attempts,
                    authenticated = prepared.authenticated,
                    "sending request"
                );
            }
            if prepared.http_debugging {
                trace!(
                    requester = %self.name,
                    headers = ?request.headers(),
                    body_bytes = prepared.body.len(),
                    "outbound request"
                );
            }

            let outcome = match self.transport.execute(request, attempt_timeout).await {
                Ok(response) => {
                    let status = response.status();
                    let headers = response.headers().clone();
                    self.read_body(response.into_body(), deadline, &method, &uri_text)
                        .await
                        .map(|body| (status, headers, body))
                }
                Err(TransportCallError::Transport(source)) => Err(Error::Transport {
                    kind: classify_transport_error(&source),
                    method: method.clone(),
                    uri: uri_text.clone(),
                    source: Box::new(source),
                }),
                Err(TransportCallError::Timeout) => Err(Error::Timeout {
                    timeout_ms: attempt_timeout.as_millis(),
                    method: method.clone(),
                    uri: uri_text.clone(),
                }),
            };

            // A spent deadline is never the policy's call to make.
            if matches!(outcome, Err(Error::DeadlineExceeded)) {
                return Err(Error::DeadlineExceeded);
            }

            let decision = {
                let attempt_view = match &outcome {
                    Ok((status, headers, _)) => Attempt {
                        status: Some(*status),
                        headers: Some(headers),
                        error: None,
                    },
                    Err(error) => Attempt {
                        status: None,
                        headers: None,
                        error: Some(error),
                    },
                };
                self.retry_policy.should_retry(&attempt_view)
            };

            match decision {
                Err(cause) => return Err(Error::RetryAborted { source: cause }),
                Ok(false) => {
                    return match outcome {
                        Ok((status, headers, body)) => {
                            self.finish(&mut prepared, status, headers, body, started_at)
                        }
                        Err(error) => Err(error),
                    };
                }
                Ok(true) => {
                    let (cause, server_delay) = match outcome {
                        Ok((status, headers, _body)) => (
                            Error::HttpStatus {
                                status: status.as_u16(),
                                method: method.clone(),
                                uri: uri_text.clone(),
                            },
                            parse_retry_after(&headers, SystemTime::now())
                                .unwrap_or(Duration::ZERO),
                        ),
                        Err(error) => (error, Duration::ZERO),
                    };
                    if attempt == self.max_retry_attempts {
                        return Err(Error::RetryExhausted {
                            attempts: attempt,
                            source: Box::new(cause),
                        });
                    }
                    let delay = (self.backoff)(attempt).max(server_delay);
                    let Some(delay) = bounded_retry_delay(delay, deadline) else {
                        return Err(Error::DeadlineExceeded);
                    };
                    warn!(
                        requester = %self.name,
                        method = %method,
                        uri = %uri_text,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %cause,
                        "retrying request"
                    );
                    self.metrics.record_retry();
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }

        unreachable!("retry loop returns on every terminal outcome")
    }

    async fn read_body(
        &self,
        body: Incoming,
        deadline: Option<Instant>,
        method: &Method,
        uri_text: &str,
    ) -> Result<Bytes> {
        let Some(read_timeout) = phase_timeout(self.request_timeout, deadline) else {
            return Err(Error::DeadlineExceeded);
        };
        let limited = Limited::new(body, self.max_response_body_bytes);
        match tokio::time::timeout(read_timeout, limited.collect()).await {
            Ok(Ok(collected)) => Ok(collected.to_bytes()),
            Ok(Err(source)) => {
                if source.is::<LengthLimitError>() {
                    Err(Error::ResponseBodyTooLarge {
                        limit_bytes: self.max_response_body_bytes,
                    })
                } else {
                    Err(Error::ReadBody { source })
                }
            }
            Err(_) => Err(Error::Timeout {
                timeout_ms: read_timeout.as_millis(),
                method: method.clone(),
                uri: uri_text.to_owned(),
            }),
        }
    }

    fn finish(
        &self,
        prepared: &mut PreparedRequest,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        started_at: Instant,
    ) -> Result<()> {
        if prepared.verbose {
            debug!(
                requester = %self.name,
                status = status.as_u16(),
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "request completed"
            );
        }
        if prepared.http_debugging {
            trace!(
                requester = %self.name,
                headers = ?headers,
                body = %truncate_body(&body),
                "inbound response"
            );
        }

        if let Some(decode) = prepared.result.take() {
            decode(&body)?;
        }
        if let Some(target) = prepared.header_target.take() {
            let Some(cell) = target.upgrade() else {
                return Err(Error::HeaderTargetGone);
            };
            let mut map = lock_unpoisoned(&cell);
            for (name, value) in headers.iter() {
                map.append(name.clone(), value.clone());
            }
        }
        Ok(())
    }
}
