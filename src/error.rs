use http::Method;
use thiserror::Error;

use crate::limiter::EndpointLimit;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification of a transport-level failure, for logs and retry
/// decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Stable machine-readable identity for each [`Error`] variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidPath,
    InvalidMethod,
    InvalidHeaderName,
    InvalidHeaderValue,
    HeaderTargetGone,
    EndpointLimitNotFound,
    Limiter,
    Generator,
    TooManyRequestJobs,
    RequestBuild,
    Transport,
    Timeout,
    DeadlineExceeded,
    ReadBody,
    ResponseBodyTooLarge,
    HttpStatus,
    RetryExhausted,
    RetryAborted,
    Decode,
    InvalidProxy,
    TlsInit,
    RateLimiterAlreadyEnabled,
    RateLimiterAlreadyDisabled,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidPath => "invalid_path",
            Self::InvalidMethod => "invalid_method",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::HeaderTargetGone => "header_target_gone",
            Self::EndpointLimitNotFound => "endpoint_limit_not_found",
            Self::Limiter => "limiter",
            Self::Generator => "generator",
            Self::TooManyRequestJobs => "too_many_request_jobs",
            Self::RequestBuild => "request_build",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::ReadBody => "read_body",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::HttpStatus => "http_status",
            Self::RetryExhausted => "retry_exhausted",
            Self::RetryAborted => "retry_aborted",
            Self::Decode => "decode",
            Self::InvalidProxy => "invalid_proxy",
            Self::TlsInit => "tls_init",
            Self::RateLimiterAlreadyEnabled => "rate_limiter_already_enabled",
            Self::RateLimiterAlreadyDisabled => "rate_limiter_already_disabled",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("request path is not a usable absolute url: {path:?}")]
    InvalidPath { path: String },
    #[error("invalid http method {method:?}")]
    InvalidMethod { method: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("response header target storage is no longer allocated")]
    HeaderTargetGone,
    #[error("no rate limit bucket is configured for endpoint {endpoint:?}")]
    EndpointLimitNotFound { endpoint: EndpointLimit },
    #[error("rate limiter failed: {source}")]
    Limiter {
        #[source]
        source: BoxError,
    },
    #[error("request generator failed: {source}")]
    Generator {
        #[source]
        source: BoxError,
    },
    #[error("too many concurrent request jobs (limit {limit})")]
    TooManyRequestJobs { limit: u32 },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    #[error("failed to read response body: {source}")]
    ReadBody {
        #[source]
        source: BoxError,
    },
    #[error("response body exceeds the {limit_bytes} byte limit")]
    ResponseBodyTooLarge { limit_bytes: usize },
    #[error("http status {status} for {method} {uri}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
    },
    #[error("failed to retry request after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
    #[error("request is not retryable: {source}")]
    RetryAborted {
        #[source]
        source: BoxError,
    },
    #[error("failed to decode response body: {source}; body={body}")]
    Decode {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("invalid proxy url {proxy:?}")]
    InvalidProxy { proxy: String },
    #[error("failed to initialize tls transport: {message}")]
    TlsInit { message: String },
    #[error("rate limiter is already enabled")]
    RateLimiterAlreadyEnabled,
    #[error("rate limiter is already disabled")]
    RateLimiterAlreadyDisabled,
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidPath { .. } => ErrorCode::InvalidPath,
            Self::InvalidMethod { .. } => ErrorCode::InvalidMethod,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::HeaderTargetGone => ErrorCode::HeaderTargetGone,
            Self::EndpointLimitNotFound { .. } => ErrorCode::EndpointLimitNotFound,
            Self::Limiter { .. } => ErrorCode::Limiter,
            Self::Generator { .. } => ErrorCode::Generator,
            Self::TooManyRequestJobs { .. } => ErrorCode::TooManyRequestJobs,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            Self::RetryAborted { .. } => ErrorCode::RetryAborted,
            Self::Decode { .. } => ErrorCode::Decode,
            Self::InvalidProxy { .. } => ErrorCode::InvalidProxy,
            Self::TlsInit { .. } => ErrorCode::TlsInit,
            Self::RateLimiterAlreadyEnabled => ErrorCode::RateLimiterAlreadyEnabled,
            Self::RateLimiterAlreadyDisabled => ErrorCode::RateLimiterAlreadyDisabled,
        }
    }
}
