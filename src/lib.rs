//! `reqgate` is a concurrency-safe HTTP request executor for exchange API
//! SDKs: one long-lived [`Requester`] per exchange issues authenticated and
//! unauthenticated calls under per-endpoint rate-limit regimes, with
//! retry/backoff, a ceiling on in-flight jobs, and strictly monotonic nonces
//! for request signing.
//!
//! The request descriptor is produced by a generator closure that runs only
//! after a job slot and a rate-limit token have been granted, so a signature
//! or nonce minted inside it reflects the actual send time — a stale
//! signature is never put on the wire.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//!
//! use reqgate::{EndpointLimit, EndpointRateLimiter, Item, RateLimit, Requester};
//!
//! #[derive(Debug, Default, serde::Deserialize)]
//! struct Balance {
//!     total: f64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let limiter = EndpointRateLimiter::new()
//!         .with_bucket(EndpointLimit::Auth, RateLimit::new(Duration::from_secs(1), 10))
//!         .with_bucket(EndpointLimit::UnAuth, RateLimit::new(Duration::from_secs(1), 100));
//!     let requester = Requester::builder("example-exchange")
//!         .limiter(Arc::new(limiter))
//!         .try_build()?;
//!
//!     let balance = Arc::new(Mutex::new(Balance::default()));
//!     requester
//!         .send_payload(EndpointLimit::Auth, || {
//!             // Runs after admission, so the nonce is fresh at send time.
//!             let nonce = requester.get_nonce();
//!             Ok(Item::new("https://api.example.com/v1/balance")
//!                 .method("POST")
//!                 .header("x-nonce", nonce.to_string())
//!                 .authenticated()
//!                 .decode_into(&balance))
//!         })
//!         .await?;
//!
//!     println!("total={}", balance.lock().unwrap().total);
//!     Ok(())
//! }
//! ```

mod error;
mod item;
mod jobs;
mod limiter;
mod metrics;
mod nonce;
mod requester;
mod retry;
mod transport;
mod util;

pub use crate::error::{BoxError, Error, ErrorCode, TransportErrorKind};
pub use crate::item::Item;
pub use crate::limiter::{BasicRateLimiter, EndpointLimit, EndpointRateLimiter, Limiter, RateLimit};
pub use crate::metrics::RequesterMetricsSnapshot;
pub use crate::nonce::Nonce;
pub use crate::requester::{Requester, RequesterBuilder};
pub use crate::retry::{
    Attempt, BackoffFn, DefaultRetryPolicy, RetryAfterRejection, RetryPolicy, default_backoff,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod prelude {
    pub use crate::{
        Attempt, BackoffFn, BasicRateLimiter, BoxError, DefaultRetryPolicy, EndpointLimit,
        EndpointRateLimiter, Error, ErrorCode, Item, Limiter, Nonce, RateLimit, Requester,
        RequesterBuilder, RequesterMetricsSnapshot, RetryPolicy, TransportErrorKind,
    };
}
