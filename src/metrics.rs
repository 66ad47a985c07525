use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::Result;
use crate::error::ErrorCode;
use crate::util::lock_unpoisoned;

/// Point-in-time copy of one requester's counters.
#[derive(Clone, Debug)]
pub struct RequesterMetricsSnapshot {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub retries: u64,
    pub jobs_declined: u64,
    pub error_counts: BTreeMap<&'static str, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct RequesterMetrics {
    inner: Arc<RequesterMetricsInner>,
}

#[derive(Debug, Default)]
struct RequesterMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    retries: AtomicU64,
    jobs_declined: AtomicU64,
    error_counts: Mutex<BTreeMap<&'static str, u64>>,
}

impl RequesterMetrics {
    pub(crate) fn record_request_started(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, result: &Result<()>) {
        match result {
            Ok(()) => {
                self.inner
                    .requests_succeeded
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
                let code = error.code();
                if code == ErrorCode::TooManyRequestJobs {
                    self.inner.jobs_declined.fetch_add(1, Ordering::Relaxed);
                }
                let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
                *error_counts.entry(code.as_str()).or_insert(0) += 1;
            }
        }
    }

    pub(crate) fn snapshot(&self) -> RequesterMetricsSnapshot {
        RequesterMetricsSnapshot {
            requests_started: self.inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: self.inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            jobs_declined: self.inner.jobs_declined.load(Ordering::Relaxed),
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }
}
