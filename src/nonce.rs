use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonically increasing token embedded in signed requests to prevent
/// replay.
///
/// The integer form is the raw counter value; `Display` renders the same
/// value for exchanges that sign over a string nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nonce(i64);

impl Nonce {
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<Nonce> for i64 {
    fn from(nonce: Nonce) -> Self {
        nonce.0
    }
}

/// Wall-clock-derived counters, forced strictly increasing under concurrency.
///
/// The nanosecond and millisecond sequences advance independently; each one
/// installs `max(now, last + 1)` in a single atomic update, so two callers
/// can never observe a repeated or decreasing value even within one clock
/// tick.
#[derive(Debug, Default)]
pub(crate) struct NonceSource {
    last_nanos: AtomicI64,
    last_millis: AtomicI64,
}

impl NonceSource {
    pub(crate) fn next(&self) -> Nonce {
        Nonce(advance(&self.last_nanos, unix_nanos()))
    }

    pub(crate) fn next_milli(&self) -> i64 {
        advance(&self.last_millis, unix_millis())
    }
}

fn advance(last: &AtomicI64, now: i64) -> i64 {
    let previous = last
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            Some(if now > current { now } else { current + 1 })
        })
        .unwrap_or_else(|current| current);
    if now > previous { now } else { previous + 1 }
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or_default()
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis().min(i64::MAX as u128) as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::NonceSource;

    #[test]
    fn sequential_nonces_strictly_increase() {
        let source = NonceSource::default();
        let mut previous = source.next().value();
        for _ in 0..10_000 {
            let next = source.next().value();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn milli_nonces_strictly_increase() {
        let source = NonceSource::default();
        let mut previous = source.next_milli();
        for _ in 0..1_000 {
            let next = source.next_milli();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn concurrent_nonces_are_distinct() {
        let source = Arc::new(NonceSource::default());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let source = Arc::clone(&source);
                thread::spawn(move || {
                    (0..500).map(|_| source.next().value()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for worker in workers {
            for nonce in worker.join().expect("worker should not panic") {
                assert!(seen.insert(nonce), "nonce {nonce} was issued twice");
            }
        }
        assert_eq!(seen.len(), 8 * 500);
    }

    #[test]
    fn display_matches_integer_value() {
        let source = NonceSource::default();
        let nonce = source.next();
        assert_eq!(nonce.to_string(), nonce.value().to_string());
    }
}
