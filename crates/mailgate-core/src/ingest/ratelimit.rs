//! Fixed-window rate limiting over the counting store

use mailgate_common::{Error, Result};
use mailgate_storage::counters::CounterStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Fixed-window limiter for one keyspace.
///
/// Each event increments the key's counter; the first increment in a
/// window attaches the window-length expiry, so the counter resets once
/// the window elapses. Two instances run in the gateway, one keyed by
/// remote IP and one by sender address.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    prefix: &'static str,
    max: u64,
    window: Duration,
    fail_open: bool,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        prefix: &'static str,
        max: u64,
        window: Duration,
        fail_open: bool,
    ) -> Self {
        Self {
            store,
            prefix,
            max,
            window,
            fail_open,
        }
    }

    /// Record an event for `key` and report whether it is within the
    /// window's maximum.
    ///
    /// A counting-store failure surfaces `StoreUnavailable` (fail closed)
    /// unless the limiter is configured to fail open, in which case the
    /// event is admitted uncounted.
    pub async fn admit(&self, key: &str) -> Result<bool> {
        let counter_key = format!("ratelimit:{}:{}", self.prefix, key);

        let count = match self.store.increment(&counter_key).await {
            Ok(count) => count,
            Err(e) => return self.on_store_error(e),
        };

        if count == 1 {
            if let Err(e) = self.store.expire(&counter_key, self.window).await {
                return self.on_store_error(e);
            }
        }

        let allowed = count as u64 <= self.max;
        if !allowed {
            debug!(key = %counter_key, count, max = self.max, "Rate limit exceeded");
        }
        Ok(allowed)
    }

    fn on_store_error(&self, e: Error) -> Result<bool> {
        if self.fail_open {
            warn!(prefix = self.prefix, error = %e, "Counting store unavailable, admitting uncounted");
            Ok(true)
        } else {
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mailgate_storage::counters::MemoryCounterStore;

    fn limiter(max: u64, window_secs: u64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryCounterStore::new()),
            "ip",
            max,
            Duration::from_secs(window_secs),
            false,
        )
    }

    #[tokio::test]
    async fn test_allows_exactly_max_per_window() {
        let limiter = limiter(3, 60);
        for _ in 0..3 {
            assert!(limiter.admit("192.0.2.1").await.unwrap());
        }
        assert!(!limiter.admit("192.0.2.1").await.unwrap());
        assert!(!limiter.admit("192.0.2.1").await.unwrap());

        // Other keys are unaffected
        assert!(limiter.admit("192.0.2.2").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_elapse_resets_counter() {
        let limiter = limiter(2, 60);
        assert!(limiter.admit("k").await.unwrap());
        assert!(limiter.admit("k").await.unwrap());
        assert!(!limiter.admit("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.admit("k").await.unwrap());
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn increment(&self, _key: &str) -> Result<i64> {
            Err(Error::StoreUnavailable("connection refused".to_string()))
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<()> {
            Err(Error::StoreUnavailable("connection refused".to_string()))
        }
        async fn get(&self, _key: &str) -> Result<Option<i64>> {
            Err(Error::StoreUnavailable("connection refused".to_string()))
        }
        async fn set(&self, _key: &str, _value: i64, _ttl: Duration) -> Result<()> {
            Err(Error::StoreUnavailable("connection refused".to_string()))
        }
        async fn purge_expired(&self) -> Result<u64> {
            Err(Error::StoreUnavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed_by_default() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), "ip", 10, Duration::from_secs(60), false);
        assert!(matches!(
            limiter.admit("k").await,
            Err(Error::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_store_outage_fail_open() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), "ip", 10, Duration::from_secs(60), true);
        assert!(limiter.admit("k").await.unwrap());
    }
}
