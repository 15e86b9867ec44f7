//! Hardened Redis access for the limiter.
//!
//! Every operation runs under a timeout with bounded retries, behind a
//! circuit breaker. While the breaker is open, calls fail immediately
//! instead of waiting out another timeout; the caller's failure policy
//! decides what happens to the request.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::config::Settings;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RedisPolicy {
    pub timeout: Duration,
    pub retry_attempts: usize,
    pub breaker_failure_threshold: u32,
    pub breaker_open_duration: Duration,
}

impl Default for RedisPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(50),
            retry_attempts: 2,
            breaker_failure_threshold: 8,
            breaker_open_duration: Duration::from_secs(3),
        }
    }
}

impl RedisPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            timeout: settings.redis_timeout,
            retry_attempts: settings.redis_retries,
            breaker_failure_threshold: settings.breaker_threshold,
            breaker_open_duration: settings.breaker_open,
        }
    }
}

#[derive(Default)]
struct BreakerState {
    failure_count: u32,
    open_until: Option<Instant>,
}

/// Counters exposed on `/metrics`.
#[derive(Debug, Default)]
pub struct RedisCounters {
    pub errors_total: AtomicU64,
    pub breaker_open_total: AtomicU64,
    pub breaker_rejected_total: AtomicU64,
}

#[derive(Clone)]
pub struct RedisHandle {
    client: redis::Client,
    policy: RedisPolicy,
    breaker: Arc<Mutex<BreakerState>>,
    pub counters: Arc<RedisCounters>,
}

impl RedisHandle {
    pub fn connect(url: &str, policy: RedisPolicy) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            policy,
            breaker: Arc::new(Mutex::new(BreakerState::default())),
            counters: Arc::new(RedisCounters::default()),
        })
    }

    pub fn policy(&self) -> &RedisPolicy {
        &self.policy
    }

    /// Atomically advance the window counter and refresh its TTL.
    ///
    /// Returns the count after this increment. The key embeds the window
    /// start, so refreshing the TTL never extends a window.
    pub async fn incr_window(&self, key: &str, ttl_secs: u64) -> Result<i64> {
        let client = self.client.clone();
        let key = key.to_string();
        self.with_retry(move || {
            let client = client.clone();
            let key = key.clone();
            async move {
                let mut conn = client.get_multiplexed_async_connection().await?;
                let (count,): (i64,) = redis::pipe()
                    .atomic()
                    .cmd("INCR")
                    .arg(&key)
                    .cmd("EXPIRE")
                    .arg(&key)
                    .arg(ttl_secs)
                    .ignore()
                    .query_async(&mut conn)
                    .await?;
                Ok(count)
            }
        })
        .await
    }

    pub async fn ping(&self) -> Result<()> {
        let client = self.client.clone();
        self.with_retry(move || {
            let client = client.clone();
            async move {
                let mut conn = client.get_multiplexed_async_connection().await?;
                let _: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let client = self.client.clone();
        let key = key.to_string();
        self.with_retry(move || {
            let client = client.clone();
            let key = key.clone();
            async move {
                let mut conn = client.get_multiplexed_async_connection().await?;
                let removed: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
                Ok(removed > 0)
            }
        })
        .await
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker_check().await?;
        let attempts = self.policy.retry_attempts.max(1);
        let mut last: Option<Error> = None;
        for attempt in 0..attempts {
            match timeout(self.policy.timeout, op()).await {
                Ok(Ok(value)) => {
                    self.record_success().await;
                    return Ok(value);
                }
                Ok(Err(e)) => last = Some(e),
                Err(_) => last = Some(Error::RedisUnavailable("operation timed out".to_string())),
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        self.counters.errors_total.fetch_add(1, Ordering::Relaxed);
        self.record_failure().await;
        Err(last.unwrap_or_else(|| Error::RedisUnavailable("redis operation failed".to_string())))
    }

    async fn breaker_check(&self) -> Result<()> {
        let breaker = self.breaker.lock().await;
        if let Some(until) = breaker.open_until {
            if Instant::now() < until {
                self.counters
                    .breaker_rejected_total
                    .fetch_add(1, Ordering::Relaxed);
                return Err(Error::RedisUnavailable("circuit breaker open".to_string()));
            }
        }
        Ok(())
    }

    async fn record_failure(&self) {
        let mut breaker = self.breaker.lock().await;
        breaker.failure_count += 1;
        if breaker.failure_count >= self.policy.breaker_failure_threshold {
            let now = Instant::now();
            let newly_open = breaker.open_until.map_or(true, |until| now >= until);
            breaker.open_until = Some(now + self.policy.breaker_open_duration);
            if newly_open {
                self.counters
                    .breaker_open_total
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    failures = breaker.failure_count,
                    "redis circuit breaker opened"
                );
            }
        }
    }

    async fn record_success(&self) {
        let mut breaker = self.breaker.lock().await;
        breaker.failure_count = 0;
        breaker.open_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Port 1 is never a Redis server; every operation fails fast.
    fn unreachable_handle(policy: RedisPolicy) -> RedisHandle {
        RedisHandle::connect("redis://127.0.0.1:1", policy).unwrap()
    }

    fn fast_policy(threshold: u32) -> RedisPolicy {
        RedisPolicy {
            timeout: Duration::from_millis(20),
            retry_attempts: 1,
            breaker_failure_threshold: threshold,
            breaker_open_duration: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn operations_fail_against_unreachable_redis() {
        let handle = unreachable_handle(fast_policy(100));
        assert!(handle.incr_window("iota-test:k", 2).await.is_err());
        assert!(handle.ping().await.is_err());
        assert_eq!(handle.counters.errors_total.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_rejects() {
        let handle = unreachable_handle(fast_policy(2));
        assert!(handle.ping().await.is_err());
        assert!(handle.ping().await.is_err());
        assert_eq!(handle.counters.breaker_open_total.load(Ordering::Relaxed), 1);

        // Third call is rejected by the breaker without touching the network.
        assert!(handle.ping().await.is_err());
        assert_eq!(
            handle.counters.breaker_rejected_total.load(Ordering::Relaxed),
            1
        );
        assert_eq!(handle.counters.errors_total.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn invalid_url_is_rejected_at_connect() {
        assert!(RedisHandle::connect("not-a-url", RedisPolicy::default()).is_err());
    }
}
