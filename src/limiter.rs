//! Fixed-window rate limit decisions.
//!
//! A request is counted by incrementing the Redis key for the current
//! (rule, client key, window) triple and comparing the returned count
//! against the rule's limit. The increment is atomic, so concurrent
//! requests cannot both slip under the limit: Redis serializes them.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::FailurePolicy;
use crate::error::Result;
use crate::redis::RedisHandle;
use crate::rules::Rule;

/// Where a decision came from. Everything except `Redis` is degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Redis,
    FailOpen,
    FailClosed,
    LocalFallback,
}

/// Outcome of a rate limit check.
///
/// `remaining` and `reset_at` are absent when the count is unknowable
/// (fail-open and fail-closed decisions).
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    pub source: DecisionSource,
}

impl Decision {
    pub fn degraded(&self) -> bool {
        self.source != DecisionSource::Redis
    }
}

struct LocalWindow {
    window_start: u64,
    expires_at: u64,
    count: u32,
}

// Upper bound on fallback map entries; stale windows are evicted on overflow.
const LOCAL_WINDOW_CAP: usize = 10_000;

pub struct RateLimiter {
    redis: RedisHandle,
    prefix: String,
    policy: FailurePolicy,
    local: Mutex<HashMap<String, LocalWindow>>,
}

impl RateLimiter {
    pub fn new(redis: RedisHandle, prefix: &str, policy: FailurePolicy) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            policy,
            local: Mutex::new(HashMap::new()),
        }
    }

    pub async fn decide(&self, rule: &Rule, client_key: &str) -> Decision {
        let window = rule.window_secs();
        let now = now_epoch_secs();
        let window_start = now - now % window;
        let reset_at = window_start + window;
        let counter_key = format!(
            "{}:rl:{}:{}:{}",
            self.prefix, rule.id, client_key, window_start
        );

        match self.redis.incr_window(&counter_key, window + 1).await {
            Ok(count) => decision_from_count(rule, count, reset_at, now, DecisionSource::Redis),
            Err(err) => {
                tracing::warn!(
                    rule = %rule.id,
                    policy = %self.policy,
                    error = %err,
                    "redis unavailable, applying failure policy"
                );
                match self.policy {
                    FailurePolicy::Open => Decision {
                        allowed: true,
                        limit: rule.limit,
                        remaining: None,
                        reset_at: None,
                        retry_after: None,
                        source: DecisionSource::FailOpen,
                    },
                    FailurePolicy::Closed => Decision {
                        allowed: false,
                        limit: rule.limit,
                        remaining: None,
                        reset_at: None,
                        retry_after: Some(
                            self.redis.policy().breaker_open_duration.as_secs().max(1),
                        ),
                        source: DecisionSource::FailClosed,
                    },
                    FailurePolicy::Local => {
                        self.decide_local(rule, client_key, window_start, reset_at, now)
                            .await
                    }
                }
            }
        }
    }

    /// Drop the current window counter for a (rule, key) pair.
    pub async fn reset(&self, rule: &Rule, client_key: &str) -> Result<bool> {
        let window = rule.window_secs();
        let now = now_epoch_secs();
        let window_start = now - now % window;
        let counter_key = format!(
            "{}:rl:{}:{}:{}",
            self.prefix, rule.id, client_key, window_start
        );
        self.local
            .lock()
            .await
            .remove(&format!("{}:{}", rule.id, client_key));
        self.redis.delete(&counter_key).await
    }

    async fn decide_local(
        &self,
        rule: &Rule,
        client_key: &str,
        window_start: u64,
        reset_at: u64,
        now: u64,
    ) -> Decision {
        let mut windows = self.local.lock().await;
        if windows.len() >= LOCAL_WINDOW_CAP {
            windows.retain(|_, w| w.expires_at > now);
        }
        let slot = windows
            .entry(format!("{}:{}", rule.id, client_key))
            .or_insert(LocalWindow {
                window_start,
                expires_at: reset_at,
                count: 0,
            });
        if slot.window_start != window_start {
            slot.window_start = window_start;
            slot.expires_at = reset_at;
            slot.count = 0;
        }
        slot.count = slot.count.saturating_add(1);
        decision_from_count(
            rule,
            i64::from(slot.count),
            reset_at,
            now,
            DecisionSource::LocalFallback,
        )
    }
}

fn decision_from_count(
    rule: &Rule,
    count: i64,
    reset_at: u64,
    now: u64,
    source: DecisionSource,
) -> Decision {
    let used = count.max(0) as u64;
    let allowed = used <= u64::from(rule.limit);
    let remaining = u64::from(rule.limit).saturating_sub(used) as u32;
    Decision {
        allowed,
        limit: rule.limit,
        remaining: Some(remaining),
        reset_at: Some(reset_at),
        retry_after: if allowed {
            None
        } else {
            Some(reset_at.saturating_sub(now).max(1))
        },
        source,
    }
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::RedisPolicy;
    use crate::rules::default_rule;
    use std::time::Duration;

    // Hour-long window keeps these tests clear of window boundaries.
    fn rule(limit: u32) -> Rule {
        Rule {
            id: "test".to_string(),
            ..default_rule(limit, Duration::from_secs(3600))
        }
    }

    fn limiter(policy: FailurePolicy) -> RateLimiter {
        let redis = RedisHandle::connect(
            "redis://127.0.0.1:1",
            RedisPolicy {
                timeout: Duration::from_millis(20),
                retry_attempts: 1,
                breaker_failure_threshold: u32::MAX,
                breaker_open_duration: Duration::from_secs(3),
            },
        )
        .unwrap();
        RateLimiter::new(redis, "iota-test", policy)
    }

    #[test]
    fn counts_below_limit_are_allowed() {
        let r = rule(3);
        let d = decision_from_count(&r, 2, 160, 100, DecisionSource::Redis);
        assert!(d.allowed);
        assert_eq!(d.remaining, Some(1));
        assert_eq!(d.reset_at, Some(160));
        assert_eq!(d.retry_after, None);
    }

    #[test]
    fn counts_past_limit_are_denied_with_retry_after() {
        let r = rule(3);
        let d = decision_from_count(&r, 4, 160, 100, DecisionSource::Redis);
        assert!(!d.allowed);
        assert_eq!(d.remaining, Some(0));
        assert_eq!(d.retry_after, Some(60));
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        let r = rule(1);
        let d = decision_from_count(&r, 2, 100, 100, DecisionSource::Redis);
        assert_eq!(d.retry_after, Some(1));
    }

    #[tokio::test]
    async fn fail_open_allows_without_counts() {
        let limiter = limiter(FailurePolicy::Open);
        let d = limiter.decide(&rule(1), "client").await;
        assert!(d.allowed);
        assert_eq!(d.source, DecisionSource::FailOpen);
        assert_eq!(d.remaining, None);
        assert!(d.degraded());
    }

    #[tokio::test]
    async fn fail_closed_denies_with_retry_after() {
        let limiter = limiter(FailurePolicy::Closed);
        let d = limiter.decide(&rule(1), "client").await;
        assert!(!d.allowed);
        assert_eq!(d.source, DecisionSource::FailClosed);
        assert_eq!(d.retry_after, Some(3));
    }

    #[tokio::test]
    async fn local_fallback_enforces_the_window() {
        let limiter = limiter(FailurePolicy::Local);
        let r = rule(2);

        let first = limiter.decide(&r, "client").await;
        let second = limiter.decide(&r, "client").await;
        let third = limiter.decide(&r, "client").await;

        assert!(first.allowed);
        assert_eq!(first.remaining, Some(1));
        assert!(second.allowed);
        assert_eq!(second.remaining, Some(0));
        assert!(!third.allowed);
        assert_eq!(third.source, DecisionSource::LocalFallback);
        assert!(third.retry_after.is_some());
    }

    #[tokio::test]
    async fn local_fallback_isolates_keys() {
        let limiter = limiter(FailurePolicy::Local);
        let r = rule(1);

        assert!(limiter.decide(&r, "alice").await.allowed);
        assert!(limiter.decide(&r, "bob").await.allowed);
        assert!(!limiter.decide(&r, "alice").await.allowed);
    }
}
