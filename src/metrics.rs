//! In-process counters rendered in Prometheus text format.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::Mutex;

use crate::limiter::DecisionSource;
use crate::redis::RedisCounters;

#[derive(Debug)]
pub struct Metrics {
    started: Instant,
    pub allowed_total: AtomicU64,
    pub limited_total: AtomicU64,
    pub fail_open_total: AtomicU64,
    pub fail_closed_total: AtomicU64,
    pub local_fallback_total: AtomicU64,
    pub missing_key_denied_total: AtomicU64,
    rule_outcomes: Mutex<HashMap<(String, &'static str), u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            allowed_total: AtomicU64::new(0),
            limited_total: AtomicU64::new(0),
            fail_open_total: AtomicU64::new(0),
            fail_closed_total: AtomicU64::new(0),
            local_fallback_total: AtomicU64::new(0),
            missing_key_denied_total: AtomicU64::new(0),
            rule_outcomes: Mutex::new(HashMap::new()),
        }
    }

    pub async fn record_outcome(&self, rule_id: &str, allowed: bool) {
        let outcome = if allowed {
            self.allowed_total.fetch_add(1, Ordering::Relaxed);
            "allowed"
        } else {
            self.limited_total.fetch_add(1, Ordering::Relaxed);
            "limited"
        };
        let mut outcomes = self.rule_outcomes.lock().await;
        *outcomes.entry((rule_id.to_string(), outcome)).or_insert(0) += 1;
    }

    pub fn record_fallback(&self, source: DecisionSource) {
        match source {
            DecisionSource::FailOpen => self.fail_open_total.fetch_add(1, Ordering::Relaxed),
            DecisionSource::FailClosed => self.fail_closed_total.fetch_add(1, Ordering::Relaxed),
            DecisionSource::LocalFallback => {
                self.local_fallback_total.fetch_add(1, Ordering::Relaxed)
            }
            DecisionSource::Redis => return,
        };
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub async fn render(&self, redis: &RedisCounters) -> String {
        let mut body = String::new();
        body.push_str(&format!(
            "iota_build_info{{version=\"{}\"}} 1\n",
            env!("CARGO_PKG_VERSION")
        ));
        body.push_str(&format!("iota_uptime_seconds {}\n", self.uptime_secs()));

        for (name, counter) in [
            ("iota_requests_allowed_total", &self.allowed_total),
            ("iota_requests_limited_total", &self.limited_total),
            ("iota_missing_key_denied_total", &self.missing_key_denied_total),
        ] {
            body.push_str(&format!("{name} {}\n", counter.load(Ordering::Relaxed)));
        }

        for (policy, counter) in [
            ("open", &self.fail_open_total),
            ("closed", &self.fail_closed_total),
            ("local", &self.local_fallback_total),
        ] {
            body.push_str(&format!(
                "iota_fallback_total{{policy=\"{policy}\"}} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }

        for (name, counter) in [
            ("iota_redis_errors_total", &redis.errors_total),
            ("iota_redis_breaker_open_total", &redis.breaker_open_total),
            (
                "iota_redis_breaker_rejected_total",
                &redis.breaker_rejected_total,
            ),
        ] {
            body.push_str(&format!("{name} {}\n", counter.load(Ordering::Relaxed)));
        }

        let outcomes = self.rule_outcomes.lock().await;
        let mut lines: Vec<_> = outcomes
            .iter()
            .map(|((rule, outcome), count)| {
                format!("iota_http_requests_total{{rule=\"{rule}\",outcome=\"{outcome}\"}} {count}\n")
            })
            .collect();
        lines.sort();
        for line in lines {
            body.push_str(&line);
        }
        body
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
