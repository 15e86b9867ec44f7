use std::time::Instant;

use serde::Serialize;

use crate::redis::RedisHandle;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub redis: ServiceStatus,
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub status: &'static str,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Probes dependencies and reports service health.
///
/// Redis being down degrades the service, it does not make it unhealthy:
/// the failure policy keeps requests flowing.
pub struct HealthChecker {
    started: Instant,
    redis: RedisHandle,
}

impl HealthChecker {
    pub fn new(redis: RedisHandle) -> Self {
        Self {
            started: Instant::now(),
            redis,
        }
    }

    pub async fn redis_ok(&self) -> bool {
        self.redis.ping().await.is_ok()
    }

    pub async fn check(&self) -> HealthStatus {
        let probe = Instant::now();
        let result = self.redis.ping().await;
        let latency_ms = probe.elapsed().as_millis() as u64;

        let redis = match result {
            Ok(()) => ServiceStatus {
                status: "healthy",
                latency_ms,
                error: None,
            },
            Err(e) => ServiceStatus {
                status: "unavailable",
                latency_ms,
                error: Some(e.to_string()),
            },
        };

        HealthStatus {
            status: if redis.error.is_none() {
                "healthy"
            } else {
                "degraded"
            },
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: self.started.elapsed().as_secs(),
            redis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::RedisPolicy;
    use std::time::Duration;

    #[tokio::test]
    async fn unreachable_redis_reports_degraded() {
        let redis = RedisHandle::connect(
            "redis://127.0.0.1:1",
            RedisPolicy {
                timeout: Duration::from_millis(20),
                retry_attempts: 1,
                ..RedisPolicy::default()
            },
        )
        .unwrap();
        let checker = HealthChecker::new(redis);

        let status = checker.check().await;
        assert_eq!(status.status, "degraded");
        assert_eq!(status.redis.status, "unavailable");
        assert!(status.redis.error.is_some());
        assert!(!checker.redis_ok().await);
    }

    #[test]
    fn health_status_serializes() {
        let status = HealthStatus {
            status: "healthy",
            version: "0.1.0",
            uptime_seconds: 3600,
            redis: ServiceStatus {
                status: "healthy",
                latency_ms: 2,
                error: None,
            },
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(!json.contains("error"));
    }
}
