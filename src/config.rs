use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use crate::error::{Error, Result};

/// What the limiter does with a request when Redis cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Allow the request without counting it.
    Open,
    /// Reject the request with 503.
    Closed,
    /// Degrade to a per-replica in-memory window.
    Local,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(FailurePolicy::Open),
            "closed" => Ok(FailurePolicy::Closed),
            "local" => Ok(FailurePolicy::Local),
            other => Err(format!(
                "invalid failure policy '{other}', expected open, closed or local"
            )),
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::Open => write!(f, "open"),
            FailurePolicy::Closed => write!(f, "closed"),
            FailurePolicy::Local => write!(f, "local"),
        }
    }
}

/// Service configuration, loaded from `IOTA_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub redis_url: String,
    /// Prefix for every Redis key the limiter writes.
    pub key_prefix: String,
    /// Limit applied by the default rule when no explicit rule matches.
    pub default_limit: u32,
    pub default_window: Duration,
    pub fail_policy: FailurePolicy,
    pub redis_timeout: Duration,
    pub redis_retries: usize,
    pub breaker_threshold: u32,
    pub breaker_open: Duration,
    /// Paths that bypass rate limiting entirely.
    pub exempt_paths: Vec<String>,
    pub rules_file: Option<PathBuf>,
    pub log_level: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bind_addr: parse_env("IOTA_BIND_ADDR", "127.0.0.1:8080")?,
            redis_url: env_string("IOTA_REDIS_URL", "redis://127.0.0.1:6379"),
            key_prefix: env_string("IOTA_KEY_PREFIX", "iota"),
            default_limit: parse_env("IOTA_DEFAULT_LIMIT", "100")?,
            default_window: parse_duration_env("IOTA_DEFAULT_WINDOW", "60s")?,
            fail_policy: parse_env("IOTA_FAIL_POLICY", "open")?,
            redis_timeout: parse_duration_env("IOTA_REDIS_TIMEOUT", "50ms")?,
            redis_retries: parse_env("IOTA_REDIS_RETRIES", "2")?,
            breaker_threshold: parse_env("IOTA_BREAKER_THRESHOLD", "8")?,
            breaker_open: parse_duration_env("IOTA_BREAKER_OPEN", "3s")?,
            exempt_paths: env_list("IOTA_EXEMPT_PATHS", "/health,/ready,/metrics"),
            rules_file: std::env::var("IOTA_RULES_FILE").ok().map(PathBuf::from),
            log_level: env_string("IOTA_LOG_LEVEL", "info"),
        })
    }

    /// Apply command-line overrides on top of the environment.
    pub fn with_overrides(mut self, cli: Cli) -> Self {
        if let Some(bind) = cli.bind {
            self.bind_addr = bind;
        }
        if let Some(url) = cli.redis_url {
            self.redis_url = url;
        }
        if let Some(rules) = cli.rules {
            self.rules_file = Some(rules);
        }
        if let Some(policy) = cli.fail_policy {
            self.fail_policy = policy;
        }
        self
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|p| p == path)
    }
}

/// Command-line overrides for the most commonly tuned settings.
#[derive(Debug, Parser)]
#[command(name = "iota-limiter", version, about = "Redis-backed distributed rate limiter")]
pub struct Cli {
    /// Address to listen on, e.g. 0.0.0.0:8080
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Redis connection URL
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Path to a JSON rules file
    #[arg(long)]
    pub rules: Option<PathBuf>,

    /// Behavior when Redis is unreachable
    #[arg(long, value_enum)]
    pub fail_policy: Option<FailurePolicy>,
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(name: &str, default: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|e| Error::Config(format!("{name}={raw}: {e}")))
}

fn parse_duration_env(name: &str, default: &str) -> Result<Duration> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    humantime::parse_duration(&raw).map_err(|e| Error::Config(format!("{name}={raw}: {e}")))
}

fn env_list(name: &str, default: &str) -> Vec<String> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
