use std::time::Duration;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::rules::RuleSet;

/// Validates configuration before the service starts serving traffic.
///
/// Invalid configuration is a startup failure, never a silent default.
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate_redis_url(url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(Error::Config("redis URL cannot be empty".to_string()));
        }
        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(Error::Config(
                "redis URL must start with 'redis://' or 'rediss://'".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_key_prefix(prefix: &str) -> Result<()> {
        if prefix.is_empty() {
            return Err(Error::Config("key prefix cannot be empty".to_string()));
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Config(
                "key prefix may only contain alphanumerics, hyphens and underscores".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_window(window: Duration) -> Result<()> {
        if window < Duration::from_secs(1) {
            return Err(Error::Config(
                "window must be at least one second".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_settings(settings: &Settings) -> Result<()> {
        Self::validate_redis_url(&settings.redis_url)?;
        Self::validate_key_prefix(&settings.key_prefix)?;
        Self::validate_window(settings.default_window)?;

        if settings.default_limit == 0 {
            return Err(Error::Config(
                "default limit must be greater than 0".to_string(),
            ));
        }
        if settings.redis_timeout < Duration::from_millis(1)
            || settings.redis_timeout > Duration::from_secs(5)
        {
            return Err(Error::Config(
                "redis timeout must be between 1ms and 5s".to_string(),
            ));
        }
        if settings.redis_retries == 0 || settings.redis_retries > 10 {
            return Err(Error::Config(
                "redis retries must be between 1 and 10".to_string(),
            ));
        }
        if settings.breaker_threshold == 0 {
            return Err(Error::Config(
                "breaker threshold must be greater than 0".to_string(),
            ));
        }
        if settings.breaker_open < Duration::from_millis(100) {
            return Err(Error::Config(
                "breaker open duration must be at least 100ms".to_string(),
            ));
        }
        for path in &settings.exempt_paths {
            if !path.starts_with('/') {
                return Err(Error::Config(format!(
                    "exempt path '{path}' must start with '/'"
                )));
            }
        }
        Ok(())
    }

    /// Validates every rule in the set and flags shadowed declarations.
    pub fn validate_rule_set(rule_set: &RuleSet) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for rule in &rule_set.rules {
            rule.validate_full()?;
            if rule.id == "default" {
                return Err(Error::Config(
                    "rule id 'default' is reserved for the default rule".to_string(),
                ));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(Error::Config(format!("duplicate rule id '{}'", rule.id)));
            }
        }
        rule_set.default.validate_full()?;

        // Resolution is first-match: an unconditional catch-all hides everything after it.
        if let Some(pos) = rule_set
            .rules
            .iter()
            .position(|r| r.enabled && r.pattern == "/*" && r.methods.is_empty())
        {
            if pos + 1 < rule_set.rules.len() {
                tracing::warn!(
                    rule = %rule_set.rules[pos].id,
                    "catch-all rule shadows {} later rule(s)",
                    rule_set.rules.len() - pos - 1
                );
            }
        }
        Ok(())
    }
}
