use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::{Error, Result};
use crate::key_generator::KeySource;

/// What to do when a rule's key source is absent from the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingKeyPolicy {
    /// Skip limiting for this request.
    #[default]
    Allow,
    /// Reject the request with 400.
    Deny,
}

/// A per-endpoint rate limiting rule.
///
/// `pattern` is either an exact path (`/search`) or a trailing-wildcard
/// prefix (`/api/*`). An empty `methods` list matches every method.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Rule {
    #[serde(default)]
    #[validate(length(min = 1, max = 64))]
    pub id: String,

    #[validate(length(min = 1, max = 256), custom(function = validate_pattern))]
    pub pattern: String,

    #[serde(default)]
    pub methods: Vec<String>,

    #[validate(range(min = 1))]
    pub limit: u32,

    #[serde(with = "humantime_serde")]
    pub window: Duration,

    #[serde(default)]
    pub key: KeySource,

    #[serde(default)]
    pub on_missing_key: MissingKeyPolicy,

    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

fn validate_pattern(pattern: &str) -> std::result::Result<(), ValidationError> {
    if !pattern.starts_with('/') {
        return Err(ValidationError::new("pattern_must_start_with_slash"));
    }
    Ok(())
}

impl Rule {
    /// Derive-based bounds plus the checks the derive cannot express.
    pub fn validate_full(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::Validation(format!("rule '{}': {e}", self.id)))?;
        if self.window < Duration::from_secs(1) {
            return Err(Error::Validation(format!(
                "rule '{}': window must be at least one second",
                self.id
            )));
        }
        for method in &self.methods {
            if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(Error::Validation(format!(
                    "rule '{}': invalid method '{method}'",
                    self.id
                )));
            }
        }
        Ok(())
    }

    pub fn normalize(&mut self) {
        for method in &mut self.methods {
            *method = method.to_ascii_uppercase();
        }
    }

    pub fn matches(&self, method: &str, path: &str) -> bool {
        let method_ok = self.methods.is_empty()
            || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method));
        if !method_ok {
            return false;
        }
        if let Some(base) = self.pattern.strip_suffix("/*") {
            return path == base || path.starts_with(&format!("{base}/"));
        }
        path == self.pattern
    }

    /// Window length in whole seconds, never zero.
    pub fn window_secs(&self) -> u64 {
        self.window.as_secs().max(1)
    }
}

/// Builds the catch-all rule applied when nothing else matches.
pub fn default_rule(limit: u32, window: Duration) -> Rule {
    Rule {
        id: "default".to_string(),
        pattern: "/*".to_string(),
        methods: Vec::new(),
        limit,
        window,
        key: KeySource::Ip,
        on_missing_key: MissingKeyPolicy::Allow,
        enabled: true,
    }
}

/// The active rule table: explicit rules in declaration order, then the
/// default catch-all.
#[derive(Debug, Clone, Serialize)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    pub default: Rule,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<Rule>,
    default: Option<Rule>,
}

impl RuleSet {
    pub fn new(default: Rule) -> Self {
        Self {
            rules: Vec::new(),
            default,
        }
    }

    /// Load rules from a JSON file, falling back to the given default rule
    /// when the file does not override it.
    pub fn from_file(path: &Path, fallback_default: Rule) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: RuleFile = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("rules file {}: {e}", path.display())))?;
        let mut set = Self {
            rules: file.rules,
            default: file.default.unwrap_or(fallback_default),
        };
        for rule in &mut set.rules {
            rule.normalize();
        }
        set.default.normalize();
        Ok(set)
    }

    /// First enabled rule matching the request, the default as a last resort.
    pub fn resolve(&self, method: &str, path: &str) -> Option<&Rule> {
        if let Some(rule) = self
            .rules
            .iter()
            .find(|r| r.enabled && r.matches(method, path))
        {
            return Some(rule);
        }
        if self.default.enabled && self.default.matches(method, path) {
            return Some(&self.default);
        }
        None
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        if id == "default" {
            return Some(&self.default);
        }
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn upsert(&mut self, rule: Rule) {
        if rule.id == "default" {
            self.default = rule;
            return;
        }
        match self.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Rule> {
        let pos = self.rules.iter().position(|r| r.id == id)?;
        Some(self.rules.remove(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, pattern: &str, methods: &[&str]) -> Rule {
        Rule {
            id: id.to_string(),
            pattern: pattern.to_string(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            ..default_rule(10, Duration::from_secs(60))
        }
    }

    #[test]
    fn exact_pattern_matches_only_itself() {
        let r = rule("search", "/search", &[]);
        assert!(r.matches("GET", "/search"));
        assert!(!r.matches("GET", "/search/advanced"));
        assert!(!r.matches("GET", "/searching"));
    }

    #[test]
    fn prefix_pattern_matches_subtree() {
        let r = rule("api", "/api/*", &[]);
        assert!(r.matches("GET", "/api"));
        assert!(r.matches("GET", "/api/users"));
        assert!(r.matches("GET", "/api/users/42"));
        assert!(!r.matches("GET", "/apix"));
    }

    #[test]
    fn method_list_restricts_matching() {
        let r = rule("writes", "/items", &["POST", "PUT"]);
        assert!(r.matches("POST", "/items"));
        assert!(r.matches("post", "/items"));
        assert!(!r.matches("GET", "/items"));
    }

    #[test]
    fn resolution_is_first_match_then_default() {
        let mut set = RuleSet::new(default_rule(100, Duration::from_secs(60)));
        set.upsert(rule("search", "/search", &[]));
        set.upsert(rule("api", "/api/*", &[]));

        assert_eq!(set.resolve("GET", "/search").unwrap().id, "search");
        assert_eq!(set.resolve("GET", "/api/users").unwrap().id, "api");
        assert_eq!(set.resolve("GET", "/other").unwrap().id, "default");
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut set = RuleSet::new(default_rule(100, Duration::from_secs(60)));
        let mut r = rule("search", "/search", &[]);
        r.enabled = false;
        set.upsert(r);
        assert_eq!(set.resolve("GET", "/search").unwrap().id, "default");
    }

    #[test]
    fn upsert_replaces_by_id() {
        let mut set = RuleSet::new(default_rule(100, Duration::from_secs(60)));
        set.upsert(rule("search", "/search", &[]));
        let mut updated = rule("search", "/search", &[]);
        updated.limit = 5;
        set.upsert(updated);
        assert_eq!(set.rules.len(), 1);
        assert_eq!(set.get("search").unwrap().limit, 5);
    }

    #[test]
    fn upsert_default_replaces_default() {
        let mut set = RuleSet::new(default_rule(100, Duration::from_secs(60)));
        let mut new_default = default_rule(5, Duration::from_secs(30));
        new_default.enabled = false;
        set.upsert(new_default);
        assert!(set.rules.is_empty());
        assert!(!set.default.enabled);
        assert!(set.resolve("GET", "/anything").is_none());
    }

    #[test]
    fn rule_json_round_trip_with_humantime_window() {
        let json = r#"{
            "id": "search",
            "pattern": "/search",
            "methods": ["get"],
            "limit": 5,
            "window": "30s",
            "key": "api-key",
            "on_missing_key": "deny"
        }"#;
        let mut parsed: Rule = serde_json::from_str(json).unwrap();
        parsed.normalize();
        assert_eq!(parsed.window, Duration::from_secs(30));
        assert_eq!(parsed.key, KeySource::ApiKey);
        assert_eq!(parsed.methods, vec!["GET"]);
        assert_eq!(parsed.on_missing_key, MissingKeyPolicy::Deny);
        assert!(parsed.enabled);
        assert!(parsed.validate_full().is_ok());
    }

    #[test]
    fn validation_rejects_bad_rules() {
        let mut r = rule("bad", "no-slash", &[]);
        assert!(r.validate_full().is_err());
        r.pattern = "/ok".to_string();
        r.limit = 0;
        assert!(r.validate_full().is_err());
        r.limit = 1;
        r.window = Duration::from_millis(200);
        assert!(r.validate_full().is_err());
    }
}
