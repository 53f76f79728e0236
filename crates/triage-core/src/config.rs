//! Engine configuration: fetch policy, session limits and correlation weights.
//!
//! Loaded from TOML, then overlaid with `DEPLOY_TRIAGE_*` environment
//! variables. Every field has a default, so an empty file is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::error::{Result, TriageError};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DEPLOY_TRIAGE_";

/// Per-call controls applied by every fetcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchPolicy {
    /// Maximum wall-clock time for a single external call (milliseconds).
    pub call_timeout_ms: u64,
    /// Attempts per call for transient failures (1 = no retries).
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts (milliseconds).
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay (milliseconds).
    pub backoff_max_ms: u64,
    /// Maximum pages followed for one paginated listing.
    pub max_pages: u32,
    /// Total time one fetcher may spend across all its calls (milliseconds).
    pub fetcher_budget_ms: u64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            call_timeout_ms: 2_000,
            max_attempts: 3,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            max_pages: 20,
            fetcher_budget_ms: 5_000,
        }
    }
}

impl FetchPolicy {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn fetcher_budget(&self) -> Duration {
        Duration::from_millis(self.fetcher_budget_ms)
    }

    /// Delay before attempt `attempt + 1`, given `attempt` (1-based) just failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Session-wide limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Wall-clock budget for a whole session (milliseconds).
    pub timeout_ms: u64,
    /// Concurrent external calls allowed across all fetchers of a session.
    pub max_concurrent_calls: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 8_000,
            max_concurrent_calls: 4,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Confidence adjustments applied by the correlator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CorrelationWeights {
    /// Added per corroborating source beyond the first.
    pub corroboration: f64,
    /// Subtracted when contradicting evidence exists.
    pub contradiction: f64,
    /// Minimum top confidence for a `resolved` report.
    pub resolved_threshold: f64,
}

impl Default for CorrelationWeights {
    fn default() -> Self {
        Self {
            corroboration: 0.1,
            contradiction: 0.2,
            resolved_threshold: 0.5,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TriageConfig {
    pub fetch: FetchPolicy,
    pub session: SessionConfig,
    pub correlation: CorrelationWeights,
    /// Look-back used when a request carries no time window (seconds).
    pub default_window_secs: u64,
    /// Maximum log excerpts kept per session.
    pub max_log_lines: usize,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            fetch: FetchPolicy::default(),
            session: SessionConfig::default(),
            correlation: CorrelationWeights::default(),
            default_window_secs: 3_600,
            max_log_lines: 50,
        }
    }
}

impl TriageConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: TriageConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: TriageConfig = toml::from_str(&text)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `DEPLOY_TRIAGE_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_with(|key| std::env::var(key).ok())
    }

    /// Overlay overrides from an arbitrary lookup, keyed by full variable name.
    pub fn apply_overrides_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("CALL_TIMEOUT_MS") {
            self.fetch.call_timeout_ms = parse_var("CALL_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            self.fetch.max_attempts = parse_var("MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("BACKOFF_BASE_MS") {
            self.fetch.backoff_base_ms = parse_var("BACKOFF_BASE_MS", &v)?;
        }
        if let Some(v) = get("BACKOFF_MAX_MS") {
            self.fetch.backoff_max_ms = parse_var("BACKOFF_MAX_MS", &v)?;
        }
        if let Some(v) = get("MAX_PAGES") {
            self.fetch.max_pages = parse_var("MAX_PAGES", &v)?;
        }
        if let Some(v) = get("FETCHER_BUDGET_MS") {
            self.fetch.fetcher_budget_ms = parse_var("FETCHER_BUDGET_MS", &v)?;
        }
        if let Some(v) = get("SESSION_TIMEOUT_MS") {
            self.session.timeout_ms = parse_var("SESSION_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("MAX_CONCURRENT_CALLS") {
            self.session.max_concurrent_calls = parse_var("MAX_CONCURRENT_CALLS", &v)?;
        }
        if let Some(v) = get("DEFAULT_WINDOW_SECS") {
            self.default_window_secs = parse_var("DEFAULT_WINDOW_SECS", &v)?;
        }
        if let Some(v) = get("MAX_LOG_LINES") {
            self.max_log_lines = parse_var("MAX_LOG_LINES", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(TriageError::Config(msg.to_string()));

        if self.fetch.max_attempts == 0 {
            return invalid("fetch.max_attempts must be at least 1");
        }
        if self.fetch.max_pages == 0 {
            return invalid("fetch.max_pages must be at least 1");
        }
        if self.fetch.call_timeout_ms == 0 || self.fetch.fetcher_budget_ms == 0 {
            return invalid("fetch timeouts must be non-zero");
        }
        if self.session.timeout_ms == 0 {
            return invalid("session.timeout_ms must be non-zero");
        }
        if self.session.max_concurrent_calls == 0 {
            return invalid("session.max_concurrent_calls must be at least 1");
        }
        let w = &self.correlation;
        for (name, value) in [
            ("corroboration", w.corroboration),
            ("contradiction", w.contradiction),
            ("resolved_threshold", w.resolved_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TriageError::Config(format!(
                    "correlation.{name} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        TriageError::Config(format!("{ENV_PREFIX}{name}: cannot parse {value:?}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = TriageConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.fetch.max_attempts, 3);
        assert_eq!(cfg.default_window_secs, 3_600);
        assert_eq!(cfg.session.max_concurrent_calls, 4);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = FetchPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(99), Duration::from_millis(1_000));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = TriageConfig::from_toml_str(
            r#"
            max_log_lines = 10

            [fetch]
            max_pages = 5

            [correlation]
            resolved_threshold = 0.6
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_log_lines, 10);
        assert_eq!(cfg.fetch.max_pages, 5);
        assert_eq!(cfg.fetch.max_attempts, 3);
        assert_eq!(cfg.correlation.resolved_threshold, 0.6);
        assert_eq!(cfg.correlation.corroboration, 0.1);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = TriageConfig::from_toml_str("[fetch]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, TriageError::Config(_)));

        let err = TriageConfig::from_toml_str("[correlation]\ncontradiction = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("contradiction"));

        let err = TriageConfig::from_toml_str("max_log_lines = \"many\"").unwrap_err();
        assert!(matches!(err, TriageError::Toml(_)));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<String, String> = [
            ("DEPLOY_TRIAGE_SESSION_TIMEOUT_MS", "1500"),
            ("DEPLOY_TRIAGE_MAX_CONCURRENT_CALLS", "2"),
            ("UNRELATED", "x"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut cfg = TriageConfig::default();
        cfg.apply_overrides_with(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(cfg.session.timeout_ms, 1_500);
        assert_eq!(cfg.session.max_concurrent_calls, 2);
        assert_eq!(cfg.fetch.max_pages, 20);
    }

    #[test]
    fn test_override_parse_error_names_variable() {
        let mut cfg = TriageConfig::default();
        let err = cfg
            .apply_overrides_with(|k| (k == "DEPLOY_TRIAGE_MAX_PAGES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("DEPLOY_TRIAGE_MAX_PAGES"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_window_secs = 900\n[session]\ntimeout_ms = 4000").unwrap();
        let cfg = TriageConfig::load(file.path()).unwrap();
        assert_eq!(cfg.default_window_secs, 900);
        assert_eq!(cfg.session.timeout_ms, 4_000);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TriageConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, TriageError::Io(_)));
    }
}
