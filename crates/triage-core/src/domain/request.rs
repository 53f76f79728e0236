//! Diagnostic requests: the action asked for, the identifiers it names and the
//! look-back window.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::ValidationError;
use super::evidence::EvidenceSource;

/// What the caller asked the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Triage a symptom and let the router pick the plan.
    Guidance,
    Stack,
    Service,
    Task,
    Logs,
    ImagePull,
    Network,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Guidance,
        Action::Stack,
        Action::Service,
        Action::Task,
        Action::Logs,
        Action::ImagePull,
        Action::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Guidance => "guidance",
            Action::Stack => "stack",
            Action::Service => "service",
            Action::Task => "task",
            Action::Logs => "logs",
            Action::ImagePull => "image_pull",
            Action::Network => "network",
        }
    }

    /// The single evidence layer a targeted action reads. `None` for guidance.
    pub fn source(&self) -> Option<EvidenceSource> {
        match self {
            Action::Guidance => None,
            Action::Stack => Some(EvidenceSource::Stack),
            Action::Service => Some(EvidenceSource::Service),
            Action::Task => Some(EvidenceSource::Task),
            Action::Logs => Some(EvidenceSource::Logs),
            Action::ImagePull => Some(EvidenceSource::ImagePull),
            Action::Network => Some(EvidenceSource::Network),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == normalized)
            .ok_or_else(|| ValidationError::UnknownAction(s.to_string()))
    }
}

/// Longest look-back accepted; larger windows are clamped.
pub const MAX_LOOKBACK_SECS: u64 = 400 * 24 * 3600;

/// Closed time range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ValidationError> {
        if start > end {
            return Err(ValidationError::InvertedTimeWindow {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    /// The `secs` seconds leading up to `now`.
    pub fn last(secs: u64, now: DateTime<Utc>) -> Self {
        let span = Duration::seconds(secs.min(MAX_LOOKBACK_SECS) as i64);
        Self {
            start: now - span,
            end: now,
        }
    }

    /// Resolve a partially specified window.
    ///
    /// Explicit bounds win. An end alone implies `end - secs`, a start alone
    /// runs to `now`, and nothing at all means the last `secs` seconds.
    pub fn resolve(
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        match (start, end) {
            (Some(start), Some(end)) => Self::new(start, end),
            (None, Some(end)) => Ok(Self::last(secs, end)),
            (Some(start), None) => Self::new(start, now),
            (None, None) => Ok(Self::last(secs, now)),
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }
}

/// The identifiers a request names, borrowed by the router and fetchers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifiers {
    pub cluster: Option<String>,
    pub service: Option<String>,
    pub app_name: Option<String>,
}

impl Identifiers {
    pub fn is_empty(&self) -> bool {
        self.cluster.is_none() && self.service.is_none() && self.app_name.is_none()
    }
}

/// One diagnostic invocation.
///
/// Built with the `with_*` methods and read through accessors; a constructed
/// request cannot be changed. Call [`DiagnosticRequest::validate`] (the engine
/// does) before dispatching it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRequest {
    action: Action,
    #[serde(default)]
    cluster: Option<String>,
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    app_name: Option<String>,
    /// Free-text symptom, consulted by the router.
    #[serde(default)]
    symptom: Option<String>,
    #[serde(default)]
    time_window: Option<TimeWindow>,
    #[serde(default)]
    extra_params: BTreeMap<String, String>,
}

impl DiagnosticRequest {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            cluster: None,
            service: None,
            app_name: None,
            symptom: None,
            time_window: None,
            extra_params: BTreeMap::new(),
        }
    }

    /// Shorthand for a guidance request carrying a symptom description.
    pub fn guidance(symptom: impl Into<String>) -> Self {
        Self::new(Action::Guidance).with_symptom(symptom)
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn with_symptom(mut self, symptom: impl Into<String>) -> Self {
        self.symptom = Some(symptom.into());
        self
    }

    pub fn with_time_window(mut self, window: TimeWindow) -> Self {
        self.time_window = Some(window);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.insert(key.into(), value.into());
        self
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    pub fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }

    pub fn symptom(&self) -> &str {
        self.symptom.as_deref().unwrap_or_default()
    }

    pub fn time_window(&self) -> Option<TimeWindow> {
        self.time_window
    }

    pub fn extra_params(&self) -> &BTreeMap<String, String> {
        &self.extra_params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.extra_params.get(key).map(String::as_str)
    }

    pub fn identifiers(&self) -> Identifiers {
        Identifiers {
            cluster: self.cluster.clone(),
            service: self.service.clone(),
            app_name: self.app_name.clone(),
        }
    }

    /// Check the request carries what its action needs.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("cluster", &self.cluster),
            ("service", &self.service),
            ("app_name", &self.app_name),
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                return Err(ValidationError::BlankIdentifier {
                    field: field.to_string(),
                });
            }
        }

        if self.identifiers().is_empty() {
            return Err(ValidationError::MissingIdentifiers);
        }

        if let Some(window) = self.time_window {
            if window.start > window.end {
                return Err(ValidationError::InvertedTimeWindow {
                    start: window.start.to_rfc3339(),
                    end: window.end.to_rfc3339(),
                });
            }
        }

        let missing = |needed: &str| ValidationError::MissingIdentifier {
            action: self.action.to_string(),
            needed: needed.to_string(),
        };

        match self.action {
            Action::Stack => {
                if self.app_name.is_none()
                    && self.service.is_none()
                    && self.param("stack_name").is_none()
                {
                    return Err(missing("app_name, service or extra_params.stack_name"));
                }
            }
            Action::Service | Action::Network => {
                if self.service.is_none() && self.app_name.is_none() {
                    return Err(missing("service or app_name"));
                }
            }
            Action::Guidance | Action::Task | Action::Logs | Action::ImagePull => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, h, 0, 0).unwrap()
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("image-pull".parse::<Action>().unwrap(), Action::ImagePull);
        assert_eq!("Guidance".parse::<Action>().unwrap(), Action::Guidance);
        assert!(matches!(
            "reboot".parse::<Action>(),
            Err(ValidationError::UnknownAction(_))
        ));
    }

    #[test]
    fn test_window_resolution() {
        let now = at(12);
        let w = TimeWindow::resolve(None, None, 3600, now).unwrap();
        assert_eq!(w.start(), at(11));
        assert_eq!(w.end(), now);

        let w = TimeWindow::resolve(None, Some(at(6)), 7200, now).unwrap();
        assert_eq!(w.start(), at(4));

        let w = TimeWindow::resolve(Some(at(9)), None, 60, now).unwrap();
        assert_eq!((w.start(), w.end()), (at(9), now));

        assert!(TimeWindow::resolve(Some(at(10)), Some(at(9)), 60, now).is_err());
        assert!(w.contains(at(10)));
        assert!(!w.contains(at(8)));
    }

    #[test]
    fn test_validate_requires_some_identifier() {
        let req = DiagnosticRequest::guidance("my service is broken");
        assert_eq!(req.validate(), Err(ValidationError::MissingIdentifiers));

        let req = req.with_app_name("checkout");
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_blank_identifier() {
        let req = DiagnosticRequest::new(Action::Task).with_cluster("  ");
        assert!(matches!(
            req.validate(),
            Err(ValidationError::BlankIdentifier { field }) if field == "cluster"
        ));
    }

    #[test]
    fn test_validate_action_specific() {
        let req = DiagnosticRequest::new(Action::Service).with_cluster("prod");
        assert!(matches!(
            req.validate(),
            Err(ValidationError::MissingIdentifier { .. })
        ));

        let req = DiagnosticRequest::new(Action::Stack)
            .with_cluster("prod")
            .with_param("stack_name", "checkout-infra");
        assert!(req.validate().is_ok());

        let req = DiagnosticRequest::new(Action::Task).with_cluster("prod");
        assert!(req.validate().is_ok());
    }
}
