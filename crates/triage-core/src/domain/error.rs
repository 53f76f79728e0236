//! Domain-level error taxonomy for deploy-triage.

use cluster_probe::ProbeError;

/// Errors produced by request validation. Surfaced before any session starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("request must name at least one of cluster, service or app_name")]
    MissingIdentifiers,

    #[error("action {action} requires {needed}")]
    MissingIdentifier { action: String, needed: String },

    #[error("identifier {field} must not be blank")]
    BlankIdentifier { field: String },

    #[error("time window start {start} is after end {end}")]
    InvertedTimeWindow { start: String, end: String },

    #[error("unknown action: {0}")]
    UnknownAction(String),
}

/// Failures of a single fetcher call, after retry policy has been applied.
///
/// None of these abort a session: timeouts and exhausted retries become
/// warnings, not-found and access-denied become error-severity evidence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("{operation}: not found: {detail}")]
    NotFound { operation: String, detail: String },

    #[error("{operation}: access denied: {detail}")]
    AccessDenied { operation: String, detail: String },

    #[error("{operation} still failing after {attempts} attempt(s): {detail}")]
    Transient {
        operation: String,
        attempts: u32,
        detail: String,
    },

    #[error("unexpected fetcher failure: {0}")]
    Unexpected(String),
}

impl FetchError {
    /// Convert a terminal or exhausted collaborator failure.
    pub fn from_collaborator(err: ProbeError, attempts: u32) -> Self {
        match err {
            ProbeError::NotFound {
                operation,
                resource,
            } => FetchError::NotFound {
                operation,
                detail: resource,
            },
            ProbeError::AccessDenied { operation, detail } => {
                FetchError::AccessDenied { operation, detail }
            }
            ProbeError::Throttled { operation } => FetchError::Transient {
                operation,
                attempts,
                detail: "throttled".to_string(),
            },
            ProbeError::Unavailable { operation, detail } => FetchError::Transient {
                operation,
                attempts,
                detail,
            },
        }
    }

    /// Whether this failure should surface as evidence rather than a warning.
    pub fn is_terminal_condition(&self) -> bool {
        matches!(
            self,
            FetchError::NotFound { .. } | FetchError::AccessDenied { .. }
        )
    }
}

/// deploy-triage engine errors.
///
/// Only `Validation` and `InsufficientContext` are returned from a diagnosis;
/// the remaining variants come from loading configuration and snapshots.
#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("insufficient context: {0}")]
    InsufficientContext(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for deploy-triage operations.
pub type Result<T> = std::result::Result<T, TriageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = TriageError::from(ValidationError::MissingIdentifiers);
        assert!(err.to_string().contains("validation error"));

        let err = ValidationError::MissingIdentifier {
            action: "service".to_string(),
            needed: "service or app_name".to_string(),
        };
        assert!(err.to_string().contains("service or app_name"));
    }

    #[test]
    fn test_fetch_error_from_collaborator_error() {
        let err = FetchError::from_collaborator(ProbeError::throttled("ecs:ListTasks"), 3);
        assert_eq!(
            err,
            FetchError::Transient {
                operation: "ecs:ListTasks".to_string(),
                attempts: 3,
                detail: "throttled".to_string(),
            }
        );
        assert!(!err.is_terminal_condition());

        let err =
            FetchError::from_collaborator(ProbeError::not_found("ecs:DescribeServices", "web"), 1);
        assert!(err.is_terminal_condition());
        assert!(err.to_string().contains("web"));
    }
}
