//! Error types for cluster-probe

use thiserror::Error;

/// Failures a read-only collaborator call can report.
///
/// Every external service is reduced to these four conditions so callers can
/// treat them uniformly: `Throttled` and `Unavailable` are transient and worth
/// retrying, `NotFound` and `AccessDenied` are terminal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The named resource does not exist
    #[error("{operation}: resource not found: {resource}")]
    NotFound { operation: String, resource: String },

    /// The caller lacks permission for the operation
    #[error("{operation}: access denied: {detail}")]
    AccessDenied { operation: String, detail: String },

    /// Request quota exceeded
    #[error("{operation}: throttled")]
    Throttled { operation: String },

    /// Service-side or connectivity failure (5xx-equivalent)
    #[error("{operation}: service unavailable: {detail}")]
    Unavailable { operation: String, detail: String },
}

impl ProbeError {
    pub fn not_found(operation: impl Into<String>, resource: impl Into<String>) -> Self {
        ProbeError::NotFound {
            operation: operation.into(),
            resource: resource.into(),
        }
    }

    pub fn access_denied(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        ProbeError::AccessDenied {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    pub fn throttled(operation: impl Into<String>) -> Self {
        ProbeError::Throttled {
            operation: operation.into(),
        }
    }

    pub fn unavailable(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        ProbeError::Unavailable {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProbeError::Throttled { .. } | ProbeError::Unavailable { .. }
        )
    }

    /// The operation that failed.
    pub fn operation(&self) -> &str {
        match self {
            ProbeError::NotFound { operation, .. }
            | ProbeError::AccessDenied { operation, .. }
            | ProbeError::Throttled { operation }
            | ProbeError::Unavailable { operation, .. } => operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProbeError::throttled("ecs:DescribeServices").is_transient());
        assert!(ProbeError::unavailable("logs:FilterLogEvents", "503").is_transient());
        assert!(!ProbeError::not_found("ecs:DescribeServices", "web").is_transient());
        assert!(!ProbeError::access_denied("ec2:DescribeSubnets", "no policy").is_transient());
    }

    #[test]
    fn test_display_names_operation() {
        let err = ProbeError::not_found("cloudformation:DescribeStacks", "checkout");
        let msg = err.to_string();
        assert!(msg.contains("cloudformation:DescribeStacks"));
        assert!(msg.contains("checkout"));
        assert_eq!(err.operation(), "cloudformation:DescribeStacks");
    }
}
