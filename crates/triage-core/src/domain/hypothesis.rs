//! Root-cause hypotheses produced by the correlator.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::evidence::EvidenceId;

/// Closed set of root causes the correlator can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseCode {
    ProvisioningFailed,
    ProvisioningInProgress,
    InfrastructureDeleted,
    ServiceMissing,
    DeploymentFailed,
    ImagePullAuthFailure,
    ImagePullRepositoryNotFound,
    ImagePullManifestNotFound,
    ImagePullRegistryUnreachable,
    ImagePullFailure,
    OutOfMemory,
    ApplicationCrash,
    ResourceConstraint,
    PlacementFailure,
    HealthCheckFailing,
    NetworkBlockedPort,
    NetworkNoRoute,
    PortMismatch,
    PermissionDenied,
    Unknown,
}

impl CauseCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CauseCode::ProvisioningFailed => "provisioning_failed",
            CauseCode::ProvisioningInProgress => "provisioning_in_progress",
            CauseCode::InfrastructureDeleted => "infrastructure_deleted",
            CauseCode::ServiceMissing => "service_missing",
            CauseCode::DeploymentFailed => "deployment_failed",
            CauseCode::ImagePullAuthFailure => "image_pull_auth_failure",
            CauseCode::ImagePullRepositoryNotFound => "image_pull_repository_not_found",
            CauseCode::ImagePullManifestNotFound => "image_pull_manifest_not_found",
            CauseCode::ImagePullRegistryUnreachable => "image_pull_registry_unreachable",
            CauseCode::ImagePullFailure => "image_pull_failure",
            CauseCode::OutOfMemory => "out_of_memory",
            CauseCode::ApplicationCrash => "application_crash",
            CauseCode::ResourceConstraint => "resource_constraint",
            CauseCode::PlacementFailure => "placement_failure",
            CauseCode::HealthCheckFailing => "health_check_failing",
            CauseCode::NetworkBlockedPort => "network_blocked_port",
            CauseCode::NetworkNoRoute => "network_no_route",
            CauseCode::PortMismatch => "port_mismatch",
            CauseCode::PermissionDenied => "permission_denied",
            CauseCode::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CauseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate explanation with its supporting evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub cause_code: CauseCode,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub supporting_evidence: Vec<EvidenceId>,
    pub recommended_actions: Vec<String>,
}

impl Hypothesis {
    pub fn new(cause_code: CauseCode, confidence: f64) -> Self {
        Self {
            cause_code,
            confidence: confidence.clamp(0.0, 1.0),
            supporting_evidence: Vec::new(),
            recommended_actions: Vec::new(),
        }
    }

    /// The zero-confidence hypothesis returned when nothing can be concluded.
    pub fn unknown() -> Self {
        Self::new(CauseCode::Unknown, 0.0).with_action(
            "Broaden the diagnostic plan: run a guidance request with the app name, or widen the time window",
        )
    }

    pub fn with_evidence(mut self, ids: impl IntoIterator<Item = EvidenceId>) -> Self {
        self.supporting_evidence.extend(ids);
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.recommended_actions.push(action.into());
        self
    }

    pub fn is_conclusive(&self) -> bool {
        self.cause_code != CauseCode::Unknown && self.confidence > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(Hypothesis::new(CauseCode::OutOfMemory, 1.4).confidence, 1.0);
        assert_eq!(Hypothesis::new(CauseCode::OutOfMemory, -0.2).confidence, 0.0);
    }

    #[test]
    fn test_cause_code_serde_matches_as_str() {
        for code in [
            CauseCode::ProvisioningFailed,
            CauseCode::ImagePullAuthFailure,
            CauseCode::NetworkBlockedPort,
            CauseCode::Unknown,
        ] {
            let json = serde_json::to_value(code).unwrap();
            assert_eq!(json, code.as_str());
        }
    }

    #[test]
    fn test_unknown_is_not_conclusive() {
        let h = Hypothesis::unknown();
        assert!(!h.is_conclusive());
        assert_eq!(h.recommended_actions.len(), 1);
    }
}
