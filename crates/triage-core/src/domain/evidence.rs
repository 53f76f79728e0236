//! Evidence: normalized observations produced by exactly one fetcher.
//!
//! Every observation carries a [`Finding`], a tagged variant from a closed
//! taxonomy, so the correlator matches on structure rather than message text.
//! The free-text `message` is for people; the `raw` mapping keeps whatever
//! collaborator fields were used to derive the finding.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Bumped whenever a `Finding` variant is added, removed or reshaped.
pub const TAXONOMY_VERSION: u32 = 2;

/// The evidence layer (and fetcher) an observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    Stack,
    Service,
    Task,
    Logs,
    ImagePull,
    Network,
}

impl EvidenceSource {
    pub const ALL: [EvidenceSource; 6] = [
        EvidenceSource::Stack,
        EvidenceSource::Service,
        EvidenceSource::Task,
        EvidenceSource::Logs,
        EvidenceSource::ImagePull,
        EvidenceSource::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceSource::Stack => "stack",
            EvidenceSource::Service => "service",
            EvidenceSource::Task => "task",
            EvidenceSource::Logs => "logs",
            EvidenceSource::ImagePull => "image_pull",
            EvidenceSource::Network => "network",
        }
    }
}

impl fmt::Display for EvidenceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of an observation, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content-derived evidence identifier (SHA-256 hex).
///
/// Two fetches of identical external state yield identical ids, which is what
/// lets the correlator merge duplicates and keeps reports reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvidenceId(String);

impl EvidenceId {
    fn derive(
        source: EvidenceSource,
        severity: Severity,
        finding: &Finding,
        message: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(severity.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(serde_json::to_vec(finding).unwrap_or_default());
        hasher.update([0]);
        hasher.update(message.as_bytes());
        hasher.update([0]);
        if let Some(ts) = timestamp {
            hasher.update(ts.to_rfc3339().as_bytes());
        }
        EvidenceId(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for EvidenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFailureCategory {
    ImagePull,
    ResourceConstraint,
    OutOfMemory,
    SegmentationFault,
    ApplicationError,
    DependentContainerStopped,
    Other,
}

impl TaskFailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskFailureCategory::ImagePull => "image_pull",
            TaskFailureCategory::ResourceConstraint => "resource_constraint",
            TaskFailureCategory::OutOfMemory => "out_of_memory",
            TaskFailureCategory::SegmentationFault => "segmentation_fault",
            TaskFailureCategory::ApplicationError => "application_error",
            TaskFailureCategory::DependentContainerStopped => "dependent_container_stopped",
            TaskFailureCategory::Other => "other",
        }
    }
}

/// Image-pull failure signature taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullSignature {
    AuthenticationFailure,
    RepositoryNotFound,
    ManifestNotFound,
    RegistryUnreachable,
    Unclassified,
}

impl PullSignature {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullSignature::AuthenticationFailure => "authentication_failure",
            PullSignature::RepositoryNotFound => "repository_not_found",
            PullSignature::ManifestNotFound => "manifest_not_found",
            PullSignature::RegistryUnreachable => "registry_unreachable",
            PullSignature::Unclassified => "unclassified",
        }
    }
}

/// Classification of a service event message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceEventCategory {
    PlacementFailure,
    HealthCheckFailure,
    TaskStartFailure,
    SteadyState,
    Other,
}

/// Collaborator conditions that become evidence instead of warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCondition {
    NotFound,
    AccessDenied,
}

/// Closed taxonomy of what a piece of evidence says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    // stack
    StackMissing {
        stack: String,
    },
    StackDeleted {
        stack: String,
        deleted_at: Option<DateTime<Utc>>,
    },
    StackFailed {
        stack: String,
        status: String,
    },
    StackInProgress {
        stack: String,
        status: String,
    },
    StackHealthy {
        stack: String,
        status: String,
    },
    StackResourceFailed {
        logical_id: String,
        resource_type: String,
    },

    // service
    ServiceMissing {
        cluster: String,
        service: String,
    },
    TaskCountMismatch {
        desired: u32,
        running: u32,
        pending: u32,
    },
    ServiceSteady {
        desired: u32,
        running: u32,
    },
    DeploymentFailed {
        deployment_id: String,
    },
    ServiceEvent {
        category: ServiceEventCategory,
    },

    // task
    TaskStopped {
        task_id: String,
        service: Option<String>,
        category: TaskFailureCategory,
        exit_code: Option<i32>,
    },
    TasksRunning {
        count: u32,
    },

    // logs
    LogGroupsMissing {
        prefix: String,
    },
    LogLine {
        group: String,
        stream: String,
    },
    LogSummary {
        scanned: u32,
        errors: u32,
        warnings: u32,
    },

    // image pull
    ImagePullFailure {
        task_id: String,
        signature: PullSignature,
        image: Option<String>,
    },
    /// The registry has no repository of this name.
    RepositoryMissing {
        image: String,
        repository: String,
    },
    /// The repository exists but holds no image with this tag or digest.
    ImageMissing {
        image: String,
        repository: String,
        reference: String,
    },
    /// Hosted outside the cluster's own registry; existence unverified.
    ExternalImage {
        image: String,
        registry: String,
    },

    // network
    PortBlocked {
        security_group: String,
        port: u16,
    },
    HealthCheckPortBlocked {
        security_group: String,
        port: u16,
    },
    EgressBlocked {
        security_group: String,
    },
    SubnetWithoutRoute {
        subnet: String,
    },
    PortMismatch {
        target_group: String,
        container_port: u16,
        target_port: u16,
    },
    TargetUnhealthy {
        target_group: String,
        target_id: String,
        reason: Option<String>,
    },
    TargetsHealthy {
        target_group: String,
        count: u32,
    },
    NetworkUnconfigured {
        service: String,
    },

    // any source
    CollaboratorFailure {
        condition: FailureCondition,
        operation: String,
    },
}

impl Finding {
    /// Stable snake_case name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Finding::StackMissing { .. } => "stack_missing",
            Finding::StackDeleted { .. } => "stack_deleted",
            Finding::StackFailed { .. } => "stack_failed",
            Finding::StackInProgress { .. } => "stack_in_progress",
            Finding::StackHealthy { .. } => "stack_healthy",
            Finding::StackResourceFailed { .. } => "stack_resource_failed",
            Finding::ServiceMissing { .. } => "service_missing",
            Finding::TaskCountMismatch { .. } => "task_count_mismatch",
            Finding::ServiceSteady { .. } => "service_steady",
            Finding::DeploymentFailed { .. } => "deployment_failed",
            Finding::ServiceEvent { .. } => "service_event",
            Finding::TaskStopped { .. } => "task_stopped",
            Finding::TasksRunning { .. } => "tasks_running",
            Finding::LogGroupsMissing { .. } => "log_groups_missing",
            Finding::LogLine { .. } => "log_line",
            Finding::LogSummary { .. } => "log_summary",
            Finding::ImagePullFailure { .. } => "image_pull_failure",
            Finding::RepositoryMissing { .. } => "repository_missing",
            Finding::ImageMissing { .. } => "image_missing",
            Finding::ExternalImage { .. } => "external_image",
            Finding::PortBlocked { .. } => "port_blocked",
            Finding::HealthCheckPortBlocked { .. } => "health_check_port_blocked",
            Finding::EgressBlocked { .. } => "egress_blocked",
            Finding::SubnetWithoutRoute { .. } => "subnet_without_route",
            Finding::PortMismatch { .. } => "port_mismatch",
            Finding::TargetUnhealthy { .. } => "target_unhealthy",
            Finding::TargetsHealthy { .. } => "targets_healthy",
            Finding::NetworkUnconfigured { .. } => "network_unconfigured",
            Finding::CollaboratorFailure { .. } => "collaborator_failure",
        }
    }
}

/// One normalized observation.
///
/// Fields are private: the id is derived from the content, so evidence can
/// only be built through the constructors and is immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    id: EvidenceId,
    source: EvidenceSource,
    severity: Severity,
    timestamp: Option<DateTime<Utc>>,
    message: String,
    finding: Finding,
    #[serde(default)]
    raw: serde_json::Map<String, serde_json::Value>,
}

impl Evidence {
    pub fn new(
        source: EvidenceSource,
        severity: Severity,
        finding: Finding,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let id = EvidenceId::derive(source, severity, &finding, &message, None);
        Self {
            id,
            source,
            severity,
            timestamp: None,
            message,
            finding,
            raw: serde_json::Map::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self.id = EvidenceId::derive(
            self.source,
            self.severity,
            &self.finding,
            &self.message,
            self.timestamp,
        );
        self
    }

    pub fn with_optional_timestamp(self, timestamp: Option<DateTime<Utc>>) -> Self {
        match timestamp {
            Some(ts) => self.with_timestamp(ts),
            None => self,
        }
    }

    /// Attach a raw collaborator field. Not part of the id.
    pub fn with_raw(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.raw.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &EvidenceId {
        &self.id
    }

    pub fn source(&self) -> EvidenceSource {
        self.source
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn finding(&self) -> &Finding {
        &self.finding
    }

    pub fn raw(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.raw
    }
}

/// Order one fetcher's evidence: timestamped items chronologically, then
/// untimestamped items in the order they were produced. The sort is stable.
pub fn order_chronologically(evidence: &mut [Evidence]) {
    evidence.sort_by(|a, b| match (a.timestamp, b.timestamp) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}
