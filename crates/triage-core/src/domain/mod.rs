//! Domain types for deploy-triage.

pub mod error;
pub mod evidence;
pub mod hypothesis;
pub mod report;
pub mod request;

pub use error::{FetchError, Result, TriageError, ValidationError};
pub use evidence::{
    order_chronologically, Evidence, EvidenceId, EvidenceSource, FailureCondition, Finding,
    PullSignature, ServiceEventCategory, Severity, TaskFailureCategory, TAXONOMY_VERSION,
};
pub use hypothesis::{CauseCode, Hypothesis};
pub use report::{DiagnosticReport, ReportParts, ReportStatus};
pub use request::{Action, DiagnosticRequest, Identifiers, TimeWindow, MAX_LOOKBACK_SECS};
