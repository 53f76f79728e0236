//! Triage-Core: guided troubleshooting for failed container-service deployments
//!
//! ## Layer 1 - Diagnosis
//!
//! A request flows router -> session -> fetchers -> correlator -> formatter.
//! The engine only reads infrastructure state through the collaborators in
//! `cluster_probe`; it never mutates anything and keeps nothing between
//! requests.
//!
//! ## Key Components
//!
//! - `TriageEngine`: validates a request, plans it and runs the session
//! - `GuidanceRouter`: identifier resolution plus the decision table
//! - `symptoms`: keyword categories recognised in the symptom text
//! - `fetch`: one fetcher per evidence layer, with shared call controls
//! - `Correlator`: rule table producing ranked hypotheses
//! - `formatter`: the stable response schema and a text rendering

pub mod config;
pub mod correlator;
pub mod domain;
pub mod engine;
pub mod fetch;
pub mod formatter;
pub mod metrics;
pub mod obs;
pub mod router;
pub mod session;
pub mod symptoms;
pub mod telemetry;

pub use config::{CorrelationWeights, FetchPolicy, SessionConfig, TriageConfig, ENV_PREFIX};
pub use correlator::{consistency_gaps, merge, Correlation, CorrelationRule, Correlator, RULES};
pub use domain::{
    Action, CauseCode, DiagnosticReport, DiagnosticRequest, Evidence, EvidenceId, EvidenceSource,
    FetchError, Finding, Hypothesis, Identifiers, PullSignature, ReportStatus, Result, Severity,
    TimeWindow, TriageError, ValidationError,
};
pub use engine::TriageEngine;
pub use fetch::{FetchContext, FetchOutcome, Fetcher, FetcherSet, Target};
pub use formatter::{format, render_text, FormattedResponse};
pub use router::{decide, Branch, DiagnosticPlan, GuidanceRouter, RoutingFacts, DECISION_TABLE};
pub use session::DiagnosticSession;
pub use symptoms::{DetectedSymptom, SymptomCategory};

pub use metrics::METRICS;
pub use obs::SessionSpan;
pub use telemetry::init_tracing;

/// deploy-triage version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
