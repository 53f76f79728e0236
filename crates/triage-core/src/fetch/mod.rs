//! Evidence fetchers.
//!
//! Each fetcher reads one infrastructure layer through the injected
//! collaborators and normalizes what it finds into [`Evidence`]. Fetchers hold
//! no state between calls; everything they need arrives in a [`FetchContext`].
//!
//! Collaborator failures never escape a fetcher as errors. Not-found and
//! access-denied become error-severity evidence, timeouts and exhausted
//! retries become warnings naming the fetcher. An `Err` from
//! [`Fetcher::fetch`] is reserved for unexpected failures.

pub mod controls;
pub mod image_pull;
pub mod logs;
pub mod network;
pub mod service;
pub mod stack;
pub mod task;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cluster_probe::{Collaborators, TaskRecord};
use serde::{Deserialize, Serialize};

use crate::domain::{
    order_chronologically, Evidence, EvidenceSource, FailureCondition, FetchError, Finding,
    Severity, TimeWindow,
};

pub use controls::{CallControls, Collected};
pub use image_pull::{classify_pull_failure, ImagePullFetcher};
pub use logs::LogsFetcher;
pub use network::NetworkFetcher;
pub use service::ServiceFetcher;
pub use stack::StackFetcher;
pub use task::{categorize_stop, TaskFetcher};

/// Identifiers after resolution: the cluster is always known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub cluster: String,
    pub service: Option<String>,
    pub app_name: Option<String>,
    pub stack_name: Option<String>,
}

impl Target {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            service: None,
            app_name: None,
            stack_name: None,
        }
    }

    /// Service name to look up: the explicit service, else the app name.
    pub fn service_name(&self) -> Option<&str> {
        self.service.as_deref().or(self.app_name.as_deref())
    }

    /// Conventional log group prefix, `/ecs/<cluster>/<app>`.
    pub fn log_group_prefix(&self) -> String {
        match self.app_name.as_deref().or(self.service.as_deref()) {
            Some(app) => format!("/ecs/{}/{}", self.cluster, app),
            None => format!("/ecs/{}", self.cluster),
        }
    }
}

/// A task the task fetcher saw, passed on to the logs fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHint {
    pub task_id: String,
    pub service: Option<String>,
    pub task_definition_arn: String,
    pub stopped: bool,
}

/// Stopped tasks count only when they stopped inside the window. A stopped
/// task without a stop time cannot be placed and is left out.
pub fn stopped_in_window(task: &TaskRecord, window: &TimeWindow) -> bool {
    task.stopped_at.is_some_and(|at| window.contains(at))
}

/// Copy of the evidence a fetcher has pushed so far, shared with the session
/// so it survives the fetcher being aborted at the deadline.
#[derive(Debug, Clone, Default)]
pub struct EvidenceSink(Arc<Mutex<Vec<Evidence>>>);

impl EvidenceSink {
    fn record(&self, evidence: &Evidence) {
        self.lock().push(evidence.clone());
    }

    /// Take everything recorded so far.
    pub fn drain(&self) -> Vec<Evidence> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Evidence>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything a fetcher reads.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub target: Target,
    pub window: TimeWindow,
    pub params: BTreeMap<String, String>,
    /// Tasks identified earlier in the session (empty unless task ran first).
    pub task_hints: Vec<TaskHint>,
    pub collaborators: Collaborators,
    pub controls: CallControls,
    pub max_log_lines: usize,
    pub sink: EvidenceSink,
}

impl FetchContext {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// An empty outcome whose evidence is mirrored into this run's sink.
    pub fn outcome(&self) -> FetchOutcome {
        FetchOutcome {
            sink: Some(self.sink.clone()),
            ..FetchOutcome::default()
        }
    }

    /// Whether a stopped task belongs to this run's window.
    pub fn stopped_in_window(&self, task: &TaskRecord) -> bool {
        stopped_in_window(task, &self.window)
    }
}

/// What one fetcher produced.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub evidence: Vec<Evidence>,
    pub warnings: Vec<String>,
    pub task_hints: Vec<TaskHint>,
    /// Further fetchers this one asks the session to run.
    pub follow_ups: Vec<EvidenceSource>,
    sink: Option<EvidenceSink>,
}

impl FetchOutcome {
    pub fn push(&mut self, evidence: Evidence) {
        if let Some(sink) = &self.sink {
            sink.record(&evidence);
        }
        self.evidence.push(evidence);
    }

    pub fn warn(&mut self, source: EvidenceSource, detail: impl std::fmt::Display) {
        self.warnings.push(format!("fetcher {source}: {detail}"));
    }

    pub fn request_follow_up(&mut self, source: EvidenceSource) {
        if !self.follow_ups.contains(&source) {
            self.follow_ups.push(source);
        }
    }

    /// Record a failed call: terminal conditions become evidence, the rest
    /// a warning that the data is partial.
    pub fn absorb(&mut self, source: EvidenceSource, err: FetchError) {
        match err {
            FetchError::NotFound { operation, detail } => self.push(
                Evidence::new(
                    source,
                    Severity::Error,
                    Finding::CollaboratorFailure {
                        condition: FailureCondition::NotFound,
                        operation: operation.clone(),
                    },
                    format!("{operation}: {detail} not found"),
                )
                .with_raw("detail", detail),
            ),
            FetchError::AccessDenied { operation, detail } => self.push(
                Evidence::new(
                    source,
                    Severity::Error,
                    Finding::CollaboratorFailure {
                        condition: FailureCondition::AccessDenied,
                        operation: operation.clone(),
                    },
                    format!("{operation}: access denied ({detail})"),
                )
                .with_raw("detail", detail),
            ),
            other @ (FetchError::Timeout { .. } | FetchError::Transient { .. }) => {
                self.warn(source, format_args!("{other}, partial data"))
            }
            FetchError::Unexpected(detail) => self.warn(source, detail),
        }
    }

    /// Note items lost to a page cap or a failure part-way through a listing.
    pub fn absorb_collected<T>(
        &mut self,
        source: EvidenceSource,
        operation: &str,
        collected: &mut Collected<T>,
    ) {
        if let Some(err) = collected.error.take() {
            self.absorb(source, err);
        }
        if collected.truncated {
            self.warn(
                source,
                format_args!("{operation} truncated at page cap, partial data"),
            );
        }
    }

    /// Put evidence in reporting order.
    pub fn finish(mut self) -> Self {
        order_chronologically(&mut self.evidence);
        self
    }
}

/// One evidence layer.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn source(&self) -> EvidenceSource;

    async fn fetch(&self, ctx: &FetchContext) -> Result<FetchOutcome, FetchError>;
}

/// The fetcher registered for each source.
#[derive(Clone)]
pub struct FetcherSet {
    fetchers: HashMap<EvidenceSource, Arc<dyn Fetcher>>,
}

impl Default for FetcherSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl FetcherSet {
    /// The built-in fetcher for every source.
    pub fn standard() -> Self {
        Self::empty()
            .with(Arc::new(StackFetcher))
            .with(Arc::new(ServiceFetcher))
            .with(Arc::new(TaskFetcher))
            .with(Arc::new(LogsFetcher))
            .with(Arc::new(ImagePullFetcher))
            .with(Arc::new(NetworkFetcher))
    }

    pub fn empty() -> Self {
        Self {
            fetchers: HashMap::new(),
        }
    }

    /// Register `fetcher` for its source, replacing any existing one.
    pub fn with(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetchers.insert(fetcher.source(), fetcher);
        self
    }

    pub fn get(&self, source: EvidenceSource) -> Option<Arc<dyn Fetcher>> {
        self.fetchers.get(&source).cloned()
    }
}

impl std::fmt::Debug for FetcherSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut sources: Vec<_> = self.fetchers.keys().collect();
        sources.sort();
        f.debug_struct("FetcherSet").field("sources", &sources).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    #[test]
    fn test_log_group_prefix() {
        let mut target = Target::new("shop-cluster");
        assert_eq!(target.log_group_prefix(), "/ecs/shop-cluster");
        target.service = Some("web".to_string());
        assert_eq!(target.log_group_prefix(), "/ecs/shop-cluster/web");
        target.app_name = Some("shop".to_string());
        assert_eq!(target.log_group_prefix(), "/ecs/shop-cluster/shop");
        assert_eq!(target.service_name(), Some("web"));
    }

    #[test]
    fn test_absorb_terminal_becomes_error_evidence() {
        let mut outcome = FetchOutcome::default();
        outcome.absorb(
            EvidenceSource::Network,
            FetchError::AccessDenied {
                operation: "ec2:DescribeSubnets".to_string(),
                detail: "not authorized".to_string(),
            },
        );
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.evidence.len(), 1);
        assert_eq!(outcome.evidence[0].severity(), Severity::Error);
    }

    #[test]
    fn test_absorb_timeout_becomes_warning_naming_fetcher() {
        let mut outcome = FetchOutcome::default();
        outcome.absorb(
            EvidenceSource::Logs,
            FetchError::Timeout {
                operation: "logs:FilterLogEvents".to_string(),
                after_ms: 2000,
            },
        );
        assert!(outcome.evidence.is_empty());
        assert!(outcome.warnings[0].starts_with("fetcher logs:"));
        assert!(outcome.warnings[0].contains("partial data"));
    }

    #[test]
    fn test_pushed_evidence_reaches_the_sink() {
        let sink = EvidenceSink::default();
        let mut outcome = FetchOutcome {
            sink: Some(sink.clone()),
            ..FetchOutcome::default()
        };
        outcome.push(Evidence::new(
            EvidenceSource::Stack,
            Severity::Info,
            Finding::StackHealthy {
                stack: "shop".to_string(),
                status: "UPDATE_COMPLETE".to_string(),
            },
            "stack shop is UPDATE_COMPLETE",
        ));
        outcome.warn(EvidenceSource::Stack, "slow");

        let drained = sink.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id(), outcome.evidence[0].id());
        assert!(sink.drain().is_empty());
    }

    #[test]
    fn test_stopped_tasks_need_a_stop_time_in_window() {
        let window = TimeWindow::new(
            "2026-10-18T09:00:00Z".parse::<DateTime<Utc>>().unwrap(),
            "2026-10-18T12:00:00Z".parse::<DateTime<Utc>>().unwrap(),
        )
        .unwrap();
        let mut task: TaskRecord = serde_json::from_str(
            r#"{"task_arn": "arn:aws:ecs:r:1:task/c/t1", "task_definition_arn": "td:1",
                "last_status": "STOPPED"}"#,
        )
        .unwrap();
        assert!(!stopped_in_window(&task, &window));

        task.stopped_at = Some("2026-10-18T10:00:00Z".parse().unwrap());
        assert!(stopped_in_window(&task, &window));
        task.stopped_at = Some("2026-10-18T08:59:59Z".parse().unwrap());
        assert!(!stopped_in_window(&task, &window));
    }

    #[test]
    fn test_standard_set_covers_every_source() {
        let set = FetcherSet::standard();
        for source in EvidenceSource::ALL {
            assert_eq!(set.get(source).map(|f| f.source()), Some(source));
        }
        assert!(FetcherSet::empty().get(EvidenceSource::Stack).is_none());
    }
}
