//! Diagnostic session: runs a plan's fetchers and assembles the report.
//!
//! Independent fetchers launch together as tokio tasks. `logs` is held back
//! until `task` settles when both are planned, so it can narrow to the tasks
//! `task` identified. Fetchers may ask for follow-ups (a stopped task with an
//! image-pull failure asks for `image_pull`); each source runs at most once.
//!
//! A session-wide deadline bounds the whole run. When it passes, in-flight
//! fetchers are aborted and the report is built from what has settled plus
//! whatever the aborted fetchers had already pushed to their sinks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use cluster_probe::Collaborators;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError};
use tokio::time::Instant;
use tracing::{debug, Instrument};
use uuid::Uuid;

use crate::config::TriageConfig;
use crate::correlator::Correlator;
use crate::domain::{
    order_chronologically, DiagnosticReport, Evidence, EvidenceSource, FetchError, Hypothesis,
    ReportParts, ReportStatus, TimeWindow,
};
use crate::fetch::{CallControls, EvidenceSink, FetchContext, FetchOutcome, FetcherSet, TaskHint};
use crate::metrics::METRICS;
use crate::obs::{self, SessionSpan};
use crate::router::DiagnosticPlan;

/// One diagnostic run. Holds no state beyond the run itself.
#[derive(Debug, Clone)]
pub struct DiagnosticSession {
    id: Uuid,
    collaborators: Collaborators,
    fetchers: FetcherSet,
    config: TriageConfig,
}

/// Bookkeeping while fetchers are in flight.
#[derive(Default)]
struct Progress {
    path_taken: Vec<EvidenceSource>,
    waiting: Vec<EvidenceSource>,
    evidence: HashMap<EvidenceSource, Vec<Evidence>>,
    warnings: Vec<String>,
    task_hints: Vec<TaskHint>,
    in_flight: HashMap<EvidenceSource, AbortHandle>,
    sinks: HashMap<EvidenceSource, EvidenceSink>,
    task_pending: bool,
}

impl Progress {
    fn ready(&mut self) -> Vec<EvidenceSource> {
        let task_pending = self.task_pending;
        let (ready, held): (Vec<_>, Vec<_>) = self
            .waiting
            .drain(..)
            .partition(|s| !(task_pending && *s == EvidenceSource::Logs));
        self.waiting = held;
        ready
    }

    fn is_known(&self, source: EvidenceSource) -> bool {
        self.path_taken.contains(&source) || self.waiting.contains(&source)
    }

    fn settle(
        &mut self,
        source: EvidenceSource,
        result: Result<Result<FetchOutcome, FetchError>, JoinError>,
    ) {
        self.in_flight.remove(&source);
        self.sinks.remove(&source);
        if source == EvidenceSource::Task {
            self.task_pending = false;
        }

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(FetchError::Unexpected(detail))) => {
                self.warnings
                    .push(format!("fetcher {source} failed unexpectedly: {detail}"));
                return;
            }
            Ok(Err(err)) => {
                let mut outcome = FetchOutcome::default();
                outcome.absorb(source, err);
                outcome
            }
            Err(join) => {
                self.warnings.push(format!(
                    "fetcher {source} failed unexpectedly: {}",
                    if join.is_panic() { "panicked" } else { "cancelled" }
                ));
                return;
            }
        };

        obs::emit_fetcher_settled(source, outcome.evidence.len(), outcome.warnings.len());
        if source == EvidenceSource::Task {
            self.task_hints = outcome.task_hints;
        }
        for follow_up in outcome.follow_ups {
            if !self.is_known(follow_up) {
                debug!(
                    requested_by = %source,
                    follow_up = %follow_up,
                    "queueing follow-up fetcher"
                );
                self.waiting.push(follow_up);
            }
        }
        self.warnings.extend(outcome.warnings);
        self.evidence.entry(source).or_default().extend(outcome.evidence);
    }
}

impl DiagnosticSession {
    pub fn new(collaborators: Collaborators, fetchers: FetcherSet, config: TriageConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            collaborators,
            fetchers,
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Execute `plan` and build the report. Never fails: every problem ends
    /// up as evidence or a warning.
    pub async fn run(
        &self,
        plan: &DiagnosticPlan,
        window: TimeWindow,
        params: &BTreeMap<String, String>,
    ) -> DiagnosticReport {
        let span = SessionSpan::new(self.id);
        self.execute(plan, window, params)
            .instrument(span.span().clone())
            .await
    }

    async fn execute(
        &self,
        plan: &DiagnosticPlan,
        window: TimeWindow,
        params: &BTreeMap<String, String>,
    ) -> DiagnosticReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let deadline = clock + self.config.session.timeout();
        let limiter = Arc::new(Semaphore::new(self.config.session.max_concurrent_calls));
        METRICS.inc_sessions();
        obs::emit_session_started(plan.branch.as_str(), plan.steps.len());

        let mut progress = Progress {
            warnings: plan.warnings.clone(),
            task_pending: plan.steps.contains(&EvidenceSource::Task),
            ..Progress::default()
        };
        for step in &plan.steps {
            if !progress.waiting.contains(step) {
                progress.waiting.push(*step);
            }
        }

        let mut running = FuturesUnordered::new();
        let mut timed_out = false;
        loop {
            for source in progress.ready() {
                let Some(fetcher) = self.fetchers.get(source) else {
                    progress
                        .warnings
                        .push(format!("fetcher {source}: not registered, skipped"));
                    if source == EvidenceSource::Task {
                        progress.task_pending = false;
                    }
                    continue;
                };

                let fetcher_deadline =
                    (Instant::now() + self.config.fetch.fetcher_budget()).min(deadline);
                let sink = EvidenceSink::default();
                let ctx = FetchContext {
                    target: plan.target.clone(),
                    window,
                    params: params.clone(),
                    task_hints: if source == EvidenceSource::Logs {
                        progress.task_hints.clone()
                    } else {
                        Vec::new()
                    },
                    collaborators: self.collaborators.clone(),
                    controls: CallControls::new(
                        self.config.fetch.clone(),
                        limiter.clone(),
                        fetcher_deadline,
                    ),
                    max_log_lines: self.config.max_log_lines,
                    sink: sink.clone(),
                };

                obs::emit_fetcher_launched(source, progress.path_taken.len());
                progress.path_taken.push(source);
                let handle = tokio::spawn(
                    async move { fetcher.fetch(&ctx).await }.in_current_span(),
                );
                progress.in_flight.insert(source, handle.abort_handle());
                progress.sinks.insert(source, sink);
                running.push(async move { (source, handle.await) });
            }

            if running.is_empty() {
                // Logs may still be held if task was never registered.
                if progress.waiting.is_empty() {
                    break;
                }
                progress.task_pending = false;
                continue;
            }

            match tokio::time::timeout_at(deadline, running.next()).await {
                Ok(Some((source, result))) => progress.settle(source, result),
                Ok(None) => break,
                Err(_elapsed) => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            self.cut_short(&mut progress);
        }
        drop(running);

        let evidence: Vec<Evidence> = progress
            .path_taken
            .iter()
            .filter_map(|s| progress.evidence.remove(s))
            .flatten()
            .collect();
        let correlation = Correlator::new(self.config.correlation.clone()).analyze(evidence);

        let threshold = self.config.correlation.resolved_threshold;
        let status = if timed_out || !progress.warnings.is_empty() {
            ReportStatus::Degraded
        } else if correlation
            .hypotheses
            .first()
            .is_some_and(|h| h.is_conclusive() && h.confidence >= threshold)
        {
            ReportStatus::Resolved
        } else {
            ReportStatus::Unknown
        };

        let mut warnings = progress.warnings;
        warnings.extend(correlation.warnings);
        let hypotheses: Vec<Hypothesis> = correlation.hypotheses;

        let duration_ms = clock.elapsed().as_millis() as u64;
        obs::emit_session_finished(
            status,
            duration_ms,
            correlation.evidence.len(),
            hypotheses.len(),
        );
        METRICS.flush();

        DiagnosticReport::new(ReportParts {
            session_id: self.id,
            status,
            evidence: correlation.evidence,
            hypotheses,
            path_taken: progress.path_taken,
            warnings,
            symptoms: plan.symptoms.clone(),
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Abort what is still running and say so, one warning per fetcher.
    /// Evidence an aborted fetcher already pushed is kept.
    fn cut_short(&self, progress: &mut Progress) {
        let budget_ms = self.config.session.timeout_ms;
        let mut pending: Vec<EvidenceSource> = progress
            .path_taken
            .iter()
            .copied()
            .filter(|s| progress.in_flight.contains_key(s))
            .collect();
        for source in &pending {
            if let Some(handle) = progress.in_flight.remove(source) {
                handle.abort();
            }
            let mut partial = progress
                .sinks
                .remove(source)
                .map(|sink| sink.drain())
                .unwrap_or_default();
            order_chronologically(&mut partial);
            progress.warnings.push(format!(
                "fetcher {source} timed out after session budget of {budget_ms} ms, \
                 partial data ({} evidence kept)",
                partial.len()
            ));
            progress.evidence.entry(*source).or_default().extend(partial);
        }
        for source in progress.waiting.drain(..) {
            progress
                .warnings
                .push(format!("fetcher {source} not started before session timeout"));
            pending.push(source);
        }
        METRICS.inc_session_timeouts();
        obs::emit_session_timed_out(budget_ms, &pending);
    }
}
