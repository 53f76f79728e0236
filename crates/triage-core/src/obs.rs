//! Structured lifecycle events for diagnostic sessions.
//!
//! Every session runs inside a `triage.session` span carrying its id, so the
//! fetcher events below are attributable without repeating the id.

use tracing::{info, warn, Span};
use uuid::Uuid;

use crate::domain::{EvidenceSource, ReportStatus};

/// The span a session's future is instrumented with.
///
/// # Example
///
/// ```ignore
/// let span = SessionSpan::new(session_id);
/// session.run(plan).instrument(span.span().clone()).await;
/// ```
#[derive(Debug, Clone)]
pub struct SessionSpan {
    span: Span,
}

impl SessionSpan {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            span: tracing::info_span!("triage.session", session_id = %session_id),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

pub fn emit_plan_selected(branch: &str, plan: &[EvidenceSource]) {
    info!(
        event = "router.plan_selected",
        branch = %branch,
        plan = ?plan.iter().map(EvidenceSource::as_str).collect::<Vec<_>>(),
    );
}

pub fn emit_session_started(branch: &str, plan_len: usize) {
    info!(event = "session.started", branch = %branch, plan_len = plan_len);
}

pub fn emit_fetcher_launched(source: EvidenceSource, position: usize) {
    info!(event = "fetcher.launched", source = %source, position = position);
}

pub fn emit_fetcher_settled(source: EvidenceSource, evidence: usize, warnings: usize) {
    info!(
        event = "fetcher.settled",
        source = %source,
        evidence = evidence,
        warnings = warnings,
    );
}

/// Emitted once per session that runs out of time, naming what was cut short.
pub fn emit_session_timed_out(budget_ms: u64, pending: &[EvidenceSource]) {
    warn!(
        event = "session.timed_out",
        budget_ms = budget_ms,
        pending = ?pending.iter().map(EvidenceSource::as_str).collect::<Vec<_>>(),
    );
}

pub fn emit_session_finished(
    status: ReportStatus,
    duration_ms: u64,
    evidence: usize,
    hypotheses: usize,
) {
    info!(
        event = "session.finished",
        status = %status,
        duration_ms = duration_ms,
        evidence = evidence,
        hypotheses = hypotheses,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_span_create() {
        let span = SessionSpan::new(Uuid::new_v4());
        let _entered = span.span().enter();
        emit_session_started("broad_sweep", 4);
        emit_fetcher_launched(EvidenceSource::Stack, 0);
    }
}
