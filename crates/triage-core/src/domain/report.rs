//! The report assembled once per diagnostic session.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::evidence::{Evidence, EvidenceId, EvidenceSource};
use super::hypothesis::Hypothesis;
use crate::symptoms::DetectedSymptom;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// A hypothesis reached the resolution threshold on complete data.
    Resolved,
    /// Data is partial: a fetcher timed out, failed, or the session ran out of time.
    Degraded,
    /// Complete data, but no conclusive hypothesis.
    Unknown,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Resolved => "resolved",
            ReportStatus::Degraded => "degraded",
            ReportStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of one session. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    session_id: Uuid,
    status: ReportStatus,
    evidence: Vec<Evidence>,
    hypotheses: Vec<Hypothesis>,
    path_taken: Vec<EvidenceSource>,
    warnings: Vec<String>,
    #[serde(default)]
    symptoms: Vec<DetectedSymptom>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

/// Everything a session hands over to build a report.
#[derive(Debug, Clone)]
pub struct ReportParts {
    pub session_id: Uuid,
    pub status: ReportStatus,
    pub evidence: Vec<Evidence>,
    pub hypotheses: Vec<Hypothesis>,
    pub path_taken: Vec<EvidenceSource>,
    pub warnings: Vec<String>,
    pub symptoms: Vec<DetectedSymptom>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DiagnosticReport {
    /// Assemble a report. Hypothesis references to evidence that is not in
    /// the report are dropped, so every reference resolves.
    pub fn new(parts: ReportParts) -> Self {
        let known: HashSet<&EvidenceId> = parts.evidence.iter().map(Evidence::id).collect();
        let hypotheses = parts
            .hypotheses
            .into_iter()
            .map(|mut h| {
                h.supporting_evidence.retain(|id| known.contains(id));
                h
            })
            .collect();

        Self {
            session_id: parts.session_id,
            status: parts.status,
            evidence: parts.evidence,
            hypotheses,
            path_taken: parts.path_taken,
            warnings: parts.warnings,
            symptoms: parts.symptoms,
            started_at: parts.started_at,
            finished_at: parts.finished_at,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn status(&self) -> ReportStatus {
        self.status
    }

    pub fn evidence(&self) -> &[Evidence] {
        &self.evidence
    }

    pub fn hypotheses(&self) -> &[Hypothesis] {
        &self.hypotheses
    }

    pub fn path_taken(&self) -> &[EvidenceSource] {
        &self.path_taken
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Keywords recognised in the request's symptom text.
    pub fn symptoms(&self) -> &[DetectedSymptom] {
        &self.symptoms
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn top_hypothesis(&self) -> Option<&Hypothesis> {
        self.hypotheses.first()
    }

    pub fn evidence_by_id(&self, id: &EvidenceId) -> Option<&Evidence> {
        self.evidence.iter().find(|e| e.id() == id)
    }

    pub fn evidence_from(&self, source: EvidenceSource) -> impl Iterator<Item = &Evidence> {
        self.evidence.iter().filter(move |e| e.source() == source)
    }

    /// Supporting references that do not resolve. Always empty for reports
    /// built through [`DiagnosticReport::new`].
    pub fn dangling_references(&self) -> Vec<&EvidenceId> {
        let known: HashSet<&EvidenceId> = self.evidence.iter().map(Evidence::id).collect();
        self.hypotheses
            .iter()
            .flat_map(|h| h.supporting_evidence.iter())
            .filter(|id| !known.contains(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::evidence::{Finding, Severity};
    use crate::domain::hypothesis::CauseCode;

    #[test]
    fn test_new_drops_dangling_references() {
        let kept = Evidence::new(
            EvidenceSource::Task,
            Severity::Error,
            Finding::TasksRunning { count: 0 },
            "no tasks running",
        );
        let stray = Evidence::new(
            EvidenceSource::Logs,
            Severity::Info,
            Finding::LogSummary {
                scanned: 0,
                errors: 0,
                warnings: 0,
            },
            "not in report",
        );
        let hypothesis = Hypothesis::new(CauseCode::ApplicationCrash, 0.5)
            .with_evidence([kept.id().clone(), stray.id().clone()]);

        let now = Utc::now();
        let report = DiagnosticReport::new(ReportParts {
            session_id: Uuid::new_v4(),
            status: ReportStatus::Resolved,
            evidence: vec![kept.clone()],
            hypotheses: vec![hypothesis],
            path_taken: vec![EvidenceSource::Task],
            warnings: vec![],
            symptoms: vec![],
            started_at: now,
            finished_at: now,
        });

        assert!(report.dangling_references().is_empty());
        assert_eq!(
            report.top_hypothesis().unwrap().supporting_evidence,
            vec![kept.id().clone()]
        );
        assert!(report.evidence_by_id(kept.id()).is_some());
        assert_eq!(report.evidence_from(EvidenceSource::Task).count(), 1);
    }
}
