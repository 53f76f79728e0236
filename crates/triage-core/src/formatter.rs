//! Stable response schema and its text rendering.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DiagnosticReport, Evidence, Hypothesis, ReportStatus};

/// Summary used when no hypothesis says anything.
pub const INSUFFICIENT_EVIDENCE: &str = "insufficient evidence to name a root cause";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceView {
    pub id: String,
    pub source: String,
    pub severity: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisView {
    pub cause_code: String,
    pub confidence: f64,
    pub supporting_evidence: Vec<String>,
    pub recommended_actions: Vec<String>,
}

/// The response returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedResponse {
    pub status: ReportStatus,
    pub summary: String,
    pub path_taken: Vec<String>,
    pub evidence: Vec<EvidenceView>,
    pub hypotheses: Vec<HypothesisView>,
    pub warnings: Vec<String>,
    /// Symptom keywords by category; only categories that matched appear.
    #[serde(default)]
    pub detected_symptoms: BTreeMap<String, Vec<String>>,
}

impl FormattedResponse {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn evidence_view(e: &Evidence) -> EvidenceView {
    EvidenceView {
        id: e.id().to_string(),
        source: e.source().as_str().to_string(),
        severity: e.severity().as_str().to_string(),
        timestamp: e.timestamp(),
        message: e.message().to_string(),
    }
}

fn hypothesis_view(h: &Hypothesis) -> HypothesisView {
    HypothesisView {
        cause_code: h.cause_code.as_str().to_string(),
        // Rounded to two decimals.
        confidence: (h.confidence * 100.0).round() / 100.0,
        supporting_evidence: h.supporting_evidence.iter().map(|id| id.to_string()).collect(),
        recommended_actions: h.recommended_actions.clone(),
    }
}

/// One line derived from the top hypothesis.
pub fn summarize(report: &DiagnosticReport) -> String {
    match report.top_hypothesis() {
        Some(top) if top.confidence > 0.0 => {
            let lead = top
                .recommended_actions
                .first()
                .map(|a| format!("; next: {a}"))
                .unwrap_or_default();
            format!(
                "likely cause: {} ({:.0}% confidence, {} supporting evidence){lead}",
                top.cause_code,
                top.confidence * 100.0,
                top.supporting_evidence.len()
            )
        }
        _ => INSUFFICIENT_EVIDENCE.to_string(),
    }
}

/// Render a report into the response schema. Total: never fails.
pub fn format(report: &DiagnosticReport) -> FormattedResponse {
    FormattedResponse {
        status: report.status(),
        summary: summarize(report),
        path_taken: report
            .path_taken()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect(),
        evidence: report.evidence().iter().map(evidence_view).collect(),
        hypotheses: report.hypotheses().iter().map(hypothesis_view).collect(),
        warnings: report.warnings().to_vec(),
        detected_symptoms: report.symptoms().iter().fold(BTreeMap::new(), |mut by, d| {
            by.entry(d.category.as_str().to_string())
                .or_insert_with(Vec::new)
                .push(d.keyword.clone());
            by
        }),
    }
}

/// Plain-text rendering for terminals.
pub fn render_text(response: &FormattedResponse) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "status: {}", response.status);
    let _ = writeln!(out, "summary: {}", response.summary);
    let _ = writeln!(out, "path: {}", response.path_taken.join(" -> "));
    for (category, keywords) in &response.detected_symptoms {
        let _ = writeln!(out, "symptoms ({category}): {}", keywords.join(", "));
    }

    if !response.hypotheses.is_empty() {
        let _ = writeln!(out, "\nhypotheses:");
        for (i, h) in response.hypotheses.iter().enumerate() {
            let _ = writeln!(
                out,
                "  {}. {} ({:.2}, {} evidence)",
                i + 1,
                h.cause_code,
                h.confidence,
                h.supporting_evidence.len()
            );
            for action in &h.recommended_actions {
                let _ = writeln!(out, "     - {action}");
            }
        }
    }

    if !response.evidence.is_empty() {
        let _ = writeln!(out, "\nevidence:");
        for e in &response.evidence {
            let when = e
                .timestamp
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            let short: String = e.id.chars().take(8).collect();
            let _ = writeln!(
                out,
                "  [{short}] {:<10} {:<7} {when}  {}",
                e.source, e.severity, e.message
            );
        }
    }

    if !response.warnings.is_empty() {
        let _ = writeln!(out, "\nwarnings:");
        for w in &response.warnings {
            let _ = writeln!(out, "  ! {w}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CauseCode, EvidenceSource, Finding, ReportParts, Severity};
    use crate::symptoms;
    use uuid::Uuid;

    fn report(hypotheses: Vec<Hypothesis>, evidence: Vec<Evidence>) -> DiagnosticReport {
        DiagnosticReport::new(ReportParts {
            session_id: Uuid::new_v4(),
            status: ReportStatus::Unknown,
            evidence,
            hypotheses,
            path_taken: vec![EvidenceSource::Stack, EvidenceSource::Service],
            warnings: vec![],
            symptoms: symptoms::detect("tasks crash, load balancer unhealthy"),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        })
    }

    #[test]
    fn test_zero_confidence_is_insufficient_evidence() {
        let r = report(vec![Hypothesis::unknown()], vec![]);
        let response = format(&r);
        assert_eq!(response.summary, INSUFFICIENT_EVIDENCE);
        assert_eq!(response.path_taken, vec!["stack", "service"]);

        let empty = report(vec![], vec![]);
        assert_eq!(summarize(&empty), INSUFFICIENT_EVIDENCE);
    }

    #[test]
    fn test_summary_names_top_cause() {
        let e = Evidence::new(
            EvidenceSource::Stack,
            Severity::Error,
            Finding::StackFailed {
                stack: "shop".to_string(),
                status: "CREATE_FAILED".to_string(),
            },
            "stack shop is CREATE_FAILED",
        );
        let h = Hypothesis::new(CauseCode::ProvisioningFailed, 0.854)
            .with_evidence([e.id().clone()])
            .with_action("Inspect the failed stack resources");
        let response = format(&report(vec![h], vec![e]));

        assert!(response.summary.starts_with("likely cause: provisioning_failed (85%"));
        assert_eq!(response.hypotheses[0].confidence, 0.85);
        assert_eq!(
            response.hypotheses[0].supporting_evidence,
            vec![response.evidence[0].id.clone()]
        );
    }

    #[test]
    fn test_json_shape_is_stable() {
        let response = format(&report(vec![Hypothesis::unknown()], vec![]));
        let value: serde_json::Value =
            serde_json::from_str(&response.to_json().unwrap()).unwrap();
        for key in [
            "status",
            "summary",
            "path_taken",
            "evidence",
            "hypotheses",
            "warnings",
            "detected_symptoms",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["status"], "unknown");
        assert_eq!(value["hypotheses"][0]["cause_code"], "unknown");
        assert_eq!(
            value["detected_symptoms"]["network"],
            serde_json::json!(["load balancer", "unhealthy"])
        );
        assert_eq!(value["detected_symptoms"]["task"], serde_json::json!(["task", "crash"]));
    }

    #[test]
    fn test_render_text_lists_sections() {
        let text = render_text(&format(&report(vec![Hypothesis::unknown()], vec![])));
        assert!(text.contains("status: unknown"));
        assert!(text.contains("path: stack -> service"));
        assert!(text.contains("symptoms (task): task, crash"));
        assert!(text.contains("1. unknown"));
    }
}
