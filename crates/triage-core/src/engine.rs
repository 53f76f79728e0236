//! Engine entry point: validate, plan, run, report.

use chrono::Utc;
use cluster_probe::Collaborators;
use tracing::info;

use crate::config::TriageConfig;
use crate::domain::{Action, DiagnosticReport, DiagnosticRequest, Result, TimeWindow};
use crate::fetch::FetcherSet;
use crate::formatter::{self, FormattedResponse};
use crate::router::{DiagnosticPlan, GuidanceRouter};
use crate::session::DiagnosticSession;
use crate::symptoms;

/// Stateless between requests; cheap to clone.
#[derive(Debug, Clone)]
pub struct TriageEngine {
    collaborators: Collaborators,
    fetchers: FetcherSet,
    config: TriageConfig,
}

impl TriageEngine {
    pub fn new(collaborators: Collaborators, config: TriageConfig) -> Self {
        Self {
            collaborators,
            fetchers: FetcherSet::standard(),
            config,
        }
    }

    /// Replace the fetcher registry (tests swap in stubs).
    pub fn with_fetchers(mut self, fetchers: FetcherSet) -> Self {
        self.fetchers = fetchers;
        self
    }

    pub fn config(&self) -> &TriageConfig {
        &self.config
    }

    fn router(&self) -> GuidanceRouter {
        GuidanceRouter::new(self.collaborators.clone(), self.config.clone())
    }

    /// The plan a request would run. `guidance` goes through the router;
    /// every other action runs its one fetcher against the resolved target.
    pub async fn plan(&self, request: &DiagnosticRequest) -> Result<DiagnosticPlan> {
        request.validate()?;
        let router = self.router();
        let ids = request.identifiers();
        match request.action().source() {
            None => router.route(request.symptom(), &ids, request.extra_params()).await,
            Some(source) => {
                let (target, warnings) = router.resolve_target(&ids, request.extra_params()).await;
                Ok(DiagnosticPlan::direct(source, target)
                    .with_warnings(warnings)
                    .with_symptoms(symptoms::detect(request.symptom())))
            }
        }
    }

    /// Run a request to a report. Only validation and routing failures are
    /// returned as errors; everything else degrades the report.
    pub async fn diagnose(&self, request: &DiagnosticRequest) -> Result<DiagnosticReport> {
        let plan = self.plan(request).await?;
        let window = request
            .time_window()
            .unwrap_or_else(|| TimeWindow::last(self.config.default_window_secs, Utc::now()));

        let session = DiagnosticSession::new(
            self.collaborators.clone(),
            self.fetchers.clone(),
            self.config.clone(),
        );
        info!(
            session_id = %session.id(),
            action = %request.action(),
            cluster = %plan.target.cluster,
            branch = plan.branch.as_str(),
            "diagnosis starting"
        );
        Ok(session.run(&plan, window, request.extra_params()).await)
    }

    pub async fn diagnose_formatted(
        &self,
        request: &DiagnosticRequest,
    ) -> Result<FormattedResponse> {
        let report = self.diagnose(request).await?;
        Ok(formatter::format(&report))
    }
}
