//! Guidance router: resolves identifiers, inspects the service once and picks
//! a fetch plan from an explicit decision table.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use cluster_probe::{Collaborators, TargetState};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use crate::config::TriageConfig;
use crate::domain::{EvidenceSource, FetchError, Identifiers, TriageError};
use crate::fetch::{CallControls, Target};
use crate::obs;
use crate::symptoms::{self, DetectedSymptom, SymptomCategory};

/// Cluster assumed when only a service is named.
pub const DEFAULT_CLUSTER: &str = "default";

/// Symptom words that point at image retrieval. Matched as whole words,
/// plural allowed.
pub const IMAGE_KEYWORDS: &[&str] = &["pull", "image", "manifest", "registry", "registries", "ecr"];

/// Which row of the decision table matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    ServiceMissing,
    TaskCountMismatch,
    TargetsUnhealthy,
    ImageSymptom,
    BroadSweep,
    /// A targeted action: one fetcher, no routing.
    Direct,
}

impl Branch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Branch::ServiceMissing => "service_missing",
            Branch::TaskCountMismatch => "task_count_mismatch",
            Branch::TargetsUnhealthy => "targets_unhealthy",
            Branch::ImageSymptom => "image_symptom",
            Branch::BroadSweep => "broad_sweep",
            Branch::Direct => "direct",
        }
    }
}

/// What the router learned from the symptom text and its single service
/// inspection. `None` means unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingFacts {
    pub service_found: Option<bool>,
    pub counts_mismatch: Option<bool>,
    pub targets_unhealthy: Option<bool>,
    pub image_symptom: bool,
    pub network_symptom: bool,
}

impl RoutingFacts {
    pub fn from_symptom(symptom: &str, detected: &[DetectedSymptom]) -> Self {
        Self {
            image_symptom: mentions_image(symptom),
            network_symptom: symptoms::mentions(detected, SymptomCategory::Network),
            ..Self::default()
        }
    }
}

/// One row: condition over the routing facts and the plan it selects.
pub struct DecisionRule {
    pub branch: Branch,
    pub condition: fn(&RoutingFacts) -> bool,
    pub plan: &'static [EvidenceSource],
}

use EvidenceSource::{ImagePull, Logs, Network, Service, Stack, Task};

/// Evaluated top to bottom; the first matching row wins. The last row
/// always matches.
pub static DECISION_TABLE: [DecisionRule; 5] = [
    DecisionRule {
        branch: Branch::ServiceMissing,
        condition: |f| f.service_found == Some(false),
        plan: &[Stack, Service],
    },
    DecisionRule {
        branch: Branch::TaskCountMismatch,
        condition: |f| f.counts_mismatch == Some(true),
        plan: &[Service, Task],
    },
    DecisionRule {
        branch: Branch::TargetsUnhealthy,
        condition: |f| f.targets_unhealthy == Some(true),
        plan: &[Network, Logs],
    },
    DecisionRule {
        branch: Branch::ImageSymptom,
        condition: |f| f.image_symptom,
        plan: &[ImagePull, Stack, Service, Task, Logs],
    },
    DecisionRule {
        branch: Branch::BroadSweep,
        condition: |_| true,
        plan: &[Stack, Service, Task, Logs],
    },
];

/// Pick a plan for the given facts.
///
/// A network symptom appends the network fetcher to any plan that lacks it,
/// provided the service is known to exist.
pub fn decide(facts: &RoutingFacts) -> (Branch, Vec<EvidenceSource>) {
    let (branch, mut plan) = DECISION_TABLE
        .iter()
        .find(|rule| (rule.condition)(facts))
        .map(|rule| (rule.branch, rule.plan.to_vec()))
        .unwrap_or((Branch::BroadSweep, vec![Stack, Service, Task, Logs]));
    if facts.network_symptom && facts.service_found == Some(true) && !plan.contains(&Network) {
        plan.push(Network);
    }
    (branch, plan)
}

fn image_regex() -> Option<&'static Regex> {
    static IMAGE: OnceLock<Option<Regex>> = OnceLock::new();
    IMAGE
        .get_or_init(|| symptoms::keyword_regex(IMAGE_KEYWORDS, "s?"))
        .as_ref()
}

pub fn mentions_image(symptom: &str) -> bool {
    image_regex().is_some_and(|re| re.is_match(symptom))
}

/// An ordered fetch plan against a resolved target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticPlan {
    pub branch: Branch,
    pub steps: Vec<EvidenceSource>,
    pub target: Target,
    /// Problems met while routing; carried into the report.
    pub warnings: Vec<String>,
    /// Keywords recognised in the symptom text.
    #[serde(default)]
    pub symptoms: Vec<DetectedSymptom>,
}

impl DiagnosticPlan {
    /// Run exactly one fetcher.
    pub fn direct(source: EvidenceSource, target: Target) -> Self {
        Self {
            branch: Branch::Direct,
            steps: vec![source],
            target,
            warnings: Vec::new(),
            symptoms: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn with_symptoms(mut self, symptoms: Vec<DetectedSymptom>) -> Self {
        self.symptoms = symptoms;
        self
    }
}

/// Routes requests. Owns nothing but collaborator handles and limits.
#[derive(Debug, Clone)]
pub struct GuidanceRouter {
    collaborators: Collaborators,
    config: TriageConfig,
}

impl GuidanceRouter {
    pub fn new(collaborators: Collaborators, config: TriageConfig) -> Self {
        Self {
            collaborators,
            config,
        }
    }

    fn controls(&self) -> CallControls {
        CallControls::for_fetcher(
            &self.config.fetch,
            Arc::new(Semaphore::new(self.config.session.max_concurrent_calls)),
        )
    }

    /// Resolve identifiers to a concrete target.
    ///
    /// An explicit cluster wins; otherwise clusters whose names contain the
    /// app name are preferred, then the `default` cluster if it runs a
    /// matching service, then the `<app>-cluster` convention. A bare service
    /// implies the `default` cluster. Discovery failures fall back to these
    /// conventions and are returned as warnings.
    pub async fn resolve_target(
        &self,
        ids: &Identifiers,
        params: &BTreeMap<String, String>,
    ) -> (Target, Vec<String>) {
        let controls = self.controls();
        let app = ids.app_name.as_deref();
        let mut warnings = Vec::new();

        let cluster = match (&ids.cluster, app) {
            (Some(cluster), _) => cluster.clone(),
            (None, Some(app)) => self.discover_cluster(&controls, app, &mut warnings).await,
            (None, None) => DEFAULT_CLUSTER.to_string(),
        };

        let service = match (&ids.service, app) {
            (Some(service), _) => Some(service.clone()),
            (None, Some(app)) => {
                self.discover_service(&controls, &cluster, app, &mut warnings)
                    .await
            }
            (None, None) => None,
        };

        let stack_name = params
            .get("stack_name")
            .cloned()
            .or_else(|| ids.app_name.clone())
            .or_else(|| service.clone());

        let target = Target {
            cluster,
            service,
            app_name: ids.app_name.clone(),
            stack_name,
        };
        (target, warnings)
    }

    async fn discover_cluster(
        &self,
        controls: &CallControls,
        app: &str,
        warnings: &mut Vec<String>,
    ) -> String {
        let needle = app.to_lowercase();
        let api = &self.collaborators.cluster;
        let clusters = controls
            .collect_pages("ecs:ListClusters", |token| api.list_clusters(token))
            .await;
        if let Some(err) = &clusters.error {
            debug!(error = %err, "cluster discovery failed");
            warnings.push(format!(
                "router: ecs:ListClusters failed ({err}); cluster for {app} chosen by convention"
            ));
        }
        let mut related: Vec<String> = clusters
            .items
            .into_iter()
            .map(|c| c.name)
            .filter(|name| name.to_lowercase().contains(&needle))
            .collect();
        related.sort();
        if let Some(first) = related.into_iter().next() {
            return first;
        }

        if self
            .discover_service(controls, DEFAULT_CLUSTER, app, warnings)
            .await
            .is_some()
        {
            return DEFAULT_CLUSTER.to_string();
        }
        format!("{app}-cluster")
    }

    /// Service in `cluster` named exactly `app`, else the first containing it.
    async fn discover_service(
        &self,
        controls: &CallControls,
        cluster: &str,
        app: &str,
        warnings: &mut Vec<String>,
    ) -> Option<String> {
        let needle = app.to_lowercase();
        let api = &self.collaborators.cluster;
        let services = controls
            .collect_pages("ecs:ListServices", |token| api.list_services(cluster, token))
            .await;
        match &services.error {
            // An absent cluster simply has no services.
            Some(FetchError::NotFound { .. }) | None => {}
            Some(err) => {
                debug!(cluster = %cluster, error = %err, "service discovery failed");
                warnings.push(format!(
                    "router: ecs:ListServices failed for cluster {cluster} ({err})"
                ));
            }
        }
        let mut names: Vec<String> = services.items;
        names.sort();
        if let Some(exact) = names.iter().find(|n| n.eq_ignore_ascii_case(app)) {
            return Some(exact.clone());
        }
        names
            .into_iter()
            .find(|n| n.to_lowercase().contains(&needle))
    }

    /// The only service of `cluster`. Otherwise the reason there is none,
    /// phrased for a warning.
    async fn sole_service(&self, cluster: &str) -> Result<String, String> {
        let controls = self.controls();
        let api = &self.collaborators.cluster;
        let services = controls
            .collect_pages("ecs:ListServices", |token| api.list_services(cluster, token))
            .await;
        if let Some(err) = &services.error {
            return Err(format!("ecs:ListServices failed ({err})"));
        }
        match services.items.as_slice() {
            [only] => Ok(only.clone()),
            all => Err(format!("cluster {cluster} has {} services", all.len())),
        }
    }

    /// Service existence, task counts and (when counts agree and a load
    /// balancer is bound) the first page of target health.
    async fn inspect_service(
        &self,
        target: &Target,
        facts: &mut RoutingFacts,
    ) -> Result<(), FetchError> {
        let Some(service) = target.service_name() else {
            return Ok(());
        };
        let controls = self.controls();
        let api = &self.collaborators.cluster;
        let svc = match controls
            .call("ecs:DescribeServices", || {
                api.describe_service(&target.cluster, service)
            })
            .await
        {
            Ok(svc) if svc.is_inactive() => {
                facts.service_found = Some(false);
                return Ok(());
            }
            Ok(svc) => svc,
            Err(FetchError::NotFound { .. }) => {
                facts.service_found = Some(false);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        facts.service_found = Some(true);
        facts.counts_mismatch = Some(svc.desired_count != svc.running_count);
        if svc.desired_count != svc.running_count {
            return Ok(());
        }

        let Some(binding) = svc.load_balancers.first() else {
            facts.targets_unhealthy = Some(false);
            return Ok(());
        };
        let lb = &self.collaborators.load_balancers;
        let page = controls
            .call("elbv2:DescribeTargetHealth", || {
                lb.describe_target_health(&binding.target_group_arn, None)
            })
            .await?;
        facts.targets_unhealthy = Some(
            page.items
                .iter()
                .any(|t| t.state == TargetState::Unhealthy),
        );
        Ok(())
    }

    /// Triage a symptom into a plan.
    ///
    /// Fails with `InsufficientContext` only when the request carries no
    /// identifier at all. A bare cluster whose single service cannot be
    /// determined is swept without a service, with the reason as a warning.
    #[instrument(skip_all, fields(branch = tracing::field::Empty))]
    pub async fn route(
        &self,
        symptom: &str,
        ids: &Identifiers,
        params: &BTreeMap<String, String>,
    ) -> Result<DiagnosticPlan, TriageError> {
        if ids.is_empty() {
            return Err(TriageError::InsufficientContext(
                "no cluster, service or app name given".to_string(),
            ));
        }
        let (mut target, mut warnings) = self.resolve_target(ids, params).await;
        if target.service_name().is_none() {
            match self.sole_service(&target.cluster).await {
                Ok(service) => {
                    target.stack_name.get_or_insert_with(|| service.clone());
                    target.service = Some(service);
                }
                Err(reason) => warnings.push(format!(
                    "router: {reason}; sweeping cluster {} without a service",
                    target.cluster
                )),
            }
        }

        let detected = symptoms::detect(symptom);
        let mut facts = RoutingFacts::from_symptom(symptom, &detected);
        if let Err(err) = self.inspect_service(&target, &mut facts).await {
            warnings.push(format!(
                "router: service inspection failed ({err}); health-based routing skipped"
            ));
        }

        let (branch, steps) = decide(&facts);
        tracing::Span::current().record("branch", branch.as_str());
        obs::emit_plan_selected(branch.as_str(), &steps);
        Ok(DiagnosticPlan {
            branch,
            steps,
            target,
            warnings,
            symptoms: detected,
        })
    }
}
