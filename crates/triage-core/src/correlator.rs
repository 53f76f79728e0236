//! Evidence correlation: merging, consistency gaps and ranked hypotheses.
//!
//! Hypotheses come from an ordered rule table. A rule fires when any evidence
//! matches its trigger; evidence matching its corroboration predicate is
//! attached as support. Confidence starts from the rule's base and moves by
//! the configured weights:
//!
//! ```text
//! confidence = base
//!            + corroboration * (distinct supporting sources - 1)
//!            - contradiction   (if any contradicting evidence exists)
//! ```
//!
//! clamped to `[0, 1]`. Every rule that fires yields a hypothesis.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use crate::config::CorrelationWeights;
use crate::domain::{
    CauseCode, Evidence, EvidenceSource, FailureCondition, Finding, Hypothesis, PullSignature,
    ServiceEventCategory, Severity, TaskFailureCategory,
};

/// One pattern over the evidence set.
pub struct CorrelationRule {
    pub cause: CauseCode,
    pub base: f64,
    pub trigger: fn(&Evidence) -> bool,
    pub corroborates: fn(&Evidence) -> bool,
    pub contradicts: fn(&Evidence) -> bool,
    pub actions: &'static [&'static str],
}

fn never(_: &Evidence) -> bool {
    false
}

fn stopped_as(e: &Evidence, wanted: &[TaskFailureCategory]) -> bool {
    matches!(e.finding(), Finding::TaskStopped { category, .. } if wanted.contains(category))
}

fn pulled_as(e: &Evidence, wanted: PullSignature) -> bool {
    matches!(e.finding(), Finding::ImagePullFailure { signature, .. } if *signature == wanted)
}

fn service_event(e: &Evidence, wanted: ServiceEventCategory) -> bool {
    matches!(e.finding(), Finding::ServiceEvent { category } if *category == wanted)
}

fn tasks_failing(e: &Evidence) -> bool {
    matches!(e.finding(), Finding::TaskCountMismatch { .. })
}

fn service_steady(e: &Evidence) -> bool {
    matches!(e.finding(), Finding::ServiceSteady { .. })
}

fn log_errors(e: &Evidence) -> bool {
    match e.finding() {
        Finding::LogLine { .. } => e.severity() == Severity::Error,
        Finding::LogSummary { errors, .. } => *errors > 0,
        _ => false,
    }
}

fn image_pull_stop(e: &Evidence) -> bool {
    stopped_as(e, &[TaskFailureCategory::ImagePull]) || tasks_failing(e)
}

/// The rule table, in evaluation order.
pub static RULES: &[CorrelationRule] = &[
    CorrelationRule {
        cause: CauseCode::ProvisioningFailed,
        base: 0.75,
        trigger: |e| {
            matches!(
                e.finding(),
                Finding::StackFailed { .. } | Finding::StackResourceFailed { .. }
            )
        },
        corroborates: |e| matches!(e.finding(), Finding::ServiceMissing { .. }),
        contradicts: |e| matches!(e.finding(), Finding::StackHealthy { .. }),
        actions: &[
            "Inspect the failed stack resources and their status reasons",
            "Fix the template or parameters named in the failure, then delete and recreate the stack",
        ],
    },
    CorrelationRule {
        cause: CauseCode::ProvisioningInProgress,
        base: 0.45,
        trigger: |e| matches!(e.finding(), Finding::StackInProgress { .. }),
        corroborates: |e| matches!(e.finding(), Finding::ServiceMissing { .. }),
        contradicts: never,
        actions: &["Wait for the stack operation to finish, then re-run the diagnosis"],
    },
    CorrelationRule {
        cause: CauseCode::InfrastructureDeleted,
        base: 0.7,
        trigger: |e| matches!(e.finding(), Finding::StackDeleted { .. }),
        corroborates: |e| {
            matches!(
                e.finding(),
                Finding::ServiceMissing { .. } | Finding::StackMissing { .. }
            )
        },
        contradicts: service_steady,
        actions: &[
            "The stack was deleted; redeploy the application to recreate its infrastructure",
        ],
    },
    CorrelationRule {
        cause: CauseCode::ServiceMissing,
        base: 0.55,
        trigger: |e| matches!(e.finding(), Finding::ServiceMissing { .. }),
        corroborates: |e| matches!(e.finding(), Finding::StackMissing { .. }),
        contradicts: |e| service_steady(e) || tasks_failing(e),
        actions: &[
            "Confirm the cluster and service names",
            "Deploy the service if it was never created",
        ],
    },
    CorrelationRule {
        cause: CauseCode::DeploymentFailed,
        base: 0.5,
        trigger: |e| matches!(e.finding(), Finding::DeploymentFailed { .. }),
        corroborates: |e| tasks_failing(e) || matches!(e.finding(), Finding::TaskStopped { .. }),
        contradicts: never,
        actions: &["Review the stopped tasks of the failed deployment for the underlying error"],
    },
    CorrelationRule {
        cause: CauseCode::ImagePullAuthFailure,
        base: 0.8,
        trigger: |e| pulled_as(e, PullSignature::AuthenticationFailure),
        corroborates: image_pull_stop,
        contradicts: service_steady,
        actions: &[
            "Grant the task execution role ecr:GetAuthorizationToken and ecr:BatchGetImage",
            "For private registries, check the repository credentials secret",
        ],
    },
    CorrelationRule {
        cause: CauseCode::ImagePullRepositoryNotFound,
        base: 0.8,
        trigger: |e| {
            pulled_as(e, PullSignature::RepositoryNotFound)
                || matches!(e.finding(), Finding::RepositoryMissing { .. })
        },
        corroborates: image_pull_stop,
        contradicts: service_steady,
        actions: &["Create the repository or fix the image name in the task definition"],
    },
    CorrelationRule {
        cause: CauseCode::ImagePullManifestNotFound,
        base: 0.8,
        trigger: |e| {
            pulled_as(e, PullSignature::ManifestNotFound)
                || matches!(e.finding(), Finding::ImageMissing { .. })
        },
        corroborates: image_pull_stop,
        contradicts: service_steady,
        actions: &["Push the referenced tag or point the task definition at an existing one"],
    },
    CorrelationRule {
        cause: CauseCode::ImagePullRegistryUnreachable,
        base: 0.7,
        trigger: |e| pulled_as(e, PullSignature::RegistryUnreachable),
        corroborates: |e| {
            image_pull_stop(e)
                || matches!(
                    e.finding(),
                    Finding::EgressBlocked { .. } | Finding::SubnetWithoutRoute { .. }
                )
        },
        contradicts: service_steady,
        actions: &[
            "Give the task subnets a route to the registry (NAT gateway, public IP or VPC endpoints)",
            "Allow outbound tcp/443 in the task security groups",
        ],
    },
    CorrelationRule {
        cause: CauseCode::ImagePullFailure,
        base: 0.6,
        trigger: |e| {
            pulled_as(e, PullSignature::Unclassified)
                || stopped_as(e, &[TaskFailureCategory::ImagePull])
        },
        corroborates: tasks_failing,
        contradicts: service_steady,
        actions: &["Check that the image exists and the task execution role can pull it"],
    },
    CorrelationRule {
        cause: CauseCode::OutOfMemory,
        base: 0.7,
        trigger: |e| stopped_as(e, &[TaskFailureCategory::OutOfMemory]),
        corroborates: |e| tasks_failing(e) || log_errors(e),
        contradicts: service_steady,
        actions: &["Raise the container memory limit or reduce the application's memory use"],
    },
    CorrelationRule {
        cause: CauseCode::ResourceConstraint,
        base: 0.65,
        trigger: |e| stopped_as(e, &[TaskFailureCategory::ResourceConstraint]),
        corroborates: |e| {
            service_event(e, ServiceEventCategory::PlacementFailure) || tasks_failing(e)
        },
        contradicts: service_steady,
        actions: &["Lower the task CPU/memory reservation or add cluster capacity"],
    },
    CorrelationRule {
        cause: CauseCode::ApplicationCrash,
        base: 0.55,
        trigger: |e| {
            stopped_as(
                e,
                &[
                    TaskFailureCategory::ApplicationError,
                    TaskFailureCategory::SegmentationFault,
                ],
            )
        },
        corroborates: |e| tasks_failing(e) || log_errors(e),
        contradicts: service_steady,
        actions: &[
            "Read the container log excerpts around the stop time",
            "Reproduce the container start locally with the same environment",
        ],
    },
    CorrelationRule {
        cause: CauseCode::PlacementFailure,
        base: 0.6,
        trigger: |e| service_event(e, ServiceEventCategory::PlacementFailure),
        corroborates: tasks_failing,
        contradicts: service_steady,
        actions: &["Add capacity or relax placement constraints so the scheduler can place tasks"],
    },
    CorrelationRule {
        cause: CauseCode::HealthCheckFailing,
        base: 0.5,
        trigger: |e| {
            matches!(e.finding(), Finding::TargetUnhealthy { .. })
                || service_event(e, ServiceEventCategory::HealthCheckFailure)
        },
        corroborates: log_errors,
        contradicts: |e| matches!(e.finding(), Finding::TargetsHealthy { .. }),
        actions: &[
            "Check the health check path returns success on the container port",
            "Increase the health check grace period if the application starts slowly",
        ],
    },
    CorrelationRule {
        cause: CauseCode::NetworkBlockedPort,
        base: 0.65,
        trigger: |e| {
            matches!(
                e.finding(),
                Finding::PortBlocked { .. } | Finding::HealthCheckPortBlocked { .. }
            )
        },
        corroborates: |e| {
            matches!(e.finding(), Finding::TargetUnhealthy { .. })
                || service_event(e, ServiceEventCategory::HealthCheckFailure)
        },
        contradicts: |e| matches!(e.finding(), Finding::TargetsHealthy { .. }),
        actions: &[
            "Add an ingress rule for the container port from the load balancer security group",
            "Confirm the health check port is reachable from the load balancer",
        ],
    },
    CorrelationRule {
        cause: CauseCode::NetworkNoRoute,
        base: 0.45,
        trigger: |e| {
            matches!(
                e.finding(),
                Finding::SubnetWithoutRoute { .. } | Finding::EgressBlocked { .. }
            )
        },
        corroborates: |e| pulled_as(e, PullSignature::RegistryUnreachable),
        contradicts: never,
        actions: &["Attach a NAT gateway route or enable a public IP for tasks in public subnets"],
    },
    CorrelationRule {
        cause: CauseCode::PortMismatch,
        base: 0.5,
        trigger: |e| matches!(e.finding(), Finding::PortMismatch { .. }),
        corroborates: |e| matches!(e.finding(), Finding::TargetUnhealthy { .. }),
        contradicts: never,
        actions: &["Align the target group port with the container port mapping"],
    },
    CorrelationRule {
        cause: CauseCode::PermissionDenied,
        base: 0.6,
        trigger: |e| {
            matches!(
                e.finding(),
                Finding::CollaboratorFailure {
                    condition: FailureCondition::AccessDenied,
                    ..
                }
            )
        },
        corroborates: never,
        contradicts: never,
        actions: &["Grant the diagnosing identity read access to the denied operations"],
    },
];

/// Output of [`Correlator::analyze`].
#[derive(Debug, Clone)]
pub struct Correlation {
    /// Merged evidence, duplicates removed, order kept.
    pub evidence: Vec<Evidence>,
    pub hypotheses: Vec<Hypothesis>,
    /// Consistency gaps between sources.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Correlator {
    weights: CorrelationWeights,
}

impl Correlator {
    pub fn new(weights: CorrelationWeights) -> Self {
        Self { weights }
    }

    /// Merge, check consistency and rank in one pass.
    pub fn analyze(&self, evidence: Vec<Evidence>) -> Correlation {
        let evidence = merge(evidence);
        let warnings = consistency_gaps(&evidence);
        let hypotheses = self.correlate(&evidence);
        Correlation {
            evidence,
            hypotheses,
            warnings,
        }
    }

    /// Ranked hypotheses for the evidence set. Never empty.
    pub fn correlate(&self, evidence: &[Evidence]) -> Vec<Hypothesis> {
        let mut ranked: Vec<(Hypothesis, Severity)> = RULES
            .iter()
            .filter_map(|rule| self.apply(rule, evidence))
            .collect();
        if ranked.is_empty() {
            return vec![Hypothesis::unknown()];
        }
        ranked.sort_by(|a, b| rank(a, b));
        debug!(
            fired = ranked.len(),
            top = %ranked[0].0.cause_code,
            "hypotheses ranked"
        );
        ranked.into_iter().map(|(h, _)| h).collect()
    }

    fn apply(
        &self,
        rule: &CorrelationRule,
        evidence: &[Evidence],
    ) -> Option<(Hypothesis, Severity)> {
        if !evidence.iter().any(|e| (rule.trigger)(e)) {
            return None;
        }
        let support: Vec<&Evidence> = evidence
            .iter()
            .filter(|e| (rule.trigger)(e) || (rule.corroborates)(e))
            .collect();
        let sources: BTreeSet<EvidenceSource> = support.iter().map(|e| e.source()).collect();
        let contradicted = evidence.iter().any(|e| (rule.contradicts)(e));

        let mut confidence =
            rule.base + self.weights.corroboration * (sources.len().saturating_sub(1)) as f64;
        if contradicted {
            confidence -= self.weights.contradiction;
        }
        let severity = support
            .iter()
            .map(|e| e.severity())
            .max()
            .unwrap_or(Severity::Info);

        let hypothesis = rule.actions.iter().fold(
            Hypothesis::new(rule.cause, confidence)
                .with_evidence(support.iter().map(|e| e.id().clone())),
            |h, action| h.with_action(*action),
        );
        Some((hypothesis, severity))
    }
}

/// Descending confidence, then more evidence, then higher severity, then
/// cause code so equal hypotheses always order the same way.
fn rank(a: &(Hypothesis, Severity), b: &(Hypothesis, Severity)) -> Ordering {
    b.0.confidence
        .total_cmp(&a.0.confidence)
        .then_with(|| b.0.supporting_evidence.len().cmp(&a.0.supporting_evidence.len()))
        .then_with(|| b.1.cmp(&a.1))
        .then_with(|| a.0.cause_code.cmp(&b.0.cause_code))
}

/// Drop repeated evidence (same content-derived id), keeping the first.
pub fn merge(evidence: Vec<Evidence>) -> Vec<Evidence> {
    let mut seen = HashSet::new();
    evidence
        .into_iter()
        .filter(|e| seen.insert(e.id().clone()))
        .collect()
}

/// Disagreements between sources that the hypotheses alone would hide.
pub fn consistency_gaps(evidence: &[Evidence]) -> Vec<String> {
    let missing: BTreeSet<&str> = evidence
        .iter()
        .filter_map(|e| match e.finding() {
            Finding::ServiceMissing { service, .. } => Some(service.as_str()),
            _ => None,
        })
        .collect();

    let mut gaps = Vec::new();
    for e in evidence {
        if let Finding::TaskStopped {
            task_id,
            service: Some(service),
            ..
        } = e.finding()
        {
            if missing.contains(service.as_str()) {
                gaps.push(format!(
                    "task {task_id} references service {service}, which no longer exists"
                ));
            }
        }
    }

    let steady = evidence.iter().any(service_steady);
    if steady {
        for service in &missing {
            gaps.push(format!(
                "service {service} reported both missing and steady; sources disagree"
            ));
        }
    }
    if let Some(stack) = evidence.iter().find_map(|e| match e.finding() {
        Finding::StackDeleted { stack, .. } if steady => Some(stack),
        _ => None,
    }) {
        gaps.push(format!(
            "stack {stack} is deleted but its service still reports running tasks"
        ));
    }
    gaps
}
