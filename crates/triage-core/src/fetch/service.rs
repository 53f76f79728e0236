//! Service existence, task counts, rollout state and service events.

use std::collections::HashMap;

use async_trait::async_trait;
use cluster_probe::ServiceDescription;

use super::{FetchContext, FetchOutcome, Fetcher};
use crate::domain::{Evidence, EvidenceSource, FetchError, Finding, ServiceEventCategory, Severity};

const SOURCE: EvidenceSource = EvidenceSource::Service;

#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceFetcher;

/// Classify a service event message. First match wins.
pub fn classify_service_event(message: &str) -> ServiceEventCategory {
    let m = message.to_ascii_lowercase();
    if m.contains("unable to place")
        || m.contains("insufficient")
        || m.contains("no container instance")
    {
        ServiceEventCategory::PlacementFailure
    } else if m.contains("unhealthy") || m.contains("health check") {
        ServiceEventCategory::HealthCheckFailure
    } else if m.contains("failed to launch")
        || m.contains("failed to start")
        || m.contains("unable to consistently start")
    {
        ServiceEventCategory::TaskStartFailure
    } else if m.contains("steady state") {
        ServiceEventCategory::SteadyState
    } else {
        ServiceEventCategory::Other
    }
}

fn severity_for(category: ServiceEventCategory) -> Severity {
    match category {
        ServiceEventCategory::PlacementFailure | ServiceEventCategory::TaskStartFailure => {
            Severity::Error
        }
        ServiceEventCategory::HealthCheckFailure => Severity::Warning,
        ServiceEventCategory::SteadyState | ServiceEventCategory::Other => Severity::Info,
    }
}

fn missing(cluster: &str, service: &str, why: &str) -> Evidence {
    Evidence::new(
        SOURCE,
        Severity::Error,
        Finding::ServiceMissing {
            cluster: cluster.to_string(),
            service: service.to_string(),
        },
        format!("service {service} {why} in cluster {cluster}"),
    )
}

fn count_evidence(svc: &ServiceDescription) -> Evidence {
    let (desired, running, pending) = (svc.desired_count, svc.running_count, svc.pending_count);
    if desired != running {
        let severity = if running == 0 && desired > 0 {
            Severity::Error
        } else {
            Severity::Warning
        };
        Evidence::new(
            SOURCE,
            severity,
            Finding::TaskCountMismatch {
                desired,
                running,
                pending,
            },
            format!(
                "service {} wants {desired} tasks but {running} are running ({pending} pending)",
                svc.name
            ),
        )
    } else {
        Evidence::new(
            SOURCE,
            Severity::Info,
            Finding::ServiceSteady { desired, running },
            format!("service {} runs {running}/{desired} tasks", svc.name),
        )
    }
}

#[async_trait]
impl Fetcher for ServiceFetcher {
    fn source(&self) -> EvidenceSource {
        SOURCE
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<FetchOutcome, FetchError> {
        let mut out = ctx.outcome();
        let cluster = ctx.target.cluster.clone();
        let Some(name) = ctx.target.service_name().map(str::to_string) else {
            out.warn(SOURCE, "no service name could be resolved from the request");
            return Ok(out);
        };

        let api = &ctx.collaborators.cluster;
        let svc = match ctx
            .controls
            .call("ecs:DescribeServices", || api.describe_service(&cluster, &name))
            .await
        {
            Ok(svc) if svc.is_inactive() => {
                out.push(missing(&cluster, &name, "is INACTIVE"));
                return Ok(out);
            }
            Ok(svc) => svc,
            Err(FetchError::NotFound { .. }) => {
                out.push(missing(&cluster, &name, "was not found"));
                return Ok(out);
            }
            Err(err) => {
                out.absorb(SOURCE, err);
                return Ok(out);
            }
        };

        out.push(
            count_evidence(&svc)
                .with_raw("status", svc.status.clone())
                .with_raw("task_definition", svc.task_definition.clone()),
        );

        if let Some(deployment) = svc.primary_deployment() {
            if deployment.rollout_state.as_deref() == Some("FAILED") {
                let reason = deployment
                    .rollout_state_reason
                    .clone()
                    .unwrap_or_else(|| "no reason provided".to_string());
                out.push(
                    Evidence::new(
                        SOURCE,
                        Severity::Error,
                        Finding::DeploymentFailed {
                            deployment_id: deployment.id.clone(),
                        },
                        format!("deployment {} failed: {reason}", deployment.id),
                    )
                    .with_raw("failed_tasks", deployment.failed_tasks),
                );
            }
        }

        let mut events = ctx
            .controls
            .collect_pages("ecs:DescribeServices.events", |token| {
                api.list_service_events(&cluster, &name, token)
            })
            .await;
        out.absorb_collected(SOURCE, "ecs:DescribeServices.events", &mut events);

        // Newest first: keep the latest event per category, count the rest.
        let mut seen: HashMap<ServiceEventCategory, usize> = HashMap::new();
        let mut latest = Vec::new();
        for event in events.items.iter().filter(|e| ctx.window.contains(e.created_at)) {
            let category = classify_service_event(&event.message);
            if category == ServiceEventCategory::Other {
                continue;
            }
            let count = seen.entry(category).or_insert(0);
            if *count == 0 {
                latest.push((category, event));
            }
            *count += 1;
        }
        for (category, event) in latest {
            out.push(
                Evidence::new(
                    SOURCE,
                    severity_for(category),
                    Finding::ServiceEvent { category },
                    event.message.clone(),
                )
                .with_timestamp(event.created_at)
                .with_raw("event_id", event.id.clone())
                .with_raw("occurrences", seen.get(&category).copied().unwrap_or(1)),
            );
        }

        Ok(out.finish())
    }
}
