//! Provisioning stack status, failed resources and failure events.

use async_trait::async_trait;
use cluster_probe::StackDescription;
use tracing::debug;

use super::{FetchContext, FetchOutcome, Fetcher};
use crate::domain::{Evidence, EvidenceSource, FetchError, Finding, Severity};

const SOURCE: EvidenceSource = EvidenceSource::Stack;

#[derive(Debug, Clone, Copy, Default)]
pub struct StackFetcher;

/// How a stack status string reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    Failed,
    InProgress,
    Deleted,
    Healthy,
}

pub fn classify_stack_status(status: &str) -> StackState {
    let status = status.to_ascii_uppercase();
    if status.contains("FAILED") || status.contains("ROLLBACK") {
        StackState::Failed
    } else if status == "DELETE_COMPLETE" {
        StackState::Deleted
    } else if status.ends_with("IN_PROGRESS") {
        StackState::InProgress
    } else {
        StackState::Healthy
    }
}

fn status_evidence(stack: &StackDescription) -> Evidence {
    let name = stack.name.clone();
    let status = stack.status.clone();
    let reason = stack
        .status_reason
        .as_deref()
        .map(|r| format!(": {r}"))
        .unwrap_or_default();

    let evidence = match classify_stack_status(&stack.status) {
        StackState::Failed => Evidence::new(
            SOURCE,
            Severity::Error,
            Finding::StackFailed {
                stack: name.clone(),
                status: status.clone(),
            },
            format!("stack {name} is in {status}{reason}"),
        ),
        StackState::InProgress => Evidence::new(
            SOURCE,
            Severity::Warning,
            Finding::StackInProgress {
                stack: name.clone(),
                status: status.clone(),
            },
            format!("stack {name} is still changing ({status})"),
        ),
        StackState::Deleted => Evidence::new(
            SOURCE,
            Severity::Warning,
            Finding::StackDeleted {
                stack: name.clone(),
                deleted_at: None,
            },
            format!("stack {name} has been deleted"),
        ),
        StackState::Healthy => Evidence::new(
            SOURCE,
            Severity::Info,
            Finding::StackHealthy {
                stack: name.clone(),
                status: status.clone(),
            },
            format!("stack {name} is {status}"),
        ),
    };
    evidence
        .with_raw("stack_status", status)
        .with_raw("status_reason", stack.status_reason.clone())
}

impl StackFetcher {
    async fn fetch_missing(&self, ctx: &FetchContext, name: &str, out: &mut FetchOutcome) {
        out.push(Evidence::new(
            SOURCE,
            Severity::Warning,
            Finding::StackMissing {
                stack: name.to_string(),
            },
            format!("stack {name} does not exist"),
        ));

        let stacks = &ctx.collaborators.stacks;
        let mut deleted = ctx
            .controls
            .collect_pages("cloudformation:ListStacks", |token| {
                stacks.list_deleted_stacks(token)
            })
            .await;
        out.absorb_collected(SOURCE, "cloudformation:ListStacks", &mut deleted);

        for summary in deleted.items.into_iter().filter(|s| s.name == name) {
            let when = summary
                .deleted_at
                .map(|t| format!(" at {}", t.to_rfc3339()))
                .unwrap_or_default();
            out.push(
                Evidence::new(
                    SOURCE,
                    Severity::Warning,
                    Finding::StackDeleted {
                        stack: summary.name.clone(),
                        deleted_at: summary.deleted_at,
                    },
                    format!("a stack named {name} was deleted{when}"),
                )
                .with_optional_timestamp(summary.deleted_at)
                .with_raw("stack_status", summary.status),
            );
        }
    }
}

#[async_trait]
impl Fetcher for StackFetcher {
    fn source(&self) -> EvidenceSource {
        SOURCE
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<FetchOutcome, FetchError> {
        let mut out = ctx.outcome();
        let Some(name) = ctx.target.stack_name.clone() else {
            out.warn(SOURCE, "no stack name could be resolved from the request");
            return Ok(out);
        };

        let stacks = &ctx.collaborators.stacks;
        let stack = match ctx
            .controls
            .call("cloudformation:DescribeStacks", || stacks.describe_stack(&name))
            .await
        {
            Ok(stack) => stack,
            Err(FetchError::NotFound { .. }) => {
                self.fetch_missing(ctx, &name, &mut out).await;
                return Ok(out.finish());
            }
            Err(err) => {
                out.absorb(SOURCE, err);
                return Ok(out.finish());
            }
        };
        out.push(status_evidence(&stack));

        let mut resources = ctx
            .controls
            .collect_pages("cloudformation:ListStackResources", |token| {
                stacks.list_stack_resources(&name, token)
            })
            .await;
        out.absorb_collected(SOURCE, "cloudformation:ListStackResources", &mut resources);

        let failed: Vec<_> = resources.items.iter().filter(|r| r.is_failed()).collect();
        for resource in &failed {
            let reason = resource
                .status_reason
                .clone()
                .unwrap_or_else(|| "no reason provided".to_string());
            out.push(
                Evidence::new(
                    SOURCE,
                    Severity::Error,
                    Finding::StackResourceFailed {
                        logical_id: resource.logical_id.clone(),
                        resource_type: resource.resource_type.clone(),
                    },
                    format!(
                        "{} ({}) is {}: {reason}",
                        resource.logical_id, resource.resource_type, resource.status
                    ),
                )
                .with_raw("physical_id", resource.physical_id.clone())
                .with_raw("status", resource.status.clone()),
            );
        }

        let mut events = ctx
            .controls
            .collect_pages("cloudformation:DescribeStackEvents", |token| {
                stacks.list_stack_events(&name, token)
            })
            .await;
        out.absorb_collected(SOURCE, "cloudformation:DescribeStackEvents", &mut events);

        let mut covered: Vec<&str> = failed.iter().map(|r| r.logical_id.as_str()).collect();
        for event in events.items.iter().filter(|e| e.status.ends_with("FAILED")) {
            let Some(reason) = event.reason.as_deref() else {
                continue;
            };
            if covered.contains(&event.logical_id.as_str()) || !ctx.window.contains(event.timestamp)
            {
                continue;
            }
            covered.push(event.logical_id.as_str());
            out.push(
                Evidence::new(
                    SOURCE,
                    Severity::Error,
                    Finding::StackResourceFailed {
                        logical_id: event.logical_id.clone(),
                        resource_type: event.resource_type.clone(),
                    },
                    format!(
                        "{} ({}) reported {}: {reason}",
                        event.logical_id, event.resource_type, event.status
                    ),
                )
                .with_timestamp(event.timestamp)
                .with_raw("status", event.status.clone()),
            );
        }

        debug!(stack = %name, failed_resources = failed.len(), "stack inspected");
        Ok(out.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_stack_status() {
        assert_eq!(classify_stack_status("CREATE_FAILED"), StackState::Failed);
        assert_eq!(classify_stack_status("ROLLBACK_COMPLETE"), StackState::Failed);
        assert_eq!(
            classify_stack_status("UPDATE_ROLLBACK_IN_PROGRESS"),
            StackState::Failed
        );
        assert_eq!(classify_stack_status("CREATE_IN_PROGRESS"), StackState::InProgress);
        assert_eq!(classify_stack_status("DELETE_COMPLETE"), StackState::Deleted);
        assert_eq!(classify_stack_status("UPDATE_COMPLETE"), StackState::Healthy);
    }
}
