//! Stopped-task failure records and running-task counts.

use async_trait::async_trait;
use cluster_probe::{TaskRecord, TaskStatusFilter};
use serde_json::json;

use super::{FetchContext, FetchOutcome, Fetcher, TaskHint};
use crate::domain::{Evidence, EvidenceSource, FetchError, Finding, Severity, TaskFailureCategory};

const SOURCE: EvidenceSource = EvidenceSource::Task;

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFetcher;

/// The category one stop reason and exit code point at.
fn categorize_reason(reason: &str, exit_code: Option<i32>) -> TaskFailureCategory {
    let lower = reason.to_ascii_lowercase();
    if reason.contains("CannotPullContainerError") || reason.contains("ImagePull") {
        TaskFailureCategory::ImagePull
    } else if lower.contains("resource")
        && (lower.contains("constraint") || lower.contains("exceed"))
    {
        TaskFailureCategory::ResourceConstraint
    } else if exit_code == Some(137) || lower.contains("outofmemory") {
        TaskFailureCategory::OutOfMemory
    } else if exit_code == Some(139) {
        TaskFailureCategory::SegmentationFault
    } else if exit_code.is_some_and(|c| c != 0) {
        TaskFailureCategory::ApplicationError
    } else if reason.contains("Essential container") {
        TaskFailureCategory::DependentContainerStopped
    } else {
        TaskFailureCategory::Other
    }
}

/// Lower ranks explain a stop more directly.
fn rank(category: TaskFailureCategory) -> u8 {
    match category {
        TaskFailureCategory::ImagePull => 0,
        TaskFailureCategory::ResourceConstraint => 1,
        TaskFailureCategory::OutOfMemory => 2,
        TaskFailureCategory::SegmentationFault => 3,
        TaskFailureCategory::ApplicationError => 4,
        TaskFailureCategory::DependentContainerStopped => 5,
        TaskFailureCategory::Other => 6,
    }
}

/// Why a task stopped: the most specific category across the task's stop
/// reason and each container, with the exit code of the container that
/// determined it.
pub fn categorize_stop(task: &TaskRecord) -> (TaskFailureCategory, Option<i32>) {
    let task_level = task
        .stopped_reason
        .as_deref()
        .map(|r| (categorize_reason(r, None), None));
    let containers = task.containers.iter().map(|c| {
        (
            categorize_reason(c.reason.as_deref().unwrap_or_default(), c.exit_code),
            c.exit_code,
        )
    });
    task_level
        .into_iter()
        .chain(containers)
        .min_by_key(|(category, _)| rank(*category))
        .unwrap_or((TaskFailureCategory::Other, None))
}

fn stopped_evidence(task: &TaskRecord) -> Evidence {
    let (category, exit_code) = categorize_stop(task);
    let severity = match category {
        TaskFailureCategory::Other | TaskFailureCategory::DependentContainerStopped => {
            Severity::Warning
        }
        _ => Severity::Error,
    };

    let mut message = format!("task {} stopped ({})", task.task_id(), category.as_str());
    if let Some(reason) = &task.stopped_reason {
        message.push_str(": ");
        message.push_str(reason);
    }
    for c in task.containers.iter().filter(|c| c.exit_code.is_some() || c.reason.is_some()) {
        message.push_str(&format!("; container {}", c.name));
        if let Some(code) = c.exit_code {
            message.push_str(&format!(" exited {code}"));
        }
        if let Some(reason) = &c.reason {
            message.push_str(&format!(" ({reason})"));
        }
    }

    let containers: Vec<_> = task
        .containers
        .iter()
        .map(|c| {
            json!({
                "name": c.name,
                "image": c.image,
                "exit_code": c.exit_code,
                "reason": c.reason,
            })
        })
        .collect();

    Evidence::new(
        SOURCE,
        severity,
        Finding::TaskStopped {
            task_id: task.task_id().to_string(),
            service: task.service_name().map(str::to_string),
            category,
            exit_code,
        },
        message,
    )
    .with_optional_timestamp(task.stopped_at)
    .with_raw("task_definition", task.task_definition_arn.clone())
    .with_raw("stop_code", task.stop_code.clone())
    .with_raw("containers", containers)
}

fn hint(task: &TaskRecord) -> TaskHint {
    TaskHint {
        task_id: task.task_id().to_string(),
        service: task.service_name().map(str::to_string),
        task_definition_arn: task.task_definition_arn.clone(),
        stopped: task.is_stopped(),
    }
}

#[async_trait]
impl Fetcher for TaskFetcher {
    fn source(&self) -> EvidenceSource {
        SOURCE
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<FetchOutcome, FetchError> {
        let mut out = ctx.outcome();
        let cluster = ctx.target.cluster.as_str();
        let service = ctx.target.service.as_deref();
        let api = &ctx.collaborators.cluster;

        let mut stopped = ctx
            .controls
            .collect_pages("ecs:ListTasks", |token| {
                api.list_tasks(cluster, service, TaskStatusFilter::Stopped, token)
            })
            .await;
        out.absorb_collected(SOURCE, "ecs:ListTasks", &mut stopped);

        let recent: Vec<&TaskRecord> = stopped
            .items
            .iter()
            .filter(|t| ctx.stopped_in_window(t))
            .collect();
        for task in &recent {
            let evidence = stopped_evidence(task);
            if matches!(
                evidence.finding(),
                Finding::TaskStopped {
                    category: TaskFailureCategory::ImagePull,
                    ..
                }
            ) {
                out.request_follow_up(EvidenceSource::ImagePull);
            }
            out.push(evidence);
            out.task_hints.push(hint(task));
        }

        let mut running = ctx
            .controls
            .collect_pages("ecs:ListTasks", |token| {
                api.list_tasks(cluster, service, TaskStatusFilter::Running, token)
            })
            .await;
        out.absorb_collected(SOURCE, "ecs:ListTasks", &mut running);

        if running.error.is_none() {
            let count = running.items.len() as u32;
            let severity = if count == 0 && !recent.is_empty() {
                Severity::Warning
            } else {
                Severity::Info
            };
            let scope = service
                .map(|s| format!("service {s}"))
                .unwrap_or_else(|| format!("cluster {cluster}"));
            out.push(
                Evidence::new(
                    SOURCE,
                    severity,
                    Finding::TasksRunning { count },
                    format!("{count} task(s) running in {scope}"),
                )
                .with_raw("stopped_in_window", recent.len()),
            );
        }
        out.task_hints.extend(running.items.iter().map(hint));

        Ok(out.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_probe::ContainerState;

    fn task(stopped_reason: Option<&str>, containers: Vec<ContainerState>) -> TaskRecord {
        TaskRecord {
            task_arn: "arn:aws:ecs:r:1:task/c/t1".to_string(),
            task_definition_arn: "td:1".to_string(),
            group: Some("service:web".to_string()),
            last_status: "STOPPED".to_string(),
            desired_status: None,
            started_at: None,
            stopped_at: None,
            stopped_reason: stopped_reason.map(str::to_string),
            stop_code: None,
            containers,
        }
    }

    fn container(exit_code: Option<i32>, reason: Option<&str>) -> ContainerState {
        ContainerState {
            name: "app".to_string(),
            image: None,
            exit_code,
            reason: reason.map(str::to_string),
            last_status: None,
        }
    }

    #[test]
    fn test_categories_follow_exit_codes() {
        let cases = [
            (Some(137), None, TaskFailureCategory::OutOfMemory),
            (Some(139), None, TaskFailureCategory::SegmentationFault),
            (Some(1), None, TaskFailureCategory::ApplicationError),
            (Some(0), None, TaskFailureCategory::Other),
            (
                None,
                Some("RESOURCE:MEMORY constraint exceeded"),
                TaskFailureCategory::ResourceConstraint,
            ),
        ];
        for (code, reason, expected) in cases {
            let t = task(None, vec![container(code, reason)]);
            assert_eq!(categorize_stop(&t).0, expected, "{code:?} {reason:?}");
        }
    }

    #[test]
    fn test_task_stop_reason_takes_precedence() {
        let t = task(
            Some("CannotPullContainerError: pull access denied"),
            vec![container(Some(1), None)],
        );
        assert_eq!(categorize_stop(&t), (TaskFailureCategory::ImagePull, None));
    }

    #[test]
    fn test_essential_container_is_dependent_stop() {
        let t = task(Some("Essential container in task exited"), vec![container(Some(0), None)]);
        assert_eq!(
            categorize_stop(&t).0,
            TaskFailureCategory::DependentContainerStopped
        );
    }

    #[test]
    fn test_stopped_evidence_mentions_container() {
        let t = task(None, vec![container(Some(137), Some("OutOfMemoryError"))]);
        let e = stopped_evidence(&t);
        assert_eq!(e.severity(), Severity::Error);
        assert!(e.message().contains("exited 137"));
        assert!(e.message().contains("out_of_memory"));
    }
}
