//! In-memory fakes for the collaborator traits (testing and offline replay)
//!
//! `InMemoryCluster` implements all six collaborator traits over a
//! `ClusterSnapshot`. Listing calls paginate with a configurable page size so
//! pagination loops are exercised, and faults (errors or delays) can be
//! scripted per operation to simulate throttling, outages and slow calls.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProbeError;
use crate::model::*;
use crate::probe_traits::*;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSnapshot {
    pub stacks: Vec<StackSnapshot>,
    pub deleted_stacks: Vec<StackSummary>,
    pub clusters: Vec<ClusterSummary>,
    pub services: Vec<ServiceSnapshot>,
    pub tasks: Vec<TaskSnapshot>,
    pub task_definitions: Vec<TaskDefinition>,
    pub log_groups: Vec<LogGroupSnapshot>,
    pub security_groups: Vec<SecurityGroup>,
    pub subnets: Vec<Subnet>,
    pub target_groups: Vec<TargetGroupSnapshot>,
    pub repositories: Vec<RepositorySnapshot>,
}

impl ClusterSnapshot {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackSnapshot {
    pub description: StackDescription,
    #[serde(default)]
    pub resources: Vec<StackResource>,
    #[serde(default)]
    pub events: Vec<StackEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub description: ServiceDescription,
    #[serde(default)]
    pub events: Vec<ServiceEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub cluster: String,
    #[serde(flatten)]
    pub record: TaskRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogGroupSnapshot {
    pub name: String,
    #[serde(default)]
    pub events: Vec<LogEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetGroupSnapshot {
    pub group: TargetGroup,
    #[serde(default)]
    pub health: Vec<TargetHealth>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    #[serde(flatten)]
    pub repository: Repository,
    #[serde(default)]
    pub images: Vec<ImageDetail>,
}

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

/// Every collaborator operation the fake serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DescribeStack,
    ListStackResources,
    ListStackEvents,
    ListDeletedStacks,
    ListClusters,
    ListServices,
    DescribeService,
    ListServiceEvents,
    ListTasks,
    DescribeTaskDefinition,
    ListTaskDefinitions,
    DescribeLogGroups,
    FilterLogEvents,
    DescribeSecurityGroups,
    DescribeSubnets,
    DescribeTargetGroup,
    DescribeTargetHealth,
    DescribeRepositories,
    DescribeImages,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::DescribeStack => "cloudformation:DescribeStacks",
            Operation::ListStackResources => "cloudformation:ListStackResources",
            Operation::ListStackEvents => "cloudformation:DescribeStackEvents",
            Operation::ListDeletedStacks => "cloudformation:ListStacks",
            Operation::ListClusters => "ecs:ListClusters",
            Operation::ListServices => "ecs:ListServices",
            Operation::DescribeService => "ecs:DescribeServices",
            Operation::ListServiceEvents => "ecs:DescribeServices.events",
            Operation::ListTasks => "ecs:ListTasks",
            Operation::DescribeTaskDefinition => "ecs:DescribeTaskDefinition",
            Operation::ListTaskDefinitions => "ecs:ListTaskDefinitions",
            Operation::DescribeLogGroups => "logs:DescribeLogGroups",
            Operation::FilterLogEvents => "logs:FilterLogEvents",
            Operation::DescribeSecurityGroups => "ec2:DescribeSecurityGroups",
            Operation::DescribeSubnets => "ec2:DescribeSubnets",
            Operation::DescribeTargetGroup => "elbv2:DescribeTargetGroups",
            Operation::DescribeTargetHealth => "elbv2:DescribeTargetHealth",
            Operation::DescribeRepositories => "ecr:DescribeRepositories",
            Operation::DescribeImages => "ecr:DescribeImages",
        }
    }
}

/// A scripted misbehaviour.
#[derive(Debug, Clone)]
pub enum Fault {
    Fail(ProbeError),
    Delay(Duration),
}

#[derive(Debug, Default)]
struct FaultTable {
    scripted: HashMap<Operation, VecDeque<Fault>>,
    persistent: HashMap<Operation, Fault>,
    calls: HashMap<Operation, usize>,
}

// ---------------------------------------------------------------------------
// InMemoryCluster
// ---------------------------------------------------------------------------

/// In-memory implementation of every collaborator trait.
#[derive(Debug)]
pub struct InMemoryCluster {
    snapshot: ClusterSnapshot,
    page_size: usize,
    faults: Mutex<FaultTable>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new(ClusterSnapshot::default())
    }
}

impl InMemoryCluster {
    pub fn new(snapshot: ClusterSnapshot) -> Self {
        Self {
            snapshot,
            page_size: 100,
            faults: Mutex::new(FaultTable::default()),
        }
    }

    /// Serve list operations `page_size` items at a time.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn snapshot(&self) -> &ClusterSnapshot {
        &self.snapshot
    }

    /// Queue a fault consumed by the next call to `op` (faults apply in order).
    pub fn inject(&self, op: Operation, fault: Fault) {
        let mut table = self.lock();
        table.scripted.entry(op).or_default().push_back(fault);
    }

    /// Apply `fault` to every call of `op` once scripted faults are used up.
    pub fn inject_always(&self, op: Operation, fault: Fault) {
        self.lock().persistent.insert(op, fault);
    }

    /// Number of calls made to `op`, including failed ones.
    pub fn calls(&self, op: Operation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of calls across all operations.
    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FaultTable> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn gate(&self, op: Operation) -> ProbeResult<()> {
        let fault = {
            let mut table = self.lock();
            *table.calls.entry(op).or_insert(0) += 1;
            let scripted = table.scripted.get_mut(&op).and_then(VecDeque::pop_front);
            scripted.or_else(|| table.persistent.get(&op).cloned())
        };

        match fault {
            None => Ok(()),
            Some(Fault::Fail(err)) => Err(err),
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    fn paginate<T: Clone>(
        &self,
        op: Operation,
        items: &[T],
        token: PageToken,
    ) -> ProbeResult<Page<T>> {
        let offset = match token {
            None => 0,
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| ProbeError::unavailable(op.as_str(), format!("invalid token {t}")))?,
        };
        let end = (offset + self.page_size).min(items.len());
        let page = items.get(offset..end).unwrap_or_default().to_vec();
        if end < items.len() {
            Ok(Page::with_next(page, end.to_string()))
        } else {
            Ok(Page::last(page))
        }
    }

    fn stack(&self, name: &str) -> ProbeResult<&StackSnapshot> {
        self.snapshot
            .stacks
            .iter()
            .find(|s| s.description.name == name)
            .ok_or_else(|| ProbeError::not_found(Operation::DescribeStack.as_str(), name))
    }

    fn service(
        &self,
        op: Operation,
        cluster: &str,
        service: &str,
    ) -> ProbeResult<&ServiceSnapshot> {
        self.snapshot
            .services
            .iter()
            .find(|s| s.description.cluster == cluster && s.description.name == service)
            .ok_or_else(|| ProbeError::not_found(op.as_str(), format!("{cluster}/{service}")))
    }
}

#[async_trait]
impl StackStatusApi for InMemoryCluster {
    async fn describe_stack(&self, name: &str) -> ProbeResult<StackDescription> {
        self.gate(Operation::DescribeStack).await?;
        Ok(self.stack(name)?.description.clone())
    }

    async fn list_stack_resources(
        &self,
        name: &str,
        token: PageToken,
    ) -> ProbeResult<Page<StackResource>> {
        let op = Operation::ListStackResources;
        self.gate(op).await?;
        let stack = self.stack(name)?;
        self.paginate(op, &stack.resources, token)
    }

    async fn list_stack_events(
        &self,
        name: &str,
        token: PageToken,
    ) -> ProbeResult<Page<StackEvent>> {
        let op = Operation::ListStackEvents;
        self.gate(op).await?;
        let mut events = self.stack(name)?.events.clone();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.paginate(op, &events, token)
    }

    async fn list_deleted_stacks(&self, token: PageToken) -> ProbeResult<Page<StackSummary>> {
        let op = Operation::ListDeletedStacks;
        self.gate(op).await?;
        self.paginate(op, &self.snapshot.deleted_stacks, token)
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn list_clusters(&self, token: PageToken) -> ProbeResult<Page<ClusterSummary>> {
        let op = Operation::ListClusters;
        self.gate(op).await?;
        self.paginate(op, &self.snapshot.clusters, token)
    }

    async fn list_services(&self, cluster: &str, token: PageToken) -> ProbeResult<Page<String>> {
        let op = Operation::ListServices;
        self.gate(op).await?;
        let names: Vec<String> = self
            .snapshot
            .services
            .iter()
            .filter(|s| s.description.cluster == cluster)
            .map(|s| s.description.name.clone())
            .collect();
        self.paginate(op, &names, token)
    }

    async fn describe_service(
        &self,
        cluster: &str,
        service: &str,
    ) -> ProbeResult<ServiceDescription> {
        let op = Operation::DescribeService;
        self.gate(op).await?;
        Ok(self.service(op, cluster, service)?.description.clone())
    }

    async fn list_service_events(
        &self,
        cluster: &str,
        service: &str,
        token: PageToken,
    ) -> ProbeResult<Page<ServiceEvent>> {
        let op = Operation::ListServiceEvents;
        self.gate(op).await?;
        let mut events = self.service(op, cluster, service)?.events.clone();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.paginate(op, &events, token)
    }

    async fn list_tasks(
        &self,
        cluster: &str,
        service: Option<&str>,
        status: TaskStatusFilter,
        token: PageToken,
    ) -> ProbeResult<Page<TaskRecord>> {
        let op = Operation::ListTasks;
        self.gate(op).await?;
        let tasks: Vec<TaskRecord> = self
            .snapshot
            .tasks
            .iter()
            .filter(|t| t.cluster == cluster)
            .filter(|t| match service {
                Some(name) => t.record.service_name() == Some(name),
                None => true,
            })
            .filter(|t| match status {
                TaskStatusFilter::Stopped => t.record.is_stopped(),
                TaskStatusFilter::Running => !t.record.is_stopped(),
            })
            .map(|t| t.record.clone())
            .collect();
        self.paginate(op, &tasks, token)
    }

    async fn describe_task_definition(&self, arn: &str) -> ProbeResult<TaskDefinition> {
        let op = Operation::DescribeTaskDefinition;
        self.gate(op).await?;
        self.snapshot
            .task_definitions
            .iter()
            .find(|d| d.arn == arn)
            .cloned()
            .ok_or_else(|| ProbeError::not_found(op.as_str(), arn))
    }

    async fn list_task_definitions(
        &self,
        family_prefix: &str,
        token: PageToken,
    ) -> ProbeResult<Page<String>> {
        let op = Operation::ListTaskDefinitions;
        self.gate(op).await?;
        let mut definitions: Vec<&TaskDefinition> = self
            .snapshot
            .task_definitions
            .iter()
            .filter(|d| d.family.starts_with(family_prefix))
            .collect();
        definitions.sort_by(|a, b| b.revision.cmp(&a.revision).then(a.family.cmp(&b.family)));
        let arns: Vec<String> = definitions.into_iter().map(|d| d.arn.clone()).collect();
        self.paginate(op, &arns, token)
    }
}

#[async_trait]
impl LogApi for InMemoryCluster {
    async fn describe_log_groups(
        &self,
        prefix: &str,
        token: PageToken,
    ) -> ProbeResult<Page<String>> {
        let op = Operation::DescribeLogGroups;
        self.gate(op).await?;
        let names: Vec<String> = self
            .snapshot
            .log_groups
            .iter()
            .filter(|g| g.name.starts_with(prefix))
            .map(|g| g.name.clone())
            .collect();
        self.paginate(op, &names, token)
    }

    async fn filter_log_events(
        &self,
        query: &LogQuery,
        token: PageToken,
    ) -> ProbeResult<Page<LogEvent>> {
        let op = Operation::FilterLogEvents;
        self.gate(op).await?;
        let group = self
            .snapshot
            .log_groups
            .iter()
            .find(|g| g.name == query.group)
            .ok_or_else(|| ProbeError::not_found(op.as_str(), &query.group))?;

        let terms: Vec<String> = query
            .pattern
            .as_deref()
            .map(|p| p.split_whitespace().map(str::to_lowercase).collect())
            .unwrap_or_default();

        let mut events: Vec<LogEvent> = group
            .events
            .iter()
            .filter(|e| e.timestamp >= query.start && e.timestamp <= query.end)
            .filter(|e| match &query.stream_contains {
                Some(fragment) => e.stream.contains(fragment.as_str()),
                None => true,
            })
            .filter(|e| {
                if terms.is_empty() {
                    return true;
                }
                let message = e.message.to_lowercase();
                terms.iter().any(|t| message.contains(t.as_str()))
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        self.paginate(op, &events, token)
    }
}

#[async_trait]
impl NetworkApi for InMemoryCluster {
    async fn describe_security_groups(&self, ids: &[String]) -> ProbeResult<Vec<SecurityGroup>> {
        let op = Operation::DescribeSecurityGroups;
        self.gate(op).await?;
        ids.iter()
            .map(|id| {
                self.snapshot
                    .security_groups
                    .iter()
                    .find(|g| &g.id == id)
                    .cloned()
                    .ok_or_else(|| ProbeError::not_found(op.as_str(), id))
            })
            .collect()
    }

    async fn describe_subnets(&self, ids: &[String]) -> ProbeResult<Vec<Subnet>> {
        let op = Operation::DescribeSubnets;
        self.gate(op).await?;
        ids.iter()
            .map(|id| {
                self.snapshot
                    .subnets
                    .iter()
                    .find(|s| &s.id == id)
                    .cloned()
                    .ok_or_else(|| ProbeError::not_found(op.as_str(), id))
            })
            .collect()
    }
}

#[async_trait]
impl LoadBalancerApi for InMemoryCluster {
    async fn describe_target_group(&self, arn: &str) -> ProbeResult<TargetGroup> {
        let op = Operation::DescribeTargetGroup;
        self.gate(op).await?;
        self.snapshot
            .target_groups
            .iter()
            .find(|t| t.group.arn == arn)
            .map(|t| t.group.clone())
            .ok_or_else(|| ProbeError::not_found(op.as_str(), arn))
    }

    async fn describe_target_health(
        &self,
        arn: &str,
        token: PageToken,
    ) -> ProbeResult<Page<TargetHealth>> {
        let op = Operation::DescribeTargetHealth;
        self.gate(op).await?;
        let group = self
            .snapshot
            .target_groups
            .iter()
            .find(|t| t.group.arn == arn)
            .ok_or_else(|| ProbeError::not_found(op.as_str(), arn))?;
        self.paginate(op, &group.health, token)
    }
}

impl InMemoryCluster {
    fn repository(&self, op: Operation, name: &str) -> ProbeResult<&RepositorySnapshot> {
        self.snapshot
            .repositories
            .iter()
            .find(|r| r.repository.name == name)
            .ok_or_else(|| ProbeError::not_found(op.as_str(), name))
    }
}

#[async_trait]
impl RegistryApi for InMemoryCluster {
    async fn describe_repository(&self, name: &str) -> ProbeResult<Repository> {
        let op = Operation::DescribeRepositories;
        self.gate(op).await?;
        Ok(self.repository(op, name)?.repository.clone())
    }

    async fn describe_image(
        &self,
        repository: &str,
        reference: &str,
    ) -> ProbeResult<ImageDetail> {
        let op = Operation::DescribeImages;
        self.gate(op).await?;
        let repo = self.repository(op, repository)?;
        let missing = || ProbeError::not_found(op.as_str(), format!("{repository}:{reference}"));
        let mut image = repo
            .images
            .iter()
            .find(|i| i.matches(reference))
            .cloned()
            .ok_or_else(missing)?;
        image.repository = repo.repository.name.clone();
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with_services(n: usize) -> ClusterSnapshot {
        let services = (0..n)
            .map(|i| ServiceSnapshot {
                description: ServiceDescription {
                    cluster: "main".to_string(),
                    name: format!("svc-{i}"),
                    status: "ACTIVE".to_string(),
                    desired_count: 1,
                    running_count: 1,
                    pending_count: 0,
                    task_definition: None,
                    load_balancers: vec![],
                    network: None,
                    deployments: vec![],
                },
                events: vec![],
            })
            .collect();
        ClusterSnapshot {
            services,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_paginates_with_tokens() {
        let fake = InMemoryCluster::new(snapshot_with_services(5)).with_page_size(2);

        let first = fake.list_services("main", None).await.unwrap();
        assert_eq!(first.items, vec!["svc-0", "svc-1"]);
        assert_eq!(first.next_token.as_deref(), Some("2"));

        let last = fake.list_services("main", Some("4".to_string())).await.unwrap();
        assert_eq!(last.items, vec!["svc-4"]);
        assert!(last.next_token.is_none());
    }

    #[tokio::test]
    async fn test_scripted_fault_is_consumed_once() {
        let fake = InMemoryCluster::new(snapshot_with_services(1));
        fake.inject(
            Operation::DescribeService,
            Fault::Fail(ProbeError::throttled("ecs:DescribeServices")),
        );

        let first = fake.describe_service("main", "svc-0").await;
        assert!(matches!(first, Err(ProbeError::Throttled { .. })));

        let second = fake.describe_service("main", "svc-0").await;
        assert!(second.is_ok());
        assert_eq!(fake.calls(Operation::DescribeService), 2);
    }

    #[tokio::test]
    async fn test_missing_service_is_not_found() {
        let fake = InMemoryCluster::default();
        let err = fake.describe_service("main", "ghost").await.unwrap_err();
        assert!(matches!(err, ProbeError::NotFound { .. }));
        assert!(err.to_string().contains("main/ghost"));
    }

    #[tokio::test]
    async fn test_persistent_fault_applies_to_every_call() {
        let fake = InMemoryCluster::default();
        fake.inject_always(
            Operation::ListClusters,
            Fault::Fail(ProbeError::unavailable("ecs:ListClusters", "503")),
        );
        for _ in 0..3 {
            assert!(fake.list_clusters(None).await.is_err());
        }
        assert_eq!(fake.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_image_lookup_by_tag_or_digest() {
        let snapshot = ClusterSnapshot::from_json(
            r#"{"repositories": [{"name": "web", "images": [
                 {"tags": ["7", "latest"], "digest": "sha256:ab12"}]}]}"#,
        )
        .unwrap();
        let fake = InMemoryCluster::new(snapshot);

        let by_tag = fake.describe_image("web", "7").await.unwrap();
        assert_eq!(by_tag.repository, "web");
        assert!(fake.describe_image("web", "sha256:ab12").await.is_ok());

        let missing_tag = fake.describe_image("web", "8").await.unwrap_err();
        assert!(missing_tag.to_string().contains("web:8"));
        let missing_repo = fake.describe_repository("api").await.unwrap_err();
        assert!(matches!(missing_repo, ProbeError::NotFound { .. }));
    }
}
