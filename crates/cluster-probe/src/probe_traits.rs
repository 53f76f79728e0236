//! Collaborator trait definitions for deploy-triage
//!
//! These traits define the read-only external services the engine consults:
//! - `StackStatusApi`: provisioning stack status, resources and events
//! - `ClusterApi`: cluster, service, task and task-definition lookups
//! - `LogApi`: time-ranged log retrieval and filtering
//! - `NetworkApi`: security groups and subnets with their routes
//! - `LoadBalancerApi`: target groups and target health
//! - `RegistryApi`: image repositories and the images pushed to them
//!
//! All traits are async and backend-agnostic; none of them mutate anything.
//! Listing operations are paginated with an opaque continuation token. In-memory
//! fakes are provided for testing via the `fakes` module.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProbeError;
use crate::model::*;

/// Result type for collaborator calls
pub type ProbeResult<T> = std::result::Result<T, ProbeError>;

/// Continuation token passed back into a paginated call.
pub type PageToken = Option<String>;

#[async_trait]
pub trait StackStatusApi: Send + Sync {
    /// Describe a stack by name. `ProbeError::NotFound` if it does not exist.
    async fn describe_stack(&self, name: &str) -> ProbeResult<StackDescription>;

    async fn list_stack_resources(
        &self,
        name: &str,
        token: PageToken,
    ) -> ProbeResult<Page<StackResource>>;

    /// Stack events, newest first.
    async fn list_stack_events(&self, name: &str, token: PageToken)
        -> ProbeResult<Page<StackEvent>>;

    /// Stacks that have been deleted, for spotting torn-down infrastructure.
    async fn list_deleted_stacks(&self, token: PageToken) -> ProbeResult<Page<StackSummary>>;
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_clusters(&self, token: PageToken) -> ProbeResult<Page<ClusterSummary>>;

    async fn list_services(&self, cluster: &str, token: PageToken) -> ProbeResult<Page<String>>;

    /// Describe one service. `ProbeError::NotFound` if the cluster or service is absent.
    async fn describe_service(
        &self,
        cluster: &str,
        service: &str,
    ) -> ProbeResult<ServiceDescription>;

    /// Service events, newest first.
    async fn list_service_events(
        &self,
        cluster: &str,
        service: &str,
        token: PageToken,
    ) -> ProbeResult<Page<ServiceEvent>>;

    /// List and describe tasks in one step. `service` narrows to one service's tasks.
    async fn list_tasks(
        &self,
        cluster: &str,
        service: Option<&str>,
        status: TaskStatusFilter,
        token: PageToken,
    ) -> ProbeResult<Page<TaskRecord>>;

    async fn describe_task_definition(&self, arn: &str) -> ProbeResult<TaskDefinition>;

    /// Task-definition ARNs whose family starts with `family_prefix`, newest
    /// revision first.
    async fn list_task_definitions(
        &self,
        family_prefix: &str,
        token: PageToken,
    ) -> ProbeResult<Page<String>>;
}

#[async_trait]
pub trait LogApi: Send + Sync {
    /// Log group names starting with `prefix`.
    async fn describe_log_groups(&self, prefix: &str, token: PageToken)
        -> ProbeResult<Page<String>>;

    /// Events matching the query, oldest first.
    async fn filter_log_events(
        &self,
        query: &LogQuery,
        token: PageToken,
    ) -> ProbeResult<Page<LogEvent>>;
}

#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn describe_security_groups(&self, ids: &[String]) -> ProbeResult<Vec<SecurityGroup>>;

    /// Subnets with the routes of their associated route table.
    async fn describe_subnets(&self, ids: &[String]) -> ProbeResult<Vec<Subnet>>;
}

#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    async fn describe_target_group(&self, arn: &str) -> ProbeResult<TargetGroup>;

    async fn describe_target_health(
        &self,
        arn: &str,
        token: PageToken,
    ) -> ProbeResult<Page<TargetHealth>>;
}

#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// `ProbeError::NotFound` if no repository has this name.
    async fn describe_repository(&self, name: &str) -> ProbeResult<Repository>;

    /// The image in `repository` tagged (or digested) `reference`.
    /// `ProbeError::NotFound` if the repository or the image is absent.
    async fn describe_image(&self, repository: &str, reference: &str)
        -> ProbeResult<ImageDetail>;
}

/// Explicitly passed collaborator handles.
///
/// Cheap to clone; every fetcher receives the bundle rather than reaching for
/// a process-wide client.
#[derive(Clone)]
pub struct Collaborators {
    pub stacks: Arc<dyn StackStatusApi>,
    pub cluster: Arc<dyn ClusterApi>,
    pub logs: Arc<dyn LogApi>,
    pub network: Arc<dyn NetworkApi>,
    pub load_balancers: Arc<dyn LoadBalancerApi>,
    pub registry: Arc<dyn RegistryApi>,
}

impl Collaborators {
    /// Use one backend for every service (the in-memory fake implements all six).
    pub fn uniform<B>(backend: Arc<B>) -> Self
    where
        B: StackStatusApi
            + ClusterApi
            + LogApi
            + NetworkApi
            + LoadBalancerApi
            + RegistryApi
            + 'static,
    {
        Self {
            stacks: backend.clone(),
            cluster: backend.clone(),
            logs: backend.clone(),
            network: backend.clone(),
            load_balancers: backend.clone(),
            registry: backend,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
