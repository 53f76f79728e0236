//! Typed records returned by the read-only collaborators.
//!
//! These mirror the shape of the provisioning, orchestration, log, network and
//! load-balancer services closely enough for diagnosis and no further. All
//! records are plain data: `Serialize + Deserialize` so a whole cluster can be
//! captured as a JSON snapshot and replayed through the fakes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// One page of a list/describe operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Continuation token; `None` on the final page.
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    /// A final page.
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }

    /// A page followed by more.
    pub fn with_next(items: Vec<T>, token: impl Into<String>) -> Self {
        Self {
            items,
            next_token: Some(token.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Provisioning stacks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackDescription {
    pub name: String,
    /// e.g. `CREATE_COMPLETE`, `CREATE_FAILED`, `ROLLBACK_COMPLETE`
    pub status: String,
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackResource {
    pub logical_id: String,
    #[serde(default)]
    pub physical_id: Option<String>,
    pub resource_type: String,
    pub status: String,
    #[serde(default)]
    pub status_reason: Option<String>,
}

impl StackResource {
    pub fn is_failed(&self) -> bool {
        self.status.ends_with("FAILED")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackEvent {
    pub timestamp: DateTime<Utc>,
    pub logical_id: String,
    pub resource_type: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Summary row from a stack listing, used to find deleted stacks by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackSummary {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Cluster orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub running_tasks: u32,
    #[serde(default)]
    pub pending_tasks: u32,
    #[serde(default)]
    pub active_services: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescription {
    pub cluster: String,
    pub name: String,
    /// `ACTIVE`, `DRAINING` or `INACTIVE`
    pub status: String,
    pub desired_count: u32,
    pub running_count: u32,
    #[serde(default)]
    pub pending_count: u32,
    #[serde(default)]
    pub task_definition: Option<String>,
    #[serde(default)]
    pub load_balancers: Vec<LoadBalancerBinding>,
    #[serde(default)]
    pub network: Option<NetworkBinding>,
    #[serde(default)]
    pub deployments: Vec<Deployment>,
}

impl ServiceDescription {
    pub fn is_inactive(&self) -> bool {
        self.status.eq_ignore_ascii_case("INACTIVE")
    }

    pub fn primary_deployment(&self) -> Option<&Deployment> {
        self.deployments.iter().find(|d| d.status == "PRIMARY")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerBinding {
    pub target_group_arn: String,
    pub container_name: String,
    pub container_port: u16,
}

/// `awsvpc` network configuration of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkBinding {
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub assign_public_ip: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    /// `PRIMARY` or `ACTIVE`
    pub status: String,
    #[serde(default)]
    pub rollout_state: Option<String>,
    #[serde(default)]
    pub rollout_state_reason: Option<String>,
    #[serde(default)]
    pub desired_count: u32,
    #[serde(default)]
    pub running_count: u32,
    #[serde(default)]
    pub failed_tasks: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub message: String,
}

/// Reference to a service discovered by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub cluster: String,
    pub service: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatusFilter {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_arn: String,
    pub task_definition_arn: String,
    /// Launch group, `service:<name>` for service-managed tasks.
    #[serde(default)]
    pub group: Option<String>,
    pub last_status: String,
    #[serde(default)]
    pub desired_status: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_reason: Option<String>,
    #[serde(default)]
    pub stop_code: Option<String>,
    #[serde(default)]
    pub containers: Vec<ContainerState>,
}

impl TaskRecord {
    /// Short task id (last path segment of the ARN).
    pub fn task_id(&self) -> &str {
        self.task_arn.rsplit('/').next().unwrap_or(&self.task_arn)
    }

    /// Service that launched this task, if any.
    pub fn service_name(&self) -> Option<&str> {
        self.group.as_deref().and_then(|g| g.strip_prefix("service:"))
    }

    pub fn is_stopped(&self) -> bool {
        self.last_status.eq_ignore_ascii_case("STOPPED")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub last_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub arn: String,
    pub family: String,
    pub revision: u32,
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub containers: Vec<ContainerDefinition>,
}

impl TaskDefinition {
    pub fn container(&self, name: &str) -> Option<&ContainerDefinition> {
        self.containers.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub name: String,
    pub image: String,
    #[serde(default = "default_true")]
    pub essential: bool,
    #[serde(default)]
    pub port_mappings: Vec<u16>,
    #[serde(default)]
    pub log_group: Option<String>,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

/// A time-ranged log search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogQuery {
    pub group: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Filter pattern; whitespace-separated terms, any of which may match.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Restrict to streams whose name contains this fragment (e.g. a task id).
    #[serde(default)]
    pub stream_contains: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub stream: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default)]
    pub ingress: Vec<SecurityGroupRule>,
    #[serde(default)]
    pub egress: Vec<SecurityGroupRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    /// `tcp`, `udp`, `icmp` or `-1` for all traffic
    pub protocol: String,
    #[serde(default)]
    pub from_port: Option<u16>,
    #[serde(default)]
    pub to_port: Option<u16>,
    #[serde(default)]
    pub cidr_blocks: Vec<String>,
    #[serde(default)]
    pub source_groups: Vec<String>,
}

impl SecurityGroupRule {
    /// Whether this rule admits TCP traffic on `port` from any source.
    pub fn permits_tcp(&self, port: u16) -> bool {
        if self.cidr_blocks.is_empty() && self.source_groups.is_empty() {
            return false;
        }
        match self.protocol.as_str() {
            "-1" | "all" => true,
            "tcp" | "6" => {
                let from = self.from_port.unwrap_or(0);
                let to = self.to_port.unwrap_or(u16::MAX);
                from <= port && port <= to
            }
            _ => false,
        }
    }

    /// Whether this rule reaches the public internet.
    pub fn is_open_to_world(&self) -> bool {
        self.cidr_blocks.iter().any(|c| c == "0.0.0.0/0" || c == "::/0")
    }

    /// Compact rendering, e.g. `tcp 443-443 from 0.0.0.0/0`.
    pub fn describe(&self) -> String {
        let ports = match (self.from_port, self.to_port) {
            (Some(f), Some(t)) => format!("{f}-{t}"),
            _ => "all".to_string(),
        };
        let mut sources: Vec<&str> = self.cidr_blocks.iter().map(String::as_str).collect();
        sources.extend(self.source_groups.iter().map(String::as_str));
        format!("{} {} from {}", self.protocol, ports, sources.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl Subnet {
    /// Whether the subnet's route table has a usable default route.
    pub fn has_default_route(&self) -> bool {
        self.routes.iter().any(|r| {
            r.destination == "0.0.0.0/0"
                && matches!(
                    r.target,
                    RouteTarget::InternetGateway { .. }
                        | RouteTarget::NatGateway { .. }
                        | RouteTarget::TransitGateway { .. }
                )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub destination: String,
    pub target: RouteTarget,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteTarget {
    Local,
    InternetGateway { id: String },
    NatGateway { id: String },
    TransitGateway { id: String },
    VpcEndpoint { id: String },
    Blackhole,
}

// ---------------------------------------------------------------------------
// Image registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    #[serde(default)]
    pub uri: Option<String>,
}

/// One pushed image; an image may carry several tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageDetail {
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub pushed_at: Option<DateTime<Utc>>,
}

impl ImageDetail {
    /// Whether `reference` names this image, as a tag or a `sha256:` digest.
    pub fn matches(&self, reference: &str) -> bool {
        self.tags.iter().any(|t| t == reference) || self.digest.as_deref() == Some(reference)
    }
}

// ---------------------------------------------------------------------------
// Load balancing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetGroup {
    pub arn: String,
    #[serde(default)]
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Option<String>,
    /// `instance` or `ip`
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub health_check_path: Option<String>,
    /// `traffic-port` or an explicit port number
    #[serde(default = "default_health_check_port")]
    pub health_check_port: String,
}

fn default_health_check_port() -> String {
    "traffic-port".to_string()
}

impl TargetGroup {
    /// The port health checks are sent to, given the registered traffic port.
    pub fn effective_health_check_port(&self, traffic_port: u16) -> u16 {
        self.health_check_port.parse().unwrap_or(traffic_port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetHealth {
    pub target_id: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub state: TargetState,
    /// e.g. `Target.Timeout`, `Target.ResponseCodeMismatch`
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Initial,
    Healthy,
    Unhealthy,
    Unused,
    Draining,
    Unavailable,
}
