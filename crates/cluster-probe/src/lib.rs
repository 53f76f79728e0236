//! Cluster-Probe: read-only collaborator layer for deploy-triage
//!
//! This crate defines every external service the troubleshooting engine talks
//! to, as async traits over a typed record model, plus in-memory fakes.
//!
//! ## Layer 0 - Collaborators
//!
//! Focus: a uniform failure taxonomy (not-found, access-denied, throttled,
//! unavailable), continuation-token pagination, and no mutation of any kind.
//!
//! ## Key Components
//!
//! - `Collaborators`: the bundle of injected service handles
//! - `ProbeError`: the four failure conditions every call may report
//! - `fakes::InMemoryCluster`: snapshot-backed implementation with fault injection

mod error;
pub mod fakes;
pub mod model;
pub mod probe_traits;

pub use error::ProbeError;
pub use model::{
    ClusterSummary, ContainerDefinition, ContainerState, Deployment, ImageDetail,
    LoadBalancerBinding, LogEvent, LogQuery, NetworkBinding, Page, Repository, Route, RouteTarget,
    SecurityGroup, SecurityGroupRule, ServiceDescription, ServiceEvent, ServiceRef,
    StackDescription, StackEvent, StackResource, StackSummary, Subnet, TargetGroup, TargetHealth,
    TargetState, TaskDefinition, TaskRecord, TaskStatusFilter,
};
pub use probe_traits::{
    ClusterApi, Collaborators, LoadBalancerApi, LogApi, NetworkApi, PageToken, ProbeResult,
    RegistryApi, StackStatusApi,
};
