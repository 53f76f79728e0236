//! Network path checks: security groups against the container and
//! health-check ports, subnet routes, and load-balancer target health.
//!
//! Security groups admit traffic if any attached group has a matching rule,
//! so a port is only reported blocked when no group of the service admits it.

use async_trait::async_trait;
use cluster_probe::{SecurityGroup, ServiceDescription, TargetState};

use super::{FetchContext, FetchOutcome, Fetcher};
use crate::domain::{Evidence, EvidenceSource, FetchError, Finding, Severity};

const SOURCE: EvidenceSource = EvidenceSource::Network;

/// Port tasks need for outbound registry and API traffic.
const EGRESS_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkFetcher;

fn admits_ingress(groups: &[SecurityGroup], port: u16) -> bool {
    groups
        .iter()
        .any(|g| g.ingress.iter().any(|r| r.permits_tcp(port)))
}

fn admits_egress(groups: &[SecurityGroup], port: u16) -> bool {
    groups
        .iter()
        .any(|g| g.egress.iter().any(|r| r.permits_tcp(port)))
}

fn rules_summary(group: &SecurityGroup) -> String {
    if group.ingress.is_empty() {
        return "no ingress rules".to_string();
    }
    group
        .ingress
        .iter()
        .map(|r| r.describe())
        .collect::<Vec<_>>()
        .join("; ")
}

fn group_label(group: &SecurityGroup) -> String {
    if group.name.is_empty() {
        group.id.clone()
    } else {
        format!("{} ({})", group.id, group.name)
    }
}

impl NetworkFetcher {
    /// Container port from the load-balancer binding, the request, or the task definition.
    async fn container_port(
        &self,
        ctx: &FetchContext,
        svc: &ServiceDescription,
        out: &mut FetchOutcome,
    ) -> Option<u16> {
        if let Some(port) = ctx.param("container_port").and_then(|p| p.parse().ok()) {
            return Some(port);
        }
        if let Some(binding) = svc.load_balancers.first() {
            return Some(binding.container_port);
        }
        let arn = svc.task_definition.as_deref()?;
        let api = &ctx.collaborators.cluster;
        match ctx
            .controls
            .call("ecs:DescribeTaskDefinition", || api.describe_task_definition(arn))
            .await
        {
            Ok(def) => def
                .containers
                .iter()
                .filter(|c| c.essential)
                .find_map(|c| c.port_mappings.first().copied()),
            Err(err) => {
                out.absorb(SOURCE, err);
                None
            }
        }
    }

    fn check_security_groups(
        &self,
        groups: &[SecurityGroup],
        port: Option<u16>,
        out: &mut FetchOutcome,
    ) {
        if let Some(port) = port {
            if !admits_ingress(groups, port) {
                for group in groups {
                    out.push(
                        Evidence::new(
                            SOURCE,
                            Severity::Error,
                            Finding::PortBlocked {
                                security_group: group.id.clone(),
                                port,
                            },
                            format!(
                                "security group {} admits no tcp/{port} ingress; rules: {}",
                                group_label(group),
                                rules_summary(group)
                            ),
                        )
                        .with_raw("vpc_id", group.vpc_id.clone()),
                    );
                }
            }
        }

        if !admits_egress(groups, EGRESS_PORT) {
            for group in groups {
                out.push(Evidence::new(
                    SOURCE,
                    Severity::Warning,
                    Finding::EgressBlocked {
                        security_group: group.id.clone(),
                    },
                    format!(
                        "security group {} allows no tcp/{EGRESS_PORT} egress; image pulls and API calls will fail",
                        group_label(group)
                    ),
                ));
            }
        }
    }

    async fn check_load_balancers(
        &self,
        ctx: &FetchContext,
        svc: &ServiceDescription,
        groups: &[SecurityGroup],
        out: &mut FetchOutcome,
    ) {
        let api = &ctx.collaborators.load_balancers;
        for binding in &svc.load_balancers {
            let arn = binding.target_group_arn.as_str();
            let tg = match ctx
                .controls
                .call("elbv2:DescribeTargetGroups", || api.describe_target_group(arn))
                .await
            {
                Ok(tg) => tg,
                Err(err) => {
                    out.absorb(SOURCE, err);
                    continue;
                }
            };

            if tg.port != binding.container_port {
                out.push(Evidence::new(
                    SOURCE,
                    Severity::Warning,
                    Finding::PortMismatch {
                        target_group: tg.name.clone(),
                        container_port: binding.container_port,
                        target_port: tg.port,
                    },
                    format!(
                        "target group {} listens on {} but container {} exposes {}",
                        tg.name, tg.port, binding.container_name, binding.container_port
                    ),
                ));
            }

            let hc_port = tg.effective_health_check_port(binding.container_port);
            if !groups.is_empty()
                && hc_port != binding.container_port
                && !admits_ingress(groups, hc_port)
            {
                for group in groups {
                    out.push(Evidence::new(
                        SOURCE,
                        Severity::Error,
                        Finding::HealthCheckPortBlocked {
                            security_group: group.id.clone(),
                            port: hc_port,
                        },
                        format!(
                            "security group {} blocks health checks on tcp/{hc_port} (path {}); rules: {}",
                            group_label(group),
                            tg.health_check_path.as_deref().unwrap_or("/"),
                            rules_summary(group)
                        ),
                    ));
                }
            }

            let mut health = ctx
                .controls
                .collect_pages("elbv2:DescribeTargetHealth", |token| {
                    api.describe_target_health(arn, token)
                })
                .await;
            out.absorb_collected(SOURCE, "elbv2:DescribeTargetHealth", &mut health);

            let unhealthy: Vec<_> = health
                .items
                .iter()
                .filter(|t| t.state == TargetState::Unhealthy)
                .collect();
            for target in &unhealthy {
                let detail = target
                    .description
                    .as_deref()
                    .or(target.reason.as_deref())
                    .unwrap_or("no detail");
                out.push(
                    Evidence::new(
                        SOURCE,
                        Severity::Error,
                        Finding::TargetUnhealthy {
                            target_group: tg.name.clone(),
                            target_id: target.target_id.clone(),
                            reason: target.reason.clone(),
                        },
                        format!(
                            "target {} in {} is unhealthy: {detail}",
                            target.target_id, tg.name
                        ),
                    )
                    .with_raw("port", target.port),
                );
            }
            if unhealthy.is_empty() && health.error.is_none() {
                let count = health
                    .items
                    .iter()
                    .filter(|t| t.state == TargetState::Healthy)
                    .count() as u32;
                out.push(Evidence::new(
                    SOURCE,
                    Severity::Info,
                    Finding::TargetsHealthy {
                        target_group: tg.name.clone(),
                        count,
                    },
                    format!("{count} healthy target(s) in {}", tg.name),
                ));
            }
        }
    }
}

#[async_trait]
impl Fetcher for NetworkFetcher {
    fn source(&self) -> EvidenceSource {
        SOURCE
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<FetchOutcome, FetchError> {
        let mut out = ctx.outcome();
        let cluster = ctx.target.cluster.clone();
        let Some(name) = ctx.target.service_name().map(str::to_string) else {
            out.warn(SOURCE, "no service name could be resolved; network not inspected");
            return Ok(out);
        };

        let api = &ctx.collaborators.cluster;
        let svc = match ctx
            .controls
            .call("ecs:DescribeServices", || api.describe_service(&cluster, &name))
            .await
        {
            Ok(svc) => svc,
            Err(FetchError::NotFound { .. }) => {
                out.push(Evidence::new(
                    SOURCE,
                    Severity::Error,
                    Finding::ServiceMissing {
                        cluster: cluster.clone(),
                        service: name.clone(),
                    },
                    format!("service {name} was not found in cluster {cluster}; no network to inspect"),
                ));
                return Ok(out);
            }
            Err(err) => {
                out.absorb(SOURCE, err);
                return Ok(out);
            }
        };

        let port = self.container_port(ctx, &svc, &mut out).await;
        let mut groups = Vec::new();

        match &svc.network {
            None => out.push(Evidence::new(
                SOURCE,
                Severity::Info,
                Finding::NetworkUnconfigured {
                    service: name.clone(),
                },
                format!("service {name} has no awsvpc network configuration; security groups not checked"),
            )),
            Some(binding) => {
                let network = &ctx.collaborators.network;
                match ctx
                    .controls
                    .call("ec2:DescribeSecurityGroups", || {
                        network.describe_security_groups(&binding.security_groups)
                    })
                    .await
                {
                    Ok(found) => groups = found,
                    Err(err) => out.absorb(SOURCE, err),
                }
                self.check_security_groups(&groups, port, &mut out);

                match ctx
                    .controls
                    .call("ec2:DescribeSubnets", || {
                        network.describe_subnets(&binding.subnets)
                    })
                    .await
                {
                    Ok(subnets) => {
                        for subnet in subnets.iter().filter(|s| !s.has_default_route()) {
                            out.push(
                                Evidence::new(
                                    SOURCE,
                                    Severity::Warning,
                                    Finding::SubnetWithoutRoute {
                                        subnet: subnet.id.clone(),
                                    },
                                    format!(
                                        "subnet {} has no default route to an internet or NAT gateway",
                                        subnet.id
                                    ),
                                )
                                .with_raw("availability_zone", subnet.availability_zone.clone())
                                .with_raw("assign_public_ip", binding.assign_public_ip),
                            );
                        }
                    }
                    Err(err) => out.absorb(SOURCE, err),
                }
            }
        }

        self.check_load_balancers(ctx, &svc, &groups, &mut out).await;
        Ok(out.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_probe::SecurityGroupRule;

    fn group(id: &str, ingress: Vec<SecurityGroupRule>) -> SecurityGroup {
        SecurityGroup {
            id: id.to_string(),
            name: String::new(),
            vpc_id: None,
            ingress,
            egress: vec![SecurityGroupRule {
                protocol: "-1".to_string(),
                from_port: None,
                to_port: None,
                cidr_blocks: vec!["0.0.0.0/0".to_string()],
                source_groups: vec![],
            }],
        }
    }

    fn tcp(port: u16) -> SecurityGroupRule {
        SecurityGroupRule {
            protocol: "tcp".to_string(),
            from_port: Some(port),
            to_port: Some(port),
            cidr_blocks: vec!["0.0.0.0/0".to_string()],
            source_groups: vec![],
        }
    }

    #[test]
    fn test_any_group_admitting_is_enough() {
        let groups = vec![group("sg-a", vec![tcp(443)]), group("sg-b", vec![tcp(8080)])];
        assert!(admits_ingress(&groups, 8080));
        assert!(!admits_ingress(&groups, 9090));
        assert!(admits_egress(&groups, 443));
    }

    #[test]
    fn test_blocked_port_names_group_and_rules() {
        let groups = vec![group("sg-a", vec![tcp(443)])];
        let mut out = FetchOutcome::default();
        NetworkFetcher.check_security_groups(&groups, Some(8080), &mut out);
        assert_eq!(out.evidence.len(), 1);
        let e = &out.evidence[0];
        assert_eq!(e.severity(), Severity::Error);
        assert!(e.message().contains("sg-a"));
        assert!(e.message().contains("tcp 443-443 from 0.0.0.0/0"));
    }

    #[test]
    fn test_missing_egress_is_flagged() {
        let mut g = group("sg-a", vec![tcp(80)]);
        g.egress.clear();
        let mut out = FetchOutcome::default();
        NetworkFetcher.check_security_groups(&[g], Some(80), &mut out);
        assert!(matches!(
            out.evidence[0].finding(),
            Finding::EgressBlocked { .. }
        ));
    }
}
