//! Batch validation of a composed deployment
//!
//! Stacks collect grants and network rules as plain data. This module checks
//! the merged result in one pass and reports every violation at once:
//!
//! - every cross-stack reference traces to an earlier stack's output
//! - every seed upload is ordered before the services next to it
//! - every load-balanced service starts after its listener
//! - each task identity holds exactly the grants its consumption implies
//! - each load-balanced service can be probed and reached
//! - the database admits only consumer boundaries on its default port
//! - the harness boundary carries only enumerated CIDR tuples
//!
//! Cycles are reported separately as [`Error::DependencyCycle`].

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use stackwire_common::grant::{GrantPlanner, GrantSet};
use stackwire_common::handle::{
    IdentityHandle, KeyHandle, RepositoryHandle, ResourceId, SecretRef,
};
use stackwire_common::policy::{Endpoint, NetworkPolicy, Port, Protocol};
use stackwire_common::resource::{ImageReference, ResourceSpec};
use stackwire_common::{Error, Result};

use crate::compiler::Deployment;
use crate::config::BROAD_MANAGED_POLICIES;

/// Validate a deployment, collecting every violation into one error
pub fn validate(deployment: &Deployment) -> Result<()> {
    let violations = violations(deployment);
    if !violations.is_empty() {
        warn!(
            deployment = %deployment.name(),
            count = violations.len(),
            "deployment failed validation"
        );
        return Err(Error::validation(violations.join("; ")));
    }

    deployment.apply_waves()?;
    debug!(deployment = %deployment.name(), "deployment validated");
    Ok(())
}

/// Every invariant violation in a deployment, without cycle detection
pub fn violations(deployment: &Deployment) -> Vec<String> {
    let mut violations = Vec::new();
    check_references(deployment, &mut violations);
    check_seeding(deployment, &mut violations);
    check_listener_ordering(deployment, &mut violations);
    check_grants(deployment, &mut violations);
    check_identities(deployment, &mut violations);

    let policy = deployment.policy();
    check_rule_endpoints(deployment, &mut violations);
    check_health_checks(deployment, &policy, &mut violations);
    check_database_access(deployment, &mut violations);
    check_harness(deployment, &policy, &mut violations);
    violations
}

// =============================================================================
// References
// =============================================================================

fn check_references(deployment: &Deployment, violations: &mut Vec<String>) {
    let mut available: BTreeSet<&ResourceId> = BTreeSet::new();
    for stack in deployment.stacks() {
        for import in stack.imports() {
            if available.contains(&import) {
                continue;
            }
            if deployment.resource(&import).is_none() {
                violations.push(format!(
                    "{} references {} which no stack declares",
                    stack.name(),
                    import
                ));
            } else {
                violations.push(format!(
                    "{} borrows {} which no earlier stack exports",
                    stack.name(),
                    import
                ));
            }
        }
        available.extend(stack.outputs().iter());
    }

    for edge in deployment.graph().dangling_edges() {
        if edge.consumer.stack() == edge.producer.stack() {
            violations.push(format!(
                "{} references undeclared {}",
                edge.consumer, edge.producer
            ));
        }
    }
}

// =============================================================================
// Ordering
// =============================================================================

fn check_seeding(deployment: &Deployment, violations: &mut Vec<String>) {
    let graph = deployment.graph();
    for stack in deployment.stacks() {
        let uploads: Vec<&ResourceId> = stack
            .resources()
            .filter(|r| matches!(r.spec, ResourceSpec::BucketDeployment { .. }))
            .map(|r| &r.id)
            .collect();
        if uploads.is_empty() {
            continue;
        }
        for service in stack
            .resources()
            .filter(|r| matches!(r.spec, ResourceSpec::Service { .. }))
        {
            for upload in &uploads {
                if !graph.depends_on(&service.id, upload) {
                    violations.push(format!(
                        "{} may start before seed upload {} completes",
                        service.id, upload
                    ));
                }
            }
        }
    }
}

fn check_listener_ordering(deployment: &Deployment, violations: &mut Vec<String>) {
    let graph = deployment.graph();
    for resource in deployment.resources() {
        let ResourceSpec::Service { target_group, .. } = &resource.spec else {
            continue;
        };
        for listener in deployment.resources() {
            let attaches = matches!(
                &listener.spec,
                ResourceSpec::Listener { target_group: tg, .. } if tg == target_group
            );
            if attaches && !graph.depends_on(&resource.id, &listener.id) {
                violations.push(format!(
                    "{} may start before listener {} attaches its target group",
                    resource.id, listener.id
                ));
            }
        }
    }
}

// =============================================================================
// Grants
// =============================================================================

fn key_handle(deployment: &Deployment, id: &ResourceId) -> Option<KeyHandle> {
    deployment.resource(id).map(|_| KeyHandle { id: id.clone() })
}

fn repository_handle(deployment: &Deployment, id: &ResourceId) -> Option<RepositoryHandle> {
    let name = match &deployment.resource(id)?.spec {
        ResourceSpec::Repository { name, .. } => name.clone(),
        ResourceSpec::Imported { value, .. } => value.clone(),
        _ => return None,
    };
    Some(RepositoryHandle {
        id: id.clone(),
        name,
    })
}

fn secret_ref(deployment: &Deployment, id: &ResourceId) -> Option<SecretRef> {
    match &deployment.resource(id)?.spec {
        ResourceSpec::Secret {
            name,
            encryption_key,
        } => Some(SecretRef {
            id: id.clone(),
            name: name.clone(),
            encryption_key: encryption_key.as_ref().map(|k| KeyHandle { id: k.clone() }),
        }),
        ResourceSpec::Imported { value, .. } => Some(SecretRef {
            id: id.clone(),
            name: value.clone(),
            encryption_key: None,
        }),
        _ => None,
    }
}

/// Grants implied by what each task definition consumes
pub fn expected_grants(deployment: &Deployment) -> GrantSet {
    let mut expected = GrantSet::new();
    for resource in deployment.resources() {
        let ResourceSpec::TaskDefinition {
            task_identity,
            container,
            ..
        } = &resource.spec
        else {
            continue;
        };

        let principal = IdentityHandle {
            id: task_identity.clone(),
        };
        let mut planner = GrantPlanner::for_identity(&principal);

        let repository = match &container.image {
            ImageReference::Repository { repository, .. } => Some(repository),
            ImageReference::Asset { asset } => match deployment.resource(asset).map(|r| &r.spec) {
                Some(ResourceSpec::ImageAsset { repository, .. }) => Some(repository),
                _ => None,
            },
        };
        if let Some(repository) = repository.and_then(|id| repository_handle(deployment, id)) {
            planner.consume(&repository);
        }

        if let Some(ResourceSpec::LogGroup { encryption_key, .. }) =
            deployment.resource(&container.log_group).map(|r| &r.spec)
        {
            if let Some(key) = key_handle(deployment, encryption_key) {
                planner.consume(&key);
            }
        }

        for secret in container.secrets.values() {
            if let Some(secret) = secret_ref(deployment, secret) {
                planner.consume(&secret);
            }
        }
        expected.extend(planner.finish());
    }
    expected
}

fn check_grants(deployment: &Deployment, violations: &mut Vec<String>) {
    let actual = deployment.grants();
    let expected = expected_grants(deployment);
    for grant in expected.iter() {
        if !actual.contains(grant) {
            violations.push(format!("missing grant: {}", grant));
        }
    }
    for grant in actual.iter() {
        if !expected.contains(grant) {
            violations.push(format!("grant not backed by any consumer: {}", grant));
        }
    }
}

fn check_identities(deployment: &Deployment, violations: &mut Vec<String>) {
    for resource in deployment.resources() {
        if let ResourceSpec::Identity {
            managed_policies, ..
        } = &resource.spec
        {
            for policy in managed_policies {
                if BROAD_MANAGED_POLICIES.contains(&policy.as_str()) {
                    violations.push(format!("{} carries broad policy {}", resource.id, policy));
                }
            }
        }
    }
}

// =============================================================================
// Network rules
// =============================================================================

fn check_rule_endpoints(deployment: &Deployment, violations: &mut Vec<String>) {
    for rule in deployment.rules() {
        for boundary in rule.boundaries() {
            let is_boundary = matches!(
                deployment.resource(boundary).map(|r| &r.spec),
                Some(ResourceSpec::SecurityBoundary { .. })
            );
            if !is_boundary {
                violations.push(format!(
                    "rule {} names {} which is not a security boundary",
                    rule, boundary
                ));
            }
        }
    }
}

fn boundary_of<'a>(
    deployment: &'a Deployment,
    load_balancer: &ResourceId,
) -> Option<(&'a ResourceId, bool)> {
    match &deployment.resource(load_balancer)?.spec {
        ResourceSpec::LoadBalancer {
            boundary,
            internet_facing,
            ..
        } => Some((boundary, *internet_facing)),
        _ => None,
    }
}

fn check_health_checks(
    deployment: &Deployment,
    policy: &NetworkPolicy,
    violations: &mut Vec<String>,
) {
    for resource in deployment.resources() {
        let ResourceSpec::Service {
            target_group,
            boundary: service_boundary,
            ..
        } = &resource.spec
        else {
            continue;
        };
        let Some(ResourceSpec::TargetGroup {
            port: traffic_port,
            health_check,
            ..
        }) = deployment.resource(target_group).map(|r| &r.spec)
        else {
            continue;
        };

        let listeners: Vec<(&ResourceId, u16)> = deployment
            .resources()
            .filter_map(|r| match &r.spec {
                ResourceSpec::Listener {
                    load_balancer,
                    port,
                    target_group: tg,
                } if tg == target_group => Some((load_balancer, *port)),
                _ => None,
            })
            .collect();
        if listeners.is_empty() {
            violations.push(format!("{} has no listener", target_group));
        }

        let service = Endpoint::Boundary(service_boundary.clone());
        for (load_balancer, listener_port) in listeners {
            if let Err(e) = health_check.validate(listener_port) {
                violations.push(format!("{}: {}", target_group, e));
            }
            let Some((lb_boundary, internet_facing)) = boundary_of(deployment, load_balancer) else {
                continue;
            };
            let lb = Endpoint::Boundary(lb_boundary.clone());
            if !policy.permits(&lb, &service, Protocol::Tcp, health_check.port) {
                violations.push(format!(
                    "no rule lets {} probe {} on {}",
                    lb_boundary,
                    resource.id,
                    Port::tcp(health_check.port)
                ));
            }
            if !policy.permits(&lb, &service, Protocol::Tcp, *traffic_port) {
                violations.push(format!(
                    "no rule lets {} forward to {} on {}",
                    lb_boundary,
                    resource.id,
                    Port::tcp(*traffic_port)
                ));
            }
            if internet_facing
                && !policy.permits(&Endpoint::any_ipv4(), &lb, Protocol::Tcp, listener_port)
            {
                violations.push(format!(
                    "{} is internet facing but closed on {}",
                    load_balancer,
                    Port::tcp(listener_port)
                ));
            }
        }
    }
}

fn check_database_access(deployment: &Deployment, violations: &mut Vec<String>) {
    let databases: BTreeMap<&ResourceId, u16> = deployment
        .resources()
        .filter_map(|r| match &r.spec {
            ResourceSpec::DatabaseCluster { boundary, port, .. } => Some((boundary, *port)),
            _ => None,
        })
        .collect();

    for rule in deployment.rules() {
        for (boundary, port) in &databases {
            if rule.is_egress_on(boundary) {
                violations.push(format!("database boundary initiates traffic: {}", rule));
            }
            if rule.is_ingress_on(boundary) {
                let from_boundary = matches!(rule.from, Endpoint::Boundary(_));
                if !from_boundary || rule.port != Port::tcp(*port) {
                    violations.push(format!(
                        "database admits more than consumers on {}: {}",
                        Port::tcp(*port),
                        rule
                    ));
                }
            }
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

fn check_harness(deployment: &Deployment, policy: &NetworkPolicy, violations: &mut Vec<String>) {
    let Some(allowlist) = deployment.harness() else {
        return;
    };
    let boundary = &allowlist.boundary;

    match policy.allows_all_outbound(boundary) {
        Some(false) => {}
        Some(true) => {
            violations.push(format!("harness boundary {} allows all outbound", boundary))
        }
        None => violations.push(format!("harness boundary {} is not declared", boundary)),
    }

    let databases: BTreeSet<&ResourceId> = deployment
        .resources()
        .filter_map(|r| match &r.spec {
            ResourceSpec::DatabaseCluster { boundary, .. } => Some(boundary),
            _ => None,
        })
        .collect();

    for rule in policy.rules_on(boundary) {
        let enumerated = match (&rule.from, &rule.to) {
            (Endpoint::Boundary(from), Endpoint::Boundary(to)) => {
                from == boundary && databases.contains(to)
            }
            _ => allowlist.permits(rule),
        };
        if !enumerated {
            violations.push(format!("harness rule was not enumerated: {}", rule));
        }
    }
}
