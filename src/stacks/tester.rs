//! Test harness stack
//!
//! A single small instance inside the network, reachable only from the
//! enumerated blocks and able to reach only the enumerated blocks plus the
//! database. Whether this stack is composed at all is decided by the
//! compiler from the deployment target.

use tracing::info;

use stackwire_common::handle::{BoundaryHandle, DatabaseHandle, IdentityHandle, ResourceId};
use stackwire_common::network::{Ipv4Cidr, NetworkHandle, SubnetSelection};
use stackwire_common::policy::{Endpoint, NetworkRule, Port};
use stackwire_common::resource::ResourceSpec;
use stackwire_common::stack::Stack;
use stackwire_common::Result;

use crate::config::{HarnessConfig, HarnessPeer};

/// Handles the harness borrows
#[derive(Clone, Copy, Debug)]
pub struct TesterInputs<'a> {
    /// Stack name
    pub name: &'a str,
    /// Network the instance is placed in
    pub network: &'a NetworkHandle,
    /// Database the harness exercises
    pub database: &'a DatabaseHandle,
    /// Instance and allowlist settings
    pub config: &'a HarnessConfig,
}

/// The only CIDR tuples the harness boundary may carry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HarnessAllowlist {
    /// Harness boundary
    pub boundary: ResourceId,
    /// Harness identity
    pub identity: ResourceId,
    /// Permitted inbound `(peer, port)` tuples
    pub ingress: Vec<(Ipv4Cidr, Port)>,
    /// Permitted outbound `(peer, port)` tuples
    pub egress: Vec<(Ipv4Cidr, Port)>,
}

impl HarnessAllowlist {
    /// Whether a CIDR rule on the harness boundary was enumerated
    pub fn permits(&self, rule: &NetworkRule) -> bool {
        match (&rule.from, &rule.to) {
            (Endpoint::Cidr(peer), Endpoint::Boundary(b)) if *b == self.boundary => self
                .ingress
                .iter()
                .any(|(cidr, port)| cidr == peer && *port == rule.port),
            (Endpoint::Boundary(b), Endpoint::Cidr(peer)) if *b == self.boundary => self
                .egress
                .iter()
                .any(|(cidr, port)| cidr == peer && *port == rule.port),
            _ => false,
        }
    }
}

/// Harness stack output
#[derive(Clone, Debug)]
pub struct CompiledTester {
    /// Declarations
    pub stack: Stack,
    /// Instance
    pub instance: ResourceId,
    /// Boundary attached to the instance
    pub boundary: BoundaryHandle,
    /// Instance identity
    pub identity: IdentityHandle,
    /// Enumerated CIDR tuples, for validation
    pub allowlist: HarnessAllowlist,
}

/// Compiles the test harness
pub struct TesterStack;

fn port_of(peer: &HarnessPeer) -> Port {
    peer.port.map(Port::tcp).unwrap_or_else(Port::all_tcp)
}

impl TesterStack {
    /// Declare the cache rule, identity, boundary, rules and instance
    pub fn compile(inputs: &TesterInputs<'_>) -> Result<CompiledTester> {
        let config = inputs.config;
        let mut stack = Stack::new(inputs.name);

        if let Some(cache) = &config.cache_rule {
            stack.declare(
                "RegistryCache",
                ResourceSpec::PullThroughCacheRule {
                    repository_prefix: cache.repository_prefix.clone(),
                    upstream_registry_url: cache.upstream_registry_url.clone(),
                },
            )?;
        }

        let identity = IdentityHandle {
            id: stack.declare(
                "InstanceIdentity",
                ResourceSpec::Identity {
                    assumed_by: "ec2.amazonaws.com".to_string(),
                    managed_policies: config.managed_policies.clone(),
                },
            )?,
        };

        let boundary = BoundaryHandle {
            id: stack.declare(
                "HarnessBoundary",
                ResourceSpec::SecurityBoundary {
                    network: inputs.network.id.clone(),
                    description: "test harness".to_string(),
                    allow_all_outbound: false,
                    disable_inline_rules: true,
                },
            )?,
        };

        let mut allowlist = HarnessAllowlist {
            boundary: boundary.id.clone(),
            identity: identity.id.clone(),
            ingress: Vec::new(),
            egress: Vec::new(),
        };
        for peer in &config.ingress {
            let port = port_of(peer);
            stack.allow(NetworkRule::ingress(
                &boundary.id,
                peer.cidr,
                port,
                format!("harness ingress from {}", peer.cidr),
            ));
            allowlist.ingress.push((peer.cidr, port));
        }
        for peer in &config.egress {
            let port = port_of(peer);
            stack.allow(NetworkRule::egress(
                &boundary.id,
                peer.cidr,
                port,
                format!("harness egress to {}", peer.cidr),
            ));
            allowlist.egress.push((peer.cidr, port));
        }
        stack.allow(
            inputs
                .database
                .allow_default_port_from(&boundary, "harness to database"),
        );

        let subnets = inputs.network.subnet_ids(&SubnetSelection::ContainsAddresses(
            config.subnet_addresses.clone(),
        ))?;
        let instance = stack.declare(
            "Instance",
            ResourceSpec::Instance {
                instance_type: config.instance_type.clone(),
                machine_image: config.machine_image.clone(),
                subnets,
                identity: identity.id.clone(),
                boundary: boundary.id.clone(),
                user_data_causes_replacement: true,
            },
        )?;
        stack.export(&instance)?;
        stack.export(&boundary.id)?;

        info!(
            stack = %inputs.name,
            instance_type = %config.instance_type,
            ingress = allowlist.ingress.len(),
            egress = allowlist.egress.len(),
            "compiled test harness"
        );
        Ok(CompiledTester {
            stack,
            instance,
            boundary,
            identity,
            allowlist,
        })
    }
}
