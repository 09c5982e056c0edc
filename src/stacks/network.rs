//! Network topology stack
//!
//! Declares the virtual network and its subnets. Placement is checked here:
//! every subnet must sit inside the network and no two subnets may overlap.

use tracing::info;

use stackwire_common::network::{NetworkHandle, SubnetHandle};
use stackwire_common::resource::ResourceSpec;
use stackwire_common::stack::Stack;
use stackwire_common::{Error, Result};

use crate::config::NetworkConfig;

/// Network stack output
#[derive(Clone, Debug)]
pub struct CompiledNetwork {
    /// Declarations
    pub stack: Stack,
    /// Network and subnets for consumers
    pub network: NetworkHandle,
}

/// Compiles the network topology
pub struct NetworkStack;

impl NetworkStack {
    /// Declare the network and its subnets
    pub fn compile(name: &str, config: &NetworkConfig) -> Result<CompiledNetwork> {
        let mut stack = Stack::new(name);
        let network_id = stack.declare("Network", ResourceSpec::Network { cidr: config.cidr })?;
        stack.export(&network_id)?;

        let mut subnets: Vec<SubnetHandle> = Vec::with_capacity(config.subnets.len());
        for subnet in &config.subnets {
            if !config.cidr.contains_cidr(&subnet.cidr) {
                return Err(Error::network(format!(
                    "subnet {} ({}) is outside network {}",
                    subnet.name, subnet.cidr, config.cidr
                )));
            }
            if let Some(other) = subnets.iter().find(|s| s.cidr.overlaps(&subnet.cidr)) {
                return Err(Error::network(format!(
                    "subnet {} ({}) overlaps {} ({})",
                    subnet.name,
                    subnet.cidr,
                    other.id.logical_id(),
                    other.cidr
                )));
            }

            let id = stack.declare(
                &subnet.name,
                ResourceSpec::Subnet {
                    network: network_id.clone(),
                    cidr: subnet.cidr,
                    role: subnet.role,
                    availability_zone: subnet.availability_zone.clone(),
                    tags: subnet.tags.clone(),
                },
            )?;
            stack.export(&id)?;
            subnets.push(SubnetHandle {
                id,
                cidr: subnet.cidr,
                role: subnet.role,
                availability_zone: subnet.availability_zone.clone(),
                tags: subnet.tags.clone(),
            });
        }

        if subnets.is_empty() {
            return Err(Error::network(format!("network {} declares no subnets", name)));
        }

        info!(stack = %name, cidr = %config.cidr, subnets = subnets.len(), "compiled network");
        Ok(CompiledNetwork {
            stack,
            network: NetworkHandle {
                id: network_id,
                cidr: config.cidr,
                subnets,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubnetConfig;
    use stackwire_common::network::{SubnetRole, SubnetSelection};
    use stackwire_common::resource::ResourceKind;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;

    fn subnet(name: &str, cidr: &str, role: SubnetRole) -> SubnetConfig {
        SubnetConfig {
            name: name.into(),
            cidr: cidr.parse().unwrap(),
            role,
            availability_zone: "a".into(),
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn default_layout_compiles_and_exports_everything() {
        let compiled = NetworkStack::compile("orders-network", &NetworkConfig::default()).unwrap();
        assert_eq!(compiled.stack.count(ResourceKind::Subnet), 6);
        assert_eq!(compiled.stack.outputs().len(), 7);
        assert_eq!(compiled.network.subnets.len(), 6);

        let pinned = compiled
            .network
            .subnet_ids(&SubnetSelection::ContainsAddresses(vec![
                Ipv4Addr::new(100, 64, 12, 100),
                Ipv4Addr::new(100, 64, 16, 100),
            ]))
            .unwrap();
        let names: Vec<&str> = pinned.iter().map(|id| id.logical_id()).collect();
        assert_eq!(names, vec!["PrivateA", "PrivateB"]);
    }

    #[test]
    fn subnet_outside_network_is_rejected() {
        let config = NetworkConfig {
            cidr: "100.64.0.0/16".parse().unwrap(),
            subnets: vec![subnet("Stray", "10.0.0.0/24", SubnetRole::Private)],
        };
        let err = NetworkStack::compile("net", &config).unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(err.to_string().contains("outside network"));
    }

    #[test]
    fn overlapping_subnets_are_rejected() {
        let config = NetworkConfig {
            cidr: "100.64.0.0/16".parse().unwrap(),
            subnets: vec![
                subnet("Wide", "100.64.0.0/20", SubnetRole::Private),
                subnet("Narrow", "100.64.4.0/24", SubnetRole::Public),
            ],
        };
        let err = NetworkStack::compile("net", &config).unwrap_err();
        assert!(err.to_string().contains("overlaps Wide"));
    }

    #[test]
    fn empty_network_is_rejected() {
        let config = NetworkConfig {
            cidr: "100.64.0.0/16".parse().unwrap(),
            subnets: vec![],
        };
        assert!(NetworkStack::compile("net", &config).is_err());
    }
}
