//! Network addressing: CIDR blocks, subnets and subnet selection
//!
//! This is pure addressing. Nothing here knows about identities or health.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::handle::ResourceId;
use crate::{Error, Result};

// =============================================================================
// CIDR blocks
// =============================================================================

/// IPv4 CIDR block with no host bits set
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// `0.0.0.0/0`
    pub const ANY: Ipv4Cidr = Ipv4Cidr {
        network: Ipv4Addr::UNSPECIFIED,
        prefix: 0,
    };

    /// Create a block, rejecting prefixes over 32 and set host bits
    pub fn new(network: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(Error::network(format!(
                "prefix length {} out of range for {}",
                prefix, network
            )));
        }
        let cidr = Self { network, prefix };
        if u32::from(network) & !cidr.mask() != 0 {
            return Err(Error::network(format!(
                "{}/{} has host bits set",
                network, prefix
            )));
        }
        Ok(cidr)
    }

    /// Block from literal octets
    ///
    /// Panics on a prefix over 32 or set host bits; bind the result to a
    /// `const` so a bad literal fails the build instead.
    pub const fn from_octets(octets: [u8; 4], prefix: u8) -> Self {
        assert!(prefix <= 32, "prefix length out of range");
        let bits = (octets[0] as u32) << 24
            | (octets[1] as u32) << 16
            | (octets[2] as u32) << 8
            | octets[3] as u32;
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        assert!(bits & !mask == 0, "host bits set");
        Self {
            network: Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]),
            prefix,
        }
    }

    /// Block containing exactly one address
    pub fn host(addr: Ipv4Addr) -> Self {
        Self {
            network: addr,
            prefix: 32,
        }
    }

    /// Network address
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    /// Whether `addr` falls inside this block
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & self.mask() == u32::from(self.network)
    }

    /// Whether `other` lies entirely inside this block
    pub fn contains_cidr(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && self.contains(other.network)
    }

    /// Whether the two blocks share any address
    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.contains_cidr(other) || other.contains_cidr(self)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::network(format!("'{}' is not in a.b.c.d/n form", s)))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|e| Error::network(format!("invalid address in '{}': {}", s, e)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| Error::network(format!("invalid prefix in '{}': {}", s, e)))?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(value: Ipv4Cidr) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

// =============================================================================
// Subnets
// =============================================================================

/// Role a subnet plays in the topology
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub enum SubnetRole {
    /// Routable from the internet (load balancers)
    Public,
    /// Outbound-only via NAT (services, instances)
    Private,
    /// No route outside the network (databases)
    Isolated,
}

impl fmt::Display for SubnetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Private => write!(f, "private"),
            Self::Isolated => write!(f, "isolated"),
        }
    }
}

/// A subnet declared by the network stack
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubnetHandle {
    /// Subnet resource
    pub id: ResourceId,
    /// Address block
    pub cidr: Ipv4Cidr,
    /// Role
    pub role: SubnetRole,
    /// Availability zone
    pub availability_zone: String,
    /// Tags
    pub tags: BTreeMap<String, String>,
}

/// How a consumer picks subnets out of a network
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubnetSelection {
    /// The subnets containing each of these addresses
    ContainsAddresses(Vec<Ipv4Addr>),
    /// Every subnet with this role
    Role(SubnetRole),
    /// Every subnet carrying this tag
    Tagged {
        /// Tag key
        key: String,
        /// Tag value
        value: String,
    },
}

/// The virtual network and its subnets
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkHandle {
    /// Network resource
    pub id: ResourceId,
    /// Address space
    pub cidr: Ipv4Cidr,
    /// Subnets, all inside `cidr`
    pub subnets: Vec<SubnetHandle>,
}

impl NetworkHandle {
    /// Select subnets from this network
    ///
    /// Containment selection returns one subnet per address in the order
    /// given, without duplicates. An address outside every subnet, or a
    /// selection that matches nothing, is an error.
    pub fn select_subnets(&self, selection: &SubnetSelection) -> Result<Vec<&SubnetHandle>> {
        let selected: Vec<&SubnetHandle> = match selection {
            SubnetSelection::ContainsAddresses(addresses) => {
                let mut picked: Vec<&SubnetHandle> = Vec::new();
                for addr in addresses {
                    let subnet = self
                        .subnets
                        .iter()
                        .find(|s| s.cidr.contains(*addr))
                        .ok_or_else(|| {
                            Error::network(format!("no subnet in {} contains {}", self.id, addr))
                        })?;
                    if !picked.iter().any(|p| p.id == subnet.id) {
                        picked.push(subnet);
                    }
                }
                picked
            }
            SubnetSelection::Role(role) => {
                self.subnets.iter().filter(|s| s.role == *role).collect()
            }
            SubnetSelection::Tagged { key, value } => self
                .subnets
                .iter()
                .filter(|s| s.tags.get(key) == Some(value))
                .collect(),
        };

        if selected.is_empty() {
            return Err(Error::network(format!(
                "subnet selection {:?} matched nothing in {}",
                selection, self.id
            )));
        }
        Ok(selected)
    }

    /// Ids of the selected subnets
    pub fn subnet_ids(&self, selection: &SubnetSelection) -> Result<Vec<ResourceId>> {
        Ok(self
            .select_subnets(selection)?
            .into_iter()
            .map(|s| s.id.clone())
            .collect())
    }
}
