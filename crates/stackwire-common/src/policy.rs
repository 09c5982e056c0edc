//! Network rules between security boundaries and CIDR peers
//!
//! Rules are directed `(from, to, port)` tuples collected into a declarative
//! set. Evaluation is default-deny: traffic flows only when the source side
//! permits egress and the destination side permits ingress.
//!
//! A rule between two boundaries becomes an egress rule on the source and an
//! ingress rule on the destination when the provisioning engine renders it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::handle::ResourceId;
use crate::network::Ipv4Cidr;

/// Transport protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Protocol plus an inclusive port range
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    /// Protocol
    pub protocol: Protocol,
    /// First port
    pub from: u16,
    /// Last port, inclusive
    pub to: u16,
}

impl Port {
    /// A single TCP port
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            from: port,
            to: port,
        }
    }

    /// An inclusive TCP range
    pub fn tcp_range(from: u16, to: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            from: from.min(to),
            to: from.max(to),
        }
    }

    /// Every TCP port
    pub fn all_tcp() -> Self {
        Self::tcp_range(0, u16::MAX)
    }

    /// Whether this range covers `port` over `protocol`
    pub fn contains(&self, protocol: Protocol, port: u16) -> bool {
        self.protocol == protocol && (self.from..=self.to).contains(&port)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from == self.to {
            write!(f, "{}/{}", self.protocol, self.from)
        } else {
            write!(f, "{}/{}-{}", self.protocol, self.from, self.to)
        }
    }
}

/// One side of a network rule
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Endpoint {
    /// Members of a security boundary
    Boundary(ResourceId),
    /// An address block outside any boundary
    Cidr(Ipv4Cidr),
}

impl Endpoint {
    /// The whole IPv4 internet
    pub fn any_ipv4() -> Self {
        Self::Cidr(Ipv4Cidr::ANY)
    }

    /// Whether traffic at `actual` is covered when a rule names `self`
    fn covers(&self, actual: &Endpoint) -> bool {
        match (self, actual) {
            (Self::Boundary(rule), Self::Boundary(actual)) => rule == actual,
            (Self::Cidr(rule), Self::Cidr(actual)) => rule.contains_cidr(actual),
            _ => false,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boundary(id) => write!(f, "{}", id),
            Self::Cidr(cidr) => write!(f, "{}", cidr),
        }
    }
}

/// A directed, port-scoped permission
///
/// At least one side is always a boundary; the constructors guarantee it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRule {
    /// Traffic source
    pub from: Endpoint,
    /// Traffic destination
    pub to: Endpoint,
    /// Destination port range
    pub port: Port,
    /// Human readable reason
    pub description: String,
}

impl NetworkRule {
    /// Permit `peer` into `boundary`
    pub fn ingress(
        boundary: &ResourceId,
        peer: Ipv4Cidr,
        port: Port,
        description: impl Into<String>,
    ) -> Self {
        Self {
            from: Endpoint::Cidr(peer),
            to: Endpoint::Boundary(boundary.clone()),
            port,
            description: description.into(),
        }
    }

    /// Permit `boundary` out to `peer`
    pub fn egress(
        boundary: &ResourceId,
        peer: Ipv4Cidr,
        port: Port,
        description: impl Into<String>,
    ) -> Self {
        Self {
            from: Endpoint::Boundary(boundary.clone()),
            to: Endpoint::Cidr(peer),
            port,
            description: description.into(),
        }
    }

    /// Permit one boundary to reach another
    pub fn between(
        from: &ResourceId,
        to: &ResourceId,
        port: Port,
        description: impl Into<String>,
    ) -> Self {
        Self {
            from: Endpoint::Boundary(from.clone()),
            to: Endpoint::Boundary(to.clone()),
            port,
            description: description.into(),
        }
    }

    /// Whether this rule admits traffic into `boundary`
    pub fn is_ingress_on(&self, boundary: &ResourceId) -> bool {
        matches!(&self.to, Endpoint::Boundary(b) if b == boundary)
    }

    /// Whether this rule lets traffic leave `boundary`
    pub fn is_egress_on(&self, boundary: &ResourceId) -> bool {
        matches!(&self.from, Endpoint::Boundary(b) if b == boundary)
    }

    /// Boundaries named by this rule
    pub fn boundaries(&self) -> impl Iterator<Item = &ResourceId> {
        [&self.from, &self.to].into_iter().filter_map(|e| match e {
            Endpoint::Boundary(id) => Some(id),
            Endpoint::Cidr(_) => None,
        })
    }
}

impl fmt::Display for NetworkRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} on {}", self.from, self.to, self.port)
    }
}

/// Evaluates a rule set against the boundaries it applies to
///
/// Unknown boundaries deny everything. A boundary only permits egress beyond
/// its rules when it was registered with `allow_all_outbound`.
#[derive(Clone, Debug, Default)]
pub struct NetworkPolicy {
    boundaries: BTreeMap<ResourceId, bool>,
    rules: BTreeSet<NetworkRule>,
}

impl NetworkPolicy {
    /// Create an empty policy that denies everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a boundary
    pub fn add_boundary(&mut self, id: ResourceId, allow_all_outbound: bool) {
        self.boundaries.insert(id, allow_all_outbound);
    }

    /// Add a rule
    pub fn allow(&mut self, rule: NetworkRule) {
        self.rules.insert(rule);
    }

    /// Whether `allow_all_outbound` is set on a registered boundary
    pub fn allows_all_outbound(&self, boundary: &ResourceId) -> Option<bool> {
        self.boundaries.get(boundary).copied()
    }

    /// Rules that admit traffic into or out of a boundary
    pub fn rules_on<'a>(&'a self, boundary: &'a ResourceId) -> impl Iterator<Item = &'a NetworkRule> {
        self.rules
            .iter()
            .filter(move |r| r.is_ingress_on(boundary) || r.is_egress_on(boundary))
    }

    /// Whether traffic from `from` to `to` on `protocol/port` is permitted
    pub fn permits(&self, from: &Endpoint, to: &Endpoint, protocol: Protocol, port: u16) -> bool {
        let egress_ok = match from {
            Endpoint::Boundary(source) => match self.boundaries.get(source) {
                None => false,
                Some(true) => true,
                Some(false) => self.rules.iter().any(|r| {
                    r.is_egress_on(source) && r.to.covers(to) && r.port.contains(protocol, port)
                }),
            },
            Endpoint::Cidr(_) => true,
        };

        let ingress_ok = match to {
            Endpoint::Boundary(target) => {
                self.boundaries.contains_key(target)
                    && self.rules.iter().any(|r| {
                        r.is_ingress_on(target)
                            && r.from.covers(from)
                            && r.port.contains(protocol, port)
                    })
            }
            Endpoint::Cidr(_) => true,
        };

        egress_ok && ingress_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ResourceId {
        ResourceId::new("t", name)
    }

    fn cidr(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    // =========================================================================
    // Story: Default Deny
    // =========================================================================

    #[test]
    fn story_empty_policy_denies_everything() {
        let mut policy = NetworkPolicy::new();
        policy.add_boundary(id("a"), false);
        policy.add_boundary(id("b"), true);

        let a = Endpoint::Boundary(id("a"));
        let b = Endpoint::Boundary(id("b"));
        assert!(!policy.permits(&a, &b, Protocol::Tcp, 80));
        assert!(!policy.permits(&b, &a, Protocol::Tcp, 80));
    }

    #[test]
    fn story_unregistered_boundary_denies() {
        let mut policy = NetworkPolicy::new();
        policy.allow(NetworkRule::between(&id("a"), &id("b"), Port::tcp(80), "x"));
        let a = Endpoint::Boundary(id("a"));
        let b = Endpoint::Boundary(id("b"));
        assert!(!policy.permits(&a, &b, Protocol::Tcp, 80));
    }

    // =========================================================================
    // Story: Both Sides Must Agree
    // =========================================================================

    #[test]
    fn story_boundary_to_boundary_needs_ingress_at_destination() {
        let mut policy = NetworkPolicy::new();
        policy.add_boundary(id("lb"), true);
        policy.add_boundary(id("svc"), true);
        policy.allow(NetworkRule::between(&id("lb"), &id("svc"), Port::tcp(8081), "probe"));

        let lb = Endpoint::Boundary(id("lb"));
        let svc = Endpoint::Boundary(id("svc"));
        assert!(policy.permits(&lb, &svc, Protocol::Tcp, 8081));
        assert!(!policy.permits(&lb, &svc, Protocol::Tcp, 8080));
        assert!(!policy.permits(&svc, &lb, Protocol::Tcp, 8081));
        assert!(!policy.permits(&lb, &svc, Protocol::Udp, 8081));
    }

    #[test]
    fn story_restricted_egress_needs_explicit_rule() {
        let mut policy = NetworkPolicy::new();
        policy.add_boundary(id("box"), false);
        policy.allow(NetworkRule::egress(
            &id("box"),
            cidr("100.64.0.0/19"),
            Port::all_tcp(),
            "inside",
        ));

        let source = Endpoint::Boundary(id("box"));
        assert!(policy.permits(&source, &Endpoint::Cidr(cidr("100.64.3.0/24")), Protocol::Tcp, 443));
        assert!(!policy.permits(&source, &Endpoint::Cidr(cidr("8.8.8.8/32")), Protocol::Tcp, 443));
        assert!(!policy.permits(&source, &Endpoint::any_ipv4(), Protocol::Tcp, 443));
    }

    #[test]
    fn story_cidr_ingress_covers_only_contained_blocks() {
        let mut policy = NetworkPolicy::new();
        policy.add_boundary(id("box"), false);
        policy.allow(NetworkRule::ingress(
            &id("box"),
            cidr("10.105.112.0/21"),
            Port::tcp(22),
            "ssh",
        ));

        let target = Endpoint::Boundary(id("box"));
        assert!(policy.permits(&Endpoint::Cidr(cidr("10.105.112.0/21")), &target, Protocol::Tcp, 22));
        assert!(policy.permits(&Endpoint::Cidr(cidr("10.105.113.4/32")), &target, Protocol::Tcp, 22));
        assert!(!policy.permits(&Endpoint::Cidr(cidr("10.105.0.0/16")), &target, Protocol::Tcp, 22));
        assert!(!policy.permits(&Endpoint::Cidr(cidr("192.168.0.0/16")), &target, Protocol::Tcp, 22));
    }

    #[test]
    fn port_display_and_ranges() {
        assert_eq!(Port::tcp(22).to_string(), "tcp/22");
        assert_eq!(Port::all_tcp().to_string(), "tcp/0-65535");
        assert_eq!(Port::tcp_range(90, 80), Port::tcp_range(80, 90));
        assert!(Port::all_tcp().contains(Protocol::Tcp, 5432));
        assert!(!Port::all_tcp().contains(Protocol::Udp, 5432));
    }

    #[test]
    fn rule_reports_its_boundaries() {
        let rule = NetworkRule::ingress(&id("box"), Ipv4Cidr::ANY, Port::tcp(80), "web");
        assert_eq!(rule.boundaries().collect::<Vec<_>>(), vec![&id("box")]);
        assert!(rule.is_ingress_on(&id("box")));
        assert!(!rule.is_egress_on(&id("box")));
        assert_eq!(rule.to_string(), "0.0.0.0/0 -> t/box on tcp/80");
    }
}
