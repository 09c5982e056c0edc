//! Resource identifiers and typed handles
//!
//! A handle is an opaque, cloneable reference to a resource declared by some
//! stack. The producing stack owns the declaration; consumers only ever hold a
//! copy of the handle and reference it from their own declarations.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::grant::{GrantAction, Grantable};
use crate::policy::{NetworkRule, Port};

/// Identifier of a declared resource: `<stack>/<logical id>`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Build an id from the owning stack and the logical id within it
    pub fn new(stack: &str, logical_id: &str) -> Self {
        Self(format!("{}/{}", stack, logical_id))
    }

    /// Full id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the stack that declares this resource
    pub fn stack(&self) -> &str {
        self.0.split_once('/').map(|(s, _)| s).unwrap_or(&self.0)
    }

    /// Logical id within the owning stack
    pub fn logical_id(&self) -> &str {
        self.0.split_once('/').map(|(_, l)| l).unwrap_or("")
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encryption key shared by logs, secrets and data at rest
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyHandle {
    /// Key resource
    pub id: ResourceId,
}

impl KeyHandle {
    /// Grant decrypt on this key to an identity
    pub fn grant_decrypt(&self, principal: &IdentityHandle) -> crate::grant::Grant {
        self.grant_to(principal)
    }
}

impl Grantable for KeyHandle {
    fn resource_id(&self) -> &ResourceId {
        &self.id
    }

    fn action(&self) -> GrantAction {
        GrantAction::Decrypt
    }
}

/// Secret read by a workload at startup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretRef {
    /// Secret resource
    pub id: ResourceId,
    /// Name of the secret in the secret store
    pub name: String,
    /// Key the secret is encrypted with, when customer managed
    pub encryption_key: Option<KeyHandle>,
}

impl SecretRef {
    /// Grant read on this secret to an identity
    pub fn grant_read(&self, principal: &IdentityHandle) -> crate::grant::Grant {
        self.grant_to(principal)
    }
}

impl Grantable for SecretRef {
    fn resource_id(&self) -> &ResourceId {
        &self.id
    }

    fn action(&self) -> GrantAction {
        GrantAction::Read
    }

    fn protected_by(&self) -> Option<&KeyHandle> {
        self.encryption_key.as_ref()
    }
}

/// Container image repository
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepositoryHandle {
    /// Repository resource
    pub id: ResourceId,
    /// Repository name, e.g. `apps/orders`
    pub name: String,
}

impl RepositoryHandle {
    /// Grant image pull on this repository to an identity
    pub fn grant_pull(&self, principal: &IdentityHandle) -> crate::grant::Grant {
        self.grant_to(principal)
    }
}

impl Grantable for RepositoryHandle {
    fn resource_id(&self) -> &ResourceId {
        &self.id
    }

    fn action(&self) -> GrantAction {
        GrantAction::Pull
    }
}

/// Identity (role) a workload runs as
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityHandle {
    /// Identity resource
    pub id: ResourceId,
}

/// Security boundary (security group) attached to network-addressable resources
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundaryHandle {
    /// Boundary resource
    pub id: ResourceId,
}

/// Container cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterHandle {
    /// Cluster resource
    pub id: ResourceId,
}

/// Relational database cluster with its reachability boundary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseHandle {
    /// Cluster resource
    pub cluster: ResourceId,
    /// Endpoint reference resolved by the provisioning engine
    pub endpoint: String,
    /// Default port the engine listens on
    pub port: u16,
    /// Boundary guarding the cluster
    pub boundary: BoundaryHandle,
    /// Credentials secret
    pub credentials: SecretRef,
}

impl DatabaseHandle {
    /// Permit `from` to reach the database on its default port
    ///
    /// The rule always points from the consumer into the database, never the
    /// reverse, and carries the port so consumers never hardcode it.
    pub fn allow_default_port_from(
        &self,
        from: &BoundaryHandle,
        description: impl Into<String>,
    ) -> NetworkRule {
        NetworkRule::between(&from.id, &self.boundary.id, Port::tcp(self.port), description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Endpoint;

    #[test]
    fn resource_id_splits_stack_and_logical_id() {
        let id = ResourceId::new("orders-app", "Cluster");
        assert_eq!(id.as_str(), "orders-app/Cluster");
        assert_eq!(id.stack(), "orders-app");
        assert_eq!(id.logical_id(), "Cluster");
        assert_eq!(id.to_string(), "orders-app/Cluster");
    }

    #[test]
    fn parameter_names_with_slashes_keep_the_stack_prefix() {
        let id = ResourceId::new("parameters", "/shared/kms-key-arn");
        assert_eq!(id.stack(), "parameters");
        assert_eq!(id.logical_id(), "/shared/kms-key-arn");
    }

    #[test]
    fn database_rule_points_into_the_database() {
        let db = DatabaseHandle {
            cluster: ResourceId::new("data", "Cluster"),
            endpoint: "${data/Cluster.endpoint}".into(),
            port: 5432,
            boundary: BoundaryHandle {
                id: ResourceId::new("data", "Boundary"),
            },
            credentials: SecretRef {
                id: ResourceId::new("data", "Credentials"),
                name: "data/credentials".into(),
                encryption_key: None,
            },
        };
        let service = BoundaryHandle {
            id: ResourceId::new("app", "ServiceBoundary"),
        };

        let rule = db.allow_default_port_from(&service, "service to database");
        assert_eq!(rule.from, Endpoint::Boundary(service.id.clone()));
        assert_eq!(rule.to, Endpoint::Boundary(db.boundary.id.clone()));
        assert_eq!(rule.port, Port::tcp(5432));
    }
}
