//! Least-privilege grants
//!
//! Grants are collected as a declarative set of `(principal, resource, action)`
//! tuples instead of being emitted as side effects during construction. The
//! set is additive: inserting the same tuple twice is a no-op, and no grant
//! implies anything beyond its own action.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::handle::{IdentityHandle, KeyHandle, ResourceId};

/// Action an identity is allowed to perform on a resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GrantAction {
    /// Pull images from a repository
    Pull,
    /// Decrypt with a key
    Decrypt,
    /// Read a secret value
    Read,
}

impl fmt::Display for GrantAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pull => write!(f, "pull"),
            Self::Decrypt => write!(f, "decrypt"),
            Self::Read => write!(f, "read"),
        }
    }
}

/// A directed permission from a principal to a resource
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    /// Identity receiving the permission
    pub principal: ResourceId,
    /// Resource the permission applies to
    pub resource: ResourceId,
    /// Permitted action
    pub action: GrantAction,
}

impl Grant {
    /// Create a grant
    pub fn new(principal: ResourceId, resource: ResourceId, action: GrantAction) -> Self {
        Self {
            principal,
            resource,
            action,
        }
    }
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} may {} {}", self.principal, self.action, self.resource)
    }
}

/// A resource handle that an identity can be granted access to
pub trait Grantable {
    /// Resource the grant targets
    fn resource_id(&self) -> &ResourceId;

    /// The single action a consumer needs on this resource
    fn action(&self) -> GrantAction;

    /// Key protecting this resource, if any
    fn protected_by(&self) -> Option<&KeyHandle> {
        None
    }

    /// Build the grant for `principal`
    fn grant_to(&self, principal: &IdentityHandle) -> Grant {
        Grant::new(
            principal.id.clone(),
            self.resource_id().clone(),
            self.action(),
        )
    }
}

/// Ordered, deduplicated set of grants
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantSet(BTreeSet<Grant>);

impl GrantSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a grant, returning false if it was already present
    pub fn insert(&mut self, grant: Grant) -> bool {
        self.0.insert(grant)
    }

    /// Merge another set into this one
    pub fn extend(&mut self, other: GrantSet) {
        self.0.extend(other.0);
    }

    /// Iterate grants in order
    pub fn iter(&self) -> impl Iterator<Item = &Grant> {
        self.0.iter()
    }

    /// Grants held by one principal
    pub fn for_principal<'a>(&'a self, principal: &'a ResourceId) -> impl Iterator<Item = &'a Grant> {
        self.0.iter().filter(move |g| &g.principal == principal)
    }

    /// Distinct actions held by one principal
    pub fn actions_for(&self, principal: &ResourceId) -> BTreeSet<GrantAction> {
        self.for_principal(principal).map(|g| g.action).collect()
    }

    /// Distinct principals holding at least one grant
    pub fn principals(&self) -> BTreeSet<&ResourceId> {
        self.0.iter().map(|g| &g.principal).collect()
    }

    /// Whether the exact tuple is present
    pub fn contains(&self, grant: &Grant) -> bool {
        self.0.contains(grant)
    }

    /// Number of grants
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Grant> for GrantSet {
    fn from_iter<I: IntoIterator<Item = Grant>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Derives the grants an identity needs from the resources it consumes
///
/// Every consumed resource yields exactly the grant its kind requires, and a
/// resource protected by a key additionally yields decrypt on that key. The
/// rule is applied uniformly; callers only say what the identity consumes.
#[derive(Debug)]
pub struct GrantPlanner {
    principal: IdentityHandle,
    grants: GrantSet,
}

impl GrantPlanner {
    /// Start planning grants for an identity
    pub fn for_identity(principal: &IdentityHandle) -> Self {
        Self {
            principal: principal.clone(),
            grants: GrantSet::new(),
        }
    }

    /// Record that the identity consumes `resource`
    pub fn consume<G: Grantable + ?Sized>(&mut self, resource: &G) -> &mut Self {
        self.grants.insert(resource.grant_to(&self.principal));
        if let Some(key) = resource.protected_by() {
            self.grants.insert(key.grant_to(&self.principal));
        }
        self
    }

    /// Finish planning and return the grants
    pub fn finish(self) -> GrantSet {
        self.grants
    }
}
