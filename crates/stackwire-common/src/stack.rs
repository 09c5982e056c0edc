//! Stacks: named units of declared infrastructure
//!
//! A stack owns the resources it declares and exports the subset other
//! stacks may borrow. Grants and network rules are collected here as data
//! and validated later as a batch.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::grant::{Grant, GrantSet};
use crate::handle::ResourceId;
use crate::policy::NetworkRule;
use crate::resource::{RemovalPolicy, Resource, ResourceKind, ResourceSpec};
use crate::{Error, Result};

/// A named unit of infrastructure with declared inputs and outputs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stack {
    name: String,
    resources: BTreeMap<ResourceId, Resource>,
    outputs: BTreeSet<ResourceId>,
    grants: GrantSet,
    rules: BTreeSet<NetworkRule>,
}

impl Stack {
    /// Create an empty stack
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: BTreeMap::new(),
            outputs: BTreeSet::new(),
            grants: GrantSet::new(),
            rules: BTreeSet::new(),
        }
    }

    /// Stack name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id a logical id would have in this stack
    pub fn id(&self, logical_id: &str) -> ResourceId {
        ResourceId::new(&self.name, logical_id)
    }

    /// Declare a resource with its kind's default removal policy
    pub fn declare(&mut self, logical_id: &str, spec: ResourceSpec) -> Result<ResourceId> {
        let policy = spec.default_removal_policy();
        self.declare_with_policy(logical_id, spec, policy)
    }

    /// Declare a resource with an explicit removal policy
    pub fn declare_with_policy(
        &mut self,
        logical_id: &str,
        spec: ResourceSpec,
        removal_policy: RemovalPolicy,
    ) -> Result<ResourceId> {
        let id = self.id(logical_id);
        if self.resources.contains_key(&id) {
            return Err(Error::duplicate(id.as_str()));
        }
        debug!(resource = %id, kind = %spec.kind(), "declared resource");
        let mut resource = Resource::new(id.clone(), spec);
        resource.removal_policy = removal_policy;
        self.resources.insert(id.clone(), resource);
        Ok(id)
    }

    /// Declare an explicit ordering edge: `consumer` waits for `producer`
    ///
    /// Used where ordering matters but no data reference exists. The consumer
    /// must be declared by this stack; the producer may live anywhere.
    pub fn add_dependency(&mut self, consumer: &ResourceId, producer: &ResourceId) -> Result<()> {
        if consumer == producer {
            return Err(Error::validation(format!(
                "{} cannot depend on itself",
                consumer
            )));
        }
        let resource = self.resources.get_mut(consumer).ok_or_else(|| {
            Error::validation(format!(
                "explicit dependency consumer {} is not declared by stack {}",
                consumer, self.name
            ))
        })?;
        debug!(consumer = %consumer, producer = %producer, "explicit dependency");
        resource.explicit_dependencies.insert(producer.clone());
        Ok(())
    }

    /// Make a resource of this stack available to other stacks
    pub fn export(&mut self, id: &ResourceId) -> Result<()> {
        if !self.resources.contains_key(id) {
            return Err(Error::unresolved(id.as_str()));
        }
        self.outputs.insert(id.clone());
        Ok(())
    }

    /// Record a grant
    pub fn grant(&mut self, grant: Grant) {
        self.grants.insert(grant);
    }

    /// Record a batch of grants
    pub fn grant_all(&mut self, grants: GrantSet) {
        self.grants.extend(grants);
    }

    /// Record a network rule
    pub fn allow(&mut self, rule: NetworkRule) {
        self.rules.insert(rule);
    }

    /// Look up a resource declared by this stack
    pub fn resource(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources.get(id)
    }

    /// Resources in id order
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// Number of declared resources
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Number of declared resources of one kind
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.resources.values().filter(|r| r.kind() == kind).count()
    }

    /// Exported resource ids
    pub fn outputs(&self) -> &BTreeSet<ResourceId> {
        &self.outputs
    }

    /// Grants recorded by this stack
    pub fn grants(&self) -> &GrantSet {
        &self.grants
    }

    /// Network rules recorded by this stack
    pub fn rules(&self) -> &BTreeSet<NetworkRule> {
        &self.rules
    }

    /// Every foreign resource this stack borrows
    ///
    /// Collected from data references, explicit dependencies, grants and
    /// network rules. Each one must trace back to another stack's output.
    pub fn imports(&self) -> BTreeSet<ResourceId> {
        let mut imports = BTreeSet::new();
        for resource in self.resources.values() {
            imports.extend(resource.spec.references().into_iter().cloned());
            imports.extend(resource.explicit_dependencies.iter().cloned());
        }
        for grant in self.grants.iter() {
            imports.insert(grant.principal.clone());
            imports.insert(grant.resource.clone());
        }
        for rule in &self.rules {
            imports.extend(rule.boundaries().cloned());
        }
        imports.retain(|id| id.stack() != self.name);
        imports
    }
}
