//! Parameter store lookup
//!
//! Values owned outside this deployment (a shared key, a pre-built image
//! repository) are referenced by logical name. The resolver memoizes every
//! name it resolves and turns the set into a pseudo-stack of imported
//! resources, so each borrowed value still traces back to an output.

use std::collections::BTreeMap;

use dashmap::DashMap;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use stackwire_common::handle::{KeyHandle, RepositoryHandle, ResourceId, SecretRef};
use stackwire_common::resource::{ResourceKind, ResourceSpec};
use stackwire_common::stack::Stack;
use stackwire_common::{Error, Result, PARAMETERS_STACK};

/// A resolved parameter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Parameter {
    /// Logical name
    pub name: String,
    /// Resolved value, e.g. an ARN or a repository name
    pub value: String,
}

/// Trait for resolving logical names, enabling mocking in tests
#[cfg_attr(test, automock)]
pub trait ParameterLookup: Send + Sync {
    /// Resolve a logical name; unknown names are an error
    fn lookup(&self, name: &str) -> Result<Parameter>;
}

/// In-memory parameter store seeded from configuration
#[derive(Clone, Debug, Default)]
pub struct ParameterStore {
    values: BTreeMap<String, String>,
}

impl ParameterStore {
    /// Create a store from name/value pairs
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    /// Register or replace a value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }
}

impl ParameterLookup for ParameterStore {
    fn lookup(&self, name: &str) -> Result<Parameter> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| Error::unresolved(name))?;
        Ok(Parameter {
            name: name.to_string(),
            value: value.clone(),
        })
    }
}

#[derive(Clone, Debug)]
struct Resolved {
    value: String,
    kind: ResourceKind,
}

/// Resolves logical names once and remembers what the deployment consumed
pub struct ParameterResolver<'a> {
    lookup: &'a dyn ParameterLookup,
    resolved: DashMap<String, Resolved>,
}

impl<'a> ParameterResolver<'a> {
    /// Wrap a lookup
    pub fn new(lookup: &'a dyn ParameterLookup) -> Self {
        Self {
            lookup,
            resolved: DashMap::new(),
        }
    }

    /// Id a resolved parameter gets in the parameters pseudo-stack
    pub fn resource_id(name: &str) -> ResourceId {
        ResourceId::new(PARAMETERS_STACK, name)
    }

    fn resolve(&self, name: &str, kind: ResourceKind) -> Result<(ResourceId, String)> {
        if let Some(existing) = self.resolved.get(name) {
            if existing.kind != kind {
                return Err(Error::validation(format!(
                    "parameter {} resolved as {} and {}",
                    name, existing.kind, kind
                )));
            }
            return Ok((Self::resource_id(name), existing.value.clone()));
        }

        let parameter = self.lookup.lookup(name)?;
        debug!(parameter = %name, kind = %kind, "resolved parameter");
        self.resolved.insert(
            name.to_string(),
            Resolved {
                value: parameter.value.clone(),
                kind,
            },
        );
        Ok((Self::resource_id(name), parameter.value))
    }

    /// Resolve an encryption key
    pub fn key_handle(&self, name: &str) -> Result<KeyHandle> {
        let (id, _) = self.resolve(name, ResourceKind::Key)?;
        Ok(KeyHandle { id })
    }

    /// Resolve a secret; its value is the secret's name in the store
    ///
    /// The protecting key of an imported secret is not known here, so none
    /// is attached.
    pub fn secret_ref(&self, name: &str) -> Result<SecretRef> {
        let (id, value) = self.resolve(name, ResourceKind::Secret)?;
        Ok(SecretRef {
            id,
            name: value,
            encryption_key: None,
        })
    }

    /// Resolve an image repository; its value is the repository name
    pub fn repository(&self, name: &str) -> Result<RepositoryHandle> {
        let (id, value) = self.resolve(name, ResourceKind::Repository)?;
        Ok(RepositoryHandle { id, name: value })
    }

    /// Number of distinct names resolved so far
    pub fn resolved_count(&self) -> usize {
        self.resolved.len()
    }

    /// Declare every resolved parameter as an exported import
    pub fn into_stack(self) -> Result<Stack> {
        let mut entries: Vec<(String, Resolved)> = self.resolved.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut stack = Stack::new(PARAMETERS_STACK);
        for (name, resolved) in entries {
            let id = stack.declare(
                &name,
                ResourceSpec::Imported {
                    name: name.clone(),
                    value: resolved.value,
                    kind: resolved.kind,
                },
            )?;
            stack.export(&id)?;
        }
        info!(count = stack.resource_count(), "parameters resolved");
        Ok(stack)
    }
}
