//! Declarative manifest handed to the provisioning engine
//!
//! The manifest lists each stack's resources with their dependencies and edge
//! kinds, the grants and network rules it declares, the parameters the
//! deployment resolved, and the apply waves. Everything is ordered, so
//! rendering the same deployment twice yields identical bytes.

use serde::Serialize;

use stackwire_common::grant::Grant;
use stackwire_common::graph::EdgeKind;
use stackwire_common::handle::ResourceId;
use stackwire_common::policy::NetworkRule;
use stackwire_common::resource::Resource;
use stackwire_common::{Error, Result};

use crate::compiler::Deployment;

/// Output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    /// Pretty-printed JSON
    #[default]
    Json,
    /// YAML
    Yaml,
}

/// The whole deployment as the engine sees it
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Deployment name
    pub deployment: String,
    /// Target environment
    pub environment: String,
    /// Logical names resolved through the parameter store
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,
    /// Stacks in construction order
    pub stacks: Vec<StackManifest>,
    /// Layered apply order
    pub apply_waves: Vec<Vec<ResourceId>>,
}

/// One stack
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackManifest {
    /// Stack name
    pub name: String,
    /// Foreign resources this stack borrows
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<ResourceId>,
    /// Resources other stacks may borrow
    pub outputs: Vec<ResourceId>,
    /// Declarations
    pub resources: Vec<ResourceManifest>,
    /// Grants
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub grants: Vec<Grant>,
    /// Network rules
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub network_rules: Vec<NetworkRule>,
}

/// A resource with its resolved dependencies
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceManifest {
    /// The declaration
    #[serde(flatten)]
    pub resource: Resource,
    /// Producers this resource waits for
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependencyManifest>,
}

/// One dependency
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyManifest {
    /// Producer
    pub id: ResourceId,
    /// Implicit or explicit
    pub kind: EdgeKind,
}

impl Manifest {
    /// Build the manifest of a validated deployment
    pub fn from_deployment(deployment: &Deployment) -> Result<Self> {
        let graph = deployment.graph();
        let stacks = deployment
            .stacks()
            .iter()
            .map(|stack| StackManifest {
                name: stack.name().to_string(),
                imports: stack.imports().into_iter().collect(),
                outputs: stack.outputs().iter().cloned().collect(),
                resources: stack
                    .resources()
                    .map(|resource| ResourceManifest {
                        depends_on: graph
                            .dependencies(&resource.id)
                            .into_iter()
                            .map(|edge| DependencyManifest {
                                id: edge.producer,
                                kind: edge.kind,
                            })
                            .collect(),
                        resource: resource.clone(),
                    })
                    .collect(),
                grants: stack.grants().iter().cloned().collect(),
                network_rules: stack.rules().iter().cloned().collect(),
            })
            .collect();

        Ok(Self {
            deployment: deployment.name().to_string(),
            environment: deployment.environment().to_string(),
            parameters: deployment.parameters().to_vec(),
            stacks,
            apply_waves: deployment.apply_waves()?,
        })
    }

    /// Render as JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::serialization(format!("failed to render manifest: {}", e)))
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::serialization(format!("failed to render manifest: {}", e)))
    }

    /// Render in the requested format
    pub fn render(&self, format: Format) -> Result<String> {
        match format {
            Format::Json => self.to_json(),
            Format::Yaml => self.to_yaml(),
        }
    }

    /// Total resources across every stack
    pub fn resource_count(&self) -> usize {
        self.stacks.iter().map(|s| s.resources.len()).sum()
    }
}
