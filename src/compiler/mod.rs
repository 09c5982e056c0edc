//! Deployment compiler
//!
//! Instantiates every stack once per deployment unit, in dependency order:
//!
//! ```text
//! network ──► foundation ──► data ──► application
//!    │                         │
//!    └─────────────────────────┴──► tester   (experimental targets only)
//! ```
//!
//! Handles flow forward through typed inputs. Values owned outside the
//! deployment are resolved through the parameter store and land in their own
//! pseudo-stack. The merged result is validated as a batch before it is
//! returned, so a [`Deployment`] is always complete and consistent.
//!
//! # Usage
//!
//! ```text
//! let store = ParameterStore::new(config.parameters.clone());
//! let deployment = DeploymentCompiler::new(&config, &store).compile()?;
//! let waves = deployment.apply_waves()?;
//! ```

use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use stackwire_common::grant::GrantSet;
use stackwire_common::graph::DependencyGraph;
use stackwire_common::handle::ResourceId;
use stackwire_common::policy::{NetworkPolicy, NetworkRule};
use stackwire_common::resource::{Resource, ResourceKind, ResourceSpec};
use stackwire_common::stack::Stack;
use stackwire_common::{Error, Result};

use crate::config::{ArtifactSource, DeploymentConfig};
use crate::parameters::{ParameterLookup, ParameterResolver};
use crate::stacks::{
    ApplicationInputs, ApplicationOutputs, ApplicationStack, Artifact, DataInputs, DataStack,
    FoundationStack, HarnessAllowlist, NetworkStack, ServiceSettings, TesterInputs, TesterStack,
};
use crate::validation;

/// A composed, validated deployment unit
#[derive(Clone, Debug)]
pub struct Deployment {
    name: String,
    environment: String,
    stacks: Vec<Stack>,
    graph: DependencyGraph,
    application: ApplicationOutputs,
    harness: Option<HarnessAllowlist>,
    parameters: Vec<String>,
}

impl Deployment {
    /// Merge stacks into one deployment, in construction order
    ///
    /// Stack names must be unique. No validation runs here.
    pub fn assemble(
        name: impl Into<String>,
        environment: impl Into<String>,
        stacks: Vec<Stack>,
        application: ApplicationOutputs,
        harness: Option<HarnessAllowlist>,
    ) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for stack in &stacks {
            if !seen.insert(stack.name()) {
                return Err(Error::duplicate(stack.name()));
            }
        }
        let graph = DependencyGraph::from_resources(stacks.iter().flat_map(|s| s.resources()));
        let parameters = stacks
            .iter()
            .flat_map(|s| s.resources())
            .filter_map(|r| match &r.spec {
                ResourceSpec::Imported { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        Ok(Self {
            name: name.into(),
            environment: environment.into(),
            stacks,
            graph,
            application,
            harness,
            parameters,
        })
    }

    /// Deployment name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target environment
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Stacks in construction order
    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    /// Look up a stack by name
    pub fn stack(&self, name: &str) -> Option<&Stack> {
        self.stacks.iter().find(|s| s.name() == name)
    }

    /// Every resource across every stack
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.stacks.iter().flat_map(|s| s.resources())
    }

    /// Look up a resource anywhere in the deployment
    pub fn resource(&self, id: &ResourceId) -> Option<&Resource> {
        self.stack(id.stack()).and_then(|s| s.resource(id))
    }

    /// Number of resources of one kind across every stack
    pub fn count(&self, kind: ResourceKind) -> usize {
        self.stacks.iter().map(|s| s.count(kind)).sum()
    }

    /// Every grant, merged
    pub fn grants(&self) -> GrantSet {
        self.stacks.iter().flat_map(|s| s.grants().iter().cloned()).collect()
    }

    /// Every network rule, merged
    pub fn rules(&self) -> BTreeSet<NetworkRule> {
        self.stacks
            .iter()
            .flat_map(|s| s.rules().iter().cloned())
            .collect()
    }

    /// Default-deny policy over every declared boundary and rule
    pub fn policy(&self) -> NetworkPolicy {
        let mut policy = NetworkPolicy::new();
        for resource in self.resources() {
            if let ResourceSpec::SecurityBoundary {
                allow_all_outbound, ..
            } = &resource.spec
            {
                policy.add_boundary(resource.id.clone(), *allow_all_outbound);
            }
        }
        for rule in self.rules() {
            policy.allow(rule);
        }
        policy
    }

    /// Merged dependency graph
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Layered apply order; resources within a wave are independent
    pub fn apply_waves(&self) -> Result<Vec<Vec<ResourceId>>> {
        self.graph.apply_waves()
    }

    /// Application stack handles
    pub fn application(&self) -> &ApplicationOutputs {
        &self.application
    }

    /// Harness allowlist, when the harness was composed
    pub fn harness(&self) -> Option<&HarnessAllowlist> {
        self.harness.as_ref()
    }

    /// Logical names resolved through the parameter store
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    /// Resource count per stack
    pub fn summary(&self) -> BTreeMap<&str, usize> {
        self.stacks
            .iter()
            .map(|s| (s.name(), s.resource_count()))
            .collect()
    }
}

/// Composes a deployment unit from its configuration
pub struct DeploymentCompiler<'a> {
    config: &'a DeploymentConfig,
    parameters: &'a dyn ParameterLookup,
}

impl<'a> DeploymentCompiler<'a> {
    /// Create a compiler over a configuration and a parameter lookup
    pub fn new(config: &'a DeploymentConfig, parameters: &'a dyn ParameterLookup) -> Self {
        Self { config, parameters }
    }

    /// Compose and validate every stack
    ///
    /// Any failure aborts the whole composition; nothing partial is returned.
    pub fn compile(&self) -> Result<Deployment> {
        let config = self.config;
        config.validate()?;
        let resolver = ParameterResolver::new(self.parameters);

        let network = NetworkStack::compile(&config.stack_name("network"), &config.network)?;
        let foundation = FoundationStack::compile(
            &config.stack_name("foundation"),
            &config.name,
            &config.foundation,
        )?;
        let data_name = config.stack_name("data");
        let data = DataStack::compile(&DataInputs {
            name: &data_name,
            deployment: &config.name,
            network: &network.network,
            key: &foundation.key,
            config: &config.database,
        })?;

        let app = &config.application;
        let key = match &app.key_parameter {
            Some(name) => resolver.key_handle(name)?,
            None => foundation.key.clone(),
        };
        let secret = match &app.secret_parameter {
            Some(name) => resolver.secret_ref(name)?,
            None => data.database.credentials.clone(),
        };
        let artifact = match &app.artifact {
            ArtifactSource::Repository { parameter, tag } => Artifact::Repository {
                repository: resolver.repository(parameter)?,
                tag: tag.clone(),
            },
            ArtifactSource::BuildContext { directory, target } => Artifact::BuildContext {
                directory: directory.clone(),
                target: target.clone(),
            },
        };

        let inputs = ApplicationInputs::builder()
            .name(config.stack_name("app"))
            .service_name(&app.service_name)
            .network(network.network.clone())
            .artifact(artifact)
            .database(data.database.clone())
            .key(key)
            .secret(secret)
            .settings(ServiceSettings::from(app))
            .build()?;
        let application = ApplicationStack::compile(&inputs)?;

        let tester = if config.target.experimental {
            let tester_name = config.stack_name("tester");
            Some(TesterStack::compile(&TesterInputs {
                name: &tester_name,
                network: &network.network,
                database: &data.database,
                config: &config.harness,
            })?)
        } else {
            info!(
                environment = %config.target.environment,
                "target is not experimental, test harness excluded"
            );
            None
        };

        let mut stacks = Vec::with_capacity(6);
        if resolver.resolved_count() > 0 {
            stacks.push(resolver.into_stack()?);
        }
        stacks.extend([network.stack, foundation.stack, data.stack, application.stack]);
        let harness = tester.map(|tester| {
            stacks.push(tester.stack);
            tester.allowlist
        });

        let deployment = Deployment::assemble(
            &config.name,
            &config.target.environment,
            stacks,
            application.outputs,
            harness,
        )?;
        validation::validate(&deployment)?;

        info!(
            deployment = %deployment.name(),
            stacks = deployment.stacks().len(),
            resources = deployment.graph().node_count(),
            edges = deployment.graph().edge_count(),
            "deployment compiled"
        );
        Ok(deployment)
    }
}
