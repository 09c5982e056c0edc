//! Application stack: the composition root
//!
//! Borrows the network, key, secret and database handles and declares the
//! load-balanced container service around them. This is where ordering,
//! grants and network rules converge:
//!
//! - the optional seed upload is ordered before the service with an explicit
//!   edge, since nothing on the compute path references it
//! - grants to the task identity are derived from the resources it consumes
//! - the load balancer reaches the service on both the traffic port and the
//!   probe port, and the service reaches the database on its default port

use std::collections::BTreeMap;

use tracing::{debug, info};

use stackwire_common::grant::GrantPlanner;
use stackwire_common::handle::{
    BoundaryHandle, ClusterHandle, DatabaseHandle, IdentityHandle, KeyHandle, RepositoryHandle,
    ResourceId, SecretRef,
};
use stackwire_common::health::HealthCheck;
use stackwire_common::network::{Ipv4Cidr, NetworkHandle, SubnetRole, SubnetSelection};
use stackwire_common::policy::{NetworkRule, Port};
use stackwire_common::resource::{ContainerDefinition, ImageReference, ResourceSpec};
use stackwire_common::stack::Stack;
use stackwire_common::{Error, Result, DEFAULT_CONTAINER_PORT, DEFAULT_LISTENER_PORT};

use crate::config::ApplicationConfig;

/// Port outbound image pulls and service endpoints are reached on
const HTTPS_PORT: u16 = 443;

// =============================================================================
// Inputs
// =============================================================================

/// Where the service image comes from, resolved to handles
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Artifact {
    /// A tag in a repository owned elsewhere
    Repository {
        /// Repository handle
        repository: RepositoryHandle,
        /// Image tag
        tag: String,
    },
    /// A local build context pushed into a repository this stack declares
    BuildContext {
        /// Build context directory
        directory: String,
        /// Build target stage
        target: Option<String>,
    },
}

/// SQL bundle uploaded before the service starts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedBundle {
    /// Local directory holding the bundle
    pub source: String,
    /// Destination key prefix
    pub prefix: Option<String>,
}

/// Service sizing, ports and environment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceSettings {
    /// CPU units
    pub cpu: u32,
    /// Memory in MiB
    pub memory_mib: u32,
    /// Desired task count
    pub desired_count: u32,
    /// Port the container serves traffic on
    pub container_port: u16,
    /// Public listener port
    pub listener_port: u16,
    /// Liveness probe
    pub health_check: HealthCheck,
    /// Plain environment variables
    pub environment: BTreeMap<String, String>,
    /// Log retention in days
    pub log_retention_days: u32,
    /// Data seeding bundle
    pub seed: Option<SeedBundle>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            cpu: 512,
            memory_mib: 1024,
            desired_count: 1,
            container_port: DEFAULT_CONTAINER_PORT,
            listener_port: DEFAULT_LISTENER_PORT,
            health_check: HealthCheck::default(),
            environment: BTreeMap::new(),
            log_retention_days: 30,
            seed: None,
        }
    }
}

impl From<&ApplicationConfig> for ServiceSettings {
    fn from(config: &ApplicationConfig) -> Self {
        Self {
            cpu: config.cpu,
            memory_mib: config.memory_mib,
            desired_count: config.desired_count,
            container_port: config.container_port,
            listener_port: config.listener_port,
            health_check: config.health_check.clone(),
            environment: config.environment.clone(),
            log_retention_days: config.log_retention_days,
            seed: config.seed.as_ref().map(|seed| SeedBundle {
                source: seed.source.clone(),
                prefix: seed.prefix.clone(),
            }),
        }
    }
}

/// Everything the application stack borrows
#[derive(Clone, Debug)]
pub struct ApplicationInputs {
    /// Stack name
    pub name: String,
    /// Service name
    pub service_name: String,
    /// Network
    pub network: NetworkHandle,
    /// Image source
    pub artifact: Artifact,
    /// Database
    pub database: DatabaseHandle,
    /// Key encrypting logs
    pub key: KeyHandle,
    /// Secret injected at startup
    pub secret: SecretRef,
    /// Sizing, ports and environment
    pub settings: ServiceSettings,
}

impl ApplicationInputs {
    /// Start building inputs
    pub fn builder() -> ApplicationInputsBuilder {
        ApplicationInputsBuilder::default()
    }
}

/// Builder that refuses to finish while a borrowed handle is missing
#[derive(Clone, Debug, Default)]
pub struct ApplicationInputsBuilder {
    name: Option<String>,
    service_name: Option<String>,
    network: Option<NetworkHandle>,
    artifact: Option<Artifact>,
    database: Option<DatabaseHandle>,
    key: Option<KeyHandle>,
    secret: Option<SecretRef>,
    settings: ServiceSettings,
}

impl ApplicationInputsBuilder {
    /// Stack name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Service name
    pub fn service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    /// Network handle
    pub fn network(mut self, network: NetworkHandle) -> Self {
        self.network = Some(network);
        self
    }

    /// Image source
    pub fn artifact(mut self, artifact: Artifact) -> Self {
        self.artifact = Some(artifact);
        self
    }

    /// Database handle
    pub fn database(mut self, database: DatabaseHandle) -> Self {
        self.database = Some(database);
        self
    }

    /// Key handle
    pub fn key(mut self, key: KeyHandle) -> Self {
        self.key = Some(key);
        self
    }

    /// Secret reference
    pub fn secret(mut self, secret: SecretRef) -> Self {
        self.secret = Some(secret);
        self
    }

    /// Sizing, ports and environment
    pub fn settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Finish, naming the first missing input
    pub fn build(self) -> Result<ApplicationInputs> {
        let stack = self
            .name
            .clone()
            .unwrap_or_else(|| "application".to_string());
        let missing = |input: &str| Error::missing_handle(stack.clone(), input);

        Ok(ApplicationInputs {
            service_name: self.service_name.ok_or_else(|| missing("service name"))?,
            network: self.network.ok_or_else(|| missing("network"))?,
            artifact: self.artifact.ok_or_else(|| missing("artifact"))?,
            database: self.database.ok_or_else(|| missing("database"))?,
            key: self.key.ok_or_else(|| missing("key"))?,
            secret: self.secret.ok_or_else(|| missing("secret"))?,
            name: stack.clone(),
            settings: self.settings,
        })
    }
}

// =============================================================================
// Outputs
// =============================================================================

/// Handles the application stack produces
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationOutputs {
    /// Container cluster
    pub cluster: ClusterHandle,
    /// Service
    pub service: ResourceId,
    /// Task identity
    pub task_identity: IdentityHandle,
    /// Boundary attached to the service's tasks
    pub service_boundary: BoundaryHandle,
    /// Boundary attached to the load balancer
    pub load_balancer_boundary: BoundaryHandle,
    /// Load balancer
    pub load_balancer: ResourceId,
    /// Public listener
    pub listener: ResourceId,
    /// Log destination
    pub log_group: ResourceId,
    /// Repository the image is pulled from
    pub repository: RepositoryHandle,
    /// Seed upload, when seeding is declared
    pub seed: Option<ResourceId>,
    /// Public endpoint reference resolved by the provisioning engine
    pub endpoint: String,
}

/// Application stack output
#[derive(Clone, Debug)]
pub struct CompiledApplication {
    /// Declarations
    pub stack: Stack,
    /// Handles for consumers and reporting
    pub outputs: ApplicationOutputs,
}

// =============================================================================
// Compilation
// =============================================================================

/// Compiles the application stack
pub struct ApplicationStack;

impl ApplicationStack {
    /// Declare the service and everything around it
    pub fn compile(inputs: &ApplicationInputs) -> Result<CompiledApplication> {
        let settings = &inputs.settings;
        settings.health_check.validate(settings.listener_port)?;

        let mut stack = Stack::new(&inputs.name);
        let network = &inputs.network;

        let (image, repository) = Self::declare_image(&mut stack, inputs)?;

        let cluster = stack.declare(
            "Cluster",
            ResourceSpec::ContainerCluster {
                network: network.id.clone(),
                container_insights: true,
            },
        )?;

        let log_group = stack.declare(
            "LogGroup",
            ResourceSpec::LogGroup {
                name: format!("/{}/{}", inputs.name, inputs.service_name),
                retention_days: settings.log_retention_days,
                encryption_key: inputs.key.id.clone(),
            },
        )?;

        let task_identity = IdentityHandle {
            id: stack.declare(
                "TaskIdentity",
                ResourceSpec::Identity {
                    assumed_by: "ecs-tasks.amazonaws.com".to_string(),
                    managed_policies: Vec::new(),
                },
            )?,
        };

        let mut environment = settings.environment.clone();
        environment.insert("DATABASE_HOST".to_string(), inputs.database.endpoint.clone());
        environment.insert("DATABASE_PORT".to_string(), inputs.database.port.to_string());
        let secrets = BTreeMap::from([(
            "DATABASE_CREDENTIALS".to_string(),
            inputs.secret.id.clone(),
        )]);

        let mut port_mappings = vec![settings.container_port];
        if settings.health_check.port != settings.container_port {
            port_mappings.push(settings.health_check.port);
        }

        let task_definition = stack.declare(
            "TaskDefinition",
            ResourceSpec::TaskDefinition {
                cpu: settings.cpu,
                memory_mib: settings.memory_mib,
                task_identity: task_identity.id.clone(),
                container: ContainerDefinition {
                    image,
                    port_mappings,
                    environment,
                    secrets,
                    log_group: log_group.clone(),
                },
            },
        )?;

        let lb_boundary = BoundaryHandle {
            id: stack.declare(
                "LoadBalancerBoundary",
                ResourceSpec::SecurityBoundary {
                    network: network.id.clone(),
                    description: format!("{} load balancer", inputs.service_name),
                    allow_all_outbound: false,
                    disable_inline_rules: false,
                },
            )?,
        };
        let service_boundary = BoundaryHandle {
            id: stack.declare(
                "ServiceBoundary",
                ResourceSpec::SecurityBoundary {
                    network: network.id.clone(),
                    description: format!("{} service", inputs.service_name),
                    allow_all_outbound: false,
                    disable_inline_rules: false,
                },
            )?,
        };

        let load_balancer = stack.declare(
            "LoadBalancer",
            ResourceSpec::LoadBalancer {
                internet_facing: true,
                subnets: network.subnet_ids(&SubnetSelection::Role(SubnetRole::Public))?,
                boundary: lb_boundary.id.clone(),
            },
        )?;

        let target_group = stack.declare(
            "TargetGroup",
            ResourceSpec::TargetGroup {
                network: network.id.clone(),
                port: settings.container_port,
                health_check: settings.health_check.clone(),
            },
        )?;

        let listener = stack.declare(
            "Listener",
            ResourceSpec::Listener {
                load_balancer: load_balancer.clone(),
                port: settings.listener_port,
                target_group: target_group.clone(),
            },
        )?;

        let service = stack.declare(
            "Service",
            ResourceSpec::Service {
                name: inputs.service_name.clone(),
                cluster: cluster.clone(),
                task_definition,
                desired_count: settings.desired_count,
                subnets: network.subnet_ids(&SubnetSelection::Role(SubnetRole::Private))?,
                boundary: service_boundary.id.clone(),
                target_group,
            },
        )?;

        // The target group only joins the load balancer through the listener
        stack.add_dependency(&service, &listener)?;

        let seed = match &settings.seed {
            Some(bundle) => Some(Self::declare_seed(&mut stack, inputs, bundle, &service)?),
            None => None,
        };

        for rule in Self::network_rules(inputs, &lb_boundary, &service_boundary) {
            stack.allow(rule);
        }

        let mut planner = GrantPlanner::for_identity(&task_identity);
        planner
            .consume(&repository)
            .consume(&inputs.key)
            .consume(&inputs.secret);
        stack.grant_all(planner.finish());

        for id in [
            &cluster,
            &service,
            &task_identity.id,
            &service_boundary.id,
            &lb_boundary.id,
            &load_balancer,
            &listener,
            &log_group,
        ] {
            stack.export(id)?;
        }

        info!(
            stack = %inputs.name,
            service = %inputs.service_name,
            resources = stack.resource_count(),
            grants = stack.grants().len(),
            rules = stack.rules().len(),
            seeded = seed.is_some(),
            "compiled application"
        );

        Ok(CompiledApplication {
            outputs: ApplicationOutputs {
                endpoint: format!("${{{}.DnsName}}", load_balancer),
                cluster: ClusterHandle { id: cluster },
                service,
                task_identity,
                service_boundary,
                load_balancer_boundary: lb_boundary,
                load_balancer,
                listener,
                log_group,
                repository,
                seed,
            },
            stack,
        })
    }

    /// Resolve the artifact to an image reference before the service exists
    fn declare_image(
        stack: &mut Stack,
        inputs: &ApplicationInputs,
    ) -> Result<(ImageReference, RepositoryHandle)> {
        match &inputs.artifact {
            Artifact::Repository { repository, tag } => Ok((
                ImageReference::Repository {
                    repository: repository.id.clone(),
                    tag: tag.clone(),
                },
                repository.clone(),
            )),
            Artifact::BuildContext { directory, target } => {
                let name = format!("apps/{}", inputs.service_name);
                let repository = stack.declare(
                    "Repository",
                    ResourceSpec::Repository {
                        name: name.clone(),
                        scan_on_push: true,
                    },
                )?;
                stack.export(&repository)?;
                let asset = stack.declare(
                    "Image",
                    ResourceSpec::ImageAsset {
                        directory: directory.clone(),
                        target: target.clone(),
                        repository: repository.clone(),
                    },
                )?;
                Ok((
                    ImageReference::Asset { asset },
                    RepositoryHandle {
                        id: repository,
                        name,
                    },
                ))
            }
        }
    }

    /// Declare the seed bucket and upload, ordered before the service
    fn declare_seed(
        stack: &mut Stack,
        inputs: &ApplicationInputs,
        bundle: &SeedBundle,
        service: &ResourceId,
    ) -> Result<ResourceId> {
        let bucket = stack.declare(
            "SeedBucket",
            ResourceSpec::Bucket {
                encryption_key: Some(inputs.key.id.clone()),
            },
        )?;
        let upload = stack.declare(
            "SeedUpload",
            ResourceSpec::BucketDeployment {
                bucket,
                source: bundle.source.clone(),
                prefix: bundle.prefix.clone(),
            },
        )?;
        // No data reference from the compute path, so order it explicitly
        stack.add_dependency(service, &upload)?;
        debug!(service = %service, upload = %upload, "seed upload ordered before service");
        Ok(upload)
    }

    fn network_rules(
        inputs: &ApplicationInputs,
        lb: &BoundaryHandle,
        service: &BoundaryHandle,
    ) -> Vec<NetworkRule> {
        let settings = &inputs.settings;
        let mut rules = vec![
            NetworkRule::ingress(
                &lb.id,
                Ipv4Cidr::ANY,
                Port::tcp(settings.listener_port),
                "public listener",
            ),
            NetworkRule::between(
                &lb.id,
                &service.id,
                Port::tcp(settings.container_port),
                "load balancer to service",
            ),
            NetworkRule::egress(
                &service.id,
                Ipv4Cidr::ANY,
                Port::tcp(HTTPS_PORT),
                "image pulls and service endpoints",
            ),
            inputs
                .database
                .allow_default_port_from(service, "service to database"),
        ];
        // The probe port is not on the public listener and needs its own path
        if settings.health_check.port != settings.container_port {
            rules.push(NetworkRule::between(
                &lb.id,
                &service.id,
                Port::tcp(settings.health_check.port),
                "health check probe",
            ));
        }
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, NetworkConfig};
    use crate::stacks::data::{DataInputs, DataStack};
    use crate::stacks::network::NetworkStack;
    use stackwire_common::grant::GrantAction;
    use stackwire_common::policy::Endpoint;
    use stackwire_common::resource::ResourceKind;

    struct Fixture {
        network: NetworkHandle,
        database: DatabaseHandle,
        key: KeyHandle,
    }

    fn fixture() -> Fixture {
        let network = NetworkStack::compile("orders-network", &NetworkConfig::default())
            .unwrap()
            .network;
        let key = KeyHandle {
            id: ResourceId::new("orders-foundation", "Key"),
        };
        let database = DataStack::compile(&DataInputs {
            name: "orders-data",
            deployment: "orders",
            network: &network,
            key: &key,
            config: &DatabaseConfig::default(),
        })
        .unwrap()
        .database;
        Fixture {
            network,
            database,
            key,
        }
    }

    fn inputs(fixture: &Fixture, settings: ServiceSettings) -> ApplicationInputs {
        ApplicationInputs::builder()
            .name("orders-app")
            .service_name("orders")
            .network(fixture.network.clone())
            .artifact(Artifact::BuildContext {
                directory: "springboot-app".into(),
                target: None,
            })
            .secret(fixture.database.credentials.clone())
            .database(fixture.database.clone())
            .key(fixture.key.clone())
            .settings(settings)
            .build()
            .unwrap()
    }

    // =========================================================================
    // Story: Missing Handles Abort Composition
    // =========================================================================

    #[test]
    fn story_builder_names_the_missing_handle() {
        let fixture = fixture();
        let err = ApplicationInputs::builder()
            .name("orders-app")
            .service_name("orders")
            .network(fixture.network.clone())
            .artifact(Artifact::BuildContext {
                directory: "app".into(),
                target: None,
            })
            .key(fixture.key.clone())
            .secret(fixture.database.credentials.clone())
            .build()
            .unwrap_err();
        match err {
            Error::MissingHandle { stack, input } => {
                assert_eq!(stack, "orders-app");
                assert_eq!(input, "database");
            }
            other => panic!("expected MissingHandle, got {}", other),
        }
    }

    // =========================================================================
    // Story: Grants Follow Consumption
    // =========================================================================

    #[test]
    fn story_task_identity_gets_exactly_pull_decrypt_read() {
        let fixture = fixture();
        let compiled = ApplicationStack::compile(&inputs(&fixture, ServiceSettings::default()))
            .unwrap();
        let identity = &compiled.outputs.task_identity.id;

        let grants: Vec<String> = compiled
            .stack
            .grants()
            .for_principal(identity)
            .map(|g| format!("{} {}", g.action, g.resource))
            .collect();
        assert_eq!(
            grants,
            vec![
                "pull orders-app/Repository",
                "read orders-data/Credentials",
                "decrypt orders-foundation/Key",
            ]
        );
        // Logs and credentials share the key; it is granted once
        assert_eq!(
            compiled
                .stack
                .grants()
                .iter()
                .filter(|g| g.action == GrantAction::Decrypt)
                .count(),
            1
        );
    }

    #[test]
    fn story_prebuilt_repository_is_pulled_not_declared() {
        let fixture = fixture();
        let repository = RepositoryHandle {
            id: ResourceId::new("parameters", "/shared/orders-repository"),
            name: "apps/orders".into(),
        };
        let mut inputs = inputs(&fixture, ServiceSettings::default());
        inputs.artifact = Artifact::Repository {
            repository: repository.clone(),
            tag: "1.4.2".into(),
        };
        let compiled = ApplicationStack::compile(&inputs).unwrap();

        assert_eq!(compiled.stack.count(ResourceKind::Repository), 0);
        assert_eq!(compiled.stack.count(ResourceKind::ImageAsset), 0);
        assert_eq!(compiled.outputs.repository, repository);
        assert!(compiled.stack.imports().contains(&repository.id));
        assert_eq!(
            compiled
                .stack
                .grants()
                .actions_for(&compiled.outputs.task_identity.id)
                .len(),
            3
        );
    }

    // =========================================================================
    // Story: Seeding Is Ordered Explicitly
    // =========================================================================

    #[test]
    fn story_seed_upload_precedes_service() {
        let fixture = fixture();
        let settings = ServiceSettings {
            seed: Some(SeedBundle {
                source: "sql".into(),
                prefix: Some("init/".into()),
            }),
            ..Default::default()
        };
        let compiled = ApplicationStack::compile(&inputs(&fixture, settings)).unwrap();
        let upload = compiled.outputs.seed.clone().unwrap();
        let service = compiled.stack.resource(&compiled.outputs.service).unwrap();
        assert!(service.explicit_dependencies.contains(&upload));
        assert_eq!(compiled.stack.count(ResourceKind::Bucket), 1);
    }

    #[test]
    fn story_no_seed_no_edge() {
        let fixture = fixture();
        let compiled = ApplicationStack::compile(&inputs(&fixture, ServiceSettings::default()))
            .unwrap();
        assert!(compiled.outputs.seed.is_none());
        assert_eq!(compiled.stack.count(ResourceKind::BucketDeployment), 0);
        let service = compiled.stack.resource(&compiled.outputs.service).unwrap();
        assert_eq!(
            service.explicit_dependencies.iter().collect::<Vec<_>>(),
            vec![&compiled.outputs.listener]
        );
    }

    // =========================================================================
    // Story: Service Waits For Its Listener
    // =========================================================================

    #[test]
    fn story_service_waits_for_listener() {
        let fixture = fixture();
        let compiled = ApplicationStack::compile(&inputs(&fixture, ServiceSettings::default()))
            .unwrap();
        let graph = stackwire_common::graph::DependencyGraph::from_resources(
            compiled.stack.resources(),
        );
        let service = &compiled.outputs.service;
        let listener = &compiled.outputs.listener;
        assert_eq!(
            graph.edge(service, listener),
            Some(stackwire_common::graph::EdgeKind::Explicit)
        );
        assert!(!graph.depends_on(listener, service));
    }

    // =========================================================================
    // Story: Health Check Path Is Opened
    // =========================================================================

    #[test]
    fn story_probe_port_has_its_own_rule() {
        let fixture = fixture();
        let compiled = ApplicationStack::compile(&inputs(&fixture, ServiceSettings::default()))
            .unwrap();
        let lb = Endpoint::Boundary(compiled.outputs.load_balancer_boundary.id.clone());
        let svc = Endpoint::Boundary(compiled.outputs.service_boundary.id.clone());

        let ports: Vec<u16> = compiled
            .stack
            .rules()
            .iter()
            .filter(|r| r.from == lb && r.to == svc)
            .map(|r| r.port.from)
            .collect();
        assert_eq!(ports, vec![8080, 8081]);
    }

    #[test]
    fn story_probe_on_listener_port_is_rejected() {
        let fixture = fixture();
        let settings = ServiceSettings {
            health_check: HealthCheck {
                port: 80,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = ApplicationStack::compile(&inputs(&fixture, settings)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn service_reaches_database_on_its_default_port_only_outbound() {
        let fixture = fixture();
        let compiled = ApplicationStack::compile(&inputs(&fixture, ServiceSettings::default()))
            .unwrap();
        let db = Endpoint::Boundary(fixture.database.boundary.id.clone());
        let to_db: Vec<&NetworkRule> = compiled
            .stack
            .rules()
            .iter()
            .filter(|r| r.to == db)
            .collect();
        assert_eq!(to_db.len(), 1);
        assert_eq!(to_db[0].port, Port::tcp(5432));
        assert!(compiled.stack.rules().iter().all(|r| r.from != db));
    }

    #[test]
    fn task_definition_wires_ports_secrets_and_logs() {
        let fixture = fixture();
        let compiled = ApplicationStack::compile(&inputs(&fixture, ServiceSettings::default()))
            .unwrap();
        let task = compiled
            .stack
            .resource(&compiled.stack.id("TaskDefinition"))
            .unwrap();
        match &task.spec {
            ResourceSpec::TaskDefinition {
                cpu,
                memory_mib,
                container,
                ..
            } => {
                assert_eq!((*cpu, *memory_mib), (512, 1024));
                assert_eq!(container.port_mappings, vec![8080, 8081]);
                assert_eq!(container.log_group, compiled.outputs.log_group);
                assert_eq!(
                    container.secrets.get("DATABASE_CREDENTIALS"),
                    Some(&fixture.database.credentials.id)
                );
                assert_eq!(container.environment["DATABASE_PORT"], "5432");
            }
            other => panic!("expected a task definition, got {:?}", other),
        }
    }
}
