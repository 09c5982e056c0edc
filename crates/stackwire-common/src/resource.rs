//! Resource declarations
//!
//! A [`Resource`] is what a stack hands to the provisioning engine: a typed
//! spec, a removal policy fixed at declaration time, and any explicit ordering
//! constraints. References between resources are plain [`ResourceId`]s inside
//! the spec; [`ResourceSpec::references`] exposes them so the dependency graph
//! can infer implicit edges.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::handle::ResourceId;
use crate::health::HealthCheck;
use crate::network::{Ipv4Cidr, SubnetRole};

/// What happens to a resource when its stack is torn down
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum RemovalPolicy {
    /// Delete it
    #[default]
    Destroy,
    /// Take a final snapshot, then delete it
    Snapshot,
    /// Leave it in place
    Retain,
}

/// Kind of a declared resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ResourceKind {
    /// Virtual network
    Network,
    /// Subnet inside a network
    Subnet,
    /// Encryption key
    Key,
    /// Secret value
    Secret,
    /// Relational database cluster
    DatabaseCluster,
    /// Container image repository
    Repository,
    /// Image built from a local context
    ImageAsset,
    /// Container cluster
    ContainerCluster,
    /// Log destination
    LogGroup,
    /// Identity / role
    Identity,
    /// Task definition
    TaskDefinition,
    /// Security group
    SecurityBoundary,
    /// Load balancer
    LoadBalancer,
    /// Load balancer listener
    Listener,
    /// Load balancer target group
    TargetGroup,
    /// Container service
    Service,
    /// Object storage bucket
    Bucket,
    /// Upload of local assets into a bucket
    BucketDeployment,
    /// Compute instance
    Instance,
    /// Registry pull-through cache rule
    PullThroughCacheRule,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(kind_name(*self))
    }
}

fn kind_name(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Network => "network",
        ResourceKind::Subnet => "subnet",
        ResourceKind::Key => "key",
        ResourceKind::Secret => "secret",
        ResourceKind::DatabaseCluster => "databaseCluster",
        ResourceKind::Repository => "repository",
        ResourceKind::ImageAsset => "imageAsset",
        ResourceKind::ContainerCluster => "containerCluster",
        ResourceKind::LogGroup => "logGroup",
        ResourceKind::Identity => "identity",
        ResourceKind::TaskDefinition => "taskDefinition",
        ResourceKind::SecurityBoundary => "securityBoundary",
        ResourceKind::LoadBalancer => "loadBalancer",
        ResourceKind::Listener => "listener",
        ResourceKind::TargetGroup => "targetGroup",
        ResourceKind::Service => "service",
        ResourceKind::Bucket => "bucket",
        ResourceKind::BucketDeployment => "bucketDeployment",
        ResourceKind::Instance => "instance",
        ResourceKind::PullThroughCacheRule => "pullThroughCacheRule",
    }
}

/// Where a task's container image comes from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageReference {
    /// A tag in an existing repository
    Repository {
        /// Repository resource
        repository: ResourceId,
        /// Image tag
        tag: String,
    },
    /// An image built from a local context and pushed by the engine
    Asset {
        /// Image asset resource
        asset: ResourceId,
    },
}

impl ImageReference {
    /// The resource the image resolves through
    pub fn source(&self) -> &ResourceId {
        match self {
            Self::Repository { repository, .. } => repository,
            Self::Asset { asset } => asset,
        }
    }
}

/// The single container a task runs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDefinition {
    /// Image to run
    pub image: ImageReference,
    /// Ports the container listens on
    pub port_mappings: Vec<u16>,
    /// Plain environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Environment variables injected from secrets
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, ResourceId>,
    /// Log destination
    pub log_group: ResourceId,
}

/// Typed declaration of a resource
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResourceSpec {
    /// A value resolved through the parameter store, owned elsewhere
    #[serde(rename_all = "camelCase")]
    Imported {
        /// Logical parameter name
        name: String,
        /// Resolved value, e.g. an ARN
        value: String,
        /// Kind of the referenced resource
        kind: ResourceKind,
    },
    /// Virtual network
    #[serde(rename_all = "camelCase")]
    Network {
        /// Address space
        cidr: Ipv4Cidr,
    },
    /// Subnet
    #[serde(rename_all = "camelCase")]
    Subnet {
        /// Owning network
        network: ResourceId,
        /// Address block
        cidr: Ipv4Cidr,
        /// Role
        role: SubnetRole,
        /// Availability zone
        availability_zone: String,
        /// Tags
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        tags: BTreeMap<String, String>,
    },
    /// Customer managed encryption key
    #[serde(rename_all = "camelCase")]
    Key {
        /// Alias
        alias: String,
        /// Automatic rotation
        enable_rotation: bool,
    },
    /// Secret
    #[serde(rename_all = "camelCase")]
    Secret {
        /// Name in the secret store
        name: String,
        /// Customer managed key, if any
        encryption_key: Option<ResourceId>,
    },
    /// Relational database cluster
    #[serde(rename_all = "camelCase")]
    DatabaseCluster {
        /// Engine, e.g. `aurora-postgresql`
        engine: String,
        /// Engine version
        version: String,
        /// Default port
        port: u16,
        /// Instance count
        instances: u8,
        /// Subnets the cluster is placed in
        subnets: Vec<ResourceId>,
        /// Boundary guarding the cluster
        boundary: ResourceId,
        /// Credentials secret
        credentials: ResourceId,
        /// Key encrypting storage
        storage_encryption_key: ResourceId,
    },
    /// Container image repository
    #[serde(rename_all = "camelCase")]
    Repository {
        /// Repository name
        name: String,
        /// Scan images on push
        scan_on_push: bool,
    },
    /// Image built from a local directory
    #[serde(rename_all = "camelCase")]
    ImageAsset {
        /// Build context directory
        directory: String,
        /// Build target stage
        target: Option<String>,
        /// Repository the engine pushes into
        repository: ResourceId,
    },
    /// Container cluster
    #[serde(rename_all = "camelCase")]
    ContainerCluster {
        /// Network the cluster runs in
        network: ResourceId,
        /// Container insights
        container_insights: bool,
    },
    /// Log destination, encrypted at rest
    #[serde(rename_all = "camelCase")]
    LogGroup {
        /// Log group name
        name: String,
        /// Retention in days
        retention_days: u32,
        /// Key encrypting the logs
        encryption_key: ResourceId,
    },
    /// Identity a workload runs as
    #[serde(rename_all = "camelCase")]
    Identity {
        /// Service principal allowed to assume the identity
        assumed_by: String,
        /// Managed policies attached to the identity
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        managed_policies: Vec<String>,
    },
    /// Task definition
    #[serde(rename_all = "camelCase")]
    TaskDefinition {
        /// CPU units
        cpu: u32,
        /// Memory in MiB
        memory_mib: u32,
        /// Identity the task runs as
        task_identity: ResourceId,
        /// The container
        container: ContainerDefinition,
    },
    /// Security boundary
    #[serde(rename_all = "camelCase")]
    SecurityBoundary {
        /// Network the boundary lives in
        network: ResourceId,
        /// Description
        description: String,
        /// Permit all egress without rules
        allow_all_outbound: bool,
        /// Render rules as standalone resources rather than inline
        disable_inline_rules: bool,
    },
    /// Load balancer
    #[serde(rename_all = "camelCase")]
    LoadBalancer {
        /// Reachable from the internet
        internet_facing: bool,
        /// Subnets the load balancer is placed in
        subnets: Vec<ResourceId>,
        /// Boundary attached to the load balancer
        boundary: ResourceId,
    },
    /// Load balancer listener
    #[serde(rename_all = "camelCase")]
    Listener {
        /// Load balancer
        load_balancer: ResourceId,
        /// Public port
        port: u16,
        /// Default target group
        target_group: ResourceId,
    },
    /// Load balancer target group
    #[serde(rename_all = "camelCase")]
    TargetGroup {
        /// Network
        network: ResourceId,
        /// Port traffic is forwarded to
        port: u16,
        /// Liveness probe
        health_check: HealthCheck,
    },
    /// Container service
    #[serde(rename_all = "camelCase")]
    Service {
        /// Service name
        name: String,
        /// Cluster
        cluster: ResourceId,
        /// Task definition
        task_definition: ResourceId,
        /// Desired task count
        desired_count: u32,
        /// Subnets tasks are placed in
        subnets: Vec<ResourceId>,
        /// Boundary attached to tasks
        boundary: ResourceId,
        /// Target group tasks register with
        target_group: ResourceId,
    },
    /// Object storage bucket
    #[serde(rename_all = "camelCase")]
    Bucket {
        /// Key encrypting objects, if customer managed
        encryption_key: Option<ResourceId>,
    },
    /// Upload of a local bundle into a bucket
    #[serde(rename_all = "camelCase")]
    BucketDeployment {
        /// Destination bucket
        bucket: ResourceId,
        /// Local source directory
        source: String,
        /// Destination key prefix
        prefix: Option<String>,
    },
    /// Compute instance
    #[serde(rename_all = "camelCase")]
    Instance {
        /// Instance type, e.g. `t3.micro`
        instance_type: String,
        /// Machine image
        machine_image: String,
        /// Subnets the instance may be placed in
        subnets: Vec<ResourceId>,
        /// Instance identity
        identity: ResourceId,
        /// Boundary attached to the instance
        boundary: ResourceId,
        /// Replace the instance when user data changes
        user_data_causes_replacement: bool,
    },
    /// Registry pull-through cache rule
    #[serde(rename_all = "camelCase")]
    PullThroughCacheRule {
        /// Local repository prefix
        repository_prefix: String,
        /// Upstream registry
        upstream_registry_url: String,
    },
}

impl ResourceSpec {
    /// Kind of the resource; imported values report the kind they stand for
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Imported { kind, .. } => *kind,
            Self::Network { .. } => ResourceKind::Network,
            Self::Subnet { .. } => ResourceKind::Subnet,
            Self::Key { .. } => ResourceKind::Key,
            Self::Secret { .. } => ResourceKind::Secret,
            Self::DatabaseCluster { .. } => ResourceKind::DatabaseCluster,
            Self::Repository { .. } => ResourceKind::Repository,
            Self::ImageAsset { .. } => ResourceKind::ImageAsset,
            Self::ContainerCluster { .. } => ResourceKind::ContainerCluster,
            Self::LogGroup { .. } => ResourceKind::LogGroup,
            Self::Identity { .. } => ResourceKind::Identity,
            Self::TaskDefinition { .. } => ResourceKind::TaskDefinition,
            Self::SecurityBoundary { .. } => ResourceKind::SecurityBoundary,
            Self::LoadBalancer { .. } => ResourceKind::LoadBalancer,
            Self::Listener { .. } => ResourceKind::Listener,
            Self::TargetGroup { .. } => ResourceKind::TargetGroup,
            Self::Service { .. } => ResourceKind::Service,
            Self::Bucket { .. } => ResourceKind::Bucket,
            Self::BucketDeployment { .. } => ResourceKind::BucketDeployment,
            Self::Instance { .. } => ResourceKind::Instance,
            Self::PullThroughCacheRule { .. } => ResourceKind::PullThroughCacheRule,
        }
    }

    /// Whether this is a parameter-store import rather than a declaration
    pub fn is_imported(&self) -> bool {
        matches!(self, Self::Imported { .. })
    }

    /// Removal policy used when the declaring stack does not pick one
    pub fn default_removal_policy(&self) -> RemovalPolicy {
        match self {
            Self::Imported { .. } | Self::Key { .. } | Self::LogGroup { .. } => {
                RemovalPolicy::Retain
            }
            Self::DatabaseCluster { .. } | Self::Repository { .. } => RemovalPolicy::Snapshot,
            _ => RemovalPolicy::Destroy,
        }
    }

    /// Every resource this spec references, in declaration order
    pub fn references(&self) -> Vec<&ResourceId> {
        let mut refs: Vec<&ResourceId> = Vec::new();
        match self {
            Self::Imported { .. }
            | Self::Network { .. }
            | Self::Key { .. }
            | Self::Repository { .. }
            | Self::Identity { .. }
            | Self::PullThroughCacheRule { .. } => {}
            Self::Subnet { network, .. } => refs.push(network),
            Self::Secret { encryption_key, .. } | Self::Bucket { encryption_key } => {
                refs.extend(encryption_key.iter())
            }
            Self::DatabaseCluster {
                subnets,
                boundary,
                credentials,
                storage_encryption_key,
                ..
            } => {
                refs.extend(subnets.iter());
                refs.extend([boundary, credentials, storage_encryption_key]);
            }
            Self::ImageAsset { repository, .. } => refs.push(repository),
            Self::ContainerCluster { network, .. } => refs.push(network),
            Self::LogGroup { encryption_key, .. } => refs.push(encryption_key),
            Self::TaskDefinition {
                task_identity,
                container,
                ..
            } => {
                refs.push(task_identity);
                refs.push(container.image.source());
                refs.extend(container.secrets.values());
                refs.push(&container.log_group);
            }
            Self::SecurityBoundary { network, .. } => refs.push(network),
            Self::LoadBalancer {
                subnets, boundary, ..
            } => {
                refs.extend(subnets.iter());
                refs.push(boundary);
            }
            Self::Listener {
                load_balancer,
                target_group,
                ..
            } => refs.extend([load_balancer, target_group]),
            Self::TargetGroup { network, .. } => refs.push(network),
            Self::Service {
                cluster,
                task_definition,
                subnets,
                boundary,
                target_group,
                ..
            } => {
                refs.extend([cluster, task_definition]);
                refs.extend(subnets.iter());
                refs.extend([boundary, target_group]);
            }
            Self::BucketDeployment { bucket, .. } => refs.push(bucket),
            Self::Instance {
                subnets,
                identity,
                boundary,
                ..
            } => {
                refs.extend(subnets.iter());
                refs.extend([identity, boundary]);
            }
        }
        refs
    }
}

/// A declared resource
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Resource id
    pub id: ResourceId,
    /// Declaration
    #[serde(flatten)]
    pub spec: ResourceSpec,
    /// Teardown behaviour
    pub removal_policy: RemovalPolicy,
    /// Ordering constraints with no data reference behind them
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub explicit_dependencies: BTreeSet<ResourceId>,
}

impl Resource {
    /// Declare a resource with its kind's default removal policy
    pub fn new(id: ResourceId, spec: ResourceSpec) -> Self {
        let removal_policy = spec.default_removal_policy();
        Self {
            id,
            spec,
            removal_policy,
            explicit_dependencies: BTreeSet::new(),
        }
    }

    /// Kind of the resource
    pub fn kind(&self) -> ResourceKind {
        self.spec.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ResourceId {
        ResourceId::new("app", name)
    }

    #[test]
    fn service_references_everything_it_runs_on() {
        let spec = ResourceSpec::Service {
            name: "orders".into(),
            cluster: id("Cluster"),
            task_definition: id("TaskDefinition"),
            desired_count: 1,
            subnets: vec![ResourceId::new("net", "PrivateA")],
            boundary: id("ServiceBoundary"),
            target_group: id("TargetGroup"),
        };
        let refs: Vec<String> = spec.references().iter().map(|r| r.to_string()).collect();
        assert_eq!(
            refs,
            vec![
                "app/Cluster",
                "app/TaskDefinition",
                "net/PrivateA",
                "app/ServiceBoundary",
                "app/TargetGroup"
            ]
        );
    }

    #[test]
    fn task_definition_references_image_secrets_and_logs() {
        let spec = ResourceSpec::TaskDefinition {
            cpu: 512,
            memory_mib: 1024,
            task_identity: id("TaskIdentity"),
            container: ContainerDefinition {
                image: ImageReference::Asset {
                    asset: id("ImageAsset"),
                },
                port_mappings: vec![8080, 8081],
                environment: BTreeMap::new(),
                secrets: BTreeMap::from([(
                    "DB_SECRET".to_string(),
                    ResourceId::new("data", "Credentials"),
                )]),
                log_group: id("LogGroup"),
            },
        };
        let refs = spec.references();
        assert_eq!(refs.len(), 4);
        assert!(refs.contains(&&ResourceId::new("data", "Credentials")));
        assert!(refs.contains(&&id("ImageAsset")));
    }

    #[test]
    fn removal_policy_defaults_follow_kind() {
        let key = ResourceSpec::Key {
            alias: "alias/app".into(),
            enable_rotation: true,
        };
        let repo = ResourceSpec::Repository {
            name: "apps/orders".into(),
            scan_on_push: true,
        };
        let bucket = ResourceSpec::Bucket {
            encryption_key: None,
        };
        assert_eq!(key.default_removal_policy(), RemovalPolicy::Retain);
        assert_eq!(repo.default_removal_policy(), RemovalPolicy::Snapshot);
        assert_eq!(bucket.default_removal_policy(), RemovalPolicy::Destroy);
    }

    #[test]
    fn imported_reports_the_kind_it_stands_for() {
        let spec = ResourceSpec::Imported {
            name: "/shared/kms-key-arn".into(),
            value: "arn:aws:kms:us-east-1:111122223333:key/abc".into(),
            kind: ResourceKind::Key,
        };
        assert_eq!(spec.kind(), ResourceKind::Key);
        assert!(spec.is_imported());
        assert!(spec.references().is_empty());
    }

    #[test]
    fn serializes_with_type_tag() {
        let resource = Resource::new(
            id("Cluster"),
            ResourceSpec::ContainerCluster {
                network: ResourceId::new("net", "Network"),
                container_insights: true,
            },
        );
        let json = serde_json::to_value(&resource).unwrap();
        assert_eq!(json["type"], "containerCluster");
        assert_eq!(json["containerInsights"], true);
        assert_eq!(json["removalPolicy"], "destroy");
        assert_eq!(ResourceKind::ContainerCluster.to_string(), "containerCluster");
    }
}
