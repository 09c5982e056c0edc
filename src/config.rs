//! Deployment configuration loaded from YAML
//!
//! One file describes one deployment unit: the target environment, the
//! parameter store contents, and the knobs of each stack. Every section except
//! `name` and `application` has defaults, so a minimal file names the service
//! and its artifact and nothing else.
//!
//! ```yaml
//! name: orders
//! application:
//!   serviceName: orders
//!   artifact:
//!     buildContext:
//!       directory: springboot-app
//! ```

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use stackwire_common::health::HealthCheck;
use stackwire_common::network::{Ipv4Cidr, SubnetRole};
use stackwire_common::{
    Error, Result, DEFAULT_CONTAINER_PORT, DEFAULT_DATABASE_PORT, DEFAULT_LISTENER_PORT,
};

/// Task CPU sizes the container platform accepts
const VALID_CPU_UNITS: [u32; 5] = [256, 512, 1024, 2048, 4096];

/// Managed policies an identity must never carry
pub const BROAD_MANAGED_POLICIES: [&str; 2] = ["AdministratorAccess", "PowerUserAccess"];

/// A complete deployment unit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    /// Deployment name; prefixes every stack name
    pub name: String,
    /// Target environment
    #[serde(default)]
    pub target: TargetConfig,
    /// Parameter store contents: logical name to resolved value
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Network topology
    #[serde(default)]
    pub network: NetworkConfig,
    /// Trust foundation
    #[serde(default)]
    pub foundation: FoundationConfig,
    /// Database
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Application service
    pub application: ApplicationConfig,
    /// Test harness, only composed for experimental targets
    #[serde(default)]
    pub harness: HarnessConfig,
}

impl DeploymentConfig {
    /// Parse a configuration from YAML and validate it
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("invalid deployment config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&yaml)
    }

    /// Stack name for one of this deployment's stacks
    pub fn stack_name(&self, stack: &str) -> String {
        format!("{}-{}", self.name, stack)
    }

    /// Check everything that can be checked without composing
    pub fn validate(&self) -> Result<()> {
        validate_name("name", &self.name)?;
        self.application.validate()?;
        self.database.validate()?;
        if self.target.experimental {
            self.harness.validate()?;
        }
        Ok(())
    }
}

fn validate_name(field: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-');
    if !valid {
        return Err(Error::config(format!(
            "{} '{}' must be 1-63 lowercase alphanumerics or '-'",
            field, value
        )));
    }
    Ok(())
}

// =============================================================================
// Target
// =============================================================================

/// Where the deployment lands
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    /// Environment name, e.g. `dev` or `prod`
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Experimental targets get the test harness
    #[serde(default)]
    pub experimental: bool,
}

fn default_environment() -> String {
    "dev".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            experimental: false,
        }
    }
}

// =============================================================================
// Network
// =============================================================================

/// Network address space and subnet layout
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Address space
    #[schemars(with = "String")]
    pub cidr: Ipv4Cidr,
    /// Subnets, each inside `cidr`
    pub subnets: Vec<SubnetConfig>,
}

/// One subnet
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubnetConfig {
    /// Logical id within the network stack
    pub name: String,
    /// Address block
    #[schemars(with = "String")]
    pub cidr: Ipv4Cidr,
    /// Role
    pub role: SubnetRole,
    /// Availability zone
    pub availability_zone: String,
    /// Tags used for tag-based selection
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl SubnetConfig {
    fn new(name: &str, cidr: Ipv4Cidr, role: SubnetRole, availability_zone: &str) -> Self {
        Self {
            name: name.to_string(),
            cidr,
            role,
            availability_zone: availability_zone.to_string(),
            tags: BTreeMap::new(),
        }
    }
}

const NETWORK_BLOCK: Ipv4Cidr = Ipv4Cidr::from_octets([100, 64, 0, 0], 16);
const PUBLIC_A: Ipv4Cidr = Ipv4Cidr::from_octets([100, 64, 0, 0], 22);
const PUBLIC_B: Ipv4Cidr = Ipv4Cidr::from_octets([100, 64, 4, 0], 22);
const PRIVATE_A: Ipv4Cidr = Ipv4Cidr::from_octets([100, 64, 8, 0], 21);
const PRIVATE_B: Ipv4Cidr = Ipv4Cidr::from_octets([100, 64, 16, 0], 21);
const ISOLATED_A: Ipv4Cidr = Ipv4Cidr::from_octets([100, 64, 24, 0], 22);
const ISOLATED_B: Ipv4Cidr = Ipv4Cidr::from_octets([100, 64, 28, 0], 22);

impl Default for NetworkConfig {
    /// `100.64.0.0/16` split into public, private and isolated tiers over two zones
    fn default() -> Self {
        Self {
            cidr: NETWORK_BLOCK,
            subnets: vec![
                SubnetConfig::new("PublicA", PUBLIC_A, SubnetRole::Public, "a"),
                SubnetConfig::new("PublicB", PUBLIC_B, SubnetRole::Public, "b"),
                SubnetConfig::new("PrivateA", PRIVATE_A, SubnetRole::Private, "a"),
                SubnetConfig::new("PrivateB", PRIVATE_B, SubnetRole::Private, "b"),
                SubnetConfig::new("IsolatedA", ISOLATED_A, SubnetRole::Isolated, "a"),
                SubnetConfig::new("IsolatedB", ISOLATED_B, SubnetRole::Isolated, "b"),
            ],
        }
    }
}

// =============================================================================
// Foundation
// =============================================================================

/// Customer managed key settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FoundationConfig {
    /// Key alias; defaults to `alias/<deployment name>`
    #[serde(default)]
    pub key_alias: Option<String>,
    /// Automatic key rotation
    #[serde(default = "default_true")]
    pub enable_rotation: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FoundationConfig {
    fn default() -> Self {
        Self {
            key_alias: None,
            enable_rotation: true,
        }
    }
}

// =============================================================================
// Database
// =============================================================================

/// Relational database cluster settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Engine
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Engine version
    #[serde(default = "default_engine_version")]
    pub version: String,
    /// Default port
    #[serde(default = "default_database_port")]
    pub port: u16,
    /// Instance count
    #[serde(default = "default_instances")]
    pub instances: u8,
    /// Subnet tier the cluster is placed in
    #[serde(default = "default_database_role")]
    pub subnet_role: SubnetRole,
}

fn default_engine() -> String {
    "aurora-postgresql".to_string()
}

fn default_engine_version() -> String {
    "15.4".to_string()
}

fn default_database_port() -> u16 {
    DEFAULT_DATABASE_PORT
}

fn default_instances() -> u8 {
    1
}

fn default_database_role() -> SubnetRole {
    SubnetRole::Isolated
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            version: default_engine_version(),
            port: default_database_port(),
            instances: default_instances(),
            subnet_role: default_database_role(),
        }
    }
}

impl DatabaseConfig {
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::config("database port must be non-zero"));
        }
        if self.instances == 0 {
            return Err(Error::config("database needs at least one instance"));
        }
        if self.subnet_role == SubnetRole::Public {
            return Err(Error::config("database must not be placed in public subnets"));
        }
        Ok(())
    }
}

// =============================================================================
// Application
// =============================================================================

/// Where the service image comes from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactSource {
    /// A tag in an existing repository, resolved through the parameter store
    #[serde(rename_all = "camelCase")]
    Repository {
        /// Logical parameter name of the repository
        parameter: String,
        /// Image tag
        #[serde(default = "default_tag")]
        tag: String,
    },
    /// An image built from a local context into a repository this deployment owns
    #[serde(rename_all = "camelCase")]
    BuildContext {
        /// Build context directory
        directory: String,
        /// Build target stage
        #[serde(default)]
        target: Option<String>,
    },
}

/// Environment every service task starts with unless configured otherwise
pub fn default_service_environment() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("SPRING_PROFILES_ACTIVE".to_string(), "aws".to_string()),
        (
            "JAVA_TOOL_OPTIONS".to_string(),
            "-XX:InitialRAMPercentage=70 -XX:MaxRAMPercentage=70 -Dfile.encoding=UTF-8".to_string(),
        ),
    ])
}

fn default_tag() -> String {
    "latest".to_string()
}

/// SQL bundle uploaded before the service starts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeedConfig {
    /// Local directory holding the bundle
    pub source: String,
    /// Destination key prefix
    #[serde(default)]
    pub prefix: Option<String>,
}

/// The load-balanced container service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationConfig {
    /// Service name
    pub service_name: String,
    /// Image source
    #[serde(with = "serde_yaml::with::singleton_map")]
    #[schemars(with = "ArtifactSource")]
    pub artifact: ArtifactSource,
    /// CPU units
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    /// Memory in MiB
    #[serde(default = "default_memory")]
    pub memory_mib: u32,
    /// Desired task count
    #[serde(default = "default_desired_count")]
    pub desired_count: u32,
    /// Port the container serves traffic on
    #[serde(default = "default_container_port")]
    pub container_port: u16,
    /// Public listener port
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,
    /// Liveness probe
    #[serde(default)]
    pub health_check: HealthCheck,
    /// Plain environment variables
    #[serde(default = "default_service_environment")]
    pub environment: BTreeMap<String, String>,
    /// Log retention in days
    #[serde(default = "default_retention")]
    pub log_retention_days: u32,
    /// Import the key by logical name instead of using the foundation key
    #[serde(default)]
    pub key_parameter: Option<String>,
    /// Import the injected secret by logical name instead of the database credentials
    #[serde(default)]
    pub secret_parameter: Option<String>,
    /// Data seeding bundle
    #[serde(default)]
    pub seed: Option<SeedConfig>,
}

fn default_cpu() -> u32 {
    512
}

fn default_memory() -> u32 {
    1024
}

fn default_desired_count() -> u32 {
    1
}

fn default_container_port() -> u16 {
    DEFAULT_CONTAINER_PORT
}

fn default_listener_port() -> u16 {
    DEFAULT_LISTENER_PORT
}

fn default_retention() -> u32 {
    30
}

impl ApplicationConfig {
    /// Minimal settings for a service built from a local context
    pub fn new(service_name: impl Into<String>, artifact: ArtifactSource) -> Self {
        Self {
            service_name: service_name.into(),
            artifact,
            cpu: default_cpu(),
            memory_mib: default_memory(),
            desired_count: default_desired_count(),
            container_port: default_container_port(),
            listener_port: default_listener_port(),
            health_check: HealthCheck::default(),
            environment: default_service_environment(),
            log_retention_days: default_retention(),
            key_parameter: None,
            secret_parameter: None,
            seed: None,
        }
    }

    fn validate(&self) -> Result<()> {
        validate_name("application.serviceName", &self.service_name)?;
        if !VALID_CPU_UNITS.contains(&self.cpu) {
            return Err(Error::config(format!(
                "cpu {} is not one of {:?}",
                self.cpu, VALID_CPU_UNITS
            )));
        }
        if self.memory_mib < self.cpu * 2 {
            return Err(Error::config(format!(
                "memory {} MiB is too small for {} cpu units",
                self.memory_mib, self.cpu
            )));
        }
        if self.desired_count == 0 {
            return Err(Error::config("desiredCount must be at least 1"));
        }
        if self.container_port == 0 || self.listener_port == 0 {
            return Err(Error::config("ports must be non-zero"));
        }
        self.health_check
            .validate(self.listener_port)
            .map_err(|e| Error::config(e.to_string()))?;
        if let ArtifactSource::BuildContext { directory, .. } = &self.artifact {
            if directory.trim().is_empty() {
                return Err(Error::config("artifact build context directory is empty"));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

/// One enumerated peer of the harness boundary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HarnessPeer {
    /// Peer address block
    #[schemars(with = "String")]
    pub cidr: Ipv4Cidr,
    /// TCP port; every TCP port when absent
    #[serde(default)]
    pub port: Option<u16>,
}

impl HarnessPeer {
    fn new(cidr: Ipv4Cidr, port: Option<u16>) -> Self {
        Self { cidr, port }
    }
}

/// Registry pull-through cache rule
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheRuleConfig {
    /// Local repository prefix
    pub repository_prefix: String,
    /// Upstream registry
    pub upstream_registry_url: String,
}

/// Test harness instance and its allowlist
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HarnessConfig {
    /// Instance type
    #[serde(default = "default_instance_type")]
    pub instance_type: String,
    /// Machine image
    #[serde(default = "default_machine_image")]
    pub machine_image: String,
    /// Addresses whose subnets the instance is pinned to
    #[serde(default = "default_addresses")]
    pub subnet_addresses: Vec<Ipv4Addr>,
    /// Managed policies attached to the instance identity
    #[serde(default = "default_managed_policies")]
    pub managed_policies: Vec<String>,
    /// Enumerated ingress peers
    #[serde(default = "default_ingress")]
    pub ingress: Vec<HarnessPeer>,
    /// Enumerated egress peers
    #[serde(default = "default_egress")]
    pub egress: Vec<HarnessPeer>,
    /// Registry cache rule, if any
    #[serde(default = "default_cache_rule")]
    pub cache_rule: Option<CacheRuleConfig>,
}

fn default_instance_type() -> String {
    "t3.micro".to_string()
}

fn default_machine_image() -> String {
    "amazon-linux-2023".to_string()
}

fn default_addresses() -> Vec<Ipv4Addr> {
    vec![Ipv4Addr::new(100, 64, 12, 100), Ipv4Addr::new(100, 64, 16, 100)]
}

fn default_managed_policies() -> Vec<String> {
    vec!["AmazonSSMManagedInstanceCore".to_string()]
}

/// Corporate range allowed onto the harness
const CORPORATE_BLOCK: Ipv4Cidr = Ipv4Cidr::from_octets([10, 105, 112, 0], 21);

/// Public and private tiers of the default network
const INTERNAL_BLOCK: Ipv4Cidr = Ipv4Cidr::from_octets([100, 64, 0, 0], 19);

fn default_ingress() -> Vec<HarnessPeer> {
    vec![
        HarnessPeer::new(CORPORATE_BLOCK, Some(22)),
        HarnessPeer::new(INTERNAL_BLOCK, Some(22)),
    ]
}

fn default_egress() -> Vec<HarnessPeer> {
    vec![
        HarnessPeer::new(INTERNAL_BLOCK, None),
        HarnessPeer::new(CORPORATE_BLOCK, None),
    ]
}

fn default_cache_rule() -> Option<CacheRuleConfig> {
    Some(CacheRuleConfig {
        repository_prefix: "quay".to_string(),
        upstream_registry_url: "quay.io".to_string(),
    })
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            instance_type: default_instance_type(),
            machine_image: default_machine_image(),
            subnet_addresses: default_addresses(),
            managed_policies: default_managed_policies(),
            ingress: default_ingress(),
            egress: default_egress(),
            cache_rule: default_cache_rule(),
        }
    }
}

impl HarnessConfig {
    fn validate(&self) -> Result<()> {
        if self.subnet_addresses.is_empty() {
            return Err(Error::config("harness needs at least one subnet address"));
        }
        if self.ingress.is_empty() {
            return Err(Error::config("harness needs at least one ingress peer"));
        }
        if let Some(open) = self
            .ingress
            .iter()
            .chain(&self.egress)
            .find(|peer| peer.cidr.prefix() == 0)
        {
            return Err(Error::config(format!(
                "harness peer {} is not an enumerated block",
                open.cidr
            )));
        }
        if let Some(policy) = self
            .managed_policies
            .iter()
            .find(|p| BROAD_MANAGED_POLICIES.contains(&p.as_str()))
        {
            return Err(Error::config(format!(
                "harness identity must not carry {}",
                policy
            )));
        }
        Ok(())
    }
}
