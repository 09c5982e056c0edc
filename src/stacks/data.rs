//! Data stack: database cluster, its boundary and its credentials
//!
//! The cluster's boundary admits nothing on its own. Consumers open a path
//! to it with [`DatabaseHandle::allow_default_port_from`], which keeps the
//! port and direction in one place.

use tracing::info;

use stackwire_common::handle::{BoundaryHandle, DatabaseHandle, KeyHandle, SecretRef};
use stackwire_common::network::{NetworkHandle, SubnetSelection};
use stackwire_common::resource::ResourceSpec;
use stackwire_common::stack::Stack;
use stackwire_common::Result;

use crate::config::DatabaseConfig;

/// Handles the data stack borrows
#[derive(Clone, Copy, Debug)]
pub struct DataInputs<'a> {
    /// Stack name
    pub name: &'a str,
    /// Deployment name, used for the secret name
    pub deployment: &'a str,
    /// Network the cluster is placed in
    pub network: &'a NetworkHandle,
    /// Key encrypting storage and credentials
    pub key: &'a KeyHandle,
    /// Cluster settings
    pub config: &'a DatabaseConfig,
}

/// Data stack output
#[derive(Clone, Debug)]
pub struct CompiledData {
    /// Declarations
    pub stack: Stack,
    /// Cluster, endpoint, port, boundary and credentials
    pub database: DatabaseHandle,
}

/// Compiles the data stack
pub struct DataStack;

impl DataStack {
    /// Declare the boundary, credentials secret and cluster
    pub fn compile(inputs: &DataInputs<'_>) -> Result<CompiledData> {
        let config = inputs.config;
        let mut stack = Stack::new(inputs.name);

        let boundary = stack.declare(
            "DatabaseBoundary",
            ResourceSpec::SecurityBoundary {
                network: inputs.network.id.clone(),
                description: format!("{} database", inputs.deployment),
                allow_all_outbound: false,
                disable_inline_rules: false,
            },
        )?;

        let secret_name = format!("{}/database-credentials", inputs.deployment);
        let credentials = stack.declare(
            "Credentials",
            ResourceSpec::Secret {
                name: secret_name.clone(),
                encryption_key: Some(inputs.key.id.clone()),
            },
        )?;

        let subnets = inputs
            .network
            .subnet_ids(&SubnetSelection::Role(config.subnet_role))?;
        let cluster = stack.declare(
            "Cluster",
            ResourceSpec::DatabaseCluster {
                engine: config.engine.clone(),
                version: config.version.clone(),
                port: config.port,
                instances: config.instances,
                subnets,
                boundary: boundary.clone(),
                credentials: credentials.clone(),
                storage_encryption_key: inputs.key.id.clone(),
            },
        )?;

        for id in [&boundary, &credentials, &cluster] {
            stack.export(id)?;
        }

        info!(
            stack = %inputs.name,
            engine = %config.engine,
            port = config.port,
            "compiled data"
        );
        Ok(CompiledData {
            database: DatabaseHandle {
                endpoint: format!("${{{}.Endpoint.Address}}", cluster),
                cluster,
                port: config.port,
                boundary: BoundaryHandle { id: boundary },
                credentials: SecretRef {
                    id: credentials,
                    name: secret_name,
                    encryption_key: Some(inputs.key.clone()),
                },
            },
            stack,
        })
    }
}
