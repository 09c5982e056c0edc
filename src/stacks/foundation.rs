//! Trust foundation stack: the customer managed key

use tracing::info;

use stackwire_common::handle::KeyHandle;
use stackwire_common::resource::ResourceSpec;
use stackwire_common::stack::Stack;
use stackwire_common::Result;

use crate::config::FoundationConfig;

/// Foundation stack output
#[derive(Clone, Debug)]
pub struct CompiledFoundation {
    /// Declarations
    pub stack: Stack,
    /// Key shared by logs, secrets and data at rest
    pub key: KeyHandle,
}

/// Compiles the trust foundation
pub struct FoundationStack;

impl FoundationStack {
    /// Declare the key; the alias defaults to `alias/<deployment>`
    pub fn compile(
        name: &str,
        deployment: &str,
        config: &FoundationConfig,
    ) -> Result<CompiledFoundation> {
        let alias = config
            .key_alias
            .clone()
            .unwrap_or_else(|| format!("alias/{}", deployment));

        let mut stack = Stack::new(name);
        let id = stack.declare(
            "Key",
            ResourceSpec::Key {
                alias: alias.clone(),
                enable_rotation: config.enable_rotation,
            },
        )?;
        stack.export(&id)?;

        info!(stack = %name, alias = %alias, "compiled foundation");
        Ok(CompiledFoundation {
            stack,
            key: KeyHandle { id },
        })
    }
}
