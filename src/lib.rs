//! Stackwire - composes infrastructure stacks into a validated resource graph
//!
//! A deployment unit is five stacks (network, foundation, data, application
//! and an optional test harness) that borrow each other's outputs through
//! typed handles. The compiler builds them once, in order, and merges them
//! into one dependency graph whose grants and network rules are validated as
//! a batch before anything is emitted.
//!
//! # Architecture
//!
//! - Stacks declare resources as data; nothing talks to a provisioning engine
//! - Edges are implicit (a declaration references a handle) or explicit
//!   (ordering without a data reference, e.g. seeding before startup)
//! - Grants are derived from what each identity consumes
//! - Network rules are default-deny; every path is enumerated
//!
//! # Modules
//!
//! - [`config`] - Deployment configuration (YAML)
//! - [`parameters`] - Parameter store lookup for values owned elsewhere
//! - [`stacks`] - Network, foundation, data, application and harness stacks
//! - [`compiler`] - Deployment compiler and the composed [`Deployment`]
//! - [`validation`] - Batch invariant checks
//! - [`manifest`] - Declarative output for the provisioning engine
//!
//! Shared model types live in `stackwire-common` and are re-exported here.
//!
//! [`Deployment`]: compiler::Deployment

#![deny(missing_docs)]

pub mod compiler;
pub mod config;
pub mod manifest;
pub mod parameters;
pub mod stacks;
pub mod validation;

pub use stackwire_common::{
    error, grant, graph, handle, health, network, policy, resource, stack, Error, Result,
    DEFAULT_CONTAINER_PORT, DEFAULT_DATABASE_PORT, DEFAULT_HEALTH_CHECK_PORT,
    DEFAULT_LISTENER_PORT, PARAMETERS_STACK,
};
