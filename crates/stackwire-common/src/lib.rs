//! Common types for stackwire: errors, resource handles, the dependency graph,
//! grants and network rules
//!
//! Everything in this crate is plain data built during a single composition
//! pass. Nothing here talks to a provisioning engine.

#![deny(missing_docs)]

pub mod error;
pub mod grant;
pub mod graph;
pub mod handle;
pub mod health;
pub mod network;
pub mod policy;
pub mod resource;
pub mod stack;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port for PostgreSQL-compatible database clusters
pub const DEFAULT_DATABASE_PORT: u16 = 5432;

/// Default public listener port on the load balancer
pub const DEFAULT_LISTENER_PORT: u16 = 80;

/// Default port the application container serves traffic on
pub const DEFAULT_CONTAINER_PORT: u16 = 8080;

/// Default port for the liveness probe, separate from the traffic port
pub const DEFAULT_HEALTH_CHECK_PORT: u16 = 8081;

/// Pseudo-stack holding values resolved through the parameter store
pub const PARAMETERS_STACK: &str = "parameters";
