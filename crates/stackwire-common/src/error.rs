//! Error types for stackwire
//!
//! Every variant is a composition-time failure. Nothing here is retried: a
//! deployment either composes completely or not at all.

use thiserror::Error;

/// Main error type for stackwire operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A logical name or cross-stack output could not be found
    #[error("unresolved reference: {name}")]
    UnresolvedReference {
        /// The logical identifier that failed to resolve
        name: String,
    },

    /// A stack was composed without one of its required input handles
    #[error("missing handle for stack {stack}: {input}")]
    MissingHandle {
        /// Stack being composed
        stack: String,
        /// Name of the absent input
        input: String,
    },

    /// The same resource id was declared twice
    #[error("duplicate resource: {id}")]
    DuplicateResource {
        /// The conflicting resource id
        id: String,
    },

    /// The merged dependency graph contains a cycle
    #[error("dependency cycle: {}", path.join(" -> "))]
    DependencyCycle {
        /// Resource ids along the cycle, first id repeated at the end
        path: Vec<String>,
    },

    /// Batch validation found invariant violations
    #[error("validation error: {0}")]
    Validation(String),

    /// Addressing error (CIDR parsing, subnet placement, subnet selection)
    #[error("network error: {0}")]
    Network(String),

    /// Deployment configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create an unresolved reference error for a logical name
    pub fn unresolved(name: impl Into<String>) -> Self {
        Self::UnresolvedReference { name: name.into() }
    }

    /// Create a missing handle error
    pub fn missing_handle(stack: impl Into<String>, input: impl Into<String>) -> Self {
        Self::MissingHandle {
            stack: stack.into(),
            input: input.into(),
        }
    }

    /// Create a duplicate resource error
    pub fn duplicate(id: impl Into<String>) -> Self {
        Self::DuplicateResource { id: id.into() }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a network error with the given message
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Composition Failures Name What Went Wrong
    // ==========================================================================

    /// Story: an unregistered parameter aborts composition and names the key
    #[test]
    fn story_unresolved_reference_names_the_identifier() {
        let err = Error::unresolved("/shared/kms-key-arn");
        assert_eq!(err.to_string(), "unresolved reference: /shared/kms-key-arn");

        match err {
            Error::UnresolvedReference { name } => assert_eq!(name, "/shared/kms-key-arn"),
            _ => panic!("Expected UnresolvedReference variant"),
        }
    }

    /// Story: a stack composed without a borrowed handle says which one
    #[test]
    fn story_missing_handle_names_stack_and_input() {
        let err = Error::missing_handle("orders-app", "database");
        let msg = err.to_string();
        assert!(msg.contains("orders-app"));
        assert!(msg.contains("database"));
    }

    #[test]
    fn story_cycle_renders_path() {
        let err = Error::DependencyCycle {
            path: vec!["a/x".into(), "a/y".into(), "a/x".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a/x -> a/y -> a/x");
    }

    #[test]
    fn story_helpers_pick_the_right_variant() {
        assert!(matches!(Error::validation("x"), Error::Validation(_)));
        assert!(matches!(Error::network("x"), Error::Network(_)));
        assert!(matches!(Error::config("x"), Error::Config(_)));
        assert!(matches!(Error::serialization("x"), Error::Serialization(_)));
        assert!(matches!(
            Error::duplicate("a/b"),
            Error::DuplicateResource { .. }
        ));
    }
}
