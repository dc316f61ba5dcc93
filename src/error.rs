//! Error types for graph construction and evaluation.

use std::fmt;

/// System-level graph errors.
///
/// These are distinct from user domain errors, which a derived node can
/// model in its output type (e.g., `type Output = Result<T, MyError>`).
/// Cancellation is deliberately *not* represented here: a cancelled commit
/// returns an inconsistent snapshot whose pending-change set names the
/// nodes that were not processed.
#[derive(Debug, Clone)]
pub enum GraphError {
    /// The staged configuration contains a dependency cycle.
    ///
    /// Fatal for the build; no snapshot is produced. The `path` contains
    /// the node names along the cycle in visit order.
    CircularDependency {
        /// Node names forming the cycle.
        path: Vec<String>,
    },

    /// A derived node references a dependency that is not part of the
    /// configuration.
    MissingDependency {
        /// Name of the node whose dependency list is broken.
        node: String,
        /// Name of the dependency that could not be found.
        dependency: String,
    },

    /// An input node rejected a value passed to `change_value`.
    ///
    /// The snapshot is left untouched.
    InvalidInputValue {
        /// Name of the input node.
        node: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The node is not part of the snapshot it was used with.
    UnknownNode {
        /// Name of the offending node.
        name: String,
    },

    /// An operation was used outside its supported state, e.g. writing to
    /// a derived node or binding a placeholder twice.
    InvalidOperation {
        /// Description of the violated constraint.
        reason: String,
    },

    /// A derived node's `calculate` failed.
    ///
    /// The commit that observed the failure installs nothing.
    Calculation {
        /// Name of the failing node.
        node: String,
        /// Rendered failure.
        message: String,
    },
}

impl GraphError {
    pub(crate) fn invalid_op(reason: impl Into<String>) -> Self {
        GraphError::InvalidOperation {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::CircularDependency { path } => {
                write!(f, "circular dependency detected: {}", path.join(" -> "))
            }
            GraphError::MissingDependency { node, dependency } => {
                write!(f, "node {node:?} depends on unregistered node {dependency:?}")
            }
            GraphError::InvalidInputValue { node, reason } => {
                write!(f, "invalid value for input {node:?}: {reason}")
            }
            GraphError::UnknownNode { name } => {
                write!(f, "node {name:?} is not part of this snapshot")
            }
            GraphError::InvalidOperation { reason } => {
                write!(f, "invalid operation: {reason}")
            }
            GraphError::Calculation { node, message } => {
                write!(f, "calculation of {node:?} failed: {message}")
            }
        }
    }
}

impl std::error::Error for GraphError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_cycle() {
        let err = GraphError::CircularDependency {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "circular dependency detected: a -> b -> a");
    }

    #[test]
    fn display_names_the_offending_nodes() {
        let err = GraphError::MissingDependency {
            node: "sum".into(),
            dependency: "ghost".into(),
        };
        assert_eq!(
            err.to_string(),
            "node \"sum\" depends on unregistered node \"ghost\""
        );
        let err = GraphError::Calculation {
            node: "sum".into(),
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "calculation of \"sum\" failed: boom");
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GraphError>();
    }
}
