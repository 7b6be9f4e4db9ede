//! Error types for scheduling, locking, staging and persistence.

use crate::types::{ExecutionStatus, NodeStatus};
use serde_json::Error as JsonError;
use std::io::Error as IoError;
use std::result::Result as StdResult;
use thiserror::Error;
use toml::de::Error as TomlDeError;
use toml::ser::Error as TomlSerError;

/// Result type alias using `ExecutionError`.
pub type Result<T> = StdResult<T, ExecutionError>;

/// Errors raised by the execution core.
///
/// Only programming errors and timeouts are errors. Lock contention, merge
/// conflicts and deadlocks are reported as data by the operations that
/// observe them.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] JsonError),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] TomlDeError),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] TomlSerError),

    /// No execution is registered under this id
    #[error("Unknown execution: {0}")]
    UnknownExecution(String),

    /// The execution has no node with this id
    #[error("Unknown node {node_id} in execution {execution_id}")]
    UnknownNode {
        /// Execution that was searched
        execution_id: String,
        /// Node id that was not found
        node_id: String,
    },

    /// A node status change that the lifecycle does not allow
    #[error("Node {node_id} cannot move from {from} to {to}")]
    InvalidNodeTransition {
        /// Node whose transition was rejected
        node_id: String,
        /// Current status of the node
        from: NodeStatus,
        /// Requested status
        to: NodeStatus,
    },

    /// The execution is in a state that forbids the operation
    #[error("Execution {execution_id} is {status}; cannot {operation}")]
    InvalidExecutionState {
        /// Execution that rejected the operation
        execution_id: String,
        /// Its current status
        status: ExecutionStatus,
        /// The rejected operation
        operation: &'static str,
    },

    /// A queued lock request was not granted in time
    #[error(
        "Lock timeout for node {node_id} on resources {} after {timeout_ms}ms",
        .resources.join(", ")
    )]
    LockTimeout {
        /// Node that requested the locks
        node_id: String,
        /// Canonically sorted resources of the request
        resources: Vec<String>,
        /// Timeout that expired
        timeout_ms: u64,
    },

    /// A queued lock request was rejected by a shutdown or abort
    #[error(
        "Lock request for node {node_id} on resources {} was cancelled",
        .resources.join(", ")
    )]
    LockCancelled {
        /// Node that requested the locks
        node_id: String,
        /// Canonically sorted resources of the request
        resources: Vec<String>,
    },

    /// Staging workspace could not be created, read or removed
    #[error("Staging error: {0}")]
    Staging(String),

    /// Execution state could not be written or read
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl ExecutionError {
    /// Checks if retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Checks if this error reports a caller mistake rather than a runtime condition.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownExecution(_)
                | Self::UnknownNode { .. }
                | Self::InvalidNodeTransition { .. }
                | Self::InvalidExecutionState { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value as JsonValue, from_str};
    use std::io;

    #[test]
    fn test_error_display() {
        let timeout = ExecutionError::LockTimeout {
            node_id: "node2".to_owned(),
            resources: vec!["a.ts".to_owned(), "b.ts".to_owned()],
            timeout_ms: 1000,
        };
        assert_eq!(
            timeout.to_string(),
            "Lock timeout for node node2 on resources a.ts, b.ts after 1000ms"
        );

        let transition = ExecutionError::InvalidNodeTransition {
            node_id: "a".to_owned(),
            from: NodeStatus::Ready,
            to: NodeStatus::Completed,
        };
        assert_eq!(
            transition.to_string(),
            "Node a cannot move from ready to completed"
        );

        let state = ExecutionError::InvalidExecutionState {
            execution_id: "exec-1".to_owned(),
            status: ExecutionStatus::Aborted,
            operation: "complete a node",
        };
        assert_eq!(
            state.to_string(),
            "Execution exec-1 is aborted; cannot complete a node"
        );
    }

    #[test]
    fn test_error_classification() {
        let timeout = ExecutionError::LockTimeout {
            node_id: "n".to_owned(),
            resources: vec![],
            timeout_ms: 1,
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_programming_error());

        let unknown = ExecutionError::UnknownExecution("exec-x".to_owned());
        assert!(unknown.is_programming_error());
        assert!(!unknown.is_retryable());

        let cancelled = ExecutionError::LockCancelled {
            node_id: "n".to_owned(),
            resources: vec![],
        };
        assert!(!cancelled.is_retryable());
    }

    #[test]
    fn test_error_from_io() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: ExecutionError = io_error.into();
        assert!(matches!(error, ExecutionError::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let error: ExecutionError = match from_str::<JsonValue>("invalid json") {
            Ok(value) => panic!("expected parse failure, got {value}"),
            Err(json_error) => json_error.into(),
        };
        assert!(matches!(error, ExecutionError::Json(_)));
    }
}
