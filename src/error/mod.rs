use thiserror::Error;

use crate::agents::Persona;
use crate::graph::{NodeId, NodeStatus};
use crate::workflow::WorkflowStage;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Langbase error: {0}")]
    Langbase(#[from] LangbaseError),

    #[error("Thought graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

/// Thought graph store errors.
///
/// These are structural errors scoped to the offending call. They never
/// abort a round: a refused proposal is simply not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Invalid parent {parent}: {reason}")]
    InvalidParent { parent: NodeId, reason: String },

    #[error("Edge {parent} -> {child} would create a cycle")]
    CycleDetected { parent: NodeId, child: NodeId },

    #[error("Invalid status transition for node {node_id}: {from} -> {to}")]
    InvalidStatusTransition {
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("Root already exists: {root_id}")]
    RootExists { root_id: NodeId },

    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: NodeId },

    #[error("Corrupt graph record: {message}")]
    Corrupt { message: String },
}

/// Per-agent failure. Recovered by treating the agent's contribution as empty.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("Agent {persona} unavailable: {reason}")]
    Unavailable { persona: Persona, reason: String },
}

/// Workflow state machine errors (logic errors in transition requests).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("Cannot backtrack from {from} to {to}: target must be an earlier stage")]
    InvalidBacktrack {
        from: WorkflowStage,
        to: WorkflowStage,
    },

    #[error("Workflow already terminated")]
    AlreadyTerminated,
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Stored graph is invalid: {0}")]
    Graph(#[from] GraphError),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Langbase API errors (the model-invocation failure surface)
#[derive(Debug, Error)]
pub enum LangbaseError {
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for thought graph operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for Langbase operations
pub type LangbaseResult<T> = Result<T, LangbaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");
    }

    #[test]
    fn test_graph_error_display() {
        let err = GraphError::InvalidParent {
            parent: NodeId(7),
            reason: "does not exist".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid parent n7: does not exist");

        let err = GraphError::CycleDetected {
            parent: NodeId(3),
            child: NodeId(1),
        };
        assert_eq!(err.to_string(), "Edge n3 -> n1 would create a cycle");

        let err = GraphError::InvalidStatusTransition {
            node_id: NodeId(2),
            from: NodeStatus::Rejected,
            to: NodeStatus::Accepted,
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition for node n2: rejected -> accepted"
        );

        let err = GraphError::RootExists { root_id: NodeId(0) };
        assert_eq!(err.to_string(), "Root already exists: n0");
    }

    #[test]
    fn test_agent_error_display() {
        let err = AgentError::Unavailable {
            persona: Persona::Challenger,
            reason: "retries exhausted".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Agent challenger unavailable: retries exhausted"
        );
    }

    #[test]
    fn test_workflow_error_display() {
        let err = WorkflowError::InvalidBacktrack {
            from: WorkflowStage::Brainstorming,
            to: WorkflowStage::Analysis,
        };
        assert_eq!(
            err.to_string(),
            "Cannot backtrack from brainstorming to analysis: target must be an earlier stage"
        );
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::RunNotFound {
            run_id: "run-123".to_string(),
        };
        assert_eq!(err.to_string(), "Run not found: run-123");

        let err = StorageError::Migration {
            message: "version mismatch".to_string(),
        };
        assert_eq!(err.to_string(), "Migration failed: version mismatch");
    }

    #[test]
    fn test_langbase_error_display() {
        let err = LangbaseError::Api {
            status: 401,
            message: "unauthorized".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 401 - unauthorized");

        let err = LangbaseError::Timeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "Request timeout after 5000ms");
    }

    #[test]
    fn test_error_conversions_to_app_error() {
        let app_err: AppError = GraphError::NodeNotFound { node_id: NodeId(4) }.into();
        assert!(matches!(app_err, AppError::Graph(_)));

        let app_err: AppError = LangbaseError::Timeout { timeout_ms: 1000 }.into();
        assert!(matches!(app_err, AppError::Langbase(_)));

        let app_err: AppError = WorkflowError::AlreadyTerminated.into();
        assert!(matches!(app_err, AppError::Workflow(_)));

        let app_err: AppError = StorageError::RunNotFound {
            run_id: "x".to_string(),
        }
        .into();
        assert!(matches!(app_err, AppError::Storage(_)));
    }
}
