//! Storage layer for run persistence.
//!
//! A run is stored as a `runs` row plus its thought nodes, derivation edges,
//! audit log and closed rounds, keyed by run id, node id and sequence number.
//! That is enough to rebuild the thought graph and replay the run's history.

mod sqlite;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;
use crate::graph::{AuditEntry, ThoughtGraph, ThoughtNode};
use crate::orchestrator::RoundRecord;
use crate::workflow::{TerminalReason, WorkflowStage};

/// Persisted run header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run identifier.
    pub id: String,
    /// The problem statement the run started from.
    pub problem: String,
    /// Active (or last active) stage.
    pub stage: WorkflowStage,
    pub stage_round: u32,
    pub total_rounds: u32,
    pub backtracks: u32,
    /// Set once the run has terminated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<TerminalReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// Whether the run has terminated.
    pub fn is_terminated(&self) -> bool {
        self.terminal_reason.is_some()
    }
}

/// Storage trait for run persistence.
///
/// Every write is idempotent: saving the same run, nodes, audit entries or
/// round twice leaves the store unchanged.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert or update a run header.
    async fn save_run(&self, run: &RunRecord) -> StorageResult<()>;
    /// Get a run header by ID.
    async fn get_run(&self, id: &str) -> StorageResult<Option<RunRecord>>;
    /// List the most recent runs, newest first.
    async fn list_runs(&self, limit: u32) -> StorageResult<Vec<RunRecord>>;

    /// Insert or update thought nodes (status changes) and their parent edges.
    async fn upsert_nodes(&self, run_id: &str, nodes: &[ThoughtNode]) -> StorageResult<()>;
    /// Rebuild the run's thought graph, validating every invariant.
    async fn load_graph(&self, run_id: &str) -> StorageResult<ThoughtGraph>;

    /// Append audit entries; entries already stored are skipped.
    async fn append_audit(&self, run_id: &str, entries: &[AuditEntry]) -> StorageResult<()>;
    /// Get the run's audit log in offset order.
    async fn get_audit_log(&self, run_id: &str) -> StorageResult<Vec<AuditEntry>>;

    /// Store a closed round.
    async fn save_round(&self, run_id: &str, round: &RoundRecord) -> StorageResult<()>;
    /// Get the run's closed rounds in order.
    async fn get_rounds(&self, run_id: &str) -> StorageResult<Vec<RoundRecord>>;
}
