//! Integration tests for SQLite storage layer
//!
//! Tests run persistence using an in-memory SQLite database, plus one
//! file-backed database to check that a run survives reopening.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use think_tank::agents::{Agent, Persona, ScriptStep, ScriptedAgent};
use think_tank::config::{DatabaseConfig, OrchestrationConfig};
use think_tank::error::{StorageError, StorageResult};
use think_tank::graph::{
    AuditEntry, NewThought, NodeStatus, ThoughtGraph, ThoughtGraphStore, ThoughtKind, ThoughtNode,
};
use think_tank::orchestrator::{Orchestrator, RoundRecord};
use think_tank::scheduler::TurnScheduler;
use think_tank::storage::{RunRecord, SqliteStorage, Storage};
use think_tank::workflow::{TerminalReason, Transition, WorkflowStage};

/// Create an in-memory storage instance for testing
async fn create_test_storage() -> SqliteStorage {
    SqliteStorage::new_in_memory()
        .await
        .expect("Failed to create in-memory storage")
}

fn run_record(id: &str) -> RunRecord {
    let now = Utc::now();
    RunRecord {
        id: id.to_string(),
        problem: "Should we enter market X?".to_string(),
        stage: WorkflowStage::ProblemDefinition,
        stage_round: 0,
        total_rounds: 0,
        backtracks: 0,
        terminal_reason: None,
        created_at: now,
        updated_at: now,
    }
}

/// Small graph: root, two brainstorm proposals, a critique and an extra link.
fn sample_store() -> ThoughtGraphStore {
    let store = ThoughtGraphStore::new();
    let root = store.create_root("Should we enter market X?").unwrap();

    let a = store
        .propose(
            NewThought::new(
                vec![root],
                Persona::CreativeThinker,
                WorkflowStage::Brainstorming,
                "Partner with a local distributor",
            )
                .with_score(0.8)
                .with_metadata(json!({"sources": ["survey-2024"]})),
        )
        .unwrap();
    let b = store
        .propose(
            NewThought::new(
                vec![root],
                Persona::Researcher,
                WorkflowStage::Brainstorming,
                "Acquire a regional player",
            )
                .with_score(0.7),
        )
        .unwrap();
    store
        .propose(
            NewThought::new(
                vec![a],
                Persona::Challenger,
                WorkflowStage::Brainstorming,
                "Distributor margins are thin",
            )
                .with_kind(ThoughtKind::Critique)
                .with_score(0.4),
        )
        .unwrap();

    store.set_status(a, NodeStatus::Accepted).unwrap();
    store.set_status(b, NodeStatus::Rejected).unwrap();
    store.link(a, b).unwrap();
    store
}

fn nodes_of(store: &ThoughtGraphStore) -> Vec<ThoughtNode> {
    store.snapshot().nodes().cloned().collect()
}

/// Scripted agents that all answer with one confident thought.
fn confident_scheduler() -> TurnScheduler {
    let agents = Persona::ALL.iter().map(|persona| {
        Arc::new(ScriptedAgent::new(
            *persona,
            vec![ScriptStep::thought(format!("{} view", persona), 0.8)],
        )) as Arc<dyn Agent>
    });
    TurnScheduler::new(agents, Duration::from_secs(5), 3)
}

/// SQLite storage whose `upsert_nodes` fails on the given call (0-based).
struct FlakyStorage {
    inner: SqliteStorage,
    fail_on_call: usize,
    upsert_calls: AtomicUsize,
}

impl FlakyStorage {
    async fn failing_on(fail_on_call: usize) -> Self {
        Self {
            inner: create_test_storage().await,
            fail_on_call,
            upsert_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn save_run(&self, run: &RunRecord) -> StorageResult<()> {
        self.inner.save_run(run).await
    }

    async fn get_run(&self, id: &str) -> StorageResult<Option<RunRecord>> {
        self.inner.get_run(id).await
    }

    async fn list_runs(&self, limit: u32) -> StorageResult<Vec<RunRecord>> {
        self.inner.list_runs(limit).await
    }

    async fn upsert_nodes(&self, run_id: &str, nodes: &[ThoughtNode]) -> StorageResult<()> {
        if self.upsert_calls.fetch_add(1, Ordering::SeqCst) == self.fail_on_call {
            return Err(StorageError::Query {
                message: "database is locked".to_string(),
            });
        }
        self.inner.upsert_nodes(run_id, nodes).await
    }

    async fn load_graph(&self, run_id: &str) -> StorageResult<ThoughtGraph> {
        self.inner.load_graph(run_id).await
    }

    async fn append_audit(&self, run_id: &str, entries: &[AuditEntry]) -> StorageResult<()> {
        self.inner.append_audit(run_id, entries).await
    }

    async fn get_audit_log(&self, run_id: &str) -> StorageResult<Vec<AuditEntry>> {
        self.inner.get_audit_log(run_id).await
    }

    async fn save_round(&self, run_id: &str, round: &RoundRecord) -> StorageResult<()> {
        self.inner.save_round(run_id, round).await
    }

    async fn get_rounds(&self, run_id: &str) -> StorageResult<Vec<RoundRecord>> {
        self.inner.get_rounds(run_id).await
    }
}

#[cfg(test)]
mod run_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_save_and_get_run() {
        let storage = create_test_storage().await;

        let run = run_record("run-1");
        storage.save_run(&run).await.unwrap();

        let retrieved = storage.get_run("run-1").await.unwrap();
        assert_eq!(retrieved, Some(run));
    }

    #[tokio::test]
    async fn test_get_nonexistent_run() {
        let storage = create_test_storage().await;

        let result = storage.get_run("nonexistent-id").await.unwrap();

        assert!(result.is_none(), "Should return None for nonexistent run");
    }

    #[tokio::test]
    async fn test_save_run_updates_progress_and_terminal_reason() {
        let storage = create_test_storage().await;

        let mut run = run_record("run-1");
        storage.save_run(&run).await.unwrap();

        run.stage = WorkflowStage::Analysis;
        run.stage_round = 5;
        run.total_rounds = 7;
        run.backtracks = 1;
        run.terminal_reason = Some(TerminalReason::Fatal {
            message: "stage analysis has no input frontier".to_string(),
        });
        run.updated_at = run.updated_at + ChronoDuration::seconds(3);
        storage.save_run(&run).await.unwrap();

        let retrieved = storage.get_run("run-1").await.unwrap().unwrap();
        assert_eq!(retrieved, run);
        assert!(retrieved.is_terminated());
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_a_query_error() {
        let storage = create_test_storage().await;
        storage.save_run(&run_record("run-1")).await.unwrap();

        sqlx::query("UPDATE runs SET created_at = 'yesterday-ish' WHERE id = ?")
            .bind("run-1")
            .execute(storage.pool())
            .await
            .unwrap();

        let result = storage.get_run("run-1").await;
        match result {
            Err(StorageError::Query { message }) => assert!(message.contains("timestamp")),
            other => panic!("Expected query error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_runs_newest_first_with_limit() {
        let storage = create_test_storage().await;

        let base = Utc::now();
        for (i, id) in ["run-a", "run-b", "run-c"].iter().enumerate() {
            let mut run = run_record(id);
            run.created_at = base + ChronoDuration::seconds(i as i64);
            run.updated_at = run.created_at;
            storage.save_run(&run).await.unwrap();
        }

        let runs = storage.list_runs(2).await.unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["run-c", "run-b"]);
    }
}

#[cfg(test)]
mod graph_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_graph_round_trip() {
        let storage = create_test_storage().await;
        storage.save_run(&run_record("run-1")).await.unwrap();

        let store = sample_store();
        storage.upsert_nodes("run-1", &nodes_of(&store)).await.unwrap();

        let graph = storage.load_graph("run-1").await.unwrap();
        let restored: Vec<ThoughtNode> = graph.nodes().cloned().collect();
        assert_eq!(restored, nodes_of(&store));
        assert!(graph.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_upsert_updates_status_and_adds_links() {
        let storage = create_test_storage().await;
        storage.save_run(&run_record("run-1")).await.unwrap();

        let store = ThoughtGraphStore::new();
        let root = store.create_root("p").unwrap();
        let a = store
            .propose(
                NewThought::new(
                    vec![root],
                    Persona::Strategist,
                    WorkflowStage::ProblemDefinition,
                    "Frame",
                )
                    .with_score(0.9),
            )
            .unwrap();
        let b = store
            .propose(
                NewThought::new(
                    vec![root],
                    Persona::Analyst,
                    WorkflowStage::ProblemDefinition,
                    "Scope",
                )
                    .with_score(0.7),
            )
            .unwrap();
        storage.upsert_nodes("run-1", &nodes_of(&store)).await.unwrap();

        store.set_status(a, NodeStatus::Accepted).unwrap();
        store.link(a, b).unwrap();
        storage.upsert_nodes("run-1", &nodes_of(&store)).await.unwrap();

        let graph = storage.load_graph("run-1").await.unwrap();
        assert_eq!(graph.get(a).unwrap().status, NodeStatus::Accepted);
        assert!(graph.get(b).unwrap().parents.contains(&a));
        assert_eq!(graph.get(b).unwrap().parents.len(), 2);
        assert_eq!(graph.children(a).len(), 1);
    }

    #[tokio::test]
    async fn test_load_graph_unknown_run() {
        let storage = create_test_storage().await;

        let result = storage.load_graph("missing").await;

        assert!(matches!(result, Err(StorageError::RunNotFound { run_id }) if run_id == "missing"));
    }

    #[tokio::test]
    async fn test_load_graph_for_run_without_nodes_is_empty() {
        let storage = create_test_storage().await;
        storage.save_run(&run_record("run-1")).await.unwrap();

        let graph = storage.load_graph("run-1").await.unwrap();
        assert!(graph.is_empty());
    }
}

#[cfg(test)]
mod audit_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_audit_log_round_trip() {
        let storage = create_test_storage().await;
        storage.save_run(&run_record("run-1")).await.unwrap();

        let store = sample_store();
        storage.append_audit("run-1", &store.audit_log()).await.unwrap();

        let log = storage.get_audit_log("run-1").await.unwrap();
        assert_eq!(log, store.audit_log());
    }

    #[tokio::test]
    async fn test_append_audit_is_idempotent() {
        let storage = create_test_storage().await;
        storage.save_run(&run_record("run-1")).await.unwrap();

        let store = sample_store();
        let log = store.audit_log();
        storage.append_audit("run-1", &log[..3]).await.unwrap();
        storage.append_audit("run-1", &log).await.unwrap();
        storage.append_audit("run-1", &log).await.unwrap();

        let stored = storage.get_audit_log("run-1").await.unwrap();
        assert_eq!(stored.len(), log.len());
        let offsets: Vec<u64> = stored.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, (0..log.len() as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_audit_logs_are_scoped_per_run() {
        let storage = create_test_storage().await;
        storage.save_run(&run_record("run-1")).await.unwrap();
        storage.save_run(&run_record("run-2")).await.unwrap();

        storage.append_audit("run-1", &sample_store().audit_log()).await.unwrap();

        assert!(storage.get_audit_log("run-2").await.unwrap().is_empty());
    }
}

#[cfg(test)]
mod orchestrated_run_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_orchestrator_persists_the_whole_run() {
        let storage = Arc::new(create_test_storage().await);

        let run = Orchestrator::new(OrchestrationConfig::default(), confident_scheduler())
            .with_storage(storage.clone())
            .run("Should we enter market X?")
            .await
            .unwrap();
        assert_eq!(run.terminal_reason(), Some(&TerminalReason::Converged));

        let record = storage.get_run(run.run_id()).await.unwrap().unwrap();
        assert_eq!(record.terminal_reason, Some(TerminalReason::Converged));
        assert_eq!(record.total_rounds, run.total_rounds());
        assert_eq!(record.stage, WorkflowStage::Action);

        let graph = storage.load_graph(run.run_id()).await.unwrap();
        let restored: Vec<ThoughtNode> = graph.nodes().cloned().collect();
        assert_eq!(restored, nodes_of(run.store()));

        let audit = storage.get_audit_log(run.run_id()).await.unwrap();
        assert_eq!(audit, run.store().audit_log());

        let rounds = storage.get_rounds(run.run_id()).await.unwrap();
        assert_eq!(rounds.len(), run.rounds().len());
        for (stored, live) in rounds.iter().zip(run.rounds()) {
            assert_eq!(stored.index, live.index);
            assert_eq!(stored.transition, live.transition);
            assert_eq!(stored.outcome.submitted, live.outcome.submitted);
            assert_eq!(
                stored.verdict.as_ref().map(|v| &v.decision),
                live.verdict.as_ref().map(|v| &v.decision)
            );
        }
        assert!(matches!(
            rounds.last().map(|r| &r.transition),
            Some(Transition::Terminated { reason: TerminalReason::Converged, .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_on_the_next_round() {
        // Call 0 stores the root; call 1 carries the first round's nodes.
        let storage = Arc::new(FlakyStorage::failing_on(1).await);

        let run = Orchestrator::new(OrchestrationConfig::default(), confident_scheduler())
            .with_storage(storage.clone())
            .run("Should we enter market X?")
            .await
            .unwrap();
        assert_eq!(run.terminal_reason(), Some(&TerminalReason::Converged));
        assert!(storage.upsert_calls.load(Ordering::SeqCst) > 2);

        let audit = storage.get_audit_log(run.run_id()).await.unwrap();
        assert_eq!(audit, run.store().audit_log());

        let graph = storage.load_graph(run.run_id()).await.unwrap();
        let restored: Vec<ThoughtNode> = graph.nodes().cloned().collect();
        assert_eq!(restored, nodes_of(run.store()));

        let rounds = storage.get_rounds(run.run_id()).await.unwrap();
        assert_eq!(rounds.len(), run.rounds().len());
    }

    #[tokio::test]
    async fn test_file_backed_run_survives_reopen() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = DatabaseConfig {
            path: dir.path().join("nested").join("runs.db"),
            max_connections: 2,
        };

        let run_id = {
            let storage = Arc::new(SqliteStorage::new(&config).await.unwrap());
            let run = Orchestrator::new(OrchestrationConfig::default(), confident_scheduler())
                .with_storage(storage.clone())
                .run("Should we enter market X?")
                .await
                .unwrap();
            storage.pool().close().await;
            run.run_id().to_string()
        };

        let reopened = SqliteStorage::new(&config).await.unwrap();
        let record = reopened.get_run(&run_id).await.unwrap().unwrap();
        assert!(record.is_terminated());

        let graph = reopened.load_graph(&run_id).await.unwrap();
        assert!(graph.root().is_some());
        assert!(graph.len() > 1);
    }
}
