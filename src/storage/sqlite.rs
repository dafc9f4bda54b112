use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use tracing::{debug, info};

use super::{RunRecord, Storage};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::graph::{AuditEntry, NodeId, ThoughtGraph, ThoughtNode};
use crate::orchestrator::RoundRecord;

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create an in-memory instance (single connection, so every query sees
    /// the same database)
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_run(&self, run: &RunRecord) -> StorageResult<()> {
        let terminal_reason = run
            .terminal_reason
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| query_error("terminal reason", e))?;

        sqlx::query(
            r#"
            INSERT INTO runs (id, problem, stage, stage_round, total_rounds, backtracks,
                              terminal_reason, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                stage = excluded.stage,
                stage_round = excluded.stage_round,
                total_rounds = excluded.total_rounds,
                backtracks = excluded.backtracks,
                terminal_reason = excluded.terminal_reason,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&run.id)
        .bind(&run.problem)
        .bind(run.stage.as_str())
        .bind(run.stage_round)
        .bind(run.total_rounds)
        .bind(run.backtracks)
        .bind(&terminal_reason)
        .bind(run.created_at.to_rfc3339())
        .bind(run.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, id: &str) -> StorageResult<Option<RunRecord>> {
        let row: Option<RunRow> = sqlx::query_as(
            r#"
            SELECT id, problem, stage, stage_round, total_rounds, backtracks,
                   terminal_reason, created_at, updated_at
            FROM runs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRecord::try_from).transpose()
    }

    async fn list_runs(&self, limit: u32) -> StorageResult<Vec<RunRecord>> {
        let rows: Vec<RunRow> = sqlx::query_as(
            r#"
            SELECT id, problem, stage, stage_round, total_rounds, backtracks,
                   terminal_reason, created_at, updated_at
            FROM runs
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RunRecord::try_from).collect()
    }

    async fn upsert_nodes(&self, run_id: &str, nodes: &[ThoughtNode]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        for node in nodes {
            let metadata = node
                .metadata
                .as_ref()
                .map(|m| serde_json::to_string(m).unwrap_or_default());

            sqlx::query(
                r#"
                INSERT INTO thought_nodes (run_id, id, author, stage, kind, content, status,
                                           score, sequence, created_at, metadata)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(run_id, id) DO UPDATE SET status = excluded.status
                "#,
            )
            .bind(run_id)
            .bind(node.id.0 as i64)
            .bind(node.author.to_string())
            .bind(node.stage.as_str())
            .bind(node.kind.as_str())
            .bind(&node.content)
            .bind(node.status.as_str())
            .bind(node.score)
            .bind(node.sequence as i64)
            .bind(node.created_at.to_rfc3339())
            .bind(&metadata)
            .execute(&mut *tx)
            .await?;

            for parent in &node.parents {
                sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO node_parents (run_id, node_id, parent_id)
                    VALUES (?, ?, ?)
                    "#,
                )
                .bind(run_id)
                .bind(node.id.0 as i64)
                .bind(parent.0 as i64)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        debug!(run_id = %run_id, nodes = nodes.len(), "Nodes persisted");
        Ok(())
    }

    async fn load_graph(&self, run_id: &str) -> StorageResult<ThoughtGraph> {
        let rows: Vec<NodeRow> = sqlx::query_as(
            r#"
            SELECT id, author, stage, kind, content, status, score, sequence, created_at, metadata
            FROM thought_nodes
            WHERE run_id = ?
            ORDER BY sequence ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() && self.get_run(run_id).await?.is_none() {
            return Err(StorageError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }

        let edges: Vec<(i64, i64)> =
            sqlx::query_as("SELECT node_id, parent_id FROM node_parents WHERE run_id = ?")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await?;

        let mut parents: HashMap<i64, BTreeSet<NodeId>> = HashMap::new();
        for (node_id, parent_id) in edges {
            parents
                .entry(node_id)
                .or_default()
                .insert(NodeId(parent_id as u64));
        }

        let nodes = rows
            .into_iter()
            .map(|row| {
                let node_parents = parents.remove(&row.id).unwrap_or_default();
                row.into_node(node_parents)
            })
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(ThoughtGraph::restore(nodes)?)
    }

    async fn append_audit(&self, run_id: &str, entries: &[AuditEntry]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            let action =
                serde_json::to_string(&entry.action).map_err(|e| query_error("audit action", e))?;

            sqlx::query(
                r#"
                INSERT OR IGNORE INTO audit_log (run_id, entry_offset, node_id, action,
                                                 previous_status, next_status, timestamp)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind(entry.offset as i64)
            .bind(entry.node_id.0 as i64)
            .bind(&action)
            .bind(entry.previous.map(|s| s.as_str()))
            .bind(entry.next.as_str())
            .bind(entry.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_audit_log(&self, run_id: &str) -> StorageResult<Vec<AuditEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            r#"
            SELECT entry_offset, node_id, action, previous_status, next_status, timestamp
            FROM audit_log
            WHERE run_id = ?
            ORDER BY entry_offset ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditEntry::try_from).collect()
    }

    async fn save_round(&self, run_id: &str, round: &RoundRecord) -> StorageResult<()> {
        let record = serde_json::to_string(round).map_err(|e| query_error("round record", e))?;
        let decision = round.verdict.as_ref().map(|v| v.decision.to_string());

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO rounds (run_id, idx, stage, round, decision, record, closed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(round.index)
        .bind(round.outcome.stage.as_str())
        .bind(round.outcome.round)
        .bind(&decision)
        .bind(&record)
        .bind(round.outcome.closed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_rounds(&self, run_id: &str) -> StorageResult<Vec<RoundRecord>> {
        let records: Vec<(String,)> =
            sqlx::query_as("SELECT record FROM rounds WHERE run_id = ? ORDER BY idx ASC")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await?;

        records
            .into_iter()
            .map(|(record,)| {
                serde_json::from_str(&record).map_err(|e| query_error("round record", e))
            })
            .collect()
    }
}

fn query_error(what: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::Query {
        message: format!("Invalid {}: {}", what, e),
    }
}

fn parse_column<T: FromStr<Err = String>>(value: &str) -> StorageResult<T> {
    value.parse().map_err(|message| StorageError::Query { message })
}

fn parse_timestamp(value: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| query_error("timestamp", e))
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    problem: String,
    stage: String,
    stage_round: i64,
    total_rounds: i64,
    backtracks: i64,
    terminal_reason: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = StorageError;

    fn try_from(row: RunRow) -> StorageResult<Self> {
        let terminal_reason = row
            .terminal_reason
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| query_error("terminal reason", e))?;

        Ok(Self {
            stage: parse_column(&row.stage)?,
            id: row.id,
            problem: row.problem,
            stage_round: row.stage_round as u32,
            total_rounds: row.total_rounds as u32,
            backtracks: row.backtracks as u32,
            terminal_reason,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: i64,
    author: String,
    stage: String,
    kind: String,
    content: String,
    status: String,
    score: f64,
    sequence: i64,
    created_at: String,
    metadata: Option<String>,
}

impl NodeRow {
    fn into_node(self, parents: BTreeSet<NodeId>) -> StorageResult<ThoughtNode> {
        Ok(ThoughtNode {
            id: NodeId(self.id as u64),
            author: parse_column(&self.author)?,
            stage: parse_column(&self.stage)?,
            kind: parse_column(&self.kind)?,
            content: self.content,
            parents,
            status: parse_column(&self.status)?,
            score: self.score,
            sequence: self.sequence as u64,
            created_at: parse_timestamp(&self.created_at)?,
            metadata: self.metadata.and_then(|s| serde_json::from_str(&s).ok()),
        })
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    entry_offset: i64,
    node_id: i64,
    action: String,
    previous_status: Option<String>,
    next_status: String,
    timestamp: String,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = StorageError;

    fn try_from(row: AuditRow) -> StorageResult<Self> {
        Ok(Self {
            offset: row.entry_offset as u64,
            node_id: NodeId(row.node_id as u64),
            action: serde_json::from_str(&row.action)
                .map_err(|e| query_error("audit action", e))?,
            previous: row
                .previous_status
                .as_deref()
                .map(parse_column)
                .transpose()?,
            next: parse_column(&row.next_status)?,
            timestamp: parse_timestamp(&row.timestamp)?,
        })
    }
}
