//! Synchronized thought graph store with an append-only audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use super::{NewThought, NodeId, NodeStatus, ThoughtGraph, ThoughtNode};
use crate::error::GraphResult;
use crate::workflow::WorkflowStage;

/// Kind of mutation recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AuditAction {
    /// A node was created (root or proposal).
    Created,
    /// A node's status changed.
    StatusChanged,
    /// An extra derivation edge from `parent` was added to the node.
    Linked {
        /// The new parent.
        parent: NodeId,
    },
}

impl AuditAction {
    /// Get the action name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::StatusChanged => "status_changed",
            AuditAction::Linked { .. } => "linked",
        }
    }
}

/// One entry of the append-only audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the log (0-based, gap-free).
    pub offset: u64,
    /// The node the mutation applied to.
    pub node_id: NodeId,
    /// What happened.
    pub action: AuditAction,
    /// Status before the mutation (`None` for creation).
    pub previous: Option<NodeStatus>,
    /// Status after the mutation.
    pub next: NodeStatus,
    /// When the mutation was applied.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StoreInner {
    graph: ThoughtGraph,
    audit: Vec<AuditEntry>,
}

impl StoreInner {
    fn record(
        &mut self,
        node_id: NodeId,
        action: AuditAction,
        previous: Option<NodeStatus>,
        next: NodeStatus,
    ) {
        let entry = AuditEntry {
            offset: self.audit.len() as u64,
            node_id,
            action,
            previous,
            next,
            timestamp: Utc::now(),
        };
        self.audit.push(entry);
    }
}

/// Thread-safe owner of node identity and edge integrity.
///
/// Writes are serialized behind a single lock, so a reader never observes a
/// partially applied mutation. Agents never hold the lock: they work on an
/// immutable [`snapshot`](ThoughtGraphStore::snapshot).
#[derive(Debug, Clone, Default)]
pub struct ThoughtGraphStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl ThoughtGraphStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from a restored graph and its audit log.
    pub fn from_parts(graph: ThoughtGraph, audit: Vec<AuditEntry>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner { graph, audit })),
        }
    }

    /// Create the root problem-statement node. Fails if a root exists.
    pub fn create_root(&self, content: impl Into<String>) -> GraphResult<NodeId> {
        let mut inner = self.write();
        let id = inner
            .graph
            .insert_root(WorkflowStage::ProblemDefinition, content.into())?;
        inner.record(id, AuditAction::Created, None, NodeStatus::Accepted);
        debug!(node_id = %id, "Root node created");
        Ok(id)
    }

    /// Admit a new `proposed` node.
    ///
    /// Fails with `InvalidParent` when a parent is missing (or none is given)
    /// and `CycleDetected` when the edges would close a cycle.
    pub fn propose(&self, thought: NewThought) -> GraphResult<NodeId> {
        let mut inner = self.write();
        let id = inner.graph.insert_proposal(thought)?;
        inner.record(id, AuditAction::Created, None, NodeStatus::Proposed);
        Ok(id)
    }

    /// Change a node's status, enforcing the allowed transitions.
    pub fn set_status(&self, id: NodeId, status: NodeStatus) -> GraphResult<NodeStatus> {
        let mut inner = self.write();
        let previous = inner.graph.update_status(id, status)?;
        inner.record(id, AuditAction::StatusChanged, Some(previous), status);
        Ok(previous)
    }

    /// Add a derivation edge `parent -> child` between two existing nodes.
    ///
    /// Graph-editing API for callers outside the round loop (importers,
    /// hand-built fixtures). The scheduler never calls it: agent output only
    /// enters through [`propose`](Self::propose), whose parents are fixed at
    /// creation. Persisted `Linked` entries restore through the node's
    /// parent set, not through this method.
    ///
    /// Returns `Ok(false)` if the edge already existed (no mutation, no audit).
    pub fn link(&self, parent: NodeId, child: NodeId) -> GraphResult<bool> {
        let mut inner = self.write();
        let added = inner.graph.add_edge(parent, child)?;
        if added {
            let status = inner
                .graph
                .get(child)
                .map(|n| n.status)
                .unwrap_or_default();
            inner.record(child, AuditAction::Linked { parent }, Some(status), status);
        }
        Ok(added)
    }

    /// Get a copy of a node.
    pub fn get(&self, id: NodeId) -> Option<ThoughtNode> {
        self.read().graph.get(id).cloned()
    }

    /// The root node id, if created.
    pub fn root_id(&self) -> Option<NodeId> {
        self.read().graph.root().map(|n| n.id)
    }

    /// Direct children of a node.
    pub fn children(&self, id: NodeId) -> Vec<ThoughtNode> {
        self.read().graph.children(id).into_iter().cloned().collect()
    }

    /// Accepted nodes at `stage` with no accepted children.
    pub fn frontier(&self, stage: WorkflowStage) -> Vec<ThoughtNode> {
        self.read().graph.frontier(stage).into_iter().cloned().collect()
    }

    /// Number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.read().graph.len()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.read().graph.is_empty()
    }

    /// An immutable copy of the current graph.
    pub fn snapshot(&self) -> Arc<ThoughtGraph> {
        Arc::new(self.read().graph.clone())
    }

    /// The full audit log.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.read().audit.clone()
    }

    /// Audit entries starting at `offset`.
    pub fn audit_since(&self, offset: u64) -> Vec<AuditEntry> {
        let inner = self.read();
        let start = (offset as usize).min(inner.audit.len());
        inner.audit[start..].to_vec()
    }

    /// Number of audit entries recorded so far.
    pub fn audit_len(&self) -> u64 {
        self.read().audit.len() as u64
    }

    // Mutations validate before applying and never panic mid-way, so a
    // poisoned lock still guards a consistent graph.
    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
