//! Run aggregate owned by the orchestration driver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::agents::{Persona, RunSnapshot};
use crate::convergence::Verdict;
use crate::graph::{Author, NodeId, NodeStatus, ThoughtGraph, ThoughtGraphStore, ThoughtNode};
use crate::scheduler::RoundOutcome;
use crate::storage::RunRecord;
use crate::workflow::{
    StageChange, TerminalReason, Transition, WorkflowState, WorkflowStage, WorkflowStateMachine,
};

/// Preview length for frontier entries.
const PREVIEW_CHARS: usize = 160;

/// A closed round: what the agents did, how it was resolved, where it led.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// Position in the run (0-based).
    pub index: u32,
    pub outcome: RoundOutcome,
    /// `None` when the round was escalated without evaluation.
    pub verdict: Option<Verdict>,
    pub transition: Transition,
}

/// Compact view of an accepted leaf node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierEntry {
    pub id: NodeId,
    pub stage: WorkflowStage,
    pub author: Author,
    pub score: f64,
    pub preview: String,
}

impl From<&ThoughtNode> for FrontierEntry {
    fn from(node: &ThoughtNode) -> Self {
        Self {
            id: node.id,
            stage: node.stage,
            author: node.author,
            score: node.score,
            preview: node.preview(PREVIEW_CHARS),
        }
    }
}

/// Frontier of `stage` as summary entries.
pub fn frontier_summary(graph: &ThoughtGraph, stage: WorkflowStage) -> Vec<FrontierEntry> {
    graph.frontier(stage).into_iter().map(FrontierEntry::from).collect()
}

/// Serializable outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub problem: String,
    pub stage: WorkflowStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<TerminalReason>,
    pub converged: bool,
    pub total_rounds: u32,
    pub backtracks: u32,
    pub node_count: usize,
    pub accepted_count: usize,
    /// Personas with at least one admitted node, in priority order.
    #[serde(default)]
    pub contributors: Vec<Persona>,
    /// Frontier of the furthest stage that has one.
    pub outcome: Vec<FrontierEntry>,
}

impl RunSummary {
    /// Summarize a persisted run header plus its graph.
    pub fn new(record: &RunRecord, graph: &ThoughtGraph) -> Self {
        let outcome = WorkflowStage::ALL
            .iter()
            .rev()
            .map(|stage| frontier_summary(graph, *stage))
            .find(|frontier| !frontier.is_empty())
            .unwrap_or_default();

        Self {
            run_id: record.id.clone(),
            problem: record.problem.clone(),
            stage: record.stage,
            terminal_reason: record.terminal_reason.clone(),
            converged: record
                .terminal_reason
                .as_ref()
                .is_some_and(TerminalReason::is_success),
            total_rounds: record.total_rounds,
            backtracks: record.backtracks,
            node_count: graph.len(),
            accepted_count: graph
                .nodes()
                .filter(|n| n.status == NodeStatus::Accepted)
                .count(),
            contributors: Persona::ALL
                .iter()
                .copied()
                .filter(|p| !graph.by_agent(Author::Agent(*p)).is_empty())
                .collect(),
            outcome,
        }
    }
}

/// Aggregate state of one run.
///
/// Created from a single root node at run start and mutated only by the
/// driver. Terminal runs keep their partial graph for inspection.
#[derive(Debug, Clone)]
pub struct RunState {
    run_id: String,
    problem: String,
    root_id: NodeId,
    pub(super) machine: WorkflowStateMachine,
    pub(super) total_rounds: u32,
    pub(super) accepted_in_visit: usize,
    pub(super) rounds: Vec<RoundRecord>,
    /// Audit entries already forwarded to the event sink.
    pub(super) audit_offset: u64,
    /// Audit entries (and the nodes they touched) known to be stored.
    pub(super) persisted_audit_offset: u64,
    /// Round records known to be stored.
    pub(super) persisted_rounds: usize,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    store: ThoughtGraphStore,
}

impl RunState {
    pub(super) fn new(
        run_id: String,
        problem: String,
        root_id: NodeId,
        store: ThoughtGraphStore,
        machine: WorkflowStateMachine,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            problem,
            root_id,
            machine,
            total_rounds: 0,
            accepted_in_visit: 0,
            rounds: Vec::new(),
            audit_offset: 0,
            persisted_audit_offset: 0,
            persisted_rounds: 0,
            started_at: now,
            updated_at: now,
            store,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn problem(&self) -> &str {
        &self.problem
    }

    pub fn root_id(&self) -> NodeId {
        self.root_id
    }

    pub fn state(&self) -> &WorkflowState {
        self.machine.state()
    }

    pub fn stage(&self) -> WorkflowStage {
        self.machine.stage()
    }

    pub fn stage_round(&self) -> u32 {
        self.machine.stage_round()
    }

    pub fn total_rounds(&self) -> u32 {
        self.total_rounds
    }

    pub fn backtracks(&self) -> u32 {
        self.machine.backtracks()
    }

    pub fn is_terminated(&self) -> bool {
        self.machine.is_terminated()
    }

    pub fn terminal_reason(&self) -> Option<&TerminalReason> {
        self.machine.terminal_reason()
    }

    /// Stage changes so far.
    pub fn history(&self) -> &[StageChange] {
        self.machine.history()
    }

    /// Closed rounds in order.
    pub fn rounds(&self) -> &[RoundRecord] {
        &self.rounds
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The run's thought graph store.
    pub fn store(&self) -> &ThoughtGraphStore {
        &self.store
    }

    /// Immutable copy of the current graph.
    pub fn graph(&self) -> Arc<ThoughtGraph> {
        self.store.snapshot()
    }

    /// Read-only view handed to agents.
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            problem: self.problem.clone(),
            stage: self.stage(),
            stage_round: self.stage_round(),
            total_rounds: self.total_rounds,
            backtracks: self.backtracks(),
            graph: self.store.snapshot(),
        }
    }

    pub(super) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Persisted header for this run.
    pub fn record(&self) -> RunRecord {
        RunRecord {
            id: self.run_id.clone(),
            problem: self.problem.clone(),
            stage: self.stage(),
            stage_round: self.stage_round(),
            total_rounds: self.total_rounds,
            backtracks: self.backtracks(),
            terminal_reason: self.terminal_reason().cloned(),
            created_at: self.started_at,
            updated_at: self.updated_at,
        }
    }

    /// Serializable summary of the run.
    pub fn summary(&self) -> RunSummary {
        RunSummary::new(&self.record(), &self.graph())
    }
}
