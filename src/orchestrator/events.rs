//! Progress events and the sinks that receive them.
//!
//! Sinks are append-only observers: emitting never fails and never feeds
//! back into control flow.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::FrontierEntry;
use crate::agents::Persona;
use crate::convergence::Decision;
use crate::graph::{AuditEntry, NodeId};
use crate::workflow::{TerminalReason, WorkflowStage};

/// Event emitted by the orchestration driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ProgressEvent {
    RunStarted {
        run_id: String,
        problem: String,
        root_id: NodeId,
    },
    RoundClosed {
        run_id: String,
        stage: WorkflowStage,
        round: u32,
        total_rounds: u32,
        submitted: usize,
        accepted: usize,
        rejected: usize,
        unavailable: Vec<Persona>,
        timed_out: bool,
        /// `None` when the round was escalated without evaluation.
        decision: Option<Decision>,
        frontier: Vec<FrontierEntry>,
    },
    StageTransition {
        run_id: String,
        from: WorkflowStage,
        to: WorkflowStage,
        backtrack: bool,
    },
    /// A store mutation, forwarded from the audit log.
    Audit { run_id: String, entry: AuditEntry },
    RunTerminated {
        run_id: String,
        stage: WorkflowStage,
        reason: TerminalReason,
        total_rounds: u32,
        backtracks: u32,
    },
}

impl ProgressEvent {
    /// Get the event name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressEvent::RunStarted { .. } => "run_started",
            ProgressEvent::RoundClosed { .. } => "round_closed",
            ProgressEvent::StageTransition { .. } => "stage_transition",
            ProgressEvent::Audit { .. } => "audit",
            ProgressEvent::RunTerminated { .. } => "run_terminated",
        }
    }
}

/// Observability collaborator.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Renders events as structured log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::RunStarted { run_id, root_id, .. } => {
                info!(run_id = %run_id, root_id = %root_id, "Run started");
            }
            ProgressEvent::RoundClosed {
                run_id,
                stage,
                round,
                total_rounds,
                submitted,
                accepted,
                rejected,
                unavailable,
                timed_out,
                decision,
                frontier,
            } => {
                let decision = decision
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "escalated".to_string());
                info!(
                    run_id = %run_id,
                    stage = %stage,
                    round,
                    total_rounds,
                    submitted,
                    accepted,
                    rejected,
                    unavailable = unavailable.len(),
                    timed_out,
                    decision = %decision,
                    frontier = frontier.len(),
                    "Round closed"
                );
            }
            ProgressEvent::StageTransition {
                run_id,
                from,
                to,
                backtrack,
            } => {
                info!(run_id = %run_id, from = %from, to = %to, backtrack, "Stage transition");
            }
            ProgressEvent::Audit { run_id, entry } => {
                debug!(
                    run_id = %run_id,
                    offset = entry.offset,
                    node_id = %entry.node_id,
                    action = entry.action.as_str(),
                    next = %entry.next,
                    "Audit"
                );
            }
            ProgressEvent::RunTerminated {
                run_id,
                stage,
                reason,
                total_rounds,
                backtracks,
            } => {
                if reason.is_success() {
                    info!(
                        run_id = %run_id,
                        stage = %stage,
                        reason = %reason,
                        total_rounds,
                        backtracks,
                        "Run terminated"
                    );
                } else {
                    warn!(
                        run_id = %run_id,
                        stage = %stage,
                        reason = %reason,
                        total_rounds,
                        backtracks,
                        "Run terminated"
                    );
                }
            }
        }
    }
}

/// Forwards events over an unbounded tokio channel.
///
/// A dropped receiver is not an error; events are discarded from then on.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelEventSink {
    /// Create a sink and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: &ProgressEvent) {
        let _ = self.sender.send(event.clone());
    }
}

/// Emits every event to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: &ProgressEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
