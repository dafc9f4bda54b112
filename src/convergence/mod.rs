//! Convergence evaluator: resolves a round's proposals and decides what the
//! workflow does next.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{AcceptanceRule, OrchestrationConfig, StagePlan};
use crate::graph::{NodeId, NodeStatus, ThoughtGraphStore, ThoughtNode};
use crate::workflow::{TerminalReason, WorkflowStage};

/// What the workflow should do after a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum Decision {
    /// Stay in the stage for another round.
    ContinueRound,
    /// Move to the next stage.
    Advance,
    /// Return to an earlier stage.
    Backtrack { target: WorkflowStage },
    /// End the run.
    Terminate { reason: TerminalReason },
}

impl Decision {
    /// Get the decision name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::ContinueRound => "continue_round",
            Decision::Advance => "advance",
            Decision::Backtrack { .. } => "backtrack",
            Decision::Terminate { .. } => "terminate",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Backtrack { target } => write!(f, "backtrack({})", target),
            Decision::Terminate { reason } => write!(f, "terminate({})", reason),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Run counters the evaluator needs besides the graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundProgress {
    /// Round number within the current stage visit (1-based).
    pub stage_round: u32,
    /// Rounds run so far, including this one.
    pub total_rounds: u32,
    /// Time since the run started.
    pub elapsed: Duration,
    /// Nodes accepted earlier in this stage visit.
    pub accepted_in_visit: usize,
}

/// The evaluator's resolution of a round plus its decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    /// Accepted proposals and critiques, in sequence order.
    pub accepted: Vec<NodeId>,
    pub rejected: Vec<NodeId>,
    /// Previously accepted nodes replaced by accepted refinements.
    pub superseded: Vec<NodeId>,
    /// Accepted critiques over all nodes resolved this round.
    pub critique_density: f64,
    /// Stage frontier size after resolution.
    pub frontier_size: usize,
    /// Accepted non-critique nodes in this stage visit, including this round.
    pub accepted_in_visit: usize,
}

/// Applies acceptance rules and emits one decision per round.
#[derive(Debug, Clone)]
pub struct ConvergenceEvaluator {
    critique_ratio: f64,
    max_total_rounds: u32,
    run_timeout: Duration,
    action_enabled: bool,
}

impl ConvergenceEvaluator {
    /// Create an evaluator from the run configuration.
    pub fn new(config: &OrchestrationConfig) -> Self {
        Self {
            critique_ratio: config.critique_ratio,
            max_total_rounds: config.max_total_rounds,
            run_timeout: Duration::from_millis(config.run_timeout_ms),
            action_enabled: config.action_stage_enabled,
        }
    }

    /// Whether the global round or time budget is spent.
    pub fn budget_exhausted(&self, total_rounds: u32, elapsed: Duration) -> bool {
        total_rounds >= self.max_total_rounds || elapsed >= self.run_timeout
    }

    /// Resolve the stage's pending proposals and decide the next step.
    pub fn evaluate(
        &self,
        store: &ThoughtGraphStore,
        plan: &StagePlan,
        progress: RoundProgress,
    ) -> Verdict {
        let stage = plan.stage;
        let graph = store.snapshot();
        let pending = graph.proposed_at(stage);

        let (critiques, proposals): (Vec<&ThoughtNode>, Vec<&ThoughtNode>) =
            pending.into_iter().partition(|n| n.is_critique());

        let (mut accept, mut reject) = match plan.acceptance {
            AcceptanceRule::Threshold => split_by_threshold(&proposals, plan.min_score),
            AcceptanceRule::BestPerParent => best_per_parent(&proposals, plan.min_score),
        };
        let (accepted_critiques, rejected_critiques) =
            split_by_threshold(&critiques, plan.min_score);
        let accepted_proposals = accept.len();
        let resolved = proposals.len() + critiques.len();

        accept.extend(accepted_critiques.iter().copied());
        reject.extend(rejected_critiques);
        accept.sort_by_key(|id| graph.get(*id).map(|n| n.sequence));
        reject.sort_by_key(|id| graph.get(*id).map(|n| n.sequence));

        for id in &accept {
            apply(store, *id, NodeStatus::Accepted);
        }
        for id in &reject {
            apply(store, *id, NodeStatus::Rejected);
        }
        let superseded = supersede_parents(store, stage, &accept);

        let critique_density = if resolved == 0 {
            0.0
        } else {
            accepted_critiques.len() as f64 / resolved as f64
        };
        let accepted_in_visit = progress.accepted_in_visit + accepted_proposals;

        let after = store.snapshot();
        let frontier_size = after.frontier(stage).len();
        let exit_ready = stage.exit_ready(&after, plan.min_frontier, accepted_in_visit);

        let decision = self.decide(plan, progress, critique_density, exit_ready);

        debug!(
            stage = %stage,
            accepted = accept.len(),
            rejected = reject.len(),
            superseded = superseded.len(),
            critique_density,
            frontier = frontier_size,
            "Round resolved"
        );
        info!(
            stage = %stage,
            round = progress.stage_round,
            decision = %decision,
            "Convergence decision"
        );

        Verdict {
            decision,
            accepted: accept,
            rejected: reject,
            superseded,
            critique_density,
            frontier_size,
            accepted_in_visit,
        }
    }

    fn decide(
        &self,
        plan: &StagePlan,
        progress: RoundProgress,
        critique_density: f64,
        exit_ready: bool,
    ) -> Decision {
        let stage = plan.stage;

        if critique_density > self.critique_ratio {
            if let Some(target) = plan.backtrack_to {
                return Decision::Backtrack { target };
            }
        }

        if exit_ready {
            let last_stage = stage == WorkflowStage::Action
                || (stage == WorkflowStage::Decision && !self.action_enabled);
            return if last_stage {
                Decision::Terminate {
                    reason: TerminalReason::Converged,
                }
            } else {
                Decision::Advance
            };
        }

        if self.budget_exhausted(progress.total_rounds, progress.elapsed) {
            return Decision::Terminate {
                reason: TerminalReason::Timeout,
            };
        }

        if progress.stage_round >= plan.max_rounds {
            return match plan.backtrack_to {
                Some(target) => Decision::Backtrack { target },
                None => Decision::Terminate {
                    reason: TerminalReason::NoConvergence,
                },
            };
        }

        Decision::ContinueRound
    }
}

fn split_by_threshold(nodes: &[&ThoughtNode], min_score: f64) -> (Vec<NodeId>, Vec<NodeId>) {
    let (accept, reject): (Vec<&&ThoughtNode>, Vec<&&ThoughtNode>) =
        nodes.iter().partition(|n| n.score >= min_score);
    (
        accept.into_iter().map(|n| n.id).collect(),
        reject.into_iter().map(|n| n.id).collect(),
    )
}

/// Highest score first (earlier sequence on ties); a node is accepted only
/// if it qualifies and none of its parents was claimed by a better node.
fn best_per_parent(nodes: &[&ThoughtNode], min_score: f64) -> (Vec<NodeId>, Vec<NodeId>) {
    let mut ranked: Vec<&ThoughtNode> = nodes.to_vec();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.sequence.cmp(&b.sequence))
    });

    let mut claimed: BTreeSet<NodeId> = BTreeSet::new();
    let mut accept = Vec::new();
    let mut reject = Vec::new();
    for node in ranked {
        if node.score >= min_score && node.parents.is_disjoint(&claimed) {
            claimed.extend(node.parents.iter().copied());
            accept.push(node.id);
        } else {
            reject.push(node.id);
        }
    }
    (accept, reject)
}

/// Supersede accepted same-stage parents of newly accepted proposals.
fn supersede_parents(
    store: &ThoughtGraphStore,
    stage: WorkflowStage,
    accepted: &[NodeId],
) -> Vec<NodeId> {
    let mut superseded = Vec::new();
    for id in accepted {
        let Some(node) = store.get(*id) else { continue };
        if node.is_critique() {
            continue;
        }
        for parent_id in &node.parents {
            let Some(parent) = store.get(*parent_id) else { continue };
            if parent.status == NodeStatus::Accepted
                && parent.stage == stage
                && !parent.is_root()
                && !parent.is_critique()
            {
                apply(store, parent.id, NodeStatus::Superseded);
                superseded.push(parent.id);
            }
        }
    }
    superseded
}

fn apply(store: &ThoughtGraphStore, id: NodeId, status: NodeStatus) {
    if let Err(e) = store.set_status(id, status) {
        warn!(node_id = %id, status = %status, error = %e, "Status update refused");
    }
}
