//! Workflow state machine.
//!
//! The active stage only moves forward, except for explicit backtracks
//! requested by the convergence evaluator. Backtracks are bounded per run;
//! a backtrack request beyond the bound terminates the run with
//! [`TerminalReason::NoConvergence`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::WorkflowStage;
use crate::convergence::Decision;
use crate::error::WorkflowError;

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum TerminalReason {
    /// The final stage reached acceptance.
    Converged,
    /// Round cap hit without an acceptable frontier, or backtracks exhausted.
    NoConvergence,
    /// Global round or time budget exhausted.
    Timeout,
    /// Every active agent was unavailable in a round.
    AllAgentsUnavailable,
    /// Unrecoverable failure.
    Fatal {
        /// What went wrong.
        message: String,
    },
}

impl TerminalReason {
    /// Get the reason name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalReason::Converged => "converged",
            TerminalReason::NoConvergence => "no_convergence",
            TerminalReason::Timeout => "timeout",
            TerminalReason::AllAgentsUnavailable => "all_agents_unavailable",
            TerminalReason::Fatal { .. } => "fatal",
        }
    }

    /// Whether the run ended successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalReason::Converged)
    }
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalReason::Fatal { message } => write!(f, "fatal: {}", message),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Current state of the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum WorkflowState {
    /// A stage is active.
    Active {
        /// The active stage.
        stage: WorkflowStage,
    },
    /// The run is over.
    Terminated {
        /// The last active stage.
        stage: WorkflowStage,
        /// Why it ended.
        reason: TerminalReason,
    },
}

impl WorkflowState {
    /// The active (or last active) stage.
    pub fn stage(&self) -> WorkflowStage {
        match self {
            WorkflowState::Active { stage } | WorkflowState::Terminated { stage, .. } => *stage,
        }
    }

    /// Whether the workflow is terminated.
    pub fn is_terminated(&self) -> bool {
        matches!(self, WorkflowState::Terminated { .. })
    }
}

/// Result of applying a decision to the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Transition {
    /// Same stage, another round.
    Continued {
        /// The stage that continues.
        stage: WorkflowStage,
    },
    /// Moved to the next stage.
    Advanced {
        /// Stage left.
        from: WorkflowStage,
        /// Stage entered.
        to: WorkflowStage,
    },
    /// Moved back to an earlier stage.
    Backtracked {
        /// Stage left.
        from: WorkflowStage,
        /// Stage entered.
        to: WorkflowStage,
        /// Backtracks used so far, including this one.
        count: u32,
    },
    /// The run ended.
    Terminated {
        /// Stage at termination.
        stage: WorkflowStage,
        /// Why it ended.
        reason: TerminalReason,
    },
}

/// Record of a stage change, kept for the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageChange {
    /// Stage left.
    pub from: WorkflowStage,
    /// Stage entered.
    pub to: WorkflowStage,
    /// Whether this was a backtrack.
    pub backtrack: bool,
    /// When the change happened.
    pub at: DateTime<Utc>,
}

/// Sequences stages and enforces the backtrack bound.
#[derive(Debug, Clone)]
pub struct WorkflowStateMachine {
    state: WorkflowState,
    stage_round: u32,
    backtracks: u32,
    max_backtracks: u32,
    action_enabled: bool,
    history: Vec<StageChange>,
}

impl WorkflowStateMachine {
    /// Create a machine starting at `ProblemDefinition`.
    pub fn new(max_backtracks: u32, action_enabled: bool) -> Self {
        Self {
            state: WorkflowState::Active {
                stage: WorkflowStage::ProblemDefinition,
            },
            stage_round: 0,
            backtracks: 0,
            max_backtracks,
            action_enabled,
            history: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Active (or last active) stage.
    pub fn stage(&self) -> WorkflowStage {
        self.state.stage()
    }

    /// Rounds started in the current stage visit.
    pub fn stage_round(&self) -> u32 {
        self.stage_round
    }

    /// Backtracks used so far.
    pub fn backtracks(&self) -> u32 {
        self.backtracks
    }

    /// Stage changes so far.
    pub fn history(&self) -> &[StageChange] {
        &self.history
    }

    /// Whether the workflow is terminated.
    pub fn is_terminated(&self) -> bool {
        self.state.is_terminated()
    }

    /// Terminal reason, if terminated.
    pub fn terminal_reason(&self) -> Option<&TerminalReason> {
        match &self.state {
            WorkflowState::Terminated { reason, .. } => Some(reason),
            WorkflowState::Active { .. } => None,
        }
    }

    /// Start a new round in the active stage and return its number (1-based).
    pub fn begin_round(&mut self) -> Result<u32, WorkflowError> {
        self.ensure_active()?;
        self.stage_round += 1;
        Ok(self.stage_round)
    }

    /// Apply an evaluator decision.
    pub fn apply(&mut self, decision: &Decision) -> Result<Transition, WorkflowError> {
        match decision {
            Decision::ContinueRound => {
                self.ensure_active()?;
                Ok(Transition::Continued {
                    stage: self.stage(),
                })
            }
            Decision::Advance => self.advance(),
            Decision::Backtrack { target } => self.backtrack(*target),
            Decision::Terminate { reason } => self.terminate(reason.clone()),
        }
    }

    /// Advance to the next stage, or terminate successfully from the last one.
    pub fn advance(&mut self) -> Result<Transition, WorkflowError> {
        let from = self.ensure_active()?;

        let next = match from.next() {
            Some(WorkflowStage::Action) if !self.action_enabled => None,
            other => other,
        };

        match next {
            Some(to) => {
                self.enter(from, to, false);
                info!(from = %from, to = %to, "Stage advanced");
                Ok(Transition::Advanced { from, to })
            }
            None => self.terminate(TerminalReason::Converged),
        }
    }

    /// Return to an earlier stage, bounded by `max_backtracks`.
    pub fn backtrack(&mut self, target: WorkflowStage) -> Result<Transition, WorkflowError> {
        let from = self.ensure_active()?;
        if target >= from {
            return Err(WorkflowError::InvalidBacktrack { from, to: target });
        }

        if self.backtracks >= self.max_backtracks {
            warn!(
                from = %from,
                to = %target,
                backtracks = self.backtracks,
                max_backtracks = self.max_backtracks,
                "Backtrack limit reached"
            );
            return self.terminate(TerminalReason::NoConvergence);
        }

        self.backtracks += 1;
        self.enter(from, target, true);
        info!(
            from = %from,
            to = %target,
            count = self.backtracks,
            "Stage backtracked"
        );
        Ok(Transition::Backtracked {
            from,
            to: target,
            count: self.backtracks,
        })
    }

    /// Terminate the run from any active stage.
    pub fn terminate(&mut self, reason: TerminalReason) -> Result<Transition, WorkflowError> {
        let stage = self.ensure_active()?;
        self.state = WorkflowState::Terminated {
            stage,
            reason: reason.clone(),
        };
        info!(stage = %stage, reason = %reason, "Workflow terminated");
        Ok(Transition::Terminated { stage, reason })
    }

    fn enter(&mut self, from: WorkflowStage, to: WorkflowStage, backtrack: bool) {
        self.state = WorkflowState::Active { stage: to };
        self.stage_round = 0;
        self.history.push(StageChange {
            from,
            to,
            backtrack,
            at: Utc::now(),
        });
    }

    fn ensure_active(&self) -> Result<WorkflowStage, WorkflowError> {
        match &self.state {
            WorkflowState::Active { stage } => Ok(*stage),
            WorkflowState::Terminated { .. } => Err(WorkflowError::AlreadyTerminated),
        }
    }
}
