//! Persona agents.
//!
//! All seven personas share one capability ([`Agent`]) and one model-backed
//! implementation ([`AgentAdapter`]); they differ only in their
//! [`PersonaConfig`] and post-processing step.

mod adapter;
mod knowledge;
mod persona;
mod scripted;

pub use adapter::*;
pub use knowledge::*;
pub use persona::*;
pub use scripted::*;

use serde::Serialize;
use std::sync::Arc;

use crate::graph::ThoughtGraph;
use crate::workflow::WorkflowStage;

/// Read-only view of the run handed to agents for one turn.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub problem: String,
    pub stage: WorkflowStage,
    /// Round number within the current stage visit (1-based).
    pub stage_round: u32,
    pub total_rounds: u32,
    pub backtracks: u32,
    #[serde(skip)]
    pub graph: Arc<ThoughtGraph>,
}
