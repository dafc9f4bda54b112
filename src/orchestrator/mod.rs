//! Orchestration driver, run state and progress events.
//!
//! Each loop iteration snapshots the run, lets the [`TurnScheduler`]
//! run one round, asks the [`ConvergenceEvaluator`] for a decision, applies
//! it to the workflow state machine and emits progress events.
//!
//! [`TurnScheduler`]: crate::scheduler::TurnScheduler
//! [`ConvergenceEvaluator`]: crate::convergence::ConvergenceEvaluator

mod driver;
mod events;
mod run_state;

pub use driver::Orchestrator;
pub use events::*;
pub use run_state::*;
