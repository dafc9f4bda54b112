//! # Think Tank
//!
//! A workflow-graph engine that coordinates seven persona agents (Strategist,
//! Analyst, Creative Thinker, Synthesizer, Implementer, Researcher,
//! Challenger) over a shared graph of thoughts until a decision converges.
//!
//! ## Architecture
//!
//! ```text
//! Orchestrator ──> WorkflowStateMachine (active stage)
//!      │
//!      ├──> TurnScheduler ──> AgentAdapter xN ──> Langbase Pipes (HTTP)
//!      │          │
//!      │          └──> ThoughtGraphStore (ordered submission)
//!      │
//!      ├──> ConvergenceEvaluator (accept / reject / decide)
//!      │
//!      └──> EventSink, SQLite (optional)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use think_tank::agents::NoKnowledge;
//! use think_tank::langbase::LangbaseClient;
//! use think_tank::orchestrator::Orchestrator;
//! use think_tank::scheduler::TurnScheduler;
//! use think_tank::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let client = Arc::new(LangbaseClient::new(&config.langbase, config.request.clone())?);
//!     let scheduler = TurnScheduler::model_backed(
//!         &config.personas.catalog(),
//!         client,
//!         Arc::new(NoKnowledge),
//!         &config.request,
//!         Duration::from_millis(config.orchestration.round_timeout_ms),
//!         config.orchestration.max_concurrent_agents,
//!     );
//!     let run = Orchestrator::new(config.orchestration.clone(), scheduler)
//!         .run("Should we enter market X?")
//!         .await?;
//!     println!("{}", serde_json::to_string_pretty(&run.summary())?);
//!     Ok(())
//! }
//! ```

/// Environment-driven configuration.
pub mod config;
/// Error types and result aliases.
pub mod error;
/// Langbase API client and types for pipe communication.
pub mod langbase;
/// Persona system prompts and the shared response format.
pub mod prompts;

/// Thought graph and its synchronized store.
pub mod graph;
/// Persona agents, the model-backed adapter and knowledge lookup.
pub mod agents;
/// Workflow stages and state machine.
pub mod workflow;
/// Per-stage round scheduling.
pub mod scheduler;
/// Acceptance rules and round decisions.
pub mod convergence;
/// Run loop, run state and progress events.
pub mod orchestrator;
/// SQLite storage layer for persistence.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use orchestrator::{Orchestrator, RunState, RunSummary};
