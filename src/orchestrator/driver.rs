//! Orchestration driver: the top-level round loop.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{frontier_summary, EventSink, ProgressEvent, RoundRecord, RunState, TracingEventSink};
use crate::config::OrchestrationConfig;
use crate::convergence::{ConvergenceEvaluator, RoundProgress};
use crate::error::AppResult;
use crate::graph::{NodeId, ThoughtGraphStore};
use crate::scheduler::TurnScheduler;
use crate::storage::Storage;
use crate::workflow::{TerminalReason, Transition, WorkflowStateMachine};

/// Wires the scheduler, evaluator and state machine into a run loop.
pub struct Orchestrator {
    config: OrchestrationConfig,
    scheduler: TurnScheduler,
    evaluator: ConvergenceEvaluator,
    events: Arc<dyn EventSink>,
    storage: Option<Arc<dyn Storage>>,
}

impl Orchestrator {
    /// Create a driver that logs progress through `tracing` and persists nothing.
    pub fn new(config: OrchestrationConfig, scheduler: TurnScheduler) -> Self {
        let evaluator = ConvergenceEvaluator::new(&config);
        Self {
            config,
            scheduler,
            evaluator,
            events: Arc::new(TracingEventSink),
            storage: None,
        }
    }

    /// Replace the event sink
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Persist the run after every round
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Run the workflow for `problem` until it terminates.
    ///
    /// Terminal conditions (including `NoConvergence`, `Timeout` and
    /// `AllAgentsUnavailable`) are returned as `Ok` with the partial graph
    /// intact. `Err` is reserved for failures to set the run up.
    pub async fn run(&self, problem: impl Into<String>) -> AppResult<RunState> {
        let problem = problem.into();
        let store = ThoughtGraphStore::new();
        let root_id = store.create_root(problem.clone())?;
        let machine = WorkflowStateMachine::new(
            self.config.max_backtracks,
            self.config.action_stage_enabled,
        );
        let mut run = RunState::new(Uuid::new_v4().to_string(), problem, root_id, store, machine);
        let started = Instant::now();
        let run_deadline = started + Duration::from_millis(self.config.run_timeout_ms);

        self.events.emit(&ProgressEvent::RunStarted {
            run_id: run.run_id().to_string(),
            problem: run.problem().to_string(),
            root_id,
        });
        self.forward_audit(&mut run);
        self.persist_changes(&mut run).await;

        while !run.is_terminated() {
            if self.evaluator.budget_exhausted(run.total_rounds, started.elapsed()) {
                self.terminate(&mut run, TerminalReason::Timeout);
                break;
            }

            let stage = run.stage();
            if !stage.entry_ready(&run.graph()) {
                self.terminate(
                    &mut run,
                    TerminalReason::Fatal {
                        message: format!("stage {} has no input frontier", stage),
                    },
                );
                break;
            }

            run.machine.begin_round()?;
            run.total_rounds += 1;

            let plan = self.config.stages.get(stage);
            let snapshot = run.snapshot();
            let outcome = self
                .scheduler
                .run_round_until(plan, run.store(), &snapshot, Some(run_deadline))
                .await;

            let (verdict, transition) = if outcome.timed_out && Instant::now() >= run_deadline {
                warn!(run_id = %run.run_id(), stage = %stage, "Run timeout closed the round");
                let transition = run.machine.terminate(TerminalReason::Timeout)?;
                (None, transition)
            } else if outcome.all_unavailable() {
                warn!(
                    run_id = %run.run_id(),
                    stage = %stage,
                    "Every active agent was unavailable"
                );
                let transition = run.machine.terminate(TerminalReason::AllAgentsUnavailable)?;
                (None, transition)
            } else {
                let progress = RoundProgress {
                    stage_round: run.stage_round(),
                    total_rounds: run.total_rounds,
                    elapsed: started.elapsed(),
                    accepted_in_visit: run.accepted_in_visit,
                };
                let verdict = self.evaluator.evaluate(run.store(), plan, progress);
                run.accepted_in_visit = verdict.accepted_in_visit;

                let transition = match run.machine.apply(&verdict.decision) {
                    Ok(transition) => transition,
                    Err(e) => {
                        error!(run_id = %run.run_id(), error = %e, "Decision could not be applied");
                        run.machine.terminate(TerminalReason::Fatal {
                            message: e.to_string(),
                        })?
                    }
                };
                (Some(verdict), transition)
            };

            let graph = run.graph();
            self.events.emit(&ProgressEvent::RoundClosed {
                run_id: run.run_id().to_string(),
                stage,
                round: outcome.round,
                total_rounds: run.total_rounds,
                submitted: outcome.submitted.len(),
                accepted: verdict.as_ref().map_or(0, |v| v.accepted.len()),
                rejected: verdict.as_ref().map_or(0, |v| v.rejected.len()),
                unavailable: outcome
                    .contributions
                    .iter()
                    .filter(|c| c.is_unavailable())
                    .map(|c| c.persona)
                    .collect(),
                timed_out: outcome.timed_out,
                decision: verdict.as_ref().map(|v| v.decision.clone()),
                frontier: frontier_summary(&graph, stage),
            });

            match &transition {
                Transition::Advanced { from, to } | Transition::Backtracked { from, to, .. } => {
                    run.accepted_in_visit = 0;
                    self.events.emit(&ProgressEvent::StageTransition {
                        run_id: run.run_id().to_string(),
                        from: *from,
                        to: *to,
                        backtrack: matches!(transition, Transition::Backtracked { .. }),
                    });
                }
                Transition::Continued { .. } | Transition::Terminated { .. } => {}
            }

            let record = RoundRecord {
                index: run.rounds.len() as u32,
                outcome,
                verdict,
                transition,
            };
            run.rounds.push(record);
            run.touch();

            self.forward_audit(&mut run);
            self.persist_changes(&mut run).await;
        }

        if let Some(reason) = run.terminal_reason().cloned() {
            self.events.emit(&ProgressEvent::RunTerminated {
                run_id: run.run_id().to_string(),
                stage: run.stage(),
                reason,
                total_rounds: run.total_rounds,
                backtracks: run.backtracks(),
            });
        }
        run.touch();
        self.persist_changes(&mut run).await;

        info!(
            run_id = %run.run_id(),
            stage = %run.stage(),
            total_rounds = run.total_rounds,
            nodes = run.store().len(),
            "Run finished"
        );
        Ok(run)
    }

    fn terminate(&self, run: &mut RunState, reason: TerminalReason) {
        if let Err(e) = run.machine.terminate(reason) {
            warn!(run_id = %run.run_id(), error = %e, "Terminate ignored");
        }
    }

    /// Emit audit entries recorded since the last call.
    fn forward_audit(&self, run: &mut RunState) {
        let entries = run.store().audit_since(run.audit_offset);
        run.audit_offset += entries.len() as u64;
        for entry in entries {
            self.events.emit(&ProgressEvent::Audit {
                run_id: run.run_id().to_string(),
                entry,
            });
        }
    }

    /// Write the run header, every node touched since the last successful
    /// write, the matching audit entries and any unsaved rounds.
    ///
    /// Offsets only move forward once a write succeeds, so a failed write is
    /// retried in full after the next round.
    async fn persist_changes(&self, run: &mut RunState) {
        let Some(storage) = &self.storage else { return };

        let entries = run.store().audit_since(run.persisted_audit_offset);
        let touched: BTreeSet<NodeId> = entries.iter().map(|e| e.node_id).collect();
        let graph = run.graph();
        let nodes: Vec<_> = touched
            .iter()
            .filter_map(|id| graph.get(*id).cloned())
            .collect();

        let result = async {
            storage.save_run(&run.record()).await?;
            storage.upsert_nodes(run.run_id(), &nodes).await?;
            storage.append_audit(run.run_id(), &entries).await
        }
        .await;
        match result {
            Ok(()) => run.persisted_audit_offset += entries.len() as u64,
            Err(e) => {
                warn!(
                    run_id = %run.run_id(),
                    pending = entries.len(),
                    error = %e,
                    "Failed to persist graph changes"
                );
                return;
            }
        }

        while let Some(record) = run.rounds.get(run.persisted_rounds) {
            if let Err(e) = storage.save_round(run.run_id(), record).await {
                warn!(
                    run_id = %run.run_id(),
                    round = record.index,
                    error = %e,
                    "Failed to persist round"
                );
                return;
            }
            run.persisted_rounds += 1;
        }
    }
}
