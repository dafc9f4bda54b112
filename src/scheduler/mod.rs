//! Turn scheduler: runs one round of agent invocations for the active stage.
//!
//! In `parallel` mode every active agent runs as its own task against the
//! same immutable snapshot; the round waits for all of them (fan-in) or for
//! the round deadline, whichever comes first. In `sequential` mode agents run
//! one after another in priority order and each sees the proposals submitted
//! by the agents before it.
//!
//! Either way, proposals reach the store in a deterministic order: ascending
//! persona priority, then the agent's own output order. A round's end state
//! is therefore a pure function of the agent outputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agents::{
    Agent, AgentAdapter, KnowledgeBase, ModelBackend, Persona, PersonaCatalog, ProposedNode,
    RunSnapshot,
};
use crate::config::{InvocationMode, RequestConfig, StagePlan};
use crate::error::AgentError;
use crate::graph::{Author, NewThought, NodeId, ThoughtGraph, ThoughtGraphStore, ThoughtNode};
use crate::workflow::WorkflowStage;

/// How an agent's turn ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ContributionStatus {
    /// The agent returned proposals (possibly none).
    Completed,
    /// The agent failed, timed out or is not registered.
    Unavailable { reason: String },
}

/// A proposal the store refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefusedProposal {
    pub content: String,
    pub reason: String,
}

/// One agent's share of a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContribution {
    pub persona: Persona,
    pub status: ContributionStatus,
    /// Admitted node ids, in submission order.
    pub submitted: Vec<NodeId>,
    pub refused: Vec<RefusedProposal>,
}

impl AgentContribution {
    fn unavailable(persona: Persona, reason: impl Into<String>) -> Self {
        Self {
            persona,
            status: ContributionStatus::Unavailable {
                reason: reason.into(),
            },
            submitted: Vec::new(),
            refused: Vec::new(),
        }
    }

    /// Whether the agent was unavailable this round.
    pub fn is_unavailable(&self) -> bool {
        matches!(self.status, ContributionStatus::Unavailable { .. })
    }
}

/// Result of one scheduling cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub stage: WorkflowStage,
    pub round: u32,
    pub mode: InvocationMode,
    /// One entry per active agent, in priority order.
    pub contributions: Vec<AgentContribution>,
    /// Every admitted node id, in submission order.
    pub submitted: Vec<NodeId>,
    /// Whether the round deadline cut any agent off.
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl RoundOutcome {
    /// Whether every active agent was unavailable.
    pub fn all_unavailable(&self) -> bool {
        !self.contributions.is_empty() && self.contributions.iter().all(|c| c.is_unavailable())
    }

    /// Number of unavailable agents.
    pub fn unavailable_count(&self) -> usize {
        self.contributions.iter().filter(|c| c.is_unavailable()).count()
    }
}

/// Prior nodes an agent builds on: the input frontier, the stage's own
/// frontier and any non-critique proposals already made at this stage,
/// ordered by creation sequence.
pub fn prior_nodes(graph: &ThoughtGraph, stage: WorkflowStage) -> Vec<ThoughtNode> {
    let mut seen = BTreeSet::new();
    let mut nodes: Vec<ThoughtNode> = stage
        .input_frontier(graph)
        .into_iter()
        .chain(graph.frontier(stage))
        .chain(graph.proposed_at(stage).into_iter().filter(|n| !n.is_critique()))
        .filter(|n| seen.insert(n.id))
        .cloned()
        .collect();
    nodes.sort_by_key(|n| n.sequence);
    nodes
}

/// Selects, invokes and merges agents for a round.
pub struct TurnScheduler {
    agents: BTreeMap<Persona, Arc<dyn Agent>>,
    round_timeout: Duration,
    max_concurrent: usize,
}

impl TurnScheduler {
    /// Create a scheduler over `agents` (one per persona; later entries win).
    pub fn new(
        agents: impl IntoIterator<Item = Arc<dyn Agent>>,
        round_timeout: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            agents: agents.into_iter().map(|a| (a.persona(), a)).collect(),
            round_timeout,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Scheduler with a model-backed adapter for every persona in `catalog`.
    pub fn model_backed(
        catalog: &PersonaCatalog,
        backend: Arc<dyn ModelBackend>,
        knowledge: Arc<dyn KnowledgeBase>,
        request: &RequestConfig,
        round_timeout: Duration,
        max_concurrent: usize,
    ) -> Self {
        let agents = catalog.iter().map(|config| {
            Arc::new(
                AgentAdapter::new(config.clone(), backend.clone(), request)
                    .with_knowledge(knowledge.clone()),
            ) as Arc<dyn Agent>
        });
        Self::new(agents, round_timeout, max_concurrent)
    }

    /// Personas with a registered agent.
    pub fn personas(&self) -> Vec<Persona> {
        self.agents.keys().copied().collect()
    }

    /// Run one round of `plan` against `store`.
    ///
    /// `context` carries the run counters; its graph is replaced with fresh
    /// snapshots taken here. Store refusals and agent failures are recorded
    /// in the outcome and never abort the round.
    pub async fn run_round(
        &self,
        plan: &StagePlan,
        store: &ThoughtGraphStore,
        context: &RunSnapshot,
    ) -> RoundOutcome {
        self.run_round_until(plan, store, context, None).await
    }

    /// Like [`run_round`](Self::run_round), but the round also closes at
    /// `run_deadline` when that comes before the round timeout.
    pub async fn run_round_until(
        &self,
        plan: &StagePlan,
        store: &ThoughtGraphStore,
        context: &RunSnapshot,
        run_deadline: Option<Instant>,
    ) -> RoundOutcome {
        let started_at = Utc::now();
        let round_deadline = Instant::now() + self.round_timeout;
        let deadline = run_deadline.map_or(round_deadline, |d| d.min(round_deadline));
        let agents = active_agents(plan);

        info!(
            stage = %plan.stage,
            round = context.stage_round,
            mode = %plan.mode,
            agents = agents.len(),
            "Round started"
        );

        let (contributions, timed_out) = match plan.mode {
            InvocationMode::Parallel => {
                self.run_parallel(&agents, plan.stage, store, context, deadline)
                    .await
            }
            InvocationMode::Sequential => {
                self.run_sequential(&agents, plan.stage, store, context, deadline)
                    .await
            }
        };

        let submitted: Vec<NodeId> = contributions
            .iter()
            .flat_map(|c| c.submitted.iter().copied())
            .collect();
        let outcome = RoundOutcome {
            stage: plan.stage,
            round: context.stage_round,
            mode: plan.mode,
            contributions,
            submitted,
            timed_out,
            started_at,
            closed_at: Utc::now(),
        };

        info!(
            stage = %plan.stage,
            round = outcome.round,
            submitted = outcome.submitted.len(),
            unavailable = outcome.unavailable_count(),
            timed_out = outcome.timed_out,
            "Round closed"
        );
        outcome
    }

    async fn run_parallel(
        &self,
        agents: &[Persona],
        stage: WorkflowStage,
        store: &ThoughtGraphStore,
        context: &RunSnapshot,
        deadline: Instant,
    ) -> (Vec<AgentContribution>, bool) {
        let mut snapshot = context.clone();
        snapshot.graph = store.snapshot();
        let prior = Arc::new(prior_nodes(&snapshot.graph, stage));
        let snapshot = Arc::new(snapshot);
        let permits = Arc::new(Semaphore::new(self.max_concurrent));

        // Fan out.
        let mut handles = Vec::with_capacity(agents.len());
        for persona in agents {
            let Some(agent) = self.agents.get(persona).cloned() else {
                handles.push((*persona, None));
                continue;
            };
            let snapshot = snapshot.clone();
            let prior = prior.clone();
            let permits = permits.clone();
            let persona = *persona;
            let handle = tokio::spawn(async move {
                let _permit =
                    permits
                        .acquire_owned()
                        .await
                        .map_err(|e| AgentError::Unavailable {
                            persona,
                            reason: format!("scheduler closed: {}", e),
                        })?;
                agent.act(&snapshot, &prior).await
            });
            handles.push((persona, Some(handle)));
        }

        // Fan in, bounded by the round deadline.
        let mut timed_out = false;
        let mut results = Vec::with_capacity(handles.len());
        for (persona, handle) in handles {
            let Some(mut handle) = handle else {
                results.push((persona, Err(unregistered(persona))));
                continue;
            };
            let result = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(AgentError::Unavailable {
                    persona,
                    reason: format!("agent task failed: {}", join_error),
                }),
                Err(_) => {
                    handle.abort();
                    timed_out = true;
                    Err(AgentError::Unavailable {
                        persona,
                        reason: "round timeout".to_string(),
                    })
                }
            };
            results.push((persona, result));
        }

        // Merge in priority order.
        let contributions = results
            .into_iter()
            .map(|(persona, result)| submit(store, stage, persona, result))
            .collect();
        (contributions, timed_out)
    }

    async fn run_sequential(
        &self,
        agents: &[Persona],
        stage: WorkflowStage,
        store: &ThoughtGraphStore,
        context: &RunSnapshot,
        deadline: Instant,
    ) -> (Vec<AgentContribution>, bool) {
        let mut timed_out = false;
        let mut contributions = Vec::with_capacity(agents.len());

        for persona in agents.iter().copied() {
            let Some(agent) = self.agents.get(&persona) else {
                contributions.push(submit(store, stage, persona, Err(unregistered(persona))));
                continue;
            };
            if timed_out {
                contributions.push(AgentContribution::unavailable(persona, "round timeout"));
                continue;
            }

            let mut snapshot = context.clone();
            snapshot.graph = store.snapshot();
            let prior = prior_nodes(&snapshot.graph, stage);

            let turn = agent.act(&snapshot, &prior);
            let result = match tokio::time::timeout_at(deadline, turn).await {
                Ok(result) => result,
                Err(_) => {
                    timed_out = true;
                    Err(AgentError::Unavailable {
                        persona,
                        reason: "round timeout".to_string(),
                    })
                }
            };
            contributions.push(submit(store, stage, persona, result));
        }

        (contributions, timed_out)
    }
}

/// The plan's agents in submission order: ascending persona priority, each
/// persona once, however the plan's list was built.
fn active_agents(plan: &StagePlan) -> Vec<Persona> {
    plan.agents
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn unregistered(persona: Persona) -> AgentError {
    AgentError::Unavailable {
        persona,
        reason: "no agent registered".to_string(),
    }
}

/// Submit one agent's proposals in output order.
fn submit(
    store: &ThoughtGraphStore,
    stage: WorkflowStage,
    persona: Persona,
    result: Result<Vec<ProposedNode>, AgentError>,
) -> AgentContribution {
    let proposals = match result {
        Ok(proposals) => proposals,
        Err(e) => {
            warn!(persona = %persona, stage = %stage, error = %e, "Agent unavailable");
            let AgentError::Unavailable { reason, .. } = e;
            return AgentContribution::unavailable(persona, reason);
        }
    };

    let mut contribution = AgentContribution {
        persona,
        status: ContributionStatus::Completed,
        submitted: Vec::new(),
        refused: Vec::new(),
    };

    for proposal in proposals {
        let thought = NewThought {
            parents: proposal.parents,
            author: Author::Agent(persona),
            stage,
            kind: proposal.kind,
            content: proposal.content,
            score: proposal.score,
            metadata: proposal.metadata,
        };
        let content = thought.content.clone();
        match store.propose(thought) {
            Ok(id) => {
                debug!(persona = %persona, node_id = %id, "Proposal admitted");
                contribution.submitted.push(id);
            }
            Err(e) => {
                warn!(persona = %persona, error = %e, "Proposal refused by store");
                contribution.refused.push(RefusedProposal {
                    content,
                    reason: e.to_string(),
                });
            }
        }
    }
    contribution
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod scheduler_tests;
