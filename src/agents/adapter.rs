//! Agent capability and the model-backed adapter that implements it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::{KnowledgeBase, NoKnowledge, Persona, PersonaConfig, PostProcess, RunSnapshot, Snippet};
use crate::config::RequestConfig;
use crate::error::{AgentError, LangbaseResult};
use crate::graph::{Author, NodeId, ThoughtKind, ThoughtNode};
use crate::langbase::{ThoughtPayload, ThoughtsResponse};
use crate::workflow::WorkflowStage;

/// Upper bound for a single retry delay.
const MAX_BACKOFF_MS: u64 = 60_000;

/// Upper bound on proposals kept from a single agent turn.
pub const MAX_PROPOSALS_PER_TURN: usize = 3;

/// A node an agent wants added to the graph. Only the scheduler submits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedNode {
    pub parents: Vec<NodeId>,
    pub kind: ThoughtKind,
    pub content: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ProposedNode {
    /// A proposal extending `parents`.
    pub fn new(parents: Vec<NodeId>, content: impl Into<String>, score: f64) -> Self {
        Self {
            parents,
            kind: ThoughtKind::Proposal,
            content: content.into(),
            score: score.clamp(0.0, 1.0),
            metadata: None,
        }
    }

    /// A critique of `parents`.
    pub fn critique(parents: Vec<NodeId>, content: impl Into<String>, score: f64) -> Self {
        Self {
            kind: ThoughtKind::Critique,
            ..Self::new(parents, content, score)
        }
    }

    /// Set metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Uniform capability shared by every persona.
///
/// Agents are stateless across calls and never touch the store: they read
/// an immutable snapshot and return proposals.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The persona this agent plays.
    fn persona(&self) -> Persona;

    /// Produce proposals for the current round.
    async fn act(
        &self,
        snapshot: &RunSnapshot,
        prior: &[ThoughtNode],
    ) -> Result<Vec<ProposedNode>, AgentError>;
}

// ============================================================================
// Model backend
// ============================================================================

/// A prior thought as shown to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorThought {
    pub id: NodeId,
    pub author: Author,
    pub stage: WorkflowStage,
    pub kind: ThoughtKind,
    pub score: f64,
    pub content: String,
}

impl From<&ThoughtNode> for PriorThought {
    fn from(node: &ThoughtNode) -> Self {
        Self {
            id: node.id,
            author: node.author,
            stage: node.stage,
            kind: node.kind,
            score: node.score,
            content: node.content.clone(),
        }
    }
}

/// Everything the model needs for one persona turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptContext {
    pub problem: String,
    pub stage: WorkflowStage,
    pub round: u32,
    pub prior: Vec<PriorThought>,
    pub knowledge: Vec<Snippet>,
}

impl PromptContext {
    /// Render as the user message sent to the persona pipe.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Problem: {}\nStage: {} (round {})\n",
            self.problem, self.stage, self.round
        );

        out.push_str("\nPrior thoughts:\n");
        if self.prior.is_empty() {
            out.push_str("(none)\n");
        }
        for p in &self.prior {
            out.push_str(&format!(
                "- [{}] {} by {} in {} (score {:.2}): {}\n",
                p.id, p.kind, p.author, p.stage, p.score, p.content
            ));
        }

        if !self.knowledge.is_empty() {
            out.push_str("\nReference material:\n");
            for s in &self.knowledge {
                out.push_str(&format!("- ({}) {}\n", s.source, s.content));
            }
        }
        out
    }
}

/// External model-invocation collaborator: one attempt, no retries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Invoke the model for `persona` and return the raw completion text.
    async fn invoke(
        &self,
        persona: &PersonaConfig,
        context: &PromptContext,
    ) -> LangbaseResult<String>;
}

// ============================================================================
// Adapter
// ============================================================================

/// Model-backed agent, parameterized by persona configuration.
#[derive(Clone)]
pub struct AgentAdapter {
    config: PersonaConfig,
    backend: Arc<dyn ModelBackend>,
    knowledge: Arc<dyn KnowledgeBase>,
    max_retries: u32,
    retry_delay_ms: u64,
}

impl AgentAdapter {
    /// Create an adapter using the retry policy from `request`.
    pub fn new(
        config: PersonaConfig,
        backend: Arc<dyn ModelBackend>,
        request: &RequestConfig,
    ) -> Self {
        Self {
            config,
            backend,
            knowledge: Arc::new(NoKnowledge),
            max_retries: request.max_retries,
            retry_delay_ms: request.retry_delay_ms,
        }
    }

    /// Set the knowledge base
    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge = knowledge;
        self
    }

    /// Persona configuration.
    pub fn config(&self) -> &PersonaConfig {
        &self.config
    }

    /// Invoke and parse, retrying with exponential backoff.
    async fn invoke_with_retry(
        &self,
        context: &PromptContext,
    ) -> Result<ThoughtsResponse, AgentError> {
        let persona = self.config.persona;
        let mut last_error = None;

        for retries in 0..=self.max_retries {
            if retries > 0 {
                let delay = backoff_delay(self.retry_delay_ms, retries);
                warn!(
                    persona = %persona,
                    retry = retries,
                    delay_ms = delay.as_millis(),
                    "Retrying persona invocation"
                );
                tokio::time::sleep(delay).await;
            }

            let start = Instant::now();
            let result = self
                .backend
                .invoke(&self.config, context)
                .await
                .and_then(|completion| ThoughtsResponse::from_completion(&completion));

            match result {
                Ok(response) => {
                    info!(
                        persona = %persona,
                        thoughts = response.thoughts.len(),
                        latency_ms = start.elapsed().as_millis(),
                        "Persona invocation succeeded"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    error!(
                        persona = %persona,
                        error = %e,
                        latency_ms = start.elapsed().as_millis(),
                        retry = retries,
                        "Persona invocation failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(AgentError::Unavailable {
            persona,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
        })
    }
}

#[async_trait]
impl Agent for AgentAdapter {
    fn persona(&self) -> Persona {
        self.config.persona
    }

    async fn act(
        &self,
        snapshot: &RunSnapshot,
        prior: &[ThoughtNode],
    ) -> Result<Vec<ProposedNode>, AgentError> {
        let persona = self.config.persona;
        let topic = format!("{} {}", snapshot.problem, snapshot.stage);
        let knowledge = self.knowledge.query(persona, &topic).await;

        let context = PromptContext {
            problem: snapshot.problem.clone(),
            stage: snapshot.stage,
            round: snapshot.stage_round,
            prior: prior.iter().map(PriorThought::from).collect(),
            knowledge,
        };

        let response = self.invoke_with_retry(&context).await?;
        let fallback = snapshot.graph.root().map(|n| n.id);
        let proposals = post_process(self.config.post_process, &response.thoughts, prior, fallback);

        debug!(
            persona = %persona,
            stage = %snapshot.stage,
            proposals = proposals.len(),
            "Persona output post-processed"
        );
        Ok(proposals)
    }
}

/// Turn parsed thoughts into proposals with resolved parents.
///
/// `builds_on` ids that name prior nodes take precedence. Otherwise
/// `Extend` and `Critique` attach to the highest-scored prior node and
/// `Aggregate` attaches to every prior node. With no prior nodes, `fallback`
/// (the root) is used; with neither, nothing can be proposed.
pub fn post_process(
    mode: PostProcess,
    thoughts: &[ThoughtPayload],
    prior: &[ThoughtNode],
    fallback: Option<NodeId>,
) -> Vec<ProposedNode> {
    let known: BTreeSet<NodeId> = prior.iter().map(|n| n.id).collect();

    let default_parents: Vec<NodeId> = match (mode, best_prior(prior)) {
        (PostProcess::Aggregate, _) if !prior.is_empty() => prior.iter().map(|n| n.id).collect(),
        (_, Some(best)) => vec![best],
        (_, None) => fallback.into_iter().collect(),
    };

    thoughts
        .iter()
        .filter(|t| !t.thought.trim().is_empty())
        .take(MAX_PROPOSALS_PER_TURN)
        .filter_map(|t| {
            let named: Vec<NodeId> = t
                .builds_on
                .iter()
                .filter_map(parse_node_ref)
                .filter(|id| known.contains(id))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let parents = if named.is_empty() {
                default_parents.clone()
            } else {
                named
            };
            if parents.is_empty() {
                return None;
            }

            let content = t.thought.trim().to_string();
            let mut node = match mode {
                PostProcess::Critique => ProposedNode::critique(parents, content, t.confidence),
                _ => ProposedNode::new(parents, content, t.confidence),
            };
            node.metadata = t.metadata.clone().filter(|m| !m.is_null());
            Some(node)
        })
        .collect()
}

/// Highest score wins; earlier sequence breaks ties.
/// Delay before retry number `retry` (1-based): the base doubles each time,
/// capped at [`MAX_BACKOFF_MS`].
fn backoff_delay(base_ms: u64, retry: u32) -> Duration {
    let factor = 2_u64.checked_pow(retry.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS))
}

fn best_prior(prior: &[ThoughtNode]) -> Option<NodeId> {
    prior
        .iter()
        .max_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| b.sequence.cmp(&a.sequence))
        })
        .map(|n| n.id)
}

fn parse_node_ref(value: &serde_json::Value) -> Option<NodeId> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().map(NodeId),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
#[path = "adapter_tests.rs"]
mod adapter_tests;
