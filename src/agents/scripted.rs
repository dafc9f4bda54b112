//! Agent that replays pre-recorded outputs instead of calling a model.
//!
//! Used to replay a run deterministically from captured agent outputs, and
//! to drive the orchestrator in tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::{post_process, Agent, Persona, PersonaConfig, ProposedNode, RunSnapshot};
use crate::error::AgentError;
use crate::graph::ThoughtNode;
use crate::langbase::ThoughtPayload;

/// One recorded agent turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// The model answered with these thoughts.
    Respond(Vec<ThoughtPayload>),
    /// The agent was unavailable.
    Fail(String),
}

impl ScriptStep {
    /// A turn producing one thought.
    pub fn thought(content: impl Into<String>, confidence: f64) -> Self {
        ScriptStep::Respond(vec![ThoughtPayload::new(content, confidence)])
    }

    /// A turn producing several thoughts.
    pub fn thoughts<S: Into<String>>(items: impl IntoIterator<Item = (S, f64)>) -> Self {
        ScriptStep::Respond(
            items
                .into_iter()
                .map(|(content, confidence)| ThoughtPayload::new(content, confidence))
                .collect(),
        )
    }

    /// A turn where the agent is unavailable.
    pub fn fail(reason: impl Into<String>) -> Self {
        ScriptStep::Fail(reason.into())
    }
}

/// Replays [`ScriptStep`]s in order, repeating the last one once exhausted.
///
/// Output goes through the same persona post-processing as the model-backed
/// adapter, so parent resolution is identical.
#[derive(Debug)]
pub struct ScriptedAgent {
    persona: Persona,
    steps: Mutex<VecDeque<ScriptStep>>,
    last: Mutex<Option<ScriptStep>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedAgent {
    /// Create an agent for `persona` replaying `steps`.
    pub fn new(persona: Persona, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            persona,
            steps: Mutex::new(steps.into_iter().collect()),
            last: Mutex::new(None),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep before every turn
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of turns taken so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Option<ScriptStep> {
        let mut steps = self.steps.lock().unwrap_or_else(PoisonError::into_inner);
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(step) = steps.pop_front() {
            *last = Some(step);
        }
        last.clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn persona(&self) -> Persona {
        self.persona
    }

    async fn act(
        &self,
        snapshot: &RunSnapshot,
        prior: &[ThoughtNode],
    ) -> Result<Vec<ProposedNode>, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_step() {
            None => Ok(Vec::new()),
            Some(ScriptStep::Fail(reason)) => Err(AgentError::Unavailable {
                persona: self.persona,
                reason,
            }),
            Some(ScriptStep::Respond(thoughts)) => {
                let mode = PersonaConfig::default_for(self.persona).post_process;
                let fallback = snapshot.graph.root().map(|n| n.id);
                Ok(post_process(mode, &thoughts, prior, fallback))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ThoughtGraphStore, ThoughtKind};
    use crate::workflow::WorkflowStage;

    fn snapshot(store: &ThoughtGraphStore) -> RunSnapshot {
        RunSnapshot {
            run_id: "run".to_string(),
            problem: "p".to_string(),
            stage: WorkflowStage::ProblemDefinition,
            stage_round: 1,
            total_rounds: 1,
            backtracks: 0,
            graph: store.snapshot(),
        }
    }

    #[tokio::test]
    async fn test_replays_steps_then_repeats_last() {
        let store = ThoughtGraphStore::new();
        let root = store.create_root("p").unwrap();
        let agent = ScriptedAgent::new(
            Persona::Strategist,
            vec![ScriptStep::fail("down"), ScriptStep::thought("frame it", 0.8)],
        );
        let snap = snapshot(&store);

        assert!(agent.act(&snap, &[]).await.is_err());
        let first = agent.act(&snap, &[]).await.unwrap();
        let second = agent.act(&snap, &[]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].parents, vec![root]);
        assert_eq!(agent.calls(), 3);
    }

    #[tokio::test]
    async fn test_challenger_script_yields_critiques() {
        let store = ThoughtGraphStore::new();
        store.create_root("p").unwrap();
        let agent = ScriptedAgent::new(Persona::Challenger, vec![ScriptStep::thought("weak", 0.7)]);
        let out = agent.act(&snapshot(&store), &[]).await.unwrap();
        assert_eq!(out[0].kind, ThoughtKind::Critique);
    }

    #[tokio::test]
    async fn test_empty_script_contributes_nothing() {
        let store = ThoughtGraphStore::new();
        let agent = ScriptedAgent::new(Persona::Analyst, Vec::new());
        assert!(agent.act(&snapshot(&store), &[]).await.unwrap().is_empty());
    }
}
