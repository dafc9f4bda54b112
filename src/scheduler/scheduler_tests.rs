//! Unit tests for the turn scheduler.

use super::*;
use crate::agents::{ScriptStep, ScriptedAgent};
use crate::config::StagePlan;
use async_trait::async_trait;
use std::sync::Mutex;

/// Records the prior node ids it was shown and proposes nothing.
struct PriorRecorder {
    persona: Persona,
    seen: Mutex<Vec<Vec<NodeId>>>,
}

impl PriorRecorder {
    fn new(persona: Persona) -> Self {
        Self {
            persona,
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Agent for PriorRecorder {
    fn persona(&self) -> Persona {
        self.persona
    }

    async fn act(
        &self,
        _snapshot: &RunSnapshot,
        prior: &[ThoughtNode],
    ) -> Result<Vec<ProposedNode>, AgentError> {
        self.seen.lock().unwrap().push(prior.iter().map(|n| n.id).collect());
        Ok(Vec::new())
    }
}

/// Returns fixed proposals every turn.
struct FixedAgent {
    persona: Persona,
    proposals: Vec<ProposedNode>,
}

#[async_trait]
impl Agent for FixedAgent {
    fn persona(&self) -> Persona {
        self.persona
    }

    async fn act(
        &self,
        _snapshot: &RunSnapshot,
        _prior: &[ThoughtNode],
    ) -> Result<Vec<ProposedNode>, AgentError> {
        Ok(self.proposals.clone())
    }
}

fn seeded() -> (ThoughtGraphStore, NodeId) {
    let store = ThoughtGraphStore::new();
    let root = store.create_root("Should we enter market X?").unwrap();
    (store, root)
}

fn context(store: &ThoughtGraphStore, stage: WorkflowStage) -> RunSnapshot {
    RunSnapshot {
        run_id: "run-sched".to_string(),
        problem: "Should we enter market X?".to_string(),
        stage,
        stage_round: 1,
        total_rounds: 1,
        backtracks: 0,
        graph: store.snapshot(),
    }
}

fn plan(stage: WorkflowStage, agents: Vec<Persona>, mode: InvocationMode) -> StagePlan {
    StagePlan::default_for(stage, 0.6, 5)
        .with_agents(agents)
        .with_mode(mode)
}

fn scheduler(agents: Vec<Arc<dyn Agent>>, timeout_ms: u64) -> TurnScheduler {
    TurnScheduler::new(agents, Duration::from_millis(timeout_ms), 3)
}

fn author_of(store: &ThoughtGraphStore, id: NodeId) -> Author {
    store.get(id).unwrap().author
}

#[tokio::test]
async fn test_parallel_submission_follows_persona_priority() {
    let (store, root) = seeded();
    // Strategist finishes last but has the highest priority.
    let agents: Vec<Arc<dyn Agent>> = vec![
        Arc::new(
            ScriptedAgent::new(Persona::Strategist, vec![ScriptStep::thought("s", 0.7)])
                .with_delay(Duration::from_millis(50)),
        ),
        Arc::new(ScriptedAgent::new(
            Persona::CreativeThinker,
            vec![ScriptStep::thoughts(vec![("c1", 0.8), ("c2", 0.6)])],
        )),
        Arc::new(ScriptedAgent::new(Persona::Researcher, vec![ScriptStep::thought("r", 0.9)])),
    ];
    let plan = plan(
        WorkflowStage::Brainstorming,
        vec![Persona::Researcher, Persona::CreativeThinker, Persona::Strategist],
        InvocationMode::Parallel,
    );

    let outcome = scheduler(agents, 5_000)
        .run_round(&plan, &store, &context(&store, WorkflowStage::Brainstorming))
        .await;

    let authors: Vec<Author> = outcome.submitted.iter().map(|id| author_of(&store, *id)).collect();
    assert_eq!(
        authors,
        vec![
            Author::Agent(Persona::Strategist),
            Author::Agent(Persona::CreativeThinker),
            Author::Agent(Persona::CreativeThinker),
            Author::Agent(Persona::Researcher),
        ]
    );
    let contents: Vec<String> = outcome
        .submitted
        .iter()
        .map(|id| store.get(*id).unwrap().content)
        .collect();
    assert_eq!(contents, vec!["s", "c1", "c2", "r"]);
    assert!(outcome.submitted.windows(2).all(|w| w[0] < w[1]));
    assert!(store.get(outcome.submitted[0]).unwrap().parents.contains(&root));
    assert!(!outcome.timed_out);
}

#[tokio::test]
async fn test_unsorted_plan_still_submits_in_priority_order() {
    let (store, _) = seeded();
    let agents: Vec<Arc<dyn Agent>> = vec![
        Arc::new(ScriptedAgent::new(Persona::Strategist, vec![ScriptStep::thought("s", 0.7)])),
        Arc::new(ScriptedAgent::new(Persona::Researcher, vec![ScriptStep::thought("r", 0.9)])),
    ];
    let scheduler = scheduler(agents, 5_000);

    for mode in [InvocationMode::Parallel, InvocationMode::Sequential] {
        // Field edits bypass the sorting builders.
        let mut plan = plan(WorkflowStage::Brainstorming, vec![], mode);
        plan.agents = vec![Persona::Researcher, Persona::Strategist, Persona::Researcher];

        let outcome = scheduler
            .run_round(&plan, &store, &context(&store, WorkflowStage::Brainstorming))
            .await;

        let authors: Vec<Author> = outcome
            .submitted
            .iter()
            .map(|id| author_of(&store, *id))
            .collect();
        assert_eq!(
            authors,
            vec![
                Author::Agent(Persona::Strategist),
                Author::Agent(Persona::Researcher),
            ],
            "mode {}",
            mode
        );
        let personas: Vec<Persona> = outcome.contributions.iter().map(|c| c.persona).collect();
        assert_eq!(personas, vec![Persona::Strategist, Persona::Researcher]);
    }
}

#[tokio::test]
async fn test_run_deadline_closes_round_before_round_timeout() {
    let (store, _) = seeded();
    let agents: Vec<Arc<dyn Agent>> = vec![
        Arc::new(
            ScriptedAgent::new(Persona::Strategist, vec![ScriptStep::thought("s", 0.7)])
                .with_delay(Duration::from_secs(2)),
        ),
        Arc::new(
            ScriptedAgent::new(Persona::Analyst, vec![ScriptStep::thought("a", 0.7)])
                .with_delay(Duration::from_secs(2)),
        ),
    ];
    let plan = plan(
        WorkflowStage::ProblemDefinition,
        vec![Persona::Strategist, Persona::Analyst],
        InvocationMode::Sequential,
    );

    let started = Instant::now();
    let outcome = scheduler(agents, 10_000)
        .run_round_until(
            &plan,
            &store,
            &context(&store, WorkflowStage::ProblemDefinition),
            Some(started + Duration::from_millis(100)),
        )
        .await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(outcome.timed_out);
    assert!(outcome.all_unavailable());
    assert!(outcome.submitted.is_empty());
}

#[tokio::test]
async fn test_parallel_unavailable_agent_is_a_noop() {
    let (store, _) = seeded();
    let agents: Vec<Arc<dyn Agent>> = vec![
        Arc::new(ScriptedAgent::new(Persona::Strategist, vec![ScriptStep::thought("s", 0.7)])),
        Arc::new(ScriptedAgent::new(
            Persona::CreativeThinker,
            vec![ScriptStep::fail("model down")],
        )),
        Arc::new(ScriptedAgent::new(Persona::Researcher, vec![ScriptStep::thought("r", 0.9)])),
    ];
    let plan = plan(
        WorkflowStage::Brainstorming,
        vec![Persona::Strategist, Persona::CreativeThinker, Persona::Researcher],
        InvocationMode::Parallel,
    );

    let outcome = scheduler(agents, 5_000)
        .run_round(&plan, &store, &context(&store, WorkflowStage::Brainstorming))
        .await;

    assert_eq!(outcome.submitted.len(), 2);
    assert_eq!(outcome.unavailable_count(), 1);
    assert!(!outcome.all_unavailable());
    assert_eq!(
        outcome.contributions[1].status,
        ContributionStatus::Unavailable {
            reason: "model down".to_string()
        }
    );
}

#[tokio::test]
async fn test_parallel_round_timeout_cancels_slow_agent() {
    let (store, _) = seeded();
    let slow = Arc::new(
        ScriptedAgent::new(Persona::Researcher, vec![ScriptStep::thought("late", 0.9)])
            .with_delay(Duration::from_secs(30)),
    );
    let agents: Vec<Arc<dyn Agent>> = vec![
        Arc::new(ScriptedAgent::new(Persona::Strategist, vec![ScriptStep::thought("s", 0.7)])),
        slow.clone(),
    ];
    let plan = plan(
        WorkflowStage::Brainstorming,
        vec![Persona::Strategist, Persona::Researcher],
        InvocationMode::Parallel,
    );

    let outcome = scheduler(agents, 100)
        .run_round(&plan, &store, &context(&store, WorkflowStage::Brainstorming))
        .await;

    assert!(outcome.timed_out);
    assert_eq!(outcome.submitted.len(), 1);
    assert!(matches!(
        &outcome.contributions[1].status,
        ContributionStatus::Unavailable { reason } if reason == "round timeout"
    ));
    // Partial output of the cancelled agent never reaches the store.
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn test_sequential_agents_see_earlier_proposals() {
    let (store, root) = seeded();
    let recorder = Arc::new(PriorRecorder::new(Persona::Analyst));
    let agents: Vec<Arc<dyn Agent>> = vec![
        Arc::new(ScriptedAgent::new(
            Persona::Strategist,
            vec![ScriptStep::thought("Frame: growth vs. risk", 0.8)],
        )),
        recorder.clone(),
    ];
    let plan = plan(
        WorkflowStage::ProblemDefinition,
        vec![Persona::Strategist, Persona::Analyst],
        InvocationMode::Sequential,
    );

    let outcome = scheduler(agents, 5_000)
        .run_round(&plan, &store, &context(&store, WorkflowStage::ProblemDefinition))
        .await;

    let framed = outcome.submitted[0];
    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen, vec![vec![root, framed]]);
}

#[tokio::test]
async fn test_parallel_agents_share_one_snapshot() {
    let (store, root) = seeded();
    let recorder = Arc::new(PriorRecorder::new(Persona::Analyst));
    let agents: Vec<Arc<dyn Agent>> = vec![
        Arc::new(ScriptedAgent::new(Persona::Strategist, vec![ScriptStep::thought("s", 0.8)])),
        recorder.clone(),
    ];
    let plan = plan(
        WorkflowStage::ProblemDefinition,
        vec![Persona::Strategist, Persona::Analyst],
        InvocationMode::Parallel,
    );

    scheduler(agents, 5_000)
        .run_round(&plan, &store, &context(&store, WorkflowStage::ProblemDefinition))
        .await;

    assert_eq!(recorder.seen.lock().unwrap().clone(), vec![vec![root]]);
}

#[tokio::test]
async fn test_store_refusal_does_not_abort_round() {
    let (store, root) = seeded();
    let agents: Vec<Arc<dyn Agent>> = vec![Arc::new(FixedAgent {
        persona: Persona::Analyst,
        proposals: vec![
            ProposedNode::new(vec![NodeId(404)], "dangling", 0.9),
            ProposedNode::new(vec![root], "valid", 0.9),
        ],
    })];
    let plan = plan(
        WorkflowStage::Analysis,
        vec![Persona::Analyst],
        InvocationMode::Sequential,
    );

    let outcome = scheduler(agents, 5_000)
        .run_round(&plan, &store, &context(&store, WorkflowStage::Analysis))
        .await;

    let contribution = &outcome.contributions[0];
    assert_eq!(contribution.status, ContributionStatus::Completed);
    assert_eq!(contribution.submitted.len(), 1);
    assert_eq!(contribution.refused.len(), 1);
    assert!(contribution.refused[0].reason.contains("n404"));
}

#[tokio::test]
async fn test_unregistered_and_failing_agents_make_round_all_unavailable() {
    let (store, _) = seeded();
    let agents: Vec<Arc<dyn Agent>> = vec![Arc::new(ScriptedAgent::new(
        Persona::Analyst,
        vec![ScriptStep::fail("quota")],
    ))];
    let plan = plan(
        WorkflowStage::Analysis,
        vec![Persona::Analyst, Persona::Challenger],
        InvocationMode::Parallel,
    );

    let outcome = scheduler(agents, 5_000)
        .run_round(&plan, &store, &context(&store, WorkflowStage::Analysis))
        .await;

    assert!(outcome.all_unavailable());
    assert!(matches!(
        &outcome.contributions[1].status,
        ContributionStatus::Unavailable { reason } if reason == "no agent registered"
    ));
}

#[tokio::test]
async fn test_concurrency_limit_of_one_still_runs_every_agent() {
    let (store, _) = seeded();
    let agents: Vec<Arc<dyn Agent>> = Persona::ALL
        .iter()
        .map(|p| {
            Arc::new(ScriptedAgent::new(*p, vec![ScriptStep::thought("x", 0.7)])) as Arc<dyn Agent>
        })
        .collect();
    let plan = plan(WorkflowStage::Brainstorming, Persona::ALL.to_vec(), InvocationMode::Parallel);

    let outcome = TurnScheduler::new(agents, Duration::from_secs(5), 1)
        .run_round(&plan, &store, &context(&store, WorkflowStage::Brainstorming))
        .await;

    // The challenger's output is a critique of the root; all seven submit.
    assert_eq!(outcome.submitted.len(), 7);
    assert_eq!(outcome.unavailable_count(), 0);
}

#[test]
fn test_prior_nodes_dedups_and_excludes_critiques() {
    let (store, root) = seeded();
    let idea = store
        .propose(NewThought::new(
            vec![root],
            Persona::Analyst,
            WorkflowStage::ProblemDefinition,
            "i",
        ))
        .unwrap();
    store
        .propose(
            NewThought::new(vec![root], Persona::Challenger, WorkflowStage::ProblemDefinition, "c")
                .with_kind(crate::graph::ThoughtKind::Critique),
        )
        .unwrap();

    let prior = prior_nodes(&store.snapshot(), WorkflowStage::ProblemDefinition);
    let ids: Vec<NodeId> = prior.iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![root, idea]);
}
