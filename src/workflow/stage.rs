//! Workflow stages and their entry/exit predicates.

use serde::{Deserialize, Serialize};

use crate::graph::{ThoughtGraph, ThoughtNode};

/// A phase of the workflow, in its fixed order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    /// Frame and clarify the problem statement.
    ProblemDefinition,
    /// Generate candidate ideas.
    Brainstorming,
    /// Examine ideas against evidence and constraints.
    Analysis,
    /// Integrate analysed ideas into coherent options.
    Synthesis,
    /// Compare options and pick the strongest.
    Evaluation,
    /// Commit to a decision.
    Decision,
    /// Plan the execution of the decision.
    Action,
}

impl WorkflowStage {
    /// All stages in order.
    pub const ALL: [WorkflowStage; 7] = [
        WorkflowStage::ProblemDefinition,
        WorkflowStage::Brainstorming,
        WorkflowStage::Analysis,
        WorkflowStage::Synthesis,
        WorkflowStage::Evaluation,
        WorkflowStage::Decision,
        WorkflowStage::Action,
    ];

    /// Get the stage name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStage::ProblemDefinition => "problem_definition",
            WorkflowStage::Brainstorming => "brainstorming",
            WorkflowStage::Analysis => "analysis",
            WorkflowStage::Synthesis => "synthesis",
            WorkflowStage::Evaluation => "evaluation",
            WorkflowStage::Decision => "decision",
            WorkflowStage::Action => "action",
        }
    }

    /// Position in the stage sequence (0-based).
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// The next stage, or `None` after `Action`.
    pub fn next(&self) -> Option<WorkflowStage> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// The previous stage, or `None` for `ProblemDefinition`.
    pub fn previous(&self) -> Option<WorkflowStage> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    /// Accepted frontier this stage builds on.
    ///
    /// For `ProblemDefinition` this is its own frontier (the root). Otherwise
    /// it is the frontier of the nearest earlier stage that has one.
    pub fn input_frontier<'g>(&self, graph: &'g ThoughtGraph) -> Vec<&'g ThoughtNode> {
        if *self == WorkflowStage::ProblemDefinition {
            return graph.frontier(*self);
        }
        let mut stage = self.previous();
        while let Some(s) = stage {
            let frontier = graph.frontier(s);
            if !frontier.is_empty() {
                return frontier;
            }
            stage = s.previous();
        }
        Vec::new()
    }

    /// Entry predicate: there is something for this stage to work on.
    pub fn entry_ready(&self, graph: &ThoughtGraph) -> bool {
        match self {
            WorkflowStage::ProblemDefinition => graph.root().is_some(),
            _ => !self.input_frontier(graph).is_empty(),
        }
    }

    /// Exit predicate: the stage has produced a large enough frontier during
    /// the current visit.
    pub fn exit_ready(
        &self,
        graph: &ThoughtGraph,
        min_frontier: usize,
        accepted_in_visit: usize,
    ) -> bool {
        accepted_in_visit > 0 && graph.frontier(*self).len() >= min_frontier.max(1)
    }
}

impl std::fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkflowStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "problem_definition" | "problemdefinition" => Ok(WorkflowStage::ProblemDefinition),
            "brainstorming" => Ok(WorkflowStage::Brainstorming),
            "analysis" => Ok(WorkflowStage::Analysis),
            "synthesis" => Ok(WorkflowStage::Synthesis),
            "evaluation" => Ok(WorkflowStage::Evaluation),
            "decision" => Ok(WorkflowStage::Decision),
            "action" => Ok(WorkflowStage::Action),
            _ => Err(format!("Unknown workflow stage: {}", s)),
        }
    }
}
