//! Thought graph: the shared, evolving graph of thoughts produced by a run.
//!
//! [`ThoughtGraph`] is the pure data structure (canonical node map plus
//! children/by-agent/by-stage indices). [`ThoughtGraphStore`] wraps it with
//! synchronization and an append-only audit log, and is the only way nodes
//! are created or mutated during a run.
//!
//! Invariants maintained after every mutation:
//! - every non-root node has at least one parent, and parents always exist
//! - the graph is acyclic
//! - all indices agree with the canonical node map

mod store;


pub use store::{AuditAction, AuditEntry, ThoughtGraphStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::agents::Persona;
use crate::error::{GraphError, GraphResult};
use crate::workflow::WorkflowStage;

/// Unique, monotonically assigned thought node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches('n');
        digits
            .parse::<u64>()
            .map(NodeId)
            .map_err(|_| format!("Invalid node id: {}", s))
    }
}

/// Lifecycle status of a thought node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Submitted by an agent, awaiting resolution by the evaluator.
    #[default]
    Proposed,
    /// Confirmed; never dropped afterwards.
    Accepted,
    /// Refused by the evaluator.
    Rejected,
    /// A previously accepted node replaced by an accepted refinement.
    Superseded,
}

impl NodeStatus {
    /// Get the status name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Proposed => "proposed",
            NodeStatus::Accepted => "accepted",
            NodeStatus::Rejected => "rejected",
            NodeStatus::Superseded => "superseded",
        }
    }

    /// Whether moving from `self` to `next` is an allowed transition.
    ///
    /// Allowed: proposed→accepted, proposed→rejected, accepted→superseded.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        matches!(
            (self, next),
            (NodeStatus::Proposed, NodeStatus::Accepted)
                | (NodeStatus::Proposed, NodeStatus::Rejected)
                | (NodeStatus::Accepted, NodeStatus::Superseded)
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "proposed" => Ok(NodeStatus::Proposed),
            "accepted" => Ok(NodeStatus::Accepted),
            "rejected" => Ok(NodeStatus::Rejected),
            "superseded" => Ok(NodeStatus::Superseded),
            _ => Err(format!("Unknown node status: {}", s)),
        }
    }
}

/// What a thought node represents in the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThoughtKind {
    /// The root problem statement.
    Problem,
    /// An idea, claim or plan extending a line of thought.
    #[default]
    Proposal,
    /// A critique flagging weaknesses of its parent(s).
    Critique,
}

impl ThoughtKind {
    /// Get the kind name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            ThoughtKind::Problem => "problem",
            ThoughtKind::Proposal => "proposal",
            ThoughtKind::Critique => "critique",
        }
    }
}

impl std::fmt::Display for ThoughtKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ThoughtKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "problem" => Ok(ThoughtKind::Problem),
            "proposal" => Ok(ThoughtKind::Proposal),
            "critique" => Ok(ThoughtKind::Critique),
            _ => Err(format!("Unknown thought kind: {}", s)),
        }
    }
}

/// Authoring identity of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    /// The caller who posed the problem (root node only).
    Problem,
    /// One of the persona agents.
    Agent(Persona),
}

impl std::fmt::Display for Author {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Author::Problem => write!(f, "problem"),
            Author::Agent(persona) => write!(f, "{}", persona),
        }
    }
}

impl std::str::FromStr for Author {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("problem") {
            return Ok(Author::Problem);
        }
        s.parse::<Persona>().map(Author::Agent)
    }
}

/// One atomic thought in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtNode {
    /// Unique node identifier.
    pub id: NodeId,
    /// Who authored the node.
    pub author: Author,
    /// Workflow stage at creation.
    pub stage: WorkflowStage,
    /// Proposal, critique or the root problem.
    pub kind: ThoughtKind,
    /// The thought content.
    pub content: String,
    /// Parent node ids (empty only for the root).
    pub parents: BTreeSet<NodeId>,
    /// Current lifecycle status.
    pub status: NodeStatus,
    /// Quality score (0.0-1.0).
    pub score: f64,
    /// Creation sequence number, used for tie-breaking.
    pub sequence: u64,
    /// When the node was created.
    pub created_at: DateTime<Utc>,
    /// Optional structured payload returned by the agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ThoughtNode {
    /// Whether this node is the root problem statement.
    pub fn is_root(&self) -> bool {
        self.kind == ThoughtKind::Problem
    }

    /// Whether this node is a critique.
    pub fn is_critique(&self) -> bool {
        self.kind == ThoughtKind::Critique
    }

    /// Short single-line preview of the content.
    pub fn preview(&self, max_chars: usize) -> String {
        let flat: String = self.content.split_whitespace().collect::<Vec<_>>().join(" ");
        if flat.chars().count() <= max_chars {
            flat
        } else {
            let cut: String = flat.chars().take(max_chars).collect();
            format!("{}...", cut)
        }
    }
}

/// A node to be proposed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewThought {
    /// Parents the new node derives from.
    pub parents: Vec<NodeId>,
    /// Authoring persona.
    pub author: Author,
    /// Stage the node is proposed in.
    pub stage: WorkflowStage,
    /// Proposal or critique.
    pub kind: ThoughtKind,
    /// Content text.
    pub content: String,
    /// Score (clamped to 0.0-1.0).
    pub score: f64,
    /// Optional structured payload.
    pub metadata: Option<serde_json::Value>,
}

impl NewThought {
    /// Create a new proposal authored by `persona` at `stage`.
    pub fn new(
        parents: Vec<NodeId>,
        persona: Persona,
        stage: WorkflowStage,
        content: impl Into<String>,
    ) -> Self {
        Self {
            parents,
            author: Author::Agent(persona),
            stage,
            kind: ThoughtKind::Proposal,
            content: content.into(),
            score: 0.5,
            metadata: None,
        }
    }

    /// Set score
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score.clamp(0.0, 1.0);
        self
    }

    /// Set kind
    pub fn with_kind(mut self, kind: ThoughtKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ============================================================================
// ThoughtGraph
// ============================================================================

/// Canonical node mapping plus adjacency indices.
///
/// Mutations are `pub(crate)` and only reachable through
/// [`ThoughtGraphStore`]. Every mutation validates first and applies second,
/// so a failed call leaves the graph untouched.
#[derive(Debug, Clone, Default)]
pub struct ThoughtGraph {
    nodes: BTreeMap<NodeId, ThoughtNode>,
    children: HashMap<NodeId, BTreeSet<NodeId>>,
    by_agent: HashMap<Author, BTreeSet<NodeId>>,
    by_stage: HashMap<WorkflowStage, BTreeSet<NodeId>>,
    root: Option<NodeId>,
    next_id: u64,
    next_sequence: u64,
}

impl ThoughtGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a graph from persisted nodes, validating every invariant.
    pub fn restore(nodes: impl IntoIterator<Item = ThoughtNode>) -> GraphResult<Self> {
        let mut ordered: Vec<ThoughtNode> = nodes.into_iter().collect();
        ordered.sort_by_key(|n| n.sequence);

        let mut graph = Self::new();
        for node in ordered {
            if graph.nodes.contains_key(&node.id) {
                return Err(GraphError::Corrupt {
                    message: format!("duplicate node id {}", node.id),
                });
            }
            if node.is_root() {
                if let Some(root_id) = graph.root {
                    return Err(GraphError::RootExists { root_id });
                }
                if !node.parents.is_empty() {
                    return Err(GraphError::Corrupt {
                        message: format!("root {} has parents", node.id),
                    });
                }
                graph.root = Some(node.id);
            } else if node.parents.is_empty() {
                return Err(GraphError::InvalidParent {
                    parent: node.id,
                    reason: "non-root node has no parents".to_string(),
                });
            }
            graph.next_id = graph.next_id.max(node.id.0 + 1);
            graph.next_sequence = graph.next_sequence.max(node.sequence + 1);
            graph.index(&node);
            graph.nodes.insert(node.id, node);
        }

        // Parents may legitimately reference nodes with a later sequence after
        // a `link`, so existence and acyclicity are checked on the whole set.
        graph.check_invariants()?;
        Ok(graph)
    }

    /// Get a node by id.
    pub fn get(&self, id: NodeId) -> Option<&ThoughtNode> {
        self.nodes.get(&id)
    }

    /// The root problem node, if created.
    pub fn root(&self) -> Option<&ThoughtNode> {
        self.root.and_then(|id| self.nodes.get(&id))
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &ThoughtNode> {
        self.nodes.values()
    }

    /// Direct children of a node, in id order.
    pub fn children(&self, id: NodeId) -> Vec<&ThoughtNode> {
        self.children
            .get(&id)
            .map(|ids| ids.iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }

    /// Nodes authored by `author`, in id order.
    pub fn by_agent(&self, author: Author) -> Vec<&ThoughtNode> {
        self.lookup(self.by_agent.get(&author))
    }

    /// Nodes created at `stage`, in id order.
    pub fn by_stage(&self, stage: WorkflowStage) -> Vec<&ThoughtNode> {
        self.lookup(self.by_stage.get(&stage))
    }

    /// Accepted nodes at `stage` with no accepted children at that stage.
    ///
    /// Children proposed by later stages do not consume a stage's frontier,
    /// so a backtrack can re-enter a stage with its input intact. Critiques
    /// annotate rather than extend a line of thought, so they are neither
    /// frontier members nor count as accepted children.
    pub fn frontier(&self, stage: WorkflowStage) -> Vec<&ThoughtNode> {
        let mut frontier: Vec<&ThoughtNode> = self
            .by_stage(stage)
            .into_iter()
            .filter(|n| n.status == NodeStatus::Accepted && !n.is_critique())
            .filter(|n| {
                !self.children(n.id).iter().any(|c| {
                    c.status == NodeStatus::Accepted && !c.is_critique() && c.stage == stage
                })
            })
            .collect();
        frontier.sort_by_key(|n| n.sequence);
        frontier
    }

    /// Nodes at `stage` still awaiting resolution, in sequence order.
    pub fn proposed_at(&self, stage: WorkflowStage) -> Vec<&ThoughtNode> {
        let mut proposed: Vec<&ThoughtNode> = self
            .by_stage(stage)
            .into_iter()
            .filter(|n| n.status == NodeStatus::Proposed)
            .collect();
        proposed.sort_by_key(|n| n.sequence);
        proposed
    }

    /// Whether `to` is reachable from `from` by following child edges.
    pub fn is_reachable(&self, from: NodeId, to: NodeId) -> bool {
        if from == to {
            return true;
        }
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(kids) = self.children.get(&current) {
                for &kid in kids {
                    if kid == to {
                        return true;
                    }
                    stack.push(kid);
                }
            }
        }
        false
    }

    /// Verify all structural invariants. Used after restores and in tests.
    pub fn check_invariants(&self) -> GraphResult<()> {
        let mut expected_children: HashMap<NodeId, BTreeSet<NodeId>> = HashMap::new();
        let mut expected_agent: HashMap<Author, BTreeSet<NodeId>> = HashMap::new();
        let mut expected_stage: HashMap<WorkflowStage, BTreeSet<NodeId>> = HashMap::new();

        for node in self.nodes.values() {
            if !node.is_root() && node.parents.is_empty() {
                return Err(GraphError::InvalidParent {
                    parent: node.id,
                    reason: "non-root node has no parents".to_string(),
                });
            }
            for parent in &node.parents {
                if !self.nodes.contains_key(parent) {
                    return Err(GraphError::InvalidParent {
                        parent: *parent,
                        reason: format!("referenced by {} but does not exist", node.id),
                    });
                }
                expected_children.entry(*parent).or_default().insert(node.id);
            }
            expected_agent.entry(node.author).or_default().insert(node.id);
            expected_stage.entry(node.stage).or_default().insert(node.id);
        }

        let strip = |m: &HashMap<NodeId, BTreeSet<NodeId>>| -> HashMap<NodeId, BTreeSet<NodeId>> {
            m.iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, v)| (*k, v.clone()))
                .collect()
        };
        if strip(&self.children) != expected_children {
            return Err(GraphError::Corrupt {
                message: "children index out of sync".to_string(),
            });
        }
        if self.by_agent != expected_agent || self.by_stage != expected_stage {
            return Err(GraphError::Corrupt {
                message: "agent/stage index out of sync".to_string(),
            });
        }

        self.check_acyclic()
    }

    // Kahn's algorithm over the parent edges.
    fn check_acyclic(&self) -> GraphResult<()> {
        let mut in_degree: HashMap<NodeId, usize> =
            self.nodes.values().map(|n| (n.id, n.parents.len())).collect();
        let mut ready: Vec<NodeId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;

        while let Some(id) = ready.pop() {
            visited += 1;
            if let Some(kids) = self.children.get(&id) {
                for kid in kids {
                    if let Some(d) = in_degree.get_mut(kid) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push(*kid);
                        }
                    }
                }
            }
        }

        if visited == self.nodes.len() {
            return Ok(());
        }
        let stuck = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .min()
            .unwrap_or(NodeId(0));
        let parent = self
            .get(stuck)
            .and_then(|n| n.parents.iter().next().copied())
            .unwrap_or(stuck);
        Err(GraphError::CycleDetected {
            parent,
            child: stuck,
        })
    }

    // ------------------------------------------------------------------------
    // Mutations (store-only)
    // ------------------------------------------------------------------------

    pub(crate) fn insert_root(
        &mut self,
        stage: WorkflowStage,
        content: String,
    ) -> GraphResult<NodeId> {
        if let Some(root_id) = self.root {
            return Err(GraphError::RootExists { root_id });
        }

        let node = ThoughtNode {
            id: NodeId(self.next_id),
            author: Author::Problem,
            stage,
            kind: ThoughtKind::Problem,
            content,
            parents: BTreeSet::new(),
            status: NodeStatus::Accepted,
            score: 1.0,
            sequence: self.next_sequence,
            created_at: Utc::now(),
            metadata: None,
        };
        let id = node.id;

        self.next_id += 1;
        self.next_sequence += 1;
        self.root = Some(id);
        self.index(&node);
        self.nodes.insert(id, node);
        Ok(id)
    }

    pub(crate) fn insert_proposal(&mut self, thought: NewThought) -> GraphResult<NodeId> {
        let parents: BTreeSet<NodeId> = thought.parents.iter().copied().collect();
        let id = NodeId(self.next_id);

        if parents.is_empty() {
            return Err(GraphError::InvalidParent {
                parent: id,
                reason: "a non-root node needs at least one parent".to_string(),
            });
        }
        for parent in &parents {
            if !self.nodes.contains_key(parent) {
                return Err(GraphError::InvalidParent {
                    parent: *parent,
                    reason: "does not exist".to_string(),
                });
            }
        }
        // A fresh id cannot already have descendants; this only fires on a
        // corrupted id counter.
        if parents.contains(&id) || self.children.contains_key(&id) {
            return Err(GraphError::CycleDetected {
                parent: id,
                child: id,
            });
        }
        if thought.kind == ThoughtKind::Problem {
            return Err(GraphError::InvalidParent {
                parent: id,
                reason: "problem nodes can only be created as the root".to_string(),
            });
        }

        let node = ThoughtNode {
            id,
            author: thought.author,
            stage: thought.stage,
            kind: thought.kind,
            content: thought.content,
            parents,
            status: NodeStatus::Proposed,
            score: thought.score.clamp(0.0, 1.0),
            sequence: self.next_sequence,
            created_at: Utc::now(),
            metadata: thought.metadata,
        };

        self.next_id += 1;
        self.next_sequence += 1;
        self.index(&node);
        self.nodes.insert(id, node);
        Ok(id)
    }

    /// Returns `Ok(false)` when the edge already exists.
    pub(crate) fn add_edge(&mut self, parent: NodeId, child: NodeId) -> GraphResult<bool> {
        if !self.nodes.contains_key(&parent) {
            return Err(GraphError::InvalidParent {
                parent,
                reason: "does not exist".to_string(),
            });
        }
        let Some(child_node) = self.nodes.get(&child) else {
            return Err(GraphError::NodeNotFound { node_id: child });
        };
        if child_node.parents.contains(&parent) {
            return Ok(false);
        }
        if self.is_reachable(child, parent) {
            return Err(GraphError::CycleDetected { parent, child });
        }

        if let Some(node) = self.nodes.get_mut(&child) {
            node.parents.insert(parent);
        }
        self.children.entry(parent).or_default().insert(child);
        Ok(true)
    }

    /// Returns the previous status.
    pub(crate) fn update_status(
        &mut self,
        id: NodeId,
        status: NodeStatus,
    ) -> GraphResult<NodeStatus> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or(GraphError::NodeNotFound { node_id: id })?;
        let previous = node.status;
        if !previous.can_transition_to(status) {
            return Err(GraphError::InvalidStatusTransition {
                node_id: id,
                from: previous,
                to: status,
            });
        }
        node.status = status;
        Ok(previous)
    }

    fn index(&mut self, node: &ThoughtNode) {
        for parent in &node.parents {
            self.children.entry(*parent).or_default().insert(node.id);
        }
        self.by_agent.entry(node.author).or_default().insert(node.id);
        self.by_stage.entry(node.stage).or_default().insert(node.id);
    }

    fn lookup(&self, ids: Option<&BTreeSet<NodeId>>) -> Vec<&ThoughtNode> {
        ids.map(|ids| ids.iter().filter_map(|id| self.nodes.get(id)).collect())
            .unwrap_or_default()
    }
}
