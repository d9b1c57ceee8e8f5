use std::collections::{HashMap, HashSet};

use petgraph::{graph::NodeIndex, stable_graph::StableDiGraph, visit::Dfs};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    node::{Node, NodeKind, RawNode},
    util::MAX_DELAY,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("flow `{0}` has no start node")]
    MissingStart(String),
    #[error("flow `{flow_id}` has more than one start node: {nodes:?}")]
    MultipleStarts { flow_id: String, nodes: Vec<String> },
    #[error("node id `{0}` is used more than once")]
    DuplicateNode(String),
    #[error("edge `{edge_id}` points at unknown node `{node_id}`")]
    UnknownEdgeEndpoint { edge_id: String, node_id: String },
    #[error("nodes not reachable from start: {0:?}")]
    Unreachable(Vec<String>),
    #[error("node `{node_id}` is invalid: {reason}")]
    InvalidNode { node_id: String, reason: String },
    #[error("I/O error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source_node_id: String,
    pub target_node_id: String,
    /// `"true"` / `"false"` on the outgoing edges of a condition node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_label: Option<String>,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_node_id: source.into(),
            target_node_id: target.into(),
            branch_label: None,
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.branch_label = Some(label.into());
        self
    }
}

/// How a flow gets started for a contact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowTriggers {
    /// Matched against the whole inbound text, case-insensitively.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    /// External event names, e.g. `contact_created`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
}

/// An immutable flow graph. Build it once, then share it behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    id: String,
    #[serde(default)]
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    variant_id: Option<String>,
    organization_id: String,
    #[serde(default)]
    name: String,
    #[serde(default = "FlowDefinition::default_active")]
    active: bool,
    #[serde(default)]
    triggers: FlowTriggers,
    #[schemars(with = "Vec<RawNode>")]
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,

    #[serde(skip)]
    #[schemars(skip)]
    index_of: HashMap<String, usize>,
    #[serde(skip)]
    #[schemars(skip)]
    outgoing: HashMap<String, Vec<usize>>,
    #[serde(skip)]
    #[schemars(skip)]
    start_id: Option<String>,
}

impl PartialEq for FlowDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.version == other.version
            && self.variant_id == other.variant_id
            && self.organization_id == other.organization_id
            && self.name == other.name
            && self.active == other.active
            && self.triggers == other.triggers
            && self.nodes == other.nodes
            && self.edges == other.edges
        // index_of, outgoing, start_id are derived
    }
}

impl FlowDefinition {
    fn default_active() -> bool {
        true
    }

    /// Create a new, empty flow for an organization.
    pub fn new(id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        FlowDefinition {
            id: id.into(),
            version: 0,
            variant_id: None,
            organization_id: organization_id.into(),
            name: String::new(),
            active: true,
            triggers: FlowTriggers::default(),
            nodes: Vec::new(),
            edges: Vec::new(),
            index_of: HashMap::new(),
            outgoing: HashMap::new(),
            start_id: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_variant(mut self, variant_id: impl Into<String>) -> Self {
        self.variant_id = Some(variant_id.into());
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers.events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn add_node(mut self, id: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.push(Node::new(id, kind));
        self
    }

    pub fn add_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Shorthand for an unlabeled edge `from -> to`.
    pub fn connect(self, from: &str, to: &str) -> Self {
        let id = format!("{}->{}", from, to);
        self.add_edge(Edge::new(id, from, to))
    }

    /// Validate the graph and build the lookup tables.
    ///
    /// Rejects flows without exactly one `start`, with duplicate node ids,
    /// edges to unknown nodes, or nodes that `start` cannot reach, and delays
    /// longer than [`MAX_DELAY`]. Cycles are allowed; the executor bounds the
    /// steps of a single advance instead.
    pub fn build(mut self) -> Result<Self, DefinitionError> {
        let mut index_of = HashMap::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            if index_of.insert(node.id.clone(), i).is_some() {
                return Err(DefinitionError::DuplicateNode(node.id.clone()));
            }
            if let NodeKind::Delay(delay) = &node.kind {
                if delay.seconds > MAX_DELAY.as_secs() {
                    return Err(DefinitionError::InvalidNode {
                        node_id: node.id.clone(),
                        reason: format!(
                            "delay of {}s exceeds the maximum of {}s",
                            delay.seconds,
                            MAX_DELAY.as_secs()
                        ),
                    });
                }
            }
        }

        let starts: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.kind.is_start())
            .map(|n| n.id.clone())
            .collect();
        let start_id = match starts.as_slice() {
            [] => return Err(DefinitionError::MissingStart(self.id.clone())),
            [only] => only.clone(),
            _ => {
                return Err(DefinitionError::MultipleStarts {
                    flow_id: self.id.clone(),
                    nodes: starts,
                });
            }
        };

        let mut graph: StableDiGraph<usize, ()> = StableDiGraph::new();
        let vertices: Vec<NodeIndex> = (0..self.nodes.len()).map(|i| graph.add_node(i)).collect();
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();

        for (ei, edge) in self.edges.iter().enumerate() {
            let from = *index_of.get(&edge.source_node_id).ok_or_else(|| {
                DefinitionError::UnknownEdgeEndpoint {
                    edge_id: edge.id.clone(),
                    node_id: edge.source_node_id.clone(),
                }
            })?;
            let to = *index_of.get(&edge.target_node_id).ok_or_else(|| {
                DefinitionError::UnknownEdgeEndpoint {
                    edge_id: edge.id.clone(),
                    node_id: edge.target_node_id.clone(),
                }
            })?;
            graph.add_edge(vertices[from], vertices[to], ());
            outgoing.entry(edge.source_node_id.clone()).or_default().push(ei);
        }

        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(&graph, vertices[index_of[&start_id]]);
        while let Some(nx) = dfs.next(&graph) {
            reachable.insert(graph[nx]);
        }
        let unreachable: Vec<String> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| !reachable.contains(i))
            .map(|(_, n)| n.id.clone())
            .collect();
        if !unreachable.is_empty() {
            return Err(DefinitionError::Unreachable(unreachable));
        }

        self.index_of = index_of;
        self.outgoing = outgoing;
        self.start_id = Some(start_id);
        Ok(self)
    }

    pub fn is_built(&self) -> bool {
        self.start_id.is_some()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    pub fn variant_id(&self) -> Option<&str> {
        self.variant_id.as_deref()
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn triggers(&self) -> &FlowTriggers {
        &self.triggers
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn start_node_id(&self) -> Option<&str> {
        self.start_id.as_deref()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index_of.get(id).map(|&i| &self.nodes[i])
    }

    /// Outgoing edges of `id`, in definition order.
    pub fn outgoing(&self, id: &str) -> Vec<&Edge> {
        self.outgoing
            .get(id)
            .map(|ixs| ixs.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    /// The single edge a non-branching node follows.
    pub fn next_after(&self, id: &str) -> Option<&Edge> {
        self.outgoing(id).into_iter().next()
    }

    /// Edge labeled with the boolean outcome, else the first outgoing edge.
    pub fn branch(&self, id: &str, outcome: bool) -> Option<&Edge> {
        let label = if outcome { "true" } else { "false" };
        let edges = self.outgoing(id);
        edges
            .iter()
            .find(|e| {
                e.branch_label
                    .as_deref()
                    .is_some_and(|l| l.trim().eq_ignore_ascii_case(label))
            })
            .copied()
            .or_else(|| edges.first().copied())
    }

    /// Whole-text keyword match. Flows without keywords catch everything,
    /// unless they are event-triggered.
    pub fn matches_text(&self, text: &str) -> bool {
        let text = text.trim();
        if self.triggers.keywords.is_empty() {
            return self.triggers.events.is_empty();
        }
        self.triggers
            .keywords
            .iter()
            .any(|k| k.trim().eq_ignore_ascii_case(text))
    }

    pub fn matches_event(&self, event_type: &str) -> bool {
        self.triggers
            .events
            .iter()
            .any(|e| e.trim().eq_ignore_ascii_case(event_type.trim()))
    }
}
