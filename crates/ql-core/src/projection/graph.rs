use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use super::{Cursor, Guarded, Projection, ProjectionError, ProjectionState, read, write};
use crate::event::Event;
use crate::event_type::EventType;
use crate::payload::{IdentityRegistered, PolicyUpdated, ProviderPollObserved};
use crate::policy::is_global_scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Provider,
    Identity,
    Scope,
    Pool,
    Constraint,
    Workload,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    /// Provider -> constraint
    Observes,
    /// Constraint -> scope
    AppliesTo,
    /// Identity or scope -> pool
    ConsumesFrom,
    /// Pool -> constraint
    Bounds,
    /// Pool -> identity
    SharedWith,
    /// Identity -> resource
    Owns,
    /// Workload -> identity
    Triggers,
    /// Constraint -> workload or identity
    Limits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub label: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl NodeType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Identity => "identity",
            Self::Scope => "scope",
            Self::Pool => "pool",
            Self::Constraint => "constraint",
            Self::Workload => "workload",
            Self::Resource => "resource",
        }
    }
}

/// Map key of a node: `<type>:<id>`. Ids only need to be unique per type.
pub fn node_key(node_type: NodeType, id: &str) -> String {
    format!("{}:{id}", node_type.as_str())
}

impl Node {
    fn new(id: &str, node_type: NodeType) -> Self {
        Self {
            id: id.to_string(),
            node_type,
            label: id.to_string(),
            properties: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> String {
        node_key(self.node_type, &self.id)
    }
}

/// A directed edge between two node keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
}

/// Nodes and edges relating providers, identities, scopes, and constraints.
///
/// Nodes are keyed by [`node_key`], so a provider and an identity may share
/// an id without touching each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintGraph {
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
}

impl ConstraintGraph {
    pub fn node(&self, node_type: NodeType, id: &str) -> Option<&Node> {
        self.nodes.get(&node_key(node_type, id))
    }

    fn insert_node(&mut self, node: Node) {
        self.nodes.insert(node.key(), node);
    }

    fn ensure_node(&mut self, id: &str, node_type: NodeType) -> String {
        let key = node_key(node_type, id);
        self.nodes
            .entry(key.clone())
            .or_insert_with(|| Node::new(id, node_type));
        key
    }

    fn add_edge(&mut self, edge: Edge) {
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    fn remove_node(&mut self, key: &str) {
        self.nodes.remove(key);
        self.edges.retain(|e| e.from != key && e.to != key);
    }
}

#[derive(Debug, Default)]
struct GraphState {
    graph: ConstraintGraph,
    /// scope id -> constraint ids, derived from `applies_to` edges.
    scope_index: BTreeMap<String, BTreeSet<String>>,
}

impl GraphState {
    fn from_graph(graph: ConstraintGraph) -> Self {
        let mut state = Self {
            graph,
            scope_index: BTreeMap::new(),
        };
        state.reindex();
        state
    }

    fn reindex(&mut self) {
        let mut scope_index: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for edge in self.graph.edges.iter().filter(|e| e.edge_type == EdgeType::AppliesTo) {
            let (Some(constraint), Some(scope)) =
                (self.graph.nodes.get(&edge.from), self.graph.nodes.get(&edge.to))
            else {
                continue;
            };
            scope_index
                .entry(scope.id.clone())
                .or_default()
                .insert(constraint.id.clone());
        }
        self.scope_index = scope_index;
    }

    fn remove_node(&mut self, key: &str) {
        self.graph.remove_node(key);
        self.reindex();
    }

    fn replace_constraints(&mut self, policies: PolicyUpdated) {
        let incoming: BTreeSet<String> = policies
            .policies
            .iter()
            .map(|p| node_key(NodeType::Constraint, &p.id))
            .collect();
        let stale: Vec<String> = self
            .graph
            .nodes
            .values()
            .filter(|n| n.node_type == NodeType::Constraint)
            .map(Node::key)
            .filter(|key| !incoming.contains(key))
            .collect();
        for key in &stale {
            self.graph.remove_node(key);
        }
        // A kept constraint may have moved scope; its old link goes.
        self.graph
            .edges
            .retain(|e| !(e.edge_type == EdgeType::AppliesTo && incoming.contains(&e.from)));

        for policy in policies.policies {
            let scope = if is_global_scope(&policy.scope) {
                "global".to_string()
            } else {
                policy.scope
            };
            let mut node = Node::new(&policy.id, NodeType::Constraint);
            node.properties.insert("type".into(), policy.kind);
            if let Some(limit) = policy.limit {
                node.properties.insert("limit".into(), limit.to_string());
            }
            let from = node.key();
            self.graph.insert_node(node);
            let to = self.graph.ensure_node(&scope, NodeType::Scope);
            self.graph.add_edge(Edge {
                from,
                to,
                edge_type: EdgeType::AppliesTo,
            });
        }
        self.reindex();
    }
}

#[derive(Debug, Default)]
pub struct GraphProjection {
    inner: RwLock<Guarded<GraphState>>,
}

impl GraphProjection {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the current graph.
    pub fn graph(&self) -> ConstraintGraph {
        read(&self.inner).data.graph.clone()
    }

    /// Constraint nodes whose `applies_to` edge points at `scope_id`.
    pub fn constraints_for_scope(&self, scope_id: &str) -> Vec<Node> {
        let guard = read(&self.inner);
        guard
            .data
            .scope_index
            .get(scope_id)
            .into_iter()
            .flatten()
            .filter_map(|id| guard.data.graph.node(NodeType::Constraint, id))
            .cloned()
            .collect()
    }
}

impl Projection for GraphProjection {
    type View = ConstraintGraph;

    const NAME: &'static str = "constraint_graph";

    fn apply(&self, event: &Event) -> Result<(), ProjectionError> {
        let mut guard = write(&self.inner);
        match event.event_type {
            EventType::IdentityRegistered => {
                let payload: IdentityRegistered = event.decode_payload()?;
                let mut node = Node::new(&event.dimensions.identity_id, NodeType::Identity);
                if !payload.kind.is_empty() {
                    node.properties.insert("kind".into(), payload.kind);
                }
                guard.data.graph.insert_node(node);
            }
            EventType::IdentityDeleted => guard
                .data
                .remove_node(&node_key(NodeType::Identity, &event.dimensions.identity_id)),
            EventType::PolicyUpdated => {
                let payload: PolicyUpdated = event.decode_payload()?;
                guard.data.replace_constraints(payload);
            }
            EventType::ProviderPollObserved => {
                let payload: ProviderPollObserved = event.decode_payload()?;
                if !payload.provider_id.is_empty() {
                    guard
                        .data
                        .graph
                        .ensure_node(&payload.provider_id, NodeType::Provider);
                }
            }
            _ => {}
        }
        guard.cursor = Some(Cursor::of(event));
        Ok(())
    }

    fn state(&self) -> ProjectionState<Self::View> {
        let guard = read(&self.inner);
        ProjectionState {
            cursor: guard.cursor.clone(),
            view: guard.data.graph.clone(),
        }
    }

    fn load_state(&self, cursor: Option<Cursor>, view: Self::View) {
        let state = GraphState::from_graph(view);
        let mut guard = write(&self.inner);
        guard.cursor = cursor;
        guard.data = state;
    }
}
