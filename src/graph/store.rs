//! In-memory graph image
//!
//! `GraphStore` holds one consistent version of the graph: the committed
//! image shared by readers, or a private copy owned by a write transaction.
//! Lookups go through hash indices; node and relationship maps are ordered
//! by id so scans are deterministic.

use super::edge::Edge;
use super::mutation::Mutation;
use super::node::Node;
use super::property::PropertyValue;
use super::types::{EdgeId, EdgeType, Label, NodeId};
use crate::vector::{DistanceMetric, VectorError, VectorIndex};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors that can occur during graph operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Node {0} not found")]
    NodeNotFound(NodeId),

    #[error("Edge {0} not found")]
    EdgeNotFound(EdgeId),

    #[error("Node {0} already exists")]
    NodeAlreadyExists(NodeId),

    #[error("Edge {0} already exists")]
    EdgeAlreadyExists(EdgeId),

    #[error("Invalid edge: source node {0} does not exist")]
    InvalidEdgeSource(NodeId),

    #[error("Invalid edge: target node {0} does not exist")]
    InvalidEdgeTarget(NodeId),

    #[error("Cannot delete node {0} because it still has relationships; use DETACH DELETE")]
    NodeHasRelationships(NodeId),

    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),
}

pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeId, Edge>,
    outgoing: FxHashMap<NodeId, Vec<EdgeId>>,
    incoming: FxHashMap<NodeId, Vec<EdgeId>>,
    label_index: FxHashMap<Label, BTreeSet<NodeId>>,
    edge_type_index: FxHashMap<EdgeType, BTreeSet<EdgeId>>,
    vectors: VectorIndex,
    next_node_id: u64,
    next_edge_id: u64,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metric(metric: DistanceMetric) -> Self {
        GraphStore {
            vectors: VectorIndex::new(metric),
            ..Self::default()
        }
    }

    // ---- reads ----

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(&id)
    }

    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn has_edge(&self, id: EdgeId) -> bool {
        self.edges.contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    /// All node ids in ascending order
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Ids of nodes carrying `label`, ascending
    pub fn nodes_with_label(&self, label: &Label) -> Vec<NodeId> {
        self.label_index
            .get(label)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn label_cardinality(&self, label: &Label) -> usize {
        self.label_index.get(label).map_or(0, |ids| ids.len())
    }

    /// Nodes with `label` whose property `key` equals `value`
    pub fn find_nodes(&self, label: &Label, key: &str, value: &PropertyValue) -> Vec<NodeId> {
        self.label_index
            .get(label)
            .into_iter()
            .flatten()
            .filter(|id| {
                self.nodes
                    .get(id)
                    .and_then(|n| n.get_property(key))
                    .is_some_and(|v| v == value)
            })
            .copied()
            .collect()
    }

    pub fn edges_with_type(&self, edge_type: &EdgeType) -> Vec<EdgeId> {
        self.edge_type_index
            .get(edge_type)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn outgoing(&self, id: NodeId) -> &[EdgeId] {
        self.outgoing.get(&id).map_or(&[], |v| v.as_slice())
    }

    pub fn incoming(&self, id: NodeId) -> &[EdgeId] {
        self.incoming.get(&id).map_or(&[], |v| v.as_slice())
    }

    /// Every relationship touching `id`, self-loops reported once
    pub fn incident_edges(&self, id: NodeId) -> Vec<EdgeId> {
        let mut all: BTreeSet<EdgeId> = self.outgoing(id).iter().copied().collect();
        all.extend(self.incoming(id).iter().copied());
        all.into_iter().collect()
    }

    pub fn degree(&self, id: NodeId) -> usize {
        self.outgoing(id).len() + self.incoming(id).len()
    }

    pub fn vectors(&self) -> &VectorIndex {
        &self.vectors
    }

    pub fn vector(&self, id: NodeId) -> Option<&[f32]> {
        self.vectors.get(id)
    }

    /// Id the next created node will receive
    pub fn next_node_id(&self) -> NodeId {
        NodeId::new(self.next_node_id)
    }

    pub fn next_edge_id(&self) -> EdgeId {
        EdgeId::new(self.next_edge_id)
    }

    /// Raise the id counters to at least the persisted values. Counters
    /// never move backwards, so ids of deleted entities stay retired.
    pub fn restore_counters(&mut self, next_node_id: u64, next_edge_id: u64) {
        self.next_node_id = self.next_node_id.max(next_node_id);
        self.next_edge_id = self.next_edge_id.max(next_edge_id);
    }

    /// Put the id counters back to exactly these values. Only used to undo
    /// staged writes; persisted counters go through `restore_counters`.
    pub(crate) fn reset_counters(&mut self, next_node_id: NodeId, next_edge_id: EdgeId) {
        self.next_node_id = next_node_id.as_u64();
        self.next_edge_id = next_edge_id.as_u64();
    }

    pub(crate) fn remove_vector(&mut self, id: NodeId) {
        self.vectors.remove(id);
    }

    // ---- writes ----

    /// Apply one mutation. The store is left unchanged when an error is returned.
    pub fn apply(&mut self, mutation: &Mutation) -> GraphResult<()> {
        match mutation {
            Mutation::CreateNode { id, labels, properties } => {
                if self.nodes.contains_key(id) {
                    return Err(GraphError::NodeAlreadyExists(*id));
                }
                let mut properties = properties.clone();
                properties.retain(|_, v| !v.is_null());
                let node = Node::with_labels(*id, labels.iter().cloned(), properties);
                for label in &node.labels {
                    self.label_index.entry(label.clone()).or_default().insert(*id);
                }
                self.nodes.insert(*id, node);
                self.next_node_id = self.next_node_id.max(id.as_u64() + 1);
            }
            Mutation::CreateEdge { id, source, target, edge_type, properties } => {
                if self.edges.contains_key(id) {
                    return Err(GraphError::EdgeAlreadyExists(*id));
                }
                if !self.nodes.contains_key(source) {
                    return Err(GraphError::InvalidEdgeSource(*source));
                }
                if !self.nodes.contains_key(target) {
                    return Err(GraphError::InvalidEdgeTarget(*target));
                }
                let mut properties = properties.clone();
                properties.retain(|_, v| !v.is_null());
                insert_sorted(self.outgoing.entry(*source).or_default(), *id);
                insert_sorted(self.incoming.entry(*target).or_default(), *id);
                self.edge_type_index.entry(edge_type.clone()).or_default().insert(*id);
                self.edges.insert(*id, Edge::new(*id, *source, *target, edge_type.clone(), properties));
                self.next_edge_id = self.next_edge_id.max(id.as_u64() + 1);
            }
            Mutation::DeleteNode { id } => {
                if !self.nodes.contains_key(id) {
                    return Err(GraphError::NodeNotFound(*id));
                }
                if self.degree(*id) > 0 {
                    return Err(GraphError::NodeHasRelationships(*id));
                }
                if let Some(node) = self.nodes.remove(id) {
                    for label in &node.labels {
                        self.unindex_label(label, *id);
                    }
                }
                self.outgoing.remove(id);
                self.incoming.remove(id);
                self.vectors.remove(*id);
            }
            Mutation::DeleteEdge { id } => {
                let edge = self.edges.remove(id).ok_or(GraphError::EdgeNotFound(*id))?;
                if let Some(list) = self.outgoing.get_mut(&edge.source) {
                    list.retain(|e| e != id);
                }
                if let Some(list) = self.incoming.get_mut(&edge.target) {
                    list.retain(|e| e != id);
                }
                if let Some(ids) = self.edge_type_index.get_mut(&edge.edge_type) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.edge_type_index.remove(&edge.edge_type);
                    }
                }
            }
            Mutation::SetNodeProperty { id, key, value } => {
                let node = self.nodes.get_mut(id).ok_or(GraphError::NodeNotFound(*id))?;
                node.set_property(key.clone(), value.clone());
            }
            Mutation::RemoveNodeProperty { id, key } => {
                let node = self.nodes.get_mut(id).ok_or(GraphError::NodeNotFound(*id))?;
                node.remove_property(key);
            }
            Mutation::AddLabel { id, label } => {
                let node = self.nodes.get_mut(id).ok_or(GraphError::NodeNotFound(*id))?;
                if node.add_label(label.clone()) {
                    self.label_index.entry(label.clone()).or_default().insert(*id);
                }
            }
            Mutation::RemoveLabel { id, label } => {
                let node = self.nodes.get_mut(id).ok_or(GraphError::NodeNotFound(*id))?;
                if node.remove_label(label) {
                    self.unindex_label(label, *id);
                }
            }
            Mutation::SetEdgeProperty { id, key, value } => {
                let edge = self.edges.get_mut(id).ok_or(GraphError::EdgeNotFound(*id))?;
                edge.set_property(key.clone(), value.clone());
            }
            Mutation::RemoveEdgeProperty { id, key } => {
                let edge = self.edges.get_mut(id).ok_or(GraphError::EdgeNotFound(*id))?;
                edge.remove_property(key);
            }
            Mutation::SetVector { id, vector } => {
                if !self.nodes.contains_key(id) {
                    return Err(GraphError::NodeNotFound(*id));
                }
                self.vectors.put(*id, vector.clone())?;
            }
        }
        Ok(())
    }

    fn unindex_label(&mut self, label: &Label, id: NodeId) {
        if let Some(ids) = self.label_index.get_mut(label) {
            ids.remove(&id);
            if ids.is_empty() {
                self.label_index.remove(label);
            }
        }
    }
}

/// Adjacency lists stay ordered by edge id, whatever order edges arrive in
fn insert_sorted(list: &mut Vec<EdgeId>, id: EdgeId) {
    if let Err(pos) = list.binary_search(&id) {
        list.insert(pos, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PropertyMap;

    fn create_node(store: &mut GraphStore, label: &str) -> NodeId {
        let id = store.next_node_id();
        store
            .apply(&Mutation::CreateNode {
                id,
                labels: vec![Label::new(label)],
                properties: PropertyMap::new(),
            })
            .unwrap();
        id
    }

    fn create_edge(store: &mut GraphStore, source: NodeId, target: NodeId, edge_type: &str) -> EdgeId {
        let id = store.next_edge_id();
        store
            .apply(&Mutation::CreateEdge {
                id,
                source,
                target,
                edge_type: EdgeType::new(edge_type),
                properties: PropertyMap::new(),
            })
            .unwrap();
        id
    }

    #[test]
    fn test_create_and_index() {
        let mut store = GraphStore::new();
        let alice = create_node(&mut store, "Person");
        let bob = create_node(&mut store, "Person");
        create_node(&mut store, "Company");

        assert_eq!(store.node_count(), 3);
        assert_eq!(store.nodes_with_label(&Label::new("Person")), vec![alice, bob]);

        let knows = create_edge(&mut store, alice, bob, "KNOWS");
        assert_eq!(store.outgoing(alice), &[knows]);
        assert_eq!(store.incoming(bob), &[knows]);
        assert_eq!(store.edges_with_type(&EdgeType::new("KNOWS")), vec![knows]);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut store = GraphStore::new();
        let first = create_node(&mut store, "Temp");
        store.apply(&Mutation::DeleteNode { id: first }).unwrap();
        let second = create_node(&mut store, "Temp");
        assert_ne!(first, second);
        assert!(second > first);
    }

    #[test]
    fn test_delete_requires_detached_node() {
        let mut store = GraphStore::new();
        let a = create_node(&mut store, "A");
        let b = create_node(&mut store, "B");
        let e = create_edge(&mut store, a, b, "R");

        let err = store.apply(&Mutation::DeleteNode { id: a }).unwrap_err();
        assert_eq!(err, GraphError::NodeHasRelationships(a));

        store.apply(&Mutation::DeleteEdge { id: e }).unwrap();
        store.apply(&Mutation::DeleteNode { id: a }).unwrap();
        assert!(!store.has_node(a));
        assert!(store.incoming(b).is_empty());
    }

    #[test]
    fn test_self_loop_is_incident_once() {
        let mut store = GraphStore::new();
        let n = create_node(&mut store, "N");
        let e = create_edge(&mut store, n, n, "SELF");
        assert_eq!(store.incident_edges(n), vec![e]);
        assert_eq!(store.degree(n), 2);
    }

    #[test]
    fn test_edge_requires_endpoints() {
        let mut store = GraphStore::new();
        let a = create_node(&mut store, "A");
        let err = store
            .apply(&Mutation::CreateEdge {
                id: store.next_edge_id(),
                source: a,
                target: NodeId::new(99),
                edge_type: EdgeType::new("R"),
                properties: PropertyMap::new(),
            })
            .unwrap_err();
        assert_eq!(err, GraphError::InvalidEdgeTarget(NodeId::new(99)));
        assert_eq!(store.edge_count(), 0);
    }

    #[test]
    fn test_labels_and_properties() {
        let mut store = GraphStore::new();
        let n = create_node(&mut store, "Person");
        store
            .apply(&Mutation::SetNodeProperty { id: n, key: "name".into(), value: "Alice".into() })
            .unwrap();
        store.apply(&Mutation::AddLabel { id: n, label: Label::new("Admin") }).unwrap();

        assert_eq!(store.find_nodes(&Label::new("Person"), "name", &"Alice".into()), vec![n]);
        assert_eq!(store.nodes_with_label(&Label::new("Admin")), vec![n]);

        store.apply(&Mutation::RemoveLabel { id: n, label: Label::new("Admin") }).unwrap();
        assert!(store.nodes_with_label(&Label::new("Admin")).is_empty());
    }

    #[test]
    fn test_adjacency_is_ordered_by_edge_id() {
        let mut store = GraphStore::new();
        let a = create_node(&mut store, "A");
        let b = create_node(&mut store, "B");
        let first = create_edge(&mut store, a, b, "R");
        let second = create_edge(&mut store, a, b, "R");

        store.apply(&Mutation::DeleteEdge { id: first }).unwrap();
        store
            .apply(&Mutation::CreateEdge {
                id: first,
                source: a,
                target: b,
                edge_type: EdgeType::new("R"),
                properties: PropertyMap::new(),
            })
            .unwrap();
        assert_eq!(store.outgoing(a), &[first, second]);
        assert_eq!(store.incoming(b), &[first, second]);
    }

    #[test]
    fn test_vectors_follow_node_lifetime() {
        let mut store = GraphStore::new();
        let n = create_node(&mut store, "Doc");
        store.apply(&Mutation::SetVector { id: n, vector: vec![1.0, 0.0] }).unwrap();
        assert_eq!(store.vector(n), Some(&[1.0f32, 0.0][..]));

        store.apply(&Mutation::DeleteNode { id: n }).unwrap();
        assert!(store.vectors().is_empty());

        let err = store.apply(&Mutation::SetVector { id: n, vector: vec![1.0] }).unwrap_err();
        assert_eq!(err, GraphError::NodeNotFound(n));
    }
}
