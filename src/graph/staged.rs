//! Private graph image of a write transaction
//!
//! Writes are applied to the image immediately, so later reads in the same
//! transaction observe them, and are appended to the mutation log that
//! commit hands to persistence. Every applied mutation also records how to
//! reverse it, so a savepoint can be restored in time proportional to the
//! writes made since, not to the size of the graph.

use super::mutation::{Mutation, WriteStats};
use super::property::{PropertyMap, PropertyValue};
use super::store::{GraphError, GraphResult, GraphStore};
use super::types::{EdgeId, EdgeType, Label, NodeId};

/// One step of reversing an applied mutation
#[derive(Debug, Clone)]
enum Undo {
    Apply(Mutation),
    DropVector(NodeId),
}

/// Position in a staged graph's history that `rollback_to` can return to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Savepoint {
    log_len: usize,
    undo_len: usize,
    next_node_id: NodeId,
    next_edge_id: EdgeId,
    stats: WriteStats,
}

#[derive(Debug, Clone)]
pub struct StagedGraph {
    graph: GraphStore,
    log: Vec<Mutation>,
    undo: Vec<Undo>,
    base: Savepoint,
    stats: WriteStats,
}

impl StagedGraph {
    pub fn new(base: GraphStore) -> Self {
        let mut staged = Self {
            graph: base,
            log: Vec::new(),
            undo: Vec::new(),
            base: Savepoint {
                log_len: 0,
                undo_len: 0,
                next_node_id: NodeId::new(0),
                next_edge_id: EdgeId::new(0),
                stats: WriteStats::default(),
            },
            stats: WriteStats::default(),
        };
        staged.base = staged.savepoint();
        staged
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub fn log(&self) -> &[Mutation] {
        &self.log
    }

    pub fn is_dirty(&self) -> bool {
        !self.log.is_empty()
    }

    /// Statistics accumulated since the last call
    pub fn take_stats(&mut self) -> WriteStats {
        std::mem::take(&mut self.stats)
    }

    pub fn into_parts(self) -> (GraphStore, Vec<Mutation>) {
        (self.graph, self.log)
    }

    pub fn savepoint(&self) -> Savepoint {
        Savepoint {
            log_len: self.log.len(),
            undo_len: self.undo.len(),
            next_node_id: self.graph.next_node_id(),
            next_edge_id: self.graph.next_edge_id(),
            stats: self.stats,
        }
    }

    /// Reverse every write made after `savepoint`, newest first
    pub fn rollback_to(&mut self, savepoint: Savepoint) -> GraphResult<()> {
        while self.undo.len() > savepoint.undo_len {
            match self.undo.pop() {
                Some(Undo::Apply(mutation)) => self.graph.apply(&mutation)?,
                Some(Undo::DropVector(id)) => self.graph.remove_vector(id),
                None => break,
            }
        }
        self.log.truncate(savepoint.log_len);
        self.graph.reset_counters(savepoint.next_node_id, savepoint.next_edge_id);
        self.stats = savepoint.stats;
        Ok(())
    }

    /// Undo everything and hand back the image this staged graph started from
    pub fn discard(mut self) -> GraphResult<GraphStore> {
        let base = self.base;
        self.rollback_to(base)?;
        Ok(self.graph)
    }

    fn record(&mut self, mutation: Mutation) -> GraphResult<()> {
        let reverse = self.reverse_of(&mutation);
        self.graph.apply(&mutation)?;
        // Popped newest first, so push the steps in reverse application order
        self.undo.extend(reverse.into_iter().rev());
        self.log.push(mutation);
        Ok(())
    }

    /// Steps restoring the current state after `mutation` is applied, in
    /// the order they must run
    fn reverse_of(&self, mutation: &Mutation) -> Vec<Undo> {
        let graph = &self.graph;
        match mutation {
            Mutation::CreateNode { id, .. } => vec![Undo::Apply(Mutation::DeleteNode { id: *id })],
            Mutation::CreateEdge { id, .. } => vec![Undo::Apply(Mutation::DeleteEdge { id: *id })],
            Mutation::DeleteNode { id } => {
                let Some(node) = graph.node(*id) else { return Vec::new() };
                let mut steps = vec![Undo::Apply(Mutation::CreateNode {
                    id: *id,
                    labels: node.labels.iter().cloned().collect(),
                    properties: node.properties.clone(),
                })];
                if let Some(vector) = graph.vector(*id) {
                    steps.push(Undo::Apply(Mutation::SetVector { id: *id, vector: vector.to_vec() }));
                }
                steps
            }
            Mutation::DeleteEdge { id } => match graph.edge(*id) {
                Some(edge) => vec![Undo::Apply(Mutation::CreateEdge {
                    id: *id,
                    source: edge.source,
                    target: edge.target,
                    edge_type: edge.edge_type.clone(),
                    properties: edge.properties.clone(),
                })],
                None => Vec::new(),
            },
            Mutation::SetNodeProperty { id, key, .. } | Mutation::RemoveNodeProperty { id, key } => {
                let previous = graph.node(*id).and_then(|n| n.get_property(key));
                vec![Undo::Apply(match previous {
                    Some(value) => Mutation::SetNodeProperty { id: *id, key: key.clone(), value: value.clone() },
                    None => Mutation::RemoveNodeProperty { id: *id, key: key.clone() },
                })]
            }
            Mutation::SetEdgeProperty { id, key, .. } | Mutation::RemoveEdgeProperty { id, key } => {
                let previous = graph.edge(*id).and_then(|e| e.get_property(key));
                vec![Undo::Apply(match previous {
                    Some(value) => Mutation::SetEdgeProperty { id: *id, key: key.clone(), value: value.clone() },
                    None => Mutation::RemoveEdgeProperty { id: *id, key: key.clone() },
                })]
            }
            Mutation::AddLabel { id, label } | Mutation::RemoveLabel { id, label } => {
                let had = graph.node(*id).is_some_and(|n| n.has_label(label));
                let step = if had {
                    Mutation::AddLabel { id: *id, label: label.clone() }
                } else {
                    Mutation::RemoveLabel { id: *id, label: label.clone() }
                };
                vec![Undo::Apply(step)]
            }
            Mutation::SetVector { id, .. } => match graph.vector(*id) {
                Some(vector) => vec![Undo::Apply(Mutation::SetVector { id: *id, vector: vector.to_vec() })],
                None => vec![Undo::DropVector(*id)],
            },
        }
    }

    pub fn create_node(&mut self, labels: Vec<Label>, properties: PropertyMap) -> GraphResult<NodeId> {
        let id = self.graph.next_node_id();
        let label_count = labels.len();
        let property_count = properties.values().filter(|v| !v.is_null()).count();
        self.record(Mutation::CreateNode { id, labels, properties })?;
        self.stats.nodes_created += 1;
        self.stats.labels_added += label_count;
        self.stats.properties_set += property_count;
        Ok(id)
    }

    pub fn create_edge(
        &mut self,
        source: NodeId,
        target: NodeId,
        edge_type: EdgeType,
        properties: PropertyMap,
    ) -> GraphResult<EdgeId> {
        let id = self.graph.next_edge_id();
        let property_count = properties.values().filter(|v| !v.is_null()).count();
        self.record(Mutation::CreateEdge { id, source, target, edge_type, properties })?;
        self.stats.relationships_created += 1;
        self.stats.properties_set += property_count;
        Ok(id)
    }

    /// Assigning null removes the property
    pub fn set_node_property(&mut self, id: NodeId, key: &str, value: PropertyValue) -> GraphResult<()> {
        if value.is_null() {
            return self.remove_node_property(id, key);
        }
        self.record(Mutation::SetNodeProperty { id, key: key.to_string(), value })?;
        self.stats.properties_set += 1;
        Ok(())
    }

    pub fn remove_node_property(&mut self, id: NodeId, key: &str) -> GraphResult<()> {
        let node = self.graph.node(id).ok_or(GraphError::NodeNotFound(id))?;
        if node.get_property(key).is_some() {
            self.record(Mutation::RemoveNodeProperty { id, key: key.to_string() })?;
            self.stats.properties_set += 1;
        }
        Ok(())
    }

    pub fn set_edge_property(&mut self, id: EdgeId, key: &str, value: PropertyValue) -> GraphResult<()> {
        if value.is_null() {
            return self.remove_edge_property(id, key);
        }
        self.record(Mutation::SetEdgeProperty { id, key: key.to_string(), value })?;
        self.stats.properties_set += 1;
        Ok(())
    }

    pub fn remove_edge_property(&mut self, id: EdgeId, key: &str) -> GraphResult<()> {
        let edge = self.graph.edge(id).ok_or(GraphError::EdgeNotFound(id))?;
        if edge.get_property(key).is_some() {
            self.record(Mutation::RemoveEdgeProperty { id, key: key.to_string() })?;
            self.stats.properties_set += 1;
        }
        Ok(())
    }

    pub fn add_label(&mut self, id: NodeId, label: Label) -> GraphResult<()> {
        let node = self.graph.node(id).ok_or(GraphError::NodeNotFound(id))?;
        if !node.has_label(&label) {
            self.record(Mutation::AddLabel { id, label })?;
            self.stats.labels_added += 1;
        }
        Ok(())
    }

    pub fn remove_label(&mut self, id: NodeId, label: Label) -> GraphResult<()> {
        let node = self.graph.node(id).ok_or(GraphError::NodeNotFound(id))?;
        if node.has_label(&label) {
            self.record(Mutation::RemoveLabel { id, label })?;
            self.stats.labels_removed += 1;
        }
        Ok(())
    }

    /// Delete a node. Deleting an already deleted node is a no-op, so a
    /// statement may name the same node on several rows.
    pub fn delete_node(&mut self, id: NodeId, detach: bool) -> GraphResult<()> {
        if !self.graph.has_node(id) {
            return Ok(());
        }
        if detach {
            for edge in self.graph.incident_edges(id) {
                self.delete_edge(edge)?;
            }
        } else if self.graph.degree(id) > 0 {
            return Err(GraphError::NodeHasRelationships(id));
        }
        self.record(Mutation::DeleteNode { id })?;
        self.stats.nodes_deleted += 1;
        Ok(())
    }

    pub fn delete_edge(&mut self, id: EdgeId) -> GraphResult<()> {
        if !self.graph.has_edge(id) {
            return Ok(());
        }
        self.record(Mutation::DeleteEdge { id })?;
        self.stats.relationships_deleted += 1;
        Ok(())
    }

    pub fn set_vector(&mut self, id: NodeId, vector: Vec<f32>) -> GraphResult<()> {
        self.record(Mutation::SetVector { id, vector })?;
        self.stats.vectors_set += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_records_only_successful_writes() {
        let mut staged = StagedGraph::new(GraphStore::new());
        let a = staged.create_node(vec![Label::new("A")], PropertyMap::new()).unwrap();
        assert!(staged.create_edge(a, NodeId::new(42), EdgeType::new("R"), PropertyMap::new()).is_err());
        assert_eq!(staged.log().len(), 1);

        let stats = staged.take_stats();
        assert_eq!(stats.nodes_created, 1);
        assert_eq!(stats.labels_added, 1);
        assert_eq!(staged.take_stats().total(), 0);
    }

    #[test]
    fn test_detach_delete_removes_relationships_first() {
        let mut staged = StagedGraph::new(GraphStore::new());
        let a = staged.create_node(vec![], PropertyMap::new()).unwrap();
        let b = staged.create_node(vec![], PropertyMap::new()).unwrap();
        staged.create_edge(a, b, EdgeType::new("R"), PropertyMap::new()).unwrap();
        staged.create_edge(a, a, EdgeType::new("SELF"), PropertyMap::new()).unwrap();

        assert!(matches!(staged.delete_node(a, false), Err(GraphError::NodeHasRelationships(_))));
        staged.delete_node(a, true).unwrap();
        staged.delete_node(a, true).unwrap();

        assert_eq!(staged.graph().edge_count(), 0);
        assert_eq!(staged.graph().node_count(), 1);
        let stats = staged.take_stats();
        assert_eq!(stats.relationships_deleted, 2);
        assert_eq!(stats.nodes_deleted, 1);
    }

    fn ids(graph: &GraphStore) -> (Vec<NodeId>, Vec<EdgeId>) {
        (graph.node_ids(), graph.edges().map(|e| e.id).collect())
    }

    #[test]
    fn test_rollback_to_savepoint_restores_image() {
        let mut staged = StagedGraph::new(GraphStore::new());
        let mut props = PropertyMap::new();
        props.insert("name".into(), "Alice".into());
        let a = staged.create_node(vec![Label::new("Person")], props).unwrap();
        let b = staged.create_node(vec![], PropertyMap::new()).unwrap();
        let knows = staged.create_edge(a, b, EdgeType::new("KNOWS"), PropertyMap::new()).unwrap();
        staged.set_vector(a, vec![1.0, 0.0]).unwrap();
        let before = ids(staged.graph());
        let savepoint = staged.savepoint();

        staged.set_node_property(a, "name", "Bob".into()).unwrap();
        staged.set_node_property(a, "age", 42.into()).unwrap();
        staged.add_label(a, Label::new("Admin")).unwrap();
        staged.remove_label(a, Label::new("Person")).unwrap();
        staged.set_edge_property(knows, "since", 2020.into()).unwrap();
        staged.create_node(vec![Label::new("Temp")], PropertyMap::new()).unwrap();
        staged.delete_node(a, true).unwrap();

        staged.rollback_to(savepoint).unwrap();

        assert_eq!(ids(staged.graph()), before);
        let graph = staged.graph();
        let alice = graph.node(a).unwrap();
        assert_eq!(alice.get_property("name"), Some(&"Alice".into()));
        assert!(alice.get_property("age").is_none());
        assert!(alice.has_label(&Label::new("Person")));
        assert!(!alice.has_label(&Label::new("Admin")));
        assert!(graph.nodes_with_label(&Label::new("Temp")).is_empty());
        assert!(graph.edge(knows).unwrap().get_property("since").is_none());
        assert_eq!(graph.outgoing(a), &[knows]);
        assert_eq!(graph.vector(a), Some(&[1.0f32, 0.0][..]));
        assert_eq!(graph.next_node_id(), NodeId::new(2));
        assert_eq!(staged.log().len(), 4);
        assert_eq!(staged.take_stats().nodes_created, 2);
    }

    #[test]
    fn test_discard_returns_the_base_image() {
        let mut base = StagedGraph::new(GraphStore::new());
        let kept = base.create_node(vec![Label::new("Kept")], PropertyMap::new()).unwrap();
        let (base, _) = base.into_parts();

        let mut staged = StagedGraph::new(base);
        staged.set_vector(kept, vec![0.5, 0.5, 0.5]).unwrap();
        staged.create_node(vec![Label::new("Gone")], PropertyMap::new()).unwrap();
        staged.delete_node(kept, false).unwrap();

        let graph = staged.discard().unwrap();
        assert_eq!(graph.node_ids(), vec![kept]);
        assert!(graph.vectors().is_empty());
        assert_eq!(graph.vectors().dimensions(), None);
        assert_eq!(graph.next_node_id(), NodeId::new(1));
    }

    #[test]
    fn test_null_assignment_is_a_removal() {
        let mut staged = StagedGraph::new(GraphStore::new());
        let mut props = PropertyMap::new();
        props.insert("email".into(), "a@b.c".into());
        let n = staged.create_node(vec![], props).unwrap();
        staged.set_node_property(n, "email", PropertyValue::Null).unwrap();
        assert!(staged.graph().node(n).unwrap().get_property("email").is_none());
        assert!(matches!(staged.log().last(), Some(Mutation::RemoveNodeProperty { .. })));
    }
}
