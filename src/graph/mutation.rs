//! Logical graph mutations
//!
//! Every change to a [`GraphStore`](super::GraphStore) is expressed as a
//! `Mutation`. A write transaction records them in order; the WAL persists
//! them at commit and recovery replays them through the same code path.

use super::property::{PropertyMap, PropertyValue};
use super::types::{EdgeId, EdgeType, Label, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    CreateNode {
        id: NodeId,
        labels: Vec<Label>,
        properties: PropertyMap,
    },
    CreateEdge {
        id: EdgeId,
        source: NodeId,
        target: NodeId,
        edge_type: EdgeType,
        properties: PropertyMap,
    },
    /// Only valid once the node has no relationships left
    DeleteNode { id: NodeId },
    DeleteEdge { id: EdgeId },
    SetNodeProperty {
        id: NodeId,
        key: String,
        value: PropertyValue,
    },
    RemoveNodeProperty { id: NodeId, key: String },
    AddLabel { id: NodeId, label: Label },
    RemoveLabel { id: NodeId, label: Label },
    SetEdgeProperty {
        id: EdgeId,
        key: String,
        value: PropertyValue,
    },
    RemoveEdgeProperty { id: EdgeId, key: String },
    SetVector { id: NodeId, vector: Vec<f32> },
}

/// Entities whose durable image must be rewritten after a set of mutations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Touched {
    pub nodes: BTreeSet<NodeId>,
    pub edges: BTreeSet<EdgeId>,
}

impl Touched {
    pub fn from_mutations<'a>(mutations: impl IntoIterator<Item = &'a Mutation>) -> Self {
        let mut touched = Touched::default();
        for mutation in mutations {
            match mutation {
                Mutation::CreateNode { id, .. }
                | Mutation::DeleteNode { id }
                | Mutation::SetNodeProperty { id, .. }
                | Mutation::RemoveNodeProperty { id, .. }
                | Mutation::AddLabel { id, .. }
                | Mutation::RemoveLabel { id, .. }
                | Mutation::SetVector { id, .. } => {
                    touched.nodes.insert(*id);
                }
                Mutation::CreateEdge { id, .. }
                | Mutation::DeleteEdge { id }
                | Mutation::SetEdgeProperty { id, .. }
                | Mutation::RemoveEdgeProperty { id, .. } => {
                    touched.edges.insert(*id);
                }
            }
        }
        touched
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}

/// Counters reported by a write statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub nodes_created: usize,
    pub nodes_deleted: usize,
    pub relationships_created: usize,
    pub relationships_deleted: usize,
    pub properties_set: usize,
    pub labels_added: usize,
    pub labels_removed: usize,
    pub vectors_set: usize,
}

impl WriteStats {
    /// Number of entities affected
    pub fn total(&self) -> usize {
        self.nodes_created
            + self.nodes_deleted
            + self.relationships_created
            + self.relationships_deleted
            + self.properties_set
            + self.labels_added
            + self.labels_removed
            + self.vectors_set
    }

    pub fn merge(&mut self, other: &WriteStats) {
        self.nodes_created += other.nodes_created;
        self.nodes_deleted += other.nodes_deleted;
        self.relationships_created += other.relationships_created;
        self.relationships_deleted += other.relationships_deleted;
        self.properties_set += other.properties_set;
        self.labels_added += other.labels_added;
        self.labels_removed += other.labels_removed;
        self.vectors_set += other.vectors_set;
    }
}
