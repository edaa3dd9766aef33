//! RocksDB image of the committed graph
//!
//! Column families:
//! - `nodes`, `edges`: bincode records keyed by big-endian id
//! - `vectors`: bincode `Vec<f32>` keyed by node id
//! - `meta`: id counters, last applied WAL sequence, format version

use crate::graph::{
    Edge, EdgeId, EdgeType, GraphStore, Label, Mutation, NodeId, PropertyMap, Touched,
};
use crate::vector::DistanceMetric;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

const CF_NODES: &str = "nodes";
const CF_EDGES: &str = "edges";
const CF_VECTORS: &str = "vectors";
const CF_META: &str = "meta";

const META_FORMAT: &[u8] = b"format_version";
const META_NEXT_NODE: &[u8] = b"next_node_id";
const META_NEXT_EDGE: &[u8] = b"next_edge_id";
const META_APPLIED_SEQ: &[u8] = b"applied_wal_sequence";

pub const FORMAT_VERSION: u64 = 1;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Column family error: {0}")]
    ColumnFamily(String),

    #[error("Corrupt record in {cf}: {reason}")]
    Corrupt { cf: &'static str, reason: String },

    #[error("Storage format mismatch: found version {found}, expected {expected}")]
    FormatMismatch { found: u64, expected: u64 },
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredNode {
    labels: Vec<String>,
    properties: PropertyMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEdge {
    source: u64,
    target: u64,
    edge_type: String,
    properties: PropertyMap,
}

/// Graph image loaded from disk
pub struct LoadedImage {
    pub graph: GraphStore,
    pub applied_sequence: u64,
}

/// RocksDB-based persistent storage
pub struct PersistentStorage {
    db: DB,
}

impl PersistentStorage {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        info!("Opening persistent storage at: {:?}", path);

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(16 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_wal_recovery_mode(rocksdb::DBRecoveryMode::PointInTime);

        let cf_descriptors = [CF_NODES, CF_EDGES, CF_VECTORS, CF_META]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Self::cf_options()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, cf_descriptors)?;
        let storage = Self { db };
        storage.check_format()?;
        Ok(storage)
    }

    fn cf_options() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf(&self, name: &'static str) -> StorageResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamily(name.to_string()))
    }

    fn check_format(&self) -> StorageResult<()> {
        let meta = self.cf(CF_META)?;
        match self.db.get_cf(meta, META_FORMAT)? {
            Some(bytes) => {
                let found = decode_u64(CF_META, &bytes)?;
                if found != FORMAT_VERSION {
                    return Err(StorageError::FormatMismatch { found, expected: FORMAT_VERSION });
                }
            }
            None => self.db.put_cf(meta, META_FORMAT, FORMAT_VERSION.to_be_bytes())?,
        }
        Ok(())
    }

    fn read_meta(&self, key: &[u8]) -> StorageResult<u64> {
        match self.db.get_cf(self.cf(CF_META)?, key)? {
            Some(bytes) => decode_u64(CF_META, &bytes),
            None => Ok(0),
        }
    }

    /// Rebuild the in-memory graph from the stored image
    pub fn load_graph(&self, metric: DistanceMetric) -> StorageResult<LoadedImage> {
        let mut graph = GraphStore::with_metric(metric);

        for item in self.db.iterator_cf(self.cf(CF_NODES)?, IteratorMode::Start) {
            let (key, value) = item?;
            let id = NodeId::from_key(&key).ok_or_else(|| corrupt(CF_NODES, "bad key"))?;
            let stored: StoredNode = bincode::deserialize(&value)?;
            graph
                .apply(&Mutation::CreateNode {
                    id,
                    labels: stored.labels.into_iter().map(Label::new).collect(),
                    properties: stored.properties,
                })
                .map_err(|e| corrupt(CF_NODES, e.to_string()))?;
        }

        for item in self.db.iterator_cf(self.cf(CF_EDGES)?, IteratorMode::Start) {
            let (key, value) = item?;
            let id = EdgeId::from_key(&key).ok_or_else(|| corrupt(CF_EDGES, "bad key"))?;
            let stored: StoredEdge = bincode::deserialize(&value)?;
            graph
                .apply(&Mutation::CreateEdge {
                    id,
                    source: NodeId::new(stored.source),
                    target: NodeId::new(stored.target),
                    edge_type: EdgeType::new(stored.edge_type),
                    properties: stored.properties,
                })
                .map_err(|e| corrupt(CF_EDGES, e.to_string()))?;
        }

        for item in self.db.iterator_cf(self.cf(CF_VECTORS)?, IteratorMode::Start) {
            let (key, value) = item?;
            let id = NodeId::from_key(&key).ok_or_else(|| corrupt(CF_VECTORS, "bad key"))?;
            let vector: Vec<f32> = bincode::deserialize(&value)?;
            graph
                .apply(&Mutation::SetVector { id, vector })
                .map_err(|e| corrupt(CF_VECTORS, e.to_string()))?;
        }

        graph.restore_counters(self.read_meta(META_NEXT_NODE)?, self.read_meta(META_NEXT_EDGE)?);
        let applied_sequence = self.read_meta(META_APPLIED_SEQ)?;

        info!(
            "Loaded {} nodes, {} edges, {} vectors (applied WAL sequence {})",
            graph.node_count(),
            graph.edge_count(),
            graph.vectors().len(),
            applied_sequence
        );
        Ok(LoadedImage { graph, applied_sequence })
    }

    /// Write the final state of every touched entity, the id counters and
    /// the applied WAL sequence in one atomic batch.
    pub fn write_commit(&self, graph: &GraphStore, touched: &Touched, applied_sequence: u64) -> StorageResult<()> {
        let nodes = self.cf(CF_NODES)?;
        let edges = self.cf(CF_EDGES)?;
        let vectors = self.cf(CF_VECTORS)?;
        let meta = self.cf(CF_META)?;

        let mut batch = WriteBatch::default();

        for id in &touched.nodes {
            let key = id.to_key();
            match graph.node(*id) {
                Some(node) => {
                    let stored = StoredNode {
                        labels: node.labels.iter().map(|l| l.as_str().to_string()).collect(),
                        properties: node.properties.clone(),
                    };
                    batch.put_cf(nodes, key, bincode::serialize(&stored)?);
                }
                None => batch.delete_cf(nodes, key),
            }
            match graph.vector(*id) {
                Some(vector) => batch.put_cf(vectors, key, bincode::serialize(vector)?),
                None => batch.delete_cf(vectors, key),
            }
        }

        for id in &touched.edges {
            let key = id.to_key();
            match graph.edge(*id) {
                Some(edge) => batch.put_cf(edges, key, bincode::serialize(&Self::stored_edge(edge))?),
                None => batch.delete_cf(edges, key),
            }
        }

        batch.put_cf(meta, META_NEXT_NODE, graph.next_node_id().as_u64().to_be_bytes());
        batch.put_cf(meta, META_NEXT_EDGE, graph.next_edge_id().as_u64().to_be_bytes());
        batch.put_cf(meta, META_APPLIED_SEQ, applied_sequence.to_be_bytes());

        self.db.write(batch)?;
        debug!(
            "Stored {} nodes and {} edges up to WAL sequence {}",
            touched.nodes.len(),
            touched.edges.len(),
            applied_sequence
        );
        Ok(())
    }

    fn stored_edge(edge: &Edge) -> StoredEdge {
        StoredEdge {
            source: edge.source.as_u64(),
            target: edge.target.as_u64(),
            edge_type: edge.edge_type.as_str().to_string(),
            properties: edge.properties.clone(),
        }
    }

    /// Flush memtables of every column family
    pub fn flush(&self) -> StorageResult<()> {
        for name in [CF_NODES, CF_EDGES, CF_VECTORS, CF_META] {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }
}

fn decode_u64(cf: &'static str, bytes: &[u8]) -> StorageResult<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| corrupt(cf, format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn corrupt(cf: &'static str, reason: impl Into<String>) -> StorageError {
    StorageError::Corrupt { cf, reason: reason.into() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StagedGraph;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_load_image() {
        let temp_dir = TempDir::new().unwrap();
        let storage = PersistentStorage::open(temp_dir.path()).unwrap();

        let mut staged = StagedGraph::new(GraphStore::new());
        let mut props = PropertyMap::new();
        props.insert("name".into(), "Alice".into());
        let a = staged.create_node(vec![Label::new("Person")], props).unwrap();
        let b = staged.create_node(vec![Label::new("Person")], PropertyMap::new()).unwrap();
        staged.create_edge(a, b, EdgeType::new("KNOWS"), PropertyMap::new()).unwrap();
        staged.set_vector(a, vec![0.5, 0.5]).unwrap();

        let touched = Touched::from_mutations(staged.log());
        let (graph, _) = staged.into_parts();
        storage.write_commit(&graph, &touched, 7).unwrap();

        let loaded = storage.load_graph(DistanceMetric::Euclidean).unwrap();
        assert_eq!(loaded.applied_sequence, 7);
        assert_eq!(loaded.graph.node_count(), 2);
        assert_eq!(loaded.graph.edge_count(), 1);
        assert_eq!(loaded.graph.vector(a), Some(&[0.5f32, 0.5][..]));
        assert_eq!(loaded.graph.node(a).unwrap().get_property("name"), Some(&"Alice".into()));
    }

    #[test]
    fn test_counters_survive_deletes() {
        let temp_dir = TempDir::new().unwrap();
        let storage = PersistentStorage::open(temp_dir.path()).unwrap();

        let mut staged = StagedGraph::new(GraphStore::new());
        let a = staged.create_node(vec![], PropertyMap::new()).unwrap();
        staged.delete_node(a, false).unwrap();
        let touched = Touched::from_mutations(staged.log());
        let (graph, _) = staged.into_parts();
        storage.write_commit(&graph, &touched, 1).unwrap();

        let loaded = storage.load_graph(DistanceMetric::Euclidean).unwrap();
        assert_eq!(loaded.graph.node_count(), 0);
        assert_eq!(loaded.graph.next_node_id(), NodeId::new(1));
    }
}
