//! NervusDB
//!
//! An embedded property graph database with a Cypher query engine, durable
//! single-writer transactions and vector similarity search.
//!
//! # Architecture
//!
//! - `graph`: property graph model, the committed in-memory image and the
//!   staged copy a write transaction mutates
//! - `query`: pest-based Cypher parser, planner and Volcano executor
//! - `persistence`: write-ahead log plus a RocksDB image of the graph
//! - `vector`: per-node vectors and exact k-nearest-neighbour search
//! - `db` / `txn`: the `Db` handle and its `WriteTxn`
//!
//! ## Example Usage
//!
//! ```rust
//! use nervusdb::{Db, Value};
//!
//! let dir = tempfile::TempDir::new().unwrap();
//! let db = Db::open(dir.path()).unwrap();
//!
//! db.execute_write("CREATE (:Person {name: 'Alice', age: 30})").unwrap();
//!
//! let result = db.query("MATCH (n:Person {name: 'Alice'}) RETURN n.age").unwrap();
//! assert_eq!(result.single("n.age"), Some(&Value::Int(30)));
//!
//! let mut txn = db.begin_write().unwrap();
//! txn.query("MATCH (n:Person) SET n.age = n.age + 1").unwrap();
//! txn.rollback().unwrap();
//!
//! db.close().unwrap();
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod db;
pub mod error;
pub mod graph;
pub mod persistence;
pub mod query;
pub mod txn;
pub mod vector;

// Re-export main types for convenience
pub use config::{ConfigError, DbOptions, QueryLimits};
pub use db::{Db, QueryStream};
pub use error::{Error, ErrorKind, Result};
pub use graph::{
    Edge, EdgeId, EdgeType, GraphError, GraphResult, GraphStore, Label, Node, NodeId, PropertyMap, PropertyValue,
    WriteStats,
};
pub use persistence::{PersistenceError, PersistenceManager, PersistenceResult};
pub use query::{
    params_from_json, parse_query, ExecutionError, ParseError, Params, PathValue, Query, QueryEngine, QueryResult,
    Row, Value,
};
pub use txn::{TxnState, WriteTxn};
pub use vector::{DistanceMetric, VectorError, VectorIndex};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get version string
pub fn version() -> &'static str {
    VERSION
}
