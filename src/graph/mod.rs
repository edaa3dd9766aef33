//! Property graph model
//!
//! - Nodes with a label set and properties
//! - Directed, typed relationships with properties (self-loops allowed)
//! - An in-memory image indexed by label and relationship type
//! - Mutations as the single write path, shared by transactions and recovery

pub mod edge;
pub mod mutation;
pub mod node;
pub mod property;
pub mod staged;
pub mod store;
pub mod types;

pub use edge::Edge;
pub use mutation::{Mutation, Touched, WriteStats};
pub use node::Node;
pub use property::{PropertyMap, PropertyValue, UnsupportedValue};
pub use staged::{Savepoint, StagedGraph};
pub use store::{GraphError, GraphResult, GraphStore};
pub use types::{EdgeId, EdgeType, Label, NodeId};
