//! Record structures for query execution
//!
//! Records flow through the Volcano iterator pipeline. Inside the pipeline
//! graph entities are carried as lazy references (`NodeRef`, `EdgeRef`,
//! `PathRef`) so that writes made later in the same statement are observed;
//! they are materialized into full `Node` / `Relationship` / `Path` values
//! when a result row leaves the engine.

use crate::graph::{Edge, EdgeId, GraphStore, Node, NodeId, PropertyValue, UnsupportedValue};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Node and relationship ids along a path, in traversal order
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathRef {
    pub nodes: Vec<NodeId>,
    pub edges: Vec<EdgeId>,
}

impl PathRef {
    /// Number of relationships in the path
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// A materialized path
#[derive(Debug, Clone, PartialEq)]
pub struct PathValue {
    pub nodes: Vec<Node>,
    pub relationships: Vec<Edge>,
}

/// Value types that can be bound to variables
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A lazy node reference (no property clone)
    NodeRef(NodeId),
    /// A lazy relationship reference
    EdgeRef(EdgeId),
    /// A lazy path
    PathRef(PathRef),
    /// A fully materialized node
    Node(Node),
    /// A fully materialized relationship
    Relationship(Edge),
    /// A fully materialized path
    Path(PathValue),
}

// Entities compare by id, whether lazy or materialized
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => match (self.entity_key(), other.entity_key()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        if let Some(key) = self.entity_key() {
            key.hash(state);
            return;
        }
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::Float(f) => {
                3u8.hash(state);
                // -0.0 == 0.0 and every NaN is equal, so hash a canonical form
                let canonical = if *f == 0.0 { 0.0 } else if f.is_nan() { f64::NAN } else { *f };
                canonical.to_bits().hash(state);
            }
            Value::String(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Value::List(items) => {
                5u8.hash(state);
                items.hash(state);
            }
            Value::Map(map) => {
                6u8.hash(state);
                for (k, v) in map {
                    k.hash(state);
                    v.hash(state);
                }
            }
            _ => {}
        }
    }
}

/// Identity of an entity value, shared by its lazy and materialized forms
#[derive(Hash, PartialEq, Eq)]
enum EntityKey {
    Node(NodeId),
    Edge(EdgeId),
    Path(Vec<NodeId>, Vec<EdgeId>),
}

impl Value {
    fn entity_key(&self) -> Option<EntityKey> {
        match self {
            Value::NodeRef(id) => Some(EntityKey::Node(*id)),
            Value::Node(node) => Some(EntityKey::Node(node.id)),
            Value::EdgeRef(id) => Some(EntityKey::Edge(*id)),
            Value::Relationship(edge) => Some(EntityKey::Edge(edge.id)),
            Value::PathRef(path) => Some(EntityKey::Path(path.nodes.clone(), path.edges.clone())),
            Value::Path(path) => Some(EntityKey::Path(
                path.nodes.iter().map(|n| n.id).collect(),
                path.relationships.iter().map(|e| e.id).collect(),
            )),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Float view of a number; integers are widened
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Materialized node, if this is one
    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Value::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_relationship(&self) -> Option<&Edge> {
        match self {
            Value::Relationship(edge) => Some(edge),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&PathValue> {
        match self {
            Value::Path(path) => Some(path),
            _ => None,
        }
    }

    /// Node id from either node variant
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Value::NodeRef(id) => Some(*id),
            Value::Node(node) => Some(node.id),
            _ => None,
        }
    }

    /// Relationship id from either relationship variant
    pub fn edge_id(&self) -> Option<EdgeId> {
        match self {
            Value::EdgeRef(id) => Some(*id),
            Value::Relationship(edge) => Some(edge.id),
            _ => None,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Boolean",
            Value::Int(_) => "Integer",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::NodeRef(_) | Value::Node(_) => "Node",
            Value::EdgeRef(_) | Value::Relationship(_) => "Relationship",
            Value::PathRef(_) | Value::Path(_) => "Path",
        }
    }

    /// Convert to a storable property value. Graph entities cannot be stored.
    pub fn to_property(&self) -> Result<PropertyValue, UnsupportedValue> {
        Ok(match self {
            Value::Null => PropertyValue::Null,
            Value::Bool(b) => PropertyValue::Boolean(*b),
            Value::Int(i) => PropertyValue::Integer(*i),
            Value::Float(f) => PropertyValue::Float(*f),
            Value::String(s) => PropertyValue::String(s.clone()),
            Value::List(items) => PropertyValue::List(items.iter().map(Value::to_property).collect::<Result<_, _>>()?),
            Value::Map(map) => PropertyValue::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_property()?)))
                    .collect::<Result<_, UnsupportedValue>>()?,
            ),
            other => {
                return Err(UnsupportedValue(format!("{} values cannot be stored as properties", other.type_name())))
            }
        })
    }

    /// Replace lazy references with materialized entities. References to
    /// entities that no longer exist become null.
    pub fn materialize(self, store: &GraphStore) -> Value {
        match self {
            Value::NodeRef(id) => store.node(id).cloned().map_or(Value::Null, Value::Node),
            Value::EdgeRef(id) => store.edge(id).cloned().map_or(Value::Null, Value::Relationship),
            Value::PathRef(path) => {
                let nodes: Option<Vec<Node>> = path.nodes.iter().map(|id| store.node(*id).cloned()).collect();
                let relationships: Option<Vec<Edge>> = path.edges.iter().map(|id| store.edge(*id).cloned()).collect();
                match (nodes, relationships) {
                    (Some(nodes), Some(relationships)) => Value::Path(PathValue { nodes, relationships }),
                    _ => Value::Null,
                }
            }
            Value::List(items) => Value::List(items.into_iter().map(|v| v.materialize(store)).collect()),
            Value::Map(map) => Value::Map(map.into_iter().map(|(k, v)| (k, v.materialize(store))).collect()),
            other => other,
        }
    }

    /// JSON rendering used by bindings and tests
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Float(f) => serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::String(s) => json!(s),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
            Value::NodeRef(id) => json!({ "id": id.as_u64() }),
            Value::EdgeRef(id) => json!({ "id": id.as_u64() }),
            Value::PathRef(path) => json!({
                "nodes": path.nodes.iter().map(|n| n.as_u64()).collect::<Vec<_>>(),
                "relationships": path.edges.iter().map(|e| e.as_u64()).collect::<Vec<_>>(),
            }),
            Value::Node(node) => node_json(node),
            Value::Relationship(edge) => edge_json(edge),
            Value::Path(path) => json!({
                "nodes": path.nodes.iter().map(node_json).collect::<Vec<_>>(),
                "relationships": path.relationships.iter().map(edge_json).collect::<Vec<_>>(),
            }),
        }
    }

    /// Parse a JSON document into a value. Numbers outside i64/f64 are rejected.
    pub fn from_json(value: &serde_json::Value) -> Result<Value, UnsupportedValue> {
        PropertyValue::from_json(value).map(Value::from)
    }
}

fn properties_json(properties: &crate::graph::PropertyMap) -> serde_json::Value {
    serde_json::Value::Object(properties.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

fn node_json(node: &Node) -> serde_json::Value {
    serde_json::json!({
        "id": node.id.as_u64(),
        "labels": node.labels.iter().map(|l| l.as_str()).collect::<Vec<_>>(),
        "properties": properties_json(&node.properties),
    })
}

fn edge_json(edge: &Edge) -> serde_json::Value {
    serde_json::json!({
        "id": edge.id.as_u64(),
        "type": edge.edge_type.as_str(),
        "start": edge.source.as_u64(),
        "end": edge.target.as_u64(),
        "properties": properties_json(&edge.properties),
    })
}

/// Float rendering that keeps a fractional part: 3.0 rather than 3
pub fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{:.1}", f)
    } else if f.is_nan() {
        "NaN".to_string()
    } else if f == f64::INFINITY {
        "Infinity".to_string()
    } else if f == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        format!("{}", f)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", format_float(*x)),
            Value::String(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::NodeRef(id) => write!(f, "({})", id.as_u64()),
            Value::EdgeRef(id) => write!(f, "[{}]", id.as_u64()),
            Value::PathRef(path) => write!(f, "<path of {} relationships>", path.len()),
            Value::Node(node) => {
                write!(f, "({}", node.id.as_u64())?;
                for label in &node.labels {
                    write!(f, ":{}", label)?;
                }
                write!(f, ")")
            }
            Value::Relationship(edge) => write!(f, "[{}:{}]", edge.id.as_u64(), edge.edge_type),
            Value::Path(path) => write!(f, "<path of {} relationships>", path.relationships.len()),
        }
    }
}

impl From<PropertyValue> for Value {
    fn from(value: PropertyValue) -> Self {
        match value {
            PropertyValue::Null => Value::Null,
            PropertyValue::Boolean(b) => Value::Bool(b),
            PropertyValue::Integer(i) => Value::Int(i),
            PropertyValue::Float(f) => Value::Float(f),
            PropertyValue::String(s) => Value::String(s),
            PropertyValue::List(items) => Value::List(items.into_iter().map(Value::from).collect()),
            PropertyValue::Map(map) => Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<&PropertyValue> for Value {
    fn from(value: &PropertyValue) -> Self {
        Value::from(value.clone())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

/// A single record flowing through the query pipeline
#[derive(Debug, Clone, Default)]
pub struct Record {
    /// Variable bindings (variable name -> value)
    bindings: FxHashMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a variable to a value
    pub fn bind(&mut self, variable: impl Into<String>, value: Value) {
        self.bindings.insert(variable.into(), value);
    }

    /// Get a bound value
    pub fn get(&self, variable: &str) -> Option<&Value> {
        self.bindings.get(variable)
    }

    /// Check if a variable is bound
    pub fn has(&self, variable: &str) -> bool {
        self.bindings.contains_key(variable)
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.bindings.iter()
    }

    /// Keep only the given variables; missing ones are bound to null
    pub fn project(&self, variables: &[String]) -> Record {
        let mut projected = Record::new();
        for var in variables {
            projected.bind(var.clone(), self.get(var).cloned().unwrap_or(Value::Null));
        }
        projected
    }

    /// Copy without planner-generated (hidden) variables
    pub fn visible(&self) -> Record {
        Record {
            bindings: self
                .bindings
                .iter()
                .filter(|(k, _)| !is_hidden(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Values of `columns` in order
    pub fn values(&self, columns: &[String]) -> Vec<Value> {
        columns
            .iter()
            .map(|c| self.get(c).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// Planner-generated variable names start with a space, which no parsed
/// identifier can
pub fn is_hidden(variable: &str) -> bool {
    variable.starts_with(' ')
}

/// One result row: column name to value, in column order
pub type Row = IndexMap<String, Value>;

/// Materialized result of a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    /// Every value of one column, top to bottom
    pub fn column(&self, name: &str) -> Vec<&Value> {
        self.rows.iter().filter_map(|row| row.get(name)).collect()
    }

    /// The first row's value of `column`, if any
    pub fn single(&self, column: &str) -> Option<&Value> {
        self.rows.first().and_then(|row| row.get(column))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.rows
                .iter()
                .map(|row| serde_json::Value::Object(row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()))
                .collect(),
        )
    }
}

impl IntoIterator for QueryResult {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// Rank of a value's type in the ORDER BY total order; nulls sort last
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Map(_) => 0,
        Value::NodeRef(_) | Value::Node(_) => 1,
        Value::EdgeRef(_) | Value::Relationship(_) => 2,
        Value::List(_) => 3,
        Value::PathRef(_) | Value::Path(_) => 4,
        Value::String(_) => 5,
        Value::Bool(_) => 6,
        Value::Int(_) | Value::Float(_) => 7,
        Value::Null => 8,
    }
}

/// Total order over all values, used by ORDER BY, min and max
pub fn order_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let (x, y) = (a.as_float().unwrap_or(f64::NAN), b.as_float().unwrap_or(f64::NAN));
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::List(x), Value::List(y)) => {
            for (p, q) in x.iter().zip(y.iter()) {
                let ord = order_values(p, q);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Map(x), Value::Map(y)) => x.len().cmp(&y.len()),
        _ => {
            if let (Some(x), Some(y)) = (a.node_id(), b.node_id()) {
                return x.cmp(&y);
            }
            if let (Some(x), Some(y)) = (a.edge_id(), b.edge_id()) {
                return x.cmp(&y);
            }
            type_rank(a).cmp(&type_rank(b))
        }
    }
}
