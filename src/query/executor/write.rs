//! Write operators
//!
//! Each write operator first drains its input, then applies its changes row
//! by row. Draining first keeps a statement from matching what it creates;
//! applying per row lets MERGE see what earlier rows merged.

use super::eval::evaluate;
use super::operator::{collect_rows, run_subplan, OperatorBox, PhysicalOperator};
use super::record::{PathRef, Record, Value};
use super::{ExecutionContext, ExecutionError, ExecutionResult};
use crate::graph::{EdgeId, EdgeType, Label, NodeId, PropertyMap};
use crate::query::ast::{Expression, RemoveItem, SetItem};
use std::collections::VecDeque;

/// Node of a CREATE / MERGE pattern. Reused if its variable is already bound.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub variable: String,
    pub labels: Vec<Label>,
    pub properties: Option<Expression>,
}

#[derive(Debug, Clone)]
pub struct RelationshipSpec {
    pub variable: String,
    pub edge_type: EdgeType,
    pub properties: Option<Expression>,
    /// `<-[:T]-`: the relationship starts at the right-hand node
    pub reversed: bool,
}

/// A path to create
#[derive(Debug, Clone)]
pub struct PathSpec {
    pub path_variable: Option<String>,
    pub start: NodeSpec,
    pub steps: Vec<(RelationshipSpec, NodeSpec)>,
}

/// Evaluate a property map for storage; null entries are dropped
fn property_map(
    properties: &Option<Expression>,
    record: &Record,
    ctx: &mut ExecutionContext,
) -> ExecutionResult<PropertyMap> {
    let Some(expr) = properties else {
        return Ok(PropertyMap::new());
    };
    match evaluate(expr, record, ctx)? {
        Value::Map(map) => map
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| {
                v.to_property()
                    .map(|p| (k, p))
                    .map_err(|e| ExecutionError::TypeError(e.0))
            })
            .collect(),
        other => Err(ExecutionError::TypeError(format!(
            "Properties must be a map, got {}",
            other.type_name()
        ))),
    }
}

fn ensure_node(spec: &NodeSpec, record: &mut Record, ctx: &mut ExecutionContext) -> ExecutionResult<NodeId> {
    if let Some(bound) = record.get(&spec.variable) {
        return bound.node_id().ok_or_else(|| {
            ExecutionError::RuntimeError(format!(
                "Cannot use `{}` ({}) as a node when creating a pattern",
                spec.variable.trim(),
                bound.type_name()
            ))
        });
    }
    let properties = property_map(&spec.properties, record, ctx)?;
    let id = ctx.staged()?.create_node(spec.labels.clone(), properties)?;
    record.bind(spec.variable.clone(), Value::NodeRef(id));
    Ok(id)
}

/// Create a path, binding every new variable in `record`
pub fn create_path(spec: &PathSpec, record: &mut Record, ctx: &mut ExecutionContext) -> ExecutionResult<()> {
    let mut current = ensure_node(&spec.start, record, ctx)?;
    let mut path = PathRef { nodes: vec![current], edges: Vec::new() };

    for (relationship, node) in &spec.steps {
        let next = ensure_node(node, record, ctx)?;
        let properties = property_map(&relationship.properties, record, ctx)?;
        let (source, target) = if relationship.reversed { (next, current) } else { (current, next) };
        let edge_id = ctx
            .staged()?
            .create_edge(source, target, relationship.edge_type.clone(), properties)?;
        record.bind(relationship.variable.clone(), Value::EdgeRef(edge_id));
        path.edges.push(edge_id);
        path.nodes.push(next);
        current = next;
    }

    if let Some(var) = &spec.path_variable {
        record.bind(var.clone(), Value::PathRef(path));
    }
    Ok(())
}

/// What a SET / REMOVE target variable refers to
enum Target {
    Node(NodeId),
    Edge(EdgeId),
    Null,
}

fn target_of(record: &Record, variable: &str) -> ExecutionResult<Target> {
    let value = record
        .get(variable)
        .ok_or_else(|| ExecutionError::VariableNotFound(variable.to_string()))?;
    if value.is_null() {
        return Ok(Target::Null);
    }
    if let Some(id) = value.node_id() {
        return Ok(Target::Node(id));
    }
    if let Some(id) = value.edge_id() {
        return Ok(Target::Edge(id));
    }
    Err(ExecutionError::TypeError(format!(
        "`{}` is a {}; only nodes and relationships have properties",
        variable,
        value.type_name()
    )))
}

/// Properties to assign from the right-hand side of `SET n = ...` / `SET n += ...`
fn assigned_properties(value: Value, ctx: &ExecutionContext) -> ExecutionResult<Vec<(String, Value)>> {
    let graph = ctx.graph();
    let entity_props = |props: &PropertyMap| -> Vec<(String, Value)> {
        props.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect()
    };
    match value {
        Value::Map(map) => Ok(map.into_iter().collect()),
        Value::NodeRef(id) => Ok(graph.node(id).map(|n| entity_props(&n.properties)).unwrap_or_default()),
        Value::EdgeRef(id) => Ok(graph.edge(id).map(|e| entity_props(&e.properties)).unwrap_or_default()),
        Value::Node(node) => Ok(entity_props(&node.properties)),
        Value::Relationship(edge) => Ok(entity_props(&edge.properties)),
        other => Err(ExecutionError::TypeError(format!(
            "SET expects a map, node or relationship, got {}",
            other.type_name()
        ))),
    }
}

fn set_property(target: &Target, key: &str, value: Value, ctx: &mut ExecutionContext) -> ExecutionResult<()> {
    let value = value.to_property().map_err(|e| ExecutionError::TypeError(e.0))?;
    match target {
        Target::Node(id) => ctx.staged()?.set_node_property(*id, key, value)?,
        Target::Edge(id) => ctx.staged()?.set_edge_property(*id, key, value)?,
        Target::Null => {}
    }
    Ok(())
}

fn existing_keys(target: &Target, ctx: &ExecutionContext) -> Vec<String> {
    let graph = ctx.graph();
    match target {
        Target::Node(id) => graph.node(*id).map(|n| n.properties.keys().cloned().collect()),
        Target::Edge(id) => graph.edge(*id).map(|e| e.properties.keys().cloned().collect()),
        Target::Null => None,
    }
    .unwrap_or_default()
}

/// Apply one SET item to the entities bound in `record`
pub fn apply_set_item(item: &SetItem, record: &Record, ctx: &mut ExecutionContext) -> ExecutionResult<()> {
    match item {
        SetItem::Property { variable, key, value } => {
            let target = target_of(record, variable)?;
            let value = evaluate(value, record, ctx)?;
            set_property(&target, key, value, ctx)
        }
        SetItem::ReplaceProperties { variable, value } => {
            let target = target_of(record, variable)?;
            let value = evaluate(value, record, ctx)?;
            let assigned = assigned_properties(value, ctx)?;
            for key in existing_keys(&target, ctx) {
                if !assigned.iter().any(|(k, _)| *k == key) {
                    set_property(&target, &key, Value::Null, ctx)?;
                }
            }
            for (key, value) in assigned {
                set_property(&target, &key, value, ctx)?;
            }
            Ok(())
        }
        SetItem::MergeProperties { variable, value } => {
            let target = target_of(record, variable)?;
            let value = evaluate(value, record, ctx)?;
            for (key, value) in assigned_properties(value, ctx)? {
                set_property(&target, &key, value, ctx)?;
            }
            Ok(())
        }
        SetItem::Labels { variable, labels } => match target_of(record, variable)? {
            Target::Node(id) => {
                for label in labels {
                    ctx.staged()?.add_label(id, label.clone())?;
                }
                Ok(())
            }
            Target::Null => Ok(()),
            Target::Edge(_) => Err(ExecutionError::TypeError(format!(
                "Cannot set labels on relationship `{}`",
                variable
            ))),
        },
    }
}

fn apply_remove_item(item: &RemoveItem, record: &Record, ctx: &mut ExecutionContext) -> ExecutionResult<()> {
    match item {
        RemoveItem::Property { variable, key } => match target_of(record, variable)? {
            Target::Node(id) => Ok(ctx.staged()?.remove_node_property(id, key)?),
            Target::Edge(id) => Ok(ctx.staged()?.remove_edge_property(id, key)?),
            Target::Null => Ok(()),
        },
        RemoveItem::Labels { variable, labels } => match target_of(record, variable)? {
            Target::Node(id) => {
                for label in labels {
                    ctx.staged()?.remove_label(id, label.clone())?;
                }
                Ok(())
            }
            Target::Null => Ok(()),
            Target::Edge(_) => Err(ExecutionError::TypeError(format!(
                "Cannot remove labels from relationship `{}`",
                variable
            ))),
        },
    }
}

/// Create operator: CREATE (a:Person)-[:KNOWS]->(b)
pub struct CreateOperator {
    input: OperatorBox,
    paths: Vec<PathSpec>,
    output: Option<VecDeque<Record>>,
}

impl CreateOperator {
    pub fn new(input: OperatorBox, paths: Vec<PathSpec>) -> Self {
        Self { input, paths, output: None }
    }
}

impl PhysicalOperator for CreateOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        if self.output.is_none() {
            let mut rows = collect_rows(&mut self.input, ctx, "create")?;
            for row in &mut rows {
                for path in &self.paths {
                    create_path(path, row, ctx)?;
                }
            }
            self.output = Some(rows.into());
        }
        Ok(self.output.as_mut().and_then(|rows| rows.pop_front()))
    }

    fn reset(&mut self) {
        self.input.reset();
        self.output = None;
    }

    fn describe(&self) -> String {
        format!("Create({} paths)", self.paths.len())
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }

    fn is_mutating(&self) -> bool {
        true
    }
}

/// Merge operator: MERGE pattern [ON CREATE SET ...] [ON MATCH SET ...]
pub struct MergeOperator {
    input: OperatorBox,
    /// Matches the whole pattern against the row being merged
    match_plan: OperatorBox,
    path: PathSpec,
    on_create: Vec<SetItem>,
    on_match: Vec<SetItem>,
    output: Option<VecDeque<Record>>,
}

impl MergeOperator {
    pub fn new(
        input: OperatorBox,
        match_plan: OperatorBox,
        path: PathSpec,
        on_create: Vec<SetItem>,
        on_match: Vec<SetItem>,
    ) -> Self {
        Self { input, match_plan, path, on_create, on_match, output: None }
    }

    fn merge_row(&mut self, row: Record, ctx: &mut ExecutionContext, out: &mut Vec<Record>) -> ExecutionResult<()> {
        let matches = run_subplan(&mut self.match_plan, row.clone(), ctx, "merge")?;
        if matches.is_empty() {
            let mut created = row;
            create_path(&self.path, &mut created, ctx)?;
            for item in &self.on_create {
                apply_set_item(item, &created, ctx)?;
            }
            out.push(created);
        } else {
            for matched in matches {
                for item in &self.on_match {
                    apply_set_item(item, &matched, ctx)?;
                }
                out.push(matched);
            }
        }
        ctx.check_rows(out.len(), "merge")
    }
}

impl PhysicalOperator for MergeOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        if self.output.is_none() {
            let rows = collect_rows(&mut self.input, ctx, "merge")?;
            let mut out = Vec::with_capacity(rows.len());
            for row in rows {
                self.merge_row(row, ctx, &mut out)?;
            }
            self.output = Some(out.into());
        }
        Ok(self.output.as_mut().and_then(|rows| rows.pop_front()))
    }

    fn reset(&mut self) {
        self.input.reset();
        self.match_plan.reset();
        self.output = None;
    }

    fn describe(&self) -> String {
        "Merge".to_string()
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref(), self.match_plan.as_ref()]
    }

    fn is_mutating(&self) -> bool {
        true
    }
}

/// Set operator: SET n.prop = value, SET n = {map}, SET n += {map}, SET n:Label
pub struct SetOperator {
    input: OperatorBox,
    items: Vec<SetItem>,
    output: Option<VecDeque<Record>>,
}

impl SetOperator {
    pub fn new(input: OperatorBox, items: Vec<SetItem>) -> Self {
        Self { input, items, output: None }
    }
}

impl PhysicalOperator for SetOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        if self.output.is_none() {
            let rows = collect_rows(&mut self.input, ctx, "set")?;
            for row in &rows {
                for item in &self.items {
                    apply_set_item(item, row, ctx)?;
                }
            }
            self.output = Some(rows.into());
        }
        Ok(self.output.as_mut().and_then(|rows| rows.pop_front()))
    }

    fn reset(&mut self) {
        self.input.reset();
        self.output = None;
    }

    fn describe(&self) -> String {
        format!("Set({} items)", self.items.len())
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }

    fn is_mutating(&self) -> bool {
        true
    }
}

/// Remove operator: REMOVE n.prop, REMOVE n:Label
pub struct RemoveOperator {
    input: OperatorBox,
    items: Vec<RemoveItem>,
    output: Option<VecDeque<Record>>,
}

impl RemoveOperator {
    pub fn new(input: OperatorBox, items: Vec<RemoveItem>) -> Self {
        Self { input, items, output: None }
    }
}

impl PhysicalOperator for RemoveOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        if self.output.is_none() {
            let rows = collect_rows(&mut self.input, ctx, "remove")?;
            for row in &rows {
                for item in &self.items {
                    apply_remove_item(item, row, ctx)?;
                }
            }
            self.output = Some(rows.into());
        }
        Ok(self.output.as_mut().and_then(|rows| rows.pop_front()))
    }

    fn reset(&mut self) {
        self.input.reset();
        self.output = None;
    }

    fn describe(&self) -> String {
        format!("Remove({} items)", self.items.len())
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }

    fn is_mutating(&self) -> bool {
        true
    }
}

/// Delete operator: [DETACH] DELETE n, r
pub struct DeleteOperator {
    input: OperatorBox,
    expressions: Vec<Expression>,
    detach: bool,
    output: Option<VecDeque<Record>>,
}

impl DeleteOperator {
    pub fn new(input: OperatorBox, expressions: Vec<Expression>, detach: bool) -> Self {
        Self { input, expressions, detach, output: None }
    }

    fn collect_targets(value: Value, nodes: &mut Vec<NodeId>, edges: &mut Vec<EdgeId>) -> ExecutionResult<()> {
        match value {
            Value::Null => {}
            Value::NodeRef(id) => nodes.push(id),
            Value::Node(node) => nodes.push(node.id),
            Value::EdgeRef(id) => edges.push(id),
            Value::Relationship(edge) => edges.push(edge.id),
            Value::PathRef(path) => {
                nodes.extend(path.nodes);
                edges.extend(path.edges);
            }
            Value::List(items) => {
                for item in items {
                    Self::collect_targets(item, nodes, edges)?;
                }
            }
            other => {
                return Err(ExecutionError::TypeError(format!(
                    "DELETE expects nodes, relationships or paths, got {}",
                    other.type_name()
                )))
            }
        }
        Ok(())
    }
}

impl PhysicalOperator for DeleteOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        if self.output.is_none() {
            let rows = collect_rows(&mut self.input, ctx, "delete")?;
            let mut nodes = Vec::new();
            let mut edges = Vec::new();
            for row in &rows {
                for expr in &self.expressions {
                    let value = evaluate(expr, row, ctx)?;
                    Self::collect_targets(value, &mut nodes, &mut edges)?;
                }
            }

            // Relationships go first so `DELETE r, n` succeeds without DETACH
            let staged = ctx.staged()?;
            for edge in edges {
                staged.delete_edge(edge)?;
            }
            for node in nodes {
                staged.delete_node(node, self.detach)?;
            }
            self.output = Some(rows.into());
        }
        Ok(self.output.as_mut().and_then(|rows| rows.pop_front()))
    }

    fn reset(&mut self) {
        self.input.reset();
        self.output = None;
    }

    fn describe(&self) -> String {
        let name = if self.detach { "DetachDelete" } else { "Delete" };
        name.to_string()
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }

    fn is_mutating(&self) -> bool {
        true
    }
}

/// Foreach operator: FOREACH (x IN list | clauses)
pub struct ForeachOperator {
    input: OperatorBox,
    variable: String,
    list: Expression,
    /// Write pipeline run once per list element
    body: OperatorBox,
    output: Option<VecDeque<Record>>,
}

impl ForeachOperator {
    pub fn new(input: OperatorBox, variable: String, list: Expression, body: OperatorBox) -> Self {
        Self { input, variable, list, body, output: None }
    }
}

impl PhysicalOperator for ForeachOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        if self.output.is_none() {
            let rows = collect_rows(&mut self.input, ctx, "foreach")?;
            for row in &rows {
                let items = match evaluate(&self.list, row, ctx)? {
                    Value::Null => Vec::new(),
                    Value::List(items) => items,
                    other => {
                        return Err(ExecutionError::TypeError(format!(
                            "FOREACH expects a list, got {}",
                            other.type_name()
                        )))
                    }
                };
                for item in items {
                    let mut scope = row.clone();
                    scope.bind(self.variable.clone(), item);
                    run_subplan(&mut self.body, scope, ctx, "foreach")?;
                }
            }
            self.output = Some(rows.into());
        }
        Ok(self.output.as_mut().and_then(|rows| rows.pop_front()))
    }

    fn reset(&mut self) {
        self.input.reset();
        self.body.reset();
        self.output = None;
    }

    fn describe(&self) -> String {
        format!("Foreach({})", self.variable)
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref(), self.body.as_ref()]
    }

    fn is_mutating(&self) -> bool {
        true
    }
}
