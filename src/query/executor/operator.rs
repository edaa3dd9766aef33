//! Physical operators for query execution (Volcano iterator model)
//!
//! Every pipeline starts at an [`ArgumentOperator`]. Scans and expands are
//! driven by their input rows, so chained patterns form nested loops and
//! variables bound upstream are checked instead of rescanned.

use super::eval::{equals, evaluate, evaluate_predicate};
use super::record::{is_hidden, order_values, PathRef, Record, Value};
use super::{ExecutionContext, ExecutionError, ExecutionResult};
use crate::graph::{Edge, EdgeId, EdgeType, GraphStore, Label, NodeId, PropertyMap};
use crate::query::ast::{is_aggregate_function, Direction, Expression};
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

/// Physical operator trait - all operators implement this
pub trait PhysicalOperator: Send {
    /// Get the next record from this operator
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>>;

    /// Reset the operator (and its inputs) to start from the beginning
    fn reset(&mut self);

    /// One-line description used by EXPLAIN
    fn describe(&self) -> String;

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        Vec::new()
    }

    /// Returns true if this operator mutates the graph
    fn is_mutating(&self) -> bool {
        false
    }
}

/// Type alias for boxed operators
pub type OperatorBox = Box<dyn PhysicalOperator>;

/// Render an operator tree top-down, children indented under their parent
pub fn explain_lines(op: &dyn PhysicalOperator) -> Vec<String> {
    fn walk(op: &dyn PhysicalOperator, depth: usize, out: &mut Vec<String>) {
        out.push(format!("{}{}", "  ".repeat(depth), op.describe()));
        for child in op.children() {
            walk(child, depth + 1, out);
        }
    }
    let mut out = Vec::new();
    walk(op, 0, &mut out);
    out
}

/// Pull every remaining row out of an operator
pub fn collect_rows(op: &mut OperatorBox, ctx: &mut ExecutionContext, what: &str) -> ExecutionResult<Vec<Record>> {
    let mut rows = Vec::new();
    while let Some(record) = op.next(ctx)? {
        rows.push(record);
        ctx.check_rows(rows.len(), what)?;
    }
    Ok(rows)
}

/// Run a sub-plan once for `argument` and collect its rows
pub fn run_subplan(
    op: &mut OperatorBox,
    argument: Record,
    ctx: &mut ExecutionContext,
    what: &str,
) -> ExecutionResult<Vec<Record>> {
    ctx.push_argument(argument);
    op.reset();
    let rows = collect_rows(op, ctx, what);
    ctx.pop_argument();
    rows
}

/// Node id bound to `variable`; `None` when it is bound to null
fn bound_node(record: &Record, variable: &str) -> ExecutionResult<Option<NodeId>> {
    match record.get(variable) {
        None => Err(ExecutionError::VariableNotFound(variable.to_string())),
        Some(Value::Null) => Ok(None),
        Some(value) => value.node_id().map(Some).ok_or_else(|| {
            ExecutionError::TypeError(format!("Variable `{}` is a {}, not a node", variable, value.type_name()))
        }),
    }
}

/// Evaluate an inline `{key: value}` pattern map
pub fn evaluate_property_filter(
    properties: &Option<Expression>,
    record: &Record,
    ctx: &mut ExecutionContext,
) -> ExecutionResult<Vec<(String, Value)>> {
    let Some(expr) = properties else {
        return Ok(Vec::new());
    };
    match evaluate(expr, record, ctx)? {
        Value::Map(map) => Ok(map.into_iter().collect()),
        other => Err(ExecutionError::TypeError(format!(
            "Pattern properties must be a map, got {}",
            other.type_name()
        ))),
    }
}

fn properties_match(properties: &PropertyMap, filter: &[(String, Value)]) -> bool {
    filter.iter().all(|(key, expected)| {
        properties
            .get(key)
            .is_some_and(|actual| equals(&Value::from(actual), expected) == Some(true))
    })
}

fn edge_type_matches(edge: &Edge, types: &[EdgeType]) -> bool {
    types.is_empty() || types.contains(&edge.edge_type)
}

/// Relationships leaving `node` in `direction`, with the node at the other end.
/// An undirected self-loop is reported once.
pub fn neighbours(graph: &GraphStore, node: NodeId, direction: Direction, types: &[EdgeType]) -> Vec<(EdgeId, NodeId)> {
    let mut out = Vec::new();
    if matches!(direction, Direction::Outgoing | Direction::Both) {
        for edge in graph.outgoing(node).iter().filter_map(|id| graph.edge(*id)) {
            if edge_type_matches(edge, types) {
                out.push((edge.id, edge.target));
            }
        }
    }
    if matches!(direction, Direction::Incoming | Direction::Both) {
        for edge in graph.incoming(node).iter().filter_map(|id| graph.edge(*id)) {
            if direction == Direction::Both && edge.is_self_loop() {
                continue;
            }
            if edge_type_matches(edge, types) {
                out.push((edge.id, edge.source));
            }
        }
    }
    out
}

/// Edges already bound by earlier relationships of the same MATCH
fn used_edge_ids(record: &Record, variables: &[String]) -> FxHashSet<EdgeId> {
    let mut used = FxHashSet::default();
    for var in variables {
        match record.get(var) {
            Some(Value::List(items)) => used.extend(items.iter().filter_map(Value::edge_id)),
            Some(value) => used.extend(value.edge_id()),
            None => {}
        }
    }
    used
}

fn describe_types(types: &[EdgeType]) -> String {
    if types.is_empty() {
        String::new()
    } else {
        format!(":{}", types.iter().map(|t| t.as_str()).collect::<Vec<_>>().join("|"))
    }
}

/// Generated names are left out of plan descriptions
pub(crate) fn shown(variable: &str) -> &str {
    if is_hidden(variable) {
        ""
    } else {
        variable
    }
}

fn describe_labels(labels: &[Label]) -> String {
    labels.iter().map(|l| format!(":{}", l)).collect()
}

fn arrows(direction: Direction) -> (&'static str, &'static str) {
    match direction {
        Direction::Outgoing => ("-", "->"),
        Direction::Incoming => ("<-", "-"),
        Direction::Both => ("-", "-"),
    }
}

/// Leaf of every pipeline: yields the enclosing row once per reset
#[derive(Default)]
pub struct ArgumentOperator {
    done: bool,
}

impl ArgumentOperator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PhysicalOperator for ArgumentOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        Ok(Some(ctx.current_argument().cloned().unwrap_or_default()))
    }

    fn reset(&mut self) {
        self.done = false;
    }

    fn describe(&self) -> String {
        "Argument".to_string()
    }
}

/// Node scan operator: MATCH (n:Person {name: 'Alice'})
pub struct NodeScanOperator {
    input: OperatorBox,
    /// Variable name to bind nodes to
    variable: String,
    /// Labels the node must carry
    labels: Vec<Label>,
    properties: Option<Expression>,
    current_record: Option<Record>,
    filter: Vec<(String, Value)>,
    candidates: Vec<NodeId>,
    position: usize,
}

impl NodeScanOperator {
    pub fn new(input: OperatorBox, variable: String, labels: Vec<Label>, properties: Option<Expression>) -> Self {
        Self {
            input,
            variable,
            labels,
            properties,
            current_record: None,
            filter: Vec::new(),
            candidates: Vec::new(),
            position: 0,
        }
    }

    fn load_candidates(&self, record: &Record, graph: &GraphStore) -> ExecutionResult<Vec<NodeId>> {
        if record.has(&self.variable) {
            return Ok(bound_node(record, &self.variable)?.into_iter().collect());
        }

        // Anchor on the smallest label set, or a label+property lookup
        let Some(label) = self.labels.iter().min_by_key(|l| graph.label_cardinality(l)) else {
            return Ok(graph.node_ids());
        };
        if let Some((key, value)) = self.filter.first() {
            if let Ok(property) = value.to_property() {
                if !property.is_null() {
                    return Ok(graph.find_nodes(label, key, &property));
                }
            }
        }
        Ok(graph.nodes_with_label(label))
    }
}

impl PhysicalOperator for NodeScanOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        loop {
            ctx.check_deadline("NodeScan")?;
            if let Some(record) = &self.current_record {
                let graph = ctx.graph();
                while self.position < self.candidates.len() {
                    let id = self.candidates[self.position];
                    self.position += 1;

                    let Some(node) = graph.node(id) else { continue };
                    if !self.labels.iter().all(|l| node.has_label(l)) || !properties_match(&node.properties, &self.filter) {
                        continue;
                    }
                    let mut out = record.clone();
                    out.bind(self.variable.clone(), Value::NodeRef(id));
                    return Ok(Some(out));
                }
            }

            // Need new input record
            let Some(record) = self.input.next(ctx)? else {
                return Ok(None);
            };
            self.filter = evaluate_property_filter(&self.properties, &record, ctx)?;
            self.candidates = self.load_candidates(&record, ctx.graph())?;
            self.position = 0;
            self.current_record = Some(record);
        }
    }

    fn reset(&mut self) {
        self.input.reset();
        self.current_record = None;
        self.candidates.clear();
        self.position = 0;
    }

    fn describe(&self) -> String {
        format!("NodeScan({}{})", shown(&self.variable), describe_labels(&self.labels))
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }
}

/// Relationship pattern shared by the expand operators
pub struct ExpandSpec {
    pub from: String,
    pub edge_variable: String,
    pub to: String,
    pub types: Vec<EdgeType>,
    pub direction: Direction,
    pub edge_properties: Option<Expression>,
    pub to_labels: Vec<Label>,
    pub to_properties: Option<Expression>,
    /// Relationship variables bound earlier in the same MATCH
    pub used_edges: Vec<String>,
}

impl ExpandSpec {
    fn describe(&self, name: &str, length: &str) -> String {
        let (left, right) = arrows(self.direction);
        format!(
            "{}(({}){}[{}{}{}]{}({}{}))",
            name,
            shown(&self.from),
            left,
            shown(&self.edge_variable),
            describe_types(&self.types),
            length,
            right,
            shown(&self.to),
            describe_labels(&self.to_labels)
        )
    }

    /// Whether the end node satisfies the pattern and any existing binding
    fn accepts_target(
        &self,
        record: &Record,
        graph: &GraphStore,
        target: NodeId,
        filter: &[(String, Value)],
    ) -> ExecutionResult<bool> {
        if record.has(&self.to) && bound_node(record, &self.to)? != Some(target) {
            return Ok(false);
        }
        Ok(graph
            .node(target)
            .is_some_and(|n| self.to_labels.iter().all(|l| n.has_label(l)) && properties_match(&n.properties, filter)))
    }
}

/// Expand operator: MATCH (a)-[r:KNOWS]->(b)
pub struct ExpandOperator {
    input: OperatorBox,
    spec: ExpandSpec,
    current_record: Option<Record>,
    edge_filter: Vec<(String, Value)>,
    node_filter: Vec<(String, Value)>,
    candidates: Vec<(EdgeId, NodeId)>,
    position: usize,
}

impl ExpandOperator {
    pub fn new(input: OperatorBox, spec: ExpandSpec) -> Self {
        Self {
            input,
            spec,
            current_record: None,
            edge_filter: Vec::new(),
            node_filter: Vec::new(),
            candidates: Vec::new(),
            position: 0,
        }
    }

    fn load_edges(&mut self, record: &Record, graph: &GraphStore) -> ExecutionResult<()> {
        self.position = 0;
        self.candidates.clear();
        let Some(from) = bound_node(record, &self.spec.from)? else {
            return Ok(());
        };

        let mut candidates = neighbours(graph, from, self.spec.direction, &self.spec.types);
        if let Some(bound) = record.get(&self.spec.edge_variable) {
            // Relationship bound by an earlier clause: only that one can match
            let Some(edge_id) = bound.edge_id() else {
                if bound.is_null() {
                    return Ok(());
                }
                return Err(ExecutionError::TypeError(format!(
                    "Variable `{}` is a {}, not a relationship",
                    self.spec.edge_variable,
                    bound.type_name()
                )));
            };
            candidates.retain(|(id, _)| *id == edge_id);
        }
        let used = used_edge_ids(record, &self.spec.used_edges);
        candidates.retain(|(id, _)| !used.contains(id));
        self.candidates = candidates;
        Ok(())
    }
}

impl PhysicalOperator for ExpandOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        loop {
            ctx.check_deadline("Expand")?;
            if let Some(record) = &self.current_record {
                let graph = ctx.graph();
                while self.position < self.candidates.len() {
                    let (edge_id, target) = self.candidates[self.position];
                    self.position += 1;

                    let Some(edge) = graph.edge(edge_id) else { continue };
                    if !properties_match(&edge.properties, &self.edge_filter)
                        || !self.spec.accepts_target(record, graph, target, &self.node_filter)?
                    {
                        continue;
                    }
                    let mut out = record.clone();
                    out.bind(self.spec.edge_variable.clone(), Value::EdgeRef(edge_id));
                    out.bind(self.spec.to.clone(), Value::NodeRef(target));
                    return Ok(Some(out));
                }
            }

            let Some(record) = self.input.next(ctx)? else {
                return Ok(None);
            };
            self.edge_filter = evaluate_property_filter(&self.spec.edge_properties, &record, ctx)?;
            self.node_filter = evaluate_property_filter(&self.spec.to_properties, &record, ctx)?;
            self.load_edges(&record, ctx.graph())?;
            self.current_record = Some(record);
        }
    }

    fn reset(&mut self) {
        self.input.reset();
        self.current_record = None;
        self.candidates.clear();
        self.position = 0;
    }

    fn describe(&self) -> String {
        self.spec.describe("Expand", "")
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }
}

/// Variable-length expand: MATCH (a)-[:KNOWS*1..3]->(b)
///
/// Enumerates every relationship-unique path whose length lies in
/// `min..=max`; the relationship variable is bound to the list of edges.
pub struct VarLengthExpandOperator {
    input: OperatorBox,
    spec: ExpandSpec,
    min: u32,
    max: Option<u32>,
    current_record: Option<Record>,
    results: VecDeque<(Vec<EdgeId>, NodeId)>,
}

impl VarLengthExpandOperator {
    pub fn new(input: OperatorBox, spec: ExpandSpec, min: u32, max: Option<u32>) -> Self {
        Self { input, spec, min, max, current_record: None, results: VecDeque::new() }
    }

    fn load_paths(&mut self, record: &Record, ctx: &mut ExecutionContext) -> ExecutionResult<()> {
        self.results.clear();
        let Some(from) = bound_node(record, &self.spec.from)? else {
            return Ok(());
        };
        let edge_filter = evaluate_property_filter(&self.spec.edge_properties, record, ctx)?;
        let node_filter = evaluate_property_filter(&self.spec.to_properties, record, ctx)?;
        let used = used_edge_ids(record, &self.spec.used_edges);
        let bound_path = record.get(&self.spec.edge_variable).cloned();

        let graph = ctx.graph();
        let mut found = Vec::new();
        // Depth-first, pre-order, so shorter prefixes come out first
        let mut stack: Vec<(NodeId, Vec<EdgeId>)> = vec![(from, Vec::new())];
        while let Some((node, path)) = stack.pop() {
            let depth = path.len() as u32;
            if depth >= self.min && self.spec.accepts_target(record, graph, node, &node_filter)? {
                let edges_match = match &bound_path {
                    Some(bound) => *bound == Value::List(path.iter().map(|e| Value::EdgeRef(*e)).collect()),
                    None => true,
                };
                if edges_match {
                    found.push((path.clone(), node));
                    ctx.check_rows(found.len(), "variable-length expand")?;
                }
            }
            if self.max.is_some_and(|max| depth >= max) {
                continue;
            }

            let mut children = Vec::new();
            for (edge_id, next) in neighbours(graph, node, self.spec.direction, &self.spec.types) {
                if path.contains(&edge_id) || used.contains(&edge_id) {
                    continue;
                }
                if !graph.edge(edge_id).is_some_and(|e| properties_match(&e.properties, &edge_filter)) {
                    continue;
                }
                let mut extended = path.clone();
                extended.push(edge_id);
                children.push((next, extended));
            }
            stack.extend(children.into_iter().rev());
        }
        self.results = found.into();
        Ok(())
    }
}

impl PhysicalOperator for VarLengthExpandOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        loop {
            ctx.check_deadline("VarLengthExpand")?;
            if let Some(record) = &self.current_record {
                if let Some((edges, target)) = self.results.pop_front() {
                    let mut out = record.clone();
                    out.bind(
                        self.spec.edge_variable.clone(),
                        Value::List(edges.into_iter().map(Value::EdgeRef).collect()),
                    );
                    out.bind(self.spec.to.clone(), Value::NodeRef(target));
                    return Ok(Some(out));
                }
            }

            let Some(record) = self.input.next(ctx)? else {
                return Ok(None);
            };
            self.load_paths(&record, ctx)?;
            self.current_record = Some(record);
        }
    }

    fn reset(&mut self) {
        self.input.reset();
        self.current_record = None;
        self.results.clear();
    }

    fn describe(&self) -> String {
        let length = match self.max {
            Some(max) => format!("*{}..{}", self.min, max),
            None => format!("*{}..", self.min),
        };
        self.spec.describe("VarLengthExpand", &length)
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }
}

/// shortestPath((a)-[:R*..5]->(b)) with both ends already bound
pub struct ShortestPathOperator {
    input: OperatorBox,
    from: String,
    to: String,
    edge_variable: Option<String>,
    path_variable: Option<String>,
    types: Vec<EdgeType>,
    direction: Direction,
    edge_properties: Option<Expression>,
    min: u32,
    max: Option<u32>,
}

impl ShortestPathOperator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input: OperatorBox,
        from: String,
        to: String,
        edge_variable: Option<String>,
        path_variable: Option<String>,
        types: Vec<EdgeType>,
        direction: Direction,
        edge_properties: Option<Expression>,
        min: u32,
        max: Option<u32>,
    ) -> Self {
        Self { input, from, to, edge_variable, path_variable, types, direction, edge_properties, min, max }
    }

    /// Breadth-first search; neighbours are visited in adjacency order so
    /// the chosen path is deterministic
    fn search(&self, graph: &GraphStore, from: NodeId, to: NodeId, filter: &[(String, Value)]) -> Option<PathRef> {
        if from == to {
            return (self.min == 0).then(|| PathRef { nodes: vec![from], edges: Vec::new() });
        }

        let mut parents: FxHashMap<NodeId, (NodeId, EdgeId)> = FxHashMap::default();
        let mut visited: FxHashSet<NodeId> = FxHashSet::default();
        let mut queue = VecDeque::new();
        visited.insert(from);
        queue.push_back((from, 0u32));

        while let Some((node, depth)) = queue.pop_front() {
            if self.max.is_some_and(|max| depth >= max) {
                continue;
            }
            for (edge_id, next) in neighbours(graph, node, self.direction, &self.types) {
                if !graph.edge(edge_id).is_some_and(|e| properties_match(&e.properties, filter)) {
                    continue;
                }
                if !visited.insert(next) {
                    continue;
                }
                parents.insert(next, (node, edge_id));
                if next == to {
                    let mut nodes = vec![to];
                    let mut edges = Vec::new();
                    let mut cursor = to;
                    while let Some((parent, edge)) = parents.get(&cursor) {
                        edges.push(*edge);
                        nodes.push(*parent);
                        cursor = *parent;
                    }
                    nodes.reverse();
                    edges.reverse();
                    return (edges.len() as u32 >= self.min).then_some(PathRef { nodes, edges });
                }
                queue.push_back((next, depth + 1));
            }
        }
        None
    }
}

impl PhysicalOperator for ShortestPathOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        while let Some(mut record) = self.input.next(ctx)? {
            ctx.check_deadline("ShortestPath")?;
            let (Some(from), Some(to)) = (bound_node(&record, &self.from)?, bound_node(&record, &self.to)?) else {
                continue;
            };
            let filter = evaluate_property_filter(&self.edge_properties, &record, ctx)?;
            let Some(path) = self.search(ctx.graph(), from, to, &filter) else {
                continue;
            };
            if let Some(var) = &self.edge_variable {
                record.bind(var.clone(), Value::List(path.edges.iter().map(|e| Value::EdgeRef(*e)).collect()));
            }
            if let Some(var) = &self.path_variable {
                record.bind(var.clone(), Value::PathRef(path));
            }
            return Ok(Some(record));
        }
        Ok(None)
    }

    fn reset(&mut self) {
        self.input.reset();
    }

    fn describe(&self) -> String {
        let (left, right) = arrows(self.direction);
        format!(
            "ShortestPath(({}){}[{}]{}({}))",
            shown(&self.from),
            left,
            describe_types(&self.types),
            right,
            shown(&self.to)
        )
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }
}

/// One hop of a named path
#[derive(Debug, Clone)]
pub struct PathStep {
    pub edge: String,
    pub variable_length: bool,
    pub node: String,
}

/// Binds `p = (a)-[r]->(b)...` from the variables its pattern bound
pub struct BindPathOperator {
    input: OperatorBox,
    variable: String,
    start: String,
    steps: Vec<PathStep>,
}

impl BindPathOperator {
    pub fn new(input: OperatorBox, variable: String, start: String, steps: Vec<PathStep>) -> Self {
        Self { input, variable, start, steps }
    }

    fn build(&self, record: &Record, graph: &GraphStore) -> ExecutionResult<Option<PathRef>> {
        let Some(start) = bound_node(record, &self.start)? else {
            return Ok(None);
        };
        let mut path = PathRef { nodes: vec![start], edges: Vec::new() };
        let mut cursor = start;
        for step in &self.steps {
            let edges: Vec<EdgeId> = match record.get(&step.edge) {
                Some(Value::Null) | None => return Ok(None),
                Some(Value::List(items)) if step.variable_length => items.iter().filter_map(Value::edge_id).collect(),
                Some(value) => value.edge_id().into_iter().collect(),
            };
            for edge_id in edges {
                let Some(edge) = graph.edge(edge_id) else {
                    return Ok(None);
                };
                cursor = edge.other_end(cursor);
                path.edges.push(edge_id);
                path.nodes.push(cursor);
            }
        }
        Ok(Some(path))
    }
}

impl PhysicalOperator for BindPathOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        let Some(mut record) = self.input.next(ctx)? else {
            return Ok(None);
        };
        let path = self.build(&record, ctx.graph())?;
        record.bind(self.variable.clone(), path.map_or(Value::Null, Value::PathRef));
        Ok(Some(record))
    }

    fn reset(&mut self) {
        self.input.reset();
    }

    fn describe(&self) -> String {
        format!("BindPath({})", self.variable)
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }
}

/// Filter operator: WHERE n.age > 30
pub struct FilterOperator {
    input: OperatorBox,
    predicate: Expression,
}

impl FilterOperator {
    pub fn new(input: OperatorBox, predicate: Expression) -> Self {
        Self { input, predicate }
    }
}

impl PhysicalOperator for FilterOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        while let Some(record) = self.input.next(ctx)? {
            if evaluate_predicate(&self.predicate, &record, ctx)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn reset(&mut self) {
        self.input.reset();
    }

    fn describe(&self) -> String {
        "Filter".to_string()
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }
}

/// OPTIONAL MATCH: left outer join of each input row with a sub-plan
pub struct OptionalMatchOperator {
    input: OperatorBox,
    inner: OperatorBox,
    /// Variables the inner plan introduces; bound to null when it finds nothing
    new_variables: Vec<String>,
    buffer: VecDeque<Record>,
}

impl OptionalMatchOperator {
    pub fn new(input: OperatorBox, inner: OperatorBox, new_variables: Vec<String>) -> Self {
        Self { input, inner, new_variables, buffer: VecDeque::new() }
    }
}

impl PhysicalOperator for OptionalMatchOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some(record));
            }
            let Some(record) = self.input.next(ctx)? else {
                return Ok(None);
            };
            let matches = run_subplan(&mut self.inner, record.clone(), ctx, "optional match")?;
            if matches.is_empty() {
                let mut padded = record;
                for var in &self.new_variables {
                    padded.bind(var.clone(), Value::Null);
                }
                return Ok(Some(padded));
            }
            self.buffer.extend(matches);
        }
    }

    fn reset(&mut self) {
        self.input.reset();
        self.inner.reset();
        self.buffer.clear();
    }

    fn describe(&self) -> String {
        "OptionalMatch".to_string()
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref(), self.inner.as_ref()]
    }
}

/// Project operator: evaluates items and binds them next to the input's variables
pub struct ProjectOperator {
    input: OperatorBox,
    items: Vec<(String, Expression)>,
}

impl ProjectOperator {
    pub fn new(input: OperatorBox, items: Vec<(String, Expression)>) -> Self {
        Self { input, items }
    }
}

impl PhysicalOperator for ProjectOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        let Some(mut record) = self.input.next(ctx)? else {
            return Ok(None);
        };
        // Every item sees the incoming row, not earlier items
        let values = self
            .items
            .iter()
            .map(|(_, expr)| evaluate(expr, &record, ctx))
            .collect::<ExecutionResult<Vec<_>>>()?;
        for ((name, _), value) in self.items.iter().zip(values) {
            record.bind(name.clone(), value);
        }
        Ok(Some(record))
    }

    fn reset(&mut self) {
        self.input.reset();
    }

    fn describe(&self) -> String {
        format!("Project({})", self.items.iter().map(|(n, _)| n.trim()).collect::<Vec<_>>().join(", "))
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }
}

/// Narrows each row to the output columns
pub struct SelectOperator {
    input: OperatorBox,
    columns: Vec<String>,
}

impl SelectOperator {
    pub fn new(input: OperatorBox, columns: Vec<String>) -> Self {
        Self { input, columns }
    }
}

impl PhysicalOperator for SelectOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        Ok(self.input.next(ctx)?.map(|record| record.project(&self.columns)))
    }

    fn reset(&mut self) {
        self.input.reset();
    }

    fn describe(&self) -> String {
        format!("Select({})", self.columns.join(", "))
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    CountStar,
    Sum,
    Avg,
    Min,
    Max,
    Collect,
}

/// An aggregate call lifted out of a projection
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub kind: AggregateKind,
    pub argument: Option<Expression>,
    pub distinct: bool,
}

impl AggregateSpec {
    pub fn count_star() -> Self {
        Self { kind: AggregateKind::CountStar, argument: None, distinct: false }
    }

    pub fn from_call(name: &str, args: &[Expression], distinct: bool) -> ExecutionResult<Self> {
        let kind = match name.to_ascii_lowercase().as_str() {
            "count" => AggregateKind::Count,
            "sum" => AggregateKind::Sum,
            "avg" => AggregateKind::Avg,
            "min" => AggregateKind::Min,
            "max" => AggregateKind::Max,
            "collect" => AggregateKind::Collect,
            _ => return Err(ExecutionError::UnknownFunction(name.to_string())),
        };
        if args.len() != 1 {
            return Err(ExecutionError::PlanningError(format!(
                "{}() expects exactly one argument, got {}",
                name,
                args.len()
            )));
        }
        if args[0].contains_aggregate() {
            return Err(ExecutionError::PlanningError(
                "Aggregate functions cannot be nested".to_string(),
            ));
        }
        Ok(Self { kind, argument: Some(args[0].clone()), distinct })
    }

    fn describe(&self) -> String {
        let name = match self.kind {
            AggregateKind::Count | AggregateKind::CountStar => "count",
            AggregateKind::Sum => "sum",
            AggregateKind::Avg => "avg",
            AggregateKind::Min => "min",
            AggregateKind::Max => "max",
            AggregateKind::Collect => "collect",
        };
        if self.kind == AggregateKind::CountStar {
            "count(*)".to_string()
        } else if self.distinct {
            format!("{}(DISTINCT ..)", name)
        } else {
            format!("{}(..)", name)
        }
    }
}

/// Running state of one aggregate within one group
enum Accumulator {
    Count(i64),
    Sum { int: i64, float: f64, is_float: bool },
    Avg { sum: f64, count: i64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Collect(Vec<Value>),
}

impl Accumulator {
    fn new(kind: AggregateKind) -> Self {
        match kind {
            AggregateKind::Count | AggregateKind::CountStar => Accumulator::Count(0),
            AggregateKind::Sum => Accumulator::Sum { int: 0, float: 0.0, is_float: false },
            AggregateKind::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
            AggregateKind::Min => Accumulator::Min(None),
            AggregateKind::Max => Accumulator::Max(None),
            AggregateKind::Collect => Accumulator::Collect(Vec::new()),
        }
    }

    fn update(&mut self, value: Value, ctx: &ExecutionContext) -> ExecutionResult<()> {
        match self {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Sum { int, float, is_float } => match value {
                Value::Int(i) if !*is_float => {
                    *int = int.checked_add(i).ok_or_else(|| ExecutionError::Overflow("sum()".to_string()))?
                }
                Value::Int(_) | Value::Float(_) => {
                    if !*is_float {
                        *is_float = true;
                        *float = *int as f64;
                    }
                    *float += value.as_float().unwrap_or_default();
                }
                other => {
                    return Err(ExecutionError::TypeError(format!(
                        "sum() expects numbers, got {}",
                        other.type_name()
                    )))
                }
            },
            Accumulator::Avg { sum, count } => {
                let x = value.as_float().ok_or_else(|| {
                    ExecutionError::TypeError(format!("avg() expects numbers, got {}", value.type_name()))
                })?;
                *sum += x;
                *count += 1;
            }
            Accumulator::Min(current) => {
                if current.as_ref().map_or(true, |c| order_values(&value, c).is_lt()) {
                    *current = Some(value);
                }
            }
            Accumulator::Max(current) => {
                if current.as_ref().map_or(true, |c| order_values(&value, c).is_gt()) {
                    *current = Some(value);
                }
            }
            Accumulator::Collect(items) => {
                items.push(value);
                ctx.check_collection(items.len(), "collect()")?;
            }
        }
        Ok(())
    }

    fn finish(self) -> Value {
        match self {
            Accumulator::Count(n) => Value::Int(n),
            Accumulator::Sum { int, float, is_float } => {
                if is_float {
                    Value::Float(float)
                } else {
                    Value::Int(int)
                }
            }
            Accumulator::Avg { sum, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    Value::Float(sum / count as f64)
                }
            }
            Accumulator::Min(value) | Accumulator::Max(value) => value.unwrap_or(Value::Null),
            Accumulator::Collect(items) => Value::List(items),
        }
    }
}

struct Group {
    accumulators: Vec<Accumulator>,
    seen: Vec<FxHashSet<Value>>,
}

impl Group {
    fn new(aggregates: &[(String, AggregateSpec)]) -> Self {
        Self {
            accumulators: aggregates.iter().map(|(_, spec)| Accumulator::new(spec.kind)).collect(),
            seen: aggregates.iter().map(|_| FxHashSet::default()).collect(),
        }
    }
}

/// Aggregate operator: groups rows by the key items and folds the aggregates
pub struct AggregateOperator {
    input: OperatorBox,
    keys: Vec<(String, Expression)>,
    aggregates: Vec<(String, AggregateSpec)>,
    results: Option<VecDeque<Record>>,
}

impl AggregateOperator {
    pub fn new(input: OperatorBox, keys: Vec<(String, Expression)>, aggregates: Vec<(String, AggregateSpec)>) -> Self {
        Self { input, keys, aggregates, results: None }
    }

    fn aggregate(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<VecDeque<Record>> {
        let mut groups: IndexMap<Vec<Value>, Group> = IndexMap::new();

        while let Some(record) = self.input.next(ctx)? {
            let key = self
                .keys
                .iter()
                .map(|(_, expr)| evaluate(expr, &record, ctx))
                .collect::<ExecutionResult<Vec<_>>>()?;
            if !groups.contains_key(&key) {
                groups.insert(key.clone(), Group::new(&self.aggregates));
                ctx.check_rows(groups.len(), "aggregation")?;
            }

            for (index, (_, spec)) in self.aggregates.iter().enumerate() {
                let value = match &spec.argument {
                    None => Value::Bool(true),
                    Some(expr) => evaluate(expr, &record, ctx)?,
                };
                if value.is_null() {
                    continue;
                }
                let Some(group) = groups.get_mut(&key) else { continue };
                if spec.distinct && !group.seen[index].insert(value.clone()) {
                    continue;
                }
                group.accumulators[index].update(value, ctx)?;
            }
        }

        // Without grouping keys an empty input still yields one row
        if groups.is_empty() && self.keys.is_empty() {
            groups.insert(Vec::new(), Group::new(&self.aggregates));
        }

        let mut rows = VecDeque::with_capacity(groups.len());
        for (key, group) in groups {
            let mut record = Record::new();
            for ((name, _), value) in self.keys.iter().zip(key) {
                record.bind(name.clone(), value);
            }
            for ((name, _), accumulator) in self.aggregates.iter().zip(group.accumulators) {
                record.bind(name.clone(), accumulator.finish());
            }
            rows.push_back(record);
        }
        Ok(rows)
    }
}

impl PhysicalOperator for AggregateOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        if self.results.is_none() {
            self.results = Some(self.aggregate(ctx)?);
        }
        Ok(self.results.as_mut().and_then(|rows| rows.pop_front()))
    }

    fn reset(&mut self) {
        self.input.reset();
        self.results = None;
    }

    fn describe(&self) -> String {
        let keys: Vec<&str> = self.keys.iter().map(|(n, _)| n.trim()).collect();
        let aggregates: Vec<String> = self.aggregates.iter().map(|(_, spec)| spec.describe()).collect();
        format!("Aggregate(keys=[{}], {})", keys.join(", "), aggregates.join(", "))
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }
}

/// Drops rows whose `columns` repeat an earlier row
pub struct DistinctOperator {
    input: OperatorBox,
    columns: Vec<String>,
    seen: FxHashSet<Vec<Value>>,
}

impl DistinctOperator {
    pub fn new(input: OperatorBox, columns: Vec<String>) -> Self {
        Self { input, columns, seen: FxHashSet::default() }
    }
}

impl PhysicalOperator for DistinctOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        while let Some(record) = self.input.next(ctx)? {
            if self.seen.insert(record.values(&self.columns)) {
                ctx.check_rows(self.seen.len(), "distinct")?;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn reset(&mut self) {
        self.input.reset();
        self.seen.clear();
    }

    fn describe(&self) -> String {
        format!("Distinct({})", self.columns.join(", "))
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }
}

/// Sort operator: ORDER BY, stable, nulls last ascending
pub struct SortOperator {
    input: OperatorBox,
    /// (expression, ascending)
    keys: Vec<(Expression, bool)>,
    sorted: Option<VecDeque<Record>>,
}

impl SortOperator {
    pub fn new(input: OperatorBox, keys: Vec<(Expression, bool)>) -> Self {
        Self { input, keys, sorted: None }
    }

    fn sort(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<VecDeque<Record>> {
        let mut rows: Vec<(Vec<Value>, Record)> = Vec::new();
        while let Some(record) = self.input.next(ctx)? {
            let key = self
                .keys
                .iter()
                .map(|(expr, _)| evaluate(expr, &record, ctx))
                .collect::<ExecutionResult<Vec<_>>>()?;
            rows.push((key, record));
            ctx.check_rows(rows.len(), "sort")?;
        }

        rows.sort_by(|(a, _), (b, _)| {
            for ((x, y), (_, ascending)) in a.iter().zip(b).zip(&self.keys) {
                let ord = order_values(x, y);
                if !ord.is_eq() {
                    return if *ascending { ord } else { ord.reverse() };
                }
            }
            std::cmp::Ordering::Equal
        });
        Ok(rows.into_iter().map(|(_, record)| record).collect())
    }
}

impl PhysicalOperator for SortOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        if self.sorted.is_none() {
            self.sorted = Some(self.sort(ctx)?);
        }
        Ok(self.sorted.as_mut().and_then(|rows| rows.pop_front()))
    }

    fn reset(&mut self) {
        self.input.reset();
        self.sorted = None;
    }

    fn describe(&self) -> String {
        format!("Sort({} keys)", self.keys.len())
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }
}

/// SKIP and LIMIT take a non-negative integer (literal or parameter)
fn evaluate_count(expr: &Expression, ctx: &mut ExecutionContext, clause: &str) -> ExecutionResult<usize> {
    match evaluate(expr, &Record::new(), ctx)? {
        Value::Int(n) if n >= 0 => Ok(n as usize),
        other => Err(ExecutionError::RuntimeError(format!(
            "{} expects a non-negative integer, got {}",
            clause, other
        ))),
    }
}

/// Skip operator: SKIP 10
pub struct SkipOperator {
    input: OperatorBox,
    count: Expression,
    skipped: bool,
}

impl SkipOperator {
    pub fn new(input: OperatorBox, count: Expression) -> Self {
        Self { input, count, skipped: false }
    }
}

impl PhysicalOperator for SkipOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        if !self.skipped {
            self.skipped = true;
            let count = evaluate_count(&self.count, ctx, "SKIP")?;
            for _ in 0..count {
                if self.input.next(ctx)?.is_none() {
                    return Ok(None);
                }
            }
        }
        self.input.next(ctx)
    }

    fn reset(&mut self) {
        self.input.reset();
        self.skipped = false;
    }

    fn describe(&self) -> String {
        "Skip".to_string()
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }
}

/// Limit operator: LIMIT 10
pub struct LimitOperator {
    input: OperatorBox,
    count: Expression,
    remaining: Option<usize>,
}

impl LimitOperator {
    pub fn new(input: OperatorBox, count: Expression) -> Self {
        Self { input, count, remaining: None }
    }
}

impl PhysicalOperator for LimitOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        let remaining = match self.remaining {
            Some(n) => n,
            None => evaluate_count(&self.count, ctx, "LIMIT")?,
        };
        if remaining == 0 {
            self.remaining = Some(0);
            return Ok(None);
        }
        self.remaining = Some(remaining - 1);
        self.input.next(ctx)
    }

    fn reset(&mut self) {
        self.input.reset();
        self.remaining = None;
    }

    fn describe(&self) -> String {
        "Limit".to_string()
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }
}

/// Unwind operator: UNWIND list AS x
pub struct UnwindOperator {
    input: OperatorBox,
    expression: Expression,
    variable: String,
    current_record: Option<Record>,
    items: VecDeque<Value>,
}

impl UnwindOperator {
    pub fn new(input: OperatorBox, expression: Expression, variable: String) -> Self {
        Self { input, expression, variable, current_record: None, items: VecDeque::new() }
    }
}

impl PhysicalOperator for UnwindOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        loop {
            ctx.check_deadline("Unwind")?;
            if let Some(record) = &self.current_record {
                if let Some(item) = self.items.pop_front() {
                    let mut out = record.clone();
                    out.bind(self.variable.clone(), item);
                    return Ok(Some(out));
                }
            }

            let Some(record) = self.input.next(ctx)? else {
                return Ok(None);
            };
            // null unwinds to nothing, a scalar to itself
            self.items = match evaluate(&self.expression, &record, ctx)? {
                Value::Null => VecDeque::new(),
                Value::List(items) => items.into(),
                other => VecDeque::from([other]),
            };
            self.current_record = Some(record);
        }
    }

    fn reset(&mut self) {
        self.input.reset();
        self.current_record = None;
        self.items.clear();
    }

    fn describe(&self) -> String {
        format!("Unwind({})", self.variable)
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }
}

/// Concatenates independently planned branches (UNION ALL)
pub struct UnionOperator {
    branches: Vec<OperatorBox>,
    current: usize,
}

impl UnionOperator {
    pub fn new(branches: Vec<OperatorBox>) -> Self {
        Self { branches, current: 0 }
    }
}

impl PhysicalOperator for UnionOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        while let Some(branch) = self.branches.get_mut(self.current) {
            if let Some(record) = branch.next(ctx)? {
                return Ok(Some(record));
            }
            self.current += 1;
        }
        Ok(None)
    }

    fn reset(&mut self) {
        for branch in &mut self.branches {
            branch.reset();
        }
        self.current = 0;
    }

    fn describe(&self) -> String {
        format!("Union({} branches)", self.branches.len())
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        self.branches.iter().map(|b| b.as_ref()).collect()
    }

    fn is_mutating(&self) -> bool {
        self.branches.iter().any(|b| b.is_mutating())
    }
}

/// Helper so planner code can check whether an expression calls an aggregate
pub fn is_aggregate_call(expr: &Expression) -> bool {
    matches!(expr, Expression::CountStar)
        || matches!(expr, Expression::Function { name, .. } if is_aggregate_function(name))
}
