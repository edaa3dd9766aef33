//! Query planner - converts AST to execution plan
//!
//! Clauses are planned left to right on top of a single pipeline. The
//! planner tracks which variables are in scope so it can reject references
//! to unknown variables before anything executes.

use super::operator::{
    explain_lines, is_aggregate_call, AggregateOperator, AggregateSpec, ArgumentOperator, BindPathOperator,
    DistinctOperator, ExpandOperator, ExpandSpec, FilterOperator, LimitOperator, NodeScanOperator,
    OperatorBox, OptionalMatchOperator, PathStep, ProjectOperator, SelectOperator, ShortestPathOperator,
    SkipOperator, SortOperator, UnionOperator, UnwindOperator, VarLengthExpandOperator,
};
use super::procedure::{self, ProcedureCallOperator};
use super::record::is_hidden;
use super::write::{
    CreateOperator, DeleteOperator, ForeachOperator, MergeOperator, NodeSpec, PathSpec, RelationshipSpec,
    RemoveOperator, SetOperator,
};
use super::{ExecutionError, ExecutionResult};
use crate::query::ast::*;
use indexmap::IndexSet;
use tracing::debug;

/// Variables bound at a point in the pipeline
type Scope = IndexSet<String>;

/// Execution plan - a tree of physical operators
pub struct ExecutionPlan {
    /// Root operator
    pub root: OperatorBox,
    /// Output column names
    pub output_columns: Vec<String>,
    /// Whether this plan contains write operations
    pub is_write: bool,
}

impl ExecutionPlan {
    /// Operator tree, one line per operator
    pub fn explain(&self) -> Vec<String> {
        explain_lines(self.root.as_ref())
    }
}

/// Query planner
#[derive(Default)]
pub struct QueryPlanner {
    /// Counter for generated variable names
    generated: usize,
}

impl QueryPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan a query
    pub fn plan(&mut self, query: &Query) -> ExecutionResult<ExecutionPlan> {
        let (root, output_columns) = self.plan_statement(&query.statement)?;
        let is_write = !query.is_read_only();
        if query.unions.is_empty() {
            return Ok(ExecutionPlan { root, output_columns, is_write });
        }

        if output_columns.is_empty() {
            return Err(ExecutionError::PlanningError(
                "Every part of a UNION must end with RETURN".to_string(),
            ));
        }
        let all = query.unions[0].all;
        if query.unions.iter().any(|u| u.all != all) {
            return Err(ExecutionError::PlanningError(
                "Invalid combination of UNION and UNION ALL".to_string(),
            ));
        }

        let mut branches = vec![root];
        for part in &query.unions {
            let (branch, columns) = self.plan_statement(&part.statement)?;
            if columns != output_columns {
                return Err(ExecutionError::PlanningError(
                    "All sub queries in a UNION must have the same return column names".to_string(),
                ));
            }
            branches.push(branch);
        }

        let mut root: OperatorBox = Box::new(UnionOperator::new(branches));
        if !all {
            root = Box::new(DistinctOperator::new(root, output_columns.clone()));
        }
        Ok(ExecutionPlan { root, output_columns, is_write })
    }

    /// Plan the pattern of an `EXISTS { ... }` predicate; `bound` lists the
    /// variables of the row it is evaluated against
    pub fn plan_exists(
        &mut self,
        pattern: &Pattern,
        where_clause: Option<&Expression>,
        bound: &[String],
    ) -> ExecutionResult<OperatorBox> {
        let mut scope: Scope = bound.iter().cloned().collect();
        let mut op = self.plan_pattern(Box::new(ArgumentOperator::new()), pattern, &mut scope)?;
        if let Some(predicate) = where_clause {
            check_variables(predicate, &scope)?;
            op = Box::new(FilterOperator::new(op, predicate.clone()));
        }
        Ok(op)
    }

    fn plan_statement(&mut self, statement: &Statement) -> ExecutionResult<(OperatorBox, Vec<String>)> {
        let mut scope = Scope::new();
        let mut op: OperatorBox = Box::new(ArgumentOperator::new());
        let mut columns = Vec::new();

        for clause in &statement.clauses {
            if let Clause::Return(ret) = clause {
                let (projected, names) = self.plan_projection(op, &ret.projection, &scope, true)?;
                op = projected;
                columns = names;
            } else {
                op = self.plan_clause(clause, op, &mut scope)?;
            }
        }
        if let [Clause::Call(_)] = statement.clauses.as_slice() {
            columns = scope.iter().cloned().collect();
        }
        debug!("Planned statement with {} clauses, columns {:?}", statement.clauses.len(), columns);
        Ok((op, columns))
    }

    fn plan_clause(&mut self, clause: &Clause, input: OperatorBox, scope: &mut Scope) -> ExecutionResult<OperatorBox> {
        match clause {
            Clause::Match(m) => self.plan_match(input, m, scope),
            Clause::Unwind(u) => {
                check_variables(&u.expression, scope)?;
                scope.insert(u.variable.clone());
                Ok(Box::new(UnwindOperator::new(input, u.expression.clone(), u.variable.clone())))
            }
            Clause::Create(c) => {
                let mut paths = Vec::new();
                for part in &c.pattern.parts {
                    paths.push(self.create_spec(part, scope, "CREATE")?);
                }
                Ok(Box::new(CreateOperator::new(input, paths)))
            }
            Clause::Merge(m) => self.plan_merge(input, m, scope),
            Clause::Set(s) => {
                for item in &s.items {
                    check_set_item(item, scope)?;
                }
                Ok(Box::new(SetOperator::new(input, s.items.clone())))
            }
            Clause::Remove(r) => {
                for item in &r.items {
                    let (RemoveItem::Property { variable, .. } | RemoveItem::Labels { variable, .. }) = item;
                    require_variable(variable, scope)?;
                }
                Ok(Box::new(RemoveOperator::new(input, r.items.clone())))
            }
            Clause::Delete(d) => {
                for expr in &d.expressions {
                    check_variables(expr, scope)?;
                }
                Ok(Box::new(DeleteOperator::new(input, d.expressions.clone(), d.detach)))
            }
            Clause::Foreach(f) => {
                check_variables(&f.list, scope)?;
                let mut inner_scope = scope.clone();
                inner_scope.insert(f.variable.clone());
                let mut body: OperatorBox = Box::new(ArgumentOperator::new());
                for inner in &f.clauses {
                    if !inner.is_write() {
                        return Err(ExecutionError::PlanningError(
                            "FOREACH may only contain CREATE, MERGE, SET, REMOVE, DELETE or FOREACH".to_string(),
                        ));
                    }
                    body = self.plan_clause(inner, body, &mut inner_scope)?;
                }
                Ok(Box::new(ForeachOperator::new(input, f.variable.clone(), f.list.clone(), body)))
            }
            Clause::With(w) => {
                let (mut op, names) = self.plan_projection(input, &w.projection, scope, false)?;
                *scope = names.into_iter().collect();
                if let Some(predicate) = &w.where_clause {
                    check_variables(predicate, scope)?;
                    op = Box::new(FilterOperator::new(op, predicate.clone()));
                }
                Ok(op)
            }
            Clause::Call(c) => self.plan_call(input, c, scope),
            Clause::Return(_) => Err(ExecutionError::PlanningError("RETURN must be the last clause".to_string())),
        }
    }

    fn plan_match(&mut self, input: OperatorBox, m: &MatchClause, scope: &mut Scope) -> ExecutionResult<OperatorBox> {
        if !m.optional {
            let mut op = self.plan_pattern(input, &m.pattern, scope)?;
            if let Some(predicate) = &m.where_clause {
                check_variables(predicate, scope)?;
                op = Box::new(FilterOperator::new(op, predicate.clone()));
            }
            return Ok(op);
        }

        // OPTIONAL MATCH: the pattern and its WHERE run as a sub-plan per row
        let mut inner_scope = scope.clone();
        let mut inner = self.plan_pattern(Box::new(ArgumentOperator::new()), &m.pattern, &mut inner_scope)?;
        if let Some(predicate) = &m.where_clause {
            check_variables(predicate, &inner_scope)?;
            inner = Box::new(FilterOperator::new(inner, predicate.clone()));
        }
        let new_variables: Vec<String> = inner_scope.iter().filter(|v| !scope.contains(*v)).cloned().collect();
        *scope = inner_scope;
        Ok(Box::new(OptionalMatchOperator::new(input, inner, new_variables)))
    }

    fn plan_call(&mut self, input: OperatorBox, c: &CallClause, scope: &mut Scope) -> ExecutionResult<OperatorBox> {
        let procedure = procedure::lookup(&c.procedure)
            .ok_or_else(|| ExecutionError::Unsupported(format!("procedure {}", c.procedure)))?;
        for arg in &c.args {
            check_variables(arg, scope)?;
        }

        let fields = procedure.fields();
        let bindings: Vec<(usize, String)> = if c.yields.is_empty() {
            fields.iter().enumerate().map(|(i, field)| (i, field.to_string())).collect()
        } else {
            c.yields
                .iter()
                .map(|item| {
                    fields
                        .iter()
                        .position(|field| *field == item.field)
                        .map(|i| (i, item.name().to_string()))
                        .ok_or_else(|| {
                            ExecutionError::PlanningError(format!(
                                "Procedure {} has no output `{}`",
                                c.procedure, item.field
                            ))
                        })
                })
                .collect::<ExecutionResult<_>>()?
        };
        for (_, variable) in &bindings {
            if !scope.insert(variable.clone()) {
                return Err(ExecutionError::PlanningError(format!("Variable `{}` already declared", variable)));
            }
        }
        Ok(Box::new(ProcedureCallOperator::new(input, c.procedure.clone(), procedure, c.args.clone(), bindings)))
    }

    fn plan_merge(&mut self, input: OperatorBox, m: &MergeClause, scope: &mut Scope) -> ExecutionResult<OperatorBox> {
        let mut create_scope = scope.clone();
        let path = self.create_spec(&m.part, &mut create_scope, "MERGE")?;

        let mut match_scope = scope.clone();
        let match_plan =
            self.plan_pattern_part(Box::new(ArgumentOperator::new()), &m.part, &mut match_scope, &mut Vec::new())?;
        *scope = match_scope;

        for item in m.on_create.iter().chain(&m.on_match) {
            check_set_item(item, scope)?;
        }
        Ok(Box::new(MergeOperator::new(input, match_plan, path, m.on_create.clone(), m.on_match.clone())))
    }

    fn generated_name(&mut self, kind: &str) -> String {
        self.generated += 1;
        // The leading space keeps generated names apart from user variables
        format!(" {}_{}", kind, self.generated)
    }

    fn node_variable(&mut self, node: &NodePattern) -> String {
        match &node.variable {
            Some(v) => v.clone(),
            None => self.generated_name("node"),
        }
    }

    fn edge_variable(&mut self, edge: &EdgePattern) -> String {
        match &edge.variable {
            Some(v) => v.clone(),
            None => self.generated_name("rel"),
        }
    }

    fn plan_pattern(&mut self, input: OperatorBox, pattern: &Pattern, scope: &mut Scope) -> ExecutionResult<OperatorBox> {
        let mut op = input;
        // Relationship uniqueness holds across all parts of one MATCH
        let mut used_edges = Vec::new();
        for part in &pattern.parts {
            op = self.plan_pattern_part(op, part, scope, &mut used_edges)?;
        }
        Ok(op)
    }

    fn check_pattern_properties(&self, properties: &Option<Expression>, scope: &Scope) -> ExecutionResult<()> {
        match properties {
            Some(expr) => check_variables(expr, scope),
            None => Ok(()),
        }
    }

    fn plan_pattern_part(
        &mut self,
        input: OperatorBox,
        part: &PatternPart,
        scope: &mut Scope,
        used_edges: &mut Vec<String>,
    ) -> ExecutionResult<OperatorBox> {
        match part.kind {
            PathKind::Plain => {}
            PathKind::Shortest => return self.plan_shortest_path(input, part, scope),
            PathKind::AllShortest => {
                return Err(ExecutionError::Unsupported("allShortestPaths is not supported".to_string()))
            }
        }

        let start = &part.path.start;
        self.check_pattern_properties(&start.properties, scope)?;
        let start_var = self.node_variable(start);
        let mut op: OperatorBox =
            Box::new(NodeScanOperator::new(input, start_var.clone(), start.labels.clone(), start.properties.clone()));
        scope.insert(start_var.clone());

        let mut previous = start_var.clone();
        let mut steps = Vec::new();
        for segment in &part.path.segments {
            self.check_pattern_properties(&segment.edge.properties, scope)?;
            self.check_pattern_properties(&segment.node.properties, scope)?;
            let edge_var = self.edge_variable(&segment.edge);
            let node_var = self.node_variable(&segment.node);
            let spec = ExpandSpec {
                from: previous.clone(),
                edge_variable: edge_var.clone(),
                to: node_var.clone(),
                types: segment.edge.types.clone(),
                direction: segment.edge.direction,
                edge_properties: segment.edge.properties.clone(),
                to_labels: segment.node.labels.clone(),
                to_properties: segment.node.properties.clone(),
                used_edges: used_edges.clone(),
            };
            op = match segment.edge.length {
                Some(range) => Box::new(VarLengthExpandOperator::new(op, spec, range.min, range.max)),
                None => Box::new(ExpandOperator::new(op, spec)),
            };
            used_edges.push(edge_var.clone());
            scope.insert(edge_var.clone());
            scope.insert(node_var.clone());
            steps.push(PathStep {
                edge: edge_var,
                variable_length: segment.edge.length.is_some(),
                node: node_var.clone(),
            });
            previous = node_var;
        }

        if let Some(path_var) = &part.variable {
            op = Box::new(BindPathOperator::new(op, path_var.clone(), start_var, steps));
            scope.insert(path_var.clone());
        }
        Ok(op)
    }

    fn plan_shortest_path(&mut self, input: OperatorBox, part: &PatternPart, scope: &mut Scope) -> ExecutionResult<OperatorBox> {
        let [segment] = part.path.segments.as_slice() else {
            return Err(ExecutionError::PlanningError(
                "shortestPath requires a single relationship pattern".to_string(),
            ));
        };
        let start = &part.path.start;
        let end = &segment.node;
        self.check_pattern_properties(&start.properties, scope)?;
        self.check_pattern_properties(&end.properties, scope)?;
        self.check_pattern_properties(&segment.edge.properties, scope)?;

        let from = self.node_variable(start);
        let to = self.node_variable(end);
        let mut op: OperatorBox =
            Box::new(NodeScanOperator::new(input, from.clone(), start.labels.clone(), start.properties.clone()));
        scope.insert(from.clone());
        op = Box::new(NodeScanOperator::new(op, to.clone(), end.labels.clone(), end.properties.clone()));
        scope.insert(to.clone());

        let (min, max) = match segment.edge.length {
            Some(range) => (range.min, range.max),
            None => (1, Some(1)),
        };
        if let Some(var) = &segment.edge.variable {
            scope.insert(var.clone());
        }
        if let Some(var) = &part.variable {
            scope.insert(var.clone());
        }
        Ok(Box::new(ShortestPathOperator::new(
            op,
            from,
            to,
            segment.edge.variable.clone(),
            part.variable.clone(),
            segment.edge.types.clone(),
            segment.edge.direction,
            segment.edge.properties.clone(),
            min,
            max,
        )))
    }

    /// Lower a CREATE / MERGE pattern part. New variables are added to `scope`.
    fn create_spec(&mut self, part: &PatternPart, scope: &mut Scope, clause: &str) -> ExecutionResult<PathSpec> {
        if part.kind != PathKind::Plain {
            return Err(ExecutionError::PlanningError(format!("{} cannot use shortestPath", clause)));
        }

        let start = self.create_node_spec(&part.path.start, scope, clause, part.path.segments.is_empty())?;
        let mut steps = Vec::new();
        for segment in &part.path.segments {
            let edge = &segment.edge;
            if edge.length.is_some() {
                return Err(ExecutionError::PlanningError(format!(
                    "Variable length relationships cannot be used in {}",
                    clause
                )));
            }
            let [edge_type] = edge.types.as_slice() else {
                return Err(ExecutionError::PlanningError(format!(
                    "Exactly one relationship type must be specified for {}",
                    clause
                )));
            };
            if edge.direction == Direction::Both && clause == "CREATE" {
                return Err(ExecutionError::PlanningError(
                    "Only directed relationships are supported in CREATE".to_string(),
                ));
            }
            if let Some(var) = &edge.variable {
                if scope.contains(var) {
                    return Err(ExecutionError::PlanningError(format!("Variable `{}` already declared", var)));
                }
            }
            if let Some(props) = &edge.properties {
                check_variables(props, scope)?;
            }
            let variable = self.edge_variable(edge);
            scope.insert(variable.clone());
            let relationship = RelationshipSpec {
                variable,
                edge_type: edge_type.clone(),
                properties: edge.properties.clone(),
                reversed: edge.direction == Direction::Incoming,
            };
            let node = self.create_node_spec(&segment.node, scope, clause, false)?;
            steps.push((relationship, node));
        }

        if let Some(var) = &part.variable {
            scope.insert(var.clone());
        }
        Ok(PathSpec { path_variable: part.variable.clone(), start, steps })
    }

    fn create_node_spec(
        &mut self,
        node: &NodePattern,
        scope: &mut Scope,
        clause: &str,
        alone: bool,
    ) -> ExecutionResult<NodeSpec> {
        if let Some(var) = &node.variable {
            if scope.contains(var) {
                // A bound node may only be referenced, never redeclared
                if alone || !node.labels.is_empty() || node.properties.is_some() {
                    return Err(ExecutionError::PlanningError(format!(
                        "Variable `{}` already declared; {} cannot redefine it",
                        var, clause
                    )));
                }
                return Ok(NodeSpec { variable: var.clone(), labels: Vec::new(), properties: None });
            }
        }
        if let Some(props) = &node.properties {
            check_variables(props, scope)?;
        }
        let variable = self.node_variable(node);
        scope.insert(variable.clone());
        Ok(NodeSpec { variable, labels: node.labels.clone(), properties: node.properties.clone() })
    }

    /// Plan WITH / RETURN. Returns the operator and the projected names.
    fn plan_projection(
        &mut self,
        input: OperatorBox,
        projection: &Projection,
        scope: &Scope,
        is_return: bool,
    ) -> ExecutionResult<(OperatorBox, Vec<String>)> {
        let clause = if is_return { "RETURN" } else { "WITH" };
        let mut items: Vec<(String, Expression)> = Vec::new();

        if projection.star {
            let mut visible: Vec<&String> = scope.iter().filter(|v| !is_hidden(v)).collect();
            visible.sort();
            if visible.is_empty() {
                return Err(ExecutionError::PlanningError(format!(
                    "{} * is not allowed when there are no variables in scope",
                    clause
                )));
            }
            items.extend(visible.into_iter().map(|v| (v.clone(), Expression::Variable(v.clone()))));
        }
        for item in &projection.items {
            if !is_return && item.alias.is_none() && !matches!(item.expression, Expression::Variable(_)) {
                return Err(ExecutionError::PlanningError(format!(
                    "Expression in WITH must be aliased (use AS): {}",
                    item.text
                )));
            }
            check_variables(&item.expression, scope)?;
            items.push((item.name().to_string(), item.expression.clone()));
        }

        let names: Vec<String> = items.iter().map(|(name, _)| name.clone()).collect();
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(ExecutionError::PlanningError(format!(
                    "Multiple result columns with the same name `{}`",
                    name
                )));
            }
        }

        let aggregating = items.iter().any(|(_, expr)| expr.contains_aggregate());

        // ORDER BY may name projected items by expression or alias; without
        // aggregation or DISTINCT it also sees the incoming variables
        let mut order_scope: Scope = names.iter().cloned().collect();
        if !aggregating && !projection.distinct {
            order_scope.extend(scope.iter().cloned());
        }
        let mut order_keys = Vec::new();
        for sort in &projection.order_by {
            let expr = match items.iter().find(|(_, e)| *e == sort.expression) {
                Some((name, _)) => Expression::Variable(name.clone()),
                None => {
                    check_variables(&sort.expression, &order_scope)?;
                    sort.expression.clone()
                }
            };
            order_keys.push((expr, sort.ascending));
        }
        for bound in [&projection.skip, &projection.limit].into_iter().flatten() {
            check_variables(bound, &Scope::new())?;
        }

        let mut op = input;
        if aggregating {
            let mut keys = Vec::new();
            let mut aggregates = Vec::new();
            let mut computed = Vec::new();
            for (name, expr) in &items {
                if expr.contains_aggregate() {
                    computed.push((name.clone(), self.extract_aggregates(expr, &mut aggregates)?));
                } else {
                    keys.push((name.clone(), expr.clone()));
                }
            }
            for (expr, _) in &mut order_keys {
                if expr.contains_aggregate() {
                    *expr = self.extract_aggregates(expr, &mut aggregates)?;
                }
            }
            op = Box::new(AggregateOperator::new(op, keys, aggregates));
            op = Box::new(ProjectOperator::new(op, computed));
        } else {
            op = Box::new(ProjectOperator::new(op, items));
        }

        if projection.distinct {
            op = Box::new(DistinctOperator::new(op, names.clone()));
        }
        if !order_keys.is_empty() {
            op = Box::new(SortOperator::new(op, order_keys));
        }
        if let Some(skip) = &projection.skip {
            op = Box::new(SkipOperator::new(op, skip.clone()));
        }
        if let Some(limit) = &projection.limit {
            op = Box::new(LimitOperator::new(op, limit.clone()));
        }
        op = Box::new(SelectOperator::new(op, names.clone()));
        Ok((op, names))
    }

    /// Replace every aggregate call in `expr` by a generated variable that
    /// the aggregate operator binds
    fn extract_aggregates(
        &mut self,
        expr: &Expression,
        aggregates: &mut Vec<(String, AggregateSpec)>,
    ) -> ExecutionResult<Expression> {
        if is_aggregate_call(expr) {
            let spec = match expr {
                Expression::Function { name, args, distinct } => AggregateSpec::from_call(name, args, *distinct)?,
                _ => AggregateSpec::count_star(),
            };
            // Identical calls share one slot
            if let Some((slot, _)) = aggregates.iter().find(|(_, s)| *s == spec) {
                return Ok(Expression::Variable(slot.clone()));
            }
            let slot = self.generated_name("agg");
            aggregates.push((slot.clone(), spec));
            return Ok(Expression::Variable(slot));
        }

        let mut recurse = |e: &Expression| -> ExecutionResult<Box<Expression>> {
            Ok(Box::new(self.extract_aggregates(e, aggregates)?))
        };
        Ok(match expr {
            Expression::Property { expr, key } => Expression::Property { expr: recurse(expr)?, key: key.clone() },
            Expression::Binary { left, op, right } => {
                Expression::Binary { left: recurse(left)?, op: *op, right: recurse(right)? }
            }
            Expression::Unary { op, expr } => Expression::Unary { op: *op, expr: recurse(expr)? },
            Expression::HasLabels { expr, labels } => {
                Expression::HasLabels { expr: recurse(expr)?, labels: labels.clone() }
            }
            Expression::Index { expr, index } => Expression::Index { expr: recurse(expr)?, index: recurse(index)? },
            Expression::Slice { expr, from, to } => Expression::Slice {
                expr: recurse(expr)?,
                from: from.as_deref().map(&mut recurse).transpose()?,
                to: to.as_deref().map(&mut recurse).transpose()?,
            },
            Expression::List(items) => {
                Expression::List(items.iter().map(|e| recurse(e).map(|b| *b)).collect::<ExecutionResult<_>>()?)
            }
            Expression::Map(entries) => Expression::Map(
                entries
                    .iter()
                    .map(|(k, e)| recurse(e).map(|b| (k.clone(), *b)))
                    .collect::<ExecutionResult<_>>()?,
            ),
            Expression::Function { name, args, distinct } => Expression::Function {
                name: name.clone(),
                args: args.iter().map(|e| recurse(e).map(|b| *b)).collect::<ExecutionResult<_>>()?,
                distinct: *distinct,
            },
            Expression::Case { operand, when_clauses, else_result } => Expression::Case {
                operand: operand.as_deref().map(&mut recurse).transpose()?,
                when_clauses: when_clauses
                    .iter()
                    .map(|(w, t)| -> ExecutionResult<(Expression, Expression)> { Ok((*recurse(w)?, *recurse(t)?)) })
                    .collect::<ExecutionResult<_>>()?,
                else_result: else_result.as_deref().map(&mut recurse).transpose()?,
            },
            Expression::ListComprehension { variable, list, filter, map } => Expression::ListComprehension {
                variable: variable.clone(),
                list: recurse(list)?,
                filter: filter.clone(),
                map: map.clone(),
            },
            other => other.clone(),
        })
    }
}

fn require_variable(variable: &str, scope: &Scope) -> ExecutionResult<()> {
    if scope.contains(variable) {
        Ok(())
    } else {
        Err(ExecutionError::VariableNotFound(variable.to_string()))
    }
}

fn check_set_item(item: &SetItem, scope: &Scope) -> ExecutionResult<()> {
    match item {
        SetItem::Property { variable, value, .. }
        | SetItem::ReplaceProperties { variable, value }
        | SetItem::MergeProperties { variable, value } => {
            require_variable(variable, scope)?;
            check_variables(value, scope)
        }
        SetItem::Labels { variable, .. } => require_variable(variable, scope),
    }
}

/// Fail on the first variable `expr` reads that is not in `scope`
fn check_variables(expr: &Expression, scope: &Scope) -> ExecutionResult<()> {
    let mut free = Vec::new();
    free_variables(expr, &mut Vec::new(), &mut free);
    match free.into_iter().find(|v| !scope.contains(v)) {
        Some(missing) => Err(ExecutionError::VariableNotFound(missing)),
        None => Ok(()),
    }
}

/// Variables referenced by `expr` that are not bound inside it
fn free_variables(expr: &Expression, locals: &mut Vec<String>, out: &mut Vec<String>) {
    match expr {
        Expression::Variable(name) => {
            if !locals.contains(name) {
                out.push(name.clone());
            }
        }
        Expression::Literal(_) | Expression::Parameter(_) | Expression::CountStar => {}
        Expression::Property { expr, .. } | Expression::Unary { expr, .. } | Expression::HasLabels { expr, .. } => {
            free_variables(expr, locals, out)
        }
        Expression::Binary { left, right, .. } => {
            free_variables(left, locals, out);
            free_variables(right, locals, out);
        }
        Expression::Index { expr, index } => {
            free_variables(expr, locals, out);
            free_variables(index, locals, out);
        }
        Expression::Slice { expr, from, to } => {
            free_variables(expr, locals, out);
            for bound in [from, to].into_iter().flatten() {
                free_variables(bound, locals, out);
            }
        }
        Expression::List(items) | Expression::Function { args: items, .. } => {
            for item in items {
                free_variables(item, locals, out);
            }
        }
        Expression::Map(entries) => {
            for (_, value) in entries {
                free_variables(value, locals, out);
            }
        }
        Expression::Case { operand, when_clauses, else_result } => {
            for e in [operand, else_result].into_iter().flatten() {
                free_variables(e, locals, out);
            }
            for (when, then) in when_clauses {
                free_variables(when, locals, out);
                free_variables(then, locals, out);
            }
        }
        Expression::ListComprehension { variable, list, filter, map } => {
            free_variables(list, locals, out);
            locals.push(variable.clone());
            for e in [filter, map].into_iter().flatten() {
                free_variables(e, locals, out);
            }
            locals.pop();
        }
        // Pattern variables inside EXISTS may be new; they are checked when
        // the subquery is planned against the row
        Expression::Exists { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse_query;

    fn plan(text: &str) -> ExecutionResult<ExecutionPlan> {
        QueryPlanner::new().plan(&parse_query(text).unwrap())
    }

    #[test]
    fn test_output_columns_use_alias_or_text() {
        let plan = plan("MATCH (n:Person) RETURN n.name AS name, n.age, count(n)").unwrap();
        assert_eq!(plan.output_columns, vec!["name", "n.age", "count(n)"]);
        assert!(!plan.is_write);
    }

    #[test]
    fn test_return_star_is_sorted_and_hides_generated_names() {
        let plan = plan("MATCH (b)-->(a) RETURN *").unwrap();
        assert_eq!(plan.output_columns, vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_variable_is_rejected() {
        assert!(matches!(plan("MATCH (n) RETURN m"), Err(ExecutionError::VariableNotFound(v)) if v == "m"));
        assert!(matches!(plan("MATCH (n) WITH n.x AS x RETURN n"), Err(ExecutionError::VariableNotFound(_))));
        assert!(plan("RETURN [x IN [1, 2] | x * 2] AS doubled").is_ok());
    }

    #[test]
    fn test_procedure_call_planning() {
        let standalone = plan("CALL db.info()").unwrap();
        assert_eq!(standalone.output_columns, vec!["version", "nodes", "relationships"]);
        assert!(!standalone.is_write);

        let per_row = plan("UNWIND [1, 2] AS x CALL math.add(x, 1) YIELD result AS y RETURN y").unwrap();
        assert_eq!(per_row.output_columns, vec!["y"]);

        assert!(matches!(plan("CALL db.labels()"), Err(ExecutionError::Unsupported(_))));
        assert!(matches!(plan("CALL db.info() YIELD label RETURN label"), Err(ExecutionError::PlanningError(_))));
        assert!(matches!(plan("CALL math.add(z, 1) YIELD result RETURN result"), Err(ExecutionError::VariableNotFound(_))));
        assert!(matches!(
            plan("UNWIND [1] AS result CALL math.add(1, 1) YIELD result RETURN result"),
            Err(ExecutionError::PlanningError(_))
        ));
    }

    #[test]
    fn test_with_requires_alias() {
        assert!(matches!(plan("MATCH (n) WITH n.x RETURN 1"), Err(ExecutionError::PlanningError(_))));
    }

    #[test]
    fn test_union_validation() {
        assert!(plan("RETURN 1 AS a UNION RETURN 2 AS a").is_ok());
        assert!(plan("RETURN 1 AS a UNION RETURN 2 AS b").is_err());
        assert!(plan("RETURN 1 AS a UNION RETURN 2 AS a UNION ALL RETURN 3 AS a").is_err());
    }

    #[test]
    fn test_create_validation() {
        assert!(plan("CREATE (a:A)-[:R]->(b:B)").unwrap().is_write);
        assert!(plan("CREATE (a)-[:R]-(b)").is_err());
        assert!(plan("CREATE (a)-[:R|S]->(b)").is_err());
        assert!(plan("MATCH (a) CREATE (a:Extra)").is_err());
        assert!(plan("MATCH (a) CREATE (a)-[:R]->(b)").is_ok());
    }

    #[test]
    fn test_all_shortest_paths_is_unsupported() {
        let result = plan("MATCH p = allShortestPaths((a)-[*]-(b)) RETURN p");
        assert!(matches!(result, Err(ExecutionError::Unsupported(_))));
    }

    #[test]
    fn test_explain_names_operators() {
        let plan = plan("MATCH (a:Person)-[:KNOWS]->(b) WHERE b.age > 3 RETURN b ORDER BY b.age LIMIT 2").unwrap();
        let lines = plan.explain();
        assert!(lines[0].starts_with("Select"));
        assert!(lines.iter().any(|l| l.trim_start().starts_with("Expand((a)-[:KNOWS]->(b))")));
        assert!(lines.iter().any(|l| l.trim_start() == "NodeScan(a:Person)"));
    }
}
