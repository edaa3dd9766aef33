//! Query execution engine using the Volcano iterator model
//!
//! The planner lowers a parsed [`Query`] into a tree of physical operators.
//! Rows are pulled from the root one at a time; write operators stage their
//! changes on a [`StagedGraph`] so the caller decides whether they commit.

pub mod eval;
pub mod operator;
pub mod planner;
pub mod procedure;
pub mod record;
pub mod write;

pub use operator::{OperatorBox, PhysicalOperator};
pub use planner::{ExecutionPlan, QueryPlanner};
pub use record::{order_values, PathRef, PathValue, QueryResult, Record, Row, Value};

use crate::config::QueryLimits;
use crate::graph::{GraphError, GraphStore, StagedGraph};
use crate::query::ast::Query;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Query parameters, referenced as `$name`
pub type Params = HashMap<String, Value>;

/// Execution errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// Graph store error
    #[error("Graph error: {0}")]
    GraphError(#[from] GraphError),

    /// Planning error
    #[error("Planning error: {0}")]
    PlanningError(String),

    /// Runtime error
    #[error("Runtime error: {0}")]
    RuntimeError(String),

    /// Type error
    #[error("Type error: {0}")]
    TypeError(String),

    /// Variable not found
    #[error("Variable not found: {0}")]
    VariableNotFound(String),

    #[error("Expected parameter: ${0}")]
    ParameterMissing(String),

    #[error("Invalid parameter ${0}: {1}")]
    InvalidParameter(String, String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Integer overflow in {0}")]
    Overflow(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// Recognized but not supported by this engine
    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Graph access granted to an executing plan
pub enum GraphAccess<'a> {
    Read(&'a GraphStore),
    Write(&'a mut StagedGraph),
}

/// Everything an operator can reach while producing rows
pub struct ExecutionContext<'a> {
    graph: GraphAccess<'a>,
    params: &'a Params,
    limits: &'a QueryLimits,
    /// Rows pushed by enclosing sub-plans (OPTIONAL MATCH, MERGE, FOREACH, EXISTS)
    arguments: Vec<Record>,
    started: Instant,
}

impl<'a> ExecutionContext<'a> {
    pub fn read(graph: &'a GraphStore, params: &'a Params, limits: &'a QueryLimits) -> Self {
        Self { graph: GraphAccess::Read(graph), params, limits, arguments: Vec::new(), started: Instant::now() }
    }

    pub fn write(staged: &'a mut StagedGraph, params: &'a Params, limits: &'a QueryLimits) -> Self {
        Self { graph: GraphAccess::Write(staged), params, limits, arguments: Vec::new(), started: Instant::now() }
    }

    /// Current view of the graph, including writes staged so far
    pub fn graph(&self) -> &GraphStore {
        match &self.graph {
            GraphAccess::Read(graph) => graph,
            GraphAccess::Write(staged) => staged.graph(),
        }
    }

    pub fn staged(&mut self) -> ExecutionResult<&mut StagedGraph> {
        match &mut self.graph {
            GraphAccess::Write(staged) => Ok(staged),
            GraphAccess::Read(_) => Err(ExecutionError::RuntimeError(
                "Cannot execute write query with read-only executor".to_string(),
            )),
        }
    }

    pub fn param(&self, name: &str) -> ExecutionResult<&Value> {
        self.params
            .get(name)
            .ok_or_else(|| ExecutionError::ParameterMissing(name.to_string()))
    }

    pub fn limits(&self) -> &QueryLimits {
        self.limits
    }

    pub fn push_argument(&mut self, record: Record) {
        self.arguments.push(record);
    }

    pub fn pop_argument(&mut self) {
        self.arguments.pop();
    }

    pub fn current_argument(&self) -> Option<&Record> {
        self.arguments.last()
    }

    /// Fails once a materializing operator holds more rows than allowed
    pub fn check_rows(&self, held: usize, operator: &str) -> ExecutionResult<()> {
        match self.limits.max_intermediate_rows {
            Some(max) if held > max => Err(ExecutionError::ResourceLimitExceeded(format!(
                "{} holds more than {} rows",
                operator, max
            ))),
            _ => Ok(()),
        }
    }

    /// Fails once the statement has run for its soft timeout. Row-producing
    /// operators call this before pulling more input.
    pub fn check_deadline(&self, operator: &str) -> ExecutionResult<()> {
        match self.limits.soft_timeout_ms {
            Some(ms) if self.started.elapsed() >= Duration::from_millis(ms) => {
                Err(ExecutionError::ResourceLimitExceeded(format!("{} ran past the {}ms timeout", operator, ms)))
            }
            _ => Ok(()),
        }
    }

    /// Fails once a built list grows past the collection limit
    pub fn check_collection(&self, len: usize, what: &str) -> ExecutionResult<()> {
        match self.limits.max_collection_items {
            Some(max) if len > max => Err(ExecutionError::ResourceLimitExceeded(format!(
                "{} produced more than {} items",
                what, max
            ))),
            _ => Ok(()),
        }
    }
}

/// Check that every parameter can be bound into a query
pub fn validate_params(params: &Params) -> ExecutionResult<()> {
    fn check(name: &str, value: &Value) -> ExecutionResult<()> {
        match value {
            Value::List(items) => items.iter().try_for_each(|v| check(name, v)),
            Value::Map(map) => map.values().try_for_each(|v| check(name, v)),
            Value::NodeRef(_)
            | Value::EdgeRef(_)
            | Value::PathRef(_)
            | Value::Node(_)
            | Value::Relationship(_)
            | Value::Path(_) => Err(ExecutionError::InvalidParameter(
                name.to_string(),
                format!("{} values cannot be passed as parameters", value.type_name()),
            )),
            _ => Ok(()),
        }
    }
    params.iter().try_for_each(|(name, value)| check(name, value))
}

/// Build parameters from a JSON object
pub fn params_from_json(json: &serde_json::Value) -> ExecutionResult<Params> {
    let object = json.as_object().ok_or_else(|| {
        ExecutionError::InvalidParameter("*".to_string(), "parameters must be a JSON object".to_string())
    })?;
    object
        .iter()
        .map(|(name, value)| {
            Value::from_json(value)
                .map(|v| (name.clone(), v))
                .map_err(|e| ExecutionError::InvalidParameter(name.clone(), e.0))
        })
        .collect()
}

/// Pull every row out of a plan and materialize it against the final graph view
fn run_plan(plan: ExecutionPlan, ctx: &mut ExecutionContext) -> ExecutionResult<QueryResult> {
    debug!("Executing plan:\n{}", plan.explain().join("\n"));
    let ExecutionPlan { mut root, output_columns, .. } = plan;

    let mut records = Vec::new();
    while let Some(record) = root.next(ctx)? {
        ctx.check_deadline("result")?;
        if !output_columns.is_empty() {
            records.push(record);
            ctx.check_rows(records.len(), "result")?;
        }
    }

    let graph = ctx.graph();
    let rows = records
        .into_iter()
        .map(|record| {
            output_columns
                .iter()
                .map(|column| {
                    let value = record.get(column).cloned().unwrap_or(Value::Null);
                    (column.clone(), value.materialize(graph))
                })
                .collect()
        })
        .collect();

    Ok(QueryResult { columns: output_columns, rows })
}

/// One row per operator, indented by depth, in column `plan`
fn explain_result(plan: &ExecutionPlan) -> QueryResult {
    let column = "plan".to_string();
    let rows = plan
        .explain()
        .into_iter()
        .map(|line| std::iter::once((column.clone(), Value::String(line))).collect())
        .collect();
    QueryResult { columns: vec![column], rows }
}

/// Query executor for read-only queries (MATCH, RETURN, etc.)
pub struct QueryExecutor<'a> {
    store: &'a GraphStore,
    params: &'a Params,
    limits: &'a QueryLimits,
}

impl<'a> QueryExecutor<'a> {
    pub fn new(store: &'a GraphStore, params: &'a Params, limits: &'a QueryLimits) -> Self {
        Self { store, params, limits }
    }

    /// Execute a read-only query and return results
    pub fn execute(&self, query: &Query) -> ExecutionResult<QueryResult> {
        validate_params(self.params)?;
        let plan = QueryPlanner::new().plan(query)?;
        if query.explain {
            return Ok(explain_result(&plan));
        }

        // Check if this is a write query - if so, error out
        if plan.is_write {
            return Err(ExecutionError::RuntimeError(
                "Cannot execute write query with read-only executor; use a write transaction".to_string(),
            ));
        }

        let mut ctx = ExecutionContext::read(self.store, self.params, self.limits);
        run_plan(plan, &mut ctx)
    }
}

/// Query executor for write queries (CREATE, DELETE, SET, etc.)
/// Changes land in the staged graph; committing them is the caller's job.
pub struct MutQueryExecutor<'a> {
    staged: &'a mut StagedGraph,
    params: &'a Params,
    limits: &'a QueryLimits,
}

impl<'a> MutQueryExecutor<'a> {
    pub fn new(staged: &'a mut StagedGraph, params: &'a Params, limits: &'a QueryLimits) -> Self {
        Self { staged, params, limits }
    }

    /// Execute a query (read or write) and return results
    pub fn execute(&mut self, query: &Query) -> ExecutionResult<QueryResult> {
        validate_params(self.params)?;
        let plan = QueryPlanner::new().plan(query)?;
        if query.explain {
            return Ok(explain_result(&plan));
        }
        let mut ctx = ExecutionContext::write(self.staged, self.params, self.limits);
        run_plan(plan, &mut ctx)
    }
}
