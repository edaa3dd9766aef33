//! Built-in procedures reachable through `CALL`
//!
//! A procedure declares its output fields up front so the planner can check
//! `YIELD` items before anything runs. Each call returns whole rows, one
//! value per declared field.

use super::record::{Record, Value};
use super::{eval::evaluate, ExecutionContext, ExecutionError, ExecutionResult, OperatorBox, PhysicalOperator};
use crate::graph::GraphStore;
use crate::query::ast::Expression;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::LazyLock;

/// A callable procedure
pub trait Procedure: Send + Sync {
    /// Output fields, in row order
    fn fields(&self) -> &'static [&'static str];

    fn call(&self, graph: &GraphStore, args: Vec<Value>) -> ExecutionResult<Vec<Vec<Value>>>;
}

/// `db.info()`: engine version and entity counts
struct DbInfo;

impl Procedure for DbInfo {
    fn fields(&self) -> &'static [&'static str] {
        &["version", "nodes", "relationships"]
    }

    fn call(&self, graph: &GraphStore, args: Vec<Value>) -> ExecutionResult<Vec<Vec<Value>>> {
        expect_args("db.info", &args, 0)?;
        Ok(vec![vec![
            Value::from(crate::VERSION),
            Value::Int(graph.node_count() as i64),
            Value::Int(graph.edge_count() as i64),
        ]])
    }
}

/// `math.add(a, b)`: float sum of two numbers, null if either is null
struct MathAdd;

impl Procedure for MathAdd {
    fn fields(&self) -> &'static [&'static str] {
        &["result"]
    }

    fn call(&self, _graph: &GraphStore, args: Vec<Value>) -> ExecutionResult<Vec<Vec<Value>>> {
        expect_args("math.add", &args, 2)?;
        let mut sum = 0.0;
        for arg in &args {
            sum += match arg {
                Value::Null => return Ok(vec![vec![Value::Null]]),
                Value::Int(i) => *i as f64,
                Value::Float(f) => *f,
                other => {
                    return Err(ExecutionError::TypeError(format!(
                        "math.add requires numeric arguments, got {}",
                        other.type_name()
                    )))
                }
            };
        }
        Ok(vec![vec![Value::Float(sum)]])
    }
}

fn expect_args(name: &str, args: &[Value], count: usize) -> ExecutionResult<()> {
    if args.len() != count {
        return Err(ExecutionError::RuntimeError(format!(
            "{} requires {} arguments, got {}",
            name,
            count,
            args.len()
        )));
    }
    Ok(())
}

static REGISTRY: LazyLock<FxHashMap<&'static str, Box<dyn Procedure>>> = LazyLock::new(|| {
    let mut procedures: FxHashMap<&'static str, Box<dyn Procedure>> = FxHashMap::default();
    procedures.insert("db.info", Box::new(DbInfo));
    procedures.insert("math.add", Box::new(MathAdd));
    procedures
});

/// Look up a built-in procedure by its exact name
pub fn lookup(name: &str) -> Option<&'static dyn Procedure> {
    REGISTRY.get(name).map(|procedure| procedure.as_ref())
}

/// Runs a procedure once per input row and binds the yielded fields
pub struct ProcedureCallOperator {
    input: OperatorBox,
    name: String,
    procedure: &'static dyn Procedure,
    args: Vec<Expression>,
    /// (field position, bound variable)
    bindings: Vec<(usize, String)>,
    current_record: Option<Record>,
    rows: VecDeque<Vec<Value>>,
}

impl ProcedureCallOperator {
    pub fn new(
        input: OperatorBox,
        name: String,
        procedure: &'static dyn Procedure,
        args: Vec<Expression>,
        bindings: Vec<(usize, String)>,
    ) -> Self {
        Self { input, name, procedure, args, bindings, current_record: None, rows: VecDeque::new() }
    }
}

impl PhysicalOperator for ProcedureCallOperator {
    fn next(&mut self, ctx: &mut ExecutionContext) -> ExecutionResult<Option<Record>> {
        loop {
            if let Some(record) = &self.current_record {
                if let Some(row) = self.rows.pop_front() {
                    let mut out = record.clone();
                    for (position, variable) in &self.bindings {
                        out.bind(variable.clone(), row.get(*position).cloned().unwrap_or(Value::Null));
                    }
                    return Ok(Some(out));
                }
            }

            ctx.check_deadline("ProcedureCall")?;
            let Some(record) = self.input.next(ctx)? else {
                return Ok(None);
            };
            let args = self
                .args
                .iter()
                .map(|arg| evaluate(arg, &record, ctx))
                .collect::<ExecutionResult<Vec<_>>>()?;
            self.rows = self.procedure.call(ctx.graph(), args)?.into();
            self.current_record = Some(record);
        }
    }

    fn reset(&mut self) {
        self.input.reset();
        self.current_record = None;
        self.rows.clear();
    }

    fn describe(&self) -> String {
        let yielded: Vec<&str> = self.bindings.iter().map(|(_, variable)| variable.as_str()).collect();
        format!("ProcedureCall({} -> {})", self.name, yielded.join(", "))
    }

    fn children(&self) -> Vec<&dyn PhysicalOperator> {
        vec![self.input.as_ref()]
    }
}
