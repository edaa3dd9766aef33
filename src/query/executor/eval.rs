//! Expression evaluation
//!
//! Null propagates through operators and functions; boolean connectives use
//! three-valued logic. Integer arithmetic is checked and only widens to
//! float when a float operand is involved.

use super::planner::QueryPlanner;
use super::record::{format_float, order_values, PathRef, Value};
use super::{ExecutionContext, ExecutionError, ExecutionResult, Record};
use crate::graph::{Edge, EdgeId, Node, NodeId};
use crate::query::ast::{BinaryOp, Expression, UnaryOp};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Evaluate an expression against one row
pub fn evaluate(expr: &Expression, record: &Record, ctx: &mut ExecutionContext) -> ExecutionResult<Value> {
    match expr {
        Expression::Literal(value) => Ok(Value::from(value)),
        Expression::Parameter(name) => ctx.param(name).cloned(),
        Expression::Variable(name) => record
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutionError::VariableNotFound(name.clone())),
        Expression::Property { expr, key } => {
            let target = evaluate(expr, record, ctx)?;
            property_of(&target, key, ctx)
        }
        Expression::List(items) => Ok(Value::List(
            items.iter().map(|e| evaluate(e, record, ctx)).collect::<ExecutionResult<_>>()?,
        )),
        Expression::Map(entries) => {
            let mut map = BTreeMap::new();
            for (key, value) in entries {
                map.insert(key.clone(), evaluate(value, record, ctx)?);
            }
            Ok(Value::Map(map))
        }
        Expression::Binary { left, op, right } => match op {
            // Short circuit only where the result is already decided
            BinaryOp::And => {
                let l = evaluate(left, record, ctx)?;
                if l == Value::Bool(false) {
                    return Ok(l);
                }
                let r = evaluate(right, record, ctx)?;
                logical(BinaryOp::And, l, r)
            }
            BinaryOp::Or => {
                let l = evaluate(left, record, ctx)?;
                if l == Value::Bool(true) {
                    return Ok(l);
                }
                let r = evaluate(right, record, ctx)?;
                logical(BinaryOp::Or, l, r)
            }
            _ => {
                let l = evaluate(left, record, ctx)?;
                let r = evaluate(right, record, ctx)?;
                binary_op(*op, l, r)
            }
        },
        Expression::Unary { op, expr } => {
            let value = evaluate(expr, record, ctx)?;
            unary_op(*op, value)
        }
        Expression::HasLabels { expr, labels } => {
            let value = evaluate(expr, record, ctx)?;
            match value {
                Value::Null => Ok(Value::Null),
                Value::NodeRef(id) => Ok(Value::Bool(
                    ctx.graph().node(id).is_some_and(|n| labels.iter().all(|l| n.has_label(l))),
                )),
                Value::Node(node) => Ok(Value::Bool(labels.iter().all(|l| node.has_label(l)))),
                other => Err(ExecutionError::TypeError(format!(
                    "Label predicate expects a node, got {}",
                    other.type_name()
                ))),
            }
        }
        Expression::Function { name, args, distinct } => {
            if crate::query::ast::is_aggregate_function(name) {
                return Err(ExecutionError::PlanningError(format!(
                    "Aggregate function {}(...) is not allowed here",
                    name
                )));
            }
            if *distinct {
                return Err(ExecutionError::PlanningError(format!(
                    "DISTINCT is only valid in aggregate functions, not {}",
                    name
                )));
            }
            let values = args.iter().map(|a| evaluate(a, record, ctx)).collect::<ExecutionResult<Vec<_>>>()?;
            call_function(name, values, ctx)
        }
        Expression::CountStar => Err(ExecutionError::PlanningError(
            "count(*) is not allowed here".to_string(),
        )),
        Expression::Case { operand, when_clauses, else_result } => {
            let subject = match operand {
                Some(e) => Some(evaluate(e, record, ctx)?),
                None => None,
            };
            for (when, then) in when_clauses {
                let candidate = evaluate(when, record, ctx)?;
                let hit = match &subject {
                    Some(s) => equals(s, &candidate) == Some(true),
                    None => candidate == Value::Bool(true),
                };
                if hit {
                    return evaluate(then, record, ctx);
                }
            }
            match else_result {
                Some(e) => evaluate(e, record, ctx),
                None => Ok(Value::Null),
            }
        }
        Expression::Index { expr, index } => {
            let target = evaluate(expr, record, ctx)?;
            let index = evaluate(index, record, ctx)?;
            index_value(target, index, ctx)
        }
        Expression::Slice { expr, from, to } => {
            let target = evaluate(expr, record, ctx)?;
            let from = match from {
                Some(e) => Some(evaluate(e, record, ctx)?),
                None => None,
            };
            let to = match to {
                Some(e) => Some(evaluate(e, record, ctx)?),
                None => None,
            };
            slice_value(target, from, to)
        }
        Expression::Exists { pattern, where_clause } => {
            // Hidden names are private to the outer plan
            let scope = record.visible();
            let bound: Vec<String> = scope.bindings().map(|(k, _)| k.clone()).collect();
            let mut plan = QueryPlanner::new().plan_exists(pattern, where_clause.as_deref(), &bound)?;
            ctx.push_argument(scope);
            let found = plan.next(ctx).map(|row| row.is_some());
            ctx.pop_argument();
            Ok(Value::Bool(found?))
        }
        Expression::ListComprehension { variable, list, filter, map } => {
            let list = evaluate(list, record, ctx)?;
            let items = match list {
                Value::Null => return Ok(Value::Null),
                Value::List(items) => items,
                other => {
                    return Err(ExecutionError::TypeError(format!(
                        "List comprehension expects a list, got {}",
                        other.type_name()
                    )))
                }
            };
            let mut scope = record.clone();
            let mut out = Vec::new();
            for item in items {
                scope.bind(variable.clone(), item.clone());
                if let Some(filter) = filter {
                    if evaluate(filter, &scope, ctx)? != Value::Bool(true) {
                        continue;
                    }
                }
                out.push(match map {
                    Some(m) => evaluate(m, &scope, ctx)?,
                    None => item,
                });
            }
            Ok(Value::List(out))
        }
    }
}

/// Evaluate a predicate; only `true` keeps a row
pub fn evaluate_predicate(expr: &Expression, record: &Record, ctx: &mut ExecutionContext) -> ExecutionResult<bool> {
    match evaluate(expr, record, ctx)? {
        Value::Bool(b) => Ok(b),
        Value::Null => Ok(false),
        other => Err(ExecutionError::TypeError(format!(
            "Predicate must evaluate to boolean, got {}",
            other.type_name()
        ))),
    }
}

fn with_node<T>(id: NodeId, ctx: &ExecutionContext, f: impl FnOnce(&Node) -> T) -> Option<T> {
    ctx.graph().node(id).map(f)
}

fn with_edge<T>(id: EdgeId, ctx: &ExecutionContext, f: impl FnOnce(&Edge) -> T) -> Option<T> {
    ctx.graph().edge(id).map(f)
}

/// `target.key`
pub fn property_of(target: &Value, key: &str, ctx: &ExecutionContext) -> ExecutionResult<Value> {
    let value = match target {
        Value::Null => None,
        Value::NodeRef(id) => with_node(*id, ctx, |n| n.get_property(key).map(Value::from)).flatten(),
        Value::EdgeRef(id) => with_edge(*id, ctx, |e| e.get_property(key).map(Value::from)).flatten(),
        Value::Node(node) => node.get_property(key).map(Value::from),
        Value::Relationship(edge) => edge.get_property(key).map(Value::from),
        Value::Map(map) => map.get(key).cloned(),
        other => {
            return Err(ExecutionError::TypeError(format!(
                "Cannot access property '{}' on {}",
                key,
                other.type_name()
            )))
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Cypher equality: `None` when the answer is unknown (a null is involved)
pub fn equals(a: &Value, b: &Value) -> Option<bool> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => Some((*x as f64) == *y),
        (Value::Float(x), Value::Float(y)) => Some(x == y),
        (Value::List(xs), Value::List(ys)) => {
            if xs.len() != ys.len() {
                return Some(false);
            }
            let mut unknown = false;
            for (x, y) in xs.iter().zip(ys) {
                match equals(x, y) {
                    Some(false) => return Some(false),
                    None => unknown = true,
                    Some(true) => {}
                }
            }
            if unknown {
                None
            } else {
                Some(true)
            }
        }
        (Value::Map(xs), Value::Map(ys)) => {
            if xs.len() != ys.len() || xs.keys().ne(ys.keys()) {
                return Some(false);
            }
            let mut unknown = false;
            for (x, y) in xs.values().zip(ys.values()) {
                match equals(x, y) {
                    Some(false) => return Some(false),
                    None => unknown = true,
                    Some(true) => {}
                }
            }
            if unknown {
                None
            } else {
                Some(true)
            }
        }
        _ => Some(a == b),
    }
}

/// Ordering for `<`-style comparisons; `None` for incomparable types
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Float(x), _) if x.is_nan() => None,
        (_, Value::Float(y)) if y.is_nan() => None,
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_))
        | (Value::String(_), Value::String(_))
        | (Value::Bool(_), Value::Bool(_))
        | (Value::List(_), Value::List(_)) => Some(order_values(a, b)),
        _ => None,
    }
}

fn as_logical(value: &Value, op: &str) -> ExecutionResult<Option<bool>> {
    match value {
        Value::Bool(b) => Ok(Some(*b)),
        Value::Null => Ok(None),
        other => Err(ExecutionError::TypeError(format!(
            "{} expects boolean operands, got {}",
            op,
            other.type_name()
        ))),
    }
}

fn logical(op: BinaryOp, l: Value, r: Value) -> ExecutionResult<Value> {
    let name = match op {
        BinaryOp::And => "AND",
        BinaryOp::Or => "OR",
        _ => "XOR",
    };
    let (l, r) = (as_logical(&l, name)?, as_logical(&r, name)?);
    let result = match op {
        BinaryOp::And => match (l, r) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        BinaryOp::Or => match (l, r) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
        _ => match (l, r) {
            (Some(a), Some(b)) => Some(a != b),
            _ => None,
        },
    };
    Ok(result.map_or(Value::Null, Value::Bool))
}

fn type_mismatch(op: &str, l: &Value, r: &Value) -> ExecutionError {
    ExecutionError::TypeError(format!("Cannot apply {} to {} and {}", op, l.type_name(), r.type_name()))
}

fn arithmetic(
    op: &str,
    l: Value,
    r: Value,
    int_op: impl Fn(i64, i64) -> ExecutionResult<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> ExecutionResult<Value> {
    match (&l, &r) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::Int(a), Value::Int(b)) => int_op(*a, *b).map(Value::Int),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let (a, b) = (l.as_float().unwrap_or_default(), r.as_float().unwrap_or_default());
            Ok(Value::Float(float_op(a, b)))
        }
        _ => Err(type_mismatch(op, &l, &r)),
    }
}

fn overflow(op: &str) -> ExecutionError {
    ExecutionError::Overflow(op.to_string())
}

/// Apply a binary operator to two evaluated operands
pub fn binary_op(op: BinaryOp, l: Value, r: Value) -> ExecutionResult<Value> {
    match op {
        BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => logical(op, l, r),
        BinaryOp::Eq => Ok(equals(&l, &r).map_or(Value::Null, Value::Bool)),
        BinaryOp::Ne => Ok(equals(&l, &r).map_or(Value::Null, |b| Value::Bool(!b))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let result = compare(&l, &r).map(|ord| match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            });
            Ok(result.map_or(Value::Null, Value::Bool))
        }
        BinaryOp::Add => match (l, r) {
            (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
            (Value::List(mut a), Value::List(b)) => {
                a.extend(b);
                Ok(Value::List(a))
            }
            (Value::List(mut a), item) => {
                a.push(item);
                Ok(Value::List(a))
            }
            (item, Value::List(b)) => {
                let mut list = Vec::with_capacity(b.len() + 1);
                list.push(item);
                list.extend(b);
                Ok(Value::List(list))
            }
            (Value::String(a), b @ (Value::String(_) | Value::Int(_) | Value::Float(_) | Value::Bool(_))) => {
                Ok(Value::String(a + &to_display_string(&b)))
            }
            (a @ (Value::Int(_) | Value::Float(_) | Value::Bool(_)), Value::String(b)) => {
                Ok(Value::String(to_display_string(&a) + &b))
            }
            (l, r) => arithmetic("+", l, r, |a, b| a.checked_add(b).ok_or_else(|| overflow("+")), |a, b| a + b),
        },
        BinaryOp::Sub => arithmetic("-", l, r, |a, b| a.checked_sub(b).ok_or_else(|| overflow("-")), |a, b| a - b),
        BinaryOp::Mul => arithmetic("*", l, r, |a, b| a.checked_mul(b).ok_or_else(|| overflow("*")), |a, b| a * b),
        BinaryOp::Div => arithmetic(
            "/",
            l,
            r,
            |a, b| {
                if b == 0 {
                    return Err(ExecutionError::DivisionByZero);
                }
                a.checked_div(b).ok_or_else(|| overflow("/"))
            },
            |a, b| a / b,
        ),
        BinaryOp::Mod => arithmetic(
            "%",
            l,
            r,
            |a, b| {
                if b == 0 {
                    return Err(ExecutionError::DivisionByZero);
                }
                Ok(a.wrapping_rem(b))
            },
            |a, b| a % b,
        ),
        BinaryOp::Pow => match (&l, &r) {
            (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => Ok(Value::Float(
                l.as_float().unwrap_or_default().powf(r.as_float().unwrap_or_default()),
            )),
            _ => Err(type_mismatch("^", &l, &r)),
        },
        BinaryOp::In => match r {
            Value::Null => Ok(Value::Null),
            Value::List(items) => {
                let mut unknown = false;
                for item in &items {
                    match equals(&l, item) {
                        Some(true) => return Ok(Value::Bool(true)),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                Ok(if unknown { Value::Null } else { Value::Bool(false) })
            }
            other => Err(ExecutionError::TypeError(format!(
                "IN expects a list on the right, got {}",
                other.type_name()
            ))),
        },
        BinaryOp::StartsWith | BinaryOp::EndsWith | BinaryOp::Contains => match (&l, &r) {
            (Value::String(a), Value::String(b)) => Ok(Value::Bool(match op {
                BinaryOp::StartsWith => a.starts_with(b.as_str()),
                BinaryOp::EndsWith => a.ends_with(b.as_str()),
                _ => a.contains(b.as_str()),
            })),
            _ => Ok(Value::Null),
        },
        BinaryOp::RegexMatch => match (&l, &r) {
            (Value::String(text), Value::String(pattern)) => {
                let regex = regex::Regex::new(&format!("^(?:{})$", pattern))
                    .map_err(|e| ExecutionError::RuntimeError(format!("Invalid regular expression: {}", e)))?;
                Ok(Value::Bool(regex.is_match(text)))
            }
            _ => Ok(Value::Null),
        },
    }
}

fn unary_op(op: UnaryOp, value: Value) -> ExecutionResult<Value> {
    match op {
        UnaryOp::IsNull => Ok(Value::Bool(value.is_null())),
        UnaryOp::IsNotNull => Ok(Value::Bool(!value.is_null())),
        UnaryOp::Not => Ok(as_logical(&value, "NOT")?.map_or(Value::Null, |b| Value::Bool(!b))),
        UnaryOp::Minus => match value {
            Value::Null => Ok(Value::Null),
            Value::Int(i) => i.checked_neg().map(Value::Int).ok_or_else(|| overflow("unary -")),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(ExecutionError::TypeError(format!("Cannot negate {}", other.type_name()))),
        },
    }
}

/// Resolve a possibly negative index into `0..len`
fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { len + index } else { index };
    (0..len).contains(&resolved).then_some(resolved as usize)
}

fn index_value(target: Value, index: Value, ctx: &ExecutionContext) -> ExecutionResult<Value> {
    match (target, index) {
        (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
        (Value::List(items), Value::Int(i)) => {
            Ok(resolve_index(i, items.len()).map_or(Value::Null, |i| items[i].clone()))
        }
        (target @ (Value::Map(_) | Value::NodeRef(_) | Value::EdgeRef(_) | Value::Node(_) | Value::Relationship(_)), Value::String(key)) => {
            property_of(&target, &key, ctx)
        }
        (target, index) => Err(ExecutionError::TypeError(format!(
            "Cannot index {} with {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}

fn slice_bound(value: Option<Value>, len: usize, default: usize) -> ExecutionResult<Option<usize>> {
    match value {
        None => Ok(Some(default)),
        Some(Value::Null) => Ok(None),
        Some(Value::Int(i)) => {
            let len = len as i64;
            let resolved = if i < 0 { len + i } else { i };
            Ok(Some(resolved.clamp(0, len) as usize))
        }
        Some(other) => Err(ExecutionError::TypeError(format!(
            "Slice bounds must be integers, got {}",
            other.type_name()
        ))),
    }
}

fn slice_value(target: Value, from: Option<Value>, to: Option<Value>) -> ExecutionResult<Value> {
    match target {
        Value::Null => Ok(Value::Null),
        Value::List(items) => {
            let len = items.len();
            let (Some(start), Some(end)) = (slice_bound(from, len, 0)?, slice_bound(to, len, len)?) else {
                return Ok(Value::Null);
            };
            if start >= end {
                return Ok(Value::List(Vec::new()));
            }
            Ok(Value::List(items[start..end].to_vec()))
        }
        other => Err(ExecutionError::TypeError(format!("Cannot slice {}", other.type_name()))),
    }
}

/// String form used by toString() and string concatenation
fn to_display_string(value: &Value) -> String {
    match value {
        Value::Float(f) => format_float(*f),
        other => other.to_string(),
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> ExecutionResult<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max { min.to_string() } else { format!("{} to {}", min, max) };
        return Err(ExecutionError::TypeError(format!(
            "{}() expects {} argument(s), got {}",
            name,
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn expect_int(name: &str, value: &Value) -> ExecutionResult<i64> {
    value.as_int().ok_or_else(|| {
        ExecutionError::TypeError(format!("{}() expects an integer, got {}", name, value.type_name()))
    })
}

fn expect_str<'v>(name: &str, value: &'v Value) -> ExecutionResult<&'v str> {
    value.as_str().ok_or_else(|| {
        ExecutionError::TypeError(format!("{}() expects a string, got {}", name, value.type_name()))
    })
}

fn expect_number(name: &str, value: &Value) -> ExecutionResult<f64> {
    value.as_float().ok_or_else(|| {
        ExecutionError::TypeError(format!("{}() expects a number, got {}", name, value.type_name()))
    })
}

fn expect_count(name: &str, value: &Value) -> ExecutionResult<usize> {
    let n = expect_int(name, value)?;
    usize::try_from(n)
        .map_err(|_| ExecutionError::RuntimeError(format!("{}() expects a non-negative length, got {}", name, n)))
}

fn path_of(name: &str, value: &Value) -> ExecutionResult<PathRef> {
    match value {
        Value::PathRef(path) => Ok(path.clone()),
        Value::Path(path) => Ok(PathRef {
            nodes: path.nodes.iter().map(|n| n.id).collect(),
            edges: path.relationships.iter().map(|e| e.id).collect(),
        }),
        other => Err(ExecutionError::TypeError(format!("{}() expects a path, got {}", name, other.type_name()))),
    }
}

fn entity_properties(value: &Value, ctx: &ExecutionContext) -> Option<BTreeMap<String, Value>> {
    let convert = |props: &crate::graph::PropertyMap| -> BTreeMap<String, Value> {
        props.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect()
    };
    match value {
        Value::NodeRef(id) => with_node(*id, ctx, |n| convert(&n.properties)),
        Value::EdgeRef(id) => with_edge(*id, ctx, |e| convert(&e.properties)),
        Value::Node(node) => Some(convert(&node.properties)),
        Value::Relationship(edge) => Some(convert(&edge.properties)),
        Value::Map(map) => Some(map.clone()),
        _ => None,
    }
}

/// Call a scalar function. Names are case-insensitive.
pub fn call_function(name: &str, args: Vec<Value>, ctx: &ExecutionContext) -> ExecutionResult<Value> {
    let lower = name.to_ascii_lowercase();
    let f = lower.as_str();

    // Functions that inspect nulls themselves
    match f {
        "coalesce" => return Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        "exists" => {
            arity(name, &args, 1, 1)?;
            return Ok(Value::Bool(!args[0].is_null()));
        }
        "timestamp" => {
            arity(name, &args, 0, 0)?;
            return Ok(Value::Int(chrono::Utc::now().timestamp_millis()));
        }
        "range" => return range(name, &args, ctx),
        _ => {}
    }

    if args.first().is_some_and(Value::is_null) {
        return match f {
            "tostring" | "toupper" | "tolower" | "trim" | "ltrim" | "rtrim" | "substring" | "size" | "replace"
            | "left" | "right" | "split" | "reverse" | "abs" | "tointeger" | "tofloat" | "toboolean" | "sign"
            | "sqrt" | "ceil" | "floor" | "round" | "exp" | "log" | "log10" | "id" | "labels" | "type" | "keys"
            | "properties" | "head" | "last" | "tail" | "length" | "nodes" | "relationships" | "startnode"
            | "endnode" => Ok(Value::Null),
            _ => Err(ExecutionError::UnknownFunction(name.to_string())),
        };
    }

    match f {
        "tostring" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                v @ (Value::String(_) | Value::Int(_) | Value::Float(_) | Value::Bool(_)) => {
                    Ok(Value::String(to_display_string(v)))
                }
                other => Err(ExecutionError::TypeError(format!(
                    "toString() cannot convert {}",
                    other.type_name()
                ))),
            }
        }
        "toupper" | "tolower" | "trim" | "ltrim" | "rtrim" => {
            arity(name, &args, 1, 1)?;
            let s = expect_str(name, &args[0])?;
            Ok(Value::String(match f {
                "toupper" => s.to_uppercase(),
                "tolower" => s.to_lowercase(),
                "trim" => s.trim().to_string(),
                "ltrim" => s.trim_start().to_string(),
                _ => s.trim_end().to_string(),
            }))
        }
        "substring" => {
            arity(name, &args, 2, 3)?;
            let s = expect_str(name, &args[0])?;
            let start = expect_count(name, &args[1])?;
            let chars = s.chars().skip(start);
            Ok(Value::String(match args.get(2) {
                Some(len) if !len.is_null() => chars.take(expect_count(name, len)?).collect(),
                _ => chars.collect(),
            }))
        }
        "left" | "right" => {
            arity(name, &args, 2, 2)?;
            let s = expect_str(name, &args[0])?;
            let n = expect_count(name, &args[1])?;
            let total = s.chars().count();
            Ok(Value::String(if f == "left" {
                s.chars().take(n).collect()
            } else {
                s.chars().skip(total.saturating_sub(n)).collect()
            }))
        }
        "replace" => {
            arity(name, &args, 3, 3)?;
            if args[1].is_null() || args[2].is_null() {
                return Ok(Value::Null);
            }
            let s = expect_str(name, &args[0])?;
            let search = expect_str(name, &args[1])?;
            let replacement = expect_str(name, &args[2])?;
            Ok(Value::String(s.replace(search, replacement)))
        }
        "split" => {
            arity(name, &args, 2, 2)?;
            if args[1].is_null() {
                return Ok(Value::Null);
            }
            let s = expect_str(name, &args[0])?;
            let delimiter = expect_str(name, &args[1])?;
            Ok(Value::List(s.split(delimiter).map(Value::from).collect()))
        }
        "reverse" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::String(s) => Ok(Value::String(s.chars().rev().collect())),
                Value::List(items) => Ok(Value::List(items.iter().rev().cloned().collect())),
                other => Err(ExecutionError::TypeError(format!("reverse() cannot reverse {}", other.type_name()))),
            }
        }
        "size" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(items) => Ok(Value::Int(items.len() as i64)),
                Value::Map(map) => Ok(Value::Int(map.len() as i64)),
                other => Err(ExecutionError::TypeError(format!("size() expects a string or list, got {}", other.type_name()))),
            }
        }
        "length" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(items) => Ok(Value::Int(items.len() as i64)),
                other => Ok(Value::Int(path_of(name, other)?.len() as i64)),
            }
        }
        "abs" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Int(i) => i.checked_abs().map(Value::Int).ok_or_else(|| overflow("abs")),
                Value::Float(x) => Ok(Value::Float(x.abs())),
                other => Err(ExecutionError::TypeError(format!("abs() expects a number, got {}", other.type_name()))),
            }
        }
        "sign" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Int(i) => Ok(Value::Int(i.signum())),
                Value::Float(x) if *x == 0.0 => Ok(Value::Int(0)),
                Value::Float(x) if x.is_nan() => Ok(Value::Float(f64::NAN)),
                Value::Float(x) => Ok(Value::Int(if *x > 0.0 { 1 } else { -1 })),
                other => Err(ExecutionError::TypeError(format!("sign() expects a number, got {}", other.type_name()))),
            }
        }
        "sqrt" | "exp" | "log" | "log10" => {
            arity(name, &args, 1, 1)?;
            let x = expect_number(name, &args[0])?;
            Ok(Value::Float(match f {
                "sqrt" => x.sqrt(),
                "exp" => x.exp(),
                "log" => x.ln(),
                _ => x.log10(),
            }))
        }
        "ceil" | "floor" | "round" => {
            arity(name, &args, 1, 1)?;
            let x = expect_number(name, &args[0])?;
            Ok(Value::Float(match f {
                "ceil" => x.ceil(),
                "floor" => x.floor(),
                _ => x.round(),
            }))
        }
        "tointeger" => {
            arity(name, &args, 1, 1)?;
            Ok(match &args[0] {
                Value::Int(i) => Value::Int(*i),
                Value::Float(x) if x.is_finite() && x.abs() < 9.2e18 => Value::Int(x.trunc() as i64),
                Value::Float(_) => Value::Null,
                Value::Bool(b) => Value::Int(*b as i64),
                Value::String(s) => {
                    let s = s.trim();
                    match s.parse::<i64>() {
                        Ok(i) => Value::Int(i),
                        Err(_) => match s.parse::<f64>() {
                            Ok(x) if x.is_finite() && x.abs() < 9.2e18 => Value::Int(x.trunc() as i64),
                            _ => Value::Null,
                        },
                    }
                }
                other => {
                    return Err(ExecutionError::TypeError(format!(
                        "toInteger() cannot convert {}",
                        other.type_name()
                    )))
                }
            })
        }
        "tofloat" => {
            arity(name, &args, 1, 1)?;
            Ok(match &args[0] {
                Value::Int(i) => Value::Float(*i as f64),
                Value::Float(x) => Value::Float(*x),
                Value::String(s) => s.trim().parse::<f64>().map_or(Value::Null, Value::Float),
                other => {
                    return Err(ExecutionError::TypeError(format!(
                        "toFloat() cannot convert {}",
                        other.type_name()
                    )))
                }
            })
        }
        "toboolean" => {
            arity(name, &args, 1, 1)?;
            Ok(match &args[0] {
                Value::Bool(b) => Value::Bool(*b),
                Value::Int(i) => Value::Bool(*i != 0),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    _ => Value::Null,
                },
                other => {
                    return Err(ExecutionError::TypeError(format!(
                        "toBoolean() cannot convert {}",
                        other.type_name()
                    )))
                }
            })
        }
        "id" => {
            arity(name, &args, 1, 1)?;
            let value = &args[0];
            value
                .node_id()
                .map(|id| id.as_u64())
                .or_else(|| value.edge_id().map(|id| id.as_u64()))
                .map(|id| Value::Int(id as i64))
                .ok_or_else(|| ExecutionError::TypeError(format!("id() expects a node or relationship, got {}", value.type_name())))
        }
        "labels" => {
            arity(name, &args, 1, 1)?;
            let labels = match &args[0] {
                Value::NodeRef(id) => with_node(*id, ctx, |n| n.labels.iter().map(|l| Value::from(l.as_str())).collect()),
                Value::Node(node) => Some(node.labels.iter().map(|l| Value::from(l.as_str())).collect()),
                other => {
                    return Err(ExecutionError::TypeError(format!("labels() expects a node, got {}", other.type_name())))
                }
            };
            Ok(labels.map_or(Value::Null, Value::List))
        }
        "type" => {
            arity(name, &args, 1, 1)?;
            let edge_type = match &args[0] {
                Value::EdgeRef(id) => with_edge(*id, ctx, |e| e.edge_type.as_str().to_string()),
                Value::Relationship(edge) => Some(edge.edge_type.as_str().to_string()),
                other => {
                    return Err(ExecutionError::TypeError(format!(
                        "type() expects a relationship, got {}",
                        other.type_name()
                    )))
                }
            };
            Ok(edge_type.map_or(Value::Null, Value::String))
        }
        "startnode" | "endnode" => {
            arity(name, &args, 1, 1)?;
            let edge_id = args[0].edge_id().ok_or_else(|| {
                ExecutionError::TypeError(format!("{}() expects a relationship, got {}", name, args[0].type_name()))
            })?;
            let end = with_edge(edge_id, ctx, |e| if f == "startnode" { e.source } else { e.target });
            Ok(end.map_or(Value::Null, Value::NodeRef))
        }
        "keys" | "properties" => {
            arity(name, &args, 1, 1)?;
            let props = entity_properties(&args[0], ctx).ok_or_else(|| {
                ExecutionError::TypeError(format!("{}() expects a node, relationship or map, got {}", name, args[0].type_name()))
            })?;
            Ok(if f == "keys" {
                Value::List(props.into_keys().map(Value::String).collect())
            } else {
                Value::Map(props)
            })
        }
        "head" | "last" | "tail" => {
            arity(name, &args, 1, 1)?;
            let items = args[0].as_list().ok_or_else(|| {
                ExecutionError::TypeError(format!("{}() expects a list, got {}", name, args[0].type_name()))
            })?;
            Ok(match f {
                "head" => items.first().cloned().unwrap_or(Value::Null),
                "last" => items.last().cloned().unwrap_or(Value::Null),
                _ => Value::List(items.iter().skip(1).cloned().collect()),
            })
        }
        "nodes" | "relationships" => {
            arity(name, &args, 1, 1)?;
            let path = path_of(name, &args[0])?;
            Ok(if f == "nodes" {
                Value::List(path.nodes.into_iter().map(Value::NodeRef).collect())
            } else {
                Value::List(path.edges.into_iter().map(Value::EdgeRef).collect())
            })
        }
        _ => Err(ExecutionError::UnknownFunction(name.to_string())),
    }
}

fn range(name: &str, args: &[Value], ctx: &ExecutionContext) -> ExecutionResult<Value> {
    arity(name, args, 2, 3)?;
    let start = expect_int(name, &args[0])?;
    let end = expect_int(name, &args[1])?;
    let step = match args.get(2) {
        Some(step) => expect_int(name, step)?,
        None => 1,
    };
    if step == 0 {
        return Err(ExecutionError::RuntimeError("range() step cannot be zero".to_string()));
    }

    let count = if (step > 0 && start > end) || (step < 0 && start < end) {
        0
    } else {
        (end as i128 - start as i128) / step as i128 + 1
    };
    let count = usize::try_from(count).map_err(|_| overflow("range"))?;
    ctx.check_collection(count, "range()")?;

    let mut items = Vec::with_capacity(count);
    let mut current = start;
    for _ in 0..count {
        items.push(Value::Int(current));
        match current.checked_add(step) {
            Some(next) => current = next,
            None => break,
        }
    }
    Ok(Value::List(items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryLimits;
    use crate::graph::GraphStore;
    use crate::query::executor::Params;
    use crate::query::parser::parse_standalone_expression;

    fn eval_str(text: &str) -> ExecutionResult<Value> {
        let store = GraphStore::new();
        let params = Params::new();
        let limits = QueryLimits::default();
        let mut ctx = ExecutionContext::read(&store, &params, &limits);
        let expr = parse_standalone_expression(text).unwrap();
        evaluate(&expr, &Record::new(), &mut ctx)
    }

    #[test]
    fn test_integer_arithmetic() {
        assert_eq!(eval_str("10 / 3").unwrap(), Value::Int(3));
        assert_eq!(eval_str("-7 / 2").unwrap(), Value::Int(-3));
        assert_eq!(eval_str("10 % 3").unwrap(), Value::Int(1));
        assert_eq!(eval_str("-7 % 3").unwrap(), Value::Int(-1));
        assert_eq!(eval_str("10 / 4.0").unwrap(), Value::Float(2.5));
        assert_eq!(eval_str("2 ^ 3").unwrap(), Value::Float(8.0));
        assert!(matches!(eval_str("1 / 0"), Err(ExecutionError::DivisionByZero)));
        assert!(matches!(eval_str("9223372036854775807 + 1"), Err(ExecutionError::Overflow(_))));
        assert_eq!(eval_str("1.0 / 0").unwrap(), Value::Float(f64::INFINITY));
    }

    #[test]
    fn test_three_valued_logic() {
        assert_eq!(eval_str("null AND false").unwrap(), Value::Bool(false));
        assert_eq!(eval_str("null AND true").unwrap(), Value::Null);
        assert_eq!(eval_str("null OR true").unwrap(), Value::Bool(true));
        assert_eq!(eval_str("NOT null").unwrap(), Value::Null);
        assert_eq!(eval_str("true XOR false").unwrap(), Value::Bool(true));
        assert_eq!(eval_str("null = null").unwrap(), Value::Null);
        assert_eq!(eval_str("1 = 1.0").unwrap(), Value::Bool(true));
        assert_eq!(eval_str("'a' = 1").unwrap(), Value::Bool(false));
        assert_eq!(eval_str("'a' < 1").unwrap(), Value::Null);
    }

    #[test]
    fn test_in_with_nulls() {
        assert_eq!(eval_str("2 IN [1, 2]").unwrap(), Value::Bool(true));
        assert_eq!(eval_str("3 IN [1, null]").unwrap(), Value::Null);
        assert_eq!(eval_str("3 IN [1, 2]").unwrap(), Value::Bool(false));
        assert_eq!(eval_str("null IN []").unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(eval_str("toUpper('abc')").unwrap(), Value::from("ABC"));
        assert_eq!(eval_str("trim('  x ')").unwrap(), Value::from("x"));
        assert_eq!(eval_str("substring('hello', 1, 3)").unwrap(), Value::from("ell"));
        assert_eq!(eval_str("left('hello', 2) + right('hello', 2)").unwrap(), Value::from("helo"));
        assert_eq!(eval_str("replace('aXbX', 'X', '-')").unwrap(), Value::from("a-b-"));
        assert_eq!(eval_str("split('a,b', ',')").unwrap(), Value::from(vec!["a", "b"]));
        assert_eq!(eval_str("toString(2.0)").unwrap(), Value::from("2.0"));
        assert_eq!(eval_str("'n=' + 5").unwrap(), Value::from("n=5"));
        assert_eq!(eval_str("toUpper(null)").unwrap(), Value::Null);
        assert_eq!(eval_str("'abc' =~ 'a.c'").unwrap(), Value::Bool(true));
        assert_eq!(eval_str("'abcd' =~ 'a.c'").unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_numeric_functions() {
        assert_eq!(eval_str("abs(-3)").unwrap(), Value::Int(3));
        assert_eq!(eval_str("sign(-2.5)").unwrap(), Value::Int(-1));
        assert_eq!(eval_str("toInteger('42')").unwrap(), Value::Int(42));
        assert_eq!(eval_str("toInteger(3.9)").unwrap(), Value::Int(3));
        assert_eq!(eval_str("toInteger('x')").unwrap(), Value::Null);
        assert_eq!(eval_str("toFloat('1.5')").unwrap(), Value::Float(1.5));
        assert_eq!(eval_str("round(2.5)").unwrap(), Value::Float(3.0));
        assert_eq!(eval_str("toBoolean('TRUE')").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_lists() {
        assert_eq!(eval_str("range(1, 5, 2)").unwrap(), Value::from(vec![1, 3, 5]));
        assert_eq!(eval_str("range(3, 1)").unwrap(), Value::List(vec![]));
        assert_eq!(eval_str("[1, 2, 3][-1]").unwrap(), Value::Int(3));
        assert_eq!(eval_str("[1, 2, 3][5]").unwrap(), Value::Null);
        assert_eq!(eval_str("[1, 2, 3, 4][1..3]").unwrap(), Value::from(vec![2, 3]));
        assert_eq!(eval_str("[x IN range(1, 4) WHERE x % 2 = 0 | x * 10]").unwrap(), Value::from(vec![20, 40]));
        assert_eq!(eval_str("head([])").unwrap(), Value::Null);
        assert_eq!(eval_str("tail([1, 2])").unwrap(), Value::from(vec![2]));
        assert_eq!(eval_str("size([1, 2]) + size('abc')").unwrap(), Value::Int(5));
        assert_eq!(eval_str("coalesce(null, 2)").unwrap(), Value::Int(2));
        assert_eq!(eval_str("[1] + 2").unwrap(), Value::from(vec![1, 2]));
    }

    #[test]
    fn test_case_expressions() {
        assert_eq!(eval_str("CASE 2 WHEN 1 THEN 'a' WHEN 2 THEN 'b' ELSE 'c' END").unwrap(), Value::from("b"));
        assert_eq!(eval_str("CASE WHEN 1 > 2 THEN 'a' END").unwrap(), Value::Null);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(eval_str("nosuch(1)"), Err(ExecutionError::UnknownFunction(_))));
        assert!(matches!(eval_str("x + 1"), Err(ExecutionError::VariableNotFound(_))));
        assert!(matches!(eval_str("1 + true"), Err(ExecutionError::TypeError(_))));
        assert!(matches!(eval_str("range(1, 2, 0)"), Err(ExecutionError::RuntimeError(_))));
    }
}
