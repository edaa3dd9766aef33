//! Cypher query parser using Pest
//!
//! The grammar lives in `cypher.pest`; binary operator precedence is handled
//! by a Pratt parser so the grammar can stay flat.

use crate::graph::{EdgeType, Label, PropertyValue};
use crate::query::ast::*;
use pest::iterators::Pair;
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Parser)]
#[grammar = "query/cypher.pest"]
struct CypherParser;

static PRATT_PARSER: LazyLock<PrattParser<Rule>> = LazyLock::new(|| {
    PrattParser::new()
        .op(Op::infix(Rule::or_op, Assoc::Left))
        .op(Op::infix(Rule::xor_op, Assoc::Left))
        .op(Op::infix(Rule::and_op, Assoc::Left))
        .op(Op::prefix(Rule::not_op))
        .op(Op::infix(Rule::comparison_op, Assoc::Left)
            | Op::infix(Rule::in_op, Assoc::Left)
            | Op::infix(Rule::string_op, Assoc::Left)
            | Op::postfix(Rule::is_null)
            | Op::postfix(Rule::is_not_null))
        .op(Op::infix(Rule::add_sub_op, Assoc::Left))
        .op(Op::infix(Rule::mul_div_mod_op, Assoc::Left))
        .op(Op::infix(Rule::pow_op, Assoc::Left))
        .op(Op::prefix(Rule::neg_op))
        .op(Op::postfix(Rule::property_lookup)
            | Op::postfix(Rule::index_op)
            | Op::postfix(Rule::slice_op)
            | Op::postfix(Rule::label_predicate))
});

/// Parser errors
#[derive(Error, Debug)]
pub enum ParseError {
    /// Pest parsing error
    #[error("Parse error: {0}")]
    PestError(#[from] Box<pest::error::Error<Rule>>),

    /// Well-formed text that does not describe a valid query
    #[error("Semantic error: {0}")]
    SemanticError(String),

    /// Recognised syntax this engine does not implement
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Parse a Cypher query string into an AST
pub fn parse_query(input: &str) -> ParseResult<Query> {
    let pairs = CypherParser::parse(Rule::query, input).map_err(Box::new)?;

    let mut explain = false;
    let mut statements = Vec::new();
    let mut union_flags = Vec::new();

    for pair in pairs.filter(|p| p.as_rule() == Rule::query) {
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::kw_explain => explain = true,
                Rule::union_clause => {
                    let all = inner.into_inner().any(|p| p.as_rule() == Rule::kw_all);
                    union_flags.push(all);
                }
                Rule::statement => statements.push(parse_statement(inner)?),
                _ => {}
            }
        }
    }

    let mut statements = statements.into_iter();
    let statement = statements
        .next()
        .ok_or_else(|| ParseError::SemanticError("Empty query".to_string()))?;
    let unions = union_flags
        .into_iter()
        .zip(statements)
        .map(|(all, statement)| UnionPart { all, statement })
        .collect();

    Ok(Query { statement, unions, explain })
}

/// Parse a single expression such as `n.age + 1`
pub fn parse_standalone_expression(input: &str) -> ParseResult<Expression> {
    let pairs = CypherParser::parse(Rule::standalone_expression, input).map_err(Box::new)?;
    pairs
        .flat_map(|p| p.into_inner())
        .find(|p| p.as_rule() == Rule::expression)
        .map(parse_expression)
        .ok_or_else(|| ParseError::SemanticError("Empty expression".to_string()))?
}

fn parse_statement(pair: Pair<Rule>) -> ParseResult<Statement> {
    let mut clauses = Vec::new();
    for inner in pair.into_inner() {
        if let Some(clause) = parse_clause(inner)? {
            clauses.push(clause);
        }
    }
    validate_clause_order(&clauses)?;
    Ok(Statement { clauses })
}

fn parse_clause(pair: Pair<Rule>) -> ParseResult<Option<Clause>> {
    let clause = match pair.as_rule() {
        Rule::match_clause => Clause::Match(parse_match_clause(pair)?),
        Rule::unwind_clause => Clause::Unwind(parse_unwind_clause(pair)?),
        Rule::create_clause => Clause::Create(CreateClause { pattern: first_pattern(pair)? }),
        Rule::merge_clause => Clause::Merge(parse_merge_clause(pair)?),
        Rule::set_clause => Clause::Set(SetClause { items: parse_set_items(pair)? }),
        Rule::remove_clause => Clause::Remove(parse_remove_clause(pair)?),
        Rule::delete_clause => Clause::Delete(parse_delete_clause(pair)?),
        Rule::with_clause => Clause::With(parse_with_clause(pair)?),
        Rule::return_clause => Clause::Return(ReturnClause { projection: first_projection(pair)? }),
        Rule::foreach_clause => Clause::Foreach(parse_foreach_clause(pair)?),
        Rule::call_clause => Clause::Call(parse_call_clause(pair)?),
        _ => return Ok(None),
    };
    Ok(Some(clause))
}

/// RETURN must close the statement; a statement without RETURN must write
fn validate_clause_order(clauses: &[Clause]) -> ParseResult<()> {
    if let Some(pos) = clauses.iter().position(|c| matches!(c, Clause::Return(_))) {
        if pos + 1 != clauses.len() {
            return Err(ParseError::SemanticError("RETURN can only be used at the end of the query".to_string()));
        }
    } else if let [Clause::Call(_)] = clauses {
        // A lone CALL returns its yielded fields
    } else if let Some(last) = clauses.last() {
        if matches!(last, Clause::Match(_) | Clause::With(_) | Clause::Unwind(_) | Clause::Call(_)) {
            return Err(ParseError::SemanticError(
                "Query cannot conclude with MATCH, WITH or UNWIND (must be RETURN or an update clause)".to_string(),
            ));
        }
    }
    Ok(())
}

fn parse_match_clause(pair: Pair<Rule>) -> ParseResult<MatchClause> {
    let mut optional = false;
    let mut pattern = None;
    let mut where_clause = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::kw_optional => optional = true,
            Rule::pattern => pattern = Some(parse_pattern(inner)?),
            Rule::where_clause => where_clause = Some(parse_where_clause(inner)?),
            _ => {}
        }
    }

    Ok(MatchClause {
        pattern: pattern.ok_or_else(|| ParseError::SemanticError("MATCH missing pattern".to_string()))?,
        optional,
        where_clause,
    })
}

fn parse_where_clause(pair: Pair<Rule>) -> ParseResult<Expression> {
    pair.into_inner()
        .find(|p| p.as_rule() == Rule::expression)
        .map(parse_expression)
        .unwrap_or_else(|| Err(ParseError::SemanticError("WHERE missing expression".to_string())))
}

fn parse_unwind_clause(pair: Pair<Rule>) -> ParseResult<UnwindClause> {
    let mut expression = None;
    let mut variable = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::expression => expression = Some(parse_expression(inner)?),
            Rule::variable => variable = Some(name_of(&inner)),
            _ => {}
        }
    }

    Ok(UnwindClause {
        expression: expression.ok_or_else(|| ParseError::SemanticError("UNWIND missing expression".to_string()))?,
        variable: variable.ok_or_else(|| ParseError::SemanticError("UNWIND missing variable".to_string()))?,
    })
}

fn parse_call_clause(pair: Pair<Rule>) -> ParseResult<CallClause> {
    let mut procedure = String::new();
    let mut args = Vec::new();
    let mut yields = Vec::new();

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::procedure_name => procedure = inner.as_str().to_string(),
            Rule::procedure_args => {
                args = inner.into_inner().map(parse_expression).collect::<ParseResult<_>>()?;
            }
            Rule::yield_item => {
                let mut names = inner.into_inner().filter(|p| p.as_rule() == Rule::variable);
                let field = names
                    .next()
                    .map(|p| name_of(&p))
                    .ok_or_else(|| ParseError::SemanticError("YIELD missing field".to_string()))?;
                let alias = names.next().map(|p| name_of(&p));
                yields.push(YieldItem { field, alias });
            }
            _ => {}
        }
    }

    let mut seen = std::collections::HashSet::new();
    if let Some(item) = yields.iter().find(|item| !seen.insert(item.name().to_string())) {
        return Err(ParseError::SemanticError(format!("Variable `{}` yielded more than once", item.name())));
    }
    Ok(CallClause { procedure, args, yields })
}

fn first_pattern(pair: Pair<Rule>) -> ParseResult<Pattern> {
    pair.into_inner()
        .find(|p| p.as_rule() == Rule::pattern)
        .map(parse_pattern)
        .unwrap_or_else(|| Err(ParseError::SemanticError("Missing pattern".to_string())))
}

fn parse_merge_clause(pair: Pair<Rule>) -> ParseResult<MergeClause> {
    let mut part = None;
    let mut on_create = Vec::new();
    let mut on_match = Vec::new();

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::pattern_part => part = Some(parse_pattern_part(inner)?),
            Rule::merge_action => {
                let mut is_create = false;
                let mut items = Vec::new();
                for action in inner.into_inner() {
                    match action.as_rule() {
                        Rule::on_create => is_create = true,
                        Rule::set_clause => items = parse_set_items(action)?,
                        _ => {}
                    }
                }
                if is_create {
                    on_create.extend(items);
                } else {
                    on_match.extend(items);
                }
            }
            _ => {}
        }
    }

    let part = part.ok_or_else(|| ParseError::SemanticError("MERGE missing pattern".to_string()))?;
    if part.kind != PathKind::Plain {
        return Err(ParseError::SemanticError("MERGE does not accept shortest path patterns".to_string()));
    }
    if part.path.segments.iter().any(|s| s.edge.length.is_some()) {
        return Err(ParseError::SemanticError("MERGE does not accept variable-length relationships".to_string()));
    }

    Ok(MergeClause { part, on_create, on_match })
}

fn parse_set_items(pair: Pair<Rule>) -> ParseResult<Vec<SetItem>> {
    let mut items = Vec::new();

    for inner in pair.into_inner() {
        let rule = inner.as_rule();
        let mut variable = String::new();
        let mut key = None;
        let mut value = None;
        let mut labels = Vec::new();

        for part in inner.into_inner() {
            match part.as_rule() {
                Rule::variable => variable = name_of(&part),
                Rule::property_lookup => key = Some(lookup_key(part)?),
                Rule::expression => value = Some(parse_expression(part)?),
                Rule::node_labels => labels = parse_labels(part),
                _ => {}
            }
        }

        let missing = || ParseError::SemanticError("SET item missing value".to_string());
        let item = match rule {
            Rule::set_property => SetItem::Property {
                variable,
                key: key.ok_or_else(|| ParseError::SemanticError("SET item missing key".to_string()))?,
                value: value.ok_or_else(missing)?,
            },
            Rule::set_merge_map => SetItem::MergeProperties { variable, value: value.ok_or_else(missing)? },
            Rule::set_replace_map => SetItem::ReplaceProperties { variable, value: value.ok_or_else(missing)? },
            Rule::set_labels => SetItem::Labels { variable, labels },
            _ => continue,
        };
        items.push(item);
    }

    Ok(items)
}

fn parse_remove_clause(pair: Pair<Rule>) -> ParseResult<RemoveClause> {
    let mut items = Vec::new();

    for inner in pair.into_inner() {
        let rule = inner.as_rule();
        let mut variable = String::new();
        let mut key = None;
        let mut labels = Vec::new();

        for part in inner.into_inner() {
            match part.as_rule() {
                Rule::variable => variable = name_of(&part),
                Rule::property_lookup => key = Some(lookup_key(part)?),
                Rule::node_labels => labels = parse_labels(part),
                _ => {}
            }
        }

        match (rule, key) {
            (Rule::remove_property, Some(key)) => items.push(RemoveItem::Property { variable, key }),
            (Rule::remove_labels, _) => items.push(RemoveItem::Labels { variable, labels }),
            _ => {}
        }
    }

    Ok(RemoveClause { items })
}

fn parse_delete_clause(pair: Pair<Rule>) -> ParseResult<DeleteClause> {
    let mut detach = false;
    let mut expressions = Vec::new();

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::kw_detach => detach = true,
            Rule::expression => expressions.push(parse_expression(inner)?),
            _ => {}
        }
    }

    Ok(DeleteClause { expressions, detach })
}

fn parse_with_clause(pair: Pair<Rule>) -> ParseResult<WithClause> {
    let mut projection = None;
    let mut where_clause = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::projection_body => projection = Some(parse_projection(inner)?),
            Rule::where_clause => where_clause = Some(parse_where_clause(inner)?),
            _ => {}
        }
    }

    Ok(WithClause {
        projection: projection.ok_or_else(|| ParseError::SemanticError("WITH missing items".to_string()))?,
        where_clause,
    })
}

fn first_projection(pair: Pair<Rule>) -> ParseResult<Projection> {
    pair.into_inner()
        .find(|p| p.as_rule() == Rule::projection_body)
        .map(parse_projection)
        .unwrap_or_else(|| Err(ParseError::SemanticError("RETURN missing items".to_string())))
}

fn parse_projection(pair: Pair<Rule>) -> ParseResult<Projection> {
    let mut projection = Projection {
        distinct: false,
        star: false,
        items: Vec::new(),
        order_by: Vec::new(),
        skip: None,
        limit: None,
    };

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::kw_distinct => projection.distinct = true,
            Rule::projection_items => {
                for item in inner.into_inner() {
                    match item.as_rule() {
                        Rule::star => projection.star = true,
                        Rule::projection_item => projection.items.push(parse_projection_item(item)?),
                        _ => {}
                    }
                }
            }
            Rule::order_by => {
                for sort in inner.into_inner().filter(|p| p.as_rule() == Rule::sort_item) {
                    projection.order_by.push(parse_sort_item(sort)?);
                }
            }
            Rule::skip => projection.skip = Some(first_expression(inner)?),
            Rule::limit => projection.limit = Some(first_expression(inner)?),
            _ => {}
        }
    }

    Ok(projection)
}

fn parse_projection_item(pair: Pair<Rule>) -> ParseResult<ProjectionItem> {
    let mut expression = None;
    let mut text = String::new();
    let mut alias = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::expression => {
                text = inner.as_str().trim().to_string();
                expression = Some(parse_expression(inner)?);
            }
            Rule::symbolic_name => alias = Some(name_of(&inner)),
            _ => {}
        }
    }

    Ok(ProjectionItem {
        expression: expression.ok_or_else(|| ParseError::SemanticError("Missing projection expression".to_string()))?,
        alias,
        text,
    })
}

fn parse_sort_item(pair: Pair<Rule>) -> ParseResult<SortItem> {
    let mut expression = None;
    let mut ascending = true;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::expression => expression = Some(parse_expression(inner)?),
            Rule::kw_desc => ascending = false,
            _ => {}
        }
    }

    Ok(SortItem {
        expression: expression.ok_or_else(|| ParseError::SemanticError("Missing expression in ORDER BY".to_string()))?,
        ascending,
    })
}

fn first_expression(pair: Pair<Rule>) -> ParseResult<Expression> {
    pair.into_inner()
        .find(|p| p.as_rule() == Rule::expression)
        .map(parse_expression)
        .unwrap_or_else(|| Err(ParseError::SemanticError("Missing expression".to_string())))
}

fn parse_foreach_clause(pair: Pair<Rule>) -> ParseResult<ForeachClause> {
    let mut variable = None;
    let mut list = None;
    let mut clauses = Vec::new();

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::variable => variable = Some(name_of(&inner)),
            Rule::expression => list = Some(parse_expression(inner)?),
            Rule::foreach_body => {
                for body in inner.into_inner() {
                    if let Some(clause) = parse_clause(body)? {
                        clauses.push(clause);
                    }
                }
            }
            _ => {}
        }
    }

    Ok(ForeachClause {
        variable: variable.ok_or_else(|| ParseError::SemanticError("FOREACH missing variable".to_string()))?,
        list: list.ok_or_else(|| ParseError::SemanticError("FOREACH missing list".to_string()))?,
        clauses,
    })
}

// ---- patterns ----

fn parse_pattern(pair: Pair<Rule>) -> ParseResult<Pattern> {
    let parts = pair
        .into_inner()
        .filter(|p| p.as_rule() == Rule::pattern_part)
        .map(parse_pattern_part)
        .collect::<ParseResult<Vec<_>>>()?;
    Ok(Pattern { parts })
}

fn parse_pattern_part(pair: Pair<Rule>) -> ParseResult<PatternPart> {
    let mut variable = None;
    let mut kind = PathKind::Plain;
    let mut path = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::variable => variable = Some(name_of(&inner)),
            Rule::path => path = Some(parse_path(inner)?),
            Rule::shortest_path | Rule::all_shortest_paths => {
                kind = if inner.as_rule() == Rule::shortest_path {
                    PathKind::Shortest
                } else {
                    PathKind::AllShortest
                };
                if let Some(p) = inner.into_inner().find(|p| p.as_rule() == Rule::path) {
                    path = Some(parse_path(p)?);
                }
            }
            _ => {}
        }
    }

    let path = path.ok_or_else(|| ParseError::SemanticError("Pattern missing path".to_string()))?;
    if kind != PathKind::Plain && path.segments.len() != 1 {
        return Err(ParseError::SemanticError(
            "shortestPath requires a pattern with exactly one relationship".to_string(),
        ));
    }
    Ok(PatternPart { variable, kind, path })
}

fn parse_path(pair: Pair<Rule>) -> ParseResult<PathPattern> {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::node_pattern => nodes.push(parse_node(inner)?),
            Rule::relationship_pattern => edges.push(parse_edge(inner)?),
            _ => {}
        }
    }

    if nodes.is_empty() {
        return Err(ParseError::SemanticError("Path must have at least one node".to_string()));
    }

    let start = nodes.remove(0);
    let segments = edges
        .into_iter()
        .zip(nodes)
        .map(|(edge, node)| PathSegment { edge, node })
        .collect();

    Ok(PathPattern { start, segments })
}

fn parse_node(pair: Pair<Rule>) -> ParseResult<NodePattern> {
    let mut variable = None;
    let mut labels = Vec::new();
    let mut properties = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::variable => variable = Some(name_of(&inner)),
            Rule::node_labels => labels = parse_labels(inner),
            Rule::pattern_properties => properties = Some(parse_pattern_properties(inner)?),
            _ => {}
        }
    }

    Ok(NodePattern { variable, labels, properties })
}

fn parse_edge(pair: Pair<Rule>) -> ParseResult<EdgePattern> {
    let mut left = false;
    let mut right = false;
    let mut variable = None;
    let mut types = Vec::new();
    let mut length = None;
    let mut properties = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::left_arrow => left = true,
            Rule::right_arrow => right = true,
            Rule::relationship_detail => {
                for detail in inner.into_inner() {
                    match detail.as_rule() {
                        Rule::variable => variable = Some(name_of(&detail)),
                        Rule::relationship_types => {
                            types = detail
                                .into_inner()
                                .filter(|p| p.as_rule() == Rule::symbolic_name)
                                .map(|p| EdgeType::new(name_of(&p)))
                                .collect();
                        }
                        Rule::var_length => length = Some(parse_var_length(detail)?),
                        Rule::pattern_properties => properties = Some(parse_pattern_properties(detail)?),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    let direction = match (left, right) {
        (true, false) => Direction::Incoming,
        (false, true) => Direction::Outgoing,
        _ => Direction::Both,
    };

    Ok(EdgePattern { variable, types, direction, length, properties })
}

fn parse_var_length(pair: Pair<Rule>) -> ParseResult<LengthRange> {
    // Just * means 1..unbounded
    let mut range = LengthRange { min: 1, max: None };

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::length_exact => {
                let hops = parse_hops(&inner)?;
                range = LengthRange { min: hops, max: Some(hops) };
            }
            Rule::length_range => {
                for bound in inner.into_inner() {
                    match bound.as_rule() {
                        Rule::length_min => range.min = parse_hops(&bound)?,
                        Rule::length_max => range.max = Some(parse_hops(&bound)?),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    if range.max.is_some_and(|max| max < range.min) {
        return Err(ParseError::SemanticError(format!(
            "Invalid relationship length: upper bound below lower bound in '{}'",
            format_range(range)
        )));
    }
    Ok(range)
}

fn format_range(range: LengthRange) -> String {
    match range.max {
        Some(max) => format!("*{}..{}", range.min, max),
        None => format!("*{}..", range.min),
    }
}

fn parse_hops(pair: &Pair<Rule>) -> ParseResult<u32> {
    pair.as_str()
        .parse()
        .map_err(|_| ParseError::SemanticError(format!("Invalid hop count: {}", pair.as_str())))
}

fn parse_pattern_properties(pair: Pair<Rule>) -> ParseResult<Expression> {
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::map_literal => return parse_map_literal(inner),
            Rule::parameter => return Ok(Expression::Parameter(parameter_name(&inner))),
            _ => {}
        }
    }
    Err(ParseError::SemanticError("Invalid property map".to_string()))
}

fn parse_labels(pair: Pair<Rule>) -> Vec<Label> {
    pair.into_inner()
        .filter(|p| p.as_rule() == Rule::symbolic_name)
        .map(|p| Label::new(name_of(&p)))
        .collect()
}

// ---- expressions ----

/// Magnitude of `i64::MIN`. Only valid directly under a unary minus.
const I64_MIN_MAGNITUDE: &str = "9223372036854775808";

/// Pratt parser operand
enum Operand {
    Expr(Expression),
    /// `9223372036854775808`, waiting for the minus that makes it representable
    MinIntMagnitude,
}

impl Operand {
    fn into_expr(self) -> ParseResult<Expression> {
        match self {
            Operand::Expr(expr) => Ok(expr),
            Operand::MinIntMagnitude => Err(ParseError::SemanticError(format!(
                "Integer literal out of range: {}",
                I64_MIN_MAGNITUDE
            ))),
        }
    }
}

fn parse_operand(pair: Pair<Rule>) -> ParseResult<Operand> {
    let min_magnitude = pair
        .clone()
        .into_inner()
        .next()
        .is_some_and(|p| p.as_rule() == Rule::integer && p.as_str() == I64_MIN_MAGNITUDE);
    if min_magnitude {
        return Ok(Operand::MinIntMagnitude);
    }
    parse_primary(pair).map(Operand::Expr)
}

fn parse_expression(pair: Pair<Rule>) -> ParseResult<Expression> {
    PRATT_PARSER
        .map_primary(parse_operand)
        .map_prefix(|op, rhs| {
            let op = match op.as_rule() {
                Rule::not_op => UnaryOp::Not,
                Rule::neg_op => UnaryOp::Minus,
                rule => return Err(ParseError::SemanticError(format!("Unexpected prefix operator: {:?}", rule))),
            };
            let rhs = match (op, rhs?) {
                (UnaryOp::Minus, Operand::MinIntMagnitude) => {
                    return Ok(Operand::Expr(Expression::Literal(PropertyValue::Integer(i64::MIN))));
                }
                (_, rhs) => rhs.into_expr()?,
            };
            Ok(Operand::Expr(negate_literal(op, rhs)))
        })
        .map_postfix(|lhs, op| {
            let expr = Box::new(lhs?.into_expr()?);
            Ok(Operand::Expr(match op.as_rule() {
                Rule::is_null => Expression::Unary { op: UnaryOp::IsNull, expr },
                Rule::is_not_null => Expression::Unary { op: UnaryOp::IsNotNull, expr },
                Rule::property_lookup => Expression::Property { expr, key: lookup_key(op)? },
                Rule::index_op => Expression::Index { expr, index: Box::new(first_expression(op)?) },
                Rule::slice_op => {
                    let mut from = None;
                    let mut to = None;
                    for bound in op.into_inner() {
                        let target = if bound.as_rule() == Rule::slice_from { &mut from } else { &mut to };
                        *target = Some(Box::new(first_expression(bound)?));
                    }
                    Expression::Slice { expr, from, to }
                }
                Rule::label_predicate => {
                    let labels = op
                        .into_inner()
                        .find(|p| p.as_rule() == Rule::node_labels)
                        .map(parse_labels)
                        .unwrap_or_default();
                    Expression::HasLabels { expr, labels }
                }
                rule => return Err(ParseError::SemanticError(format!("Unexpected postfix operator: {:?}", rule))),
            }))
        })
        .map_infix(|left, op, right| {
            let left = left?.into_expr()?;
            let right = right?.into_expr()?;

            let op = match op.as_rule() {
                Rule::or_op => BinaryOp::Or,
                Rule::xor_op => BinaryOp::Xor,
                Rule::and_op => BinaryOp::And,
                Rule::in_op => BinaryOp::In,
                Rule::pow_op => BinaryOp::Pow,
                Rule::comparison_op | Rule::add_sub_op | Rule::mul_div_mod_op | Rule::string_op => {
                    parse_op_str(op.as_str())?
                }
                _ => return Err(ParseError::SemanticError(format!("Unexpected operator: {:?}", op.as_rule()))),
            };

            Ok(Operand::Expr(Expression::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            }))
        })
        .parse(pair.into_inner())
        .and_then(Operand::into_expr)
}

/// Fold `-<number literal>` into the literal
fn negate_literal(op: UnaryOp, expr: Expression) -> Expression {
    match (op, expr) {
        (UnaryOp::Minus, Expression::Literal(PropertyValue::Integer(i))) if i != i64::MIN => {
            Expression::Literal(PropertyValue::Integer(-i))
        }
        (UnaryOp::Minus, Expression::Literal(PropertyValue::Float(f))) => Expression::Literal(PropertyValue::Float(-f)),
        (op, expr) => Expression::Unary { op, expr: Box::new(expr) },
    }
}

fn parse_op_str(op_str: &str) -> ParseResult<BinaryOp> {
    let upper = op_str.to_ascii_uppercase();
    Ok(match upper.as_str() {
        "=" => BinaryOp::Eq,
        "!=" | "<>" => BinaryOp::Ne,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::Le,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::Ge,
        "=~" => BinaryOp::RegexMatch,
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "%" => BinaryOp::Mod,
        "CONTAINS" => BinaryOp::Contains,
        s if s.starts_with("STARTS") => BinaryOp::StartsWith,
        s if s.starts_with("ENDS") => BinaryOp::EndsWith,
        _ => return Err(ParseError::SemanticError(format!("Unknown operator: {}", op_str))),
    })
}

fn parse_primary(pair: Pair<Rule>) -> ParseResult<Expression> {
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| ParseError::SemanticError("Invalid primary expression".to_string()))?;

    match inner.as_rule() {
        Rule::expression => parse_expression(inner),
        Rule::count_star => Ok(Expression::CountStar),
        Rule::case_expression => parse_case_expression(inner),
        Rule::exists_subquery => parse_exists_subquery(inner),
        Rule::list_comprehension => parse_list_comprehension(inner),
        Rule::list_literal => {
            let items = inner
                .into_inner()
                .filter(|p| p.as_rule() == Rule::expression)
                .map(parse_expression)
                .collect::<ParseResult<Vec<_>>>()?;
            Ok(Expression::List(items))
        }
        Rule::map_literal => parse_map_literal(inner),
        Rule::function_call => parse_function_call(inner),
        Rule::float => inner
            .as_str()
            .parse::<f64>()
            .map(|f| Expression::Literal(PropertyValue::Float(f)))
            .map_err(|_| ParseError::SemanticError(format!("Invalid float literal: {}", inner.as_str()))),
        Rule::integer => parse_integer(inner.as_str()).map(|i| Expression::Literal(PropertyValue::Integer(i))),
        Rule::string => Ok(Expression::Literal(PropertyValue::String(parse_string_literal(inner)))),
        Rule::boolean => Ok(Expression::Literal(PropertyValue::Boolean(
            inner.as_str().eq_ignore_ascii_case("true"),
        ))),
        Rule::null => Ok(Expression::Literal(PropertyValue::Null)),
        Rule::parameter => Ok(Expression::Parameter(parameter_name(&inner))),
        Rule::variable => Ok(Expression::Variable(name_of(&inner))),
        rule => Err(ParseError::SemanticError(format!("Unexpected expression: {:?}", rule))),
    }
}

fn parse_integer(text: &str) -> ParseResult<i64> {
    text.parse::<i64>()
        .map_err(|_| ParseError::SemanticError(format!("Integer literal out of range: {}", text)))
}

fn parse_map_literal(pair: Pair<Rule>) -> ParseResult<Expression> {
    let mut entries = Vec::new();

    for entry in pair.into_inner().filter(|p| p.as_rule() == Rule::map_entry) {
        let mut key = None;
        let mut value = None;
        for part in entry.into_inner() {
            match part.as_rule() {
                Rule::symbolic_name => key = Some(name_of(&part)),
                Rule::expression => value = Some(parse_expression(part)?),
                _ => {}
            }
        }
        if let (Some(key), Some(value)) = (key, value) {
            entries.push((key, value));
        }
    }

    Ok(Expression::Map(entries))
}

fn parse_case_expression(pair: Pair<Rule>) -> ParseResult<Expression> {
    let mut operand = None;
    let mut when_clauses = Vec::new();
    let mut else_result = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            // Simple CASE form: CASE x WHEN 1 THEN ...
            Rule::expression => operand = Some(Box::new(parse_expression(inner)?)),
            Rule::case_when => {
                let mut exprs = inner
                    .into_inner()
                    .filter(|p| p.as_rule() == Rule::expression)
                    .map(parse_expression)
                    .collect::<ParseResult<Vec<_>>>()?
                    .into_iter();
                if let (Some(when), Some(then)) = (exprs.next(), exprs.next()) {
                    when_clauses.push((when, then));
                }
            }
            Rule::case_else => else_result = Some(Box::new(first_expression(inner)?)),
            _ => {}
        }
    }

    Ok(Expression::Case { operand, when_clauses, else_result })
}

fn parse_exists_subquery(pair: Pair<Rule>) -> ParseResult<Expression> {
    let mut pattern = None;
    let mut where_clause = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::pattern => pattern = Some(parse_pattern(inner)?),
            Rule::where_clause => where_clause = Some(Box::new(parse_where_clause(inner)?)),
            _ => {}
        }
    }

    Ok(Expression::Exists {
        pattern: pattern.ok_or_else(|| ParseError::SemanticError("EXISTS missing pattern".to_string()))?,
        where_clause,
    })
}

fn parse_list_comprehension(pair: Pair<Rule>) -> ParseResult<Expression> {
    let mut variable = None;
    let mut list = None;
    let mut filter = None;
    let mut map = None;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::variable => variable = Some(name_of(&inner)),
            Rule::expression => list = Some(Box::new(parse_expression(inner)?)),
            Rule::comprehension_filter => filter = Some(Box::new(first_expression(inner)?)),
            Rule::comprehension_map => map = Some(Box::new(first_expression(inner)?)),
            _ => {}
        }
    }

    Ok(Expression::ListComprehension {
        variable: variable.ok_or_else(|| ParseError::SemanticError("List comprehension missing variable".to_string()))?,
        list: list.ok_or_else(|| ParseError::SemanticError("List comprehension missing list expression".to_string()))?,
        filter,
        map,
    })
}

fn parse_function_call(pair: Pair<Rule>) -> ParseResult<Expression> {
    let mut name = String::new();
    let mut args = Vec::new();
    let mut distinct = false;

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::function_name => name = inner.as_str().to_string(),
            Rule::kw_distinct => distinct = true,
            Rule::expression => args.push(parse_expression(inner)?),
            _ => {}
        }
    }

    Ok(Expression::Function { name, args, distinct })
}

// ---- lexical helpers ----

/// Identifier text without surrounding backticks
fn name_of(pair: &Pair<Rule>) -> String {
    let text = pair.as_str();
    text.strip_prefix('`')
        .and_then(|t| t.strip_suffix('`'))
        .unwrap_or(text)
        .to_string()
}

fn lookup_key(pair: Pair<Rule>) -> ParseResult<String> {
    pair.into_inner()
        .find(|p| p.as_rule() == Rule::symbolic_name)
        .map(|p| name_of(&p))
        .ok_or_else(|| ParseError::SemanticError("Missing property key".to_string()))
}

fn parameter_name(pair: &Pair<Rule>) -> String {
    let name = pair.as_str().trim_start_matches('$');
    name.strip_prefix('`')
        .and_then(|t| t.strip_suffix('`'))
        .unwrap_or(name)
        .to_string()
}

fn parse_string_literal(pair: Pair<Rule>) -> String {
    let raw = pair.into_inner().next().map(|p| p.as_str()).unwrap_or("");
    unescape(raw)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(ch) => out.push(ch),
                    None => {
                        out.push_str("\\u");
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_return(query: &Query) -> &Projection {
        match query.statement.clauses.last() {
            Some(Clause::Return(r)) => &r.projection,
            other => panic!("expected RETURN, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_simple_match() {
        let query = parse_query("MATCH (n:Person) RETURN n").unwrap();
        assert_eq!(query.statement.clauses.len(), 2);
        assert!(query.is_read_only());
        match &query.statement.clauses[0] {
            Clause::Match(m) => {
                assert!(!m.optional);
                let start = &m.pattern.parts[0].path.start;
                assert_eq!(start.variable.as_deref(), Some("n"));
                assert_eq!(start.labels, vec![Label::new("Person")]);
            }
            other => panic!("unexpected clause {:?}", other),
        }
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let query = parse_query("match (n:Person) where n.age > 3 return n.name as name order by name desc").unwrap();
        let projection = single_return(&query);
        assert_eq!(projection.items[0].name(), "name");
        assert!(!projection.order_by[0].ascending);
    }

    #[test]
    fn test_column_text_is_source_text() {
        let query = parse_query("MATCH (n) RETURN n.age, count(n)").unwrap();
        let projection = single_return(&query);
        assert_eq!(projection.items[0].name(), "n.age");
        assert_eq!(projection.items[1].name(), "count(n)");
    }

    #[test]
    fn test_operator_precedence() {
        let query = parse_query("RETURN 1 + 2 * 3 AS x").unwrap();
        let expr = &single_return(&query).items[0].expression;
        match expr {
            Expression::Binary { op: BinaryOp::Add, right, .. } => {
                assert!(matches!(**right, Expression::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }

        let query = parse_query("MATCH (n) WHERE NOT n.a = 1 AND n.b IS NULL RETURN n").unwrap();
        let Clause::Match(m) = &query.statement.clauses[0] else { panic!() };
        match m.where_clause.as_ref().unwrap() {
            Expression::Binary { op: BinaryOp::And, left, right } => {
                assert!(matches!(**left, Expression::Unary { op: UnaryOp::Not, .. }));
                assert!(matches!(**right, Expression::Unary { op: UnaryOp::IsNull, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_string_predicates() {
        let query = parse_query(
            "MATCH (n) WHERE n.name STARTS WITH 'A' OR n.name ENDS WITH \"z\" OR n.name CONTAINS 'x' RETURN n",
        )
        .unwrap();
        let Clause::Match(m) = &query.statement.clauses[0] else { panic!() };
        assert!(matches!(m.where_clause, Some(Expression::Binary { op: BinaryOp::Or, .. })));
    }

    #[test]
    fn test_relationship_directions_and_lengths() {
        let query = parse_query("MATCH (a)-[r:KNOWS|LIKES*1..3]->(b)<-[:X]-(c)-[*]-(d)-[*2]-(e) RETURN a").unwrap();
        let Clause::Match(m) = &query.statement.clauses[0] else { panic!() };
        let segments = &m.pattern.parts[0].path.segments;
        assert_eq!(segments[0].edge.direction, Direction::Outgoing);
        assert_eq!(segments[0].edge.types.len(), 2);
        assert_eq!(segments[0].edge.length, Some(LengthRange { min: 1, max: Some(3) }));
        assert_eq!(segments[1].edge.direction, Direction::Incoming);
        assert_eq!(segments[2].edge.direction, Direction::Both);
        assert_eq!(segments[2].edge.length, Some(LengthRange { min: 1, max: None }));
        assert_eq!(segments[3].edge.length, Some(LengthRange { min: 2, max: Some(2) }));
    }

    #[test]
    fn test_open_ended_lengths() {
        let query = parse_query("MATCH (a)-[*..4]->(b), (c)-[*2..]->(d) RETURN a").unwrap();
        let Clause::Match(m) = &query.statement.clauses[0] else { panic!() };
        assert_eq!(m.pattern.parts[0].path.segments[0].edge.length, Some(LengthRange { min: 1, max: Some(4) }));
        assert_eq!(m.pattern.parts[1].path.segments[0].edge.length, Some(LengthRange { min: 2, max: None }));
    }

    #[test]
    fn test_write_clauses() {
        let query = parse_query(
            "MATCH (n:Person {name: $name}) SET n.age = 31, n += {x: 1}, n:Admin REMOVE n.email, n:Guest DETACH DELETE n",
        )
        .unwrap();
        assert!(!query.is_read_only());
        assert_eq!(query.statement.clauses.len(), 4);
        match &query.statement.clauses[1] {
            Clause::Set(set) => {
                assert_eq!(set.items.len(), 3);
                assert!(matches!(set.items[1], SetItem::MergeProperties { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&query.statement.clauses[3], Clause::Delete(d) if d.detach));
    }

    #[test]
    fn test_merge_actions() {
        let query = parse_query(
            "MERGE (n:Person {name: 'A'}) ON CREATE SET n.created = true ON MATCH SET n.seen = n.seen + 1",
        )
        .unwrap();
        let Clause::Merge(merge) = &query.statement.clauses[0] else { panic!() };
        assert_eq!(merge.on_create.len(), 1);
        assert_eq!(merge.on_match.len(), 1);
    }

    #[test]
    fn test_union_and_explain() {
        let query = parse_query("EXPLAIN RETURN 1 AS x UNION ALL RETURN 2 AS x UNION RETURN 3 AS x").unwrap();
        assert!(query.explain);
        assert_eq!(query.unions.len(), 2);
        assert!(query.unions[0].all);
        assert!(!query.unions[1].all);
    }

    #[test]
    fn test_foreach_and_case() {
        let query = parse_query(
            "UNWIND [1, 2] AS i FOREACH (x IN range(1, i) | CREATE (:N {v: CASE x WHEN 1 THEN 'one' ELSE 'many' END}))",
        )
        .unwrap();
        let Clause::Foreach(foreach) = &query.statement.clauses[1] else { panic!() };
        assert_eq!(foreach.variable, "x");
        assert_eq!(foreach.clauses.len(), 1);
    }

    #[test]
    fn test_exists_and_comprehension() {
        let query = parse_query(
            "MATCH (n) WHERE EXISTS { MATCH (n)-[:KNOWS]->(m) WHERE m.age > 1 } RETURN [x IN n.tags WHERE x <> 'a' | toUpper(x)] AS t",
        )
        .unwrap();
        let Clause::Match(m) = &query.statement.clauses[0] else { panic!() };
        assert!(matches!(m.where_clause, Some(Expression::Exists { .. })));
        let projection = single_return(&query);
        assert!(matches!(
            projection.items[0].expression,
            Expression::ListComprehension { filter: Some(_), map: Some(_), .. }
        ));
    }

    #[test]
    fn test_string_escapes_and_backticks() {
        let query = parse_query(r#"RETURN 'it\'s' AS `my col`, "a\nb" AS b"#).unwrap();
        let projection = single_return(&query);
        assert_eq!(projection.items[0].name(), "my col");
        assert_eq!(projection.items[0].expression, Expression::Literal(PropertyValue::String("it's".into())));
        assert_eq!(projection.items[1].expression, Expression::Literal(PropertyValue::String("a\nb".into())));
    }

    #[test]
    fn test_labels_may_use_keywords() {
        let query = parse_query("MATCH (o:Order)-[:ON]->(x) RETURN o.end").unwrap();
        assert_eq!(query.statement.clauses.len(), 2);
    }

    #[test]
    fn test_min_integer_literal() {
        let query = parse_query("RETURN -9223372036854775808 AS m").unwrap();
        assert_eq!(
            single_return(&query).items[0].expression,
            Expression::Literal(PropertyValue::Integer(i64::MIN))
        );

        for text in [
            "RETURN 9223372036854775808 AS a",
            "CREATE (:N {v: 9223372036854775808})",
            "RETURN 1 + 9223372036854775808 AS a",
            "RETURN [9223372036854775808] AS a",
            "RETURN 99999999999999999999 AS a",
        ] {
            let err = parse_query(text).unwrap_err();
            assert!(matches!(err, ParseError::SemanticError(_)), "{:?} should be rejected", text);
            assert!(err.to_string().contains("out of range"));
        }
    }

    #[test]
    fn test_double_negation_is_not_folded_past_min() {
        let query = parse_query("RETURN --9223372036854775808 AS m").unwrap();
        assert!(matches!(
            single_return(&query).items[0].expression,
            Expression::Unary { op: UnaryOp::Minus, .. }
        ));
    }

    #[test]
    fn test_power_is_left_associative() {
        let query = parse_query("RETURN 2 ^ 3 ^ 2 AS p").unwrap();
        let Expression::Binary { left, op: BinaryOp::Pow, right } = &single_return(&query).items[0].expression else {
            panic!("expected a power expression");
        };
        assert!(matches!(**left, Expression::Binary { op: BinaryOp::Pow, .. }));
        assert_eq!(**right, Expression::Literal(PropertyValue::Integer(2)));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(parse_query("MATCH (n RETURN n"), Err(ParseError::PestError(_))));
        assert!(parse_query("RETURN").is_err());
        assert!(parse_query("").is_err());
        assert!(matches!(parse_query("MATCH (n)"), Err(ParseError::SemanticError(_))));
        assert!(matches!(parse_query("RETURN 1 AS a MATCH (n) RETURN n"), Err(ParseError::SemanticError(_))));
    }

    #[test]
    fn test_call_clause() {
        let query = parse_query("CALL math.add(1, $x) YIELD result AS sum RETURN sum").unwrap();
        let Clause::Call(call) = &query.statement.clauses[0] else { panic!() };
        assert_eq!(call.procedure, "math.add");
        assert_eq!(call.args.len(), 2);
        assert_eq!(call.yields, vec![YieldItem { field: "result".to_string(), alias: Some("sum".to_string()) }]);

        let query = parse_query("CALL db.info").unwrap();
        let Clause::Call(call) = &query.statement.clauses[0] else { panic!() };
        assert!(call.args.is_empty() && call.yields.is_empty());
    }

    #[test]
    fn test_call_clause_placement() {
        assert!(parse_query("MATCH (n) CALL db.info() YIELD version RETURN n, version").is_ok());
        assert!(matches!(parse_query("MATCH (n) CALL db.info()"), Err(ParseError::SemanticError(_))));
        assert!(matches!(
            parse_query("CALL db.info() YIELD version, nodes AS version RETURN version"),
            Err(ParseError::SemanticError(_))
        ));
    }

    #[test]
    fn test_shortest_path_forms() {
        let query = parse_query("MATCH p = shortestPath((a)-[:R*..5]-(b)) RETURN p").unwrap();
        let Clause::Match(m) = &query.statement.clauses[0] else { panic!() };
        assert_eq!(m.pattern.parts[0].kind, PathKind::Shortest);
        assert_eq!(m.pattern.parts[0].variable.as_deref(), Some("p"));

        let query = parse_query("MATCH p = allShortestPaths((a)-[*]-(b)) RETURN p").unwrap();
        let Clause::Match(m) = &query.statement.clauses[0] else { panic!() };
        assert_eq!(m.pattern.parts[0].kind, PathKind::AllShortest);
    }
}
