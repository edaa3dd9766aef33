//! Abstract syntax tree for the Cypher subset
//!
//! A query is a chain of clauses. Each clause consumes the rows produced by
//! the clauses before it, so the tree keeps them in source order instead of
//! grouping them by kind.

use crate::graph::{EdgeType, Label, PropertyValue};

/// Parsed query: one statement, optionally chained with UNION
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub statement: Statement,
    /// Further statements joined with UNION (`all == true` for UNION ALL)
    pub unions: Vec<UnionPart>,
    /// EXPLAIN prefix
    pub explain: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnionPart {
    pub all: bool,
    pub statement: Statement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Match(MatchClause),
    Unwind(UnwindClause),
    Create(CreateClause),
    Merge(MergeClause),
    Set(SetClause),
    Remove(RemoveClause),
    Delete(DeleteClause),
    With(WithClause),
    Return(ReturnClause),
    Foreach(ForeachClause),
    Call(CallClause),
}

/// MATCH clause: MATCH (n:Person)-[:KNOWS]->(m) WHERE ...
#[derive(Debug, Clone, PartialEq)]
pub struct MatchClause {
    pub pattern: Pattern,
    pub optional: bool,
    pub where_clause: Option<Expression>,
}

/// UNWIND clause: UNWIND [1, 2, 3] AS x
#[derive(Debug, Clone, PartialEq)]
pub struct UnwindClause {
    pub expression: Expression,
    pub variable: String,
}

/// CALL clause: CALL math.add(1, 2) YIELD result AS sum
#[derive(Debug, Clone, PartialEq)]
pub struct CallClause {
    pub procedure: String,
    pub args: Vec<Expression>,
    /// Empty when the clause has no YIELD
    pub yields: Vec<YieldItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct YieldItem {
    pub field: String,
    pub alias: Option<String>,
}

impl YieldItem {
    /// Variable the field is bound to
    pub fn name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.field)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateClause {
    pub pattern: Pattern,
}

/// MERGE clause: MERGE (n:Person {name: 'Alice'}) ON CREATE SET ... ON MATCH SET ...
#[derive(Debug, Clone, PartialEq)]
pub struct MergeClause {
    pub part: PatternPart,
    pub on_create: Vec<SetItem>,
    pub on_match: Vec<SetItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetClause {
    pub items: Vec<SetItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetItem {
    /// n.key = expr
    Property { variable: String, key: String, value: Expression },
    /// n = {map}
    ReplaceProperties { variable: String, value: Expression },
    /// n += {map}
    MergeProperties { variable: String, value: Expression },
    /// n:Label:Other
    Labels { variable: String, labels: Vec<Label> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoveClause {
    pub items: Vec<RemoveItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoveItem {
    Property { variable: String, key: String },
    Labels { variable: String, labels: Vec<Label> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteClause {
    pub expressions: Vec<Expression>,
    pub detach: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithClause {
    pub projection: Projection,
    pub where_clause: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnClause {
    pub projection: Projection,
}

/// FOREACH (x IN list | clauses)
#[derive(Debug, Clone, PartialEq)]
pub struct ForeachClause {
    pub variable: String,
    pub list: Expression,
    pub clauses: Vec<Clause>,
}

/// Body shared by WITH and RETURN
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub distinct: bool,
    /// `*` projects every variable in scope
    pub star: bool,
    pub items: Vec<ProjectionItem>,
    pub order_by: Vec<SortItem>,
    pub skip: Option<Expression>,
    pub limit: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionItem {
    pub expression: Expression,
    pub alias: Option<String>,
    /// Source text of the expression, used as the column name without an alias
    pub text: String,
}

impl ProjectionItem {
    /// Output column name
    pub fn name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortItem {
    pub expression: Expression,
    pub ascending: bool,
}

/// Comma separated pattern parts
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub parts: Vec<PatternPart>,
}

/// One path of a pattern, optionally named: p = (a)-[*]->(b)
#[derive(Debug, Clone, PartialEq)]
pub struct PatternPart {
    pub variable: Option<String>,
    pub kind: PathKind,
    pub path: PathPattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Plain,
    Shortest,
    AllShortest,
}

/// Path pattern: (n:Person)-[:KNOWS*1..3]->(m:Person)
#[derive(Debug, Clone, PartialEq)]
pub struct PathPattern {
    pub start: NodePattern,
    pub segments: Vec<PathSegment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathSegment {
    pub edge: EdgePattern,
    pub node: NodePattern,
}

/// Node pattern: (n:Person:Employee {name: "Alice"})
#[derive(Debug, Clone, PartialEq)]
pub struct NodePattern {
    pub variable: Option<String>,
    pub labels: Vec<Label>,
    /// Map literal or parameter
    pub properties: Option<Expression>,
}

/// Edge pattern: -[r:KNOWS|FOLLOWS*1..5 {since: 2020}]->
#[derive(Debug, Clone, PartialEq)]
pub struct EdgePattern {
    pub variable: Option<String>,
    pub types: Vec<EdgeType>,
    pub direction: Direction,
    pub length: Option<LengthRange>,
    pub properties: Option<Expression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// (a)-[]->(b)
    Outgoing,
    /// (a)<-[]-(b)
    Incoming,
    /// (a)-[]-(b) or (a)<-[]->(b)
    Both,
}

/// Hop bounds of a variable-length relationship, both inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthRange {
    pub min: u32,
    pub max: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(PropertyValue),
    Parameter(String),
    Variable(String),
    Property {
        expr: Box<Expression>,
        key: String,
    },
    List(Vec<Expression>),
    Map(Vec<(String, Expression)>),
    Binary {
        left: Box<Expression>,
        op: BinaryOp,
        right: Box<Expression>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expression>,
    },
    /// n:Label predicate
    HasLabels {
        expr: Box<Expression>,
        labels: Vec<Label>,
    },
    Function {
        name: String,
        args: Vec<Expression>,
        distinct: bool,
    },
    CountStar,
    Case {
        operand: Option<Box<Expression>>,
        when_clauses: Vec<(Expression, Expression)>,
        else_result: Option<Box<Expression>>,
    },
    Index {
        expr: Box<Expression>,
        index: Box<Expression>,
    },
    Slice {
        expr: Box<Expression>,
        from: Option<Box<Expression>>,
        to: Option<Box<Expression>>,
    },
    /// EXISTS { MATCH pattern WHERE ... }
    Exists {
        pattern: Pattern,
        where_clause: Option<Box<Expression>>,
    },
    /// [x IN list WHERE pred | expr]
    ListComprehension {
        variable: String,
        list: Box<Expression>,
        filter: Option<Box<Expression>>,
        map: Option<Box<Expression>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    Xor,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    In,
    StartsWith,
    EndsWith,
    Contains,
    RegexMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Minus,
    IsNull,
    IsNotNull,
}

const AGGREGATE_FUNCTIONS: &[&str] = &["count", "sum", "avg", "min", "max", "collect"];

pub fn is_aggregate_function(name: &str) -> bool {
    AGGREGATE_FUNCTIONS.iter().any(|f| f.eq_ignore_ascii_case(name))
}

impl Expression {
    /// True when the expression contains an aggregate call outside of a
    /// nested subquery
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expression::CountStar => true,
            Expression::Function { name, args, .. } => {
                is_aggregate_function(name) || args.iter().any(|a| a.contains_aggregate())
            }
            Expression::Property { expr, .. } | Expression::Unary { expr, .. } | Expression::HasLabels { expr, .. } => {
                expr.contains_aggregate()
            }
            Expression::Binary { left, right, .. } => left.contains_aggregate() || right.contains_aggregate(),
            Expression::List(items) => items.iter().any(|e| e.contains_aggregate()),
            Expression::Map(entries) => entries.iter().any(|(_, e)| e.contains_aggregate()),
            Expression::Case { operand, when_clauses, else_result } => {
                operand.as_ref().is_some_and(|e| e.contains_aggregate())
                    || when_clauses.iter().any(|(w, t)| w.contains_aggregate() || t.contains_aggregate())
                    || else_result.as_ref().is_some_and(|e| e.contains_aggregate())
            }
            Expression::Index { expr, index } => expr.contains_aggregate() || index.contains_aggregate(),
            Expression::Slice { expr, from, to } => {
                expr.contains_aggregate()
                    || from.as_ref().is_some_and(|e| e.contains_aggregate())
                    || to.as_ref().is_some_and(|e| e.contains_aggregate())
            }
            Expression::ListComprehension { list, .. } => list.contains_aggregate(),
            Expression::Literal(_)
            | Expression::Parameter(_)
            | Expression::Variable(_)
            | Expression::Exists { .. } => false,
        }
    }
}

impl Clause {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Clause::Create(_)
                | Clause::Merge(_)
                | Clause::Set(_)
                | Clause::Remove(_)
                | Clause::Delete(_)
                | Clause::Foreach(_)
        )
    }
}

impl Statement {
    pub fn is_read_only(&self) -> bool {
        !self.clauses.iter().any(Clause::is_write)
    }
}

impl Query {
    /// Read-only queries may run against a committed snapshot; anything
    /// else needs a write transaction.
    pub fn is_read_only(&self) -> bool {
        self.statement.is_read_only() && self.unions.iter().all(|u| u.statement.is_read_only())
    }

    /// All statements in UNION order
    pub fn statements(&self) -> impl Iterator<Item = &Statement> {
        std::iter::once(&self.statement).chain(self.unions.iter().map(|u| &u.statement))
    }
}
