//! Read-only SELECT AST.
//!
//! Only what the single-table query subset needs: a projection, one source
//! table and a filter expression. Anything else is rejected by the parser.

/// A single-table SELECT.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub projections: Vec<SelectItem>,
    pub table: String,
    pub alias: Option<String>,
    pub filter: Option<Expression>,
    pub limit: Option<u64>,
}

/// A single item in the SELECT projection list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `*`
    Wildcard,
    /// A field, optionally aliased: `c.name AS n`.
    Field { path: Vec<String>, alias: Option<String> },
}

/// Expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Field reference; nested paths keep every segment (`c.obj.foo`).
    Field(Vec<String>),
    Literal(Literal),
    /// Bound positional parameter, zero-based in textual order.
    Parameter(usize),
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    Not(Box<Expression>),
    IsNull {
        expr: Box<Expression>,
        negated: bool,
    },
    Nested(Box<Expression>),
}

/// Literal values.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    // Comparison
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // Logical
    And,
    Or,
}
