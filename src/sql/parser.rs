/// SQL → read-only SELECT AST.
///
/// Uses `sqlparser` as the parsing frontend and keeps only the subset the
/// query layer evaluates. Positional `?` placeholders become
/// [`Expression::Parameter`] indices in textual order.
use sqlparser::ast as sp;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser as SqlParser;

use super::types::*;
use crate::error::{Error, Result};

/// Parse a single SELECT statement.
pub fn parse_select(sql: &str) -> Result<SelectQuery> {
    let dialect = GenericDialect {};
    let mut statements = SqlParser::parse_sql(&dialect, sql)
        .map_err(|e| Error::validation(format!("SQL parse error: {e}")))?;
    if statements.len() != 1 {
        return Err(Error::validation(format!(
            "expected 1 statement, found {}",
            statements.len()
        )));
    }
    match statements.remove(0) {
        sp::Statement::Query(q) => Converter::default().convert_query(*q),
        _ => Err(Error::validation("only SELECT is allowed")),
    }
}

fn unsupported(what: impl std::fmt::Display) -> Error {
    Error::validation(format!("unsupported in query: {what}"))
}

#[derive(Default)]
struct Converter {
    next_param: usize,
    qualifiers: Vec<String>,
}

impl Converter {
    fn convert_query(&mut self, query: sp::Query) -> Result<SelectQuery> {
        if query.with.is_some() {
            return Err(unsupported("WITH"));
        }
        if query.order_by.is_some() {
            return Err(unsupported("ORDER BY"));
        }
        let limit = query.limit.map(convert_limit).transpose()?;

        let select = match *query.body {
            sp::SetExpr::Select(select) => *select,
            other => return Err(unsupported(other)),
        };
        let mut query = self.convert_select(select)?;
        query.limit = limit;
        Ok(query)
    }

    fn convert_select(&mut self, select: sp::Select) -> Result<SelectQuery> {
        if select.distinct.is_some() {
            return Err(unsupported("DISTINCT"));
        }
        if select.having.is_some() {
            return Err(unsupported("HAVING"));
        }
        match &select.group_by {
            sp::GroupByExpr::Expressions(exprs, _) if exprs.is_empty() => {}
            other => return Err(unsupported(other)),
        }

        let mut from = select.from.into_iter();
        let (table, alias) = match (from.next(), from.next()) {
            (Some(twj), None) => convert_table(twj)?,
            (None, _) => return Err(unsupported("SELECT without FROM")),
            (Some(_), Some(_)) => return Err(unsupported("multiple tables")),
        };
        self.qualifiers = std::iter::once(table.clone()).chain(alias.clone()).collect();

        let projections = select
            .projection
            .into_iter()
            .map(|item| self.convert_select_item(item))
            .collect::<Result<Vec<_>>>()?;

        let filter = select
            .selection
            .map(|expr| self.convert_expr(expr))
            .transpose()?;

        Ok(SelectQuery {
            projections,
            table,
            alias,
            filter,
            limit: None,
        })
    }

    fn convert_select_item(&mut self, item: sp::SelectItem) -> Result<SelectItem> {
        match item {
            sp::SelectItem::Wildcard(_) => Ok(SelectItem::Wildcard),
            sp::SelectItem::QualifiedWildcard(name, _) => {
                let qualifier = name.to_string();
                if self.qualifiers.contains(&qualifier) {
                    Ok(SelectItem::Wildcard)
                } else {
                    Err(unsupported(format!("{qualifier}.*")))
                }
            }
            sp::SelectItem::UnnamedExpr(expr) => Ok(SelectItem::Field {
                path: self.field_path(expr)?,
                alias: None,
            }),
            sp::SelectItem::ExprWithAlias { expr, alias } => Ok(SelectItem::Field {
                path: self.field_path(expr)?,
                alias: Some(alias.value),
            }),
        }
    }

    fn field_path(&mut self, expr: sp::Expr) -> Result<Vec<String>> {
        match self.convert_expr(expr)? {
            Expression::Field(path) => Ok(path),
            other => Err(unsupported(format!("projection {other:?}"))),
        }
    }

    /// Strip a leading table name or alias from a field path.
    fn field(&self, mut names: Vec<String>) -> Expression {
        if names.len() > 1 && self.qualifiers.contains(&names[0]) {
            names.remove(0);
        }
        Expression::Field(names)
    }

    fn convert_expr(&mut self, expr: sp::Expr) -> Result<Expression> {
        match expr {
            sp::Expr::Identifier(ident) => Ok(self.field(vec![ident.value])),
            sp::Expr::CompoundIdentifier(parts) => {
                Ok(self.field(parts.into_iter().map(|p| p.value).collect()))
            }
            sp::Expr::Value(val) => self.convert_value(val),
            sp::Expr::BinaryOp { left, op, right } => {
                let left = self.convert_expr(*left)?;
                let op = convert_binary_op(op)?;
                let right = self.convert_expr(*right)?;
                Ok(Expression::BinaryOp {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                })
            }
            sp::Expr::UnaryOp { op, expr } => match op {
                sp::UnaryOperator::Not => Ok(Expression::Not(Box::new(self.convert_expr(*expr)?))),
                sp::UnaryOperator::Minus => match self.convert_expr(*expr)? {
                    Expression::Literal(Literal::Integer(i)) => {
                        Ok(Expression::Literal(Literal::Integer(-i)))
                    }
                    Expression::Literal(Literal::Float(f)) => {
                        Ok(Expression::Literal(Literal::Float(-f)))
                    }
                    other => Err(unsupported(format!("negation of {other:?}"))),
                },
                sp::UnaryOperator::Plus => self.convert_expr(*expr),
                other => Err(unsupported(other)),
            },
            sp::Expr::IsNull(expr) => Ok(Expression::IsNull {
                expr: Box::new(self.convert_expr(*expr)?),
                negated: false,
            }),
            sp::Expr::IsNotNull(expr) => Ok(Expression::IsNull {
                expr: Box::new(self.convert_expr(*expr)?),
                negated: true,
            }),
            sp::Expr::Nested(expr) => Ok(Expression::Nested(Box::new(self.convert_expr(*expr)?))),
            other => Err(unsupported(other)),
        }
    }

    fn convert_value(&mut self, val: sp::Value) -> Result<Expression> {
        match val {
            sp::Value::Null => Ok(Expression::Literal(Literal::Null)),
            sp::Value::Boolean(b) => Ok(Expression::Literal(Literal::Boolean(b))),
            sp::Value::Number(n, _) => {
                if let Ok(i) = n.parse::<i64>() {
                    Ok(Expression::Literal(Literal::Integer(i)))
                } else if let Ok(f) = n.parse::<f64>() {
                    Ok(Expression::Literal(Literal::Float(f)))
                } else {
                    Err(unsupported(format!("number {n}")))
                }
            }
            sp::Value::SingleQuotedString(s) | sp::Value::DoubleQuotedString(s) => {
                Ok(Expression::Literal(Literal::String(s)))
            }
            sp::Value::Placeholder(p) if p == "?" => {
                let index = self.next_param;
                self.next_param += 1;
                Ok(Expression::Parameter(index))
            }
            other => Err(unsupported(other)),
        }
    }
}

fn convert_table(twj: sp::TableWithJoins) -> Result<(String, Option<String>)> {
    if !twj.joins.is_empty() {
        return Err(unsupported("JOIN"));
    }
    match twj.relation {
        sp::TableFactor::Table { name, alias, .. } => {
            Ok((name.to_string(), alias.map(|a| a.name.value)))
        }
        other => Err(unsupported(other)),
    }
}

fn convert_limit(expr: sp::Expr) -> Result<u64> {
    match expr {
        sp::Expr::Value(sp::Value::Number(n, _)) => n
            .parse::<u64>()
            .map_err(|_| Error::validation(format!("invalid LIMIT {n}"))),
        other => Err(unsupported(format!("LIMIT {other}"))),
    }
}

fn convert_binary_op(op: sp::BinaryOperator) -> Result<BinaryOperator> {
    match op {
        sp::BinaryOperator::Eq => Ok(BinaryOperator::Eq),
        sp::BinaryOperator::NotEq => Ok(BinaryOperator::NotEq),
        sp::BinaryOperator::Lt => Ok(BinaryOperator::Lt),
        sp::BinaryOperator::LtEq => Ok(BinaryOperator::LtEq),
        sp::BinaryOperator::Gt => Ok(BinaryOperator::Gt),
        sp::BinaryOperator::GtEq => Ok(BinaryOperator::GtEq),
        sp::BinaryOperator::And => Ok(BinaryOperator::And),
        sp::BinaryOperator::Or => Ok(BinaryOperator::Or),
        other => Err(unsupported(other)),
    }
}
