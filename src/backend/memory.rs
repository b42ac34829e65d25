//! In-process backend.
//!
//! Tables live in a shared [`MemoryStore`] so several [`Table`] handles
//! (and the fake native clients used in tests) see the same data. Items
//! keep insertion order, which is also the order queries return them in.
//!
//! [`Table`]: crate::table::Table
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{require_key_attrs, Backend, Page};
use crate::config::TableConfig;
use crate::error::{Error, Result};
use crate::sql::{
    bind_parameters, parse_select, BinaryOperator, BindStyle, Expression, Literal, SelectItem,
    SelectQuery,
};
use crate::value::{Conditions, Item, Key, Parameters, Value};

/// Shared table storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<BTreeMap<String, Vec<Item>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table: &str, key: &Key) -> Option<Item> {
        self.tables
            .read()
            .get(table)
            .and_then(|items| items.iter().find(|item| key.matches(item)).cloned())
    }

    /// Insert `item`, replacing the one with the same key.
    pub fn put(&self, table: &str, key: &Key, item: Item) {
        let mut tables = self.tables.write();
        let items = tables.entry(table.to_string()).or_default();
        match items.iter_mut().find(|existing| key.matches(existing)) {
            Some(existing) => *existing = item,
            None => items.push(item),
        }
    }

    /// Remove the item with `key`; returns whether one existed.
    pub fn delete(&self, table: &str, key: &Key) -> bool {
        let mut tables = self.tables.write();
        let Some(items) = tables.get_mut(table) else {
            return false;
        };
        let before = items.len();
        items.retain(|item| !key.matches(item));
        items.len() != before
    }

    /// Snapshot of every item of `table`.
    pub fn items(&self, table: &str) -> Vec<Item> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }
}

pub struct MemoryBackend {
    table: String,
    key_attrs: Vec<String>,
    store: MemoryStore,
}

impl MemoryBackend {
    pub fn new(table: &str, config: &TableConfig, store: MemoryStore) -> Result<Self> {
        Ok(Self {
            table: table.to_string(),
            key_attrs: require_key_attrs(table, config)?,
            store,
        })
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn get_item(&self, key: &Key) -> Result<Option<Item>> {
        Ok(self.store.get(&self.table, key))
    }

    fn put_item(&self, item: &Item) -> Result<()> {
        let key = Key::from_item(item, &self.key_attrs)?;
        self.store.put(&self.table, &key, item.clone());
        Ok(())
    }

    fn delete_item(&self, key: &Key) -> Result<()> {
        self.store.delete(&self.table, key);
        Ok(())
    }

    fn query(
        &self,
        key: &Conditions,
        filters: &Conditions,
        limit: Option<usize>,
        resume: Option<serde_json::Value>,
    ) -> Result<Page> {
        let matches = |item: &Item| {
            key.iter()
                .chain(filters.iter())
                .all(|(name, value)| item.get(name).is_some_and(|v| v.loosely_equals(value)))
        };
        let items: Vec<Item> = self
            .store
            .items(&self.table)
            .into_iter()
            .filter(|item| matches(item))
            .collect();
        paginate(items, limit, resume)
    }

    fn query_sql(
        &self,
        statement: &str,
        parameters: &Parameters,
        limit: Option<usize>,
        resume: Option<serde_json::Value>,
    ) -> Result<Page> {
        let bound = bind_parameters(
            statement,
            parameters,
            |_, value| Ok(value.clone()),
            BindStyle::Positional("?"),
        )?;
        let items = select(self.store.items(&self.table), &bound.statement, &bound.params)?;
        paginate(items, limit, resume)
    }
}

/// Evaluate a SELECT with positional `?` parameters over `items`.
pub(crate) fn select(items: Vec<Item>, statement: &str, params: &[Value]) -> Result<Vec<Item>> {
    let query = parse_select(statement)?;
    let mut out = Vec::new();
    for item in items {
        let keep = match &query.filter {
            Some(filter) => truthy(&evaluate(filter, &item, params)?),
            None => true,
        };
        if keep {
            out.push(project(&query, item));
        }
    }
    if let Some(cap) = query.limit {
        out.truncate(usize::try_from(cap).unwrap_or(usize::MAX));
    }
    Ok(out)
}

pub(crate) fn paginate(
    items: Vec<Item>,
    limit: Option<usize>,
    resume: Option<serde_json::Value>,
) -> Result<Page> {
    let offset = match resume {
        None => 0,
        Some(state) => state
            .get("offset")
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| Error::validation("invalid cursor"))?,
    };
    let total = items.len();
    let page: Vec<Item> = items
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect();
    let end = offset.saturating_add(page.len());
    let resume = (end < total).then(|| serde_json::json!({ "offset": end }));
    Ok(Page {
        items: page,
        resume,
    })
}

fn project(query: &SelectQuery, item: Item) -> Item {
    if query
        .projections
        .iter()
        .any(|p| matches!(p, SelectItem::Wildcard))
    {
        return item;
    }
    let mut out = Item::new();
    for projection in &query.projections {
        if let SelectItem::Field { path, alias } = projection {
            if let Some(value) = lookup(&item, path) {
                let name = alias
                    .clone()
                    .or_else(|| path.last().cloned())
                    .unwrap_or_default();
                out.insert(name, value.clone());
            }
        }
    }
    out
}

fn lookup<'a>(item: &'a Item, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut value = item.get(first)?;
    for segment in rest {
        match value {
            Value::Map(map) => value = map.get(segment)?,
            _ => return None,
        }
    }
    Some(value)
}

fn truthy(value: &Value) -> bool {
    matches!(value, Value::Bool(true))
}

/// Evaluate with SQL three-valued logic; `Null` stands for unknown.
fn evaluate(expr: &Expression, item: &Item, params: &[Value]) -> Result<Value> {
    match expr {
        Expression::Field(path) => Ok(lookup(item, path).cloned().unwrap_or(Value::Null)),
        Expression::Literal(literal) => Ok(match literal {
            Literal::Null => Value::Null,
            Literal::Boolean(b) => Value::Bool(*b),
            Literal::Integer(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::String(s) => Value::String(s.clone()),
        }),
        Expression::Parameter(index) => params
            .get(*index)
            .cloned()
            .ok_or_else(|| Error::validation(format!("parameter {index} is not bound"))),
        Expression::Nested(inner) => evaluate(inner, item, params),
        Expression::Not(inner) => Ok(match evaluate(inner, item, params)? {
            Value::Bool(b) => Value::Bool(!b),
            _ => Value::Null,
        }),
        Expression::IsNull { expr, negated } => {
            let is_null = evaluate(expr, item, params)?.is_null();
            Ok(Value::Bool(is_null != *negated))
        }
        Expression::BinaryOp { left, op, right } => {
            let left = evaluate(left, item, params)?;
            let right = evaluate(right, item, params)?;
            Ok(apply(*op, &left, &right))
        }
    }
}

fn apply(op: BinaryOperator, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOperator::And => match (left, right) {
            (Value::Bool(false), _) | (_, Value::Bool(false)) => Value::Bool(false),
            (Value::Bool(true), Value::Bool(true)) => Value::Bool(true),
            _ => Value::Null,
        },
        BinaryOperator::Or => match (left, right) {
            (Value::Bool(true), _) | (_, Value::Bool(true)) => Value::Bool(true),
            (Value::Bool(false), Value::Bool(false)) => Value::Bool(false),
            _ => Value::Null,
        },
        _ if left.is_null() || right.is_null() => Value::Null,
        BinaryOperator::Eq => Value::Bool(left.loosely_equals(right)),
        BinaryOperator::NotEq => Value::Bool(!left.loosely_equals(right)),
        cmp => match left.compare(right) {
            Some(ordering) => Value::Bool(match cmp {
                BinaryOperator::Lt => ordering == Ordering::Less,
                BinaryOperator::LtEq => ordering != Ordering::Greater,
                BinaryOperator::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }),
            None => Value::Null,
        },
    }
}
