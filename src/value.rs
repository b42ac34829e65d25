//! Backend-independent item model.
//!
//! Every backend converts its native representation to and from [`Value`]
//! at its own boundary; nothing above the adapters sees DynamoDB attribute
//! values or Cosmos JSON documents.
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Error, Result};

pub type Item = BTreeMap<String, Value>;

/// Field → value equality conditions for structured queries.
pub type Conditions = BTreeMap<String, Value>;

/// Placeholder name (with its `@` prefix) → bound value.
pub type Parameters = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
    Map(Item),
    Set(Vec<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Timestamp(_) => "timestamp",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// JSON form used by document backends and cursor fingerprints.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Binary(b) => serde_json::Value::String(STANDARD.encode(b)),
            Value::Timestamp(ts) => {
                serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::List(items) | Value::Set(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(item_to_json(map)),
        }
    }

    pub fn from_json(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(item_from_json(map)),
        }
    }

    /// Ordering used by comparison filters. Values of unrelated types do
    /// not compare.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }

    /// Equality with numeric widening (`5 == 5.0`).
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) => {
                self.compare(other) == Some(Ordering::Equal)
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

impl From<Item> for Value {
    fn from(map: Item) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

pub fn item_to_json(item: &Item) -> serde_json::Map<String, serde_json::Value> {
    item.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()
}

pub fn item_from_json(map: serde_json::Map<String, serde_json::Value>) -> Item {
    map.into_iter()
        .map(|(k, v)| (k, Value::from_json(v)))
        .collect()
}

/// Primary key of an item: hash field first, optional range field second.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    fields: Vec<(String, Value)>,
}

impl Key {
    pub fn hash(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            fields: vec![(name.into(), value.into())],
        }
    }

    pub fn range(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.truncate(1);
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Build a key from arbitrary pairs; exactly one or two are accepted.
    pub fn from_pairs<I, K>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let fields: Vec<(String, Value)> =
            pairs.into_iter().map(|(k, v)| (k.into(), v)).collect();
        if fields.is_empty() || fields.len() > 2 {
            return Err(Error::validation(format!(
                "key length must be 1 or 2, got {}",
                fields.len()
            )));
        }
        Ok(Self { fields })
    }

    /// Extract the key of `item` according to the table's key schema.
    pub fn from_item(item: &Item, key_attrs: &[String]) -> Result<Self> {
        let missing: Vec<&str> = key_attrs
            .iter()
            .filter(|attr| !item.contains_key(attr.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(Error::validation(format!(
                "missing key attributes: {}",
                missing.join(", ")
            )));
        }
        Self::from_pairs(
            key_attrs
                .iter()
                .map(|attr| (attr.clone(), item[attr.as_str()].clone())),
        )
    }

    /// Reorder fields to follow `key_attrs`. Fields absent from the schema
    /// are rejected.
    pub fn ordered_by(self, key_attrs: &[String]) -> Result<Self> {
        if key_attrs.is_empty() {
            return Ok(self);
        }
        let mut unknown: Vec<&str> = self
            .fields
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(|name| !key_attrs.iter().any(|attr| attr == name))
            .collect();
        if !unknown.is_empty() {
            unknown.sort_unstable();
            unknown.dedup();
            return Err(Error::validation(format!(
                "unknown key attributes: {}",
                unknown.join(", ")
            )));
        }
        let mut fields = self.fields;
        fields.sort_by_key(|(name, _)| key_attrs.iter().position(|attr| attr == name));
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn hash_field(&self) -> (&str, &Value) {
        let (name, value) = &self.fields[0];
        (name, value)
    }

    pub fn range_field(&self) -> Option<(&str, &Value)> {
        self.fields.get(1).map(|(name, value)| (name.as_str(), value))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn matches(&self, item: &Item) -> bool {
        self.fields
            .iter()
            .all(|(name, value)| item.get(name).is_some_and(|v| v.loosely_equals(value)))
    }

    pub fn to_item(&self) -> Item {
        self.fields.iter().cloned().collect()
    }
}

/// Post-read conversion of values that JSON cannot carry natively.
pub trait ValueDeserializer: Send + Sync {
    fn deserialize(&self, item: Item) -> Item;
}

/// Default: timestamps become RFC3339 strings, binary becomes base64 and
/// sets become lists.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonNative;

impl JsonNative {
    fn convert(value: Value) -> Value {
        match value {
            Value::Timestamp(ts) => {
                Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::Binary(bytes) => Value::String(STANDARD.encode(bytes)),
            Value::Set(items) | Value::List(items) => {
                Value::List(items.into_iter().map(Self::convert).collect())
            }
            Value::Map(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::convert(v)))
                    .collect(),
            ),
            other => other,
        }
    }
}

impl ValueDeserializer for JsonNative {
    fn deserialize(&self, item: Item) -> Item {
        item.into_iter()
            .map(|(k, v)| (k, Self::convert(v)))
            .collect()
    }
}

/// Identity: keeps typed values as read from the backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreserveTypes;

impl ValueDeserializer for PreserveTypes {
    fn deserialize(&self, item: Item) -> Item {
        item
    }
}

/// Build an [`Item`] from `(name, value)` pairs.
#[macro_export]
macro_rules! item {
    ($($name:expr => $value:expr),* $(,)?) => {{
        let mut item = $crate::value::Item::new();
        $( item.insert(String::from($name), $crate::value::Value::from($value)); )*
        item
    }};
}
