//! DynamoDB adapter.
//!
//! [`DynamoClient`] mirrors the subset of the DynamoDB API the adapter
//! needs. Applications implement it over their SDK client and hand it in
//! through [`DatabaseClient::DynamoDb`](crate::config::DatabaseClient).
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use super::{require_key_attrs, Backend, Page};
use crate::config::TableConfig;
use crate::error::{normalize, normalize_lookup, Error, ErrorKind, NativeError, NotFoundPolicy, Result};
use crate::sql::{bind_parameters, BindStyle};
use crate::value::{Conditions, Item, Key, Parameters, Value};

/// Maximum requests per `BatchWriteItem` call.
pub const BATCH_SIZE: usize = 25;
const BATCH_ATTEMPTS: u32 = 5;
const DEFAULT_BACKOFF_MS: u64 = 50;

pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// DynamoDB attribute value, serialized as DynamoDB JSON (`{"S": "x"}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    S(String),
    /// Numbers travel as strings.
    N(String),
    B(#[serde(with = "b64")] Vec<u8>),
    BOOL(bool),
    NULL(bool),
    L(Vec<AttributeValue>),
    M(AttributeMap),
    SS(Vec<String>),
    NS(Vec<String>),
    BS(#[serde(with = "b64_list")] Vec<Vec<u8>>),
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

mod b64_list {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(list: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(list.len()))?;
        for bytes in list {
            seq.serialize_element(&STANDARD.encode(bytes))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(d)?
            .into_iter()
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Native DynamoDB failure: the service error code plus its message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamoError {
    pub code: String,
    pub message: String,
    pub status: Option<u16>,
}

impl DynamoError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: None,
        }
    }
}

impl fmt::Display for DynamoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for DynamoError {}

impl NativeError for DynamoError {
    fn kind(&self) -> ErrorKind {
        match self.code.as_str() {
            "ResourceNotFoundException" => ErrorKind::NotFound,
            "UnrecognizedClientException"
            | "MissingAuthenticationToken"
            | "InvalidSignatureException"
            | "ExpiredTokenException"
            | "AccessDeniedException" => ErrorKind::Configuration,
            "RequestTimeout"
            | "ThrottlingException"
            | "ProvisionedThroughputExceededException"
            | "InternalServerError"
            | "ServiceUnavailable" => ErrorKind::Plugin,
            _ if self.status.is_some_and(|s| s >= 500) => ErrorKind::Plugin,
            _ => ErrorKind::Validation,
        }
    }
}

/// Input of `Query` and `Scan`. `Scan` ignores the key condition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryInput {
    pub table_name: String,
    pub key_condition_expression: Option<String>,
    pub filter_expression: Option<String>,
    pub expression_attribute_names: BTreeMap<String, String>,
    pub expression_attribute_values: AttributeMap,
    pub limit: Option<usize>,
    pub exclusive_start_key: Option<AttributeMap>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    pub items: Vec<AttributeMap>,
    pub last_evaluated_key: Option<AttributeMap>,
}

/// PartiQL `ExecuteStatement` input.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementInput {
    pub statement: String,
    pub parameters: Vec<AttributeValue>,
    pub limit: Option<usize>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementOutput {
    pub items: Vec<AttributeMap>,
    pub next_token: Option<String>,
}

pub trait DynamoClient: Send + Sync {
    fn get_item(
        &self,
        table: &str,
        key: &AttributeMap,
    ) -> std::result::Result<Option<AttributeMap>, DynamoError>;

    fn put_item(&self, table: &str, item: AttributeMap) -> std::result::Result<(), DynamoError>;

    /// Write a batch of puts; returns the items left unprocessed.
    fn batch_write_item(
        &self,
        table: &str,
        items: Vec<AttributeMap>,
    ) -> std::result::Result<Vec<AttributeMap>, DynamoError>;

    fn delete_item(&self, table: &str, key: &AttributeMap) -> std::result::Result<(), DynamoError>;

    fn query(&self, input: &QueryInput) -> std::result::Result<QueryOutput, DynamoError>;

    fn scan(&self, input: &QueryInput) -> std::result::Result<QueryOutput, DynamoError>;

    fn execute_statement(
        &self,
        input: &StatementInput,
    ) -> std::result::Result<StatementOutput, DynamoError>;
}

pub fn to_attribute(value: &Value) -> Result<AttributeValue> {
    Ok(match value {
        Value::Null => AttributeValue::NULL(true),
        Value::Bool(b) => AttributeValue::BOOL(*b),
        Value::Int(i) => AttributeValue::N(i.to_string()),
        Value::Float(f) => AttributeValue::N(f.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Binary(b) => AttributeValue::B(b.clone()),
        Value::Timestamp(ts) => AttributeValue::S(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        Value::List(items) => {
            AttributeValue::L(items.iter().map(to_attribute).collect::<Result<_>>()?)
        }
        Value::Map(map) => AttributeValue::M(to_attributes(map)?),
        Value::Set(items) => to_set(items)?,
    })
}

fn to_set(items: &[Value]) -> Result<AttributeValue> {
    let Some(first) = items.first() else {
        return Err(Error::validation("empty sets cannot be stored"));
    };
    let mixed = || Error::validation("set elements must share one type");
    match first {
        Value::String(_) => items
            .iter()
            .map(|v| v.as_str().map(String::from).ok_or_else(mixed))
            .collect::<Result<_>>()
            .map(AttributeValue::SS),
        Value::Int(_) | Value::Float(_) => items
            .iter()
            .map(|v| match v {
                Value::Int(i) => Ok(i.to_string()),
                Value::Float(f) => Ok(f.to_string()),
                _ => Err(mixed()),
            })
            .collect::<Result<_>>()
            .map(AttributeValue::NS),
        Value::Binary(_) => items
            .iter()
            .map(|v| match v {
                Value::Binary(b) => Ok(b.clone()),
                _ => Err(mixed()),
            })
            .collect::<Result<_>>()
            .map(AttributeValue::BS),
        other => Err(Error::validation(format!(
            "sets of {} are not supported",
            other.type_name()
        ))),
    }
}

pub fn to_attributes(item: &Item) -> Result<AttributeMap> {
    item.iter()
        .map(|(name, value)| Ok((name.clone(), to_attribute(value)?)))
        .collect()
}

fn number(n: &str) -> Value {
    if let Ok(i) = n.parse::<i64>() {
        Value::Int(i)
    } else if let Ok(f) = n.parse::<f64>() {
        Value::Float(f)
    } else {
        Value::String(n.to_string())
    }
}

pub fn from_attribute(value: AttributeValue) -> Value {
    match value {
        AttributeValue::S(s) => Value::String(s),
        AttributeValue::N(n) => number(&n),
        AttributeValue::B(b) => Value::Binary(b),
        AttributeValue::BOOL(b) => Value::Bool(b),
        AttributeValue::NULL(_) => Value::Null,
        AttributeValue::L(items) => Value::List(items.into_iter().map(from_attribute).collect()),
        AttributeValue::M(map) => Value::Map(from_attributes(map)),
        AttributeValue::SS(items) => Value::Set(items.into_iter().map(Value::String).collect()),
        AttributeValue::NS(items) => Value::Set(items.iter().map(|n| number(n)).collect()),
        AttributeValue::BS(items) => Value::Set(items.into_iter().map(Value::Binary).collect()),
    }
}

pub fn from_attributes(map: AttributeMap) -> Item {
    map.into_iter()
        .map(|(name, value)| (name, from_attribute(value)))
        .collect()
}

fn key_attributes(key: &Key) -> Result<AttributeMap> {
    key.fields()
        .iter()
        .map(|(name, value)| Ok((name.clone(), to_attribute(value)?)))
        .collect()
}

/// `#p0 = :p0 AND #p1 = :p1 ...`, registering names and values.
fn equality_expression(
    prefix: &str,
    conditions: &Conditions,
    input: &mut QueryInput,
) -> Result<Option<String>> {
    let mut clauses = Vec::new();
    for (i, (name, value)) in conditions.iter().enumerate() {
        let alias = format!("{prefix}{i}");
        input
            .expression_attribute_names
            .insert(format!("#{alias}"), name.clone());
        input
            .expression_attribute_values
            .insert(format!(":{alias}"), to_attribute(value)?);
        clauses.push(format!("#{alias} = :{alias}"));
    }
    Ok((!clauses.is_empty()).then(|| clauses.join(" AND ")))
}

fn invalid_cursor() -> Error {
    Error::validation("invalid cursor")
}

pub struct DynamoBackend {
    table: String,
    key_attrs: Vec<String>,
    client: Arc<dyn DynamoClient>,
    backoff: Duration,
}

impl DynamoBackend {
    pub fn new(table: &str, config: &TableConfig, client: Arc<dyn DynamoClient>) -> Result<Self> {
        let backoff_ms = match config.extra.get("batch_backoff_ms") {
            None => DEFAULT_BACKOFF_MS,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| Error::config("batch_backoff_ms must be a non-negative integer"))?,
        };
        Ok(Self {
            table: table.to_string(),
            key_attrs: require_key_attrs(table, config)?,
            client,
            backoff: Duration::from_millis(backoff_ms),
        })
    }

    fn write_chunk(&self, chunk: Vec<AttributeMap>) -> Result<()> {
        let mut pending = chunk;
        for attempt in 1..=BATCH_ATTEMPTS {
            pending = normalize(self.client.batch_write_item(&self.table, pending))?;
            if pending.is_empty() {
                return Ok(());
            }
            tracing::warn!(
                table = %self.table,
                attempt,
                unprocessed = pending.len(),
                "batch write left unprocessed items"
            );
            if attempt < BATCH_ATTEMPTS {
                std::thread::sleep(self.backoff * attempt);
            }
        }
        tracing::error!(table = %self.table, unprocessed = pending.len(), "batch write gave up");
        Err(Error::plugin(format!(
            "{} items unprocessed after {BATCH_ATTEMPTS} attempts",
            pending.len()
        )))
    }
}

impl Backend for DynamoBackend {
    fn name(&self) -> &str {
        "dynamodb"
    }

    fn get_item(&self, key: &Key) -> Result<Option<Item>> {
        let key = key_attributes(key)?;
        let item = normalize_lookup(self.client.get_item(&self.table, &key), NotFoundPolicy::Raise)?;
        Ok(item.map(from_attributes))
    }

    fn put_item(&self, item: &Item) -> Result<()> {
        Key::from_item(item, &self.key_attrs)?;
        normalize(self.client.put_item(&self.table, to_attributes(item)?))
    }

    fn put_items(&self, items: &[Item]) -> Result<()> {
        let mut requests = Vec::with_capacity(items.len());
        for item in items {
            Key::from_item(item, &self.key_attrs)?;
            requests.push(to_attributes(item)?);
        }
        while !requests.is_empty() {
            let rest = requests.split_off(requests.len().min(BATCH_SIZE));
            self.write_chunk(std::mem::replace(&mut requests, rest))?;
        }
        Ok(())
    }

    fn delete_item(&self, key: &Key) -> Result<()> {
        normalize(self.client.delete_item(&self.table, &key_attributes(key)?))
    }

    fn query(
        &self,
        key: &Conditions,
        filters: &Conditions,
        limit: Option<usize>,
        resume: Option<serde_json::Value>,
    ) -> Result<Page> {
        // One extra item tells a full last page apart from a page with more
        // behind it; DynamoDB returns LastEvaluatedKey for both.
        let mut input = QueryInput {
            table_name: self.table.clone(),
            limit: limit.map(|n| n.saturating_add(1)),
            ..QueryInput::default()
        };
        input.key_condition_expression = equality_expression("k", key, &mut input)?;
        input.filter_expression = equality_expression("f", filters, &mut input)?;
        input.exclusive_start_key = resume
            .map(|state| serde_json::from_value(state).map_err(|_| invalid_cursor()))
            .transpose()?;

        let output = if input.key_condition_expression.is_some() {
            normalize(self.client.query(&input))?
        } else {
            normalize(self.client.scan(&input))?
        };
        let mut items: Vec<Item> = output.items.into_iter().map(from_attributes).collect();
        let resume_key = match (limit, items.len()) {
            (Some(n), len) if len > n => {
                items.truncate(n);
                match items.last() {
                    Some(last) => Some(to_attributes(
                        &Key::from_item(last, &self.key_attrs)?.to_item(),
                    )?),
                    None => None,
                }
            }
            _ => output.last_evaluated_key,
        };
        let resume = resume_key
            .map(|key| serde_json::to_value(key).map_err(|e| Error::plugin(e.to_string())))
            .transpose()?;
        Ok(Page { items, resume })
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
            |_, value| to_attribute(value),
            BindStyle::Positional("?"),
        )?;
        let next_token = resume
            .map(|state| state.as_str().map(String::from).ok_or_else(invalid_cursor))
            .transpose()?;
        let input = StatementInput {
            statement: bound.statement,
            parameters: bound.params,
            limit,
            next_token,
        };
        let output = normalize(self.client.execute_statement(&input))?;
        Ok(Page {
            items: output.items.into_iter().map(from_attributes).collect(),
            resume: output.next_token.map(serde_json::Value::String),
        })
    }
}
