//! Fake native clients backed by [`MemoryStore`], for adapter tests.
use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::cosmos::{CosmosClient, CosmosError, CosmosPage, CosmosQuery, Document};
use super::dynamodb::{
    from_attribute, from_attributes, to_attributes, AttributeMap, DynamoClient, DynamoError,
    QueryInput, QueryOutput, StatementInput, StatementOutput,
};
use super::memory::{self, MemoryStore};
use crate::sql::placeholders;
use crate::sql::binder::replace_placeholders;
use crate::value::{item_from_json, item_to_json, Item, Key, Value};

fn offset(token: Option<&str>) -> usize {
    token.and_then(|t| t.parse().ok()).unwrap_or(0)
}

/// Slice `items` from `start`, returning the next offset when more remain.
fn window(items: Vec<Item>, start: usize, limit: Option<usize>) -> (Vec<Item>, Option<usize>) {
    let total = items.len();
    let page: Vec<Item> = items
        .into_iter()
        .skip(start)
        .take(limit.unwrap_or(usize::MAX))
        .collect();
    let end = start + page.len();
    (page, (end < total).then_some(end))
}

/// DynamoDB stand-in. Tables must be defined before use, like real ones.
#[derive(Default)]
pub struct FakeDynamo {
    store: MemoryStore,
    schemas: Mutex<BTreeMap<String, Vec<String>>>,
    failure: Mutex<Option<DynamoError>>,
    unprocessed_calls: Mutex<usize>,
    batch_calls: Mutex<usize>,
    last_query: Mutex<Option<QueryInput>>,
    last_statement: Mutex<Option<StatementInput>>,
}

impl FakeDynamo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: MemoryStore) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    pub fn define_table<I, S>(&self, table: &str, key_attrs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schemas.lock().insert(
            table.to_string(),
            key_attrs.into_iter().map(Into::into).collect(),
        );
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Fail the next call with `err`.
    pub fn fail_with(&self, err: DynamoError) {
        *self.failure.lock() = Some(err);
    }

    /// Leave the last item of the next `calls` batches unprocessed.
    pub fn leave_unprocessed(&self, calls: usize) {
        *self.unprocessed_calls.lock() = calls;
    }

    pub fn batch_calls(&self) -> usize {
        *self.batch_calls.lock()
    }

    pub fn last_query(&self) -> Option<QueryInput> {
        self.last_query.lock().clone()
    }

    pub fn last_statement(&self) -> Option<StatementInput> {
        self.last_statement.lock().clone()
    }

    fn check(&self, table: &str) -> Result<Vec<String>, DynamoError> {
        if let Some(err) = self.failure.lock().take() {
            return Err(err);
        }
        self.schemas.lock().get(table).cloned().ok_or_else(|| {
            DynamoError::new(
                "ResourceNotFoundException",
                format!("Requested resource not found: Table: {table} not found"),
            )
        })
    }

    fn store_item(&self, table: &str, schema: &[String], item: AttributeMap) -> Result<(), DynamoError> {
        let item = from_attributes(item);
        let key = Key::from_item(&item, schema)
            .map_err(|e| DynamoError::new("ValidationException", e.to_string()))?;
        self.store.put(table, &key, item);
        Ok(())
    }

    fn resolve(input: &QueryInput, expression: Option<&str>) -> Vec<(String, Value)> {
        let Some(expression) = expression else {
            return Vec::new();
        };
        expression
            .split(" AND ")
            .filter_map(|clause| {
                let (name, value) = clause.split_once(" = ")?;
                let name = input.expression_attribute_names.get(name.trim())?;
                let value = input.expression_attribute_values.get(value.trim())?;
                Some((name.clone(), from_attribute(value.clone())))
            })
            .collect()
    }

    fn run_query(&self, input: &QueryInput, use_key: bool) -> Result<QueryOutput, DynamoError> {
        let schema = self.check(&input.table_name)?;
        *self.last_query.lock() = Some(input.clone());
        let mut conditions = Self::resolve(input, input.filter_expression.as_deref());
        if use_key {
            conditions.extend(Self::resolve(input, input.key_condition_expression.as_deref()));
        }
        let items: Vec<Item> = self
            .store
            .items(&input.table_name)
            .into_iter()
            .filter(|item| {
                conditions
                    .iter()
                    .all(|(name, value)| item.get(name).is_some_and(|v| v.loosely_equals(value)))
            })
            .collect();

        let start = match &input.exclusive_start_key {
            None => 0,
            Some(start_key) => {
                let start_key = from_attributes(start_key.clone());
                items
                    .iter()
                    .position(|item| start_key.iter().all(|(k, v)| item.get(k) == Some(v)))
                    .map_or(items.len(), |i| i + 1)
            }
        };
        let (page, more) = window(items, start, input.limit);
        // Like the service, a page that fills the limit reports its last key
        // even when nothing follows.
        let full = input.limit.is_some_and(|limit| page.len() == limit);
        let last_evaluated_key = match (more.is_some() || full, page.last()) {
            (true, Some(last)) => {
                let key = Key::from_item(last, &schema)
                    .map_err(|e| DynamoError::new("ValidationException", e.to_string()))?;
                Some(
                    to_attributes(&key.to_item())
                        .map_err(|e| DynamoError::new("ValidationException", e.to_string()))?,
                )
            }
            _ => None,
        };
        Ok(QueryOutput {
            items: page
                .iter()
                .map(to_attributes)
                .collect::<crate::error::Result<_>>()
                .map_err(|e| DynamoError::new("ValidationException", e.to_string()))?,
            last_evaluated_key,
        })
    }
}

impl DynamoClient for FakeDynamo {
    fn get_item(&self, table: &str, key: &AttributeMap) -> Result<Option<AttributeMap>, DynamoError> {
        self.check(table)?;
        let key = Key::from_pairs(from_attributes(key.clone()))
            .map_err(|e| DynamoError::new("ValidationException", e.to_string()))?;
        self.store
            .get(table, &key)
            .map(|item| to_attributes(&item))
            .transpose()
            .map_err(|e| DynamoError::new("ValidationException", e.to_string()))
    }

    fn put_item(&self, table: &str, item: AttributeMap) -> Result<(), DynamoError> {
        let schema = self.check(table)?;
        self.store_item(table, &schema, item)
    }

    fn batch_write_item(
        &self,
        table: &str,
        mut items: Vec<AttributeMap>,
    ) -> Result<Vec<AttributeMap>, DynamoError> {
        let schema = self.check(table)?;
        *self.batch_calls.lock() += 1;
        let mut unprocessed = Vec::new();
        {
            let mut remaining = self.unprocessed_calls.lock();
            if *remaining > 0 && !items.is_empty() {
                *remaining -= 1;
                unprocessed.extend(items.pop());
            }
        }
        for item in items {
            self.store_item(table, &schema, item)?;
        }
        Ok(unprocessed)
    }

    fn delete_item(&self, table: &str, key: &AttributeMap) -> Result<(), DynamoError> {
        self.check(table)?;
        let key = Key::from_pairs(from_attributes(key.clone()))
            .map_err(|e| DynamoError::new("ValidationException", e.to_string()))?;
        self.store.delete(table, &key);
        Ok(())
    }

    fn query(&self, input: &QueryInput) -> Result<QueryOutput, DynamoError> {
        self.run_query(input, true)
    }

    fn scan(&self, input: &QueryInput) -> Result<QueryOutput, DynamoError> {
        self.run_query(input, false)
    }

    fn execute_statement(&self, input: &StatementInput) -> Result<StatementOutput, DynamoError> {
        if let Some(err) = self.failure.lock().take() {
            return Err(err);
        }
        *self.last_statement.lock() = Some(input.clone());
        let query = crate::sql::parse_select(&input.statement)
            .map_err(|e| DynamoError::new("ValidationException", e.to_string()))?;
        let table = query.table.trim_matches('"').to_string();
        self.check(&table)?;
        let params: Vec<Value> = input.parameters.iter().cloned().map(from_attribute).collect();
        let items = memory::select(self.store.items(&table), &input.statement, &params)
            .map_err(|e| DynamoError::new("ValidationException", e.to_string()))?;
        let (page, more) = window(items, offset(input.next_token.as_deref()), input.limit);
        Ok(StatementOutput {
            items: page
                .iter()
                .map(to_attributes)
                .collect::<crate::error::Result<_>>()
                .map_err(|e| DynamoError::new("ValidationException", e.to_string()))?,
            next_token: more.map(|n| n.to_string()),
        })
    }
}

/// Cosmos stand-in that decorates stored documents with system fields.
#[derive(Default)]
pub struct FakeCosmos {
    store: MemoryStore,
    failure: Mutex<Option<CosmosError>>,
    last_upsert: Mutex<Option<(String, serde_json::Value, Document)>>,
    last_query: Mutex<Option<CosmosQuery>>,
}

const PARTITION: &str = "_pk";

impl FakeCosmos {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: MemoryStore) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    pub fn fail_with(&self, err: CosmosError) {
        *self.failure.lock() = Some(err);
    }

    pub fn last_upsert(&self) -> Option<(String, serde_json::Value, Document)> {
        self.last_upsert.lock().clone()
    }

    pub fn last_query(&self) -> Option<CosmosQuery> {
        self.last_query.lock().clone()
    }

    fn check(&self) -> Result<(), CosmosError> {
        match self.failure.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn key(id: &str, partition_key: &serde_json::Value) -> Key {
        Key::hash(PARTITION, Value::from_json(partition_key.clone())).range("id", id)
    }

    fn document(mut item: Item) -> Document {
        item.remove(PARTITION);
        let mut doc = item_to_json(&item);
        doc.insert("_rid".into(), serde_json::json!("rid"));
        doc.insert("_etag".into(), serde_json::json!("\"0000\""));
        doc.insert("_ts".into(), serde_json::json!(1_700_000_000));
        doc
    }
}

impl CosmosClient for FakeCosmos {
    fn read_item(
        &self,
        container: &str,
        id: &str,
        partition_key: &serde_json::Value,
    ) -> Result<Document, CosmosError> {
        self.check()?;
        self.store
            .get(container, &Self::key(id, partition_key))
            .map(Self::document)
            .ok_or_else(|| CosmosError::new(404, "Entity with the specified id does not exist"))
    }

    fn upsert_item(
        &self,
        container: &str,
        partition_key: &serde_json::Value,
        document: Document,
    ) -> Result<(), CosmosError> {
        self.check()?;
        let id = document
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CosmosError::new(400, "document is missing an id"))?
            .to_string();
        *self.last_upsert.lock() = Some((id.clone(), partition_key.clone(), document.clone()));
        let mut item = item_from_json(document);
        item.insert(PARTITION.into(), Value::from_json(partition_key.clone()));
        self.store.put(container, &Self::key(&id, partition_key), item);
        Ok(())
    }

    fn delete_item(
        &self,
        container: &str,
        id: &str,
        partition_key: &serde_json::Value,
    ) -> Result<(), CosmosError> {
        self.check()?;
        if self.store.delete(container, &Self::key(id, partition_key)) {
            Ok(())
        } else {
            Err(CosmosError::new(404, "Entity with the specified id does not exist"))
        }
    }

    fn query_items(
        &self,
        container: &str,
        query: &CosmosQuery,
        max_item_count: Option<usize>,
        continuation: Option<&str>,
    ) -> Result<CosmosPage, CosmosError> {
        self.check()?;
        *self.last_query.lock() = Some(query.clone());
        let params = placeholders(&query.query)
            .into_iter()
            .map(|name| {
                query
                    .parameters
                    .iter()
                    .find(|p| p.name == name)
                    .map(|p| Value::from_json(p.value.clone()))
                    .ok_or_else(|| CosmosError::new(400, format!("parameter {name} not supplied")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let statement = replace_placeholders(&query.query, "?");
        let items = memory::select(self.store.items(container), &statement, &params)
            .map_err(|e| CosmosError::new(400, e.to_string()))?;
        let (page, more) = window(items, offset(continuation), max_item_count);
        Ok(CosmosPage {
            items: page.into_iter().map(Self::document).collect(),
            continuation: more.map(|n| n.to_string()),
        })
    }
}
