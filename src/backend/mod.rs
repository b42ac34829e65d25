/// Backend adapter contract.
///
/// Each adapter owns the translation between the portable item model and
/// its native client: key shape, value conversion, query compilation and
/// error normalization. Everything an adapter returns is already in the
/// common [`Error`] taxonomy.
///
/// # Example
///
/// ```ignore
/// struct Sqlite { /* ... */ }
///
/// impl Backend for Sqlite {
///     fn name(&self) -> &str { "sqlite" }
///     fn get_item(&self, key: &Key) -> Result<Option<Item>> { /* ... */ }
///     // ...
/// }
///
/// let config = TableConfig {
///     database_client: Some(DatabaseClient::Backend(Arc::new(Sqlite::open()?))),
///     ..TableConfig::with_key_attrs(["hk"])
/// };
/// ```
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{DatabaseClient, TableConfig};
use crate::error::{Error, Result};
use crate::value::{Conditions, Item, Key, Parameters};

pub mod cosmos;
pub mod dynamodb;
pub mod memory;
#[cfg(test)]
pub(crate) mod testing;

use memory::MemoryStore;

/// One page of results plus the native state needed to continue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Item>,
    /// `None` once the result set is exhausted.
    pub resume: Option<serde_json::Value>,
}

pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch one item; `Ok(None)` when it does not exist.
    fn get_item(&self, key: &Key) -> Result<Option<Item>>;

    /// Insert or replace an item.
    fn put_item(&self, item: &Item) -> Result<()>;

    fn put_items(&self, items: &[Item]) -> Result<()> {
        for item in items {
            self.put_item(item)?;
        }
        Ok(())
    }

    fn delete_item(&self, key: &Key) -> Result<()>;

    /// Equality query on key attributes, narrowed by equality filters.
    /// An empty `key` scans the whole table.
    fn query(
        &self,
        key: &Conditions,
        filters: &Conditions,
        limit: Option<usize>,
        resume: Option<serde_json::Value>,
    ) -> Result<Page>;

    /// Run a validated SELECT with `@name` placeholders.
    fn query_sql(
        &self,
        statement: &str,
        parameters: &Parameters,
        limit: Option<usize>,
        resume: Option<serde_json::Value>,
    ) -> Result<Page>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    DynamoDb,
    Cosmos,
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::DynamoDb => "dynamodb",
            BackendKind::Cosmos => "cosmos",
            BackendKind::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "dynamodb" => Ok(BackendKind::DynamoDb),
            "cosmos" => Ok(BackendKind::Cosmos),
            "memory" => Ok(BackendKind::Memory),
            other => Err(Error::config(format!("table.{other} plugin not found"))),
        }
    }
}

/// Build the adapter of `kind` for `table`.
///
/// A `database_client` in the config is used as-is; otherwise the adapter
/// connects from the config fields. `store` backs memory tables that were
/// not given their own store.
pub fn connect(
    kind: BackendKind,
    table: &str,
    config: &TableConfig,
    store: &MemoryStore,
) -> Result<Arc<dyn Backend>> {
    tracing::debug!(table, backend = %kind, "connecting");
    let client = config.database_client.as_ref();
    if let Some(DatabaseClient::Backend(backend)) = client {
        return Ok(backend.clone());
    }
    if let Some(client_kind) = client.and_then(DatabaseClient::kind) {
        if client_kind != kind {
            return Err(Error::config(format!(
                "database_client is a {client_kind} client, table {table} uses {kind}"
            )));
        }
    }

    match kind {
        BackendKind::DynamoDb => {
            let client = match client {
                Some(DatabaseClient::DynamoDb(client)) => client.clone(),
                _ => {
                    return Err(Error::config(format!(
                        "dynamodb client not provided for region {}",
                        config.region.as_deref().unwrap_or("<unset>")
                    )))
                }
            };
            Ok(Arc::new(dynamodb::DynamoBackend::new(table, config, client)?))
        }
        BackendKind::Cosmos => match client {
            Some(DatabaseClient::Cosmos(client)) => Ok(Arc::new(cosmos::CosmosBackend::new(
                table,
                config,
                client.clone(),
            )?)),
            _ => {
                let settings = cosmos::CosmosSettings::resolve(config)?;
                Err(Error::config(format!(
                    "cosmos client not provided for {}",
                    settings.endpoint
                )))
            }
        },
        BackendKind::Memory => {
            let store = match client {
                Some(DatabaseClient::Memory(store)) => store.clone(),
                _ => store.clone(),
            };
            Ok(Arc::new(memory::MemoryBackend::new(table, config, store)?))
        }
    }
}

/// Resolve the key attributes of a table, requiring one or two.
pub(crate) fn require_key_attrs(table: &str, config: &TableConfig) -> Result<Vec<String>> {
    match config.key_attrs.len() {
        1 | 2 => Ok(config.key_attrs.clone()),
        0 => Err(Error::config(format!("key_attrs not configured for table {table}"))),
        n => Err(Error::config(format!(
            "table {table} has {n} key_attrs, expected 1 or 2"
        ))),
    }
}
