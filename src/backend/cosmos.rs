//! Azure Cosmos DB (SQL API) adapter.
//!
//! The table name is the container. The document `id` is the hash key
//! value. The partition key is the range key value, or the hash key value
//! on hash-only tables.
//!
//! Items without an `id` attribute get the derived one on write, flagged by
//! [`DERIVED_ID`] so reads can drop it again.
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{require_key_attrs, Backend, Page};
use crate::config::TableConfig;
use crate::error::{normalize, normalize_lookup, Error, ErrorKind, NativeError, NotFoundPolicy, Result};
use crate::sql::{bind_parameters, BindStyle};
use crate::value::{item_from_json, item_to_json, Conditions, Item, Key, Parameters, Value};

pub type Document = serde_json::Map<String, serde_json::Value>;

/// Fields Cosmos adds to every stored document.
const SYSTEM_FIELDS: &[&str] = &["_rid", "_self", "_etag", "_attachments", "_ts"];

/// Set on documents whose `id` was derived from the key rather than given.
pub const DERIVED_ID: &str = "_abnosql_id";

/// Native Cosmos failure, identified by its HTTP status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosmosError {
    pub status: u16,
    pub message: String,
}

impl CosmosError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl fmt::Display for CosmosError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}: {}", self.status, self.message)
    }
}

impl std::error::Error for CosmosError {}

impl NativeError for CosmosError {
    fn kind(&self) -> ErrorKind {
        match self.status {
            404 => ErrorKind::NotFound,
            400 | 409 | 412 | 413 => ErrorKind::Validation,
            401 | 403 => ErrorKind::Configuration,
            408 | 429 | 449 | 500..=599 => ErrorKind::Plugin,
            _ => ErrorKind::Configuration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CosmosParameter {
    pub name: String,
    pub value: serde_json::Value,
}

/// Parameterized query in the wire shape of the Cosmos query API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CosmosQuery {
    pub query: String,
    pub parameters: Vec<CosmosParameter>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CosmosPage {
    pub items: Vec<Document>,
    pub continuation: Option<String>,
}

pub trait CosmosClient: Send + Sync {
    /// Read one document; a missing one is a 404.
    fn read_item(
        &self,
        container: &str,
        id: &str,
        partition_key: &serde_json::Value,
    ) -> std::result::Result<Document, CosmosError>;

    fn upsert_item(
        &self,
        container: &str,
        partition_key: &serde_json::Value,
        document: Document,
    ) -> std::result::Result<(), CosmosError>;

    fn delete_item(
        &self,
        container: &str,
        id: &str,
        partition_key: &serde_json::Value,
    ) -> std::result::Result<(), CosmosError>;

    fn query_items(
        &self,
        container: &str,
        query: &CosmosQuery,
        max_item_count: Option<usize>,
        continuation: Option<&str>,
    ) -> std::result::Result<CosmosPage, CosmosError>;
}

/// Connection settings needed to build a native client.
#[derive(Clone, PartialEq, Eq)]
pub struct CosmosSettings {
    pub endpoint: String,
    pub credential: String,
    pub database: String,
}

impl fmt::Debug for CosmosSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CosmosSettings")
            .field("endpoint", &self.endpoint)
            .field("credential", &"***")
            .field("database", &self.database)
            .finish()
    }
}

impl CosmosSettings {
    /// Read the settings from `config`, reporting every missing one.
    pub fn resolve(config: &TableConfig) -> Result<Self> {
        let endpoint = config.endpoint.clone().or_else(|| {
            config
                .account
                .as_ref()
                .map(|account| format!("https://{account}.documents.azure.com"))
        });
        let mut missing = Vec::new();
        if endpoint.is_none() {
            missing.push("endpoint");
        }
        if config.credential.is_none() {
            missing.push("credential");
        }
        if config.database.is_none() {
            missing.push("database");
        }
        match (endpoint, config.credential.clone(), config.database.clone()) {
            (Some(endpoint), Some(credential), Some(database)) => Ok(Self {
                endpoint,
                credential,
                database,
            }),
            _ => Err(Error::config(format!("missing config: {}", missing.join(", ")))),
        }
    }
}

fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_json().to_string(),
    }
}

/// Cosmos SQL reference to a top-level field.
fn field_ref(name: &str) -> String {
    let plain = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if plain {
        format!("c.{name}")
    } else {
        format!("c[\"{name}\"]")
    }
}

pub struct CosmosBackend {
    container: String,
    key_attrs: Vec<String>,
    client: Arc<dyn CosmosClient>,
}

impl CosmosBackend {
    pub fn new(table: &str, config: &TableConfig, client: Arc<dyn CosmosClient>) -> Result<Self> {
        Ok(Self {
            container: table.to_string(),
            key_attrs: require_key_attrs(table, config)?,
            client,
        })
    }

    /// Document id and partition key of `key`.
    fn locate(&self, key: &Key) -> (String, serde_json::Value) {
        let (_, hash) = key.hash_field();
        let partition_key = match key.range_field() {
            Some((_, range)) => range.to_json(),
            None => hash.to_json(),
        };
        (id_string(hash), partition_key)
    }

    fn strip(&self, mut document: Document) -> Item {
        for field in SYSTEM_FIELDS {
            document.remove(*field);
        }
        if document.remove(DERIVED_ID).is_some() {
            document.remove("id");
        }
        item_from_json(document)
    }

    /// Stored form of `item`. A given `id` must agree with the key.
    fn document(&self, item: &Item, id: String) -> Result<Document> {
        let mut document = item_to_json(item);
        match item.get("id") {
            None => {
                document.insert("id".to_string(), serde_json::Value::String(id));
                document.insert(DERIVED_ID.to_string(), serde_json::Value::Bool(true));
            }
            Some(given) if id_string(given) == id => {}
            Some(given) => {
                return Err(Error::validation(format!(
                    "id {} does not match document id {id} derived from the key",
                    id_string(given)
                )))
            }
        }
        Ok(document)
    }

    fn compile(&self, key: &Conditions, filters: &Conditions) -> CosmosQuery {
        let mut clauses = Vec::new();
        let mut parameters: Vec<CosmosParameter> = Vec::new();
        for (name, value) in key.iter().chain(filters.iter()) {
            let base = format!("@{}", name.replace('-', "_"));
            let mut param = base.clone();
            let mut n = 1;
            while parameters.iter().any(|p| p.name == param) {
                param = format!("{base}_{n}");
                n += 1;
            }
            clauses.push(format!("{} = {param}", field_ref(name)));
            parameters.push(CosmosParameter {
                name: param,
                value: value.to_json(),
            });
        }
        let query = if clauses.is_empty() {
            "SELECT * FROM c".to_string()
        } else {
            format!("SELECT * FROM c WHERE {}", clauses.join(" AND "))
        };
        CosmosQuery { query, parameters }
    }

    fn run(
        &self,
        query: &CosmosQuery,
        limit: Option<usize>,
        resume: Option<serde_json::Value>,
    ) -> Result<Page> {
        let continuation = resume
            .map(|state| {
                state
                    .as_str()
                    .map(String::from)
                    .ok_or_else(|| Error::validation("invalid cursor"))
            })
            .transpose()?;
        let page = normalize(self.client.query_items(
            &self.container,
            query,
            limit,
            continuation.as_deref(),
        ))?;
        Ok(Page {
            items: page.items.into_iter().map(|doc| self.strip(doc)).collect(),
            resume: page.continuation.map(serde_json::Value::String),
        })
    }
}

impl Backend for CosmosBackend {
    fn name(&self) -> &str {
        "cosmos"
    }

    fn get_item(&self, key: &Key) -> Result<Option<Item>> {
        let (id, partition_key) = self.locate(key);
        let document = normalize_lookup(
            self.client
                .read_item(&self.container, &id, &partition_key)
                .map(Some),
            NotFoundPolicy::Suppress,
        )?;
        Ok(document.map(|doc| self.strip(doc)))
    }

    fn put_item(&self, item: &Item) -> Result<()> {
        let key = Key::from_item(item, &self.key_attrs)?;
        let (id, partition_key) = self.locate(&key);
        let document = self.document(item, id)?;
        normalize(self.client.upsert_item(&self.container, &partition_key, document))
    }

    fn delete_item(&self, key: &Key) -> Result<()> {
        let (id, partition_key) = self.locate(key);
        normalize_lookup(
            self.client
                .delete_item(&self.container, &id, &partition_key)
                .map(Some),
            NotFoundPolicy::Suppress,
        )?;
        Ok(())
    }

    fn query(
        &self,
        key: &Conditions,
        filters: &Conditions,
        limit: Option<usize>,
        resume: Option<serde_json::Value>,
    ) -> Result<Page> {
        self.run(&self.compile(key, filters), limit, resume)
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
            |name, value| {
                Ok(CosmosParameter {
                    name: name.to_string(),
                    value: value.to_json(),
                })
            },
            BindStyle::Named,
        )?;
        let query = CosmosQuery {
            query: bound.statement,
            parameters: bound.params,
        };
        self.run(&query, limit, resume)
    }
}
