//! Table configuration and settings.
//!
//! Resolution for a table, in order: the explicit config (or the settings
//! file entry), then the first non-empty config hook, then environment
//! variables for any field still unset.
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::cosmos::CosmosClient;
use crate::backend::dynamodb::DynamoClient;
use crate::backend::memory::MemoryStore;
use crate::backend::{Backend, BackendKind};
use crate::error::{Error, Result};
use crate::value::ValueDeserializer;

pub const ENV_DATABASE: &str = "ABNOSQL_DB";
pub const ENV_KEY_ATTRS: &str = "ABNOSQL_KEY_ATTRS";
const ENV_COSMOS_PREFIX: &str = "ABNOSQL_COSMOS_";
const ENV_AWS_REGIONS: &[&str] = &["AWS_DEFAULT_REGION", "AWS_REGION"];

/// A pre-built backend handle that bypasses connection discovery.
#[derive(Clone)]
pub enum DatabaseClient {
    DynamoDb(Arc<dyn DynamoClient>),
    Cosmos(Arc<dyn CosmosClient>),
    Memory(MemoryStore),
    Backend(Arc<dyn Backend>),
}

impl DatabaseClient {
    pub fn kind(&self) -> Option<BackendKind> {
        match self {
            DatabaseClient::DynamoDb(_) => Some(BackendKind::DynamoDb),
            DatabaseClient::Cosmos(_) => Some(BackendKind::Cosmos),
            DatabaseClient::Memory(_) => Some(BackendKind::Memory),
            DatabaseClient::Backend(_) => None,
        }
    }
}

impl fmt::Debug for DatabaseClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseClient::DynamoDb(_) => f.write_str("DatabaseClient::DynamoDb(..)"),
            DatabaseClient::Cosmos(_) => f.write_str("DatabaseClient::Cosmos(..)"),
            DatabaseClient::Memory(_) => f.write_str("DatabaseClient::Memory(..)"),
            DatabaseClient::Backend(b) => write!(f, "DatabaseClient::Backend({})", b.name()),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TableConfig {
    /// Hash key name, then the optional range key name.
    #[serde(default)]
    pub key_attrs: Vec<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default, skip_serializing)]
    pub credential: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Options consumed by plugins rather than by the core.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
    #[serde(skip)]
    pub database_client: Option<DatabaseClient>,
    #[serde(skip)]
    pub deserializer: Option<Arc<dyn ValueDeserializer>>,
}

impl fmt::Debug for TableConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableConfig")
            .field("key_attrs", &self.key_attrs)
            .field("endpoint", &self.endpoint)
            .field("account", &self.account)
            .field("credential", &self.credential.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("region", &self.region)
            .field("extra", &self.extra)
            .field("database_client", &self.database_client)
            .field("deserializer", &self.deserializer.is_some())
            .finish()
    }
}

impl TableConfig {
    pub fn with_key_attrs<I, S>(key_attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key_attrs: key_attrs.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key_attrs.is_empty()
            && self.endpoint.is_none()
            && self.account.is_none()
            && self.credential.is_none()
            && self.database.is_none()
            && self.region.is_none()
            && self.extra.is_empty()
            && self.database_client.is_none()
            && self.deserializer.is_none()
    }

    /// Fill unset fields from the environment.
    pub fn fill_from_env(&mut self, env: &Env) {
        if self.key_attrs.is_empty() {
            if let Some(attrs) = env.get(ENV_KEY_ATTRS) {
                self.key_attrs = attrs
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(String::from)
                    .collect();
            }
        }
        let cosmos = |name: &str| env.get(&format!("{ENV_COSMOS_PREFIX}{}", name.to_uppercase()));
        fill(&mut self.account, || cosmos("account"));
        fill(&mut self.endpoint, || cosmos("endpoint"));
        fill(&mut self.credential, || cosmos("credential"));
        fill(&mut self.database, || cosmos("database"));
        fill(&mut self.region, || {
            ENV_AWS_REGIONS.iter().find_map(|name| env.get(name))
        });
    }

    pub fn extra_str(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(|v| v.as_str())
    }
}

fn fill(slot: &mut Option<String>, value: impl FnOnce() -> Option<String>) {
    if slot.is_none() {
        *slot = value();
    }
}

/// Environment lookup, injectable so tests never touch process state.
#[derive(Clone)]
pub struct Env {
    lookup: Arc<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl Env {
    pub fn process() -> Self {
        Self {
            lookup: Arc::new(|name: &str| std::env::var(name).ok().filter(|v| !v.is_empty())),
        }
    }

    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self {
            lookup: Arc::new(move |name: &str| vars.get(name).cloned()),
        }
    }

    pub fn empty() -> Self {
        Self::from_map(BTreeMap::new())
    }

    pub fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    /// Backend named by `ABNOSQL_DB`, else DynamoDB when an AWS region is set.
    pub fn default_backend(&self) -> Result<Option<BackendKind>> {
        if let Some(name) = self.get(ENV_DATABASE) {
            return name.parse().map(Some);
        }
        if ENV_AWS_REGIONS.iter().any(|name| self.get(name).is_some()) {
            return Ok(Some(BackendKind::DynamoDb));
        }
        Ok(None)
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::process()
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Env")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_created_by")]
    pub created_by: String,
    #[serde(default = "default_created_date")]
    pub created_date: String,
    #[serde(default = "default_modified_by")]
    pub modified_by: String,
    #[serde(default = "default_modified_date")]
    pub modified_date: String,
}

fn default_created_by() -> String {
    "created_by".into()
}
fn default_created_date() -> String {
    "created_date".into()
}
fn default_modified_by() -> String {
    "modified_by".into()
}
fn default_modified_date() -> String {
    "modified_date".into()
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            created_by: default_created_by(),
            created_date: default_created_date(),
            modified_by: default_modified_by(),
            modified_date: default_modified_date(),
        }
    }
}

/// Process-level settings loaded from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Default backend for tables opened without an explicit one.
    #[serde(default)]
    pub database: Option<BackendKind>,
    #[serde(default)]
    pub tables: BTreeMap<String, TableConfig>,
    #[serde(default)]
    pub audit: AuditSettings,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&data)
            .map_err(|e| Error::config(format!("invalid settings in {}: {e}", path.display())))
    }

    /// Load from the user config directory; a missing file yields defaults.
    pub fn load_default() -> Result<Self> {
        Self::load(&settings_path()?)
    }

    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.get(name)
    }
}

pub fn settings_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::config("could not determine config directory"))?;
    Ok(config_dir.join("abnosql").join("config.toml"))
}
