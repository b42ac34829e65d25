//! Table façade: the one API callers use regardless of backend.
//!
//! Every operation validates its input first, then runs the hook pipeline
//! around the adapter call:
//!
//! ```text
//! get_item     key check → adapter → deserializer → post_read
//! put_item     key check → pre_write → adapter → post_write
//! put_items    key check → pre_write (each) → adapter → post_write_batch
//! delete_item  key check → adapter → post_delete
//! query        field names → cursor → adapter → deserializer → cursor
//! query_sql    statement → parameters → cursor → adapter → deserializer → cursor
//! ```
use std::sync::Arc;

use crate::backend::memory::MemoryStore;
use crate::backend::{self, Backend, BackendKind};
use crate::config::{DatabaseClient, Env, Settings, TableConfig};
use crate::cursor::{fingerprint_conditions, fingerprint_statement, Cursor};
use crate::error::{Error, ErrorKind, Result};
use crate::plugin::{HookSet, PluginRegistry, WriteContext, TABLE_NAMESPACE};
use crate::sql::{check_parameters, validate_field_names, validate_statement};
use crate::value::{item_to_json, Conditions, Item, JsonNative, Key, Parameters, ValueDeserializer};

/// Options of a single write.
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions<'a> {
    /// User recorded by audit hooks.
    pub audit_user: Option<&'a str>,
    /// Merge onto the stored item, which must exist.
    pub update: bool,
    /// Refuse to overwrite an existing item.
    pub create_only: bool,
}

impl<'a> PutOptions<'a> {
    pub fn user(audit_user: &'a str) -> Self {
        Self {
            audit_user: Some(audit_user),
            ..Self::default()
        }
    }
}

/// A page of query results. `next` resumes the same query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPage {
    pub items: Vec<Item>,
    pub next: Option<Cursor>,
}

impl QueryPage {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "items": self.items.iter().map(item_to_json).collect::<Vec<_>>(),
            "next": self.next.as_ref().map(Cursor::as_str),
        })
    }
}

pub struct Table {
    name: String,
    config: TableConfig,
    backend: Arc<dyn Backend>,
    hooks: Arc<HookSet>,
    deserializer: Arc<dyn ValueDeserializer>,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Effective configuration after hooks and environment.
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Reorder `key` to the schema and require every key attribute.
    fn check_key(&self, key: &Key) -> Result<Key> {
        let key = key.clone().ordered_by(&self.config.key_attrs)?;
        if !self.config.key_attrs.is_empty()
            && !key.names().eq(self.config.key_attrs.iter().map(String::as_str))
        {
            return Err(Error::validation(format!(
                "key must contain {}",
                self.config.key_attrs.join(", ")
            )));
        }
        Ok(key)
    }

    fn key_of(&self, item: &Item) -> Result<Key> {
        if self.config.key_attrs.is_empty() {
            return Err(Error::config(format!(
                "key_attrs not configured for table {}",
                self.name
            )));
        }
        Key::from_item(item, &self.config.key_attrs)
    }

    fn read(&self, item: Item) -> Item {
        self.deserializer.deserialize(item)
    }

    pub fn get_item(&self, key: &Key) -> Result<Option<Item>> {
        tracing::debug!(table = %self.name, "get_item");
        let key = self.check_key(key)?;
        match self.backend.get_item(&key)? {
            Some(item) => Ok(Some(self.hooks.post_read(&self.name, self.read(item))?)),
            None => Ok(None),
        }
    }

    pub fn put_item(&self, item: Item) -> Result<()> {
        self.put_item_with(item, &PutOptions::default())
    }

    /// Key check, update/create semantics and pre-write hooks for one item.
    fn prepare(&self, item: Item, options: &PutOptions<'_>) -> Result<Item> {
        if options.update && options.create_only {
            return Err(Error::validation(
                "update and create_only cannot be combined",
            ));
        }
        let key = self.key_of(&item)?;
        let stored = if options.update || options.create_only || self.hooks.has_pre_write() {
            self.stored(&key)?
        } else {
            None
        };
        let item = match (&stored, options.update, options.create_only) {
            (Some(existing), true, _) => {
                let mut merged = existing.clone();
                merged.extend(item);
                merged
            }
            (None, true, _) => {
                return Err(Error::NotFound {
                    detail: Some(format!("no item to update in {}", self.name)),
                })
            }
            (Some(_), _, true) => return Err(Error::validation("item already exists")),
            _ => item,
        };
        let ctx = WriteContext {
            table: &self.name,
            audit_user: options.audit_user,
            existing: stored.as_ref(),
        };
        let item = self.hooks.pre_write(&ctx, item)?;
        self.key_of(&item)?;
        Ok(item)
    }

    /// Item stored under `key`; a missing table reads as no item.
    fn stored(&self, key: &Key) -> Result<Option<Item>> {
        match self.backend.get_item(key) {
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            other => other,
        }
    }

    pub fn put_item_with(&self, item: Item, options: &PutOptions<'_>) -> Result<()> {
        tracing::debug!(table = %self.name, update = options.update, "put_item");
        let item = self.prepare(item, options)?;
        self.backend.put_item(&item)?;
        self.hooks.post_write(&self.name, &item)
    }

    pub fn put_items(&self, items: Vec<Item>) -> Result<()> {
        self.put_items_with(items, &PutOptions::default())
    }

    pub fn put_items_with(&self, items: Vec<Item>, options: &PutOptions<'_>) -> Result<()> {
        tracing::debug!(table = %self.name, count = items.len(), "put_items");
        let items = items
            .into_iter()
            .map(|item| self.prepare(item, options))
            .collect::<Result<Vec<_>>>()?;
        self.backend.put_items(&items)?;
        self.hooks.post_write_batch(&self.name, &items)
    }

    pub fn delete_item(&self, key: &Key) -> Result<()> {
        tracing::debug!(table = %self.name, "delete_item");
        let key = self.check_key(key)?;
        self.backend.delete_item(&key)?;
        self.hooks.post_delete(&self.name, &key)
    }

    /// Equality query on key attributes, narrowed by `filters`. An empty
    /// `key` scans the table.
    pub fn query(
        &self,
        key: &Conditions,
        filters: Option<&Conditions>,
        limit: Option<usize>,
        next: Option<&str>,
    ) -> Result<QueryPage> {
        tracing::debug!(table = %self.name, ?limit, "query");
        let empty = Conditions::new();
        let filters = filters.unwrap_or(&empty);
        validate_field_names(key, filters)?;
        let unknown: Vec<&str> = key
            .keys()
            .map(String::as_str)
            .filter(|name| !self.config.key_attrs.iter().any(|attr| attr == name))
            .collect();
        if !unknown.is_empty() {
            return Err(Error::validation(format!(
                "unknown key attributes: {}",
                unknown.join(", ")
            )));
        }
        check_limit(limit)?;

        let fingerprint = fingerprint_conditions(&self.name, key, filters);
        let resume = next.map(|c| Cursor::decode(c, fingerprint)).transpose()?;
        let page = self.backend.query(key, filters, limit, resume)?;
        self.page(page, fingerprint)
    }

    /// Run a read-only SELECT with `@name` placeholders.
    pub fn query_sql(
        &self,
        statement: &str,
        parameters: Option<&Parameters>,
        limit: Option<usize>,
        next: Option<&str>,
    ) -> Result<QueryPage> {
        tracing::debug!(table = %self.name, ?limit, "query_sql");
        validate_statement(statement)?;
        let empty = Parameters::new();
        let parameters = parameters.unwrap_or(&empty);
        check_parameters(statement, parameters)?;
        check_limit(limit)?;

        let fingerprint = fingerprint_statement(&self.name, statement, parameters);
        let resume = next.map(|c| Cursor::decode(c, fingerprint)).transpose()?;
        let page = self
            .backend
            .query_sql(statement, parameters, limit, resume)?;
        self.page(page, fingerprint)
    }

    fn page(&self, page: backend::Page, fingerprint: u32) -> Result<QueryPage> {
        let next = page
            .resume
            .map(|state| Cursor::encode(fingerprint, state))
            .transpose()?;
        Ok(QueryPage {
            items: page.items.into_iter().map(|item| self.read(item)).collect(),
            next,
        })
    }
}

fn check_limit(limit: Option<usize>) -> Result<()> {
    match limit {
        Some(0) => Err(Error::validation("limit must be positive")),
        _ => Ok(()),
    }
}

/// Composition root: owns the plugin registry, settings and environment
/// every table is opened with.
pub struct Database {
    registry: Arc<PluginRegistry>,
    settings: Settings,
    env: Env,
    store: MemoryStore,
}

impl Database {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            settings: Settings::default(),
            env: Env::process(),
            store: MemoryStore::new(),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    pub fn with_memory_store(mut self, store: MemoryStore) -> Self {
        self.store = store;
        self
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn memory_store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn table(&self, name: &str) -> Result<Table> {
        self.table_with(name, None, None)
    }

    /// Open `name` with an explicit config and/or backend.
    ///
    /// Config resolution: `config`, else the settings entry; a config hook
    /// answer replaces it (keeping runtime handles it leaves unset); then
    /// unset fields come from the environment.
    pub fn table_with(
        &self,
        name: &str,
        config: Option<TableConfig>,
        kind: Option<BackendKind>,
    ) -> Result<Table> {
        let hooks = self.registry.hooks(TABLE_NAMESPACE)?;
        let mut config = config
            .or_else(|| self.settings.table(name).cloned())
            .unwrap_or_default();
        if let Some(mut provided) = hooks.resolve_config(name)? {
            if provided.database_client.is_none() {
                provided.database_client = config.database_client.take();
            }
            if provided.deserializer.is_none() {
                provided.deserializer = config.deserializer.take();
            }
            config = provided;
        }
        config.fill_from_env(&self.env);

        let backend = match &config.database_client {
            Some(DatabaseClient::Backend(backend)) => backend.clone(),
            client => {
                let kind = match kind
                    .or_else(|| client.as_ref().and_then(DatabaseClient::kind))
                    .or(self.settings.database)
                {
                    Some(kind) => kind,
                    None => self
                        .env
                        .default_backend()?
                        .ok_or_else(|| Error::config("no database backend selected"))?,
                };
                backend::connect(kind, name, &config, &self.store)?
            }
        };
        tracing::debug!(table = name, backend = backend.name(), "table opened");

        let deserializer = config
            .deserializer
            .clone()
            .unwrap_or_else(|| Arc::new(JsonNative));
        Ok(Table {
            name: name.to_string(),
            config,
            backend,
            hooks,
            deserializer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{FakeCosmos, FakeDynamo};
    use crate::backend::Page;
    use crate::error::ErrorKind;
    use crate::plugin::{
        AuditPlugin, ConfigProvider, HookRegistrar, PostDeleteHook, PostReadHook,
        PostWriteBatchHook, PostWriteHook, PreWriteHook, TablePlugin,
    };
    use crate::value::Value;
    use crate::{item, value::PreserveTypes};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy)]
    enum Flavor {
        Memory,
        Dynamo,
        Cosmos,
    }

    const FLAVORS: [Flavor; 3] = [Flavor::Memory, Flavor::Dynamo, Flavor::Cosmos];

    struct Harness {
        flavor: Flavor,
        db: Database,
        store: MemoryStore,
    }

    impl Harness {
        fn new(flavor: Flavor) -> Self {
            Self::with_registry(flavor, Arc::new(PluginRegistry::new()))
        }

        fn with_registry(flavor: Flavor, registry: Arc<PluginRegistry>) -> Self {
            let store = MemoryStore::new();
            let db = Database::new(registry)
                .with_env(Env::empty())
                .with_memory_store(store.clone());
            Self { flavor, db, store }
        }

        fn client(&self) -> DatabaseClient {
            match self.flavor {
                Flavor::Memory => DatabaseClient::Memory(self.store.clone()),
                Flavor::Dynamo => {
                    let fake = FakeDynamo::with_store(self.store.clone());
                    fake.define_table("hash_range", ["hk", "rk"]);
                    fake.define_table("hash_only", ["hk"]);
                    DatabaseClient::DynamoDb(Arc::new(fake))
                }
                Flavor::Cosmos => {
                    DatabaseClient::Cosmos(Arc::new(FakeCosmos::with_store(self.store.clone())))
                }
            }
        }

        fn table(&self, name: &str) -> Table {
            let key_attrs: &[&str] = if name == "hash_only" {
                &["hk"]
            } else {
                &["hk", "rk"]
            };
            let config = TableConfig {
                database_client: Some(self.client()),
                ..TableConfig::with_key_attrs(key_attrs.iter().copied())
            };
            self.db.table_with(name, Some(config), None).unwrap()
        }

        fn sql(&self) -> &'static str {
            match self.flavor {
                Flavor::Cosmos => "SELECT * FROM c WHERE c.hk = @hk AND c.num > @num",
                _ => "SELECT * FROM hash_range WHERE hk = @hk AND num > @num",
            }
        }
    }

    fn row(hk: &str, rk: Option<&str>) -> Item {
        let mut item = item! {
            "hk" => hk,
            "num" => 5,
            "obj" => item! { "foo" => "bar", "num" => 5, "list" => vec![1, 2, 3] },
            "list" => vec![1, 2, 3],
            "str" => "str",
        };
        if let Some(rk) = rk {
            item.insert("rk".into(), Value::from(rk));
        }
        item
    }

    fn rows(hks: &[&str], rks: &[&str]) -> Vec<Item> {
        hks.iter()
            .flat_map(|hk| rks.iter().map(move |rk| row(hk, Some(*rk))))
            .collect()
    }

    fn hash_range(hk: &str, rk: &str) -> Key {
        Key::hash("hk", hk).range("rk", rk)
    }

    fn conditions(pairs: &[(&str, Value)]) -> Conditions {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_get_and_put_round_trip() {
        for flavor in FLAVORS {
            let h = Harness::new(flavor);
            let tb = h.table("hash_range");
            assert_eq!(tb.get_item(&hash_range("1", "a")).unwrap(), None, "{flavor:?}");
            tb.put_item(row("1", Some("a"))).unwrap();
            assert_eq!(
                tb.get_item(&hash_range("1", "a")).unwrap(),
                Some(row("1", Some("a"))),
                "{flavor:?}"
            );

            let tb = h.table("hash_only");
            assert_eq!(tb.get_item(&Key::hash("hk", "1")).unwrap(), None, "{flavor:?}");
            tb.put_item(row("1", None)).unwrap();
            assert_eq!(
                tb.get_item(&Key::hash("hk", "1")).unwrap(),
                Some(row("1", None)),
                "{flavor:?}"
            );
        }
    }

    #[test]
    fn test_key_given_out_of_order() {
        for flavor in FLAVORS {
            let h = Harness::new(flavor);
            let tb = h.table("hash_range");
            tb.put_item(row("1", Some("a"))).unwrap();
            let key = Key::from_pairs([("rk", Value::from("a")), ("hk", Value::from("1"))]).unwrap();
            assert!(tb.get_item(&key).unwrap().is_some(), "{flavor:?}");
        }
    }

    #[test]
    fn test_put_items_and_delete() {
        for flavor in FLAVORS {
            let h = Harness::new(flavor);
            let tb = h.table("hash_range");
            tb.put_items(rows(&["1", "2"], &["a", "b"])).unwrap();
            assert_eq!(
                tb.get_item(&hash_range("2", "b")).unwrap(),
                Some(row("2", Some("b"))),
                "{flavor:?}"
            );
            tb.delete_item(&hash_range("1", "a")).unwrap();
            assert_eq!(tb.get_item(&hash_range("1", "a")).unwrap(), None, "{flavor:?}");
            tb.delete_item(&hash_range("1", "a")).unwrap();
        }
    }

    #[test]
    fn test_query_by_key_and_filter() {
        for flavor in FLAVORS {
            let h = Harness::new(flavor);
            let tb = h.table("hash_range");
            tb.put_items(rows(&["1", "2"], &["a", "b"])).unwrap();
            let page = tb
                .query(
                    &conditions(&[("hk", Value::from("1"))]),
                    Some(&conditions(&[("rk", Value::from("a"))])),
                    None,
                    None,
                )
                .unwrap();
            assert_eq!(page.items, rows(&["1"], &["a"]), "{flavor:?}");
            assert_eq!(page.next, None, "{flavor:?}");
        }
    }

    #[test]
    fn test_query_scan() {
        for flavor in FLAVORS {
            let h = Harness::new(flavor);
            let tb = h.table("hash_range");
            tb.put_items(rows(&["1", "2"], &["a", "b"])).unwrap();
            let page = tb.query(&Conditions::new(), None, None, None).unwrap();
            assert_eq!(page.items, rows(&["1", "2"], &["a", "b"]), "{flavor:?}");
        }
    }

    #[test]
    fn test_query_sql_with_parameters() {
        for flavor in FLAVORS {
            let h = Harness::new(flavor);
            let tb = h.table("hash_range");
            tb.put_items(rows(&["1", "2"], &["a", "b"])).unwrap();
            let params = conditions(&[("@hk", Value::from("1")), ("@num", Value::from(4))]);
            let page = tb.query_sql(h.sql(), Some(&params), None, None).unwrap();
            assert_eq!(page.items, rows(&["1"], &["a", "b"]), "{flavor:?}");
            assert_eq!(page.next, None, "{flavor:?}");
        }
    }

    #[test]
    fn test_query_pagination() {
        for flavor in FLAVORS {
            let h = Harness::new(flavor);
            let tb = h.table("hash_range");
            let all = rows(&["1", "2"], &["a", "b"]);
            tb.put_items(all.clone()).unwrap();
            let scan = Conditions::new();

            let first = tb.query(&scan, None, Some(1), None).unwrap();
            assert_eq!(first.items, all[..1].to_vec(), "{flavor:?}");
            let next = first.next.unwrap();
            assert!(!next.as_str().is_empty());

            let second = tb.query(&scan, None, Some(1), Some(next.as_str())).unwrap();
            assert_eq!(second.items, all[1..2].to_vec(), "{flavor:?}");

            let rest = tb
                .query(&scan, None, Some(2), second.next.as_ref().map(Cursor::as_str))
                .unwrap();
            assert_eq!(rest.items, all[2..4].to_vec(), "{flavor:?}");
            assert_eq!(rest.next, None, "{flavor:?}");
        }
    }

    #[test]
    fn test_pages_partition_results() {
        for flavor in FLAVORS {
            let h = Harness::new(flavor);
            let tb = h.table("hash_range");
            let all = rows(&["1", "2"], &["a", "b"]);
            tb.put_items(all.clone()).unwrap();

            let mut seen = Vec::new();
            let mut next: Option<Cursor> = None;
            let mut pages = 0;
            loop {
                let page = tb
                    .query(&Conditions::new(), None, Some(1), next.as_ref().map(Cursor::as_str))
                    .unwrap();
                pages += 1;
                seen.extend(page.items);
                next = page.next;
                if next.is_none() {
                    break;
                }
            }
            assert_eq!(pages, 4, "{flavor:?}");
            assert_eq!(seen, all, "{flavor:?}");
        }
    }

    #[test]
    fn test_sql_pagination() {
        for flavor in FLAVORS {
            let h = Harness::new(flavor);
            let tb = h.table("hash_range");
            tb.put_items(rows(&["1", "2"], &["a", "b"])).unwrap();
            let params = conditions(&[("@hk", Value::from("2")), ("@num", Value::from(0))]);
            let first = tb.query_sql(h.sql(), Some(&params), Some(1), None).unwrap();
            assert_eq!(first.items, rows(&["2"], &["a"]), "{flavor:?}");
            let second = tb
                .query_sql(h.sql(), Some(&params), Some(1), first.next.as_ref().map(Cursor::as_str))
                .unwrap();
            assert_eq!(second.items, rows(&["2"], &["b"]), "{flavor:?}");
            assert_eq!(second.next, None, "{flavor:?}");
        }
    }

    #[test]
    fn test_cursor_bound_to_its_query() {
        let h = Harness::new(Flavor::Memory);
        let tb = h.table("hash_range");
        tb.put_items(rows(&["1", "2"], &["a", "b"])).unwrap();
        let page = tb.query(&Conditions::new(), None, Some(1), None).unwrap();
        let cursor = page.next.unwrap();
        let other = conditions(&[("hk", Value::from("1"))]);
        let err = tb
            .query(&other, None, Some(1), Some(cursor.as_str()))
            .unwrap_err();
        assert_eq!(err.to_string(), "validation error: cursor does not match query");
    }

    #[derive(Default)]
    struct Recording {
        called: Mutex<BTreeSet<&'static str>>,
        tables: Mutex<BTreeSet<String>>,
    }

    impl Recording {
        fn mark(&self, hook: &'static str, table: &str) {
            self.called.lock().insert(hook);
            self.tables.lock().insert(table.to_string());
        }
    }

    impl ConfigProvider for Recording {
        fn config(&self, table: &str) -> anyhow::Result<Option<TableConfig>> {
            self.mark("config", table);
            let mut config = TableConfig::with_key_attrs(["hk", "rk"]);
            config.extra.insert("a".into(), serde_json::json!("b"));
            Ok(Some(config))
        }
    }

    impl PostReadHook for Recording {
        fn post_read(&self, table: &str, _item: &Item) -> anyhow::Result<Option<Item>> {
            self.mark("post_read", table);
            Ok(Some(item! { "foo" => "bar" }))
        }
    }

    impl PreWriteHook for Recording {
        fn pre_write(&self, ctx: &WriteContext<'_>, _item: &Item) -> anyhow::Result<Option<Item>> {
            self.mark("pre_write", ctx.table);
            Ok(None)
        }
    }

    impl PostWriteHook for Recording {
        fn post_write(&self, table: &str, _item: &Item) -> anyhow::Result<()> {
            self.mark("post_write", table);
            Ok(())
        }
    }

    impl PostWriteBatchHook for Recording {
        fn post_write_batch(&self, table: &str, _items: &[Item]) -> anyhow::Result<()> {
            self.mark("post_write_batch", table);
            Ok(())
        }
    }

    impl PostDeleteHook for Recording {
        fn post_delete(&self, table: &str, _key: &Key) -> anyhow::Result<()> {
            self.mark("post_delete", table);
            Ok(())
        }
    }

    impl TablePlugin for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn version(&self) -> &str {
            "0.1.0"
        }

        fn register(self: Arc<Self>, hooks: &mut HookRegistrar<'_>) -> anyhow::Result<()> {
            hooks.config(self.clone());
            hooks.post_read(self.clone());
            hooks.pre_write(self.clone());
            hooks.post_write(self.clone());
            hooks.post_write_batch(self.clone());
            hooks.post_delete(self);
            Ok(())
        }
    }

    #[test]
    fn test_hooks_run_around_operations() {
        for flavor in FLAVORS {
            let registry = Arc::new(PluginRegistry::new());
            let hooks = Arc::new(Recording::default());
            registry.register(TABLE_NAMESPACE, hooks.clone());
            let h = Harness::with_registry(flavor, registry.clone());

            let tb = h.table("hash_range");
            assert!(hooks.called.lock().contains("config"));
            assert_eq!(tb.config().key_attrs, vec!["hk", "rk"]);
            assert_eq!(tb.config().extra_str("a"), Some("b"));

            tb.put_item(row("1", Some("a"))).unwrap();
            assert_eq!(
                tb.get_item(&hash_range("1", "a")).unwrap(),
                Some(item! { "foo" => "bar" }),
                "{flavor:?}"
            );
            tb.put_items(rows(&["1", "2"], &["a", "b"])).unwrap();
            tb.delete_item(&hash_range("1", "a")).unwrap();

            let called: Vec<&str> = hooks.called.lock().iter().copied().collect();
            assert_eq!(
                called,
                vec!["config", "post_delete", "post_read", "post_write", "post_write_batch", "pre_write"]
            );
            assert_eq!(
                hooks.tables.lock().iter().cloned().collect::<Vec<_>>(),
                vec!["hash_range".to_string()]
            );
            registry.reset();
        }
    }

    #[test]
    fn test_audit_stamps_across_rewrites() {
        for flavor in FLAVORS {
            let registry = Arc::new(PluginRegistry::new());
            registry.register(TABLE_NAMESPACE, Arc::new(AuditPlugin::default()));
            let h = Harness::with_registry(flavor, registry);
            let tb = h.table("hash_range");

            tb.put_item_with(row("1", Some("a")), &PutOptions::user("foo"))
                .unwrap();
            let first = tb.get_item(&hash_range("1", "a")).unwrap().unwrap();
            assert_eq!(first["created_by"], Value::from("foo"));
            assert_eq!(first["modified_by"], Value::from("foo"));
            assert!(first["created_date"].as_str().unwrap().starts_with("20"));
            assert_eq!(first["modified_date"], first["created_date"]);

            tb.put_item_with(first.clone(), &PutOptions::user("bar"))
                .unwrap();
            let second = tb.get_item(&hash_range("1", "a")).unwrap().unwrap();
            assert_eq!(second["created_by"], Value::from("foo"), "{flavor:?}");
            assert_eq!(second["modified_by"], Value::from("bar"), "{flavor:?}");
            assert_eq!(second["created_date"], first["created_date"]);
            assert!(
                second["modified_date"].as_str().unwrap()
                    >= second["created_date"].as_str().unwrap()
            );
        }
    }

    #[test]
    fn test_audit_keeps_created_fields_for_fresh_rewrite() {
        for flavor in FLAVORS {
            let registry = Arc::new(PluginRegistry::new());
            registry.register(TABLE_NAMESPACE, Arc::new(AuditPlugin::default()));
            let h = Harness::with_registry(flavor, registry);
            let tb = h.table("hash_range");

            tb.put_item_with(row("1", Some("a")), &PutOptions::user("foo"))
                .unwrap();
            let first = tb.get_item(&hash_range("1", "a")).unwrap().unwrap();

            tb.put_item_with(row("1", Some("a")), &PutOptions::user("bar"))
                .unwrap();
            let second = tb.get_item(&hash_range("1", "a")).unwrap().unwrap();
            assert_eq!(second["created_by"], Value::from("foo"), "{flavor:?}");
            assert_eq!(second["created_date"], first["created_date"], "{flavor:?}");
            assert_eq!(second["modified_by"], Value::from("bar"), "{flavor:?}");

            tb.put_items_with(vec![row("1", Some("a"))], &PutOptions::user("baz"))
                .unwrap();
            let third = tb.get_item(&hash_range("1", "a")).unwrap().unwrap();
            assert_eq!(third["created_by"], Value::from("foo"), "{flavor:?}");
            assert_eq!(third["created_date"], first["created_date"], "{flavor:?}");
            assert_eq!(third["modified_by"], Value::from("baz"), "{flavor:?}");
        }
    }

    #[test]
    fn test_update_and_create_only() {
        for flavor in FLAVORS {
            let h = Harness::new(flavor);
            let tb = h.table("hash_range");
            let update = PutOptions {
                update: true,
                ..PutOptions::default()
            };
            let err = tb
                .put_item_with(item! { "hk" => "1", "rk" => "a", "num" => 6 }, &update)
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound, "{flavor:?}");

            tb.put_item(row("1", Some("a"))).unwrap();
            tb.put_item_with(item! { "hk" => "1", "rk" => "a", "num" => 6 }, &update)
                .unwrap();
            let mut expected = row("1", Some("a"));
            expected.insert("num".into(), Value::from(6));
            assert_eq!(tb.get_item(&hash_range("1", "a")).unwrap(), Some(expected));

            let create = PutOptions {
                create_only: true,
                ..PutOptions::default()
            };
            let err = tb.put_item_with(row("1", Some("a")), &create).unwrap_err();
            assert_eq!(err.to_string(), "validation error: item already exists");
            tb.put_item_with(row("1", Some("b")), &create).unwrap();
        }
    }

    #[test]
    fn test_missing_table_not_found_problem() {
        let h = Harness::new(Flavor::Dynamo);
        let tb = h.table("unknown");
        let err = tb.get_item(&hash_range("1", "a")).unwrap_err();
        assert!(err.to_string().contains("not found"));
        let problem = serde_json::to_value(err.to_problem()).unwrap();
        assert_eq!(
            problem,
            serde_json::json!({"title": "not found", "detail": null, "status": 404, "type": null})
        );
    }

    #[test]
    fn test_cosmos_hides_missing_container() {
        let h = Harness::new(Flavor::Cosmos);
        let tb = h.table("unknown");
        assert_eq!(tb.get_item(&hash_range("1", "a")).unwrap(), None);
    }

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl Backend for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn get_item(&self, _key: &Key) -> Result<Option<Item>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }

        fn put_item(&self, _item: &Item) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn delete_item(&self, _key: &Key) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn query(
            &self,
            _key: &Conditions,
            _filters: &Conditions,
            _limit: Option<usize>,
            _resume: Option<serde_json::Value>,
        ) -> Result<Page> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Page::default())
        }

        fn query_sql(
            &self,
            _statement: &str,
            _parameters: &Parameters,
            _limit: Option<usize>,
            _resume: Option<serde_json::Value>,
        ) -> Result<Page> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Page::default())
        }
    }

    #[test]
    fn test_invalid_input_never_reaches_backend() {
        let backend = Arc::new(Counting::default());
        let db = Database::new(Arc::new(PluginRegistry::new())).with_env(Env::empty());
        let config = TableConfig {
            database_client: Some(DatabaseClient::Backend(backend.clone())),
            ..TableConfig::with_key_attrs(["hk", "rk"])
        };
        let tb = db.table_with("hash_range", Some(config), None).unwrap();
        assert_eq!(tb.backend_name(), "counting");
        let params = conditions(&[("@hk", Value::from("1"))]);

        let failures = [
            tb.query_sql("DELETE FROM hash_range WHERE hk = @hk", Some(&params), None, None)
                .unwrap_err(),
            tb.query_sql("SELECT * FROM hash_range WHERE hk = @hk AND rk = @rk", Some(&params), None, None)
                .unwrap_err(),
            tb.query_sql("SELECT * FROM hash_range", Some(&params), None, None)
                .unwrap_err(),
            tb.query(&conditions(&[("h k", Value::from("1"))]), None, None, None)
                .unwrap_err(),
            tb.query(&conditions(&[("num", Value::from(1))]), None, None, None)
                .unwrap_err(),
            tb.query(&Conditions::new(), None, None, Some("!!"))
                .unwrap_err(),
            tb.query(&Conditions::new(), None, Some(0), None)
                .unwrap_err(),
            tb.put_item(item! { "hk" => "1" }).unwrap_err(),
            tb.get_item(&Key::hash("hk", "1")).unwrap_err(),
            tb.delete_item(&Key::hash("hk", "1").range("other", "x"))
                .unwrap_err(),
        ];
        for err in &failures {
            assert_eq!(err.kind(), ErrorKind::Validation, "{err}");
        }
        assert_eq!(
            failures[1].to_string(),
            "validation error: missing parameters: @rk"
        );
        assert_eq!(
            failures[2].to_string(),
            "validation error: missing parameters: @hk"
        );
        assert_eq!(
            failures[7].to_string(),
            "validation error: missing key attributes: rk"
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    struct FailingSink(&'static str);

    impl PostWriteHook for FailingSink {
        fn post_write(&self, _table: &str, _item: &Item) -> anyhow::Result<()> {
            anyhow::bail!("sink unavailable")
        }
    }

    impl TablePlugin for FailingSink {
        fn name(&self) -> &str {
            self.0
        }

        fn version(&self) -> &str {
            "0.1.0"
        }

        fn register(self: Arc<Self>, hooks: &mut HookRegistrar<'_>) -> anyhow::Result<()> {
            hooks.post_write(self);
            Ok(())
        }
    }

    #[test]
    fn test_post_write_failure_after_commit() {
        for flavor in FLAVORS {
            let registry = Arc::new(PluginRegistry::new());
            registry.register(TABLE_NAMESPACE, Arc::new(FailingSink("kafka")));
            registry.register(TABLE_NAMESPACE, Arc::new(FailingSink("sns")));
            let h = Harness::with_registry(flavor, registry);
            let tb = h.table("hash_range");

            let err = tb.put_item(row("1", Some("a"))).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Plugin);
            assert_eq!(err.to_string(), "plugin error: post_write hooks of kafka, sns failed");
            assert_eq!(err.to_problem().detail, None);
            assert!(tb.get_item(&hash_range("1", "a")).unwrap().is_some(), "{flavor:?}");
        }
    }

    #[test]
    fn test_deserializer_choice() {
        let ts = chrono::DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let h = Harness::new(Flavor::Memory);
        let tb = h.table("hash_range");
        tb.put_item(item! { "hk" => "1", "rk" => "a", "at" => ts }).unwrap();
        let item = tb.get_item(&hash_range("1", "a")).unwrap().unwrap();
        assert_eq!(item["at"], Value::from("2024-01-02T03:04:05Z"));

        let config = TableConfig {
            database_client: Some(DatabaseClient::Memory(h.store.clone())),
            deserializer: Some(Arc::new(PreserveTypes)),
            ..TableConfig::with_key_attrs(["hk", "rk"])
        };
        let tb = h.db.table_with("hash_range", Some(config), None).unwrap();
        let item = tb.get_item(&hash_range("1", "a")).unwrap().unwrap();
        assert_eq!(item["at"], Value::Timestamp(ts));
    }

    #[test]
    fn test_backend_selection_order() {
        let registry = Arc::new(PluginRegistry::new());
        let env = |pairs: &[(&str, &str)]| {
            Env::from_map(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )
        };
        let config = || Some(TableConfig::with_key_attrs(["hk"]));

        let db = Database::new(registry.clone()).with_env(Env::empty());
        let err = db.table_with("t", config(), None).err().unwrap();
        assert_eq!(err.to_string(), "configuration error: no database backend selected");

        let db = Database::new(registry.clone()).with_env(env(&[("ABNOSQL_DB", "memory")]));
        assert_eq!(db.table_with("t", config(), None).unwrap().backend_name(), "memory");

        let db = Database::new(registry.clone()).with_env(env(&[("AWS_REGION", "eu-west-1")]));
        let err = db.table_with("t", config(), None).err().unwrap();
        assert_eq!(
            err.to_string(),
            "configuration error: dynamodb client not provided for region eu-west-1"
        );

        let settings = Settings {
            database: Some(BackendKind::Memory),
            ..Settings::default()
        };
        let db = Database::new(registry.clone())
            .with_env(env(&[("ABNOSQL_DB", "cosmos")]))
            .with_settings(settings);
        assert_eq!(db.table_with("t", config(), None).unwrap().backend_name(), "memory");

        let db = Database::new(registry).with_env(env(&[("ABNOSQL_DB", "memory")]));
        let err = db
            .table_with("t", config(), Some(BackendKind::Cosmos))
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "configuration error: missing config: account, credential, database"
        );
    }

    #[test]
    fn test_key_attrs_from_env_and_settings() {
        let registry = Arc::new(PluginRegistry::new());
        let env = Env::from_map(
            [("ABNOSQL_KEY_ATTRS".to_string(), "hk,rk".to_string())].into(),
        );
        let db = Database::new(registry.clone()).with_env(env);
        let tb = db.table_with("t", None, Some(BackendKind::Memory)).unwrap();
        assert_eq!(tb.config().key_attrs, vec!["hk", "rk"]);

        let mut settings = Settings::default();
        settings
            .tables
            .insert("t".into(), TableConfig::with_key_attrs(["id"]));
        let db = Database::new(registry)
            .with_env(Env::empty())
            .with_settings(settings);
        let tb = db.table_with("t", None, Some(BackendKind::Memory)).unwrap();
        tb.put_item(item! { "id" => "x" }).unwrap();
        assert!(tb.get_item(&Key::hash("id", "x")).unwrap().is_some());
    }
}
