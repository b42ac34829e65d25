/// Typed hook capabilities and their dispatch.
///
/// Each lifecycle point has its own trait. A plugin registers the ones it
/// implements through [`HookRegistrar`]; [`HookSet`] then applies the
/// dispatch rule of each hook:
///
/// | hook               | rule                                  |
/// |--------------------|---------------------------------------|
/// | `config`           | first non-empty result wins           |
/// | `pre_write`        | all, composed in registration order   |
/// | `post_read`        | first non-empty result wins           |
/// | `post_write`       | fan-out, failures collected           |
/// | `post_write_batch` | fan-out, failures collected           |
/// | `post_delete`      | fan-out, failures collected           |
use std::sync::Arc;

use crate::config::TableConfig;
use crate::error::{Error, Result};
use crate::value::{Item, Key};

/// Context handed to write hooks.
#[derive(Debug, Clone, Copy)]
pub struct WriteContext<'a> {
    pub table: &'a str,
    /// User the write is performed on behalf of, when known.
    pub audit_user: Option<&'a str>,
    /// Item currently stored under the same key.
    pub existing: Option<&'a Item>,
}

pub trait ConfigProvider: Send + Sync {
    /// Return a config to replace the table's effective configuration.
    fn config(&self, table: &str) -> anyhow::Result<Option<TableConfig>>;
}

pub trait PreWriteHook: Send + Sync {
    /// Return a transformed item, or `None` to leave it unchanged.
    fn pre_write(&self, ctx: &WriteContext<'_>, item: &Item) -> anyhow::Result<Option<Item>>;
}

pub trait PostReadHook: Send + Sync {
    /// Return an item to hand to the caller instead of the stored one.
    fn post_read(&self, table: &str, item: &Item) -> anyhow::Result<Option<Item>>;
}

pub trait PostWriteHook: Send + Sync {
    fn post_write(&self, table: &str, item: &Item) -> anyhow::Result<()>;
}

pub trait PostWriteBatchHook: Send + Sync {
    fn post_write_batch(&self, table: &str, items: &[Item]) -> anyhow::Result<()>;
}

pub trait PostDeleteHook: Send + Sync {
    fn post_delete(&self, table: &str, key: &Key) -> anyhow::Result<()>;
}

struct Registered<T: ?Sized> {
    plugin: String,
    hook: Arc<T>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}

/// Hook implementations discovered for one namespace.
#[derive(Default)]
pub struct HookSet {
    config: Vec<Registered<dyn ConfigProvider>>,
    pre_write: Vec<Registered<dyn PreWriteHook>>,
    post_read: Vec<Registered<dyn PostReadHook>>,
    post_write: Vec<Registered<dyn PostWriteHook>>,
    post_write_batch: Vec<Registered<dyn PostWriteBatchHook>>,
    post_delete: Vec<Registered<dyn PostDeleteHook>>,
    plugins: Vec<PluginInfo>,
}

/// Handed to a plugin while it registers; attributes hooks to the plugin.
pub struct HookRegistrar<'a> {
    set: &'a mut HookSet,
    plugin: String,
}

impl<'a> HookRegistrar<'a> {
    pub(crate) fn new(set: &'a mut HookSet, plugin: &str) -> Self {
        Self {
            set,
            plugin: plugin.to_string(),
        }
    }

    fn entry<T: ?Sized>(&self, hook: Arc<T>) -> Registered<T> {
        Registered {
            plugin: self.plugin.clone(),
            hook,
        }
    }

    pub fn config(&mut self, hook: Arc<dyn ConfigProvider>) {
        let entry = self.entry(hook);
        self.set.config.push(entry);
    }

    pub fn pre_write(&mut self, hook: Arc<dyn PreWriteHook>) {
        let entry = self.entry(hook);
        self.set.pre_write.push(entry);
    }

    pub fn post_read(&mut self, hook: Arc<dyn PostReadHook>) {
        let entry = self.entry(hook);
        self.set.post_read.push(entry);
    }

    pub fn post_write(&mut self, hook: Arc<dyn PostWriteHook>) {
        let entry = self.entry(hook);
        self.set.post_write.push(entry);
    }

    pub fn post_write_batch(&mut self, hook: Arc<dyn PostWriteBatchHook>) {
        let entry = self.entry(hook);
        self.set.post_write_batch.push(entry);
    }

    pub fn post_delete(&mut self, hook: Arc<dyn PostDeleteHook>) {
        let entry = self.entry(hook);
        self.set.post_delete.push(entry);
    }
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_plugin(&mut self, info: PluginInfo) {
        self.plugins.push(info);
    }

    pub fn plugins(&self) -> &[PluginInfo] {
        &self.plugins
    }

    pub fn has_pre_write(&self) -> bool {
        !self.pre_write.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.config.is_empty()
            && self.pre_write.is_empty()
            && self.post_read.is_empty()
            && self.post_write.is_empty()
            && self.post_write_batch.is_empty()
            && self.post_delete.is_empty()
    }

    pub fn resolve_config(&self, table: &str) -> Result<Option<TableConfig>> {
        for entry in &self.config {
            match entry.hook.config(table) {
                Ok(Some(config)) if !config.is_empty() => {
                    tracing::debug!(table, plugin = %entry.plugin, "config provided by hook");
                    return Ok(Some(config));
                }
                Ok(_) => {}
                Err(e) => return Err(Error::from_hook("config", &entry.plugin, e)),
            }
        }
        Ok(None)
    }

    pub fn pre_write(&self, ctx: &WriteContext<'_>, item: Item) -> Result<Item> {
        let mut item = item;
        for entry in &self.pre_write {
            match entry.hook.pre_write(ctx, &item) {
                Ok(Some(transformed)) => item = transformed,
                Ok(None) => {}
                Err(e) => return Err(Error::from_hook("pre_write", &entry.plugin, e)),
            }
        }
        Ok(item)
    }

    pub fn post_read(&self, table: &str, item: Item) -> Result<Item> {
        for entry in &self.post_read {
            match entry.hook.post_read(table, &item) {
                Ok(Some(replacement)) if !replacement.is_empty() => return Ok(replacement),
                Ok(_) => {}
                Err(e) => return Err(Error::from_hook("post_read", &entry.plugin, e)),
            }
        }
        Ok(item)
    }

    pub fn post_write(&self, table: &str, item: &Item) -> Result<()> {
        fan_out("post_write", &self.post_write, |hook| hook.post_write(table, item))
    }

    pub fn post_write_batch(&self, table: &str, items: &[Item]) -> Result<()> {
        fan_out("post_write_batch", &self.post_write_batch, |hook| {
            hook.post_write_batch(table, items)
        })
    }

    pub fn post_delete(&self, table: &str, key: &Key) -> Result<()> {
        fan_out("post_delete", &self.post_delete, |hook| hook.post_delete(table, key))
    }
}

/// Run every implementation; report all failures as one plugin error.
fn fan_out<T: ?Sized>(
    hook_name: &str,
    entries: &[Registered<T>],
    mut call: impl FnMut(&T) -> anyhow::Result<()>,
) -> Result<()> {
    let mut failures = Vec::new();
    for entry in entries {
        if let Err(e) = call(entry.hook.as_ref()) {
            tracing::warn!(hook = hook_name, plugin = %entry.plugin, error = %e, "hook failed");
            failures.push((entry.plugin.as_str(), e));
        }
    }
    match failures.len() {
        0 => Ok(()),
        1 => {
            let (plugin, e) = failures.remove(0);
            Err(Error::from_hook(hook_name, plugin, e))
        }
        _ => {
            let names: Vec<&str> = failures.iter().map(|(plugin, _)| *plugin).collect();
            let message = format!("{hook_name} hooks of {} failed", names.join(", "));
            let (_, first) = failures.remove(0);
            Err(Error::Plugin {
                message,
                source: Some(first.into()),
            })
        }
    }
}
