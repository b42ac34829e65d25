/// Plugin architecture for extending tables.
///
/// Plugins attach cross-cutting behavior (config injection, audit
/// stamping, post-processing, notifications) to every table operation
/// without the core knowing about them. The registry is an explicit object
/// owned by the composition root and handed to each [`Database`]; nothing
/// here is process-global.
///
/// [`Database`]: crate::table::Database
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::Settings;
use crate::error::{Error, Result};

pub mod audit;
pub mod hooks;

pub use audit::AuditPlugin;
pub use hooks::{
    ConfigProvider, HookRegistrar, HookSet, PluginInfo, PostDeleteHook, PostReadHook,
    PostWriteBatchHook, PostWriteHook, PreWriteHook, WriteContext,
};

/// Namespace of table plugins.
pub const TABLE_NAMESPACE: &str = "table";

/// Trait that all table plugins must implement.
///
/// A plugin registers the hook capabilities it implements during
/// discovery, which runs once per namespace.
///
/// # Example
///
/// ```ignore
/// struct Redact;
///
/// impl PostReadHook for Redact { /* ... */ }
///
/// impl TablePlugin for Redact {
///     fn name(&self) -> &str { "redact" }
///     fn version(&self) -> &str { "0.1.0" }
///     fn register(self: Arc<Self>, hooks: &mut HookRegistrar<'_>) -> anyhow::Result<()> {
///         hooks.post_read(self);
///         Ok(())
///     }
/// }
/// ```
pub trait TablePlugin: Send + Sync {
    /// Unique plugin identifier.
    fn name(&self) -> &str;

    /// Plugin version string.
    fn version(&self) -> &str;

    /// Optional description.
    fn description(&self) -> &str {
        ""
    }

    /// Register hook capabilities.
    fn register(self: Arc<Self>, hooks: &mut HookRegistrar<'_>) -> anyhow::Result<()>;
}

/// Central registry of plugins, with discovered hooks cached per namespace.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Mutex<BTreeMap<String, Vec<Arc<dyn TablePlugin>>>>,
    cache: RwLock<HashMap<String, Arc<HookSet>>>,
    discovery: Mutex<()>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in plugins enabled in `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        let registry = Self::new();
        if settings.audit.enabled {
            registry.register(
                TABLE_NAMESPACE,
                Arc::new(AuditPlugin::from_settings(&settings.audit)),
            );
        }
        registry
    }

    /// Add a plugin. A namespace already discovered is discovered again on
    /// next use.
    pub fn register(&self, namespace: &str, plugin: Arc<dyn TablePlugin>) {
        let _discovery = self.discovery.lock();
        tracing::debug!(namespace, plugin = plugin.name(), "registering plugin");
        self.plugins
            .lock()
            .entry(namespace.to_string())
            .or_default()
            .push(plugin);
        self.cache.write().remove(namespace);
    }

    /// Hooks of `namespace`, discovering them on first use.
    pub fn hooks(&self, namespace: &str) -> Result<Arc<HookSet>> {
        if let Some(hooks) = self.cache.read().get(namespace) {
            return Ok(hooks.clone());
        }

        let _discovery = self.discovery.lock();
        if let Some(hooks) = self.cache.read().get(namespace) {
            return Ok(hooks.clone());
        }

        let plugins = self
            .plugins
            .lock()
            .get(namespace)
            .cloned()
            .unwrap_or_default();
        let mut set = HookSet::new();
        for plugin in plugins {
            let info = PluginInfo {
                name: plugin.name().to_string(),
                version: plugin.version().to_string(),
                description: plugin.description().to_string(),
            };
            let mut registrar = HookRegistrar::new(&mut set, &info.name);
            plugin.register(&mut registrar).map_err(|e| Error::Plugin {
                message: format!("plugin {} failed to register", info.name),
                source: Some(e.into()),
            })?;
            set.record_plugin(info);
        }
        tracing::debug!(namespace, plugins = set.plugins().len(), "discovered plugins");

        let set = Arc::new(set);
        self.cache
            .write()
            .insert(namespace.to_string(), set.clone());
        Ok(set)
    }

    /// Plugins discovered for `namespace`.
    pub fn loaded_plugins(&self, namespace: &str) -> Result<Vec<PluginInfo>> {
        Ok(self.hooks(namespace)?.plugins().to_vec())
    }

    /// Drop every registration and cached discovery. For test harnesses
    /// that share a registry between scenarios.
    pub fn reset(&self) {
        let _discovery = self.discovery.lock();
        self.plugins.lock().clear();
        self.cache.write().clear();
    }
}
