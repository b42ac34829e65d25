//! Audit stamping of written items.
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};

use crate::config::AuditSettings;
use crate::value::{Item, Value};

use super::hooks::{HookRegistrar, PreWriteHook, WriteContext};
use super::TablePlugin;

/// Pre-write hook that records who created and last modified an item.
///
/// `created_*` fields come from the stored item when there is one, so any
/// rewrite of a key keeps its creation stamp while `modified_*` advances.
#[derive(Debug, Clone)]
pub struct AuditPlugin {
    created_by: String,
    created_date: String,
    modified_by: String,
    modified_date: String,
}

impl Default for AuditPlugin {
    fn default() -> Self {
        Self::from_settings(&AuditSettings::default())
    }
}

impl AuditPlugin {
    pub fn from_settings(settings: &AuditSettings) -> Self {
        Self {
            created_by: settings.created_by.clone(),
            created_date: settings.created_date.clone(),
            modified_by: settings.modified_by.clone(),
            modified_date: settings.modified_date.clone(),
        }
    }

    fn stamp(&self, item: &mut Item, existing: Option<&Item>, user: Option<&str>, now: &str) {
        match existing.and_then(|stored| stored.get(&self.created_date)) {
            Some(created) => {
                item.insert(self.created_date.clone(), created.clone());
                match existing.and_then(|stored| stored.get(&self.created_by)) {
                    Some(by) => item.insert(self.created_by.clone(), by.clone()),
                    None => item.remove(&self.created_by),
                };
            }
            None if !item.contains_key(&self.created_date) => {
                item.insert(self.created_date.clone(), Value::from(now));
                if let Some(user) = user {
                    item.insert(self.created_by.clone(), Value::from(user));
                }
            }
            None => {}
        }
        item.insert(self.modified_date.clone(), Value::from(now));
        if let Some(user) = user {
            item.insert(self.modified_by.clone(), Value::from(user));
        }
    }
}

impl PreWriteHook for AuditPlugin {
    fn pre_write(&self, ctx: &WriteContext<'_>, item: &Item) -> anyhow::Result<Option<Item>> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut item = item.clone();
        self.stamp(&mut item, ctx.existing, ctx.audit_user, &now);
        Ok(Some(item))
    }
}

impl TablePlugin for AuditPlugin {
    fn name(&self) -> &str {
        "audit"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "stamps created/modified user and date on writes"
    }

    fn register(self: Arc<Self>, hooks: &mut HookRegistrar<'_>) -> anyhow::Result<()> {
        hooks.pre_write(self);
        Ok(())
    }
}
