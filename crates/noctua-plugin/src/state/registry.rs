//! Process-scoped registry of published state tables.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{PluginError, Result};
use crate::state::{StateType, Table, TableInfo};

/// Directory of every table published by the host or by plugins.
///
/// Names are unique, key types are immutable after registration, and the
/// registry keeps every added table alive for its own lifetime. Access is
/// internally synchronized.
#[derive(Default)]
pub struct TableRegistry {
    tables: RwLock<HashMap<String, Arc<dyn Table>>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// List every registered table with its key type
    pub fn list_tables(&self) -> Vec<TableInfo> {
        let tables = self.tables.read();
        let mut infos: Vec<TableInfo> = tables
            .values()
            .map(|t| TableInfo {
                name: t.name().to_string(),
                key_type: t.key_type(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Look up a table by name, checking the expected key type
    pub fn get_table(&self, name: &str, key_type: StateType) -> Result<Arc<dyn Table>> {
        let tables = self.tables.read();
        let table = tables.get(name).ok_or_else(|| {
            PluginError::compatibility(format!("table '{name}' does not exist"))
        })?;
        if table.key_type() != key_type {
            return Err(PluginError::compatibility(format!(
                "table '{name}' has key type {}, not {}",
                table.key_type().name(),
                key_type.name()
            )));
        }
        Ok(Arc::clone(table))
    }

    /// Register a table under its own name
    pub fn add_table(&self, table: Arc<dyn Table>) -> Result<()> {
        let name = table.name().to_string();
        let mut tables = self.tables.write();
        if tables.contains_key(&name) {
            return Err(PluginError::compatibility(format!(
                "table '{name}' is already registered"
            )));
        }
        tracing::info!(table = %name, key_type = table.key_type().name(), "registered state table");
        tables.insert(name, table);
        Ok(())
    }

    /// Whether a table with this name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    /// Drop a table from the directory; used when the publishing plugin is
    /// destroyed. Outstanding handles keep the storage alive but accessors
    /// of a plugin-owned table start failing once its publisher is gone.
    pub(crate) fn remove_table(&self, name: &str) -> Option<Arc<dyn Table>> {
        let removed = self.tables.write().remove(name);
        if removed.is_some() {
            tracing::info!(table = %name, "removed state table");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryTable;

    fn registry_with_proc() -> TableRegistry {
        let registry = TableRegistry::new();
        let table = InMemoryTable::new("proc", StateType::U64).with_field("comm", StateType::String);
        registry.add_table(Arc::new(table)).unwrap();
        registry
    }

    #[test]
    fn test_add_and_get() {
        let registry = registry_with_proc();
        let table = registry.get_table("proc", StateType::U64).unwrap();
        assert_eq!(table.name(), "proc");
        assert_eq!(table.list_fields().len(), 1);
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let registry = registry_with_proc();
        let dup = InMemoryTable::new("proc", StateType::U64);
        let err = registry.add_table(Arc::new(dup)).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_key_type_mismatch_is_rejected() {
        let registry = registry_with_proc();
        let err = registry.get_table("proc", StateType::String).unwrap_err();
        assert!(matches!(err, PluginError::Compatibility(_)));
        assert!(err.to_string().contains("uint64"));
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        let registry = registry_with_proc();
        assert!(registry.get_table("conn", StateType::U64).is_err());
    }

    #[test]
    fn test_listing() {
        let registry = registry_with_proc();
        registry
            .add_table(Arc::new(InMemoryTable::new("conn", StateType::String)))
            .unwrap();
        let infos = registry.list_tables();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].name, "conn");
        assert_eq!(infos[1].name, "proc");
        assert_eq!(infos[1].key_type, StateType::U64);
    }

    #[test]
    fn test_remove() {
        let registry = registry_with_proc();
        assert!(registry.remove_table("proc").is_some());
        assert!(!registry.contains("proc"));
        assert!(registry.remove_table("proc").is_none());
    }
}
