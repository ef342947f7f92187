//! In-process registry store.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::collab::RegistryStore;
use crate::error::StoreError;
use crate::peer::RegistryEntry;

/// Keeps entries in memory; lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    entries: Mutex<BTreeMap<String, RegistryEntry>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, RegistryEntry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Io("registry lock poisoned".to_string()))
    }
}

impl RegistryStore for MemoryRegistryStore {
    fn save(&self, entry: RegistryEntry) -> Result<(), StoreError> {
        self.lock()?.insert(entry.id.to_string(), entry);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<RegistryEntry>, StoreError> {
        Ok(self.lock()?.get(id).cloned())
    }

    fn all(&self) -> Result<Vec<RegistryEntry>, StoreError> {
        Ok(self.lock()?.values().cloned().collect())
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.lock()?.remove(id);
        Ok(())
    }
}
