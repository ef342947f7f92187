//! Registry store backed by a JSON file.

use peerlink_core::{RegistryEntry, RegistryStore, StoreError};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Keeps every entry in memory and rewrites the whole file on change.
///
/// Writes go to a sibling temp file that is then renamed over the
/// original, so a crash never leaves a half-written registry.
pub struct JsonFileRegistryStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, RegistryEntry>>,
}

impl JsonFileRegistryStore {
    /// Open (or lazily create) the registry at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => {
                let list: Vec<RegistryEntry> = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
                list.into_iter()
                    .map(|entry| (entry.id.to_string(), entry))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StoreError::Io(format!("{}: {e}", path.display()))),
        };
        tracing::debug!(path = %path.display(), entries = entries.len(), "opened registry");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, RegistryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, entries: &BTreeMap<String, RegistryEntry>) -> Result<(), StoreError> {
        let list: Vec<&RegistryEntry> = entries.values().collect();
        let bytes = serde_json::to_vec_pretty(&list).map_err(|e| StoreError::Io(e.to_string()))?;

        let io = |e: std::io::Error| StoreError::Io(format!("{}: {e}", self.path.display()));
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io)?;
        }
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = std::fs::File::create(&tmp).map_err(io)?;
        file.write_all(&bytes).map_err(io)?;
        file.sync_all().map_err(io)?;
        std::fs::rename(&tmp, &self.path).map_err(io)
    }
}

impl RegistryStore for JsonFileRegistryStore {
    fn save(&self, entry: RegistryEntry) -> Result<(), StoreError> {
        let mut entries = self.lock();
        let previous = entries.insert(entry.id.to_string(), entry.clone());
        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(prev) => entries.insert(prev.id.to_string(), prev),
                None => entries.remove(entry.id.as_str()),
            };
            return Err(e);
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<RegistryEntry>, StoreError> {
        Ok(self.lock().get(id).cloned())
    }

    fn all(&self) -> Result<Vec<RegistryEntry>, StoreError> {
        Ok(self.lock().values().cloned().collect())
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut entries = self.lock();
        let Some(previous) = entries.remove(id) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&entries) {
            entries.insert(id.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }
}
