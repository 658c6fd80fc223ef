//! On-device key-value storage and the local project store built on it.

#[cfg(test)]
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
#[cfg(test)]
use std::sync::Mutex;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use tracing::{debug, warn};

use super::error::LocalStorageError;
use crate::models::{ProjectAggregate, ProjectSummary};

pub trait LocalStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, LocalStorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), LocalStorageError>;
    fn remove(&self, key: &str) -> Result<(), LocalStorageError>;
    fn keys(&self) -> Result<Vec<String>, LocalStorageError>;
}

const FILE_SUFFIX: &str = ".json";

/// One JSON file per key under a data directory. File names are the URL-safe
/// base64 form of the key, so any key maps to a single plain file.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, LocalStorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(FileStorage { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, LocalStorageError> {
        if key.is_empty() {
            return Err(LocalStorageError::InvalidKey(key.to_string()));
        }
        let name = URL_SAFE_NO_PAD.encode(key.as_bytes());
        Ok(self.dir.join(format!("{name}{FILE_SUFFIX}")))
    }
}

fn key_from_file_name(name: &str) -> Option<String> {
    let encoded = name.strip_suffix(FILE_SUFFIX)?;
    let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

impl LocalStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, LocalStorageError> {
        match fs::read_to_string(self.path_for(key)?) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LocalStorageError> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp)?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;

        debug!(key, bytes = value.len(), "stored locally");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), LocalStorageError> {
        match fs::remove_file(self.path_for(key)?) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn keys(&self) -> Result<Vec<String>, LocalStorageError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            match entry.file_name().to_str().and_then(key_from_file_name) {
                Some(key) => keys.push(key),
                None => debug!(file = ?entry.file_name(), "skipping foreign file"),
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

#[cfg(test)]
impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl LocalStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, LocalStorageError> {
        Ok(self.entries.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), LocalStorageError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), LocalStorageError> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, LocalStorageError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect())
    }
}

const INDEX_KEY: &str = "project-index";
const PROJECT_KEY_PREFIX: &str = "project:";

fn project_key(id: &str) -> String {
    format!("{PROJECT_KEY_PREFIX}{id}")
}

/// Project aggregates on the device, with a summary index so listing never
/// loads every aggregate.
#[derive(Clone)]
pub struct LocalProjectStore {
    storage: Arc<dyn LocalStorage>,
}

impl LocalProjectStore {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self { storage }
    }

    pub fn save(&self, aggregate: &ProjectAggregate) -> Result<(), LocalStorageError> {
        let json = serde_json::to_string(aggregate)?;
        self.storage.set(&project_key(aggregate.id()), &json)?;

        let mut index = self.list()?;
        let summary = aggregate.header.summary();
        match index.iter_mut().find(|s| s.id == summary.id) {
            Some(existing) => *existing = summary,
            None => index.push(summary),
        }
        self.write_index(&index)
    }

    pub fn load(&self, id: &str) -> Result<Option<ProjectAggregate>, LocalStorageError> {
        let Some(json) = self.storage.get(&project_key(id))? else {
            return Ok(None);
        };
        // Deserializing goes through the schema migration.
        Ok(Some(serde_json::from_str(&json)?))
    }

    pub fn delete(&self, id: &str) -> Result<(), LocalStorageError> {
        self.storage.remove(&project_key(id))?;

        let mut index = self.list()?;
        index.retain(|s| s.id != id);
        self.write_index(&index)
    }

    /// Summaries from the index, most recently updated first.
    pub fn list(&self) -> Result<Vec<ProjectSummary>, LocalStorageError> {
        let Some(json) = self.storage.get(INDEX_KEY)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Vec<ProjectSummary>>(&json) {
            Ok(mut index) => {
                sort_summaries(&mut index);
                Ok(index)
            }
            Err(err) => {
                warn!(error = %err, "project index is corrupt, rebuilding it");
                self.rebuild_index()
            }
        }
    }

    /// Recreate the index from the stored aggregates themselves.
    fn rebuild_index(&self) -> Result<Vec<ProjectSummary>, LocalStorageError> {
        let mut index = Vec::new();
        for key in self.storage.keys()? {
            let Some(id) = key.strip_prefix(PROJECT_KEY_PREFIX) else {
                continue;
            };
            match self.load(id) {
                Ok(Some(aggregate)) => index.push(aggregate.header.summary()),
                Ok(None) => {}
                Err(err) => warn!(project_id = id, error = %err, "skipping unreadable project"),
            }
        }
        sort_summaries(&mut index);
        self.write_index(&index)?;
        Ok(index)
    }

    fn write_index(&self, index: &[ProjectSummary]) -> Result<(), LocalStorageError> {
        self.storage.set(INDEX_KEY, &serde_json::to_string(index)?)
    }
}

fn sort_summaries(index: &mut [ProjectSummary]) {
    index.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}
