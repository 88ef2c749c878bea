use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid storage namespace: {0:?}")]
    InvalidNamespace(String),
}

/// Whether a store survives the session, and under which namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistencePolicy {
    Ephemeral,
    Persist { namespace: String },
}

impl PersistencePolicy {
    pub fn persist(namespace: impl Into<String>) -> Self {
        PersistencePolicy::Persist {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            PersistencePolicy::Ephemeral => None,
            PersistencePolicy::Persist { namespace } => Some(namespace),
        }
    }
}

/// String key/value store for session state, one JSON document per namespace.
pub trait Storage {
    fn load(&self, namespace: &str) -> Result<Option<String>, PersistError>;
    fn save(&mut self, namespace: &str, value: &str) -> Result<(), PersistError>;
    fn remove(&mut self, namespace: &str) -> Result<(), PersistError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    items: HashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.items.contains_key(namespace)
    }
}

impl Storage for MemoryStorage {
    fn load(&self, namespace: &str) -> Result<Option<String>, PersistError> {
        Ok(self.items.get(namespace).cloned())
    }

    fn save(&mut self, namespace: &str, value: &str) -> Result<(), PersistError> {
        self.items.insert(namespace.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, namespace: &str) -> Result<(), PersistError> {
        self.items.remove(namespace);
        Ok(())
    }
}

/// `<dir>/<namespace>.json` per namespace.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, namespace: &str) -> Result<PathBuf, PersistError> {
        let valid = !namespace.is_empty()
            && namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PersistError::InvalidNamespace(namespace.to_string()));
        }
        Ok(self.dir.join(format!("{namespace}.json")))
    }
}

impl Storage for FileStorage {
    fn load(&self, namespace: &str) -> Result<Option<String>, PersistError> {
        let path = self.path_for(namespace)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&mut self, namespace: &str, value: &str) -> Result<(), PersistError> {
        let path = self.path_for(namespace)?;
        fs::create_dir_all(&self.dir)?;
        // Atomic replace.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), bytes = value.len(), "state saved");
        Ok(())
    }

    fn remove(&mut self, namespace: &str) -> Result<(), PersistError> {
        let path = self.path_for(namespace)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_round_trip() {
        let mut storage = MemoryStorage::new();
        assert_eq!(storage.load("indicator-data").unwrap(), None);
        storage.save("indicator-data", "{}").unwrap();
        assert_eq!(storage.load("indicator-data").unwrap().as_deref(), Some("{}"));
        storage.remove("indicator-data").unwrap();
        assert!(!storage.contains("indicator-data"));
    }

    #[test]
    fn file_storage_writes_one_file_per_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().join("state"));
        assert_eq!(storage.load("indicator-data").unwrap(), None);

        storage.save("indicator-data", r#"{"a":1}"#).unwrap();
        storage.save("layout", "[]").unwrap();
        assert!(dir.path().join("state/indicator-data.json").exists());
        assert_eq!(storage.load("layout").unwrap().as_deref(), Some("[]"));

        storage.remove("layout").unwrap();
        storage.remove("layout").unwrap();
        assert_eq!(storage.load("layout").unwrap(), None);
        assert!(storage.load("indicator-data").unwrap().is_some());
    }

    #[test]
    fn file_storage_rejects_path_like_namespaces() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path());
        assert!(matches!(
            storage.save("../escape", "x"),
            Err(PersistError::InvalidNamespace(_))
        ));
        assert!(storage.load("").is_err());
    }

    #[test]
    fn policy_namespace() {
        assert_eq!(PersistencePolicy::Ephemeral.namespace(), None);
        assert_eq!(
            PersistencePolicy::persist("indicator-data").namespace(),
            Some("indicator-data")
        );
    }
}
