//! Key-value storage scopes for session credentials
//!
//! Two scopes exist: a durable one backed by a TOML file in the config
//! directory, and a session one that lives only as long as the process.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One atomic replacement batch. `None` removes the key.
pub type Batch<'a> = [(&'a str, Option<&'a str>)];

/// Synchronous key-value storage.
///
/// Reads never fail; a write either applies the whole batch or none of it.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn apply(&self, batch: &Batch<'_>) -> Result<()>;

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

fn apply_to_map(map: &mut BTreeMap<String, String>, batch: &Batch<'_>) {
    for (key, value) in batch {
        match value {
            Some(v) => {
                map.insert((*key).to_string(), (*v).to_string());
            }
            None => {
                map.remove(*key);
            }
        }
    }
}

/// Process-lifetime storage. Used for the session scope and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(key).cloned()
    }

    fn apply(&self, batch: &Batch<'_>) -> Result<()> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        apply_to_map(&mut guard, batch);
        Ok(())
    }
}

/// Durable storage mirrored to a TOML file.
///
/// The map is held in memory so that reads are served without touching
/// disk; every batch rewrites the file through a temp file + rename.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let map = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            inner: Mutex::new(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).context("Failed to create storage directory")?;
        }

        let content = toml::to_string_pretty(map).context("Failed to serialize credentials")?;
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, content).context("Failed to write credentials file")?;

        // Restrictive permissions: the file holds bearer credentials
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&tmp, perms).context("Failed to set credentials permissions")?;
        }

        fs::rename(&tmp, &self.path).context("Failed to replace credentials file")?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(key).cloned()
    }

    fn apply(&self, batch: &Batch<'_>) -> Result<()> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = guard.clone();
        apply_to_map(&mut next, batch);
        // Only publish the new map once it is on disk.
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }
}
