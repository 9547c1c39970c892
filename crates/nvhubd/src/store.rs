//! Small JSON key-value store for hub settings that survive restarts.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct KvStore {
    path: PathBuf,
}

impl KvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads one key. A missing file or key is `Ok(None)`; a value that does not
    /// decode as `T` is an error so callers can decide how to recover.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let map = self.read_map()?;
        let Some(value) = map.get(key) else {
            return Ok(None);
        };
        serde_json::from_value(value.clone())
            .map(Some)
            .with_context(|| format!("failed to decode '{key}' from {}", self.path.display()))
    }

    /// Replaces one key and rewrites the whole file atomically.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut map = match self.read_map() {
            Ok(map) => map,
            Err(err) => {
                warn!("discarding unreadable key-value store: {err:#}");
                Map::new()
            }
        };
        let value = serde_json::to_value(value)
            .with_context(|| format!("failed to serialize '{key}'"))?;
        map.insert(key.to_string(), value);
        let data = serde_json::to_string_pretty(&Value::Object(map))
            .context("failed to serialize key-value store")?;
        atomic_write_file(&self.path, data.as_bytes())
    }

    fn read_map(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read state file: {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Map::new());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse state file: {}", self.path.display()))
    }
}

pub fn atomic_write_file(target: &Path, data: &[u8]) -> Result<()> {
    let parent = target
        .parent()
        .with_context(|| format!("cannot determine parent directory for {}", target.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    let tmp_path = target.with_extension("tmp");
    fs::write(&tmp_path, data)
        .with_context(|| format!("failed to write temporary file: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, target).with_context(|| {
        format!(
            "failed to rename {} to {}",
            tmp_path.display(),
            target.display()
        )
    })?;
    Ok(())
}
