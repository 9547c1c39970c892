//! Restart-recovery file listing every live instance.

use anyhow::{Context, Result};
use nvhub_types::LaunchRequest;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::normalize::Location;
use crate::store::atomic_write_file;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub id: Location,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
    pub last_access_time: u64,
    pub original_request: LaunchRequest,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the snapshot with `records`. No records means no file.
    pub fn save(&self, records: &[SnapshotRecord]) -> Result<()> {
        if records.is_empty() {
            return match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err).with_context(|| {
                    format!("failed to remove snapshot file: {}", self.path.display())
                }),
            };
        }
        let data = serde_json::to_string_pretty(records).context("failed to serialize snapshot")?;
        atomic_write_file(&self.path, data.as_bytes())
    }

    /// Reads the snapshot. A missing file is an empty list, and so is a corrupt
    /// one, after logging.
    pub fn load(&self) -> Vec<SnapshotRecord> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!("failed to read snapshot {}: {err}", self.path.display());
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    "ignoring corrupt snapshot {}: {err}",
                    self.path.display()
                );
                Vec::new()
            }
        }
    }
}
