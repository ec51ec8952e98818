//! Session snapshots for save and restore
//!
//! A snapshot is an opaque bundle: the orchestrator and its agents decide
//! what goes in. The store only promises durable round-trips; the core's
//! own dispatch, cache, and recovery state always restarts empty on
//! restore.

use chrono::{DateTime, Local};
use loremaster_config::paths::safe_filename;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One saved table session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Snapshot key, chosen by the caller
    pub key: String,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
    /// Whatever the table and its agents chose to serialize
    #[serde(default)]
    pub bundle: HashMap<String, serde_json::Value>,
}

impl SessionSnapshot {
    /// Start an empty snapshot
    pub fn new(key: impl Into<String>) -> Self {
        let now = Local::now();
        Self {
            key: key.into(),
            created_at: now,
            updated_at: now,
            bundle: HashMap::new(),
        }
    }

    /// Contribute one piece of state to the bundle
    pub fn put(&mut self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(value) = serde_json::to_value(value) {
            self.bundle.insert(key.into(), value);
            self.updated_at = Local::now();
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.bundle.get(key)
    }
}

/// Directory-backed snapshot store
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).ok();
        Self { dir }
    }

    /// Save a snapshot
    pub async fn save(&self, snapshot: &SessionSnapshot) -> std::io::Result<()> {
        let path = self.snapshot_path(&snapshot.key);
        let content = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(path, content).await?;
        debug!("saved snapshot: {}", snapshot.key);
        Ok(())
    }

    /// Load a snapshot; a missing or unreadable file is `None`
    pub async fn load(&self, key: &str) -> Option<SessionSnapshot> {
        let path = self.snapshot_path(key);
        if !path.exists() {
            return None;
        }

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<SessionSnapshot>(&content) {
                Ok(snapshot) => {
                    debug!("loaded snapshot: {}", key);
                    Some(snapshot)
                }
                Err(e) => {
                    warn!("failed to parse snapshot {}: {}", key, e);
                    None
                }
            },
            Err(e) => {
                warn!("failed to read snapshot {}: {}", key, e);
                None
            }
        }
    }

    /// Delete a snapshot; true if something was removed
    pub async fn delete(&self, key: &str) -> std::io::Result<bool> {
        let path = self.snapshot_path(key);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// List all snapshot keys
    pub async fn list(&self) -> Vec<String> {
        let mut keys = Vec::new();

        if let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Some(name) = entry.file_name().to_str() {
                    if let Some(stripped) = name.strip_suffix(".json") {
                        keys.push(stripped.to_string());
                    }
                }
            }
        }

        keys.sort();
        keys
    }

    fn snapshot_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_filename(key)))
    }
}
