//! Path utilities for the Loremaster vault

use std::path::PathBuf;

/// Loremaster data vault (~/.loremaster)
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .expect("failed to locate a home directory")
        .join(".loremaster")
}

/// Table configuration location
pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Saved session snapshots
pub fn snapshots_dir() -> PathBuf {
    data_dir().join("snapshots")
}

/// Ensure directory exists
pub async fn ensure_dir(path: &PathBuf) -> std::io::Result<()> {
    tokio::fs::create_dir_all(path).await
}

/// Sanitize a name for use as a filename
pub fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            _ => c,
        })
        .collect()
}
