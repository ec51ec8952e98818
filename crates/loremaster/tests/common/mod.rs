//! Common test utilities for Loremaster integration tests
#![allow(dead_code)]

use assert_cmd::Command;
use std::path::PathBuf;
use tempfile::{tempdir, TempDir};

/// Isolated vault so tests never touch the real ~/.loremaster
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub vault_dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempdir()?;
        let vault_dir = temp_dir.path().join(".loremaster");
        std::fs::create_dir_all(&vault_dir)?;

        Ok(Self {
            temp_dir,
            vault_dir,
        })
    }

    pub fn vault_file(&self, name: &str) -> PathBuf {
        self.vault_dir.join(name)
    }

    /// A command pointed at the isolated vault
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_lore"));
        cmd.env("HOME", self.temp_dir.path());
        cmd
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
