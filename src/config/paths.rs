//! Canonical default locations.
//!
//! Single source of truth for where state lives when nothing is configured.
//!
//! | Location | Purpose |
//! |----------|---------|
//! | `~/.callflow/callflow.db` | Call record store (SQLite) |
//! | `~/.callflow/recordings/` | Stored audio files |
//! | `~/.callflow/jobs.jsonl` | Analysis task queue |

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Directory searched for `config.yaml`
pub const CONFIG_DIR: &str = ".callflow";

/// Config file name inside [`CONFIG_DIR`]
pub const CONFIG_FILE: &str = "config.yaml";

pub const DATABASE_FILE: &str = "callflow.db";
pub const RECORDINGS_DIR: &str = "recordings";
pub const QUEUE_FILE: &str = "jobs.jsonl";

/// Default home (~/.callflow)
pub fn default_home() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR))
}

pub fn database(home: &Path) -> PathBuf {
    home.join(DATABASE_FILE)
}

pub fn recordings(home: &Path) -> PathBuf {
    home.join(RECORDINGS_DIR)
}

pub fn queue(home: &Path) -> PathBuf {
    home.join(QUEUE_FILE)
}
