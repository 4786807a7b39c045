//! Configuration for the calls pipeline.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CALLFLOW_HOME, CALLFLOW_DATABASE, S3_*, ...)
//! 2. Config file (.callflow/config.yaml)
//! 3. Defaults (~/.callflow)
//!
//! Config file discovery:
//! - Searches the start directory and its parents for .callflow/config.yaml
//! - `paths.home` is relative to the .callflow/ directory, other paths are
//!   relative to the project root (the parent of .callflow/)
//!
//! Settings are resolved once at process start and passed down explicitly.

pub mod paths;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::ObjectStorageConfig;
use crate::ingest::{AnalysisConfig, QueueConfig, WorkerConfig};

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub object_storage: ObjectStorageConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .callflow/)
    pub home: Option<String>,
    /// SQLite database file (relative to project root)
    pub database: Option<String>,
    /// Directory holding stored recordings (relative to project root)
    pub recordings: Option<String>,
    /// Task queue log (relative to project root)
    pub queue: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct Settings {
    pub home: PathBuf,
    pub database: PathBuf,
    pub recordings_dir: PathBuf,
    pub queue_path: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub analysis: AnalysisConfig,
    pub object_storage: ObjectStorageConfig,
}

impl Settings {
    /// Settings rooted at `home` with every other value defaulted
    pub fn rooted_at(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            database: paths::database(&home),
            recordings_dir: paths::recordings(&home),
            queue_path: paths::queue(&home),
            home,
            config_file: None,
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            analysis: AnalysisConfig::default(),
            object_storage: ObjectStorageConfig::default(),
        }
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(paths::CONFIG_DIR).join(paths::CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Apply S3_* environment overrides
fn apply_object_storage_env<F>(config: &mut ObjectStorageConfig, env: &F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = env("S3_ENABLED") {
        config.enabled =
            parse_bool(&v).with_context(|| format!("Invalid S3_ENABLED value: {v:?}"))?;
    }
    if let Some(v) = env("S3_SECURE") {
        config.secure =
            parse_bool(&v).with_context(|| format!("Invalid S3_SECURE value: {v:?}"))?;
    }
    if let Some(v) = env("S3_ENDPOINT_URL") {
        config.endpoint_url = Some(v);
    }
    if let Some(v) = env("S3_ACCESS_KEY") {
        config.access_key = Some(v);
    }
    if let Some(v) = env("S3_SECRET_KEY") {
        config.secret_key = Some(v);
    }
    if let Some(v) = env("S3_BUCKET") {
        config.bucket = Some(v);
    }
    if let Some(v) = env("S3_REGION") {
        config.region = v;
    }
    Ok(())
}

/// Load configuration from the current directory and process environment
pub fn load() -> Result<Settings> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_from(&cwd, |key| std::env::var(key).ok())
}

/// Load configuration starting discovery at `start`, reading env via `env`
pub fn load_from<F>(start: &Path, env: F) -> Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    let config_file = find_config_file(start);

    let (file, config_dir, base_dir) = match config_file {
        Some(ref config_path) => {
            let file = load_config_file(config_path)?;
            let dot_dir = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
            let root = dot_dir.parent().unwrap_or(Path::new(".")).to_path_buf();
            (file, Some(dot_dir), Some(root))
        }
        None => (ConfigFile::default(), None, None),
    };

    let home = if let Some(env_home) = env("CALLFLOW_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(home), Some(dir)) = (file.paths.home.as_deref(), config_dir.as_deref()) {
        resolve_path(dir, home)
    } else {
        paths::default_home()?
    };

    let pick = |env_key: &str, from_file: Option<&str>, default: PathBuf| -> PathBuf {
        if let Some(v) = env(env_key) {
            PathBuf::from(v)
        } else if let (Some(p), Some(root)) = (from_file, base_dir.as_deref()) {
            resolve_path(root, p)
        } else {
            default
        }
    };

    let database = pick(
        "CALLFLOW_DATABASE",
        file.paths.database.as_deref(),
        paths::database(&home),
    );
    let recordings_dir = pick(
        "CALLFLOW_RECORDINGS_DIR",
        file.paths.recordings.as_deref(),
        paths::recordings(&home),
    );
    let queue_path = pick(
        "CALLFLOW_QUEUE",
        file.paths.queue.as_deref(),
        paths::queue(&home),
    );

    let mut object_storage = file.object_storage;
    apply_object_storage_env(&mut object_storage, &env)?;

    Ok(Settings {
        home,
        database,
        recordings_dir,
        queue_path,
        config_file,
        queue: file.queue,
        worker: file.worker,
        analysis: file.analysis,
        object_storage,
    })
}
