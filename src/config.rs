//! Configuration for the attestor.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (ATTESTOR_HOME, ATTESTOR_LEDGER_URL, ATTESTOR_REPLICA_ID)
//! 2. Config file (.attestor/config.yaml)
//! 3. Defaults (~/.attestor)
//!
//! Config file discovery:
//! - Searches current directory and parents for .attestor/config.yaml
//! - Paths in config file are relative to the .attestor/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::ReconcilerConfig;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub replica_id: Option<String>,
    #[serde(default)]
    pub ledger: Option<LedgerConfig>,
    #[serde(default)]
    pub reconcile: Option<ReconcilerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .attestor/)
    pub home: Option<String>,
    /// SQLite database (relative to home)
    pub database: Option<String>,
    /// Update log (relative to home)
    pub update_log: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub endpoint: Option<String>,
    pub request_timeout_ms: Option<u64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// SQLite record store
    pub database: PathBuf,
    /// Append-only log of accepted updates
    pub update_log: PathBuf,
    /// Name this replica logs under
    pub replica_id: String,
    /// Ledger HTTP endpoint; None means no remote ledger is configured
    pub ledger_endpoint: Option<String>,
    pub ledger_request_timeout_ms: u64,
    pub reconcile: ReconcilerConfig,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    pub fn ledger_request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ledger_request_timeout_ms)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".attestor").join("config.yaml");
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
    }
}

/// Combine file settings, environment and defaults
fn resolve(
    config_file: Option<PathBuf>,
    file: ConfigFile,
    default_home: PathBuf,
    env: impl Fn(&str) -> Option<String>,
) -> ResolvedConfig {
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."))
        .to_path_buf();

    let home = if let Some(env_home) = env("ATTESTOR_HOME") {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = file.paths.home {
        resolve_path(&config_dir, home_path)
    } else {
        default_home
    };

    let database = file
        .paths
        .database
        .as_deref()
        .map(|p| resolve_path(&home, p))
        .unwrap_or_else(|| home.join("evidence.db"));

    let update_log = file
        .paths
        .update_log
        .as_deref()
        .map(|p| resolve_path(&home, p))
        .unwrap_or_else(|| home.join("updates.jsonl"));

    let replica_id = env("ATTESTOR_REPLICA_ID")
        .or(file.replica_id)
        .unwrap_or_else(|| "local".to_string());

    let ledger_endpoint = env("ATTESTOR_LEDGER_URL")
        .or_else(|| file.ledger.as_ref().and_then(|l| l.endpoint.clone()))
        .filter(|url| !url.trim().is_empty());

    let ledger_request_timeout_ms = file
        .ledger
        .as_ref()
        .and_then(|l| l.request_timeout_ms)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);

    ResolvedConfig {
        home,
        database,
        update_log,
        replica_id,
        ledger_endpoint,
        ledger_request_timeout_ms,
        reconcile: file.reconcile.unwrap_or_default(),
        config_file,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".attestor");

    let config_file = find_config_file();
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    Ok(resolve(config_file, file, default_home, |key| std::env::var(key).ok()))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration, bypassing the cache
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
