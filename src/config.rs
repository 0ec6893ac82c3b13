//! Config loading and persistence.
//!
//! Two TOML layers: a user file under the platform config dir and an
//! optional per-repo file at `<repo_root>/.cloudsync/config.toml`. The repo
//! layer wins field by field, then environment overrides are applied on top.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0:?}")]
    Missing(&'static str),
    #[error("invalid setting {name:?}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("failed to read {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("failed to write {path:?}: {reason}")]
    Write { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Repository identity shared by every clone syncing together. Required
    /// for any operation that talks to the service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reponame: Option<String>,
    /// Name of the remote path used as the backup destination; keys the
    /// local backed-up-heads cache.
    pub remote_path: String,
    pub sync: SyncConfig,
    pub autobackup: AutobackupConfig,
    pub subscription: SubscriptionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reponame: None,
            remote_path: "default".to_string(),
            sync: SyncConfig::default(),
            autobackup: AutobackupConfig::default(),
            subscription: SubscriptionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How many times a stale-version push is re-merged before surfacing a
    /// conflict.
    pub max_push_retries: u32,
    /// How long an explicit command waits for the backup lock.
    pub lock_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_push_retries: 3,
            lock_timeout_secs: 120,
        }
    }
}

impl SyncConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutobackupConfig {
    /// Master switch for unattended backup/sync. A temporary disable window
    /// is persisted separately (see `background`).
    pub enabled: bool,
}

impl Default for AutobackupConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub enabled: bool,
    /// Loopback port of the local notification daemon.
    pub daemon_port: u16,
    /// Where joined-workspace marker files live; defaults to the home dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub joined_dir: Option<PathBuf>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daemon_port: 15432,
            joined_dir: None,
        }
    }
}

/// Field-by-field override layer, as read from a single TOML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigLayer {
    pub reponame: Option<String>,
    pub remote_path: Option<String>,
    pub sync: SyncLayer,
    pub autobackup: AutobackupLayer,
    pub subscription: SubscriptionLayer,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncLayer {
    pub max_push_retries: Option<u32>,
    pub lock_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AutobackupLayer {
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubscriptionLayer {
    pub enabled: Option<bool>,
    pub daemon_port: Option<u16>,
    pub joined_dir: Option<PathBuf>,
}

impl Config {
    pub fn require_reponame(&self) -> Result<crate::refs::RepoName, ConfigError> {
        let name = self
            .reponame
            .as_deref()
            .ok_or(ConfigError::Missing("reponame"))?;
        crate::refs::RepoName::new(name).map_err(|err| ConfigError::Invalid {
            name: "reponame",
            reason: err.to_string(),
        })
    }

    fn apply_layer(&mut self, layer: ConfigLayer) {
        if layer.reponame.is_some() {
            self.reponame = layer.reponame;
        }
        if let Some(remote_path) = layer.remote_path {
            self.remote_path = remote_path;
        }
        if let Some(v) = layer.sync.max_push_retries {
            self.sync.max_push_retries = v;
        }
        if let Some(v) = layer.sync.lock_timeout_secs {
            self.sync.lock_timeout_secs = v;
        }
        if let Some(v) = layer.autobackup.enabled {
            self.autobackup.enabled = v;
        }
        if let Some(v) = layer.subscription.enabled {
            self.subscription.enabled = v;
        }
        if let Some(v) = layer.subscription.daemon_port {
            self.subscription.daemon_port = v;
        }
        if layer.subscription.joined_dir.is_some() {
            self.subscription.joined_dir = layer.subscription.joined_dir;
        }
    }
}

pub fn user_config_path() -> PathBuf {
    if let Ok(dir) = std::env::var("CLOUDSYNC_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir).join("config.toml");
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("cloudsync")
        .join("config.toml")
}

pub fn repo_config_path(repo_root: &Path) -> PathBuf {
    crate::paths::cloudsync_dir(repo_root).join("config.toml")
}

fn load_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).map_err(|err| ConfigError::Read {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    toml::from_str(&contents)
        .map(Some)
        .map_err(|err| ConfigError::Read {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
}

/// Load config for a repository: defaults, then user file, then repo file,
/// then environment overrides.
pub fn load_for_repo(repo_root: &Path) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    if let Some(layer) = load_layer(&user_config_path())? {
        config.apply_layer(layer);
    }
    if let Some(layer) = load_layer(&repo_config_path(repo_root))? {
        config.apply_layer(layer);
    }
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(name) = std::env::var("CLOUDSYNC_REPONAME")
        && !name.trim().is_empty()
    {
        config.reponame = Some(name);
    }
    if let Ok(flag) = std::env::var("CLOUDSYNC_AUTOBACKUP") {
        match flag.trim() {
            "1" | "true" => config.autobackup.enabled = true,
            "0" | "false" => config.autobackup.enabled = false,
            other => {
                tracing::warn!(value = other, "ignoring bad CLOUDSYNC_AUTOBACKUP value");
            }
        }
    }
    if let Ok(port) = std::env::var("CLOUDSYNC_DAEMON_PORT") {
        match port.trim().parse::<u16>() {
            Ok(port) => config.subscription.daemon_port = port,
            Err(_) => {
                tracing::warn!(value = %port, "ignoring bad CLOUDSYNC_DAEMON_PORT value");
            }
        }
    }
}

/// Persist a config file atomically.
pub fn write_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let dir = path.parent().ok_or_else(|| ConfigError::Write {
        path: path.to_path_buf(),
        reason: "missing parent directory".into(),
    })?;
    fs::create_dir_all(dir).map_err(|err| ConfigError::Write {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    let contents = toml::to_string_pretty(config).map_err(|err| ConfigError::Write {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|err| ConfigError::Write {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    fs::write(temp.path(), contents.as_bytes()).map_err(|err| ConfigError::Write {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    temp.persist(path).map_err(|err| ConfigError::Write {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    Ok(())
}
