//! Layered configuration: compiled-in defaults, overridable by an optional
//! TOML file, in turn overridable by environment variables / CLI flags at
//! the binary layer (see `zone1-executor`).

use crate::error::ExecutorResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9999
}

fn default_security_dir() -> PathBuf {
    dirs_home().join("moltbot-security")
}

fn default_kill_marker_path() -> PathBuf {
    PathBuf::from("/tmp/moltbot-kill")
}

fn default_kill_poll_interval_secs() -> u64 {
    1
}

fn default_approval_expiry_secs() -> i64 {
    300
}

fn default_sops_age_key_file() -> PathBuf {
    dirs_home().join(".config").join("sops").join("age").join("keys.txt")
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Top-level executor configuration.
///
/// Every field has a compiled-in default; a TOML file only needs to
/// override the fields it cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub host: String,
    pub port: u16,

    /// Root of `~/moltbot-security/` - audit logs, canary files live under here.
    pub security_dir: PathBuf,

    /// Sentinel file the kill switch watches for.
    pub kill_marker_path: PathBuf,
    /// Poll interval, in seconds, for the kill-file watcher.
    pub kill_poll_interval_secs: u64,

    /// Approval expiry window, in seconds, from creation.
    pub approval_expiry_secs: i64,

    /// Key file the external key tool reads to decrypt secrets.
    pub sops_age_key_file: PathBuf,
    /// Directory holding encrypted per-action secret files.
    pub secrets_dir: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let security_dir = default_security_dir();
        Self {
            host: default_host(),
            port: default_port(),
            secrets_dir: security_dir.join("secrets"),
            security_dir,
            kill_marker_path: default_kill_marker_path(),
            kill_poll_interval_secs: default_kill_poll_interval_secs(),
            approval_expiry_secs: default_approval_expiry_secs(),
            sops_age_key_file: default_sops_age_key_file(),
        }
    }
}

impl ExecutorConfig {
    pub fn audit_dir(&self) -> PathBuf {
        self.security_dir.join("audit-logs")
    }

    pub fn canary_file(&self) -> PathBuf {
        self.security_dir.join("canaries.json")
    }

    pub fn canary_trigger_log(&self) -> PathBuf {
        self.security_dir.join("canary-triggers.jsonl")
    }

    /// Load defaults overlaid with a TOML file, if one is given and exists.
    pub fn load(path: Option<&Path>) -> ExecutorResult<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                config = toml::from_str(&content)?;
            }
        }
        Ok(config)
    }
}
