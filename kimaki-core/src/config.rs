use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KimakiConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub ipc: IpcConfig,
    pub threads: ThreadsConfig,
    pub discord: DiscordConfig,
    pub opencode: OpencodeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7350".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database shared with the worker processes.
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "data/kimaki.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Dispatcher tick interval (milliseconds).
    pub poll_interval_ms: u64,
    /// Minimum time between two stale sweeps (milliseconds).
    pub stale_check_interval_ms: u64,
    /// Requests in `processing` longer than this are cancelled (milliseconds).
    pub stale_ttl_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            stale_check_interval_ms: 30_000,
            stale_ttl_ms: 300_000,
        }
    }
}

impl IpcConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_millis(self.stale_check_interval_ms)
    }

    pub fn stale_ttl(&self) -> Duration {
        Duration::from_millis(self.stale_ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadsConfig {
    /// How long an interrupted turn may run before it is dropped (milliseconds).
    pub force_abort_timeout_ms: u64,
    /// Idle thread actors exit after this long without messages (milliseconds).
    pub idle_actor_ttl_ms: u64,
    /// Longest wait for a finished turn's teardown before the next turn
    /// starts anyway (milliseconds).
    pub teardown_timeout_ms: u64,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            force_abort_timeout_ms: 2_000,
            idle_actor_ttl_ms: 600_000,
            teardown_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    /// Use the Discord REST bridge. When false, kimakid runs log-only.
    pub enabled: bool,
    pub api_base: String,
    /// How long an upload prompt waits for the user (milliseconds).
    pub upload_timeout_ms: u64,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: "https://discord.com/api/v10".to_string(),
            upload_timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpencodeConfig {
    pub base_url: String,
    /// Project directory passed to the OpenCode server.
    pub directory: String,
}

impl Default for OpencodeConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4096".to_string(),
            directory: ".".to_string(),
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<KimakiConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(KimakiConfig::default().with_env_overrides());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let parsed: KimakiConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(parsed.with_env_overrides())
}

impl KimakiConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(bind) = std::env::var("KIMAKI_BIND") {
            if !bind.trim().is_empty() {
                self.server.bind = bind;
            }
        }

        if let Ok(db_path) = std::env::var("KIMAKI_DB_PATH") {
            if !db_path.trim().is_empty() {
                self.storage.db_path = db_path;
            }
        }

        if let Ok(url) = std::env::var("OPENCODE_BASE_URL") {
            if !url.trim().is_empty() {
                self.opencode.base_url = url;
            }
        }

        self
    }
}
