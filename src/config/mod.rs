//! Configuration and credential storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{CredentialProvider, StoredToken};

fn default_signaling_url() -> String {
    "wss://localhost:8000/ws/call".to_string()
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

/// Application configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// Base signaling endpoint; the channel appends `/<user_id>/?token=...`
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,
    /// STUN servers handed to the RTC engine when a peer connection is created
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Stored bearer token for channel authentication
    pub token: Option<StoredToken>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: default_signaling_url(),
            stun_servers: default_stun_servers(),
            token: None,
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "telecare", "telecare-call")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains tokens)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    pub fn set_token(&mut self, token: String, expires_in: Option<u64>) {
        self.token = Some(StoredToken::new(token, expires_in));
    }
}

/// Credential provider backed by the on-disk config.
///
/// Reloads the config on every lookup so a token refreshed by another
/// process (or a new `login`) is picked up without restarting.
pub struct FileCredentials;

impl CredentialProvider for FileCredentials {
    fn bearer_token(&self) -> Option<String> {
        let config = Config::load().ok()?;
        let token = config.token?;
        if token.is_expired() {
            return None;
        }
        Some(token.token)
    }
}

/// Reconnection and connect-timeout tuning for the signaling channel.
///
/// The retry constants mirror the production defaults but stay configurable;
/// tests shrink the jitter to make delays deterministic.
#[derive(Debug, Clone)]
pub struct ChannelTuning {
    /// Retries scheduled after a transient closure before giving up
    pub max_reconnect_attempts: u32,
    /// Backoff base; the Nth retry waits base * 2^N plus jitter
    pub backoff_base_ms: u64,
    /// Backoff delay cap (pre-jitter)
    pub backoff_cap_ms: u64,
    /// Upper bound (exclusive) of the uniform jitter added to each delay
    pub jitter_ms: u64,
    /// How long a single transport connect may take before being abandoned
    pub connect_timeout: Duration,
    /// How long a caller waits on another caller's in-flight connect attempt
    pub inflight_wait: Duration,
}

impl Default for ChannelTuning {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            jitter_ms: 1_000,
            connect_timeout: Duration::from_secs(15),
            inflight_wait: Duration::from_secs(10),
        }
    }
}
