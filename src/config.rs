use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `[line] channel_access_token`
pub const LINE_TOKEN_ENV: &str = "LINE_CHANNEL_ACCESS_TOKEN";

/// Whether the operator's message is logged before or after it is pushed.
///
/// `SendThenAppend` never logs a message LINE refused; `AppendThenSend`
/// never delivers a message that could not be logged.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOrder {
    #[default]
    SendThenAppend,
    AppendThenSend,
}

impl std::fmt::Display for DispatchOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchOrder::SendThenAppend => write!(f, "send_then_append"),
            DispatchOrder::AppendThenSend => write!(f, "append_then_send"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub line: LineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LineConfig {
    #[serde(default)]
    pub channel_access_token: String,
    #[serde(default = "default_line_api_base_url")]
    pub api_base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Document path used when no remote store is configured
    #[serde(default = "default_file_path")]
    pub file_path: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_append_attempts")]
    pub max_append_attempts: u32,
    #[serde(default = "default_cloudflare_api_base_url")]
    pub cloudflare_api_base_url: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DispatchConfig {
    #[serde(default)]
    pub order: DispatchOrder,
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_line_api_base_url() -> String {
    "https://api.line.me".to_string()
}

fn default_file_path() -> PathBuf {
    PathBuf::from("messages.json")
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_append_attempts() -> u32 {
    3
}

fn default_cloudflare_api_base_url() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            channel_access_token: String::new(),
            api_base_url: default_line_api_base_url(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            file_path: default_file_path(),
            timeout_secs: default_timeout_secs(),
            max_append_attempts: default_max_append_attempts(),
            cloudflare_api_base_url: default_cloudflare_api_base_url(),
        }
    }
}

impl StorageConfig {
    /// Upper bound for any single store round trip
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Config {
    /// Load from a TOML file. A missing file is not an error: everything
    /// has a default and deployments usually configure through the
    /// environment alone.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(LINE_TOKEN_ENV).filter(|t| !t.trim().is_empty()) {
            self.line.channel_access_token = token.trim().to_string();
        }
    }
}

/// Shared HTTP client setup: every outbound call is bounded.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}
