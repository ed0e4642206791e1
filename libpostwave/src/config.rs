//! Configuration management for Postwave
//!
//! Secrets never live in the config file. The file names the environment
//! variables that hold them (`encryption_key_env`, `client_secret_env`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::rate_limit::WindowLimit;
use crate::types::Platform;
use crate::vault::EncryptionKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub publishing: PublishingConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    /// Keyed by platform identifier ("twitter", "linkedin", "threads", "tiktok")
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Environment variable holding the 64-hex-character master secret
    #[serde(default = "default_encryption_key_env")]
    pub encryption_key_env: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            encryption_key_env: default_encryption_key_env(),
        }
    }
}

fn default_encryption_key_env() -> String {
    "POSTWAVE_ENCRYPTION_KEY".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishingConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay", with = "humantime_serde_compat")]
    pub retry_base_delay: Duration,
    #[serde(default = "default_retry_max_delay", with = "humantime_serde_compat")]
    pub retry_max_delay: Duration,
    #[serde(default = "default_operation_timeout", with = "humantime_serde_compat")]
    pub operation_timeout: Duration,
    /// Rate-limit waits up to this long are slept inline; longer ones are
    /// persisted as `next_attempt_at`.
    #[serde(default, with = "humantime_serde_compat")]
    pub inline_rate_limit_wait: Duration,
    #[serde(default = "default_poll_interval", with = "humantime_serde_compat")]
    pub poll_interval: Duration,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_base_delay: default_retry_base_delay(),
            retry_max_delay: default_retry_max_delay(),
            operation_timeout: default_operation_timeout(),
            inline_rate_limit_wait: Duration::ZERO,
            poll_interval: default_poll_interval(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay() -> Duration {
    Duration::from_secs(30)
}
fn default_retry_max_delay() -> Duration {
    Duration::from_secs(3600)
}
fn default_operation_timeout() -> Duration {
    Duration::from_secs(600)
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_batch_size() -> u32 {
    20
}
fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweep_interval", with = "humantime_serde_compat")]
    pub interval: Duration,
    #[serde(default = "default_lock_lease", with = "humantime_serde_compat")]
    pub lock_lease: Duration,
    #[serde(default = "default_sweep_batch")]
    pub batch_size: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: default_sweep_interval(),
            lock_lease: default_lock_lease(),
            batch_size: default_sweep_batch(),
        }
    }
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_lock_lease() -> Duration {
    Duration::from_secs(120)
}
fn default_sweep_batch() -> u32 {
    50
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// OAuth client id (TikTok calls this the client key)
    pub client_id: Option<String>,
    /// Environment variable holding the OAuth client secret
    pub client_secret_env: Option<String>,
    /// Override the API base URL (tests, proxies)
    pub api_base: Option<String>,
    /// Override the OAuth token endpoint
    pub token_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde_compat::option")]
    pub refresh_lookahead: Option<Duration>,
    /// Self-tracked call quota for platforms without rate-limit headers
    pub window_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde_compat::option")]
    pub window: Option<Duration>,
}

/// Resolved OAuth client credentials for one platform.
#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: secrecy::SecretString,
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}

impl PlatformConfig {
    /// Lookahead window the sweeper uses, sized to each platform's token lifetime.
    pub fn lookahead(&self, platform: Platform) -> Duration {
        self.refresh_lookahead.unwrap_or(match platform {
            Platform::Twitter => Duration::from_secs(30 * 60),
            Platform::LinkedIn => Duration::from_secs(7 * 24 * 3600),
            Platform::Threads => Duration::from_secs(7 * 24 * 3600),
            Platform::TikTok => Duration::from_secs(6 * 3600),
        })
    }

    /// Self-tracked quota. Twitter reports limits in headers and has none.
    pub fn window_limit(&self, platform: Platform) -> Option<WindowLimit> {
        let day = Duration::from_secs(24 * 3600);
        let (default_limit, default_window) = match platform {
            Platform::Twitter => return None,
            Platform::LinkedIn => (150, day),
            Platform::Threads => (250, day),
            Platform::TikTok => (15, day),
        };
        Some(WindowLimit {
            limit: self.window_limit.unwrap_or(default_limit),
            window: self.window.unwrap_or(default_window),
        })
    }

    /// Resolve client id and secret, reading the secret from the environment.
    pub fn client_credentials(&self, platform: Platform) -> Result<ClientCredentials> {
        let not_configured = |reason: &str| ConfigError::PlatformNotConfigured {
            platform: platform.to_string(),
            reason: reason.to_string(),
        };

        let client_id = self
            .client_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| not_configured("client_id is missing"))?;
        let secret_env = self
            .client_secret_env
            .as_deref()
            .ok_or_else(|| not_configured("client_secret_env is missing"))?;
        let secret = std::env::var(secret_env)
            .map_err(|_| not_configured(&format!("environment variable {} is not set", secret_env)))?;

        Ok(ClientCredentials {
            client_id,
            client_secret: secrecy::SecretString::from(secret),
        })
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.publishing.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "publishing.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.publishing.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "publishing.concurrency".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/postwave/postwave.db".to_string(),
            },
            security: SecurityConfig::default(),
            publishing: PublishingConfig::default(),
            sweeper: SweeperConfig::default(),
            platforms: BTreeMap::new(),
        }
    }

    pub fn platform(&self, platform: Platform) -> Option<&PlatformConfig> {
        self.platforms.get(platform.as_str())
    }

    /// Read the vault key from the configured environment variable.
    pub fn encryption_key(&self) -> Result<EncryptionKey> {
        let var = &self.security.encryption_key_env;
        let secret = zeroize::Zeroizing::new(std::env::var(var).map_err(|_| {
            ConfigError::MissingField(format!("environment variable {}", var))
        })?);
        EncryptionKey::from_hex(&secret).map_err(|e| {
            ConfigError::InvalidValue {
                field: var.clone(),
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("POSTWAVE_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("postwave").join("config.toml"))
}

/// Durations are written as humantime strings ("30s", "7d").
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|r| humantime::parse_duration(&r).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
