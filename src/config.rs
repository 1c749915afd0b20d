//! Runtime configuration.
//!
//! Loaded from a TOML file with environment-variable overrides for
//! secrets. Every section has defaults, so a partial file (or none at
//! all, via [`Config::from_env`]) is enough to start against mainnet
//! defaults. Secret validation is fatal at startup, never retried.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment key overriding `auth.secret`.
pub const ENV_AUTH_SECRET: &str = "TIDELINE_AUTH_SECRET";
/// Environment key overriding `auth.service_secret`.
pub const ENV_SERVICE_SECRET: &str = "TIDELINE_SERVICE_SECRET";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    pub connection: ConnectionConfig,
    pub resolver: ResolverConfig,
    pub listener: ListenerConfig,
    pub auth: AuthConfig,
    pub api: ApiConfig,
    pub network: NetworkConfig,
}

impl Config {
    /// Read a TOML file, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, validated. For deployments
    /// that configure entirely through the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.secret.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingSecret(
                "auth.secret (or TIDELINE_AUTH_SECRET)",
            ));
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overrides pulled through `get`, separated out so tests can supply
    /// a map instead of mutating process environment.
    fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = get(ENV_AUTH_SECRET) {
            self.auth.secret = Some(secret);
        }
        if let Some(secret) = get(ENV_SERVICE_SECRET) {
            self.auth.service_secret = Some(secret);
        }
    }
}

/// Connection supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ConnectionConfig {
    /// Total connect attempts before giving up.
    pub max_retries: u32,
    /// Base delay between attempts; doubles each retry.
    pub retry_delay_ms: u64,
    /// Optional ceiling on the backoff delay.
    pub max_backoff_ms: Option<u64>,
    /// How often the background liveness probe runs. Zero disables it.
    pub health_check_interval_ms: u64,
    /// Deadline for a single connect attempt or probe.
    pub connection_timeout_ms: u64,
    /// Whether a failed probe triggers an automatic reconnect.
    pub reconnect_on_failure: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 1000,
            max_backoff_ms: None,
            health_check_interval_ms: 30_000,
            connection_timeout_ms: 30_000,
            reconnect_on_failure: true,
        }
    }
}

impl ConnectionConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// Bounds for one TTL cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CacheConfig {
    pub max_cache_size: usize,
    pub cache_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 500,
            cache_ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Identity resolution settings, one section per resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ResolverConfig {
    /// Inbox → address cache.
    pub address: CacheConfig,
    /// Message-by-id cache.
    pub message: CacheConfig,
    pub ens: EnsConfig,
    pub basename: BasenameConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            address: CacheConfig::default(),
            message: CacheConfig::default(),
            ens: EnsConfig::default(),
            basename: BasenameConfig::default(),
        }
    }
}

/// Mainnet name service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EnsConfig {
    pub rpc_url: String,
    /// Registry contract address.
    pub registry: String,
    pub cache: CacheConfig,
}

impl Default for EnsConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://cloudflare-eth.com".to_string(),
            registry: "0x00000000000C2E074eC69A0dFb2997BA6C7d2e1e".to_string(),
            cache: name_cache_defaults(),
        }
    }
}

/// L2 name service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BasenameConfig {
    pub rpc_url: String,
    /// Registry contract address on the L2.
    pub registry: String,
    /// Resolver contract address. When unset it is discovered from the
    /// registry on first use.
    pub resolver_address: Option<String>,
    pub cache: CacheConfig,
}

impl Default for BasenameConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://mainnet.base.org".to_string(),
            registry: "0xB94704422c2a1E396835A571837Aa5AE53285a95".to_string(),
            resolver_address: None,
            cache: name_cache_defaults(),
        }
    }
}

// Name lookups change rarely; hold them for an hour.
fn name_cache_defaults() -> CacheConfig {
    CacheConfig {
        max_cache_size: 500,
        cache_ttl_secs: 3600,
    }
}

/// Message listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ListenerConfig {
    /// Liveness heartbeat period.
    pub heartbeat_interval_secs: u64,
    /// How often the conversation list is re-polled for new entries.
    pub conversation_check_interval_secs: u64,
    /// Pause before restarting a failed stream session.
    pub recover_delay_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 300,
            conversation_check_interval_secs: 30,
            recover_delay_secs: 5,
        }
    }
}

impl ListenerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn conversation_check_interval(&self) -> Duration {
        Duration::from_secs(self.conversation_check_interval_secs)
    }

    pub fn recover_delay(&self) -> Duration {
        Duration::from_secs(self.recover_delay_secs)
    }
}

/// Action token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AuthConfig {
    /// HMAC signing key. Required; also settable via `TIDELINE_AUTH_SECRET`.
    pub secret: Option<String>,
    /// Static secret accepted in `x-service-secret` to bypass token checks.
    /// Unset disables the bypass.
    pub service_secret: Option<String>,
    /// Token lifetime from mint to expiry.
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: None,
            service_secret: None,
            token_ttl_secs: 300,
        }
    }
}

/// HTTP action boundary settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ApiConfig {
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7300".to_string(),
        }
    }
}

/// Which network tier the runtime points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkTier {
    Dev,
    Production,
}

/// Network tier selection. The tier is read from an environment variable
/// whose name is itself configurable, so deployments can reuse whatever
/// key their infrastructure already sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct NetworkConfig {
    pub env_var: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            env_var: "TIDELINE_NETWORK".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn tier(&self) -> NetworkTier {
        tier_from(std::env::var(&self.env_var).ok().as_deref())
    }
}

fn tier_from(value: Option<&str>) -> NetworkTier {
    match value {
        Some(v) if v.eq_ignore_ascii_case("production") => NetworkTier::Production,
        _ => NetworkTier::Dev,
    }
}
