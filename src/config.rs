//! Cache configuration

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::{CacheError, Serializer};

/// Configuration for the two-tier cache.
///
/// Deserializable from any serde format; every field has a default so partial
/// documents are accepted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1: L1Config,
    pub l2: L2Config,
    pub listener: ListenerConfig,
}

/// L1 (local, per-category) settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct L1Config {
    /// Local backend name. Only `moka` is supported.
    pub provider: String,
    /// Maximum number of entries in each category's L1 cache
    pub max_size: u64,
    /// Lifetime of L1 entries, in seconds, independent of the entry TTL
    pub expire_after_write_secs: u64,
    /// TTL for negative entries, in milliseconds. `None` means no expiry, so
    /// only `expire_after_write_secs` bounds them.
    pub negative_ttl_ms: Option<u64>,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            provider: LocalProvider::Moka.as_str().to_owned(),
            max_size: 10_000,
            expire_after_write_secs: 600, // 10 minutes
            negative_ttl_ms: None,
        }
    }
}

impl L1Config {
    pub fn expire_after_write(&self) -> Duration {
        Duration::from_secs(self.expire_after_write_secs)
    }
}

/// L2 (remote, shared) settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct L2Config {
    /// Remote backend name. Only `redis` is supported.
    pub provider: String,
    /// Serializer name (`json` or `msgpack`)
    pub serializer: String,
    /// Comma-separated `host:port` list. More than one node selects cluster mode.
    pub nodes: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connection_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub max_attempts: u32,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            provider: RemoteProvider::Redis.as_str().to_owned(),
            serializer: Serializer::Json.as_str().to_owned(),
            nodes: String::new(),
            username: None,
            password: None,
            connection_timeout_ms: 2000,
            response_timeout_ms: 2000,
            max_attempts: 3,
        }
    }
}

impl L2Config {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Credentials with blank values treated as absent.
    pub fn credentials(&self) -> (Option<String>, Option<String>) {
        fn non_blank(v: &Option<String>) -> Option<String> {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        }
        (non_blank(&self.username), non_blank(&self.password))
    }
}

/// Invalidation listener settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Fixed pause before re-subscribing after a transport error
    pub backoff_ms: u64,
    /// How long `stop()` waits for the listener thread per attempt
    pub shutdown_grace_ms: u64,
    /// Number of cancel-and-wait attempts before the thread is detached
    pub shutdown_attempts: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            backoff_ms: 3000,
            shutdown_grace_ms: 2000,
            shutdown_attempts: 3,
        }
    }
}

impl ListenerConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Supported L1 backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalProvider {
    Moka,
}

impl LocalProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Moka => "moka",
        }
    }
}

impl FromStr for LocalProvider {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "moka" => Ok(Self::Moka),
            other => Err(CacheError::config(format!(
                "unsupported L1 provider '{other}', only 'moka' is available"
            ))),
        }
    }
}

/// Supported L2 backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteProvider {
    Redis,
}

impl RemoteProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
        }
    }
}

impl FromStr for RemoteProvider {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "redis" => Ok(Self::Redis),
            other => Err(CacheError::config(format!(
                "unsupported L2 provider '{other}', only 'redis' is available"
            ))),
        }
    }
}

impl CacheConfig {
    /// Resolve provider and serializer names, failing on anything unsupported.
    pub fn validate(&self) -> Result<(LocalProvider, RemoteProvider, Serializer), CacheError> {
        let local = self.l1.provider.parse::<LocalProvider>()?;
        let remote = self.l2.provider.parse::<RemoteProvider>()?;
        let serializer = self.l2.serializer.parse::<Serializer>()?;
        if self.l1.max_size == 0 {
            return Err(CacheError::config("l1.max_size must be greater than zero"));
        }
        if self.l1.negative_ttl_ms == Some(0) {
            return Err(CacheError::config(
                "l1.negative_ttl_ms must be greater than zero",
            ));
        }
        Ok((local, remote, serializer))
    }
}
