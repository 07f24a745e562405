//! Cache configuration
//!
//! The host passes cache options as a flat JSON object whose values are
//! strings, e.g.
//!
//! ```text
//! {"host": "redis", "port": "6379", "wait_timeout": "500", "tls_enabled": "true"}
//! ```
//!
//! Everything is parsed and validated up front so a bad configuration fails
//! at construction, never on first use.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Environment variable consulted for the Redis user before the config
pub const USERNAME_ENV_VAR: &str = "RESPCACHE_REDIS_USERNAME";

/// Environment variable consulted for the Redis password before the config
pub const PASSWORD_ENV_VAR: &str = "RESPCACHE_REDIS_PASSWORD";

/// Pool wait timeout applied when `wait_timeout` is absent
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Connections kept by the Redis pool when `pool_size` is absent
pub const DEFAULT_POOL_SIZE: u32 = 1;

/// Which field store backs the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process fixed-size arena
    Local,
    /// Remote Redis hashes
    Redis,
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "redis" => Ok(BackendKind::Redis),
            other => Err(Error::invalid(format!("unknown cache backend '{}'", other))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Redis => write!(f, "redis"),
        }
    }
}

/// TLS options for the Redis connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Client certificate (PEM)
    pub cert: Option<PathBuf>,
    /// Client private key (PEM)
    pub key: Option<PathBuf>,
    /// CA bundle (PEM)
    pub cacert: Option<PathBuf>,
    /// Directory of CA certificates (PEM)
    pub cacert_dir: Option<PathBuf>,
    /// Server name for verification
    pub sni: Option<String>,
}

/// Redis connection options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub db: i64,
    pub connect_timeout: Option<Duration>,
    pub socket_timeout: Option<Duration>,
    pub pool_size: u32,
    pub wait_timeout: Duration,
    pub tls: TlsConfig,
}

/// Local arena options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalConfig {
    /// Arena capacity in bytes
    pub size: usize,
}

/// Validated configuration for one cache instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheConfig {
    Local(LocalConfig),
    Redis(RedisConfig),
}

impl CacheConfig {
    /// Local arena of `size` bytes
    pub fn local(size: usize) -> Self {
        CacheConfig::Local(LocalConfig { size })
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            CacheConfig::Local(_) => BackendKind::Local,
            CacheConfig::Redis(_) => BackendKind::Redis,
        }
    }

    /// Parse a JSON option blob, reading credentials from the process
    /// environment first
    pub fn from_json(backend: BackendKind, json: &str) -> Result<Self> {
        Self::from_json_with_env(backend, json, |name| std::env::var(name).ok())
    }

    /// Parse a JSON option blob with a custom environment lookup
    pub fn from_json_with_env<F>(backend: BackendKind, json: &str, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawOptions = serde_json::from_str(json)
            .map_err(|e| Error::invalid(format!("failed to parse cache config: {}", e)))?;

        match backend {
            BackendKind::Local => {
                let size = match raw.size {
                    Some(v) => parse_number::<usize>("size", v)?,
                    None => {
                        return Err(Error::invalid(
                            "failed to initialize local cache, must specify 'size' in bytes",
                        ))
                    }
                };
                if size == 0 {
                    return Err(Error::invalid("local cache 'size' must be greater than 0"));
                }
                Ok(CacheConfig::Local(LocalConfig { size }))
            }
            BackendKind::Redis => raw.into_redis(env).map(CacheConfig::Redis),
        }
    }
}

// =============================================================================
// Raw options
// =============================================================================

/// Option value as written in the blob; strings are canonical but bare
/// numbers and booleans are accepted
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawValue {
    Text(String),
    Number(serde_json::Number),
    Flag(bool),
}

impl RawValue {
    fn into_string(self) -> String {
        match self {
            RawValue::Text(s) => s,
            RawValue::Number(n) => n.to_string(),
            RawValue::Flag(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawOptions {
    host: Option<RawValue>,
    port: Option<RawValue>,
    user: Option<RawValue>,
    password: Option<RawValue>,
    db: Option<RawValue>,
    connect_timeout: Option<RawValue>,
    socket_timeout: Option<RawValue>,
    pool_size: Option<RawValue>,
    wait_timeout: Option<RawValue>,
    tls_enabled: Option<RawValue>,
    cert: Option<RawValue>,
    key: Option<RawValue>,
    cacert: Option<RawValue>,
    cacert_dir: Option<RawValue>,
    sni: Option<RawValue>,
    size: Option<RawValue>,
}

impl RawOptions {
    fn into_redis<F>(self, env: F) -> Result<RedisConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (Some(host), Some(port)) = (self.host, self.port) else {
            return Err(Error::invalid(
                "failed to initialize redis cache, didn't specify address. Must at a minimum \
                 specify 'host' and 'port' in the configuration",
            ));
        };
        let host = host.into_string();
        if host.is_empty() {
            return Err(Error::invalid("redis 'host' must not be empty"));
        }

        // environment first, explicit config wins
        let user = self
            .user
            .map(RawValue::into_string)
            .or_else(|| env(USERNAME_ENV_VAR));
        let password = self
            .password
            .map(RawValue::into_string)
            .or_else(|| env(PASSWORD_ENV_VAR));

        let tls = match self.tls_enabled {
            Some(flag) => TlsConfig {
                enabled: flag.into_string() == "true",
                cert: self.cert.map(|v| PathBuf::from(v.into_string())),
                key: self.key.map(|v| PathBuf::from(v.into_string())),
                cacert: self.cacert.map(|v| PathBuf::from(v.into_string())),
                cacert_dir: self.cacert_dir.map(|v| PathBuf::from(v.into_string())),
                sni: self.sni.map(RawValue::into_string),
            },
            None => TlsConfig::default(),
        };

        let pool_size = match self.pool_size {
            Some(v) => parse_number::<u32>("pool_size", v)?,
            None => DEFAULT_POOL_SIZE,
        };
        if pool_size == 0 {
            return Err(Error::invalid("redis 'pool_size' must be greater than 0"));
        }

        Ok(RedisConfig {
            host,
            port: parse_number("port", port)?,
            user,
            password,
            db: self.db.map(|v| parse_number("db", v)).transpose()?.unwrap_or(0),
            connect_timeout: self
                .connect_timeout
                .map(|v| parse_millis("connect_timeout", v))
                .transpose()?,
            socket_timeout: self
                .socket_timeout
                .map(|v| parse_millis("socket_timeout", v))
                .transpose()?,
            pool_size,
            wait_timeout: self
                .wait_timeout
                .map(|v| parse_millis("wait_timeout", v))
                .transpose()?
                .unwrap_or(DEFAULT_WAIT_TIMEOUT),
            tls,
        })
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: RawValue) -> Result<T> {
    let text = value.into_string();
    text.trim()
        .parse()
        .map_err(|_| Error::invalid(format!("option '{}' has invalid value '{}'", name, text)))
}

fn parse_millis(name: &str, value: RawValue) -> Result<Duration> {
    parse_number::<u64>(name, value).map(Duration::from_millis)
}

// =============================================================================
// Tests
// =============================================================================
