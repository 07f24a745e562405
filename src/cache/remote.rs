//! Redis Field Store
//!
//! Each cache entry is one Redis hash; every codec field is one hash field.
//!
//! # Design
//!
//! - Blocking `redis` connections behind an `r2d2` pool (`pool_size`,
//!   `wait_timeout`)
//! - Socket timeouts applied to every pooled connection on acquire
//! - The server is pinged at construction so a bad address fails early
//! - `put_new` is `EXISTS` followed by one `HSET key f1 v1 f2 v2 ...`; two
//!   writers racing on the same key can both succeed and the last one wins

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use r2d2::{CustomizeConnection, Pool};
use redis::{Client, ClientTlsConfig, RedisError, TlsCertificates};
use tracing::{info, instrument, warn};

use super::codec::FieldMap;
use super::store::{FieldStore, StoreError, StoreResult, StoreStats};
use crate::config::{RedisConfig, TlsConfig};
use crate::error::{Error, Result};

/// Applies socket timeouts to each connection the pool hands out
#[derive(Debug, Clone, Copy)]
struct SocketTimeouts(Option<Duration>);

impl CustomizeConnection<redis::Connection, RedisError> for SocketTimeouts {
    fn on_acquire(&self, conn: &mut redis::Connection) -> std::result::Result<(), RedisError> {
        conn.set_read_timeout(self.0)?;
        conn.set_write_timeout(self.0)
    }
}

/// Field store over a pooled Redis client
pub struct RedisFieldStore {
    pool: Pool<Client>,
    address: String,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl RedisFieldStore {
    /// Build the client, ping the server and start the pool
    pub fn connect(config: &RedisConfig) -> Result<Self> {
        let url = connection_url(config);
        let address = format!("{}:{}", config.host, config.port);

        if config.tls.sni.is_some() {
            warn!(
                address = %address,
                "TLS 'sni' option is not supported by the redis client and is ignored"
            );
        }

        let client = if config.tls.enabled && has_certificates(&config.tls) {
            Client::build_with_tls(url.as_str(), load_certificates(&config.tls)?)
        } else {
            Client::open(url.as_str())
        }
        .map_err(|e| {
            Error::invalid(format!("invalid redis configuration for {}: {}", address, e))
        })?;

        let mut conn = match config.connect_timeout {
            Some(timeout) => client.get_connection_with_timeout(timeout),
            None => client.get_connection(),
        }
        .map_err(|e| connect_error(&address, e))?;
        redis::cmd("PING")
            .query::<String>(&mut conn)
            .map_err(|e| connect_error(&address, e))?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(config.wait_timeout)
            .connection_customizer(Box::new(SocketTimeouts(config.socket_timeout)))
            .build(client)
            .map_err(|e| {
                Error::internal(format!("failed to start redis pool for {}: {}", address, e))
            })?;

        info!(
            address = %address,
            db = config.db,
            tls = config.tls.enabled,
            pool_size = config.pool_size,
            "connected to redis"
        );

        Ok(Self {
            pool,
            address,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    /// `host:port` of the server
    pub fn address(&self) -> &str {
        &self.address
    }

    fn connection(&self) -> StoreResult<r2d2::PooledConnection<Client>> {
        // r2d2 only fails `get` once the wait timeout has elapsed
        self.pool
            .get()
            .map_err(|e| StoreError::Timeout(format!("waiting for a redis connection: {}", e)))
    }
}

impl FieldStore for RedisFieldStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn exists(&self, key: &str) -> StoreResult<bool> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.connection()?;
        redis::cmd("EXISTS")
            .arg(key)
            .query::<bool>(&mut *conn)
            .map_err(store_error)
    }

    fn get_all(&self, key: &str) -> StoreResult<FieldMap> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.connection()?;
        let raw: BTreeMap<String, Vec<u8>> = redis::cmd("HGETALL")
            .arg(key)
            .query(&mut *conn)
            .map_err(store_error)?;
        Ok(raw.into_iter().map(|(k, v)| (k, v.into())).collect())
    }

    #[instrument(level = "trace", skip(self, fields), fields(fields = fields.len()))]
    fn put_new(&self, key: &str, fields: &FieldMap) -> StoreResult<bool> {
        let mut conn = self.connection()?;
        let present: bool = redis::cmd("EXISTS")
            .arg(key)
            .query(&mut *conn)
            .map_err(store_error)?;
        if present {
            return Ok(false);
        }

        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (name, value) in fields {
            cmd.arg(name.as_str()).arg(value.as_ref());
        }
        cmd.query::<i64>(&mut *conn).map_err(store_error)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn delete(&self, key: &str) -> StoreResult<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.connection()?;
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query(&mut *conn)
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    fn flush(&self) -> StoreResult<()> {
        let mut conn = self.connection()?;
        redis::cmd("FLUSHDB")
            .query::<()>(&mut *conn)
            .map_err(store_error)
    }

    fn stats(&self) -> StoreStats {
        let entries = self
            .connection()
            .and_then(|mut conn| {
                redis::cmd("DBSIZE")
                    .query::<u64>(&mut *conn)
                    .map_err(store_error)
            })
            .unwrap_or_else(|err| {
                warn!(address = %self.address, error = %err, "failed to read redis key count");
                0
            });
        StoreStats {
            entries,
            bytes: 0,
            capacity: None,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: 0,
        }
    }
}

impl std::fmt::Debug for RedisFieldStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisFieldStore")
            .field("address", &self.address)
            .field("pool_size", &self.pool.max_size())
            .finish()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// `redis[s]://[user[:password]@]host:port/db`
fn connection_url(config: &RedisConfig) -> String {
    let scheme = if config.tls.enabled { "rediss" } else { "redis" };
    let credentials = match (&config.user, &config.password) {
        (Some(user), Some(password)) => format!(
            "{}:{}@",
            urlencoding::encode(user),
            urlencoding::encode(password)
        ),
        (Some(user), None) => format!("{}@", urlencoding::encode(user)),
        (None, Some(password)) => format!(":{}@", urlencoding::encode(password)),
        (None, None) => String::new(),
    };
    format!(
        "{}://{}{}:{}/{}",
        scheme, credentials, config.host, config.port, config.db
    )
}

fn has_certificates(tls: &TlsConfig) -> bool {
    tls.cert.is_some() || tls.key.is_some() || tls.cacert.is_some() || tls.cacert_dir.is_some()
}

fn load_certificates(tls: &TlsConfig) -> Result<TlsCertificates> {
    let client_tls = match (&tls.cert, &tls.key) {
        (Some(cert), Some(key)) => Some(ClientTlsConfig {
            client_cert: read_pem(cert)?,
            client_key: read_pem(key)?,
        }),
        (None, None) => None,
        _ => {
            return Err(Error::invalid(
                "TLS 'cert' and 'key' must be specified together",
            ))
        }
    };

    let mut roots = Vec::new();
    if let Some(cacert) = &tls.cacert {
        roots.extend(read_pem(cacert)?);
    }
    if let Some(dir) = &tls.cacert_dir {
        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| Error::invalid(format!("cannot read '{}': {}", dir.display(), e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        paths.sort();
        for path in paths {
            roots.extend(read_pem(&path)?);
            roots.push(b'\n');
        }
    }

    Ok(TlsCertificates {
        client_tls,
        root_cert: (!roots.is_empty()).then_some(roots),
    })
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::invalid(format!("cannot read '{}': {}", path.display(), e)))
}

fn connect_error(address: &str, err: RedisError) -> Error {
    Error::internal(format!("failed to connect to redis at {}: {}", address, err))
}

fn store_error(err: RedisError) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout(err.to_string())
    } else if err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::Connection(err.to_string())
    } else if err.is_io_error() {
        StoreError::Io(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================
