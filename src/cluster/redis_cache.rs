//! Redis-backed shared cache
//!
//! Every primitive maps onto a single Redis command, so each one is atomic on
//! the server:
//! - add-if-absent is `SET key value NX PX ttl`
//! - increment/decrement are `INCR`/`DECR`
//! - touch is `PEXPIRE`
//!
//! The connection is opened lazily and dropped after any failure so a cache
//! that comes back is picked up again by the next call.

use crate::cluster::cache::KvCache;
use crate::error::{CacheError, CacheResult};

use redis::{Client, Commands, Connection, RedisResult};
use std::sync::Mutex;
use std::time::Duration;

/// Configuration for the Redis cache
#[derive(Debug, Clone)]
pub struct RedisCacheConfig {
    /// Redis connection URL
    pub url: String,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Read/write timeout per command
    pub io_timeout: Duration,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(2),
        }
    }
}

impl RedisCacheConfig {
    /// Create config with custom Redis URL
    pub fn with_url(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }
}

/// Shared cache backed by a Redis server
pub struct RedisCache {
    client: Client,
    connection: Mutex<Option<Connection>>,
    config: RedisCacheConfig,
}

impl RedisCache {
    /// Create a new Redis cache handle. No connection is made until first use.
    pub fn new(config: RedisCacheConfig) -> CacheResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| CacheError::ConnectionFailed {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            config,
        })
    }

    fn connect(&self) -> CacheResult<Connection> {
        let conn = self
            .client
            .get_connection_with_timeout(self.config.connect_timeout)
            .map_err(|e| CacheError::ConnectionFailed {
                url: self.config.url.clone(),
                reason: e.to_string(),
            })?;

        conn.set_read_timeout(Some(self.config.io_timeout))?;
        conn.set_write_timeout(Some(self.config.io_timeout))?;
        Ok(conn)
    }

    /// Run a command on the shared connection, reconnecting if needed
    fn run<T>(&self, op: &'static str, f: impl FnOnce(&mut Connection) -> RedisResult<T>) -> CacheResult<T> {
        let mut guard = self.connection.lock().map_err(|_| CacheError::OperationFailed {
            op,
            reason: "connection lock poisoned".into(),
        })?;

        if guard.is_none() {
            *guard = Some(self.connect()?);
        }

        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => {
                return Err(CacheError::ConnectionFailed {
                    url: self.config.url.clone(),
                    reason: "no connection".into(),
                })
            }
        };

        match f(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                // Drop the connection so the next call reconnects
                *guard = None;
                Err(CacheError::OperationFailed {
                    op,
                    reason: e.to_string(),
                })
            }
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl KvCache for RedisCache {
    fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.run("get", |conn| conn.get(key))
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.run("set", |conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query::<()>(conn)
        })
    }

    fn add(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        // SET ... NX replies nil when the key already exists
        let reply: Option<String> = self.run("add", |conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query(conn)
        })?;
        Ok(reply.is_some())
    }

    fn incr(&self, key: &str) -> CacheResult<i64> {
        self.run("incr", |conn| conn.incr(key, 1))
    }

    fn decr(&self, key: &str) -> CacheResult<i64> {
        self.run("decr", |conn| conn.decr(key, 1))
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        let removed: i64 = self.run("delete", |conn| conn.del(key))?;
        Ok(removed > 0)
    }

    fn touch(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.run("touch", |conn| {
            redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_millis(ttl))
                .query::<bool>(conn)
        })
    }
}
