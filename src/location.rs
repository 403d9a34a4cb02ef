use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A lookup miss is a routing signal, a store failure is not; callers
/// must be able to tell the two apart.
#[derive(Debug, Error)]
pub enum LocationError {
    #[error("aor not registered")]
    NotFound,

    #[error("location store error: {0}")]
    Store(String),
}

impl LocationError {
    pub fn store<E: std::fmt::Display>(err: E) -> Self {
        Self::Store(err.to_string())
    }
}

/// Registration storage with native TTL expiry. One physical
/// registration is written under every fan-out key the routing engine
/// derives, so the store itself only sees flat key/value pairs.
#[async_trait]
pub trait Locator: Send + Sync {
    async fn register(
        &self,
        aor_key: &str,
        contact: &str,
        ttl: Duration,
    ) -> Result<(), LocationError>;

    async fn lookup(&self, aor_key: &str) -> Result<String, LocationError>;

    async fn unregister(&self, aor_key: &str) -> Result<(), LocationError>;
}

pub struct MemoryLocator {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLocator {
    pub fn new() -> Self {
        info!("creating in-memory locator");
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryLocator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Locator for MemoryLocator {
    async fn register(
        &self,
        aor_key: &str,
        contact: &str,
        ttl: Duration,
    ) -> Result<(), LocationError> {
        let mut entries = self.entries.lock().await;
        entries.insert(aor_key.to_string(), (contact.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn lookup(&self, aor_key: &str) -> Result<String, LocationError> {
        let mut entries = self.entries.lock().await;
        match entries.get(aor_key) {
            Some((contact, deadline)) if *deadline > Instant::now() => Ok(contact.clone()),
            Some(_) => {
                entries.remove(aor_key);
                Err(LocationError::NotFound)
            }
            None => Err(LocationError::NotFound),
        }
    }

    async fn unregister(&self, aor_key: &str) -> Result<(), LocationError> {
        self.entries.lock().await.remove(aor_key);
        Ok(())
    }
}

const KEY_PREFIX: &str = "reg:";

pub struct RedisLocator {
    conn: redis::aio::ConnectionManager,
}

impl RedisLocator {
    /// Connect and ping; an unreachable store is a fatal startup error.
    pub async fn connect(url: &str) -> Result<Self, LocationError> {
        let url = if url.contains("://") {
            url.to_string()
        } else {
            format!("redis://{}", url)
        };
        let client = redis::Client::open(url.as_str()).map_err(LocationError::store)?;
        let mut conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(LocationError::store)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(LocationError::store)?;
        info!(%url, "connected to location store");
        Ok(Self { conn })
    }

    fn key(aor_key: &str) -> String {
        format!("{}{}", KEY_PREFIX, aor_key)
    }
}

#[async_trait]
impl Locator for RedisLocator {
    async fn register(
        &self,
        aor_key: &str,
        contact: &str,
        ttl: Duration,
    ) -> Result<(), LocationError> {
        let key = Self::key(aor_key);
        debug!(%key, %contact, "storing registration");
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, contact, ttl.as_secs())
            .await
            .map_err(LocationError::store)
    }

    async fn lookup(&self, aor_key: &str) -> Result<String, LocationError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(Self::key(aor_key))
            .await
            .map_err(LocationError::store)?;
        value.ok_or(LocationError::NotFound)
    }

    async fn unregister(&self, aor_key: &str) -> Result<(), LocationError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::key(aor_key))
            .await
            .map_err(LocationError::store)
    }
}
