//! Discovery cache: last-known device addresses keyed by uuid and by name.
//!
//! Backed by a small SQLite key/value table behind a connection pool. An empty
//! value is an invalidated entry and reads back as "not found".

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceEndpoint, EndpointOrigin};

const KEY_PREFIX: &str = "cast2mqtt/dns/";

/// Serialized snapshot of a resolved endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub uuid: String,
    pub name: String,
    pub addr: String,
    pub port: u16,
}

impl CacheEntry {
    pub fn from_endpoint(endpoint: &DeviceEndpoint) -> Self {
        Self {
            uuid: endpoint.uuid.clone().unwrap_or_default(),
            name: endpoint.name.clone().unwrap_or_default(),
            addr: endpoint.address.clone(),
            port: endpoint.port,
        }
    }

    pub fn into_endpoint(self) -> DeviceEndpoint {
        DeviceEndpoint {
            uuid: Some(self.uuid).filter(|s| !s.is_empty()),
            name: Some(self.name).filter(|s| !s.is_empty()),
            address: self.addr,
            port: self.port,
            origin: EndpointOrigin::CacheHit,
        }
    }
}

/// Namespaced cache key for a device identifier.
pub fn cache_key(identifier: &str) -> String {
    format!("{KEY_PREFIX}{identifier}")
}

#[derive(Clone)]
pub struct DiscoveryCache {
    pool: Pool<SqliteConnectionManager>,
}

impl DiscoveryCache {
    /// Open (or create) the cache database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create cache dir {:?}", parent))?;
        }
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(2)
            .build(manager)
            .context("create discovery cache pool")?;
        Self::with_pool(pool)
    }

    /// Open the cache at `path` only if an earlier run created it.
    pub fn open_existing(path: &Path) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        Self::open(path).map(Some)
    }

    /// Private in-memory cache; a single connection keeps one shared database.
    pub fn in_memory() -> Result<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())
            .context("create in-memory cache pool")?;
        Self::with_pool(pool)
    }

    fn with_pool(pool: Pool<SqliteConnectionManager>) -> Result<Self> {
        let conn = pool.get().context("open discovery cache")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );",
        )
        .context("init discovery cache schema")?;
        drop(conn);
        Ok(Self { pool })
    }

    /// Raw value under `key`; empty values count as missing.
    pub fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.pool.get().context("open discovery cache")?;
        let value: Option<Vec<u8>> = conn
            .query_row(
                "SELECT value FROM entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("load cache key {key}"))?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    pub fn save(&self, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.pool.get().context("open discovery cache")?;
        conn.execute(
            "INSERT INTO entries (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .with_context(|| format!("save cache key {key}"))?;
        Ok(())
    }

    /// First cached entry with a non-empty address among `identifiers`.
    pub fn lookup<'a>(
        &self,
        identifiers: impl IntoIterator<Item = &'a str>,
    ) -> Result<Option<CacheEntry>> {
        for id in identifiers {
            if id.trim().is_empty() {
                continue;
            }
            let Some(raw) = self.load(&cache_key(id))? else {
                continue;
            };
            match serde_json::from_slice::<CacheEntry>(&raw) {
                Ok(entry) if !entry.addr.is_empty() => return Ok(Some(entry)),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key = %cache_key(id), error = %e, "cache: unreadable entry");
                }
            }
        }
        Ok(None)
    }

    /// Store `endpoint` under both its uuid key and its name key.
    pub fn remember(&self, endpoint: &DeviceEndpoint) -> Result<()> {
        let raw = serde_json::to_vec(&CacheEntry::from_endpoint(endpoint))
            .context("encode cache entry")?;
        for id in endpoint.identifiers() {
            self.save(&cache_key(id), &raw)?;
        }
        Ok(())
    }

    /// Blank out both keys of `endpoint` so the next run rediscovers it.
    pub fn invalidate(&self, endpoint: &DeviceEndpoint) -> Result<()> {
        for id in endpoint.identifiers() {
            self.save(&cache_key(id), &[])?;
        }
        Ok(())
    }
}

/// Default on-disk location, under the user's cache directory.
pub fn default_cache_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("cast2mqtt").join("discovery.sqlite"))
}
