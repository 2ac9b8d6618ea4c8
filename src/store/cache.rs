//! Cache adapter over the shared store. Values are JSON records; keys are
//! derived deterministically from the logical parameters so equal inputs hit
//! the same entry regardless of map insertion order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::domain::{JobType, MediaInfo};
use crate::error::Result;

pub const PROBE_TTL: Duration = Duration::from_secs(24 * 3600);
pub const RESULT_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Canonical textual form of a parameter record: map keys sorted
/// lexicographically and joined as `k=v&…`, arrays kept in order.
pub fn canonical(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            keys.iter()
                .map(|k| format!("{k}={}", canonical(&map[k.as_str()])))
                .collect::<Vec<_>>()
                .join("&")
        }
        serde_json::Value::Array(items) => {
            let inner = items.iter().map(canonical).collect::<Vec<_>>().join(",");
            format!("[{inner}]")
        }
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn derive_key(prefix: &str, params: &serde_json::Value) -> String {
    format!("{prefix}:{:x}", md5::compute(canonical(params)))
}

type MemoryMap = Arc<Mutex<HashMap<String, (String, Instant)>>>;

#[derive(Clone)]
enum Backend {
    Redis(ConnectionManager),
    /// Process-local fallback, also used by tests. Same observable contract,
    /// lazily-expired entries.
    Memory(MemoryMap),
}

#[derive(Clone)]
pub struct CacheStore {
    backend: Backend,
}

impl CacheStore {
    pub async fn connect(redis_url: &str) -> Result<CacheStore> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(CacheStore {
            backend: Backend::Redis(manager),
        })
    }

    pub fn memory() -> CacheStore {
        CacheStore {
            backend: Backend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                Ok(conn.get(key).await?)
            }
            Backend::Memory(map) => {
                let mut map = map.lock().await;
                match map.get(key) {
                    Some((value, expires)) if *expires > Instant::now() => {
                        Ok(Some(value.clone()))
                    }
                    Some(_) => {
                        map.remove(key);
                        Ok(None)
                    }
                    None => Ok(None),
                }
            }
        }
    }

    pub async fn set_raw(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
                Ok(())
            }
            Backend::Memory(map) => {
                map.lock()
                    .await
                    .insert(key.to_string(), (value, Instant::now() + ttl));
                Ok(())
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key).await? {
            // A corrupt entry is indistinguishable from a miss for callers;
            // it will be overwritten by the next set.
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        self.set_raw(key, serde_json::to_string(value)?, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let _: () = conn.del(key).await?;
                Ok(())
            }
            Backend::Memory(map) => {
                map.lock().await.remove(key);
                Ok(())
            }
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                Ok(conn.exists(key).await?)
            }
            Backend::Memory(_) => Ok(self.get_raw(key).await?.is_some()),
        }
    }
}

/// Typed view: probed media metadata per asset. Invalidated on soft-delete.
#[derive(Clone)]
pub struct ProbeCache {
    store: CacheStore,
}

impl ProbeCache {
    pub fn new(store: CacheStore) -> ProbeCache {
        ProbeCache { store }
    }

    fn key(asset_id: i64, object_name: &str) -> String {
        format!("video:info:{asset_id}:{:x}", md5::compute(object_name))
    }

    pub async fn get(&self, asset_id: i64, object_name: &str) -> Result<Option<MediaInfo>> {
        self.store.get(&Self::key(asset_id, object_name)).await
    }

    pub async fn set(&self, asset_id: i64, object_name: &str, info: &MediaInfo) -> Result<()> {
        self.store
            .set(&Self::key(asset_id, object_name), info, PROBE_TTL)
            .await
    }

    pub async fn invalidate(&self, asset_id: i64, object_name: &str) -> Result<()> {
        self.store.delete(&Self::key(asset_id, object_name)).await
    }
}

/// Cached outcome of a whole operation. The hit is advisory: the dispatcher
/// re-validates that the recorded output assets still resolve before
/// honoring it.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct CachedResult {
    pub output_file_ids: Vec<i64>,
    pub result: serde_json::Value,
}

#[derive(Clone)]
pub struct ResultCache {
    store: CacheStore,
}

impl ResultCache {
    pub fn new(store: CacheStore) -> ResultCache {
        ResultCache { store }
    }

    pub fn key(job_type: JobType, input_ids: &[i64], config: &serde_json::Value) -> String {
        let mut ids = input_ids.to_vec();
        ids.sort_unstable();
        derive_key(
            "operation:result",
            &serde_json::json!({
                "type": job_type.as_str(),
                "file_ids": ids,
                "config": config,
            }),
        )
    }

    pub async fn get(
        &self,
        job_type: JobType,
        input_ids: &[i64],
        config: &serde_json::Value,
    ) -> Result<Option<CachedResult>> {
        self.store.get(&Self::key(job_type, input_ids, config)).await
    }

    pub async fn set(
        &self,
        job_type: JobType,
        input_ids: &[i64],
        config: &serde_json::Value,
        value: &CachedResult,
    ) -> Result<()> {
        self.store
            .set(&Self::key(job_type, input_ids, config), value, RESULT_TTL)
            .await
    }
}
