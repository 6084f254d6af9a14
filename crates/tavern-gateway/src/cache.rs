use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Cache key layout.
pub mod keys {
    /// Login token and safe user, written at login, deleted at logout.
    pub fn identity(user_id: i64) -> String {
        format!("jwt-cache:{user_id}")
    }

    /// Working copy of a session's sketch.
    pub fn sketch(session_id: i64) -> String {
        format!("sketch:{session_id}")
    }

    pub fn character(character_id: i64) -> String {
        format!("character:{character_id}")
    }
}

/// In-process key/value store holding JSON documents, with optional expiry.
/// Expired entries read as absent and are dropped on the next write.
#[derive(Clone, Default)]
pub struct Cache {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

struct Entry {
    json: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw JSON text stored under `key`.
    pub async fn get_raw(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.json.clone())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key).await {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.store(key, value, None).await
    }

    pub async fn set_json_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        self.store(key, value, Some(Instant::now() + ttl)).await
    }

    /// Store only if nothing live is there yet. Returns whether it stored.
    pub async fn set_json_if_absent<T: Serialize>(&self, key: &str, value: &T) -> Result<bool> {
        let json = serde_json::to_string(value)?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry { json, expires_at: None });
        Ok(true)
    }

    /// Read, modify and write back one document under a single write lock, so no
    /// other writer can interleave between the read and the write.
    /// Returns `None` when the key is absent.
    pub async fn update_json<T, R, F>(&self, key: &str, f: F) -> Result<Option<R>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> R,
    {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key).filter(|entry| entry.is_live(now)) else {
            return Ok(None);
        };

        let mut value: T = serde_json::from_str(&entry.json)?;
        let out = f(&mut value);
        entry.json = serde_json::to_string(&value)?;
        Ok(Some(out))
    }

    /// Returns whether a live entry was removed.
    pub async fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .write()
            .await
            .remove(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    /// Remove `key` and return its raw JSON if it was live.
    pub async fn take_raw(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .write()
            .await
            .remove(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.json)
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.get_raw(key).await.is_some()
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T, expires_at: Option<Instant>) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.is_live(now));
        entries.insert(key.to_string(), Entry { json, expires_at });
        Ok(())
    }
}
