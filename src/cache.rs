use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::{DashMap, DashSet};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

use crate::api::{ApiError, RemoteApi};
use crate::types::{CacheEntry, CacheKey};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

pub struct QueryCache {
    primary: DashMap<CacheKey, Arc<RwLock<CacheEntry>>>,
    entity_index: DashMap<Arc<str>, DashSet<CacheKey>>,
    key_locks: DashMap<CacheKey, Arc<Mutex<()>>>,
    revision: AtomicU64,
    changes: broadcast::Sender<CacheKey>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            primary: DashMap::new(),
            entity_index: DashMap::new(),
            key_locks: DashMap::new(),
            revision: AtomicU64::new(0),
            changes,
        }
    }

    pub fn changes(&self) -> broadcast::Receiver<CacheKey> {
        self.changes.subscribe()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.primary.get(key)?.value().clone();
        let guard = entry.read().await;
        Some(guard.clone())
    }

    pub async fn value(&self, key: &CacheKey) -> Option<Value> {
        self.get(key).await.map(|entry| entry.value)
    }

    pub async fn put(&self, key: CacheKey, value: Value) -> u64 {
        let revision = self.next_revision();
        let entry = CacheEntry {
            value,
            revision,
            stale: false,
        };
        self.put_entry(key, entry).await;
        revision
    }

    async fn put_entry(&self, key: CacheKey, entry: CacheEntry) {
        let existing = self.primary.get(&key).map(|e| e.value().clone());
        match existing {
            Some(slot) => {
                let mut guard = slot.write().await;
                *guard = entry;
            }
            None => {
                self.primary
                    .insert(key.clone(), Arc::new(RwLock::new(entry)));
                self.entity_index
                    .entry(key.entity.clone())
                    .or_default()
                    .insert(key.clone());
            }
        }
        self.notify(key);
    }

    /// Undoes the write that produced `revision`, putting back `previous` (`None`
    /// removes the entry). An entry written since then is kept and marked stale.
    pub async fn rollback(&self, key: &CacheKey, revision: u64, previous: Option<CacheEntry>) -> bool {
        let Some(slot) = self.primary.get(key).map(|e| e.value().clone()) else {
            return false;
        };

        let restored = {
            let mut guard = slot.write().await;
            if guard.revision != revision {
                guard.stale = true;
                false
            } else {
                match previous {
                    Some(mut entry) => {
                        entry.stale |= guard.stale;
                        *guard = entry;
                    }
                    None => self.remove_entry(key),
                }
                true
            }
        };

        self.notify(key.clone());
        restored
    }

    pub async fn patch_field(&self, key: &CacheKey, field: &str, value: Value) -> bool {
        let Some(slot) = self.primary.get(key).map(|e| e.value().clone()) else {
            return false;
        };

        {
            let mut guard = slot.write().await;
            let Some(object) = guard.value.as_object_mut() else {
                return false;
            };
            if object.get(field) == Some(&value) {
                return true;
            }
            object.insert(field.to_string(), value);
            guard.revision = self.next_revision();
        }

        self.notify(key.clone());
        true
    }

    pub async fn mark_stale(&self, key: &CacheKey) -> bool {
        let Some(slot) = self.primary.get(key).map(|e| e.value().clone()) else {
            return false;
        };

        let changed = {
            let mut guard = slot.write().await;
            !std::mem::replace(&mut guard.stale, true)
        };
        if changed {
            self.notify(key.clone());
        }
        true
    }

    pub async fn mark_stale_by_entity(&self, entity: &str) -> Vec<CacheKey> {
        let keys: Vec<CacheKey> = match self.entity_index.get(entity) {
            Some(set) => set.iter().map(|k| k.key().clone()).collect(),
            None => return Vec::new(),
        };

        for key in &keys {
            self.mark_stale(key).await;
        }

        keys
    }

    /// Runs `f` while holding the per-key lock. Fetches and optimistic mutations on
    /// the same key are serialized through this lock.
    pub async fn with_key_lock<F, Fut, T>(&self, key: &CacheKey, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self
            .key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let output = {
            let _guard = lock.lock().await;
            f().await
        };

        drop(lock);
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        output
    }

    pub async fn get_or_fetch(
        &self,
        key: &CacheKey,
        api: &dyn RemoteApi,
    ) -> Result<Value, ApiError> {
        if let Some(entry) = self.get(key).await {
            if !entry.stale {
                debug!(%key, "serving from cache");
                return Ok(entry.value);
            }
        }

        self.with_key_lock(key, || async {
            if let Some(entry) = self.get(key).await {
                if !entry.stale {
                    return Ok(entry.value);
                }
            }

            debug!(%key, "fetching");
            let value = api.fetch(key).await?;
            self.put(key.clone(), value.clone()).await;
            Ok::<_, ApiError>(value)
        })
        .await
    }

    fn remove_entry(&self, key: &CacheKey) {
        self.primary.remove(key);
        if let Some(set) = self.entity_index.get(&key.entity) {
            set.remove(key);
            if set.is_empty() {
                drop(set);
                self.entity_index
                    .remove_if(&key.entity, |_, v| v.is_empty());
            }
        }
    }

    pub fn clear(&self) {
        self.primary.clear();
        self.entity_index.clear();
        self.key_locks.clear();
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.primary.iter().map(|r| r.key().clone()).collect()
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, key: CacheKey) {
        // no receivers is fine
        let _ = self.changes.send(key);
    }
}
