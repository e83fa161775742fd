use std::{future::Future, sync::Arc};

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::api::{ApiError, RemoteApi};
use crate::cache::QueryCache;
use crate::types::CacheKey;

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("remote call failed: {0}")]
    Remote(#[from] ApiError),
}

/// Two-phase value swap over the [`QueryCache`]: speculative value first, then the
/// server's canonical value on success or the exact previous entry on failure.
pub struct MutationCoordinator {
    cache: Arc<QueryCache>,
    api: Arc<dyn RemoteApi>,
}

impl MutationCoordinator {
    pub fn new(cache: Arc<QueryCache>, api: Arc<dyn RemoteApi>) -> Self {
        Self { cache, api }
    }

    pub async fn mutate<F, Fut>(
        &self,
        key: &CacheKey,
        optimistic: Value,
        remote: F,
    ) -> Result<Value, MutationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ApiError>>,
    {
        self.mutate_with(key, move |_| optimistic, remote).await
    }

    pub async fn mutate_with<P, F, Fut>(
        &self,
        key: &CacheKey,
        speculate: P,
        remote: F,
    ) -> Result<Value, MutationError>
    where
        P: FnOnce(Option<&Value>) -> Value,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, ApiError>>,
    {
        let cache = &self.cache;
        cache
            .with_key_lock(key, || async {
                let previous = cache.get(key).await;
                let optimistic = speculate(previous.as_ref().map(|entry| &entry.value));
                let revision = cache.put(key.clone(), optimistic).await;
                debug!(%key, "optimistic value applied");

                match remote().await {
                    Ok(canonical) => {
                        cache.put(key.clone(), canonical.clone()).await;
                        debug!(%key, "mutation confirmed");
                        Ok(canonical)
                    }
                    Err(e) => {
                        if cache.rollback(key, revision, previous).await {
                            warn!(%key, error = %e, "mutation failed, rolled back");
                        } else {
                            warn!(%key, error = %e, "mutation failed after a newer write, marked stale");
                        }
                        Err(MutationError::Remote(e))
                    }
                }
            })
            .await
    }

    pub async fn toggle_favorite(&self, restaurant_id: &str) -> Result<Value, MutationError> {
        let key = CacheKey::restaurant(restaurant_id);
        let api = self.api.clone();
        self.mutate_with(
            &key,
            |current| {
                let favorite = current
                    .and_then(|v| v["is_favorite"].as_bool())
                    .unwrap_or(false);
                with_field(current, restaurant_id, "is_favorite", json!(!favorite))
            },
            || async move { api.toggle_favorite(restaurant_id).await },
        )
        .await
    }

    pub async fn set_item_availability(
        &self,
        restaurant_id: &str,
        item_id: &str,
        available: bool,
    ) -> Result<Value, MutationError> {
        let key = CacheKey::menu_item(restaurant_id, item_id);
        let api = self.api.clone();
        self.mutate_with(
            &key,
            |current| with_field(current, item_id, "available", json!(available)),
            || async move {
                api.set_item_availability(restaurant_id, item_id, available)
                    .await
            },
        )
        .await
    }

    pub async fn set_driver_availability(
        &self,
        driver_id: &str,
        available: bool,
    ) -> Result<Value, MutationError> {
        let key = CacheKey::driver_profile(driver_id);
        let api = self.api.clone();
        self.mutate_with(
            &key,
            |current| with_field(current, driver_id, "is_available", json!(available)),
            || async move { api.set_driver_availability(driver_id, available).await },
        )
        .await
    }
}

fn with_field(current: Option<&Value>, id: &str, field: &str, value: Value) -> Value {
    let mut next = match current {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => json!({ "id": id }),
    };
    next[field] = value;
    next
}
