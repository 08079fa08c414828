//! In-memory entity caches.
//!
//! Each cache holds an `Arc` snapshot. A bulk reset swaps in a freshly built
//! snapshot with a single assignment, so readers see either the old set or
//! the new set and never a mix.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::api::{EntityApi, FetchFilter};
use crate::error::{Error, Result};
use crate::models::Entity;

#[derive(Debug, Clone)]
struct Snapshot<T> {
    items: Vec<T>,
    index: HashMap<String, usize>,
}

impl<T: Entity> Snapshot<T> {
    fn empty() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Build from a list; for duplicate ids the last value wins at the
    /// position of the first occurrence
    fn from_items(items: Vec<T>) -> Self {
        let mut snapshot = Self::empty();
        for item in items {
            snapshot.upsert(item);
        }
        snapshot
    }

    fn upsert(&mut self, item: T) -> bool {
        match self.index.get(item.id()) {
            Some(&pos) => {
                self.items[pos] = item;
                false
            }
            None => {
                self.index.insert(item.id().to_string(), self.items.len());
                self.items.push(item);
                true
            }
        }
    }

    fn remove(&mut self, id: &str) -> Option<T> {
        let pos = self.index.remove(id)?;
        let item = self.items.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(item)
    }
}

struct CacheState<T> {
    snapshot: Arc<Snapshot<T>>,
    /// Set once a full load has been stored via `reset`
    loaded: bool,
}

/// Id-keyed entity store with unique ids and stable order
pub struct EntityCache<T: Entity> {
    state: RwLock<CacheState<T>>,
}

impl<T: Entity> Default for EntityCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> EntityCache<T> {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CacheState {
                snapshot: Arc::new(Snapshot::empty()),
                loaded: false,
            }),
        }
    }

    /// Replace the entire contents and mark the cache loaded
    pub async fn reset(&self, items: Vec<T>) {
        let snapshot = Arc::new(Snapshot::from_items(items));
        let mut state = self.state.write().await;
        state.snapshot = snapshot;
        state.loaded = true;
    }

    pub async fn get(&self, id: &str) -> Option<T> {
        let state = self.state.read().await;
        let snapshot = &state.snapshot;
        snapshot.index.get(id).map(|&pos| snapshot.items[pos].clone())
    }

    /// Insert or replace; returns `true` when the id was not cached before
    pub async fn set(&self, item: T) -> bool {
        let mut state = self.state.write().await;
        Arc::make_mut(&mut state.snapshot).upsert(item)
    }

    /// Upsert every item under one write lock, returning how many ids were new
    pub async fn set_many(&self, items: impl IntoIterator<Item = T>) -> usize {
        let mut state = self.state.write().await;
        let snapshot = Arc::make_mut(&mut state.snapshot);
        let mut added = 0;
        for item in items {
            if snapshot.upsert(item) {
                added += 1;
            }
        }
        added
    }

    pub async fn remove(&self, id: &str) -> Option<T> {
        let mut state = self.state.write().await;
        if !state.snapshot.index.contains_key(id) {
            return None;
        }
        Arc::make_mut(&mut state.snapshot).remove(id)
    }

    pub async fn get_all(&self) -> Vec<T> {
        self.state.read().await.snapshot.items.clone()
    }

    pub async fn is_loaded(&self) -> bool {
        self.state.read().await.loaded
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.snapshot.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop everything and return to the never-loaded state
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.snapshot = Arc::new(Snapshot::empty());
        state.loaded = false;
    }
}

/// Lazily loaded cache in front of a remote entity API
pub struct CachedEntityManager<T: Entity> {
    api: Arc<dyn EntityApi<T>>,
    cache: EntityCache<T>,
    load_lock: Mutex<()>,
}

impl<T: Entity> CachedEntityManager<T> {
    pub fn new(api: Arc<dyn EntityApi<T>>) -> Self {
        Self {
            api,
            cache: EntityCache::new(),
            load_lock: Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &EntityCache<T> {
        &self.cache
    }

    /// Every cached entity, loading them all on first use.
    ///
    /// Concurrent first callers share one load.
    pub async fn get_all_cached(&self) -> Result<Vec<T>> {
        if !self.cache.is_loaded().await {
            let _guard = self.load_lock.lock().await;
            if !self.cache.is_loaded().await {
                self.load_cache().await?;
            }
        }

        Ok(self.cache.get_all().await)
    }

    async fn load_cache(&self) -> Result<()> {
        let items = self.api.fetch_all(&FetchFilter::default()).await?;
        info!(entity = T::ENTITY_NAME, count = items.len(), "Loaded cache");
        self.cache.reset(items).await;
        Ok(())
    }

    /// Cached entity, or fetch it and cache it.
    ///
    /// Misses are not coalesced: concurrent callers may each fetch.
    pub async fn get_by_id(&self, id: &str) -> Result<T> {
        if let Some(entity) = self.cache.get(id).await {
            return Ok(entity);
        }

        debug!(entity = T::ENTITY_NAME, id, "Cache miss");

        let entity = self
            .api
            .fetch_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(T::ENTITY_NAME, id))?;

        self.cache.set(entity.clone()).await;
        Ok(entity)
    }

    /// Merge changed or created entities, returning them in input order
    pub async fn resolve(&self, items: Vec<T>) -> Vec<T> {
        let added = self.cache.set_many(items.iter().cloned()).await;
        debug!(
            entity = T::ENTITY_NAME,
            count = items.len(),
            added,
            "Resolved entities"
        );
        items
    }

    /// Patch an entity remotely and merge the server's copy
    pub async fn update(&self, id: &str, patch: Value) -> Result<T> {
        let entity = self.api.update(id, patch).await?;
        self.cache.set(entity.clone()).await;
        Ok(entity)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.api.delete(id).await?;
        self.cache.remove(id).await;
        Ok(())
    }

    /// Forget the cache; the next `get_all_cached` reloads from the server
    pub async fn invalidate(&self) {
        self.cache.clear().await;
    }
}
