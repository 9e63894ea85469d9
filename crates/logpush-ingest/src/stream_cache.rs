// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::StreamRecord;
use crate::stream_store::StreamStore;

pub const DEFAULT_STREAM_CACHE_TTL: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct CacheEntry {
    /// `None` is a tombstone for an id the store does not know.
    stream: Option<Arc<StreamRecord>>,
    expires_at: Instant,
}

struct CacheState {
    entries: HashMap<Uuid, CacheEntry>,
    next_sweep: Instant,
}

/// TTL cache in front of a [`StreamStore`].
///
/// Found and not-found lookups are cached for the same TTL; store failures are not cached.
/// Expired entries are evicted by a sweep that piggybacks on lookups at most once per minute.
pub struct StreamCache {
    store: Arc<dyn StreamStore + Send + Sync>,
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl StreamCache {
    pub fn new(store: Arc<dyn StreamStore + Send + Sync>, ttl: Duration) -> Self {
        StreamCache {
            store,
            ttl,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                next_sweep: Instant::now() + SWEEP_INTERVAL,
            }),
        }
    }

    pub async fn resolve(&self, id: Uuid) -> Result<Arc<StreamRecord>, StoreError> {
        if let Some(cached) = self.cached(id) {
            return cached.ok_or(StoreError::NotFound);
        }

        match self.store.get(id).await {
            Ok(stream) => {
                let stream = Arc::new(stream);
                self.insert(id, Some(Arc::clone(&stream)));
                Ok(stream)
            }
            Err(StoreError::NotFound) => {
                self.insert(id, None);
                Err(StoreError::NotFound)
            }
            Err(err) => Err(err),
        }
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, id: Uuid) -> Option<Option<Arc<StreamRecord>>> {
        let now = Instant::now();
        let mut state = self.lock();

        if state.next_sweep <= now {
            let before = state.entries.len();
            state.entries.retain(|_, entry| entry.expires_at > now);
            state.next_sweep = now + SWEEP_INTERVAL;
            debug!(
                "Stream cache sweep evicted {} entries",
                before - state.entries.len()
            );
        }

        match state.entries.get(&id) {
            Some(entry) if entry.expires_at > now => Some(entry.stream.clone()),
            _ => None,
        }
    }

    fn insert(&self, id: Uuid, stream: Option<Arc<StreamRecord>>) {
        let expires_at = Instant::now() + self.ttl;
        self.lock()
            .entries
            .insert(id, CacheEntry { stream, expires_at });
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Labels;
    use crate::stream_store::MemoryStreamStore;
    use chrono::Utc;

    fn test_stream() -> StreamRecord {
        StreamRecord {
            id: Uuid::new_v4(),
            name: "frontend".to_string(),
            created_at: Utc::now(),
            labels: Labels::new(),
            token: None,
        }
    }

    fn cache_with(streams: Vec<StreamRecord>) -> (Arc<MemoryStreamStore>, StreamCache) {
        let store = Arc::new(MemoryStreamStore::new(streams));
        let cache = StreamCache::new(store.clone(), DEFAULT_STREAM_CACHE_TTL);
        (store, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn test_found_stream_is_cached() {
        let stream = test_stream();
        let (store, cache) = cache_with(vec![stream.clone()]);

        assert_eq!(*cache.resolve(stream.id).await.unwrap(), stream);
        assert_eq!(*cache.resolve(stream.id).await.unwrap(), stream);
        assert_eq!(store.lookups(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_lookup_is_cached() {
        let (store, cache) = cache_with(vec![]);
        let missing = Uuid::new_v4();

        assert!(matches!(
            cache.resolve(missing).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            cache.resolve(missing).await,
            Err(StoreError::NotFound)
        ));
        assert_eq!(store.lookups(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_after_ttl_requeries_store() {
        let stream = test_stream();
        let (store, cache) = cache_with(vec![stream.clone()]);

        cache.resolve(stream.id).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.resolve(stream.id).await.unwrap();
        assert_eq!(store.lookups(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        cache.resolve(stream.id).await.unwrap();
        assert_eq!(store.lookups(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_errors_are_not_cached() {
        let store = Arc::new(MemoryStreamStore::failing("connection reset"));
        let cache = StreamCache::new(store.clone(), DEFAULT_STREAM_CACHE_TTL);
        let id = Uuid::new_v4();

        assert!(matches!(
            cache.resolve(id).await,
            Err(StoreError::Backend(_))
        ));
        assert!(matches!(
            cache.resolve(id).await,
            Err(StoreError::Backend(_))
        ));
        assert_eq!(store.lookups(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_expired_entries_on_access() {
        let first = test_stream();
        let second = test_stream();
        let (_, cache) = cache_with(vec![first.clone(), second.clone()]);

        cache.resolve(first.id).await.unwrap();
        let _ = cache.resolve(Uuid::new_v4()).await;
        assert_eq!(cache.len(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.resolve(second.id).await.unwrap();

        // both earlier entries expired and were swept, only the fresh lookup remains
        assert_eq!(cache.len(), 1);
    }
}
