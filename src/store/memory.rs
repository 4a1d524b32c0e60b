use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use tracing::debug;

use super::keys;
use super::{CacheEntry, KeyValueStore};
use crate::error::StoreError;
use crate::lock::mutex_lock;
use crate::telemetry::METRIC_MEMORY_EVICT;

const SOURCE: &str = "store::memory";

pub const DEFAULT_MAX_ENTRIES: usize = 20;

/// Bounded in-memory store. When full, the least recently read or written entry is evicted.
pub struct MemoryStore {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryStore {
    /// A capacity of zero is raised to one.
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "capacity").cap().get()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(mutex_lock(&self.entries, SOURCE, "get").get(key).cloned())
    }

    async fn save(&self, key: &str, entry: CacheEntry) -> Result<(), StoreError> {
        let displaced = mutex_lock(&self.entries, SOURCE, "save").push(key.to_string(), entry);
        if let Some((evicted, _)) = displaced.filter(|(displaced_key, _)| displaced_key != key) {
            counter!(METRIC_MEMORY_EVICT).increment(1);
            debug!(key = %evicted, "Evicted least recently used cache entry");
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        mutex_lock(&self.entries, SOURCE, "delete").pop(key);
        Ok(())
    }

    async fn rename(&self, old_key: &str, new_key: &str) -> Result<(), StoreError> {
        let metadata =
            keys::decode(new_key).map_err(|err| StoreError::from_key_error(new_key, err))?;
        let mut entries = mutex_lock(&self.entries, SOURCE, "rename");
        if let Some(mut entry) = entries.pop(old_key) {
            entry.metadata = metadata;
            entries.push(new_key.to_string(), entry);
        }
        Ok(())
    }

    async fn values(&self) -> Result<BTreeMap<String, CacheEntry>, StoreError> {
        let entries = mutex_lock(&self.entries, SOURCE, "values");
        Ok(entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect())
    }

    async fn find_partial_key(&self, partial: &str) -> Result<Option<String>, StoreError> {
        let entries = mutex_lock(&self.entries, SOURCE, "find_partial_key");
        Ok(keys::latest_matching(
            entries.iter().map(|(key, _)| key.as_str()),
            partial,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntryMetadata;
    use crate::token::RequestFingerprint;

    fn entry(url: &str, cache_date: i64) -> (String, CacheEntry) {
        let metadata = EntryMetadata {
            fingerprint: RequestFingerprint::for_request("GET", url, None, "Doc"),
            cache_date,
            expiry_date: cache_date + 1_000,
            is_compressed: false,
            is_encrypted: false,
        };
        let key = keys::encode(&metadata);
        let entry = CacheEntry {
            metadata,
            declared_type: Some("Doc".into()),
            payload: url.as_bytes().to_vec(),
        };
        (key, entry)
    }

    #[tokio::test]
    async fn least_recently_used_entry_is_evicted_at_capacity() {
        let store = MemoryStore::new(2);
        let (a, entry_a) = entry("/a", 1);
        let (b, entry_b) = entry("/b", 2);
        let (c, entry_c) = entry("/c", 3);

        store.save(&a, entry_a).await.expect("save a");
        store.save(&b, entry_b).await.expect("save b");
        assert!(store.get(&a).await.expect("get a").is_some());
        store.save(&c, entry_c).await.expect("save c");

        assert_eq!(store.len(), 2);
        assert!(store.get(&b).await.expect("get b").is_none());
        assert!(store.get(&a).await.expect("get a").is_some());
        assert!(store.get(&c).await.expect("get c").is_some());
    }

    #[tokio::test]
    async fn overwriting_a_key_does_not_evict() {
        let store = MemoryStore::new(1);
        let (a, entry_a) = entry("/a", 1);
        store.save(&a, entry_a.clone()).await.expect("save");
        store.save(&a, entry_a).await.expect("overwrite");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        assert_eq!(MemoryStore::new(0).capacity(), 1);
        assert_eq!(MemoryStore::default().capacity(), DEFAULT_MAX_ENTRIES);
    }

    #[tokio::test]
    async fn rename_moves_the_entry_and_rewrites_its_metadata() {
        let store = MemoryStore::default();
        let (key, original) = entry("/a", 10);
        store.save(&key, original.clone()).await.expect("save");

        let invalidated = keys::encode(&original.metadata.invalidated());
        store.rename(&key, &invalidated).await.expect("rename");

        assert!(store.get(&key).await.expect("get old").is_none());
        let moved = store
            .get(&invalidated)
            .await
            .expect("get new")
            .expect("entry moved");
        assert_eq!(moved.metadata.expiry_date, 0);
        assert_eq!(moved.payload, original.payload);

        store
            .rename("missing", &invalidated)
            .await
            .expect("renaming a missing key is a no-op");
        assert!(store.rename(&invalidated, "bad").await.is_err());
    }

    #[tokio::test]
    async fn partial_lookup_and_listing_skip_other_requests() {
        let store = MemoryStore::default();
        let (a, entry_a) = entry("/a", 1);
        let (b, entry_b) = entry("/b", 2);
        let prefix = keys::partial(&entry_a.metadata.fingerprint);
        store.save(&a, entry_a).await.expect("save a");
        store.save(&b, entry_b).await.expect("save b");

        assert_eq!(store.find_partial_key(&prefix).await.expect("find"), Some(a));
        assert_eq!(store.values().await.expect("values").len(), 2);

        store.delete("absent").await.expect("deleting a missing key");
    }
}
