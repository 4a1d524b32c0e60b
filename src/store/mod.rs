//! Key/value storage behind the cache.
//!
//! Three backends share one contract: a SQL table ([`SqliteStore`]), a
//! directory of files named by their keys ([`FileStore`]), and a bounded
//! in-memory LRU ([`MemoryStore`]).

pub mod keys;

mod file;
mod memory;
mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::{StoreBackend, StoreSettings};
use crate::error::StoreError;
use crate::token::hash_type_name;

pub use file::FileStore;
pub use keys::{EntryMetadata, KeyError};
pub use memory::{DEFAULT_MAX_ENTRIES, MemoryStore};
pub use sqlite::SqliteStore;

/// A stored value together with the metadata its key encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub metadata: EntryMetadata,
    /// Name of the response type. The file backend does not keep it outside the payload.
    pub declared_type: Option<String>,
    pub payload: Vec<u8>,
}

/// Selects entries for [`KeyValueStore::clear`]. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClearFilter {
    type_name: Option<String>,
    type_hash: Option<String>,
    expired_before: Option<i64>,
}

impl ClearFilter {
    pub fn new(type_name: Option<&str>, expired_before: Option<i64>) -> Self {
        Self {
            type_name: type_name.map(str::to_string),
            type_hash: type_name.map(hash_type_name),
            expired_before,
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    pub fn expired_before(&self) -> Option<i64> {
        self.expired_before
    }

    pub fn matches(&self, metadata: &EntryMetadata) -> bool {
        let type_matches = self
            .type_hash
            .as_deref()
            .is_none_or(|hash| metadata.fingerprint.type_hash() == hash);
        let expiry_matches = self
            .expired_before
            .is_none_or(|before| metadata.expiry_date < before);
        type_matches && expiry_matches
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Stores `entry` under `key`, replacing any entry already there.
    async fn save(&self, key: &str, entry: CacheEntry) -> Result<(), StoreError>;

    /// Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Moves an entry to a new key. Renaming a missing key succeeds and does nothing.
    async fn rename(&self, old_key: &str, new_key: &str) -> Result<(), StoreError>;

    async fn values(&self) -> Result<BTreeMap<String, CacheEntry>, StoreError>;

    /// Newest key starting with `partial`.
    async fn find_partial_key(&self, partial: &str) -> Result<Option<String>, StoreError>;

    /// Deletes matching entries and returns how many were removed.
    async fn clear(&self, filter: &ClearFilter) -> Result<u64, StoreError> {
        let mut removed = 0;
        for (key, entry) in self.values().await? {
            if filter.matches(&entry.metadata) {
                self.delete(&key).await?;
                removed += 1;
            }
        }
        debug!(
            backend = self.backend(),
            removed,
            type_name = filter.type_name(),
            "Cleared cache entries"
        );
        Ok(removed)
    }
}

/// Opens the backend selected in `settings`.
pub async fn open(settings: &StoreSettings) -> Result<Arc<dyn KeyValueStore>, StoreError> {
    let store: Arc<dyn KeyValueStore> = match settings.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(settings.memory_max_entries)),
        StoreBackend::File => Arc::new(FileStore::open(&settings.directory).await?),
        StoreBackend::Sqlite => Arc::new(SqliteStore::connect(&settings.database_url).await?),
    };
    Ok(store)
}
