use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::{debug, info, warn};

use super::keys::{self, EntryMetadata};
use super::{CacheEntry, ClearFilter, KeyValueStore};
use crate::error::StoreError;
use crate::token::{RequestFingerprint, hash_type_name};

const MAX_CONNECTIONS: u32 = 5;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS recall_cache (\
    token TEXT PRIMARY KEY NOT NULL, \
    cache_date INTEGER NOT NULL, \
    expiry_date INTEGER NOT NULL, \
    data BLOB NOT NULL, \
    class TEXT NOT NULL, \
    is_compressed INTEGER NOT NULL, \
    is_encrypted INTEGER NOT NULL)";

const CREATE_EXPIRY_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS recall_cache_expiry ON recall_cache (expiry_date)";

const SELECT_COLUMNS: &str = "SELECT token, cache_date, expiry_date, data, class, \
                              is_compressed, is_encrypted FROM recall_cache";

/// Table-backed store. One row per request; the key's dates and flags are kept as columns.
///
/// Operations address an exact key: a row whose dates or flags differ from the key is treated
/// as absent.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct EntryRow {
    token: String,
    cache_date: i64,
    expiry_date: i64,
    data: Vec<u8>,
    class: String,
    is_compressed: bool,
    is_encrypted: bool,
}

impl EntryRow {
    fn into_entry(self) -> Option<(String, CacheEntry)> {
        let fingerprint = RequestFingerprint::from_parts(self.token, hash_type_name(&self.class))
            .ok()?;
        let metadata = EntryMetadata {
            fingerprint,
            cache_date: self.cache_date,
            expiry_date: self.expiry_date,
            is_compressed: self.is_compressed,
            is_encrypted: self.is_encrypted,
        };
        Some((
            keys::encode(&metadata),
            CacheEntry {
                metadata,
                declared_type: Some(self.class),
                payload: self.data,
            },
        ))
    }
}

fn decode_key(key: &str) -> Result<EntryMetadata, StoreError> {
    keys::decode(key).map_err(|err| StoreError::from_key_error(key, err))
}

impl SqliteStore {
    /// Connects to `url` (for example `sqlite://cache.db` or `sqlite::memory:`) and creates the
    /// table.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let in_memory = url.contains(":memory:");
        // Every in-memory connection is its own database, so keep exactly one alive.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(MAX_CONNECTIONS)
        };
        let pool = pool_options.connect_with(options).await?;

        info!(url, in_memory, "Connected sqlite cache store");
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_EXPIRY_INDEX).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn row_for(&self, token: &str) -> Result<Option<EntryRow>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE token = ? LIMIT 1");
        let row = sqlx::query_as::<_, EntryRow>(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let Ok(requested) = keys::decode(key) else {
            debug!(key, "Ignoring lookup of malformed cache key");
            return Ok(None);
        };
        let Some(row) = self.row_for(requested.fingerprint.request_hash()).await? else {
            return Ok(None);
        };
        Ok(row
            .into_entry()
            .filter(|(stored_key, _)| stored_key == key)
            .map(|(_, entry)| entry))
    }

    async fn save(&self, key: &str, entry: CacheEntry) -> Result<(), StoreError> {
        let metadata = decode_key(key)?;
        let class = entry
            .declared_type
            .ok_or_else(|| StoreError::MissingDeclaredType { key: key.to_string() })?;
        if hash_type_name(&class) != metadata.fingerprint.type_hash() {
            return Err(StoreError::invalid_key(
                key,
                format!("type hash does not match declared type `{class}`"),
            ));
        }

        sqlx::query(
            "INSERT OR REPLACE INTO recall_cache \
             (token, cache_date, expiry_date, data, class, is_compressed, is_encrypted) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(metadata.fingerprint.request_hash())
        .bind(metadata.cache_date)
        .bind(metadata.expiry_date)
        .bind(entry.payload)
        .bind(class)
        .bind(metadata.is_compressed)
        .bind(metadata.is_encrypted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let metadata = decode_key(key)?;
        sqlx::query(
            "DELETE FROM recall_cache \
             WHERE token = ? AND cache_date = ? AND expiry_date = ? \
             AND is_compressed = ? AND is_encrypted = ?",
        )
        .bind(metadata.fingerprint.request_hash())
        .bind(metadata.cache_date)
        .bind(metadata.expiry_date)
        .bind(metadata.is_compressed)
        .bind(metadata.is_encrypted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn rename(&self, old_key: &str, new_key: &str) -> Result<(), StoreError> {
        let old = decode_key(old_key)?;
        let new = decode_key(new_key)?;
        let result = sqlx::query(
            "UPDATE recall_cache \
             SET token = ?, cache_date = ?, expiry_date = ?, is_compressed = ?, is_encrypted = ? \
             WHERE token = ? AND cache_date = ? AND expiry_date = ? \
             AND is_compressed = ? AND is_encrypted = ?",
        )
        .bind(new.fingerprint.request_hash())
        .bind(new.cache_date)
        .bind(new.expiry_date)
        .bind(new.is_compressed)
        .bind(new.is_encrypted)
        .bind(old.fingerprint.request_hash())
        .bind(old.cache_date)
        .bind(old.expiry_date)
        .bind(old.is_compressed)
        .bind(old.is_encrypted)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(old_key, "Rename matched no cache row");
        }
        Ok(())
    }

    async fn values(&self) -> Result<BTreeMap<String, CacheEntry>, StoreError> {
        let rows = sqlx::query_as::<_, EntryRow>(SELECT_COLUMNS)
            .fetch_all(&self.pool)
            .await?;
        let mut values = BTreeMap::new();
        for row in rows {
            let token = row.token.clone();
            match row.into_entry() {
                Some((key, entry)) => {
                    values.insert(key, entry);
                }
                None => warn!(token = %token, "Skipping cache row with a malformed token"),
            }
        }
        Ok(values)
    }

    async fn find_partial_key(&self, partial: &str) -> Result<Option<String>, StoreError> {
        let Ok(fingerprint) = keys::decode_partial(partial) else {
            return Ok(None);
        };
        let Some(row) = self.row_for(fingerprint.request_hash()).await? else {
            return Ok(None);
        };
        Ok(row
            .into_entry()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(partial)))
    }

    async fn clear(&self, filter: &ClearFilter) -> Result<u64, StoreError> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("DELETE FROM recall_cache");
        match (filter.expired_before(), filter.type_name()) {
            (Some(before), Some(class)) => {
                qb.push(" WHERE expiry_date < ");
                qb.push_bind(before);
                qb.push(" AND class = ");
                qb.push_bind(class.to_string());
            }
            (None, Some(class)) => {
                qb.push(" WHERE class = ");
                qb.push_bind(class.to_string());
            }
            (Some(before), None) => {
                qb.push(" WHERE expiry_date < ");
                qb.push_bind(before);
            }
            (None, None) => {}
        }

        let removed = qb.build().execute(&self.pool).await?.rows_affected();
        debug!(removed, type_name = filter.type_name(), "Cleared cache rows");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite")
    }

    fn entry(
        url: &str,
        type_name: &str,
        cache_date: i64,
        expiry_date: i64,
    ) -> (String, CacheEntry) {
        let metadata = EntryMetadata {
            fingerprint: RequestFingerprint::for_request("GET", url, None, type_name),
            cache_date,
            expiry_date,
            is_compressed: true,
            is_encrypted: false,
        };
        (
            keys::encode(&metadata),
            CacheEntry {
                metadata,
                declared_type: Some(type_name.to_string()),
                payload: vec![1, 2, 3],
            },
        )
    }

    #[tokio::test]
    async fn saving_the_same_request_replaces_the_row() {
        let store = store().await;
        let (first_key, first) = entry("/a", "Doc", 1, 100);
        let (second_key, second) = entry("/a", "Doc", 2, 200);

        store.save(&first_key, first).await.expect("save first");
        store.save(&second_key, second.clone()).await.expect("save second");

        let values = store.values().await.expect("values");
        assert_eq!(values.len(), 1);
        assert_eq!(values.get(&second_key), Some(&second));
        assert_eq!(store.get(&first_key).await.expect("get old key"), None);

        store.delete(&first_key).await.expect("delete superseded key");
        assert!(store.get(&second_key).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn keys_differing_only_in_flags_do_not_touch_the_new_row() {
        let store = store().await;
        let (old_key, old) = entry("/a", "Doc", 5, 500);
        let mut replacement = old.clone();
        replacement.metadata.is_compressed = false;
        let new_key = keys::encode(&replacement.metadata);
        assert_ne!(old_key, new_key);

        store.save(&old_key, old).await.expect("save old");
        store.save(&new_key, replacement.clone()).await.expect("save new");
        store.delete(&old_key).await.expect("delete superseded key");
        store
            .rename(&old_key, &keys::encode(&replacement.metadata.invalidated()))
            .await
            .expect("rename superseded key");

        let values = store.values().await.expect("values");
        assert_eq!(values.len(), 1);
        assert_eq!(values.get(&new_key), Some(&replacement));
    }

    #[tokio::test]
    async fn partial_lookup_checks_the_response_type() {
        let store = store().await;
        let (key, doc) = entry("/a", "Doc", 1, 100);
        store.save(&key, doc.clone()).await.expect("save");

        let partial = keys::partial(&doc.metadata.fingerprint);
        assert_eq!(store.find_partial_key(&partial).await.expect("find"), Some(key));

        let other_type = RequestFingerprint::for_request("GET", "/a", None, "User");
        assert_eq!(
            store
                .find_partial_key(&keys::partial(&other_type))
                .await
                .expect("find other type"),
            None
        );
    }

    #[tokio::test]
    async fn rename_rewrites_the_date_columns() {
        let store = store().await;
        let (key, doc) = entry("/a", "Doc", 1, 100);
        store.save(&key, doc.clone()).await.expect("save");

        let invalidated = keys::encode(&doc.metadata.invalidated());
        store.rename(&key, &invalidated).await.expect("rename");

        let moved = store.get(&invalidated).await.expect("get").expect("row");
        assert_eq!(moved.metadata.expiry_date, 0);
        assert_eq!(moved.declared_type.as_deref(), Some("Doc"));
    }

    #[tokio::test]
    async fn entries_without_a_declared_type_are_rejected() {
        let store = store().await;
        let (key, mut doc) = entry("/a", "Doc", 1, 100);
        doc.declared_type = None;
        assert!(matches!(
            store.save(&key, doc).await,
            Err(StoreError::MissingDeclaredType { .. })
        ));
    }

    #[tokio::test]
    async fn clear_applies_type_and_expiry_clauses() {
        let store = store().await;
        let rows = [
            entry("/a", "Doc", 1, 10),
            entry("/b", "Doc", 1, 500),
            entry("/c", "User", 1, 10),
            entry("/d", "User", 1, 500),
        ];
        for (key, entry) in rows.iter().cloned() {
            store.save(&key, entry).await.expect("save");
        }

        let stale_docs = ClearFilter::new(Some("Doc"), Some(100));
        assert_eq!(store.clear(&stale_docs).await.expect("stale docs"), 1);

        let stale = ClearFilter::new(None, Some(100));
        assert_eq!(store.clear(&stale).await.expect("stale"), 1);

        let users = ClearFilter::new(Some("User"), None);
        assert_eq!(store.clear(&users).await.expect("users"), 1);

        assert_eq!(store.clear(&ClearFilter::all()).await.expect("all"), 1);
        assert!(store.values().await.expect("values").is_empty());
    }
}
