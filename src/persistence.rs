//! Reads and writes cache entries for one request at a time.

use std::collections::BTreeMap;
use std::sync::Arc;

use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, duration_millis, from_unix_millis, unix_millis};
use crate::config::CacheSettings;
use crate::error::CacheError;
use crate::operation::EffectivePlan;
use crate::serialisation::{SerialisationManager, TypeDescriptor};
use crate::store::{CacheEntry, ClearFilter, EntryMetadata, KeyValueStore, keys};
use crate::telemetry::{METRIC_HIT, METRIC_MISS, METRIC_STALE};
use crate::token::{CacheStatus, CacheToken, Instruction, RequestFingerprint};

/// A value read from the cache with the token describing it.
#[derive(Debug, Clone)]
pub struct CachedResponse<T> {
    pub value: T,
    pub token: CacheToken,
}

/// Outcome of reading the cache for one request.
#[derive(Debug, Clone)]
pub enum CacheLookup<T> {
    /// A readable entry the operation accepts.
    Hit(CachedResponse<T>),
    /// An expired entry the operation does not accept. Its token still carries
    /// the stored flags for the write that replaces it.
    Rejected(CacheToken),
    Miss,
}

impl<T> CacheLookup<T> {
    pub fn into_hit(self) -> Option<CachedResponse<T>> {
        match self {
            Self::Hit(hit) => Some(hit),
            Self::Rejected(_) | Self::Miss => None,
        }
    }

    /// Token of whatever entry was found, usable or not.
    pub fn stored_token(&self) -> Option<&CacheToken> {
        match self {
            Self::Hit(hit) => Some(&hit.token),
            Self::Rejected(token) => Some(token),
            Self::Miss => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheWrite {
    /// Token updated with the stored dates and applied flags.
    Cached(CacheToken),
    /// The value could not be serialised and nothing was stored.
    NotCached,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub stale: usize,
    pub encrypted: usize,
    pub compressed: usize,
    pub payload_bytes: usize,
    /// Entry counts keyed by type hash.
    pub by_type: BTreeMap<String, usize>,
}

pub struct PersistenceManager {
    store: Arc<dyn KeyValueStore>,
    serialiser: SerialisationManager,
    settings: CacheSettings,
    clock: Arc<dyn Clock>,
}

impl PersistenceManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        serialiser: SerialisationManager,
        settings: CacheSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            serialiser,
            settings,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Reads the newest entry for the instruction's fingerprint.
    ///
    /// Expired entries are returned as [`CacheStatus::Stale`] only when the
    /// operation accepts stale data; otherwise their token comes back as
    /// [`CacheLookup::Rejected`]. Unreadable entries are deleted and reported as a miss.
    #[instrument(skip_all, fields(fingerprint = %instruction.fingerprint))]
    pub async fn get_cached_response<T>(
        &self,
        instruction: &Instruction,
        descriptor: &Arc<TypeDescriptor<T>>,
        fetch_date: OffsetDateTime,
    ) -> Result<CacheLookup<T>, CacheError>
    where
        T: Send + 'static,
    {
        let plan = EffectivePlan::resolve(&instruction.operation);
        let partial = keys::partial(&instruction.fingerprint);

        let Some(key) = self.store.find_partial_key(&partial).await? else {
            counter!(METRIC_MISS).increment(1);
            debug!("No cached entry");
            return Ok(CacheLookup::Miss);
        };
        let Some(entry) = self.store.get(&key).await? else {
            counter!(METRIC_MISS).increment(1);
            return Ok(CacheLookup::Miss);
        };

        let metadata = entry.metadata;
        let stale = metadata.is_stale_at(unix_millis(self.clock.now()));
        if stale && !plan.accepts_stale {
            counter!(METRIC_MISS).increment(1);
            debug!(key = %key, "Cached entry expired and stale data is not accepted");
            return Ok(CacheLookup::Rejected(token_for(
                instruction.clone(),
                CacheStatus::Stale,
                fetch_date,
                &metadata,
            )));
        }

        let serialiser = self.serialiser.clone();
        let decoder = Arc::clone(descriptor);
        let payload = entry.payload;
        let (is_encrypted, is_compressed) = (metadata.is_encrypted, metadata.is_compressed);
        let value = tokio::task::spawn_blocking(move || {
            serialiser.deserialise(&payload, &decoder, is_encrypted, is_compressed, |_| {})
        })
        .await?;
        let Some(value) = value else {
            self.store.delete(&key).await?;
            info!(key = %key, "Purged unreadable cache entry");
            counter!(METRIC_MISS).increment(1);
            return Ok(CacheLookup::Miss);
        };

        let status = if stale {
            counter!(METRIC_STALE).increment(1);
            CacheStatus::Stale
        } else {
            counter!(METRIC_HIT).increment(1);
            CacheStatus::Fresh
        };
        debug!(key = %key, %status, "Cached entry found");

        Ok(CacheLookup::Hit(CachedResponse {
            value,
            token: token_for(instruction.clone(), status, fetch_date, &metadata),
        }))
    }

    /// Stores `value` for the token's request and hands it back with the outcome.
    ///
    /// Encryption and compression come from the previously cached entry if
    /// there is one, then the operation's options, then the global defaults.
    /// Values that cannot be serialised are skipped, not failed.
    #[instrument(skip_all, fields(fingerprint = %token.fingerprint()))]
    pub async fn cache<T>(
        &self,
        token: &CacheToken,
        descriptor: &Arc<TypeDescriptor<T>>,
        value: T,
        previous: Option<&CacheToken>,
    ) -> Result<(T, CacheWrite), CacheError>
    where
        T: Send + 'static,
    {
        let options = token
            .instruction
            .operation
            .options()
            .cloned()
            .unwrap_or_default();
        let encrypt = previous
            .map(|prior| prior.is_encrypted)
            .or(options.encrypt)
            .unwrap_or(self.settings.encrypt_by_default);
        let compress = previous
            .map(|prior| prior.is_compressed)
            .or(options.compress)
            .unwrap_or(self.settings.compress_by_default);
        let duration = options.duration.unwrap_or(self.settings.default_duration);

        let serialiser = self.serialiser.clone();
        let encoder = Arc::clone(descriptor);
        let (value, serialised) = tokio::task::spawn_blocking(move || {
            let serialised = serialiser.serialise(&value, &encoder, encrypt, compress);
            (value, serialised)
        })
        .await?;
        let payload = match serialised {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(type_name = descriptor.name(), "Response type is not cacheable");
                return Ok((value, CacheWrite::NotCached));
            }
            Err(err) => {
                warn!(
                    type_name = descriptor.name(),
                    error = %err,
                    "Could not serialise response, skipping cache write"
                );
                return Ok((value, CacheWrite::NotCached));
            }
        };

        let cache_date = unix_millis(self.clock.now());
        let metadata = EntryMetadata {
            fingerprint: token.fingerprint().clone(),
            cache_date,
            expiry_date: cache_date.saturating_add(duration_millis(duration)),
            is_compressed: payload.is_compressed,
            is_encrypted: payload.is_encrypted,
        };
        let key = keys::encode(&metadata);
        let superseded = self
            .store
            .find_partial_key(&keys::partial(&metadata.fingerprint))
            .await?;

        self.store
            .save(
                &key,
                CacheEntry {
                    metadata: metadata.clone(),
                    declared_type: Some(descriptor.name().to_string()),
                    payload: payload.data,
                },
            )
            .await?;
        if let Some(old_key) = superseded.filter(|old_key| *old_key != key) {
            self.store.delete(&old_key).await?;
        }

        debug!(
            key = %key,
            encrypted = metadata.is_encrypted,
            compressed = metadata.is_compressed,
            "Cached response"
        );
        let stored = token_for(
            token.instruction.clone(),
            token.status,
            token.fetch_date,
            &metadata,
        );
        Ok((value, CacheWrite::Cached(stored)))
    }

    /// Marks the entry for `fingerprint` as expired. Returns whether an entry exists.
    ///
    /// Invalidating twice has the same effect as once.
    #[instrument(skip_all, fields(fingerprint = %fingerprint))]
    pub async fn invalidate(&self, fingerprint: &RequestFingerprint) -> Result<bool, CacheError> {
        let Some(key) = self.store.find_partial_key(&keys::partial(fingerprint)).await? else {
            return Ok(false);
        };
        let metadata = match keys::decode(&key) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(key = %key, error = %err, "Cannot invalidate entry with malformed key");
                return Ok(false);
            }
        };
        if metadata.expiry_date == 0 {
            return Ok(true);
        }

        let invalidated = keys::encode(&metadata.invalidated());
        self.store.rename(&key, &invalidated).await?;
        debug!(key = %invalidated, "Invalidated cached entry");
        Ok(true)
    }

    /// Invalidates first when the instruction's operation asks for it.
    pub async fn invalidate_if_needed(
        &self,
        instruction: &Instruction,
    ) -> Result<bool, CacheError> {
        if EffectivePlan::resolve(&instruction.operation).must_invalidate_first {
            self.invalidate(&instruction.fingerprint).await
        } else {
            Ok(false)
        }
    }

    /// Removes entries of `type_filter` (or of every type), optionally only expired ones.
    pub async fn clear_cache(
        &self,
        type_filter: Option<&str>,
        stale_only: bool,
    ) -> Result<u64, CacheError> {
        let expired_before = stale_only.then(|| unix_millis(self.clock.now()));
        let removed = self
            .store
            .clear(&ClearFilter::new(type_filter, expired_before))
            .await?;
        info!(
            backend = self.store.backend(),
            type_filter,
            stale_only,
            removed,
            "Cleared cache"
        );
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let now = unix_millis(self.clock.now());
        let mut stats = CacheStats::default();
        for entry in self.store.values().await?.into_values() {
            let metadata = &entry.metadata;
            stats.entries += 1;
            stats.stale += usize::from(metadata.is_stale_at(now));
            stats.encrypted += usize::from(metadata.is_encrypted);
            stats.compressed += usize::from(metadata.is_compressed);
            stats.payload_bytes += entry.payload.len();
            *stats
                .by_type
                .entry(metadata.fingerprint.type_hash().to_string())
                .or_default() += 1;
        }
        Ok(stats)
    }
}

fn token_for(
    instruction: Instruction,
    status: CacheStatus,
    fetch_date: OffsetDateTime,
    metadata: &EntryMetadata,
) -> CacheToken {
    CacheToken {
        instruction,
        status,
        fetch_date,
        cache_date: Some(from_unix_millis(metadata.cache_date)),
        expiry_date: Some(from_unix_millis(metadata.expiry_date)),
        is_compressed: metadata.is_compressed,
        is_encrypted: metadata.is_encrypted,
    }
}
