//! Drives one cached call from operation to delivered value.
//!
//! The orchestrator invalidates when asked, reads the cache, decides between
//! the cached value and the network, writes fresh values back and attaches
//! [`ResponseMetadata`] to whatever it delivers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use time::OffsetDateTime;
use tracing::{Instrument, debug, info_span, instrument, warn};

use crate::clock::{Clock, elapsed};
use crate::config::CacheSettings;
use crate::error::CacheError;
use crate::operation::{EffectivePlan, Operation, Step};
use crate::persistence::{
    CacheLookup, CacheStats, CacheWrite, CachedResponse, PersistenceManager,
};
use crate::serialisation::{TypeDescriptor, TypeRegistry};
use crate::telemetry::{METRIC_CALL_DURATION_MS, METRIC_UPSTREAM_FAILURE};
use crate::token::{
    CacheException, CacheStatus, CacheToken, CallDuration, Instruction, NetworkError,
    RequestFingerprint, ResponseMetadata,
};

/// What a call delivers: a value (possibly synthesised) and the metadata of the call.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
    pub value: Option<T>,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Default, Clone, Copy)]
struct Timings {
    fetch: Duration,
    cache: Duration,
}

struct Inner {
    persistence: Arc<PersistenceManager>,
    registry: Arc<TypeRegistry>,
    settings: CacheSettings,
    clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct ResponseOrchestrator {
    inner: Arc<Inner>,
}

impl ResponseOrchestrator {
    pub fn new(
        persistence: PersistenceManager,
        registry: Arc<TypeRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let settings = persistence.settings().clone();
        Self {
            inner: Arc::new(Inner {
                persistence: Arc::new(persistence),
                registry,
                settings,
                clock,
            }),
        }
    }

    pub fn persistence(&self) -> &PersistenceManager {
        &self.inner.persistence
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.inner.registry
    }

    /// Operation for a call that may not have named one, per the configured predicate.
    pub fn resolve_operation(&self, explicit: Option<Operation>) -> Option<Operation> {
        self.inner
            .settings
            .predicate
            .operation_for(explicit, self.inner.settings.default_duration)
    }

    /// Runs one call under `operation`.
    ///
    /// `fetch` performs the network call and is invoked at most once in the
    /// caller's task; a refresh behind a stale value runs it on a detached task
    /// instead. Cache writes always run to completion, even if the returned
    /// future is dropped.
    ///
    /// The response type must be registered under the fingerprint's type hash.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: Operation,
        fingerprint: RequestFingerprint,
        fetch: F,
    ) -> Result<CacheResult<T>, CacheError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, NetworkError>> + Send + 'static,
    {
        let start = self.inner.clock.now();
        let descriptor = self.inner.registry.get::<T>(fingerprint.type_hash())?;
        let instruction = Instruction::new(operation, fingerprint);
        let plan = EffectivePlan::resolve(&instruction.operation);
        let token = CacheToken::new(instruction, start);
        let span = info_span!(
            "recall.execute",
            operation = token.instruction.operation.name(),
            fingerprint = %token.fingerprint(),
            type_name = descriptor.name(),
        );

        self.run(plan, token, descriptor, fetch, start)
            .instrument(span)
            .await
    }

    async fn run<T, F, Fut>(
        &self,
        plan: EffectivePlan,
        token: CacheToken,
        descriptor: Arc<TypeDescriptor<T>>,
        fetch: F,
        start: OffsetDateTime,
    ) -> Result<CacheResult<T>, CacheError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, NetworkError>> + Send + 'static,
    {
        let persistence = &self.inner.persistence;
        let mut timings = Timings::default();

        if let Operation::Clear {
            type_filter,
            stale_only,
        } = &token.instruction.operation
        {
            let cache_start = self.inner.clock.now();
            persistence
                .clear_cache(type_filter.as_deref(), *stale_only)
                .await?;
            timings.cache = elapsed(cache_start, self.inner.clock.now());
            return Ok(self.local_result(token, timings, start));
        }

        if plan.must_invalidate_first {
            let cache_start = self.inner.clock.now();
            persistence.invalidate(token.fingerprint()).await?;
            timings.cache += elapsed(cache_start, self.inner.clock.now());
        }
        if plan.is_local_only() {
            return Ok(self.local_result(token, timings, start));
        }

        let lookup = if plan.reads_cache {
            let cache_start = self.inner.clock.now();
            let lookup = persistence
                .get_cached_response(&token.instruction, &descriptor, start)
                .await?;
            timings.cache += elapsed(cache_start, self.inner.clock.now());
            lookup
        } else {
            CacheLookup::Miss
        };
        // A rejected stale entry is never delivered, but its flags carry over to the rewrite.
        let previous = lookup.stored_token().cloned();
        let cached = lookup.into_hit();

        let step = plan.next_step(cached.as_ref().map(|hit| hit.token.status));
        debug!(?step, "Resolved cache step");

        match (step, cached) {
            (Step::ReturnCached, Some(hit)) => {
                self.deliver(&descriptor, Some(hit.value), hit.token, None, timings, start)
            }
            (Step::ReturnCachedAndRefresh, Some(hit)) => {
                self.spawn_refresh(token, descriptor.clone(), hit.token.clone(), fetch);
                self.deliver(&descriptor, Some(hit.value), hit.token, None, timings, start)
            }
            (Step::Fetch { fallback_to_cached }, cached) => {
                let fallback = if fallback_to_cached { cached } else { None };
                self.fetch_and_store(
                    plan, token, descriptor, fetch, previous, fallback, timings, start,
                )
                .await
            }
            (_, _) => {
                let exception = if plan.is_offline_only {
                    CacheException::OfflineMiss
                } else {
                    CacheException::EmptyResponse
                };
                self.deliver(
                    &descriptor,
                    None,
                    token.with_status(CacheStatus::Empty),
                    Some(exception),
                    timings,
                    start,
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_and_store<T, F, Fut>(
        &self,
        plan: EffectivePlan,
        token: CacheToken,
        descriptor: Arc<TypeDescriptor<T>>,
        fetch: F,
        previous: Option<CacheToken>,
        fallback: Option<CachedResponse<T>>,
        mut timings: Timings,
        start: OffsetDateTime,
    ) -> Result<CacheResult<T>, CacheError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, NetworkError>> + Send + 'static,
    {
        let fetch_start = self.inner.clock.now();
        let outcome = fetch().await;
        timings.fetch = elapsed(fetch_start, self.inner.clock.now());

        let exception = match outcome {
            Ok(Some(value)) => {
                if !plan.writes_cache {
                    let token = token.with_status(CacheStatus::NotCached);
                    return self.deliver(&descriptor, Some(value), token, None, timings, start);
                }

                let refreshing = previous.is_some();
                let cache_start = self.inner.clock.now();
                let (value, write) = persist(
                    self.inner.persistence.clone(),
                    token.clone(),
                    descriptor.clone(),
                    value,
                    previous,
                )
                .await?;
                timings.cache += elapsed(cache_start, self.inner.clock.now());

                let token = match write {
                    CacheWrite::Cached(token) => token.with_status(if refreshing {
                        CacheStatus::Refreshed
                    } else {
                        CacheStatus::Network
                    }),
                    CacheWrite::NotCached => token.with_status(CacheStatus::NotCached),
                };
                return self.deliver(&descriptor, Some(value), token, None, timings, start);
            }
            Ok(None) => CacheException::EmptyResponse,
            Err(err) => CacheException::Network(err),
        };

        counter!(METRIC_UPSTREAM_FAILURE).increment(1);
        warn!(error = %exception, "Upstream fetch failed");

        match fallback {
            Some(stale) => self.deliver(
                &descriptor,
                Some(stale.value),
                stale.token.with_status(CacheStatus::CouldNotRefresh),
                Some(exception),
                timings,
                start,
            ),
            None => self.deliver(
                &descriptor,
                None,
                token.with_status(CacheStatus::Empty),
                Some(exception),
                timings,
                start,
            ),
        }
    }

    /// Fetches and re-caches behind a stale value that has already been delivered.
    fn spawn_refresh<T, F, Fut>(
        &self,
        token: CacheToken,
        descriptor: Arc<TypeDescriptor<T>>,
        previous: CacheToken,
        fetch: F,
    ) where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, NetworkError>> + Send + 'static,
    {
        let persistence = self.inner.persistence.clone();
        let span = info_span!("recall.refresh", fingerprint = %token.fingerprint());
        tokio::spawn(
            async move {
                let value = match fetch().await {
                    Ok(Some(value)) => value,
                    Ok(None) => {
                        counter!(METRIC_UPSTREAM_FAILURE).increment(1);
                        debug!("Background refresh produced no response");
                        return;
                    }
                    Err(err) => {
                        counter!(METRIC_UPSTREAM_FAILURE).increment(1);
                        warn!(error = %err, "Background refresh failed");
                        return;
                    }
                };
                match persistence
                    .cache(&token, &descriptor, value, Some(&previous))
                    .await
                {
                    Ok((_, CacheWrite::Cached(_))) => debug!("Background refresh stored"),
                    Ok((_, CacheWrite::NotCached)) => {
                        debug!("Background refresh was not cacheable")
                    }
                    Err(err) => warn!(error = %err, "Background refresh could not be stored"),
                }
            }
            .instrument(span),
        );
    }

    fn local_result<T>(
        &self,
        token: CacheToken,
        timings: Timings,
        start: OffsetDateTime,
    ) -> CacheResult<T> {
        CacheResult {
            value: None,
            metadata: self.metadata(token.with_status(CacheStatus::Done), None, timings, start),
        }
    }

    fn metadata(
        &self,
        token: CacheToken,
        exception: Option<CacheException>,
        timings: Timings,
        start: OffsetDateTime,
    ) -> ResponseMetadata {
        let total = elapsed(start, self.inner.clock.now());
        histogram!(METRIC_CALL_DURATION_MS).record(total.as_secs_f64() * 1_000.0);
        ResponseMetadata {
            cache_token: token,
            exception,
            call_duration: CallDuration {
                fetch: timings.fetch,
                cache: timings.cache,
                total,
            },
        }
    }

    /// Attaches metadata, substituting the type's empty value when nothing was obtained.
    fn deliver<T>(
        &self,
        descriptor: &TypeDescriptor<T>,
        value: Option<T>,
        token: CacheToken,
        exception: Option<CacheException>,
        timings: Timings,
        start: OffsetDateTime,
    ) -> Result<CacheResult<T>, CacheError> {
        let metadata = self.metadata(token, exception, timings, start);
        let mut value = match value.or_else(|| descriptor.empty_value()) {
            Some(value) => value,
            None => {
                let exception = metadata
                    .exception
                    .clone()
                    .unwrap_or(CacheException::EmptyResponse);
                return Err(CacheError::Upstream(exception));
            }
        };

        if !descriptor.attach_metadata(&mut value, metadata.clone()) {
            if self.inner.settings.require_metadata {
                return Err(CacheError::MetadataUnsupported {
                    type_name: descriptor.name().to_string(),
                });
            }
            debug!(
                type_name = descriptor.name(),
                "Response type does not hold metadata"
            );
        }

        Ok(CacheResult {
            value: Some(value),
            metadata,
        })
    }

    /// Removes entries of one response type, or of every type.
    #[instrument(skip(self))]
    pub async fn clear_cache(
        &self,
        type_filter: Option<&str>,
        stale_only: bool,
    ) -> Result<u64, CacheError> {
        self.inner
            .persistence
            .clear_cache(type_filter, stale_only)
            .await
    }

    pub async fn invalidate(&self, fingerprint: &RequestFingerprint) -> Result<bool, CacheError> {
        self.inner.persistence.invalidate(fingerprint).await
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        self.inner.persistence.stats().await
    }
}

/// Stores on a spawned task so the write completes even if the caller stops waiting.
async fn persist<T>(
    persistence: Arc<PersistenceManager>,
    token: CacheToken,
    descriptor: Arc<TypeDescriptor<T>>,
    value: T,
    previous: Option<CacheToken>,
) -> Result<(T, CacheWrite), CacheError>
where
    T: Send + Sync + 'static,
{
    tokio::spawn(
        async move {
            persistence
                .cache(&token, &descriptor, value, previous.as_ref())
                .await
        }
        .in_current_span(),
    )
    .await?
}
