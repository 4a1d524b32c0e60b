#![allow(dead_code)]

use std::future::{self, Ready};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use recall::clock::ManualClock;
use recall::config::CacheSettings;
use recall::store::MemoryStore;
use recall::{
    Encryptor, KeyValueStore, MetadataHolder, NetworkError, PersistenceManager, RequestFingerprint,
    ResponseMetadata, ResponseOrchestrator, SerialisationManager, TransformError, TypeDescriptor,
    TypeRegistry,
};
use serde::{Deserialize, Serialize};

pub const START: i64 = 1_700_000_000_000;

pub type Fetched<T> = Ready<Result<Option<T>, NetworkError>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: u32,
    pub title: String,
    #[serde(skip)]
    pub metadata: Option<ResponseMetadata>,
}

impl Article {
    pub fn new(id: u32, title: &str) -> Self {
        Self {
            id,
            title: title.to_string(),
            metadata: None,
        }
    }

    pub fn missing() -> Self {
        Self::new(0, "")
    }
}

impl MetadataHolder for Article {
    fn set_metadata(&mut self, metadata: ResponseMetadata) {
        self.metadata = Some(metadata);
    }
}

pub fn article_descriptor() -> TypeDescriptor<Article> {
    TypeDescriptor::json("news::Article").with_metadata()
}

pub fn article_fingerprint(id: u32) -> RequestFingerprint {
    RequestFingerprint::for_request(
        "GET",
        &format!("https://news.test/articles/{id}"),
        None,
        "news::Article",
    )
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<dyn KeyValueStore>,
    pub registry: Arc<TypeRegistry>,
    pub orchestrator: ResponseOrchestrator,
}

pub fn harness(settings: CacheSettings) -> Harness {
    harness_with(
        settings,
        Arc::new(MemoryStore::default()),
        SerialisationManager::new(),
    )
}

pub fn harness_with(
    settings: CacheSettings,
    store: Arc<dyn KeyValueStore>,
    serialiser: SerialisationManager,
) -> Harness {
    let clock = Arc::new(ManualClock::at_millis(START));
    let registry = Arc::new(TypeRegistry::new());
    registry.register(article_descriptor());
    let persistence = PersistenceManager::new(store.clone(), serialiser, settings, clock.clone());
    let orchestrator = ResponseOrchestrator::new(persistence, registry.clone(), clock.clone());
    Harness {
        clock,
        store,
        registry,
        orchestrator,
    }
}

pub fn respond<T: Send + 'static>(value: T) -> impl FnOnce() -> Fetched<T> + Send + 'static {
    move || future::ready(Ok(Some(value)))
}

pub fn fail<T: Send + 'static>(
    error: NetworkError,
) -> impl FnOnce() -> Fetched<T> + Send + 'static {
    move || future::ready(Err(error))
}

pub fn nothing<T: Send + 'static>() -> impl FnOnce() -> Fetched<T> + Send + 'static {
    || future::ready(Ok(None))
}

/// Responds with `value` and counts the call in `calls`.
pub fn counted<T: Send + 'static>(
    calls: &Arc<AtomicUsize>,
    value: T,
) -> impl FnOnce() -> Fetched<T> + Send + 'static {
    let calls = Arc::clone(calls);
    move || {
        calls.fetch_add(1, Ordering::SeqCst);
        future::ready(Ok(Some(value)))
    }
}

/// Reversible test cipher with a trailing checksum so tampering is detected.
pub struct XorCipher(pub u8);

impl Encryptor for XorCipher {
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, TransformError> {
        let mut out: Vec<u8> = data.iter().map(|byte| byte ^ self.0).collect();
        out.push(checksum(data));
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, TransformError> {
        let (sum, body) = data
            .split_last()
            .ok_or_else(|| TransformError::Decryption("empty ciphertext".into()))?;
        let plain: Vec<u8> = body.iter().map(|byte| byte ^ self.0).collect();
        if checksum(&plain) != *sum {
            return Err(TransformError::Decryption("checksum mismatch".into()));
        }
        Ok(plain)
    }
}

fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte))
}
