//! Request identity, per-request cache state and the metadata handed back to callers.

use std::fmt;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

use crate::operation::Operation;

const TYPE_HASH_LEN: usize = 16;

/// Stable identity of a request: what was asked for and which response type it yields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint {
    request_hash: String,
    type_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid fingerprint component `{value}`: expected lowercase hex")]
pub struct FingerprintError {
    value: String,
}

impl RequestFingerprint {
    /// Fingerprints a request. Query parameter order and URL fragments do not affect the hash.
    pub fn for_request(method: &str, url: &str, body: Option<&[u8]>, type_name: &str) -> Self {
        Self {
            request_hash: hash_request(method, url, body),
            type_hash: hash_type_name(type_name),
        }
    }

    pub fn from_parts(
        request_hash: impl Into<String>,
        type_hash: impl Into<String>,
    ) -> Result<Self, FingerprintError> {
        let request_hash = request_hash.into();
        let type_hash = type_hash.into();
        for value in [&request_hash, &type_hash] {
            if !is_hex(value) {
                return Err(FingerprintError {
                    value: value.clone(),
                });
            }
        }
        Ok(Self {
            request_hash,
            type_hash,
        })
    }

    pub fn request_hash(&self) -> &str {
        &self.request_hash
    }

    pub fn type_hash(&self) -> &str {
        &self.type_hash
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.request_hash, self.type_hash)
    }
}

fn is_hex(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

pub fn hash_type_name(type_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(type_name.as_bytes());
    let mut hash = hex::encode(hasher.finalize());
    hash.truncate(TYPE_HASH_LEN);
    hash
}

fn hash_request(method: &str, url: &str, body: Option<&[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.trim().to_ascii_uppercase().as_bytes());
    hasher.update(b" ");
    hasher.update(normalize_url(url).as_bytes());
    if let Some(body) = body {
        hasher.update(b"\n");
        hasher.update(body);
    }
    hex::encode(hasher.finalize())
}

fn normalize_url(raw: &str) -> String {
    let Ok(mut parsed) = Url::parse(raw.trim()) else {
        return raw.trim().to_string();
    };
    parsed.set_fragment(None);

    let mut pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();
    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        pairs.sort();
        parsed.query_pairs_mut().clear().extend_pairs(pairs.iter());
    }
    parsed.to_string()
}

/// The operation requested for one call, bound to the request it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub operation: Operation,
    pub fingerprint: RequestFingerprint,
}

impl Instruction {
    pub fn new(operation: Operation, fingerprint: RequestFingerprint) -> Self {
        Self {
            operation,
            fingerprint,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    /// Nothing was delivered.
    Empty,
    /// Served from the cache within its expiry.
    Fresh,
    /// Served from the cache past its expiry.
    Stale,
    /// Fetched from the network with no prior cached copy, then cached.
    Network,
    /// Fetched from the network replacing a cached copy.
    Refreshed,
    /// A refresh failed and the stale cached copy was delivered instead.
    CouldNotRefresh,
    /// Fetched from the network and deliberately or unavoidably not cached.
    NotCached,
    /// A local-only operation completed.
    Done,
}

impl CacheStatus {
    pub fn is_fresh(self) -> bool {
        matches!(
            self,
            Self::Fresh | Self::Network | Self::Refreshed | Self::NotCached
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Fresh => "fresh",
            Self::Stale => "stale",
            Self::Network => "network",
            Self::Refreshed => "refreshed",
            Self::CouldNotRefresh => "could_not_refresh",
            Self::NotCached => "not_cached",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request cache state. Dates are absent until a value has been cached or read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheToken {
    pub instruction: Instruction,
    pub status: CacheStatus,
    pub fetch_date: OffsetDateTime,
    pub cache_date: Option<OffsetDateTime>,
    pub expiry_date: Option<OffsetDateTime>,
    pub is_compressed: bool,
    pub is_encrypted: bool,
}

impl CacheToken {
    pub fn new(instruction: Instruction, fetch_date: OffsetDateTime) -> Self {
        Self {
            instruction,
            status: CacheStatus::Empty,
            fetch_date,
            cache_date: None,
            expiry_date: None,
            is_compressed: false,
            is_encrypted: false,
        }
    }

    pub fn with_status(mut self, status: CacheStatus) -> Self {
        self.status = status;
        self
    }

    pub fn fingerprint(&self) -> &RequestFingerprint {
        &self.instruction.fingerprint
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallDuration {
    pub fetch: Duration,
    pub cache: Duration,
    pub total: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("upstream responded with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream request timed out")]
    Timeout,
}

impl NetworkError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

/// Why a call delivered a fallback or nothing at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheException {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("upstream produced no response")]
    EmptyResponse,
    #[error("no usable cached response is available offline")]
    OfflineMiss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMetadata {
    pub cache_token: CacheToken,
    pub exception: Option<CacheException>,
    pub call_duration: CallDuration,
}

/// Response types that can carry the metadata of the call that produced them.
pub trait MetadataHolder {
    fn set_metadata(&mut self, metadata: ResponseMetadata);
}
