//! Error types for stores, value transforms, serialisation and the orchestrator.

use std::error::Error as StdError;

use thiserror::Error;

use crate::config::LoadError;
use crate::store::keys::KeyError;
use crate::token::CacheException;

pub type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid cache key `{key}`: {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("entry `{key}` has no declared type name")]
    MissingDeclaredType { key: String },
}

impl StoreError {
    pub fn invalid_key(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn from_key_error(key: &str, err: KeyError) -> Self {
        Self::invalid_key(key, err)
    }
}

/// Failure of a single byte-level stage (compression or encryption).
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("compression failed: {0}")]
    Compression(#[source] std::io::Error),
    #[error("decompression failed: {0}")]
    Decompression(#[source] std::io::Error),
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("encryption is not available")]
    EncryptionUnavailable,
}

#[derive(Debug, Error)]
pub enum SerialisationError {
    #[error("failed to encode `{type_name}`: {source}")]
    Encode {
        type_name: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to decode `{type_name}`: {source}")]
    Decode {
        type_name: String,
        #[source]
        source: BoxError,
    },
    #[error("`{type_name}` cannot be decoded from stored bytes")]
    NotDecodable { type_name: String },
    #[error("stored type `{found}` does not match expected `{expected}`")]
    TypeMismatch { expected: String, found: String },
    #[error("stored payload carries no type header")]
    MissingTypeHeader,
    #[error(transparent)]
    Transform(#[from] TransformError),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no type is registered for hash `{type_hash}`")]
    UnknownType { type_hash: String },
    #[error("type registered for hash `{type_hash}` is not the requested type")]
    TypeMismatch { type_hash: String },
    #[error(
        "could not add cache metadata to `{type_name}`: the response type does not hold metadata"
    )]
    MetadataUnsupported { type_name: String },
    #[error("upstream call failed: {0}")]
    Upstream(#[source] CacheException),
    #[error("cache task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Config(#[from] LoadError),
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
