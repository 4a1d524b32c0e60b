//! Turns response values into stored bytes and back.
//!
//! Writing runs encode, optional type header, encryption, then compression.
//! Reading undoes the same stages in reverse. A failed read never surfaces as
//! an error: the entry is reported through a callback and treated as absent.

mod descriptor;
mod transform;

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use crate::error::{SerialisationError, TransformError};
use crate::telemetry::METRIC_CORRUPT;

pub use descriptor::{TypeDescriptor, TypeRegistry};
pub use transform::{DEFAULT_COMPRESSION_LEVEL, Encryption, Encryptor, Gzip, Transform};

const HEADER_TERMINATOR: u8 = b'\n';

/// Bytes ready for storage, with the stages that were actually applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialisedPayload {
    pub data: Vec<u8>,
    pub is_encrypted: bool,
    pub is_compressed: bool,
}

#[derive(Clone)]
pub struct SerialisationManager {
    compression: Gzip,
    encryption: Option<Encryption>,
    embed_type_header: bool,
    require_encryption: bool,
}

impl Default for SerialisationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialisationManager {
    pub fn new() -> Self {
        Self {
            compression: Gzip::default(),
            encryption: None,
            embed_type_header: false,
            require_encryption: false,
        }
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryption = Some(Encryption::new(encryptor));
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression = Gzip::with_level(level);
        self
    }

    /// Prefix payloads with the type name. Needed by backends that keep no type column.
    pub fn with_type_header(mut self, embed: bool) -> Self {
        self.embed_type_header = embed;
        self
    }

    /// Refuse to store plaintext when encryption was requested but cannot be applied.
    pub fn with_required_encryption(mut self, required: bool) -> Self {
        self.require_encryption = required;
        self
    }

    pub fn encryption_available(&self) -> bool {
        self.encryption
            .as_ref()
            .is_some_and(Encryption::is_available)
    }

    /// `Ok(None)` when the type is not cacheable.
    pub fn serialise<T>(
        &self,
        value: &T,
        descriptor: &TypeDescriptor<T>,
        encrypt: bool,
        compress: bool,
    ) -> Result<Option<SerialisedPayload>, SerialisationError> {
        let Some(mut data) = descriptor.encode(value)? else {
            return Ok(None);
        };

        if self.embed_type_header {
            let mut framed = Vec::with_capacity(descriptor.name().len() + 1 + data.len());
            framed.extend_from_slice(descriptor.name().as_bytes());
            framed.push(HEADER_TERMINATOR);
            framed.extend_from_slice(&data);
            data = framed;
        }

        let mut is_encrypted = false;
        if encrypt {
            match self.encrypt(&data) {
                Ok(encrypted) => {
                    data = encrypted;
                    is_encrypted = true;
                }
                Err(err) if self.require_encryption => return Err(err.into()),
                Err(err) => {
                    warn!(
                        type_name = descriptor.name(),
                        error = %err,
                        "Encryption unavailable, storing plaintext"
                    );
                }
            }
        }

        let is_compressed = compress;
        if compress {
            let original = data.len();
            data = self.compression.apply(&data)?;
            debug!(
                type_name = descriptor.name(),
                original_bytes = original,
                compressed_bytes = data.len(),
                ratio = data.len() as f64 / original.max(1) as f64,
                "Compressed cache payload"
            );
        }

        Ok(Some(SerialisedPayload {
            data,
            is_encrypted,
            is_compressed,
        }))
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, TransformError> {
        match &self.encryption {
            Some(encryption) if encryption.is_available() => encryption.apply(data),
            _ => Err(TransformError::EncryptionUnavailable),
        }
    }

    /// Reverses [`serialise`](Self::serialise). On any failure `on_corruption` runs once and
    /// `None` is returned.
    pub fn deserialise<T>(
        &self,
        data: &[u8],
        descriptor: &TypeDescriptor<T>,
        is_encrypted: bool,
        is_compressed: bool,
        on_corruption: impl FnOnce(&SerialisationError),
    ) -> Option<T> {
        match self.try_deserialise(data, descriptor, is_encrypted, is_compressed) {
            Ok(value) => Some(value),
            Err(err) => {
                counter!(METRIC_CORRUPT).increment(1);
                warn!(
                    type_name = descriptor.name(),
                    is_encrypted,
                    is_compressed,
                    error = %err,
                    "Discarding unreadable cache payload"
                );
                on_corruption(&err);
                None
            }
        }
    }

    fn try_deserialise<T>(
        &self,
        data: &[u8],
        descriptor: &TypeDescriptor<T>,
        is_encrypted: bool,
        is_compressed: bool,
    ) -> Result<T, SerialisationError> {
        let mut bytes = data.to_vec();
        if is_compressed {
            bytes = self.compression.reverse(&bytes)?;
        }
        if is_encrypted {
            let encryption = self
                .encryption
                .as_ref()
                .ok_or(TransformError::EncryptionUnavailable)?;
            bytes = encryption.reverse(&bytes)?;
        }

        let body = if self.embed_type_header {
            strip_type_header(&bytes, descriptor.name())?
        } else {
            &bytes[..]
        };
        descriptor.decode(body)
    }
}

fn strip_type_header<'a>(data: &'a [u8], expected: &str) -> Result<&'a [u8], SerialisationError> {
    let split = data
        .iter()
        .position(|&b| b == HEADER_TERMINATOR)
        .ok_or(SerialisationError::MissingTypeHeader)?;
    let (header, rest) = data.split_at(split);
    if header != expected.as_bytes() {
        return Err(SerialisationError::TypeMismatch {
            expected: expected.to_string(),
            found: String::from_utf8_lossy(header).into_owned(),
        });
    }
    Ok(&rest[1..])
}
