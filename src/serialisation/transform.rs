//! Byte-level stages applied after encoding: encryption, then gzip compression.

use std::io::Read;
use std::sync::Arc;

use flate2::Compression;
use flate2::read::{GzDecoder, GzEncoder};

use crate::error::TransformError;

pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// A reversible byte transform. Stages run in order on write and in reverse on read.
pub trait Transform: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, data: &[u8]) -> Result<Vec<u8>, TransformError>;

    fn reverse(&self, data: &[u8]) -> Result<Vec<u8>, TransformError>;
}

/// Pluggable cipher. The cache never sees keys.
pub trait Encryptor: Send + Sync {
    /// An unavailable encryptor is skipped on write.
    fn is_available(&self) -> bool {
        true
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, TransformError>;

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, TransformError>;
}

#[derive(Debug, Clone, Copy)]
pub struct Gzip {
    level: u32,
}

impl Gzip {
    /// Levels above 9 are clamped.
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }
}

impl Default for Gzip {
    fn default() -> Self {
        Self::with_level(DEFAULT_COMPRESSION_LEVEL)
    }
}

impl Transform for Gzip {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn apply(&self, data: &[u8]) -> Result<Vec<u8>, TransformError> {
        let mut encoder = GzEncoder::new(data, Compression::new(self.level));
        let mut compressed = Vec::new();
        encoder
            .read_to_end(&mut compressed)
            .map_err(TransformError::Compression)?;
        Ok(compressed)
    }

    fn reverse(&self, data: &[u8]) -> Result<Vec<u8>, TransformError> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(TransformError::Decompression)?;
        Ok(decompressed)
    }
}

#[derive(Clone)]
pub struct Encryption {
    encryptor: Arc<dyn Encryptor>,
}

impl Encryption {
    pub fn new(encryptor: Arc<dyn Encryptor>) -> Self {
        Self { encryptor }
    }

    pub fn is_available(&self) -> bool {
        self.encryptor.is_available()
    }
}

impl Transform for Encryption {
    fn name(&self) -> &'static str {
        "encryption"
    }

    fn apply(&self, data: &[u8]) -> Result<Vec<u8>, TransformError> {
        self.encryptor.encrypt(data)
    }

    fn reverse(&self, data: &[u8]) -> Result<Vec<u8>, TransformError> {
        self.encryptor.decrypt(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_shrinks_repetitive_payloads() {
        let gzip = Gzip::default();
        let data = "response body ".repeat(200);
        let compressed = gzip.apply(data.as_bytes()).expect("compress");
        assert!(compressed.len() < data.len());
        assert_eq!(gzip.reverse(&compressed).expect("decompress"), data.as_bytes());
    }

    #[test]
    fn gzip_rejects_garbage() {
        let err = Gzip::default()
            .reverse(b"definitely not gzip")
            .expect_err("garbage input");
        assert!(matches!(err, TransformError::Decompression(_)));
    }

    #[test]
    fn compression_level_is_clamped() {
        assert_eq!(Gzip::with_level(42).level(), 9);
        assert_eq!(Gzip::default().level(), DEFAULT_COMPRESSION_LEVEL);
    }
}
