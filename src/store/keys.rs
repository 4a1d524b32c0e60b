//! Cache key codec.
//!
//! A key carries all of an entry's metadata so backends without columns can
//! answer freshness questions from the key alone:
//!
//! ```text
//! {request_hash}_{type_hash}_{cache_date_ms}_{expiry_date_ms}_{compressed}{encrypted}
//! ```
//!
//! Every entry for one fingerprint shares the `{request_hash}_{type_hash}_`
//! prefix, which is what partial lookups match on.

use thiserror::Error;

use crate::token::RequestFingerprint;

const SEPARATOR: char = '_';
const FIELD_COUNT: usize = 5;

/// Metadata encoded in a cache key. Dates are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub fingerprint: RequestFingerprint,
    pub cache_date: i64,
    pub expiry_date: i64,
    pub is_compressed: bool,
    pub is_encrypted: bool,
}

impl EntryMetadata {
    pub fn is_stale_at(&self, now_millis: i64) -> bool {
        now_millis > self.expiry_date
    }

    /// Same entry with its expiry moved to the epoch.
    pub fn invalidated(&self) -> Self {
        Self {
            expiry_date: 0,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("expected {FIELD_COUNT} fields, found {0}")]
    FieldCount(usize),
    #[error("invalid hash field `{0}`")]
    Hash(String),
    #[error("invalid timestamp `{0}`")]
    Timestamp(String),
    #[error("invalid flags `{0}`")]
    Flags(String),
}

pub fn encode(metadata: &EntryMetadata) -> String {
    format!(
        "{}{}{SEPARATOR}{}{SEPARATOR}{}{}",
        partial(&metadata.fingerprint),
        metadata.cache_date,
        metadata.expiry_date,
        flag(metadata.is_compressed),
        flag(metadata.is_encrypted),
    )
}

/// Prefix shared by every key of one fingerprint.
pub fn partial(fingerprint: &RequestFingerprint) -> String {
    format!(
        "{}{SEPARATOR}{}{SEPARATOR}",
        fingerprint.request_hash(),
        fingerprint.type_hash()
    )
}

pub fn decode(key: &str) -> Result<EntryMetadata, KeyError> {
    let fields: Vec<&str> = key.split(SEPARATOR).collect();
    let [request_hash, type_hash, cache_date, expiry_date, flags] = fields.as_slice() else {
        return Err(KeyError::FieldCount(fields.len()));
    };

    let fingerprint = parse_fingerprint(request_hash, type_hash)?;
    let (is_compressed, is_encrypted) = match flags.as_bytes() {
        [c, e] => (parse_flag(*c, flags)?, parse_flag(*e, flags)?),
        _ => return Err(KeyError::Flags((*flags).to_string())),
    };

    Ok(EntryMetadata {
        fingerprint,
        cache_date: parse_millis(cache_date)?,
        expiry_date: parse_millis(expiry_date)?,
        is_compressed,
        is_encrypted,
    })
}

/// Parses a prefix produced by [`partial`] back into its fingerprint.
pub fn decode_partial(partial: &str) -> Result<RequestFingerprint, KeyError> {
    let trimmed = partial.strip_suffix(SEPARATOR).unwrap_or(partial);
    let fields: Vec<&str> = trimmed.split(SEPARATOR).collect();
    match fields.as_slice() {
        [request_hash, type_hash] => parse_fingerprint(request_hash, type_hash),
        _ => Err(KeyError::FieldCount(fields.len())),
    }
}

pub fn is_valid(key: &str) -> bool {
    decode(key).is_ok()
}

/// Most recently cached key starting with `partial`. Malformed keys are skipped.
pub fn latest_matching<'a>(
    keys: impl IntoIterator<Item = &'a str>,
    partial: &str,
) -> Option<String> {
    keys.into_iter()
        .filter(|key| key.starts_with(partial))
        .filter_map(|key| decode(key).ok().map(|meta| (meta.cache_date, key)))
        .max_by_key(|(cache_date, _)| *cache_date)
        .map(|(_, key)| key.to_string())
}

fn parse_fingerprint(request_hash: &str, type_hash: &str) -> Result<RequestFingerprint, KeyError> {
    RequestFingerprint::from_parts(request_hash, type_hash)
        .map_err(|_| KeyError::Hash(format!("{request_hash}{SEPARATOR}{type_hash}")))
}

fn parse_millis(field: &str) -> Result<i64, KeyError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(KeyError::Timestamp(field.to_string()));
    }
    field
        .parse()
        .map_err(|_| KeyError::Timestamp(field.to_string()))
}

fn parse_flag(byte: u8, flags: &str) -> Result<bool, KeyError> {
    match byte {
        b'0' => Ok(false),
        b'1' => Ok(true),
        _ => Err(KeyError::Flags(flags.to_string())),
    }
}

fn flag(value: bool) -> char {
    if value { '1' } else { '0' }
}
