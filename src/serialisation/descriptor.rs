//! Response type descriptors and the registry that resolves them by type hash.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{BoxError, CacheError, SerialisationError};
use crate::lock::{rw_read, rw_write};
use crate::token::{MetadataHolder, ResponseMetadata, hash_type_name};

const SOURCE: &str = "serialisation::descriptor";

type EncodeFn<T> = fn(&T) -> Result<Vec<u8>, BoxError>;
type DecodeFn<T> = fn(&[u8]) -> Result<T, BoxError>;

/// Everything the cache needs to know about one response type.
///
/// The name is persisted alongside entries and hashed into request
/// fingerprints, so it must stay stable across releases.
pub struct TypeDescriptor<T> {
    name: String,
    type_hash: String,
    encode: Option<EncodeFn<T>>,
    decode: Option<DecodeFn<T>>,
    attach: Option<fn(&mut T, ResponseMetadata)>,
    empty: Option<fn() -> T>,
}

impl<T> TypeDescriptor<T> {
    /// A type the cache can pass through but never store.
    pub fn opaque(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            type_hash: hash_type_name(&name),
            name,
            encode: None,
            decode: None,
            attach: None,
            empty: None,
        }
    }

    /// Value delivered in place of a failure when nothing else is available.
    pub fn with_empty(mut self, empty: fn() -> T) -> Self {
        self.empty = Some(empty);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_hash(&self) -> &str {
        &self.type_hash
    }

    pub fn can_encode(&self) -> bool {
        self.encode.is_some()
    }

    pub fn supports_metadata(&self) -> bool {
        self.attach.is_some()
    }

    /// `Ok(None)` when the type is not cacheable.
    pub fn encode(&self, value: &T) -> Result<Option<Vec<u8>>, SerialisationError> {
        let Some(encode) = self.encode else {
            return Ok(None);
        };
        encode(value)
            .map(Some)
            .map_err(|source| SerialisationError::Encode {
                type_name: self.name.clone(),
                source,
            })
    }

    pub fn decode(&self, data: &[u8]) -> Result<T, SerialisationError> {
        let decode = self.decode.ok_or_else(|| SerialisationError::NotDecodable {
            type_name: self.name.clone(),
        })?;
        decode(data).map_err(|source| SerialisationError::Decode {
            type_name: self.name.clone(),
            source,
        })
    }

    /// Returns `false` when the type cannot carry metadata.
    pub fn attach_metadata(&self, value: &mut T, metadata: ResponseMetadata) -> bool {
        match self.attach {
            Some(attach) => {
                attach(value, metadata);
                true
            }
            None => false,
        }
    }

    pub fn empty_value(&self) -> Option<T> {
        self.empty.map(|empty| empty())
    }
}

impl<T: Serialize + DeserializeOwned> TypeDescriptor<T> {
    /// Stored as JSON.
    pub fn json(name: impl Into<String>) -> Self {
        Self {
            encode: Some(json_encode::<T>),
            decode: Some(json_decode::<T>),
            ..Self::opaque(name)
        }
    }
}

impl TypeDescriptor<String> {
    /// Stored verbatim as UTF-8.
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            encode: Some(text_encode),
            decode: Some(text_decode),
            ..Self::opaque(name)
        }
    }
}

impl<T: MetadataHolder> TypeDescriptor<T> {
    pub fn with_metadata(mut self) -> Self {
        self.attach = Some(attach_holder::<T>);
        self
    }
}

fn json_encode<T: Serialize>(value: &T) -> Result<Vec<u8>, BoxError> {
    serde_json::to_vec(value).map_err(Into::into)
}

fn json_decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, BoxError> {
    serde_json::from_slice(data).map_err(Into::into)
}

fn text_encode(value: &String) -> Result<Vec<u8>, BoxError> {
    Ok(value.as_bytes().to_vec())
}

fn text_decode(data: &[u8]) -> Result<String, BoxError> {
    String::from_utf8(data.to_vec()).map_err(Into::into)
}

fn attach_holder<T: MetadataHolder>(value: &mut T, metadata: ResponseMetadata) {
    value.set_metadata(metadata);
}

struct Registered {
    name: String,
    descriptor: Arc<dyn Any + Send + Sync>,
}

/// Descriptors keyed by type hash.
#[derive(Default)]
pub struct TypeRegistry {
    entries: RwLock<HashMap<String, Registered>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `descriptor`, replacing any previous registration for the same name.
    pub fn register<T: 'static>(&self, descriptor: TypeDescriptor<T>) -> Arc<TypeDescriptor<T>> {
        let descriptor = Arc::new(descriptor);
        let mut entries = rw_write(&self.entries, SOURCE, "register");
        debug!(
            type_name = descriptor.name(),
            type_hash = descriptor.type_hash(),
            "Registered response type"
        );
        entries.insert(
            descriptor.type_hash().to_string(),
            Registered {
                name: descriptor.name().to_string(),
                descriptor: descriptor.clone(),
            },
        );
        descriptor
    }

    pub fn get<T: 'static>(&self, type_hash: &str) -> Result<Arc<TypeDescriptor<T>>, CacheError> {
        let entries = rw_read(&self.entries, SOURCE, "get");
        let registered = entries
            .get(type_hash)
            .ok_or_else(|| CacheError::UnknownType {
                type_hash: type_hash.to_string(),
            })?;
        registered
            .descriptor
            .clone()
            .downcast::<TypeDescriptor<T>>()
            .map_err(|_| CacheError::TypeMismatch {
                type_hash: type_hash.to_string(),
            })
    }

    pub fn type_name(&self, type_hash: &str) -> Option<String> {
        rw_read(&self.entries, SOURCE, "type_name")
            .get(type_hash)
            .map(|registered| registered.name.clone())
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        #[serde(skip)]
        metadata: Option<ResponseMetadata>,
    }

    impl MetadataHolder for Profile {
        fn set_metadata(&mut self, metadata: ResponseMetadata) {
            self.metadata = Some(metadata);
        }
    }

    #[test]
    fn json_descriptors_encode_and_decode() {
        let descriptor = TypeDescriptor::<Profile>::json("Profile");
        let encoded = descriptor
            .encode(&Profile {
                name: "ada".into(),
                metadata: None,
            })
            .expect("encode")
            .expect("encodable");
        assert_eq!(encoded, br#"{"name":"ada"}"#);
        assert_eq!(descriptor.decode(&encoded).expect("decode").name, "ada");
        assert!(matches!(
            descriptor.decode(b"{"),
            Err(SerialisationError::Decode { .. })
        ));
    }

    #[test]
    fn text_is_stored_verbatim() {
        let descriptor = TypeDescriptor::text("Body");
        assert_eq!(
            descriptor.encode(&"héllo".to_string()).expect("encode"),
            Some("héllo".as_bytes().to_vec())
        );
        assert!(descriptor.decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn opaque_types_are_not_cacheable() {
        let descriptor = TypeDescriptor::<u32>::opaque("Handle").with_empty(|| 0);
        assert!(!descriptor.can_encode());
        assert_eq!(descriptor.encode(&7).expect("encode"), None);
        assert!(matches!(
            descriptor.decode(b"7"),
            Err(SerialisationError::NotDecodable { .. })
        ));
        assert_eq!(descriptor.empty_value(), Some(0));
        assert!(!descriptor.supports_metadata());
    }

    #[test]
    fn registry_resolves_by_hash_and_checks_the_type() {
        let registry = TypeRegistry::new();
        let registered =
            registry.register(TypeDescriptor::<Profile>::json("Profile").with_metadata());
        let hash = registered.type_hash().to_string();

        let found = registry.get::<Profile>(&hash).expect("registered");
        assert!(found.supports_metadata());
        assert_eq!(registry.type_name(&hash).as_deref(), Some("Profile"));

        assert!(matches!(
            registry.get::<String>(&hash),
            Err(CacheError::TypeMismatch { .. })
        ));
        assert!(matches!(
            registry.get::<Profile>("0000"),
            Err(CacheError::UnknownType { .. })
        ));
    }
}
