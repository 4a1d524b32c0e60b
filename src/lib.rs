//! Policy-driven response caching.
//!
//! A call names an [`Operation`]; the [`ResponseOrchestrator`] reads the
//! cache, reaches the network when the operation asks for it, writes fresh
//! responses back through the [`PersistenceManager`] and reports what happened
//! in the [`ResponseMetadata`] of the delivered value.

pub mod clock;
pub mod config;
pub mod error;
mod lock;
pub mod operation;
pub mod orchestrator;
pub mod persistence;
pub mod serialisation;
pub mod store;
pub mod telemetry;
pub mod token;

pub use error::{CacheError, SerialisationError, StoreError, TransformError};
pub use operation::{CacheOptions, CachePriority, Operation, OperationPredicate};
pub use orchestrator::{CacheResult, ResponseOrchestrator};
pub use persistence::{CacheLookup, CacheStats, PersistenceManager};
pub use serialisation::{Encryptor, SerialisationManager, TypeDescriptor, TypeRegistry};
pub use store::KeyValueStore;
pub use token::{
    CacheException, CacheStatus, CacheToken, MetadataHolder, NetworkError, RequestFingerprint,
    ResponseMetadata,
};
