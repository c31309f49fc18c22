pub mod cache;
pub mod config;
pub mod errors;
pub mod stream;

pub use cache::{
    credential_fingerprint, BackendKind, CacheBackend, CacheEntry, CacheError, CacheKey,
    CacheStats, CacheStore,
};
pub use config::{AppConfig, ConfigError, LoadOptions, LogFormat};
pub use errors::{ApplicationError, InterfaceError};
pub use stream::{SessionBroker, StreamEvent, Subscription};
