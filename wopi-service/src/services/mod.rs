pub mod discovery;
pub mod gateway;
pub mod kv;
pub mod metrics;
pub mod storage;
pub mod token_store;

pub use discovery::{resolve_app, DiscoveryClient};
pub use gateway::{ByteRange, FileContent, FileGateway, PutOutcome};
pub use kv::{ExpiringStore, MemoryStore, RedisStore};
pub use storage::{LocalStorage, Storage, StorageError};
pub use token_store::{TokenPolicy, TokenStore};
