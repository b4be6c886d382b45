// Message storage primitives consumed by the delivery engine.
// Persistence and log rollover live behind `MessageStore`; the in-memory
// implementation is shared between nodes to stand in for replicated storage.
use std::fmt;

pub mod memory;
pub mod store;

pub use memory::InMemoryStore;
pub use store::{BoxFuture, MessageStore, Offset, PurgeOutcome, StoredMessage};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    UnknownDomain(String),
    Unsupported(&'static str),
    Corruption,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::UnknownDomain(domain) => write!(f, "unknown domain: {domain}"),
            StorageError::Unsupported(feature) => write!(f, "unsupported: {feature}"),
            StorageError::Corruption => write!(f, "corruption detected"),
        }
    }
}

impl std::error::Error for StorageError {}
