#![forbid(unsafe_code)]

pub mod clock;
pub mod error;
pub mod event_store;
pub mod offline_queue;
pub mod registry;
pub mod repo;

pub use error::{IngestError, MalformedEventPayload, QueryError, StorageError, TransientNetworkError};
