//! # Vestibule Storage
//!
//! Storage abstraction for records the gateway persists, such as pending
//! user registrations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod memory;

pub use backend::{validate_key, StorageBackend};
pub use error::StorageError;
pub use memory::MemoryBackend;
