//! Storage backends for Tide.
//!
//! The commit coordinator never talks to a concrete store. It depends on the
//! [`StorageBackend`] capability: load the newest record of an object,
//! persist a transaction's writes under a tid, report the current tid, and
//! list the transactions committed after a watermark.
//!
//! # Backends
//!
//! - [`InMemoryBackend`] -- `HashMap`-based store for tests and embedding
//! - [`FileBackend`] -- append-only, CRC-framed transaction log
//!
//! # Design Rules
//!
//! 1. Only the holder of a store's commit lock writes to it.
//! 2. Tids handed to `store_batch` strictly increase.
//! 3. Concurrent reads are always safe.
//! 4. The store never interprets object states.
//! 5. All I/O errors are propagated, never silently ignored.

pub mod error;
pub mod file;
pub mod memory;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use file::{FileBackend, FileBackendConfig, SyncMode};
pub use memory::InMemoryBackend;
pub use traits::StorageBackend;
