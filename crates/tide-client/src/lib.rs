//! Client side of Tide.
//!
//! A [`Client`] holds one connection to a storage server and a local
//! [`ObjectCache`] kept coherent by the server's invalidation pushes. Writes
//! go through [`Transaction`], which drives the two-phase commit
//! (store, vote, finish) on the server. After a disconnect the client
//! refuses to serve cached data until [`Client::reconnect`] has
//! resynchronized the cache.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod resync;

pub use cache::{CacheStats, ObjectCache};
pub use client::{Client, Transaction, TransactionState};
pub use config::ClientConfig;
pub use error::{CacheError, ClientError, ClientResult};
pub use resync::ResyncReport;
