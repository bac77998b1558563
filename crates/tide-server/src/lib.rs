//! Tide storage server.
//!
//! Serves one store to many concurrent clients over TCP. Every connected
//! client is a session; sessions run optimistic two-phase-commit
//! transactions against the shared store and receive pushed invalidations
//! for every commit made by another session.
//!
//! # Components
//!
//! - [`LockManager`] -- per-store commit lock with a FIFO, cancellable
//!   wait queue
//! - [`CommitCoordinator`] -- begin/store/vote/finish/abort state machine,
//!   tid assignment and conflict detection
//! - [`InvalidationBroadcaster`] -- non-blocking fan-out of invalidations,
//!   plus a bounded history for incremental resync
//! - [`plan_resync`] -- what a reconnecting client must invalidate
//! - [`TideServer`] -- TCP listener; one [`handle_connection`] per client

pub mod auth;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod resync;
pub mod server;
pub mod session;

pub use auth::{AllowAll, Authenticator, Identity, StaticTokens};
pub use broadcast::InvalidationBroadcaster;
pub use config::{AuthConfig, ServerConfig, StorageConfig};
pub use connection::handle_connection;
pub use context::StoreContext;
pub use coordinator::{CommitCoordinator, CommitStats, CoordinatorConfig, TxStatus};
pub use error::{CommitError, CommitResult, LockError, ServerError, ServerResult};
pub use lock::LockManager;
pub use resync::{plan_resync, FullReason, ResyncOutcome, ResyncPolicy};
pub use server::TideServer;
pub use session::{DisconnectSignal, Session};
