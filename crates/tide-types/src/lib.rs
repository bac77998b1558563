//! Foundation types for Tide.
//!
//! Every other Tide crate depends on `tide-types`. The types here are the
//! vocabulary of the commit protocol: which object changed ([`Oid`]), as of
//! which commit ([`Tid`]), inside which in-flight transaction ([`TxId`]),
//! on behalf of which connection ([`SessionId`]).
//!
//! # Key Types
//!
//! - [`Oid`]: stable logical identifier of a stored object
//! - [`Tid`]: transaction id; totally orders commits
//! - [`TxId`]: server-local handle for a transaction still in progress
//! - [`SessionId`]: UUID v7 identifier of a client session
//! - [`ObjectRecord`]: one version of an object's state
//! - [`Invalidation`]: the set of objects a commit changed

pub mod error;
pub mod id;
pub mod record;
pub mod tid;

pub use error::TypeError;
pub use id::{Oid, SessionId, TxId};
pub use record::{Invalidation, ObjectRecord};
pub use tid::Tid;
