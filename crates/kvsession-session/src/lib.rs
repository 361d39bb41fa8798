//! Session persistence for kvsession.
//!
//! Sessions live in a remote key-value store reached through the
//! [`KeyValueStore`] capability. [`RecordStore`] maps session records onto it
//! with create-if-absent and compare-and-swap writes, and [`SessionManager`]
//! drives each request's session from lookup to commit.

/// Staleness and expiry rules.
pub mod expiry;
/// Background removal of expired records.
pub mod gc;
/// Request-scoped session handle and lifecycle states.
pub mod handle;
/// The key-value capability and its in-memory implementation.
pub mod kv;
/// Session lifecycle manager.
pub mod manager;
/// Record adapter over the key-value capability.
pub mod store;

pub use expiry::{ExpiryPolicy, StaleReason};
pub use gc::{spawn_gc_task, GarbageCollector, GcReport};
pub use handle::{Change, SessionHandle, SessionState};
pub use kv::{
    CreateOutcome, DeleteOutcome, InMemoryKeyValueStore, KeyValueStore, UpdateOutcome, Versioned,
};
pub use manager::{CommitOutcome, SessionManager};
pub use store::{RecordStore, ScannedRecord, SessionRecord};
