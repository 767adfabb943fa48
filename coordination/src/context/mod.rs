//! Shared context/memory store
//!
//! Versioned key/value state read and written during consensus rounds.
//! Components hold keys, never entry references; the store owns all values.
//!
//! - [`store`] — the versioned store, TTL freshness classes, optimistic
//!   concurrency, audit-backed durability

pub mod store;

pub use store::{
    ContextEntry, ContextError, ContextResult, ContextStore, Freshness, SharedContextStore,
    TtlClass,
};
