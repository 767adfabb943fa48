//! Pub/sub event plumbing for the coordination core
//!
//! Every component publishes lifecycle and protocol events here so external
//! observers (dashboards, audit consumers, tests) can watch a session without
//! touching component internals.
//!
//! # Modules
//!
//! - [`types`] — the `CoordinationEvent` enum covering registry, topology,
//!   round, and context events
//! - [`bus`] — Tokio broadcast-based pub/sub with filtered subscription

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventFilter, FilteredReceiver, SharedEventBus};
pub use types::CoordinationEvent;
