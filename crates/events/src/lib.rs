//! Fleet event bus.
//!
//! - [`EventBus`]: in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`FleetEvent`]: the event envelope published by the scheduler, pool
//!   manager, and reconciler.
//!
//! Event type names live in [`droidfleet_core::event_names`].

pub mod bus;

pub use bus::{EventBus, FleetEvent};
