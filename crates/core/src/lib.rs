//! Domain types, capability traits, and pure policy for the droidfleet
//! control plane.
//!
//! Nothing in here owns a loop or a lock. The scheduler, pool, and
//! reconciler crates build their stateful components on these types.

pub mod driver;
pub mod error;
pub mod event_names;
pub mod instance;
pub mod pool;
pub mod profile;
pub mod scheduling;
pub mod subprocess;
pub mod task;
pub mod types;
