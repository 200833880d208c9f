//! Console/bridge device driver.
//!
//! Implements [`droidfleet_core::driver::DeviceDriver`] by shelling out to
//! two external tools:
//!
//! - the hypervisor console ([`console`]), which lists, creates, clones,
//!   launches, stops and removes instances;
//! - the debug bridge ([`bridge`]), which connects to running instances
//!   and carries probes, metrics reads and log streams.
//!
//! Every invocation goes through [`droidfleet_core::subprocess::run_command`]
//! with a timeout, so a hung tool never stalls a caller for longer than the
//! configured command timeout.

pub mod bridge;
pub mod console;
pub mod driver;

mod exec;

pub use driver::{ConsoleDriver, DriverConfig};
