//! Wiring for the `droidfleet` daemon: environment configuration, the
//! JSON profile store, and the concrete task handlers.

pub mod config;
pub mod event_log;
pub mod handlers;
pub mod profiles;

pub use config::{ConfigError, DaemonConfig, RemoteConfig};
pub use handlers::{DeviceShellHandler, ScriptHandler};
pub use profiles::JsonProfileStore;
