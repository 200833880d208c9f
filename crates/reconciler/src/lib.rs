//! Device reconciler: keeps live device status in line with the
//! hypervisor and the debug bridge, repairs dropped connections, and
//! captures per-instance device logs.

pub mod config;
pub mod log_stream;
pub mod reconciler;
pub mod reconnect;

pub use config::ReconcilerConfig;
pub use reconciler::{DeviceReconciler, ReconcileError, ScanReport};
pub use reconnect::ReconnectConfig;
