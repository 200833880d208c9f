//! Instance pool: sizing, health probing, recovery, proxy assignment.

pub mod manager;
pub mod proxy;
pub mod stats;

pub use manager::{InstancePoolManager, PoolError, ProbeReport, RecoveryReport, ScaleOutcome};
pub use proxy::{ProxyError, ProxyRotation, ProxySource};
pub use stats::{MemberStats, PoolStats};
