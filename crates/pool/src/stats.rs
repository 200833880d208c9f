use std::collections::{BTreeMap, HashMap};

use droidfleet_core::instance::{InstanceHealth, InstanceStatus};
use serde::Serialize;

/// Per-member view for observability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberStats {
    pub health: InstanceHealth,
    pub proxy: Option<String>,
}

/// Pool-wide counts plus per-member health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub running: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub target: usize,
    pub members: BTreeMap<String, MemberStats>,
}

impl PoolStats {
    pub fn collect(
        health: &HashMap<String, InstanceHealth>,
        proxies: &HashMap<String, String>,
        target: usize,
    ) -> Self {
        let healthy = health.values().filter(|h| h.healthy).count();
        Self {
            total: health.len(),
            running: health
                .values()
                .filter(|h| h.status == InstanceStatus::Running)
                .count(),
            healthy,
            unhealthy: health.len() - healthy,
            target,
            members: health
                .iter()
                .map(|(name, h)| {
                    (
                        name.clone(),
                        MemberStats {
                            health: h.clone(),
                            proxy: proxies.get(name).cloned(),
                        },
                    )
                })
                .collect(),
        }
    }
}
