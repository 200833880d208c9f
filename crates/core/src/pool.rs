//! Instance pool constants, sizing, and removal ordering.
//!
//! Pure functions and config types used by the pool manager. Scaling
//! arithmetic and removal ordering live here so they can be tested
//! without a driver.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::instance::{InstanceHealth, InstanceSpec};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Consecutive failed probes before an instance is marked unhealthy.
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 3;

/// Consecutive failures after which recovery gives up and the instance is
/// replaced. Independent of [`DEFAULT_UNHEALTHY_THRESHOLD`].
pub const DEFAULT_REPLACE_THRESHOLD: u32 = 5;

/// Default period between health probe cycles.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Default upper bound on a single liveness probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between consecutive instance creations.
pub const DEFAULT_CREATION_DELAY: Duration = Duration::from_secs(2);

/// Pause between stop and start during recovery.
pub const DEFAULT_RECOVERY_PAUSE: Duration = Duration::from_secs(3);

/// Prefix for generated instance names.
pub const DEFAULT_NAME_PREFIX: &str = "droid";

/// Maximum length of a generated or templated instance name.
const MAX_NAME_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// How new pool members are made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceTemplate {
    /// Existing instance to clone from. Fresh creation when `None`.
    pub clone_from: Option<String>,
    pub name_prefix: String,
    #[serde(default)]
    pub spec: InstanceSpec,
}

impl Default for InstanceTemplate {
    fn default() -> Self {
        Self {
            clone_from: None,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            spec: InstanceSpec::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_instances: usize,
    pub max_instances: usize,
    pub target_instances: usize,
    pub autoscale: bool,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub creation_delay: Duration,
    pub recovery_pause: Duration,
    pub unhealthy_threshold: u32,
    pub replace_threshold: u32,
    pub template: InstanceTemplate,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_instances: 0,
            max_instances: 10,
            target_instances: 0,
            autoscale: false,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            creation_delay: DEFAULT_CREATION_DELAY,
            recovery_pause: DEFAULT_RECOVERY_PAUSE,
            unhealthy_threshold: DEFAULT_UNHEALTHY_THRESHOLD,
            replace_threshold: DEFAULT_REPLACE_THRESHOLD,
            template: InstanceTemplate::default(),
        }
    }
}

impl PoolConfig {
    /// Rules:
    /// - `max_instances` must be at least 1.
    /// - `min_instances <= target_instances <= max_instances`.
    /// - Both thresholds must be non-zero.
    /// - The name prefix must be a valid instance name.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_instances == 0 {
            return Err(CoreError::Validation(
                "max_instances must be at least 1".to_string(),
            ));
        }
        if self.min_instances > self.max_instances {
            return Err(CoreError::Validation(format!(
                "min_instances ({}) exceeds max_instances ({})",
                self.min_instances, self.max_instances
            )));
        }
        if self.target_instances < self.min_instances || self.target_instances > self.max_instances
        {
            return Err(CoreError::Validation(format!(
                "target_instances ({}) must lie within {}..={}",
                self.target_instances, self.min_instances, self.max_instances
            )));
        }
        if self.unhealthy_threshold == 0 || self.replace_threshold == 0 {
            return Err(CoreError::Validation(
                "health thresholds must be non-zero".to_string(),
            ));
        }
        validate_instance_name(&self.template.name_prefix)
    }
}

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

/// How many instances may actually be added: `requested` clamped so the
/// pool does not grow past `max`.
pub fn clamp_scale_up(current: usize, requested: usize, max: usize) -> usize {
    requested.min(max.saturating_sub(current))
}

/// How many instances may actually be removed: `requested` clamped so the
/// pool does not shrink below `min`.
pub fn clamp_scale_down(current: usize, requested: usize, min: usize) -> usize {
    requested.min(current.saturating_sub(min))
}

// ---------------------------------------------------------------------------
// Removal ordering
// ---------------------------------------------------------------------------

/// Order pool members for removal: unhealthy first, then by descending
/// consecutive error count, then by name.
pub fn removal_order<'a, I>(members: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a String, &'a InstanceHealth)>,
{
    let mut ranked: Vec<(&String, &InstanceHealth)> = members.into_iter().collect();
    ranked.sort_by(|(a_name, a), (b_name, b)| {
        a.healthy
            .cmp(&b.healthy)
            .then(b.consecutive_errors.cmp(&a.consecutive_errors))
            .then(a_name.cmp(b_name))
    });
    ranked.into_iter().map(|(name, _)| name.clone()).collect()
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Smallest `<prefix>-<n>` (n >= 1) not present in `existing`.
pub fn next_instance_name<'a, I>(prefix: &str, existing: I) -> String
where
    I: IntoIterator<Item = &'a String>,
{
    let taken: std::collections::HashSet<&str> =
        existing.into_iter().map(|s| s.as_str()).collect();
    (1..)
        .map(|n| format!("{prefix}-{n}"))
        .find(|candidate| !taken.contains(candidate.as_str()))
        .unwrap_or_else(|| format!("{prefix}-{}", taken.len() + 1))
}

/// Validate an instance name.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_NAME_LEN` characters.
/// - Must contain only alphanumeric, hyphen, underscore, or dot characters
///   (names are passed as arguments to the console tool).
pub fn validate_instance_name(name: &str) -> Result<(), CoreError> {
    if name.is_empty() {
        return Err(CoreError::Validation(
            "Instance name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "Instance name must not exceed {MAX_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::Validation(
            "Instance name may only contain alphanumeric, hyphen, underscore, or dot characters"
                .to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceStatus;

    fn health(healthy: bool, errors: u32) -> InstanceHealth {
        InstanceHealth {
            healthy,
            consecutive_errors: errors,
            last_check: None,
            status: InstanceStatus::Running,
        }
    }

    // -- sizing ---------------------------------------------------------------

    #[test]
    fn scale_up_clamps_to_max() {
        // 1 instance, asked for 3 more, max 3 => only 2 fit.
        assert_eq!(clamp_scale_up(1, 3, 3), 2);
    }

    #[test]
    fn scale_up_at_max_adds_nothing() {
        assert_eq!(clamp_scale_up(5, 2, 5), 0);
        assert_eq!(clamp_scale_up(7, 2, 5), 0);
    }

    #[test]
    fn scale_down_clamps_to_min() {
        assert_eq!(clamp_scale_down(4, 10, 1), 3);
        assert_eq!(clamp_scale_down(1, 1, 1), 0);
        assert_eq!(clamp_scale_down(4, 2, 0), 2);
    }

    // -- removal order --------------------------------------------------------

    #[test]
    fn unhealthy_first_then_most_errors() {
        let members = vec![
            ("A".to_string(), health(true, 0)),
            ("B".to_string(), health(false, 4)),
            ("C".to_string(), health(false, 2)),
        ];
        let order = removal_order(members.iter().map(|(n, h)| (n, h)));
        assert_eq!(&order[..2], &["B".to_string(), "C".to_string()]);
        assert_eq!(order[2], "A");
    }

    #[test]
    fn healthy_members_with_errors_rank_by_errors() {
        let members = vec![
            ("x".to_string(), health(true, 0)),
            ("y".to_string(), health(true, 2)),
        ];
        let order = removal_order(members.iter().map(|(n, h)| (n, h)));
        assert_eq!(order, vec!["y".to_string(), "x".to_string()]);
    }

    #[test]
    fn ties_break_by_name() {
        let members = vec![
            ("b".to_string(), health(true, 0)),
            ("a".to_string(), health(true, 0)),
        ];
        let order = removal_order(members.iter().map(|(n, h)| (n, h)));
        assert_eq!(order, vec!["a".to_string(), "b".to_string()]);
    }

    // -- naming ---------------------------------------------------------------

    #[test]
    fn next_name_fills_gaps() {
        let existing = vec!["droid-1".to_string(), "droid-3".to_string()];
        assert_eq!(next_instance_name("droid", &existing), "droid-2");
    }

    #[test]
    fn next_name_on_empty_pool() {
        assert_eq!(next_instance_name("farm", &Vec::new()), "farm-1");
    }

    #[test]
    fn instance_name_rules() {
        assert!(validate_instance_name("droid-1").is_ok());
        assert!(validate_instance_name("").is_err());
        assert!(validate_instance_name("bad name").is_err());
        assert!(validate_instance_name("x; rm -rf /").is_err());
        assert!(validate_instance_name(&"a".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    // -- config ---------------------------------------------------------------

    #[test]
    fn default_config_is_valid() {
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn target_outside_bounds_rejected() {
        let config = PoolConfig {
            min_instances: 1,
            max_instances: 3,
            target_instances: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_max_rejected() {
        let config = PoolConfig {
            max_instances: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
