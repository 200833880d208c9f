//! Profile capability.
//!
//! A profile is a logical automation identity bound 1:1 to an instance.
//! Storage lives outside the orchestration core; components only see the
//! [`ProfileStore`] trait.

use serde::{Deserialize, Serialize};

use crate::types::ProfileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Inactive,
    Active,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    pub instance_name: String,
    /// Last known control port, written back by the reconciler.
    #[serde(default)]
    pub port: Option<u16>,
    pub status: ProfileStatus,
    /// Opaque device/network/app configuration owned by the profile layer.
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl Profile {
    pub fn is_active(&self) -> bool {
        self.status == ProfileStatus::Active
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileStatistics {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub error: usize,
}

impl ProfileStatistics {
    pub fn from_profiles<'a, I>(profiles: I) -> Self
    where
        I: IntoIterator<Item = &'a Profile>,
    {
        profiles
            .into_iter()
            .fold(Self::default(), |mut stats, profile| {
                stats.total += 1;
                match profile.status {
                    ProfileStatus::Active => stats.active += 1,
                    ProfileStatus::Inactive => stats.inactive += 1,
                    ProfileStatus::Error => stats.error += 1,
                }
                stats
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("Failed to activate profile {id}: {reason}")]
    ActivationFailed { id: ProfileId, reason: String },

    #[error("Profile storage error: {0}")]
    Storage(String),
}

#[async_trait::async_trait]
pub trait ProfileStore: Send + Sync {
    /// Bring the profile's instance up and mark it active.
    async fn activate(&self, id: &str) -> Result<Profile, ProfileError>;

    async fn deactivate(&self, id: &str) -> Result<(), ProfileError>;

    async fn get_profile(&self, id: &str) -> Result<Option<Profile>, ProfileError>;

    async fn get_all_profiles(&self) -> Result<Vec<Profile>, ProfileError>;

    async fn get_statistics(&self) -> Result<ProfileStatistics, ProfileError> {
        let profiles = self.get_all_profiles().await?;
        Ok(ProfileStatistics::from_profiles(&profiles))
    }

    /// Persist a corrected control port for every profile bound to
    /// `instance_name`. Returns how many profiles changed.
    async fn update_port(&self, instance_name: &str, port: u16) -> Result<usize, ProfileError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, status: ProfileStatus) -> Profile {
        Profile {
            id: id.to_string(),
            instance_name: format!("droid-{id}"),
            port: None,
            status,
            settings: serde_json::Value::Null,
        }
    }

    #[test]
    fn statistics_count_each_status() {
        let profiles = vec![
            profile("1", ProfileStatus::Active),
            profile("2", ProfileStatus::Inactive),
            profile("3", ProfileStatus::Active),
            profile("4", ProfileStatus::Error),
        ];
        let stats = ProfileStatistics::from_profiles(&profiles);
        assert_eq!(
            stats,
            ProfileStatistics {
                total: 4,
                active: 2,
                inactive: 1,
                error: 1,
            }
        );
    }

    #[test]
    fn profile_deserializes_without_optional_fields() {
        let json = serde_json::json!({
            "id": "p1",
            "instance_name": "droid-1",
            "status": "inactive",
        });
        let profile: Profile = serde_json::from_value(json).expect("valid profile");
        assert_eq!(profile.port, None);
        assert!(!profile.is_active());
    }
}
