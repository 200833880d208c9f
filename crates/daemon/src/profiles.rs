//! JSON-file profile store.
//!
//! All profiles live in one JSON array on disk. The file is read once at
//! startup and rewritten in full (temp file + rename) after every change,
//! so a crash mid-write leaves the previous version intact.
//!
//! Activation launches the profile's instance through the device driver
//! when one is attached; a launch failure marks the profile `error`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use droidfleet_core::driver::DeviceDriver;
use droidfleet_core::profile::{Profile, ProfileError, ProfileStatus, ProfileStore};
use tokio::sync::RwLock;

pub struct JsonProfileStore {
    path: PathBuf,
    driver: Option<Arc<dyn DeviceDriver>>,
    profiles: RwLock<BTreeMap<String, Profile>>,
}

impl JsonProfileStore {
    /// Load `path`. A missing file is an empty store; it is created on the
    /// first write.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ProfileError> {
        let path = path.into();
        let profiles = match tokio::fs::read(&path).await {
            Ok(bytes) => parse(&path, &bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "Profile file not found, starting empty");
                BTreeMap::new()
            }
            Err(e) => return Err(storage(&path, e)),
        };

        tracing::info!(path = %path.display(), count = profiles.len(), "Loaded profiles");
        Ok(Self {
            path,
            driver: None,
            profiles: RwLock::new(profiles),
        })
    }

    /// Launch/stop instances on activation/deactivation.
    pub fn with_driver(mut self, driver: Arc<dyn DeviceDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add or replace a profile and persist.
    pub async fn upsert(&self, profile: Profile) -> Result<(), ProfileError> {
        let mut profiles = self.profiles.write().await;
        profiles.insert(profile.id.clone(), profile);
        self.persist(&profiles).await
    }

    // ---- private helpers ----

    async fn set_status(&self, id: &str, status: ProfileStatus) -> Result<Profile, ProfileError> {
        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .get_mut(id)
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;
        profile.status = status;
        let updated = profile.clone();
        self.persist(&profiles).await?;
        Ok(updated)
    }

    /// Write the whole map as a JSON array, sorted by id.
    async fn persist(&self, profiles: &BTreeMap<String, Profile>) -> Result<(), ProfileError> {
        let list: Vec<&Profile> = profiles.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)
            .map_err(|e| ProfileError::Storage(format!("Failed to encode profiles: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage(parent, e))?;
        }
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| storage(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| storage(&self.path, e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ProfileStore for JsonProfileStore {
    async fn activate(&self, id: &str) -> Result<Profile, ProfileError> {
        let profile = self
            .get_profile(id)
            .await?
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;

        if let Some(driver) = &self.driver {
            if let Err(e) = driver.launch_instance(&profile.instance_name).await {
                tracing::warn!(
                    profile_id = %id,
                    instance = %profile.instance_name,
                    error = %e,
                    "Profile activation failed",
                );
                self.set_status(id, ProfileStatus::Error).await?;
                return Err(ProfileError::ActivationFailed {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        let updated = self.set_status(id, ProfileStatus::Active).await?;
        tracing::info!(profile_id = %id, instance = %updated.instance_name, "Profile activated");
        Ok(updated)
    }

    async fn deactivate(&self, id: &str) -> Result<(), ProfileError> {
        let profile = self
            .get_profile(id)
            .await?
            .ok_or_else(|| ProfileError::NotFound(id.to_string()))?;

        if let Some(driver) = &self.driver {
            if let Err(e) = driver.stop_instance(&profile.instance_name).await {
                tracing::warn!(profile_id = %id, error = %e, "Failed to stop profile instance");
            }
        }
        self.set_status(id, ProfileStatus::Inactive).await?;
        tracing::info!(profile_id = %id, "Profile deactivated");
        Ok(())
    }

    async fn get_profile(&self, id: &str) -> Result<Option<Profile>, ProfileError> {
        Ok(self.profiles.read().await.get(id).cloned())
    }

    async fn get_all_profiles(&self) -> Result<Vec<Profile>, ProfileError> {
        Ok(self.profiles.read().await.values().cloned().collect())
    }

    async fn update_port(&self, instance_name: &str, port: u16) -> Result<usize, ProfileError> {
        let mut profiles = self.profiles.write().await;
        let mut changed = 0;
        for profile in profiles.values_mut() {
            if profile.instance_name == instance_name && profile.port != Some(port) {
                profile.port = Some(port);
                changed += 1;
            }
        }
        if changed > 0 {
            self.persist(&profiles).await?;
            tracing::info!(instance = %instance_name, port, changed, "Persisted corrected port");
        }
        Ok(changed)
    }
}

fn parse(path: &Path, bytes: &[u8]) -> Result<BTreeMap<String, Profile>, ProfileError> {
    let list: Vec<Profile> = serde_json::from_slice(bytes).map_err(|e| {
        ProfileError::Storage(format!("Invalid profile file {}: {e}", path.display()))
    })?;
    Ok(list.into_iter().map(|p| (p.id.clone(), p)).collect())
}

fn storage(path: &Path, e: std::io::Error) -> ProfileError {
    ProfileError::Storage(format!("{}: {e}", path.display()))
}
