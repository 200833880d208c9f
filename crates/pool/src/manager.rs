//! Instance pool manager.
//!
//! [`InstancePoolManager`] keeps the set of managed instances between the
//! configured bounds, probes each member periodically, and restarts or
//! replaces members that stop answering. The health map is the managed
//! set: an instance is in the pool exactly when it has a health entry.
//!
//! Scaling, recovery and replacement are serialized by an internal
//! operation lock. Probes run without it and without waiting on each
//! other.
//!
//! The template instance named by `template.clone_from` is never a member:
//! it is not adopted, restarted, or removed. Members the hypervisor stops
//! listing are dropped from the pool on the next probe cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use droidfleet_core::driver::{DeviceDriver, DeviceError};
use droidfleet_core::error::CoreError;
use droidfleet_core::event_names;
use droidfleet_core::instance::{Instance, InstanceHealth, InstanceStatus};
use droidfleet_core::pool::{
    clamp_scale_down, clamp_scale_up, next_instance_name, removal_order, PoolConfig,
};
use droidfleet_events::{EventBus, FleetEvent};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::proxy::ProxySource;
use crate::stats::PoolStats;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] CoreError),

    #[error("Driver {operation} failed for {instance}: {source}")]
    Driver {
        operation: &'static str,
        instance: String,
        #[source]
        source: DeviceError,
    },

    #[error("Instance is not managed by the pool: {0}")]
    UnknownInstance(String),
}

/// What a scaling call actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScaleOutcome {
    pub created: Vec<String>,
    pub removed: Vec<String>,
    /// Creations or removals the driver refused.
    pub failed: usize,
}

impl ScaleOutcome {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty() && self.failed == 0
    }
}

/// Counts from one probe cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub probed: usize,
    pub failed: usize,
    pub newly_unhealthy: usize,
    /// Members dropped because the hypervisor no longer lists them.
    pub vanished: usize,
}

/// Counts from one recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub restarted: usize,
    pub replaced: usize,
    pub failed: usize,
}

pub struct InstancePoolManager {
    driver: Arc<dyn DeviceDriver>,
    bus: Arc<EventBus>,
    config: RwLock<PoolConfig>,
    health: RwLock<HashMap<String, InstanceHealth>>,
    /// Proxy recorded per member, for introspection only.
    proxies: RwLock<HashMap<String, String>>,
    proxy_source: Option<Arc<dyn ProxySource>>,
    operation_lock: Mutex<()>,
}

impl InstancePoolManager {
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        bus: Arc<EventBus>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self {
            driver,
            bus,
            config: RwLock::new(config),
            health: RwLock::new(HashMap::new()),
            proxies: RwLock::new(HashMap::new()),
            proxy_source: None,
            operation_lock: Mutex::new(()),
        })
    }

    pub fn with_proxy_source(mut self, source: Arc<dyn ProxySource>) -> Self {
        self.proxy_source = Some(source);
        self
    }

    /// Adopt existing instances, converge to target when autoscaling, and
    /// spawn the probe loop. The returned handle finishes once `cancel`
    /// fires.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        self.adopt_existing().await;

        if self.config.read().await.autoscale {
            match self.scale_to_target().await {
                Ok(outcome) => tracing::info!(
                    created = outcome.created.len(),
                    removed = outcome.removed.len(),
                    "Pool converged on start",
                ),
                Err(e) => tracing::error!(error = %e, "Initial pool scaling failed"),
            }
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run(cancel).await })
    }

    /// Probe, then recover, every `probe_interval` until `cancel` fires.
    /// The interval is re-read after each cycle, so config updates change
    /// the cadence of the next one.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut probe_interval = self.config.read().await.probe_interval;
        let mut ticker = tokio::time::interval(probe_interval);
        tracing::info!(
            probe_interval_secs = probe_interval.as_secs(),
            "Pool health monitor started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Pool health monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let probes = self.probe_all().await;
                    tracing::debug!(?probes, "Probe cycle complete");
                    let recovery = self.recover_unhealthy().await;
                    if recovery != RecoveryReport::default() {
                        tracing::info!(?recovery, "Recovery pass complete");
                    }

                    let (autoscale, current) = {
                        let config = self.config.read().await;
                        (config.autoscale, config.probe_interval)
                    };
                    if probes.vanished > 0 && autoscale {
                        match self.scale_to_target().await {
                            Ok(outcome) => tracing::info!(
                                created = outcome.created.len(),
                                "Refilled pool after members vanished",
                            ),
                            Err(e) => tracing::error!(error = %e, "Refilling pool failed"),
                        }
                    }
                    if current != probe_interval {
                        probe_interval = current;
                        ticker = tokio::time::interval_at(
                            tokio::time::Instant::now() + probe_interval,
                            probe_interval,
                        );
                        tracing::info!(
                            probe_interval_secs = probe_interval.as_secs(),
                            "Probe interval changed",
                        );
                    }
                }
            }
        }
    }

    // ---- scaling ----

    /// Create or remove instances until the pool size equals the current
    /// target. A second call with nothing changed does nothing.
    pub async fn scale_to_target(&self) -> Result<ScaleOutcome, PoolError> {
        let _op = self.operation_lock.lock().await;
        let config = self.config.read().await.clone();
        let current = self.health.read().await.len();

        if current < config.target_instances {
            let count = clamp_scale_up(current, config.target_instances - current, config.max_instances);
            Ok(self.create_locked(&config, count).await)
        } else if current > config.target_instances {
            let count =
                clamp_scale_down(current, current - config.target_instances, config.min_instances);
            Ok(self.remove_locked(count).await)
        } else {
            Ok(ScaleOutcome::default())
        }
    }

    /// Add up to `count` instances, never exceeding `max_instances`.
    pub async fn scale_up(&self, count: usize) -> Result<ScaleOutcome, PoolError> {
        let _op = self.operation_lock.lock().await;
        let config = self.config.read().await.clone();
        let current = self.health.read().await.len();
        let feasible = clamp_scale_up(current, count, config.max_instances);
        if feasible < count {
            tracing::info!(requested = count, feasible, "Scale-up clamped to pool maximum");
        }
        Ok(self.create_locked(&config, feasible).await)
    }

    /// Remove up to `count` instances, never going below `min_instances`.
    pub async fn scale_down(&self, count: usize) -> Result<ScaleOutcome, PoolError> {
        let _op = self.operation_lock.lock().await;
        let min = self.config.read().await.min_instances;
        let current = self.health.read().await.len();
        let feasible = clamp_scale_down(current, count, min);
        if feasible < count {
            tracing::info!(requested = count, feasible, "Scale-down clamped to pool minimum");
        }
        Ok(self.remove_locked(feasible).await)
    }

    // ---- health ----

    /// Probe every member once, concurrently. Members missing from a
    /// successful hypervisor listing are dropped instead of probed.
    pub async fn probe_all(&self) -> ProbeReport {
        let (timeout, threshold) = {
            let config = self.config.read().await;
            (config.probe_timeout, config.unhealthy_threshold)
        };
        // Snapshot members before listing, so an instance created in
        // between is never mistaken for a vanished one.
        let mut members: Vec<String> = self.health.read().await.keys().cloned().collect();
        let (instances, authoritative) = self.list_instances(timeout).await;
        let listed: HashMap<String, (u16, InstanceStatus)> = instances
            .into_iter()
            .map(|i| (i.name, (i.port, i.status)))
            .collect();

        let mut vanished = 0;
        if authoritative {
            let gone: Vec<String> = members
                .iter()
                .filter(|name| !listed.contains_key(*name))
                .cloned()
                .collect();
            for name in &gone {
                if self.forget(name).await {
                    vanished += 1;
                    tracing::warn!(instance = %name, "Pool member no longer reported by hypervisor");
                }
            }
            members.retain(|name| listed.contains_key(name));
        }

        let results = futures::future::join_all(members.into_iter().map(|name| {
            let target = listed.get(&name).copied();
            async move {
                let result = match target {
                    Some((port, _)) => {
                        match tokio::time::timeout(timeout, self.driver.run_liveness_probe(port))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(DeviceError::Timeout {
                                operation: "liveness probe".to_string(),
                                elapsed_ms: timeout.as_millis() as u64,
                            }),
                        }
                    }
                    None => Err(DeviceError::InstanceNotFound(name.clone())),
                };
                (name, target.map(|(_, status)| status), result)
            }
        }))
        .await;

        let now = Utc::now();
        let mut report = ProbeReport {
            vanished,
            ..Default::default()
        };
        let mut health = self.health.write().await;
        for (name, status, result) in results {
            // Removed while the probe was in flight.
            let Some(entry) = health.get_mut(&name) else {
                continue;
            };
            report.probed += 1;
            match result {
                Ok(()) => entry.record_success(now),
                Err(e) => {
                    report.failed += 1;
                    entry.status = status.unwrap_or(InstanceStatus::Unknown);
                    let flipped = entry.record_failure(now, threshold);
                    tracing::debug!(
                        instance = %name,
                        consecutive_errors = entry.consecutive_errors,
                        error = %e,
                        "Liveness probe failed",
                    );
                    if flipped {
                        report.newly_unhealthy += 1;
                        tracing::warn!(
                            instance = %name,
                            consecutive_errors = entry.consecutive_errors,
                            "Instance marked unhealthy",
                        );
                        self.bus.publish(
                            FleetEvent::new(event_names::INSTANCE_UNHEALTHY)
                                .with_subject("instance", &name)
                                .with_payload(serde_json::json!({
                                    "consecutive_errors": entry.consecutive_errors,
                                })),
                        );
                    }
                }
            }
        }
        report
    }

    /// Restart unhealthy members; replace those whose error streak has
    /// reached `replace_threshold`.
    pub async fn recover_unhealthy(&self) -> RecoveryReport {
        let _op = self.operation_lock.lock().await;
        let config = self.config.read().await.clone();

        let mut unhealthy: Vec<(String, u32)> = self
            .health
            .read()
            .await
            .iter()
            .filter(|(_, h)| !h.healthy)
            .map(|(name, h)| (name.clone(), h.consecutive_errors))
            .collect();
        unhealthy.sort();

        let mut report = RecoveryReport::default();
        for (name, errors) in unhealthy {
            if errors >= config.replace_threshold {
                match self.replace_locked(&config, &name).await {
                    Ok(()) => report.replaced += 1,
                    Err(e) => {
                        report.failed += 1;
                        tracing::error!(instance = %name, error = %e, "Instance replacement failed");
                    }
                }
            } else {
                match self.restart_locked(&config, &name).await {
                    Ok(()) => report.restarted += 1,
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(instance = %name, error = %e, "Instance restart failed");
                    }
                }
            }
        }
        report
    }

    // ---- config & introspection ----

    pub async fn config(&self) -> PoolConfig {
        self.config.read().await.clone()
    }

    /// Replace the live config. Invalid configs are rejected unchanged. A
    /// member that becomes the clone template leaves the pool untouched.
    pub async fn update_config(&self, config: PoolConfig) -> Result<(), PoolError> {
        config.validate()?;
        let template = config.template.clone_from.clone();
        *self.config.write().await = config;
        tracing::info!("Pool config updated");

        if let Some(template) = template {
            let _op = self.operation_lock.lock().await;
            if self.health.write().await.remove(&template).is_some() {
                self.proxies.write().await.remove(&template);
                tracing::info!(instance = %template, "Template instance released from pool");
            }
        }
        Ok(())
    }

    pub async fn set_target(&self, target: usize) -> Result<(), PoolError> {
        let mut config = self.config.write().await;
        let mut updated = config.clone();
        updated.target_instances = target;
        updated.validate()?;
        *config = updated;
        tracing::info!(target, "Pool target updated");
        Ok(())
    }

    pub async fn stats(&self) -> PoolStats {
        let target = self.config.read().await.target_instances;
        let health = self.health.read().await;
        let proxies = self.proxies.read().await;
        PoolStats::collect(&health, &proxies, target)
    }

    pub async fn health(&self, name: &str) -> Option<InstanceHealth> {
        self.health.read().await.get(name).cloned()
    }

    /// Managed instance names, sorted.
    pub async fn members(&self) -> Vec<String> {
        let mut names: Vec<String> = self.health.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Take every instance the hypervisor currently lists into the pool,
    /// except the clone template, and drop members it no longer lists.
    /// Returns the resulting member count.
    pub async fn adopt_existing(&self) -> usize {
        let _op = self.operation_lock.lock().await;
        let config = self.config.read().await.clone();
        let (instances, authoritative) = self.list_instances(config.probe_timeout).await;
        let template = config.template.clone_from.as_deref();

        let mut health = self.health.write().await;
        if authoritative {
            let listed: HashSet<&str> = instances.iter().map(|i| i.name.as_str()).collect();
            health.retain(|name, _| listed.contains(name.as_str()));
        }
        for instance in instances.iter().filter(|i| Some(i.name.as_str()) != template) {
            health
                .entry(instance.name.clone())
                .or_insert_with(|| InstanceHealth::observed(instance.status));
        }
        if let Some(template) = template {
            health.remove(template);
        }
        tracing::info!(count = health.len(), "Adopted existing instances into pool");
        health.len()
    }

    // ---- private helpers ----

    /// Fresh hypervisor listing, or the driver's cached one when the
    /// hypervisor does not answer. The flag is `false` for the cache.
    async fn list_instances(&self, timeout: std::time::Duration) -> (Vec<Instance>, bool) {
        match tokio::time::timeout(timeout, self.driver.refresh_from_hypervisor()).await {
            Ok(Ok(list)) => (list, true),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Hypervisor listing failed, using cached instances");
                (self.driver.get_instances().await, false)
            }
            Err(_) => {
                tracing::warn!("Hypervisor listing timed out, using cached instances");
                (self.driver.get_instances().await, false)
            }
        }
    }

    /// Drop `name` from the pool without touching the hypervisor.
    /// Returns whether it was a member.
    async fn forget(&self, name: &str) -> bool {
        let was_member = self.health.write().await.remove(name).is_some();
        self.proxies.write().await.remove(name);
        if was_member {
            self.bus.publish(
                FleetEvent::new(event_names::INSTANCE_REMOVED)
                    .with_subject("instance", name)
                    .with_payload(serde_json::json!({ "reason": "vanished" })),
            );
        }
        was_member
    }

    async fn create_locked(&self, config: &PoolConfig, count: usize) -> ScaleOutcome {
        let mut outcome = ScaleOutcome::default();
        for i in 0..count {
            if i > 0 {
                tokio::time::sleep(config.creation_delay).await;
            }
            match self.create_one(config).await {
                Ok(name) => outcome.created.push(name),
                Err(e) => {
                    outcome.failed += 1;
                    tracing::error!(
                        error = %e,
                        remaining = count - i - 1,
                        "Instance creation failed, abandoning remaining creations",
                    );
                    break;
                }
            }
        }
        outcome
    }

    async fn create_one(&self, config: &PoolConfig) -> Result<String, PoolError> {
        let mut taken: HashSet<String> = self.health.read().await.keys().cloned().collect();
        taken.extend(self.driver.get_instances().await.into_iter().map(|i| i.name));
        let name = next_instance_name(&config.template.name_prefix, &taken);

        let created = match &config.template.clone_from {
            Some(source) => self.driver.clone_instance(source, &name).await,
            None => self.driver.create_instance(&name, &config.template.spec).await,
        };
        created.map_err(|source| PoolError::Driver {
            operation: "create",
            instance: name.clone(),
            source,
        })?;

        let status = match self.driver.launch_instance(&name).await {
            Ok(()) => InstanceStatus::Running,
            Err(e) => {
                tracing::warn!(instance = %name, error = %e, "Launch after create failed");
                InstanceStatus::Stopped
            }
        };

        self.health
            .write()
            .await
            .insert(name.clone(), InstanceHealth::observed(status));
        self.assign_proxy(&name).await;

        tracing::info!(
            instance = %name,
            cloned_from = config.template.clone_from.as_deref().unwrap_or("-"),
            "Instance created",
        );
        self.bus.publish(FleetEvent::new(event_names::INSTANCE_CREATED).with_subject("instance", &name));
        Ok(name)
    }

    async fn remove_locked(&self, count: usize) -> ScaleOutcome {
        let template = self.config.read().await.template.clone_from.clone();
        let order = {
            let health = self.health.read().await;
            removal_order(
                health
                    .iter()
                    .filter(|(name, _)| Some(name.as_str()) != template.as_deref()),
            )
        };

        let mut outcome = ScaleOutcome::default();
        for name in order.into_iter().take(count) {
            match self.remove_one(&name).await {
                Ok(()) => outcome.removed.push(name),
                Err(e) => {
                    outcome.failed += 1;
                    tracing::error!(instance = %name, error = %e, "Instance removal failed");
                }
            }
        }
        outcome
    }

    /// Stop and delete `name`. An instance the hypervisor no longer knows
    /// counts as removed.
    async fn remove_one(&self, name: &str) -> Result<(), PoolError> {
        if let Err(e) = self.driver.stop_instance(name).await {
            tracing::debug!(instance = %name, error = %e, "Stop before remove failed");
        }
        match self.driver.remove_instance(name).await {
            Ok(()) => {}
            Err(DeviceError::InstanceNotFound(_)) => {
                tracing::info!(instance = %name, "Instance already gone from hypervisor");
            }
            Err(source) => {
                return Err(PoolError::Driver {
                    operation: "remove",
                    instance: name.to_string(),
                    source,
                })
            }
        }

        self.health.write().await.remove(name);
        self.proxies.write().await.remove(name);

        tracing::info!(instance = %name, "Instance removed");
        self.bus.publish(FleetEvent::new(event_names::INSTANCE_REMOVED).with_subject("instance", name));
        Ok(())
    }

    async fn restart_locked(&self, config: &PoolConfig, name: &str) -> Result<(), PoolError> {
        if !self.health.read().await.contains_key(name) {
            return Err(PoolError::UnknownInstance(name.to_string()));
        }
        tracing::warn!(instance = %name, "Restarting unhealthy instance");

        if let Err(e) = self.driver.stop_instance(name).await {
            tracing::debug!(instance = %name, error = %e, "Stop during recovery failed");
        }
        tokio::time::sleep(config.recovery_pause).await;
        self.driver
            .launch_instance(name)
            .await
            .map_err(|source| PoolError::Driver {
                operation: "launch",
                instance: name.to_string(),
                source,
            })?;

        if let Some(entry) = self.health.write().await.get_mut(name) {
            entry.mark_recovered(Utc::now());
        }
        tracing::info!(instance = %name, "Instance recovered");
        self.bus.publish(FleetEvent::new(event_names::INSTANCE_RECOVERED).with_subject("instance", name));
        Ok(())
    }

    async fn replace_locked(&self, config: &PoolConfig, name: &str) -> Result<(), PoolError> {
        tracing::warn!(instance = %name, "Replacing instance that keeps failing");
        self.remove_one(name).await?;
        let replacement = self.create_one(config).await?;
        self.bus.publish(
            FleetEvent::new(event_names::INSTANCE_REPLACED)
                .with_subject("instance", name)
                .with_payload(serde_json::json!({ "replacement": replacement })),
        );
        Ok(())
    }

    async fn assign_proxy(&self, name: &str) {
        let Some(source) = &self.proxy_source else {
            return;
        };
        match source.next_proxy().await {
            Ok(proxy) => {
                tracing::info!(instance = %name, proxy = %proxy, "Proxy assigned");
                self.proxies.write().await.insert(name.to_string(), proxy);
            }
            Err(e) => {
                tracing::warn!(instance = %name, error = %e, "Proxy assignment failed");
            }
        }
    }
}
