//! `droidfleet` -- control-plane daemon for a fleet of emulated devices.
//!
//! Runs the task scheduler, the instance pool manager and the device
//! reconciler side by side over one console/bridge driver, until Ctrl-C or
//! SIGTERM. Configuration comes from the environment (see
//! [`droidfleet_daemon::config`]); `LOG_FORMAT=json` switches the log
//! output to JSON lines.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use droidfleet_core::driver::DeviceDriver;
use droidfleet_core::task::TaskKind;
use droidfleet_daemon::{event_log, DaemonConfig, DeviceShellHandler, JsonProfileStore, ScriptHandler};
use droidfleet_device::ConsoleDriver;
use droidfleet_events::EventBus;
use droidfleet_pool::{InstancePoolManager, ProxyRotation};
use droidfleet_reconciler::DeviceReconciler;
use droidfleet_scheduler::{
    run_intake, HandlerRegistry, HttpTaskSource, RemoteTaskSource, TaskScheduler,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Bound on waiting for each background loop after cancellation. The
/// scheduler is not bounded: it drains running tasks.
const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    if let Err(e) = run().await {
        tracing::error!(error = %format!("{e:#}"), "droidfleet exited with an error");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "droidfleet=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run() -> anyhow::Result<()> {
    // --- Configuration ---
    let config = DaemonConfig::from_env().context("Invalid configuration")?;
    tracing::info!(
        console = %config.driver.console_path.display(),
        bridge = %config.driver.adb_path.display(),
        profiles = %config.profiles_path.display(),
        max_concurrent_tasks = config.scheduler.max_concurrent_tasks,
        pool_target = config.pool.target_instances,
        remote_intake = config.remote.is_some(),
        "Loaded configuration",
    );

    // --- Driver ---
    let console = Arc::new(ConsoleDriver::new(config.driver.clone()));
    let driver: Arc<dyn DeviceDriver> = console.clone();
    match driver.refresh_from_hypervisor().await {
        Ok(instances) => tracing::info!(count = instances.len(), "Hypervisor reachable"),
        Err(e) => tracing::warn!(error = %e, "Hypervisor not reachable yet, continuing"),
    }

    // --- Event bus ---
    let bus = Arc::new(EventBus::default());

    // --- Profiles ---
    let profiles = Arc::new(
        JsonProfileStore::open(&config.profiles_path)
            .await
            .context("Failed to load profiles")?
            .with_driver(Arc::clone(&driver)),
    );

    // --- Scheduler ---
    let mut handlers = HandlerRegistry::new();
    handlers
        .register(
            TaskKind::RunScript,
            Arc::new(ScriptHandler::new(
                &config.script_interpreter,
                config.scheduler.task_timeout,
            )),
        )
        .register(
            TaskKind::DeviceShell,
            Arc::new(DeviceShellHandler::new(Arc::clone(&console))),
        );
    tracing::info!(kinds = ?handlers.kinds(), "Registered task handlers");

    let remote = match &config.remote {
        Some(remote) => {
            let source: Arc<dyn RemoteTaskSource> = Arc::new(
                HttpTaskSource::new(&remote.url, remote.request_timeout)
                    .context("Failed to build remote task client")?,
            );
            Some((source, remote.clone()))
        }
        None => None,
    };

    let mut scheduler = TaskScheduler::new(
        config.scheduler.clone(),
        handlers,
        profiles.clone(),
        Arc::clone(&bus),
    );
    if let Some((source, _)) = &remote {
        scheduler = scheduler.with_reporter(Arc::clone(source));
    }
    let scheduler = Arc::new(scheduler);

    // --- Pool ---
    let mut pool = InstancePoolManager::new(Arc::clone(&driver), Arc::clone(&bus), config.pool.clone())
        .context("Invalid pool configuration")?;
    if let Some(list) = &config.proxy_list {
        let rotation = ProxyRotation::from_list(list);
        if !rotation.is_empty() {
            tracing::info!(proxies = rotation.len(), "Proxy rotation enabled");
            pool = pool.with_proxy_source(Arc::new(rotation));
        }
    }
    let pool = Arc::new(pool);

    // --- Reconciler ---
    let reconciler = Arc::new(
        DeviceReconciler::new(Arc::clone(&driver), Arc::clone(&bus), config.reconciler.clone())
            .with_profiles(profiles.clone()),
    );

    // --- Loops ---
    let cancel = CancellationToken::new();

    let event_log_handle = tokio::spawn(event_log::run(bus.subscribe(), cancel.clone()));
    let scheduler_handle = tokio::spawn(Arc::clone(&scheduler).run(cancel.clone()));
    let pool_handle = pool.start(cancel.clone()).await;
    let reconciler_handle = {
        let reconciler = Arc::clone(&reconciler);
        let cancel = cancel.clone();
        tokio::spawn(async move { reconciler.run(cancel).await })
    };
    let intake_handle = remote.map(|(source, remote)| {
        tokio::spawn(run_intake(
            Arc::clone(&scheduler),
            source,
            remote.poll_interval,
            remote.batch,
            cancel.clone(),
        ))
    });

    tracing::info!("droidfleet started");

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, stopping loops");
    cancel.cancel();

    // --- Post-shutdown cleanup ---
    if let Some(handle) = intake_handle {
        let _ = tokio::time::timeout(LOOP_STOP_TIMEOUT, handle).await;
    }
    let _ = scheduler_handle.await;
    tracing::info!("Scheduler drained");

    let _ = tokio::time::timeout(LOOP_STOP_TIMEOUT, pool_handle).await;
    let _ = tokio::time::timeout(LOOP_STOP_TIMEOUT, reconciler_handle).await;
    tracing::info!("Pool manager and reconciler stopped");

    let _ = tokio::time::timeout(LOOP_STOP_TIMEOUT, event_log_handle).await;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
