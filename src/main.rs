//! Hearth daemon entry point.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::signal;

use hearth::bus::{LocalBus, MessageBus};
use hearth::config::{Config, Role};
use hearth::master::{DeviceCatalog, Master};
use hearth::plugin::PluginRegistry;
use hearth::scheduler::{job, Scheduler, TokioScheduler};
use hearth::worker::{Worker, WorkerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting hearth {:?} node {}", cfg.role, cfg.node_id);
    if cfg.role != Role::Standalone {
        warn!("Only the in-process bus is available; {:?} nodes will not reach peers", cfg.role);
    }

    let bus = MessageBus::new(Arc::new(LocalBus::new()));
    let scheduler = TokioScheduler::new();
    let mut tasks = Vec::new();

    // Master
    if matches!(cfg.role, Role::Master | Role::Standalone) {
        let catalog = DeviceCatalog::new(&cfg.master.devices)?;
        let master = Arc::new(Master::new(
            bus.clone(),
            catalog,
            cfg.master.worker_stale_after(),
        ));

        let sweeper = Arc::clone(&master);
        scheduler.add_periodic(
            "worker-sweep",
            cfg.master.sweep_interval(),
            job(move || {
                let master = Arc::clone(&sweeper);
                async move { master.check_stale_workers().await }
            }),
        )?;

        tasks.push(tokio::spawn(async move {
            if let Err(e) = master.run().await {
                error!("Master failed: {}", e);
            }
        }));
    }

    // Worker
    let worker = if matches!(cfg.role, Role::Worker | Role::Standalone) {
        let settings = WorkerSettings::from_config(&cfg.node_id, &cfg.worker);
        let loader = Arc::new(PluginRegistry::with_builtins());
        let worker = Arc::new(Worker::new(bus.clone(), loader, settings));

        let pinger = Arc::clone(&worker);
        scheduler.add_periodic(
            "discovery",
            cfg.worker.discovery_interval(),
            job(move || {
                let worker = Arc::clone(&pinger);
                async move { worker.send_discovery().await }
            }),
        )?;
        let retrier = Arc::clone(&worker);
        scheduler.add_periodic(
            "load-retry",
            cfg.worker.retry_interval(),
            job(move || {
                let worker = Arc::clone(&retrier);
                async move {
                    worker.retry_load().await;
                }
            }),
        )?;
        let watchdog = Arc::clone(&worker);
        scheduler.add_periodic(
            "master-watchdog",
            cfg.worker.stale_check_interval(),
            job(move || {
                let worker = Arc::clone(&watchdog);
                async move {
                    worker.check_stale_master().await;
                }
            }),
        )?;

        let runner = Arc::clone(&worker);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                error!("Worker failed: {}", e);
            }
        }));
        Some(worker)
    } else {
        None
    };

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    scheduler.shutdown();
    if let Some(worker) = worker {
        worker.shutdown().await;
    }
    for task in tasks {
        task.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}
