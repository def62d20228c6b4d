//! Worker pool command: `foundry run`.

use anyhow::{Context, Result, bail};
use std::sync::Arc;

use foundry::config::FoundryConfig;
use foundry::factory::events::{self, FactoryEvent};
use foundry::factory::pool::PoolRegistry;
use foundry::factory::scheduler::SyncScheduler;
use foundry::factory::tracker::build_tracker;
use foundry::factory::{ensure_project, open_db};

pub async fn cmd_run(project_dir: std::path::PathBuf, max_workers: Option<usize>, no_sync: bool) -> Result<()> {
    if !project_dir.join(".foundry").is_dir() {
        bail!(
            "No .foundry directory in {}. Run `foundry init` first.",
            project_dir.display()
        );
    }
    let config = FoundryConfig::with_cli_args(project_dir, max_workers)?;
    for warning in config.toml.validate() {
        eprintln!("warning: {}", warning);
    }
    let db = open_db(&config)?;
    let project = ensure_project(&db, &config.project_dir).await?;
    let toml = Arc::new(config.toml.clone());

    let events = events::channel();
    spawn_event_logger(events.subscribe());

    let registry = PoolRegistry::new(db.clone(), events.clone());
    registry
        .start_pool(project.clone(), toml.clone())
        .await
        .context("Failed to start worker pool")?;

    let scheduler = match build_tracker(&toml, &config.project_dir) {
        Some(tracker) if toml.sync.enabled && !no_sync => {
            let scheduler = SyncScheduler::new(
                project.clone(),
                db.clone(),
                toml.clone(),
                tracker,
                registry.sync_lock(project.id),
                events.clone(),
            );
            scheduler.start();
            Some(scheduler)
        }
        _ => None,
    };

    println!(
        "foundry running '{}' with {} worker(s){}. Press Ctrl-C to stop.",
        project.name,
        toml.max_workers(),
        if scheduler.is_some() { " and tracker sync" } else { "" }
    );

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    println!("Stopping; waiting for running jobs. Press Ctrl-C again to cancel them.");

    if let Some(scheduler) = &scheduler {
        scheduler.stop().await;
    }

    let in_flight = registry.in_flight().clone();
    let project_id = project.id;
    let force = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Canceling running jobs...");
            in_flight.cancel_project(project_id);
        }
    });

    registry.stop_all().await;
    force.abort();
    println!("Stopped.");
    Ok(())
}

/// Print job and PR transitions while the pool runs; everything else goes
/// to the log only.
fn spawn_event_logger(mut rx: tokio::sync::broadcast::Receiver<String>) {
    tokio::spawn(async move {
        loop {
            let message = match rx.recv().await {
                Ok(message) => message,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event printer lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            };
            tracing::trace!(event = %message, "factory event");
            let Ok(event) = serde_json::from_str::<FactoryEvent>(&message) else {
                continue;
            };
            match event {
                FactoryEvent::JobStateChanged { job_id, state, .. } => {
                    println!("job #{} {}", job_id, state);
                }
                FactoryEvent::PrCreated { card_id, url, .. } => {
                    println!("card #{} opened {}", card_id, url);
                }
                _ => {}
            }
        }
    });
}
