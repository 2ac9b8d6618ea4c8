use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mediaforge::config::Config;
use mediaforge::dispatch::{spawn_queue_watchdog, spawn_workers};
use mediaforge::sweeper::Sweeper;
use mediaforge::Services;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!(
        workers = config.worker_concurrency,
        retention_days = config.retention_days,
        "starting mediaforge worker service"
    );

    let services = Services::init(config).await?;
    let shutdown = CancellationToken::new();

    let mut tasks = spawn_workers(services.clone(), shutdown.clone());
    tasks.push(spawn_queue_watchdog(services.clone(), shutdown.clone()));
    tasks.extend(Sweeper::new(services).spawn(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, draining workers");
    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("bye");
    Ok(())
}
