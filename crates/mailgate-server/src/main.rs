//! Mailgate - mail ingestion gateway entry point

use anyhow::Result;
use mailgate_common::config::Config;
use mailgate_core::{IngestCoordinator, Maintenance, SmtpServer, WorkerPool};
use mailgate_storage::counters::{CounterStore, PgCounterStore};
use mailgate_storage::db::DatabasePool;
use mailgate_storage::queue::{JobQueue, PgJobQueue};
use mailgate_storage::spool::Spool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first; the logging format comes from it
    let config = Config::load()?;
    init_logging(&config);

    info!("Starting Mailgate...");

    // Database, migrations, storage backings
    let db_pool = DatabasePool::new(&config.database).await?;
    db_pool.migrate().await?;

    let store: Arc<dyn CounterStore> = Arc::new(PgCounterStore::new(db_pool.clone()));
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(
        db_pool.clone(),
        config.queue.max_attempts,
        config.queue.backoff_secs,
    ));
    let spool = Arc::new(Spool::open(&config.spool.dir).await?);

    // Ingestion side
    let coordinator = Arc::new(IngestCoordinator::new(
        &config,
        store.clone(),
        spool.clone(),
        queue.clone(),
    ));
    let smtp_server = SmtpServer::new(config.smtp.clone(), coordinator);

    // Delivery side
    let worker_pool = WorkerPool::new(&config, queue.clone(), spool.clone(), store.clone())?;

    // Background hygiene
    let maintenance = Maintenance::new(&config, queue, spool, store);

    let shutdown = CancellationToken::new();

    let smtp_handle = {
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = smtp_server.run(token).await {
                error!("SMTP server error: {}", e);
            }
        })
    };

    let worker_handle = {
        let token = shutdown.clone();
        tokio::spawn(async move { worker_pool.run(token).await })
    };

    let maintenance_handle = {
        let token = shutdown.clone();
        tokio::spawn(async move { maintenance.run(token).await })
    };

    info!(
        "Mailgate started, accepting mail for {} on {}:{}",
        config.policy.accepted_domain, config.smtp.host, config.smtp.port
    );

    wait_for_shutdown_signal().await?;
    info!("Shutdown signal received, draining");

    // Cancel everything; each task drains its in-flight work before
    // returning
    shutdown.cancel();
    let _ = smtp_handle.await;
    let _ = worker_handle.await;
    let _ = maintenance_handle.await;

    db_pool.close().await;
    info!("Mailgate shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},mailgate=debug", config.logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
