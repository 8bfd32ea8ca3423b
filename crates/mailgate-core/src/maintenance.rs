//! Periodic maintenance
//!
//! One task owns the background hygiene of the gateway: requeueing
//! stalled jobs, purging finished jobs past retention, sweeping aged
//! spool artifacts, and dropping expired counters. The first pass runs
//! immediately on startup so a restart repairs leftovers without
//! waiting a full interval.

use mailgate_common::config::Config;
use mailgate_storage::counters::CounterStore;
use mailgate_storage::queue::JobQueue;
use mailgate_storage::spool::Spool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Maintenance {
    queue: Arc<dyn JobQueue>,
    spool: Arc<Spool>,
    store: Arc<dyn CounterStore>,
    queue_name: String,
    sweep_interval: Duration,
    artifact_max_age: Duration,
    stalled_after: Duration,
    retention: Duration,
}

impl Maintenance {
    pub fn new(
        config: &Config,
        queue: Arc<dyn JobQueue>,
        spool: Arc<Spool>,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            queue,
            spool,
            store,
            queue_name: config.queue.name.clone(),
            sweep_interval: Duration::from_secs(config.spool.sweep_interval_secs),
            artifact_max_age: Duration::from_secs(config.spool.max_artifact_age_hours * 3600),
            stalled_after: Duration::from_secs(config.queue.stalled_after_secs),
            retention: Duration::from_secs(config.queue.retention_hours * 3600),
        }
    }

    /// Sweep on an interval until shutdown; the first sweep is immediate
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.sweep().await,
            }
        }
        info!("Maintenance stopped");
    }

    /// One maintenance pass. Each step is independent; a failing step is
    /// logged and the rest still run.
    pub async fn sweep(&self) {
        match self
            .queue
            .requeue_stalled(&self.queue_name, self.stalled_after)
            .await
        {
            Ok(n) if n > 0 => warn!(requeued = n, "Requeued stalled jobs"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Stalled-job requeue failed"),
        }

        match self.queue.purge_finished(&self.queue_name, self.retention).await {
            Ok(n) if n > 0 => debug!(purged = n, "Purged finished jobs"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Job retention purge failed"),
        }

        if let Err(e) = self.spool.sweep_older_than(self.artifact_max_age).await {
            warn!(error = %e, "Spool sweep failed");
        }

        if let Err(e) = self.store.purge_expired().await {
            warn!(error = %e, "Counter purge failed");
        }

        match self.queue.stats(&self.queue_name).await {
            Ok(stats) => debug!(
                pending = stats.pending,
                processing = stats.processing,
                completed = stats.completed,
                failed = stats.failed,
                "Queue stats"
            ),
            Err(e) => warn!(error = %e, "Queue stats unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailgate_common::config::{DatabaseConfig, PolicyConfig, WebhookConfig};
    use mailgate_storage::counters::MemoryCounterStore;
    use mailgate_storage::queue::MemoryJobQueue;
    use tempfile::TempDir;

    fn test_config() -> Config {
        Config {
            smtp: Default::default(),
            database: DatabaseConfig {
                url: None,
                max_connections: 5,
                min_connections: 1,
            },
            policy: PolicyConfig {
                accepted_domain: "in.example.com".to_string(),
                allowed_sender_domains: Vec::new(),
            },
            rate_limit: Default::default(),
            spool: Default::default(),
            queue: Default::default(),
            worker: Default::default(),
            spam: Default::default(),
            webhook: WebhookConfig {
                url: "https://api.example.com/webhook".to_string(),
                timeout_secs: 30,
                secret: None,
                account_check_url: None,
                account_cache_ttl_secs: 300,
            },
            logging: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_sweep_repairs_and_purges() {
        let mut config = test_config();
        // Everything is immediately eligible
        config.queue.stalled_after_secs = 0;
        config.spool.max_artifact_age_hours = 0;

        let tmp = TempDir::new().unwrap();
        let spool = Arc::new(Spool::open(tmp.path()).await.unwrap());
        let queue = Arc::new(MemoryJobQueue::new(5, 60));
        let store = Arc::new(MemoryCounterStore::new());

        // A claimed job whose worker died
        queue
            .enqueue("inbound", serde_json::json!({}), None)
            .await
            .unwrap();
        queue.claim("inbound").await.unwrap().unwrap();
        assert_eq!(queue.stats("inbound").await.unwrap().processing, 1);

        // An orphaned artifact
        let mut writer = spool.create_writer(1024).await.unwrap();
        writer.write(b"orphan").await.unwrap();
        writer.finish().await.unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let maintenance =
            Maintenance::new(&config, queue.clone(), spool.clone(), store.clone());
        maintenance.sweep().await;

        assert_eq!(queue.stats("inbound").await.unwrap().pending, 1);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_leaves_healthy_state_alone() {
        let config = test_config();
        let tmp = TempDir::new().unwrap();
        let spool = Arc::new(Spool::open(tmp.path()).await.unwrap());
        let queue = Arc::new(MemoryJobQueue::new(5, 60));
        let store = Arc::new(MemoryCounterStore::new());

        queue
            .enqueue("inbound", serde_json::json!({}), None)
            .await
            .unwrap();
        let mut writer = spool.create_writer(1024).await.unwrap();
        writer.write(b"fresh").await.unwrap();
        writer.finish().await.unwrap();

        let maintenance =
            Maintenance::new(&config, queue.clone(), spool.clone(), store.clone());
        maintenance.sweep().await;

        assert_eq!(queue.stats("inbound").await.unwrap().pending, 1);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let config = test_config();
        let tmp = TempDir::new().unwrap();
        let maintenance = Maintenance::new(
            &config,
            Arc::new(MemoryJobQueue::new(5, 60)),
            Arc::new(Spool::open(tmp.path()).await.unwrap()),
            Arc::new(MemoryCounterStore::new()),
        );

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        // Returns promptly with the token already cancelled
        maintenance.run(shutdown).await;
    }
}
