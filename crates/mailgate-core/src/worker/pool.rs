//! Delivery worker pool
//!
//! Each worker claims one job at a time and runs the pipeline: resolve
//! the raw message, scan it, parse it, check the account, post the
//! webhook. A pipeline error either reschedules the job through the
//! queue's backoff or fails it permanently, per the error's
//! retryability. Artifacts are removed once a job reaches a terminal
//! state, whatever that state is.

use crate::message::parse_message;
use crate::spam::SpamScanner;
use crate::webhook::{AccountChecker, WebhookClient, WebhookPayload};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use mailgate_common::config::{Config, ScanErrorPolicy};
use mailgate_common::types::JobPayload;
use mailgate_common::{Error, Result};
use mailgate_storage::counters::CounterStore;
use mailgate_storage::models::Job;
use mailgate_storage::queue::{FailOutcome, JobQueue};
use mailgate_storage::spool::Spool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Terminal outcome of one successfully concluded job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Posted downstream
    Delivered,
    /// Flagged as spam and silently dropped
    Spam { score: Option<f64> },
    /// Dropped because the scanner errored and policy says fail closed
    DroppedOnScanError,
    /// Dropped because no account matches the addressed identifier
    NoAccount,
}

pub struct WorkerPool {
    inner: Arc<WorkerInner>,
    concurrency: usize,
    poll_interval: Duration,
}

struct WorkerInner {
    queue: Arc<dyn JobQueue>,
    spool: Arc<Spool>,
    scanner: SpamScanner,
    webhook: WebhookClient,
    accounts: AccountChecker,
    queue_name: String,
    on_scan_error: ScanErrorPolicy,
}

impl WorkerPool {
    pub fn new(
        config: &Config,
        queue: Arc<dyn JobQueue>,
        spool: Arc<Spool>,
        store: Arc<dyn CounterStore>,
    ) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(WorkerInner {
                queue,
                spool,
                scanner: SpamScanner::new(&config.spam),
                webhook: WebhookClient::new(&config.webhook)?,
                accounts: AccountChecker::new(&config.webhook, store)?,
                queue_name: config.queue.name.clone(),
                on_scan_error: config.spam.on_error,
            }),
            concurrency: config.worker.concurrency,
            poll_interval: Duration::from_secs(config.worker.poll_interval_secs),
        })
    }

    /// Run the pool until shutdown; in-flight jobs finish before return
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();
        for id in 0..self.concurrency {
            let inner = self.inner.clone();
            let poll = self.poll_interval;
            let token = shutdown.clone();
            workers.spawn(worker_loop(inner, id, poll, token));
        }
        while workers.join_next().await.is_some() {}
        info!("Worker pool stopped");
    }

    /// Claim and process a single job; `Ok(false)` when nothing was due
    pub async fn run_once(&self) -> Result<bool> {
        self.inner.run_once().await
    }
}

async fn worker_loop(
    inner: Arc<WorkerInner>,
    id: usize,
    poll: Duration,
    shutdown: CancellationToken,
) {
    info!(worker = id, "Delivery worker started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        match inner.run_once().await {
            // Something was processed; the queue may hold more
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => warn!(worker = id, error = %e, "Queue poll failed"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(poll) => {}
        }
    }
    debug!(worker = id, "Delivery worker stopped");
}

impl WorkerInner {
    async fn run_once(&self) -> Result<bool> {
        let Some(job) = self.queue.claim(&self.queue_name).await? else {
            return Ok(false);
        };
        let job_id = job.id;

        match self.process(&job).await {
            Ok(outcome) => {
                self.cleanup(&job).await;
                self.queue.ack(&job).await?;
                info!(%job_id, ?outcome, "Job finished");
            }
            Err(e) => {
                let outcome = self.queue.fail(&job, e.is_retryable(), &e.to_string()).await?;
                match outcome {
                    FailOutcome::Retrying { attempt, delay } => {
                        warn!(
                            %job_id,
                            attempt,
                            delay_secs = delay.as_secs(),
                            error = %e,
                            "Job failed, retrying"
                        );
                    }
                    FailOutcome::Exhausted => {
                        warn!(%job_id, error = %e, "Job permanently failed");
                        self.cleanup(&job).await;
                    }
                }
            }
        }
        Ok(true)
    }

    /// The delivery pipeline for one claimed job
    async fn process(&self, job: &Job) -> Result<JobOutcome> {
        let payload: JobPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| Error::MalformedMessage(format!("undecodable job payload: {}", e)))?;

        let raw = self.resolve_bytes(&payload).await?;

        let spam_score = match self.scanner.scan(&raw).await {
            Ok(verdict) if verdict.is_spam => {
                return Ok(JobOutcome::Spam {
                    score: verdict.score,
                })
            }
            Ok(verdict) => verdict.score,
            Err(e) => match self.on_scan_error {
                ScanErrorPolicy::Retry => return Err(e),
                ScanErrorPolicy::Deliver => {
                    warn!(job_id = %job.id, error = %e, "Scan failed, delivering unscanned");
                    None
                }
                ScanErrorPolicy::Drop => {
                    warn!(job_id = %job.id, error = %e, "Scan failed, dropping message");
                    return Ok(JobOutcome::DroppedOnScanError);
                }
            },
        };

        let message = parse_message(&raw)?;

        // Prefer the recipient captured at ingest time; fall back to the
        // parsed To header for payloads without one
        let account_id = payload
            .account_id()
            .map(str::to_string)
            .or_else(|| {
                message
                    .to
                    .first()
                    .and_then(|p| p.address.as_deref())
                    .and_then(|a| a.split('@').next())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .ok_or_else(|| {
                Error::MalformedMessage("no addressable account identifier".to_string())
            })?;
        if !self.accounts.exists(&account_id).await? {
            // Mail for a nonexistent account is concluded, not retried
            info!(job_id = %job.id, account_id, "No such account, dropping message");
            return Ok(JobOutcome::NoAccount);
        }

        let webhook_payload = WebhookPayload::assemble(&account_id, &payload, &message, spam_score);
        self.webhook.deliver(&webhook_payload).await?;
        Ok(JobOutcome::Delivered)
    }

    /// Raw message bytes, from the inline copy or the spool
    async fn resolve_bytes(&self, payload: &JobPayload) -> Result<Vec<u8>> {
        if let Some(inline) = &payload.raw {
            return BASE64
                .decode(inline)
                .map_err(|e| Error::MalformedMessage(format!("undecodable inline body: {}", e)));
        }
        if let Some(name) = &payload.spool_name {
            return self
                .spool
                .try_read(name)
                .await?
                .ok_or(Error::MissingPayload);
        }
        Err(Error::MissingPayload)
    }

    /// Remove the job's spool artifact once the job is terminal. The
    /// spool name is read straight from the stored JSON so cleanup also
    /// works for payloads that failed to decode.
    async fn cleanup(&self, job: &Job) {
        let Some(name) = job.payload.get("spool_name").and_then(|v| v.as_str()) else {
            return;
        };
        if let Err(e) = self.spool.remove(name).await {
            warn!(job_id = %job.id, file = %name, error = %e, "Failed to remove spool artifact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailgate_common::config::{DatabaseConfig, PolicyConfig, WebhookConfig};
    use mailgate_storage::counters::MemoryCounterStore;
    use mailgate_storage::queue::MemoryJobQueue;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HAM_SCANNER: &str = r#"cat >/dev/null; echo "0.1/5.0"; exit 0"#;
    const SPAM_SCANNER: &str = r#"cat >/dev/null; echo "9.9/5.0"; exit 1"#;
    const BROKEN_SCANNER: &str = "cat >/dev/null; exit 74";

    const RAW_MESSAGE: &[u8] = b"From: alice@example.com\r\n\
        To: a1b2c3d4-e5f6-7890-abcd-ef1234567890@in.example.com\r\n\
        Subject: test\r\n\
        \r\n\
        body\r\n";

    struct Harness {
        pool: WorkerPool,
        queue: Arc<MemoryJobQueue>,
        spool: Arc<Spool>,
        spool_dir: std::path::PathBuf,
        _tmp: TempDir,
    }

    fn test_config(webhook_url: String, scanner: &str) -> Config {
        let mut config = Config {
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
                url: webhook_url,
                timeout_secs: 5,
                secret: None,
                account_check_url: None,
                account_cache_ttl_secs: 300,
            },
            logging: Default::default(),
        };
        config.spam.command = "/bin/sh".to_string();
        config.spam.args = vec!["-c".to_string(), scanner.to_string()];
        config
    }

    async fn harness_with(config: Config) -> Harness {
        let tmp = TempDir::new().unwrap();
        let spool = Arc::new(Spool::open(tmp.path()).await.unwrap());
        let queue = Arc::new(MemoryJobQueue::new(
            config.queue.max_attempts,
            config.queue.backoff_secs,
        ));
        let pool = WorkerPool::new(
            &config,
            queue.clone(),
            spool.clone(),
            Arc::new(MemoryCounterStore::new()),
        )
        .unwrap();
        Harness {
            pool,
            queue,
            spool,
            spool_dir: tmp.path().to_path_buf(),
            _tmp: tmp,
        }
    }

    async fn harness(webhook_url: String, scanner: &str) -> Harness {
        harness_with(test_config(webhook_url, scanner)).await
    }

    async fn enqueue_spooled(h: &Harness, raw: &[u8]) {
        let mut writer = h.spool.create_writer(1 << 20).await.unwrap();
        writer.write(raw).await.unwrap();
        let entry = writer.finish().await.unwrap();

        let payload = JobPayload {
            recipients: vec!["a1b2c3d4-e5f6-7890-abcd-ef1234567890@in.example.com".to_string()],
            sender: Some("alice@example.com".to_string()),
            remote_ip: Some("192.0.2.1".to_string()),
            spool_name: Some(entry.file_name),
            raw: None,
            content_hash: entry.sha256,
            size_bytes: entry.size,
            received_at: Utc::now(),
        };
        h.queue
            .enqueue("inbound", serde_json::to_value(&payload).unwrap(), None)
            .await
            .unwrap();
    }

    fn artifact_count(h: &Harness) -> usize {
        std::fs::read_dir(&h.spool_dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_clean_message_delivered_and_artifact_removed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(format!("{}/hook", server.uri()), HAM_SCANNER).await;
        enqueue_spooled(&h, RAW_MESSAGE).await;

        assert!(h.pool.run_once().await.unwrap());
        assert!(!h.pool.run_once().await.unwrap());

        let stats = h.queue.stats("inbound").await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(artifact_count(&h), 0);
    }

    #[tokio::test]
    async fn test_spam_dropped_without_webhook_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let h = harness(server.uri(), SPAM_SCANNER).await;
        enqueue_spooled(&h, RAW_MESSAGE).await;

        assert!(h.pool.run_once().await.unwrap());

        // Spam is a concluded job, not a failure
        let stats = h.queue.stats("inbound").await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(artifact_count(&h), 0);
    }

    #[tokio::test]
    async fn test_webhook_outage_reschedules_and_keeps_artifact() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let h = harness(server.uri(), HAM_SCANNER).await;
        enqueue_spooled(&h, RAW_MESSAGE).await;

        assert!(h.pool.run_once().await.unwrap());

        let stats = h.queue.stats("inbound").await.unwrap();
        assert_eq!(stats.pending, 1);
        // The artifact must survive for the retry
        assert_eq!(artifact_count(&h), 1);
    }

    #[tokio::test]
    async fn test_unknown_account_dropped_without_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/accounts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = test_config(format!("{}/hook", server.uri()), HAM_SCANNER);
        config.webhook.account_check_url = Some(format!("{}/accounts", server.uri()));
        let h = harness_with(config).await;
        enqueue_spooled(&h, RAW_MESSAGE).await;

        assert!(h.pool.run_once().await.unwrap());

        // Mail for a nonexistent account concludes the job without retry
        let stats = h.queue.stats("inbound").await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(artifact_count(&h), 0);
    }

    #[tokio::test]
    async fn test_inline_payload_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(server.uri(), HAM_SCANNER).await;
        let payload = JobPayload {
            recipients: vec!["a1b2c3d4-e5f6-7890-abcd-ef1234567890@in.example.com".to_string()],
            sender: None,
            remote_ip: None,
            spool_name: None,
            raw: Some(BASE64.encode(RAW_MESSAGE)),
            content_hash: "cafe".to_string(),
            size_bytes: RAW_MESSAGE.len() as u64,
            received_at: Utc::now(),
        };
        h.queue
            .enqueue("inbound", serde_json::to_value(&payload).unwrap(), None)
            .await
            .unwrap();

        assert!(h.pool.run_once().await.unwrap());
        assert_eq!(h.queue.stats("inbound").await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_vanished_artifact_fails_permanently() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let h = harness(server.uri(), HAM_SCANNER).await;
        enqueue_spooled(&h, RAW_MESSAGE).await;
        // The artifact disappears before the worker gets to the job
        h.spool.sweep_older_than(Duration::ZERO).await.unwrap();
        assert_eq!(artifact_count(&h), 0);

        assert!(h.pool.run_once().await.unwrap());
        assert_eq!(h.queue.stats("inbound").await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_scan_error_retries_by_default() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let h = harness(server.uri(), BROKEN_SCANNER).await;
        enqueue_spooled(&h, RAW_MESSAGE).await;

        assert!(h.pool.run_once().await.unwrap());
        assert_eq!(h.queue.stats("inbound").await.unwrap().pending, 1);
        assert_eq!(artifact_count(&h), 1);
    }

    #[tokio::test]
    async fn test_scan_error_deliver_policy_fails_open() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = test_config(server.uri(), BROKEN_SCANNER);
        config.spam.on_error = ScanErrorPolicy::Deliver;
        let h = harness_with(config).await;
        enqueue_spooled(&h, RAW_MESSAGE).await;

        assert!(h.pool.run_once().await.unwrap());
        assert_eq!(h.queue.stats("inbound").await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_scan_error_drop_policy_fails_closed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut config = test_config(server.uri(), BROKEN_SCANNER);
        config.spam.on_error = ScanErrorPolicy::Drop;
        let h = harness_with(config).await;
        enqueue_spooled(&h, RAW_MESSAGE).await;

        assert!(h.pool.run_once().await.unwrap());
        let stats = h.queue.stats("inbound").await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(artifact_count(&h), 0);
    }
}
