//! Ingestion coordinator
//!
//! Orchestrates the gatekeeper per SMTP session: rate limiting at connect
//! and MAIL FROM, policy at MAIL FROM and RCPT TO, spooling at DATA, and
//! the deduplicated enqueue once a message is fully on disk. Everything
//! before DATA is pure validation; DATA writes disk; the enqueue is the
//! single durable step, and no partial job is ever left behind.

use chrono::Utc;
use mailgate_common::config::Config;
use mailgate_common::types::{Envelope, JobId, JobPayload};
use mailgate_common::{Error, Result};
use mailgate_storage::counters::CounterStore;
use mailgate_storage::queue::{EnqueueOutcome, JobQueue};
use mailgate_storage::spool::{Spool, SpoolEntry, SpoolWriter};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{PolicyValidator, RateLimiter};

/// Result of handing a finished message to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new delivery job was created
    Enqueued(JobId),
    /// An identical message is already queued; the fresh artifact was
    /// removed and the message counts as accepted
    Duplicate,
}

pub struct IngestCoordinator {
    policy: PolicyValidator,
    ip_limiter: RateLimiter,
    sender_limiter: Option<RateLimiter>,
    spool: Arc<Spool>,
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    max_message_size: u64,
}

impl IngestCoordinator {
    pub fn new(
        config: &Config,
        store: Arc<dyn CounterStore>,
        spool: Arc<Spool>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let rl = &config.rate_limit;
        let ip_limiter = RateLimiter::new(
            store.clone(),
            "ip",
            rl.ip_max,
            Duration::from_secs(rl.ip_window_secs),
            rl.fail_open,
        );
        let sender_limiter = rl.sender_enabled.then(|| {
            RateLimiter::new(
                store,
                "sender",
                rl.sender_max,
                Duration::from_secs(rl.sender_window_secs),
                rl.fail_open,
            )
        });

        Self {
            policy: PolicyValidator::new(&config.policy),
            ip_limiter,
            sender_limiter,
            spool,
            queue,
            queue_name: config.queue.name.clone(),
            max_message_size: config.smtp.max_message_size,
        }
    }

    /// Connect-time gate: per-IP rate limit
    pub async fn check_connect(&self, remote_ip: IpAddr) -> Result<()> {
        if self.ip_limiter.admit(&remote_ip.to_string()).await? {
            Ok(())
        } else {
            Err(Error::RateLimited)
        }
    }

    /// MAIL FROM gate: sender policy, then the per-sender rate limit
    pub async fn check_sender(&self, envelope: &Envelope) -> Result<()> {
        self.policy.validate_sender(envelope.sender.as_ref())?;

        if let (Some(limiter), Some(sender)) = (&self.sender_limiter, &envelope.sender) {
            if !limiter.admit(&sender.to_string()).await? {
                return Err(Error::RateLimited);
            }
        }
        Ok(())
    }

    /// RCPT TO gate: recipient address policy
    pub fn check_recipient(&self, address: &mailgate_common::types::EmailAddress) -> Result<()> {
        self.policy.validate_recipient(address)
    }

    /// DATA: open a ceiling-enforcing spool writer for the session to
    /// stream the message body into
    pub async fn begin_message(&self) -> Result<SpoolWriter> {
        self.spool.create_writer(self.max_message_size).await
    }

    /// End of DATA: enqueue a job keyed by the artifact's content hash.
    ///
    /// A duplicate key means an identical message is already queued; the
    /// just-written artifact is deleted and the submission reported as
    /// accepted. An enqueue failure deletes the artifact before the error
    /// surfaces, so no orphan file outlives a failed enqueue.
    pub async fn finish_message(
        &self,
        envelope: &Envelope,
        entry: SpoolEntry,
    ) -> Result<IngestOutcome> {
        let payload = JobPayload {
            recipients: envelope.recipients.iter().map(|r| r.to_string()).collect(),
            sender: envelope.sender.as_ref().map(|s| s.to_string()),
            remote_ip: Some(envelope.remote_ip.to_string()),
            spool_name: Some(entry.file_name.clone()),
            raw: None,
            content_hash: entry.sha256.clone(),
            size_bytes: entry.size,
            received_at: Utc::now(),
        };

        let payload = serde_json::to_value(&payload)
            .map_err(|e| Error::QueueUnavailable(format!("payload encoding failed: {}", e)))?;

        let outcome = match self
            .queue
            .enqueue(&self.queue_name, payload, Some(&entry.sha256))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.discard_artifact(&entry.file_name).await;
                return Err(e);
            }
        };

        match outcome {
            EnqueueOutcome::Enqueued(job_id) => {
                info!(
                    %job_id,
                    hash = %entry.sha256,
                    size = entry.size,
                    remote_ip = %envelope.remote_ip,
                    "Message accepted"
                );
                Ok(IngestOutcome::Enqueued(job_id))
            }
            EnqueueOutcome::Duplicate => {
                info!(hash = %entry.sha256, "Duplicate message, reusing queued job");
                self.discard_artifact(&entry.file_name).await;
                Ok(IngestOutcome::Duplicate)
            }
        }
    }

    async fn discard_artifact(&self, file_name: &str) {
        if let Err(e) = self.spool.remove(file_name).await {
            warn!(file = %file_name, error = %e, "Failed to remove spool artifact");
        }
    }
}
