//! Durable job queue
//!
//! The queue is an at-least-once job store with per-job unique-key
//! deduplication. `PgJobQueue` is the production backing; jobs are claimed
//! with `FOR UPDATE SKIP LOCKED` so a job is held by at most one worker at
//! a time. `MemoryJobQueue` mirrors the semantics for tests and single
//! process setups without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailgate_common::types::JobId;
use mailgate_common::{Error, Result};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::DatabasePool;
use crate::models::Job;

/// Outcome of an enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job was created
    Enqueued(JobId),
    /// A job with the same unique key already exists; nothing was created
    Duplicate,
}

impl EnqueueOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate)
    }
}

/// Outcome of failing a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job was rescheduled for another attempt after `delay`
    Retrying { attempt: i32, delay: Duration },
    /// No attempts remain (or the error was terminal); the job is
    /// permanently failed
    Exhausted,
}

/// Queue statistics
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Abstract at-least-once job store
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Create a job. When `unique_key` is set and a job with the same
    /// (queue, key) already exists, no job is created and
    /// [`EnqueueOutcome::Duplicate`] is returned.
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        unique_key: Option<&str>,
    ) -> Result<EnqueueOutcome>;

    /// Claim the next due job, marking it processing and consuming one
    /// attempt. Returns `None` when nothing is due.
    async fn claim(&self, queue: &str) -> Result<Option<Job>>;

    /// Mark a claimed job completed.
    async fn ack(&self, job: &Job) -> Result<()>;

    /// Fail a claimed job. With `retry` and attempts remaining the job is
    /// rescheduled with exponential backoff; otherwise it is permanently
    /// failed.
    async fn fail(&self, job: &Job, retry: bool, error: &str) -> Result<FailOutcome>;

    /// Per-status job counts for a queue.
    async fn stats(&self, queue: &str) -> Result<QueueStats>;

    /// Requeue processing jobs whose claim is older than `after` (worker
    /// died mid-job). Returns the number requeued.
    async fn requeue_stalled(&self, queue: &str, after: Duration) -> Result<u64>;

    /// Delete completed/failed jobs older than `retention`. Returns the
    /// number deleted.
    async fn purge_finished(&self, queue: &str, retention: Duration) -> Result<u64>;
}

const MAX_BACKOFF_SECS: u64 = 3600;

/// Exponential backoff delay for the given attempt number (1-based),
/// capped at one hour
pub fn backoff_delay(attempt: i32, base_secs: u64) -> Duration {
    let exp = attempt.saturating_sub(1).clamp(0, 20) as u32;
    let secs = base_secs.saturating_mul(1u64 << exp).min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

/// Postgres-backed job queue
#[derive(Clone)]
pub struct PgJobQueue {
    db: DatabasePool,
    max_attempts: i32,
    backoff_secs: u64,
}

impl PgJobQueue {
    pub fn new(db: DatabasePool, max_attempts: i32, backoff_secs: u64) -> Self {
        Self {
            db,
            max_attempts,
            backoff_secs,
        }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        unique_key: Option<&str>,
    ) -> Result<EnqueueOutcome> {
        let job_id = Uuid::now_v7();

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, payload, unique_key, status, attempts, max_attempts, scheduled_at, created_at)
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, NOW(), NOW())
            ON CONFLICT (queue, unique_key) WHERE unique_key IS NOT NULL DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(queue)
        .bind(&payload)
        .bind(unique_key)
        .bind(self.max_attempts)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::QueueUnavailable(format!("enqueue failed: {}", e)))?;

        if result.rows_affected() == 0 {
            debug!(queue = %queue, unique_key = ?unique_key, "Duplicate job suppressed");
            return Ok(EnqueueOutcome::Duplicate);
        }

        info!(queue = %queue, job_id = %job_id, "Enqueued job");
        Ok(EnqueueOutcome::Enqueued(job_id))
    }

    async fn claim(&self, queue: &str) -> Result<Option<Job>> {
        let job: Option<Job> = sqlx::query_as(
            r#"
            UPDATE jobs
            SET status = 'processing', started_at = NOW(), attempts = attempts + 1
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = $1 AND status = 'pending' AND scheduled_at <= NOW()
                ORDER BY scheduled_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(queue)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| Error::QueueUnavailable(format!("claim failed: {}", e)))?;

        Ok(job)
    }

    async fn ack(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::QueueUnavailable(format!("ack failed: {}", e)))?;

        Ok(())
    }

    async fn fail(&self, job: &Job, retry: bool, error: &str) -> Result<FailOutcome> {
        // attempts was already incremented when the job was claimed
        if !retry || job.attempts >= job.max_attempts {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed', last_error = $2, completed_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind(error)
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::QueueUnavailable(format!("fail failed: {}", e)))?;

            return Ok(FailOutcome::Exhausted);
        }

        let delay = backoff_delay(job.attempts, self.backoff_secs);
        let scheduled_at = Utc::now()
            + chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(MAX_BACKOFF_SECS as i64));

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', last_error = $2, scheduled_at = $3
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(error)
        .bind(scheduled_at)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::QueueUnavailable(format!("retry scheduling failed: {}", e)))?;

        info!(
            job_id = %job.id,
            attempt = job.attempts,
            retry_at = %scheduled_at,
            "Job scheduled for retry"
        );

        Ok(FailOutcome::Retrying {
            attempt: job.attempts,
            delay,
        })
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs WHERE queue = $1 GROUP BY status")
                .bind(queue)
                .fetch_all(self.db.pool())
                .await
                .map_err(|e| Error::QueueUnavailable(format!("stats failed: {}", e)))?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => stats.pending = count as u64,
                "processing" => stats.processing = count as u64,
                "completed" => stats.completed = count as u64,
                "failed" => stats.failed = count as u64,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn requeue_stalled(&self, queue: &str, after: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::seconds(0));

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', scheduled_at = NOW()
            WHERE queue = $1 AND status = 'processing'
              AND started_at IS NOT NULL AND started_at <= $2
            "#,
        )
        .bind(queue)
        .bind(cutoff)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::QueueUnavailable(format!("stalled requeue failed: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn purge_finished(&self, queue: &str, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));

        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue = $1 AND status IN ('completed', 'failed')
              AND completed_at IS NOT NULL AND completed_at <= $2
            "#,
        )
        .bind(queue)
        .bind(cutoff)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::QueueUnavailable(format!("retention purge failed: {}", e)))?;

        Ok(result.rows_affected())
    }
}

struct StoredJob {
    job: Job,
    available_at: Instant,
    claimed_at: Option<Instant>,
    finished_at: Option<Instant>,
}

/// In-memory job queue with the same semantics as [`PgJobQueue`]
pub struct MemoryJobQueue {
    max_attempts: i32,
    backoff_secs: u64,
    jobs: Mutex<Vec<StoredJob>>,
}

impl MemoryJobQueue {
    pub fn new(max_attempts: i32, backoff_secs: u64) -> Self {
        Self {
            max_attempts,
            backoff_secs,
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Look up a job by id (test introspection)
    pub async fn find(&self, id: JobId) -> Option<Job> {
        let jobs = self.jobs.lock().await;
        jobs.iter().find(|s| s.job.id == id).map(|s| s.job.clone())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        unique_key: Option<&str>,
    ) -> Result<EnqueueOutcome> {
        let mut jobs = self.jobs.lock().await;

        if let Some(key) = unique_key {
            let exists = jobs
                .iter()
                .any(|s| s.job.queue == queue && s.job.unique_key.as_deref() == Some(key));
            if exists {
                return Ok(EnqueueOutcome::Duplicate);
            }
        }

        let now: DateTime<Utc> = Utc::now();
        let job = Job {
            id: Uuid::now_v7(),
            queue: queue.to_string(),
            payload,
            unique_key: unique_key.map(|k| k.to_string()),
            status: "pending".to_string(),
            attempts: 0,
            max_attempts: self.max_attempts,
            last_error: None,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            created_at: now,
        };
        let id = job.id;

        jobs.push(StoredJob {
            job,
            available_at: Instant::now(),
            claimed_at: None,
            finished_at: None,
        });

        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn claim(&self, queue: &str) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().await;
        let now = Instant::now();

        for stored in jobs.iter_mut() {
            if stored.job.queue == queue
                && stored.job.status == "pending"
                && stored.available_at <= now
            {
                stored.job.status = "processing".to_string();
                stored.job.attempts += 1;
                stored.job.started_at = Some(Utc::now());
                stored.claimed_at = Some(now);
                return Ok(Some(stored.job.clone()));
            }
        }
        Ok(None)
    }

    async fn ack(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs
            .iter_mut()
            .find(|s| s.job.id == job.id)
            .ok_or_else(|| Error::QueueUnavailable(format!("unknown job {}", job.id)))?;

        stored.job.status = "completed".to_string();
        stored.job.completed_at = Some(Utc::now());
        stored.finished_at = Some(Instant::now());
        Ok(())
    }

    async fn fail(&self, job: &Job, retry: bool, error: &str) -> Result<FailOutcome> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs
            .iter_mut()
            .find(|s| s.job.id == job.id)
            .ok_or_else(|| Error::QueueUnavailable(format!("unknown job {}", job.id)))?;

        stored.job.last_error = Some(error.to_string());

        if !retry || stored.job.attempts >= stored.job.max_attempts {
            stored.job.status = "failed".to_string();
            stored.job.completed_at = Some(Utc::now());
            stored.finished_at = Some(Instant::now());
            return Ok(FailOutcome::Exhausted);
        }

        let delay = backoff_delay(stored.job.attempts, self.backoff_secs);
        stored.job.status = "pending".to_string();
        stored.job.scheduled_at = Utc::now()
            + chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(MAX_BACKOFF_SECS as i64));
        stored.available_at = Instant::now() + delay;
        stored.claimed_at = None;

        Ok(FailOutcome::Retrying {
            attempt: stored.job.attempts,
            delay,
        })
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let jobs = self.jobs.lock().await;
        let mut stats = QueueStats::default();
        for stored in jobs.iter().filter(|s| s.job.queue == queue) {
            match stored.job.status.as_str() {
                "pending" => stats.pending += 1,
                "processing" => stats.processing += 1,
                "completed" => stats.completed += 1,
                "failed" => stats.failed += 1,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn requeue_stalled(&self, queue: &str, after: Duration) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let now = Instant::now();
        let mut requeued = 0;

        for stored in jobs.iter_mut() {
            if stored.job.queue != queue || stored.job.status != "processing" {
                continue;
            }
            if let Some(claimed_at) = stored.claimed_at {
                if claimed_at + after <= now {
                    stored.job.status = "pending".to_string();
                    stored.job.scheduled_at = Utc::now();
                    stored.available_at = now;
                    stored.claimed_at = None;
                    requeued += 1;
                }
            }
        }
        Ok(requeued)
    }

    async fn purge_finished(&self, queue: &str, retention: Duration) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let now = Instant::now();
        let before = jobs.len();

        jobs.retain(|s| {
            if s.job.queue != queue {
                return true;
            }
            match s.finished_at {
                Some(finished_at) => finished_at + retention > now,
                None => true,
            }
        });
        Ok((before - jobs.len()) as u64)
    }
}
