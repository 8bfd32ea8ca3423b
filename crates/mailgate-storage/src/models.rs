//! Database models

use chrono::{DateTime, Utc};
use mailgate_common::types::JobId;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Job queue model
///
/// Status values: "pending" (waiting or scheduled for retry),
/// "processing" (claimed by a worker), "completed", "failed".
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub payload: serde_json::Value,
    pub unique_key: Option<String>,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
