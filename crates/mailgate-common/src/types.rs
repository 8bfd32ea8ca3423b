//! Common types for Mailgate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Unique identifier for queued jobs
pub type JobId = Uuid;

/// An email address split at the `@`. No attempt is made at full RFC
/// 5321 address validation; both halves just have to be non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {
                Some(Self::new(local, domain))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Smtp(format!("Invalid address: {}", s)))
    }
}

/// Per-connection session context (SMTP envelope plus connection facts).
///
/// Created when a connection is accepted, reset between messages on the
/// same connection, dropped on disconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Remote peer address
    pub remote_ip: IpAddr,

    /// HELO/EHLO hostname
    pub helo: Option<String>,

    /// Whether the peer authenticated (the gateway accepts submissions
    /// without authentication; this stays false unless a future AUTH
    /// extension sets it)
    pub authenticated: bool,

    /// Sender (MAIL FROM); `None` for the null reverse path
    pub sender: Option<EmailAddress>,

    /// Accepted recipients (RCPT TO)
    pub recipients: Vec<EmailAddress>,
}

impl Envelope {
    /// Create an envelope for a freshly accepted connection
    pub fn new(remote_ip: IpAddr) -> Self {
        Self {
            remote_ip,
            helo: None,
            authenticated: false,
            sender: None,
            recipients: Vec::new(),
        }
    }

    /// Clear per-message state, keeping connection facts (RSET, or after
    /// a completed DATA, ready for the next message on the connection)
    pub fn reset(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }
}

/// Body of a delivery job as stored in the queue.
///
/// Carries either a spool file name or the raw message inline (base64);
/// the worker resolves whichever is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    /// Accepted recipient addresses
    pub recipients: Vec<String>,

    /// Envelope sender, if declared
    pub sender: Option<String>,

    /// Remote IP the message arrived from
    pub remote_ip: Option<String>,

    /// Spool file name holding the raw message
    #[serde(default)]
    pub spool_name: Option<String>,

    /// Raw message bytes, base64-encoded, when carried inline
    #[serde(default)]
    pub raw: Option<String>,

    /// SHA-256 of the raw message, hex-encoded
    pub content_hash: String,

    /// Raw message size in bytes
    pub size_bytes: u64,

    /// When the message was accepted
    pub received_at: DateTime<Utc>,
}

impl JobPayload {
    /// Account identifier derived from the first accepted recipient's
    /// local part, the addressing scheme mapping inbound mail to accounts
    pub fn account_id(&self) -> Option<&str> {
        self.recipients
            .first()
            .and_then(|r| r.split('@').next())
            .filter(|s| !s.is_empty())
    }
}
