//! Mailgate Core - Mail ingestion gateway
//!
//! Accepts inbound mail over SMTP, rate limits and validates it, spools
//! accepted messages to disk, enqueues delivery jobs deduplicated by
//! content hash, and drives the worker pipeline that scores, parses, and
//! relays each message to the downstream webhook.

pub mod ingest;
pub mod maintenance;
pub mod message;
pub mod smtp;
pub mod spam;
pub mod webhook;
pub mod worker;

pub use ingest::{IngestCoordinator, PolicyValidator, RateLimiter};
pub use maintenance::Maintenance;
pub use smtp::SmtpServer;
pub use spam::{ScanVerdict, SpamScanner};
pub use webhook::{AccountChecker, WebhookClient};
pub use worker::WorkerPool;
