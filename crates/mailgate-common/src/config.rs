//! Configuration for Mailgate

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration, one section per subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// SMTP listener configuration
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Ingestion policy configuration
    pub policy: PolicyConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Spool configuration
    #[serde(default)]
    pub spool: SpoolConfig,

    /// Queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Delivery worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Spam scanning configuration
    #[serde(default)]
    pub spam: SpamConfig,

    /// Webhook delivery configuration
    pub webhook: WebhookConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SMTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Hostname for the SMTP banner
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bind host
    #[serde(default = "default_smtp_host")]
    pub host: String,

    /// SMTP port
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,

    /// Maximum recipients per message
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Close the connection after a policy rejection instead of keeping
    /// the session open for further commands
    #[serde(default)]
    pub close_on_rejection: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            host: default_smtp_host(),
            port: default_smtp_port(),
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            max_connections: default_max_connections(),
            connection_timeout_secs: default_connection_timeout(),
            close_on_rejection: false,
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_smtp_host() -> String {
    "0.0.0.0".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_max_message_size() -> u64 {
    25 * 1024 * 1024 // 25 MB
}

fn default_max_recipients() -> usize {
    100
}

fn default_max_connections() -> usize {
    100
}

fn default_connection_timeout() -> u64 {
    300
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL; `DATABASE_URL` overrides it
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_db_min_connections")]
    pub min_connections: u32,
}

fn default_db_max_connections() -> u32 {
    20
}

fn default_db_min_connections() -> u32 {
    5
}

/// Ingestion policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// The single domain this gateway accepts mail for
    pub accepted_domain: String,

    /// Sender domains allowed to submit; empty list accepts any sender
    #[serde(default)]
    pub allowed_sender_domains: Vec<String>,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum connections per IP per window
    #[serde(default = "default_ip_max")]
    pub ip_max: u64,

    /// IP window length in seconds
    #[serde(default = "default_ip_window")]
    pub ip_window_secs: u64,

    /// Whether the per-sender limiter is consulted at MAIL FROM
    #[serde(default = "default_sender_enabled")]
    pub sender_enabled: bool,

    /// Maximum messages per sender per window
    #[serde(default = "default_sender_max")]
    pub sender_max: u64,

    /// Sender window length in seconds
    #[serde(default = "default_sender_window")]
    pub sender_window_secs: u64,

    /// Admit traffic when the counting store is unreachable instead of
    /// rejecting with a transient error
    #[serde(default)]
    pub fail_open: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ip_max: default_ip_max(),
            ip_window_secs: default_ip_window(),
            sender_enabled: default_sender_enabled(),
            sender_max: default_sender_max(),
            sender_window_secs: default_sender_window(),
            fail_open: false,
        }
    }
}

fn default_ip_max() -> u64 {
    200
}

fn default_ip_window() -> u64 {
    60
}

fn default_sender_enabled() -> bool {
    true
}

fn default_sender_max() -> u64 {
    100
}

fn default_sender_window() -> u64 {
    60
}

/// Spool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolConfig {
    /// Directory raw messages are spooled into
    #[serde(default = "default_spool_dir")]
    pub dir: PathBuf,

    /// Artifacts older than this are purged by the periodic sweep
    #[serde(default = "default_max_artifact_age")]
    pub max_artifact_age_hours: u64,

    /// Sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            dir: default_spool_dir(),
            max_artifact_age_hours: default_max_artifact_age(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("/var/lib/mailgate/spool")
}

fn default_max_artifact_age() -> u64 {
    24
}

fn default_sweep_interval() -> u64 {
    300
}

/// Queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name delivery jobs are enqueued under
    #[serde(default = "default_queue_name")]
    pub name: String,

    /// Maximum delivery attempts before a job is permanently failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Base retry delay in seconds; doubles per attempt
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,

    /// Active jobs older than this are considered stalled and requeued
    #[serde(default = "default_stalled_after")]
    pub stalled_after_secs: u64,

    /// Completed/failed jobs are purged after this many hours
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            stalled_after_secs: default_stalled_after(),
            retention_hours: default_retention_hours(),
        }
    }
}

fn default_queue_name() -> String {
    "inbound".to_string()
}

fn default_max_attempts() -> i32 {
    5
}

fn default_backoff_secs() -> u64 {
    60
}

fn default_stalled_after() -> u64 {
    300
}

fn default_retention_hours() -> u64 {
    24
}

/// Delivery worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent delivery workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How long an idle worker sleeps before polling the queue again,
    /// in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    5
}

/// What to do with a job when the scanner itself errors (as opposed to
/// returning a verdict)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanErrorPolicy {
    /// Treat the scan error as a retryable job failure
    Retry,
    /// Deliver the message unscanned (fail open)
    Deliver,
    /// Drop the message as if it were spam (fail closed)
    Drop,
}

impl Default for ScanErrorPolicy {
    fn default() -> Self {
        ScanErrorPolicy::Retry
    }
}

/// Spam scanning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamConfig {
    /// Scanner executable
    #[serde(default = "default_scanner_command")]
    pub command: String,

    /// Scanner argument vector (never built from message content)
    #[serde(default = "default_scanner_args")]
    pub args: Vec<String>,

    /// Hard wall-clock timeout for one scan, in seconds
    #[serde(default = "default_scanner_timeout")]
    pub timeout_secs: u64,

    /// Messages scoring above this are treated as spam even without the
    /// scanner's explicit flag
    #[serde(default = "default_spam_threshold")]
    pub threshold: f64,

    /// Policy for scanner errors
    #[serde(default)]
    pub on_error: ScanErrorPolicy,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            command: default_scanner_command(),
            args: default_scanner_args(),
            timeout_secs: default_scanner_timeout(),
            threshold: default_spam_threshold(),
            on_error: ScanErrorPolicy::default(),
        }
    }
}

fn default_scanner_command() -> String {
    "spamc".to_string()
}

fn default_scanner_args() -> Vec<String> {
    vec!["-c".to_string()]
}

fn default_scanner_timeout() -> u64 {
    30
}

fn default_spam_threshold() -> f64 {
    5.0
}

/// Webhook delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Downstream endpoint enriched messages are posted to
    pub url: String,

    /// Request timeout in seconds
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,

    /// Shared secret sent as `X-Webhook-Secret` when set
    pub secret: Option<String>,

    /// Account-existence check endpoint; unset skips the check
    pub account_check_url: Option<String>,

    /// How long an account-existence answer is cached, in seconds
    #[serde(default = "default_account_cache_ttl")]
    pub account_cache_ttl_secs: u64,
}

fn default_webhook_timeout() -> u64 {
    30
}

fn default_account_cache_ttl() -> u64 {
    300
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    /// Parse a single TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("cannot read {}: {}", path.display(), e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Locate, parse, and validate the configuration. The first existing
    /// path wins: `$MAILGATE_CONFIG`, `./config.toml`,
    /// `/etc/mailgate/config.toml`. `DATABASE_URL` overrides the file.
    pub fn load() -> crate::Result<Self> {
        let mut candidates = Vec::new();
        if let Ok(path) = std::env::var("MAILGATE_CONFIG") {
            candidates.push(PathBuf::from(path));
        }
        candidates.push(PathBuf::from("./config.toml"));
        candidates.push(PathBuf::from("/etc/mailgate/config.toml"));

        for path in candidates {
            if path.exists() {
                let mut config = Self::from_file(&path)?;
                if let Ok(url) = std::env::var("DATABASE_URL") {
                    config.database.url = Some(url);
                }
                config.validate()?;
                return Ok(config);
            }
        }

        Err(crate::Error::Config(
            "no configuration file found (set MAILGATE_CONFIG)".to_string(),
        ))
    }

    /// Reject configurations the gateway cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.policy.accepted_domain.trim().is_empty() {
            return Err(crate::Error::Config(
                "policy.accepted_domain must be set".to_string(),
            ));
        }
        if self.webhook.url.trim().is_empty() {
            return Err(crate::Error::Config(
                "webhook.url must be set".to_string(),
            ));
        }
        if self.queue.max_attempts < 1 {
            return Err(crate::Error::Config(
                "queue.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.worker.concurrency == 0 {
            return Err(crate::Error::Config(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }
        if self.smtp.max_message_size == 0 {
            return Err(crate::Error::Config(
                "smtp.max_message_size must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[database]
url = "postgres://localhost/mailgate"

[policy]
accepted_domain = "in.example.com"

[webhook]
url = "https://api.example.com/webhook/incoming"
"#
    }

    #[test]
    fn test_default_config() {
        let smtp = SmtpConfig::default();
        assert_eq!(smtp.port, 25);
        assert_eq!(smtp.max_message_size, 25 * 1024 * 1024);
        assert!(!smtp.close_on_rejection);

        let rl = RateLimitConfig::default();
        assert_eq!(rl.ip_max, 200);
        assert_eq!(rl.ip_window_secs, 60);
        assert!(!rl.fail_open);

        let spam = SpamConfig::default();
        assert_eq!(spam.command, "spamc");
        assert_eq!(spam.args, vec!["-c".to_string()]);
        assert_eq!(spam.on_error, ScanErrorPolicy::Retry);
    }

    #[test]
    fn test_parse_minimal_config() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.policy.accepted_domain, "in.example.com");
        assert_eq!(config.queue.name, "inbound");
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.webhook.timeout_secs, 30);
        assert!(config.webhook.account_check_url.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_overrides() {
        let toml = r#"
[database]
url = "postgres://localhost/mailgate"

[policy]
accepted_domain = "in.example.com"
allowed_sender_domains = ["partner.example.com"]

[rate_limit]
ip_max = 10
fail_open = true

[spam]
command = "rspamc"
args = []
on_error = "deliver"

[webhook]
url = "https://api.example.com/webhook/incoming"
secret = "s3cret"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.rate_limit.ip_max, 10);
        assert!(config.rate_limit.fail_open);
        assert_eq!(config.spam.command, "rspamc");
        assert!(config.spam.args.is_empty());
        assert_eq!(config.spam.on_error, ScanErrorPolicy::Deliver);
        assert_eq!(
            config.policy.allowed_sender_domains,
            vec!["partner.example.com".to_string()]
        );
        assert_eq!(config.webhook.secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_validate_rejects_empty_domain() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.policy.accepted_domain = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
