//! Error types for Mailgate

use thiserror::Error;

/// Main error type for Mailgate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Counting store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Spool error: {0}")]
    Spool(String),

    #[error("SMTP error: {0}")]
    Smtp(String),

    #[error("Policy violation: {0}")]
    PolicyRejected(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Message exceeds maximum size of {limit} bytes")]
    SizeExceeded { limit: u64 },

    #[error("Job carries neither inline bytes nor a spool reference")]
    MissingPayload,

    #[error("Message could not be parsed: {0}")]
    MalformedMessage(String),

    #[error("Spam scan timed out after {0} seconds")]
    ScanTimeout(u64),

    #[error("Spam scan failed: {0}")]
    ScanFailed(String),

    #[error("Webhook delivery failed: {0}")]
    DeliveryFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Mailgate
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a delivery job failing with this error should be retried.
    ///
    /// Terminal conditions (policy rejections, unparseable input) must
    /// not be retried; infrastructure trouble must be.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Database(_) => true,
            Error::StoreUnavailable(_) => true,
            Error::QueueUnavailable(_) => true,
            Error::Spool(_) => true,
            Error::ScanTimeout(_) => true,
            Error::ScanFailed(_) => true,
            Error::DeliveryFailed(_) => true,
            Error::Other(_) => true,
            Error::Config(_) => false,
            Error::Smtp(_) => false,
            Error::PolicyRejected(_) => false,
            Error::RateLimited => false,
            Error::SizeExceeded { .. } => false,
            Error::MissingPayload => false,
            Error::MalformedMessage(_) => false,
        }
    }

    /// SMTP reply (status code plus enhanced-status text) for rejections
    /// surfaced inside a mail session.
    pub fn smtp_reply(&self) -> (u16, String) {
        match self {
            Error::PolicyRejected(reason) => (550, format!("5.7.1 {}", reason)),
            Error::RateLimited => (
                451,
                "4.7.1 Rate limit exceeded, try again later".to_string(),
            ),
            Error::SizeExceeded { limit } => (
                552,
                format!("5.3.4 Message exceeds maximum size of {} bytes", limit),
            ),
            Error::Smtp(reason) => (500, format!("5.5.2 {}", reason)),
            _ => (451, "4.3.0 Temporary local error, try again later".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::ScanTimeout(30).is_retryable());
        assert!(Error::DeliveryFailed("503".to_string()).is_retryable());
        assert!(Error::StoreUnavailable("down".to_string()).is_retryable());
        assert!(!Error::MissingPayload.is_retryable());
        assert!(!Error::MalformedMessage("empty".to_string()).is_retryable());
    }

    #[test]
    fn test_smtp_reply_codes() {
        let (code, text) = Error::RateLimited.smtp_reply();
        assert_eq!(code, 451);
        assert!(text.starts_with("4.7.1"));

        let (code, text) = Error::SizeExceeded { limit: 1024 }.smtp_reply();
        assert_eq!(code, 552);
        assert!(text.contains("1024"));

        let (code, _) = Error::PolicyRejected("bad recipient".to_string()).smtp_reply();
        assert_eq!(code, 550);
    }
}
