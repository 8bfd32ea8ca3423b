//! Envelope address policy

use mailgate_common::config::PolicyConfig;
use mailgate_common::types::EmailAddress;
use mailgate_common::{Error, Result};
use regex::Regex;

/// The recipient local part is a UUID-shaped token; it is the addressing
/// scheme mapping inbound mail to internal accounts.
const ACCOUNT_TOKEN_PATTERN: &str =
    r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$";

/// Accept/reject decisions for envelope addresses
pub struct PolicyValidator {
    accepted_domain: String,
    allowed_sender_domains: Vec<String>,
    account_token: Regex,
}

impl PolicyValidator {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            accepted_domain: config.accepted_domain.to_ascii_lowercase(),
            allowed_sender_domains: config
                .allowed_sender_domains
                .iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
            account_token: Regex::new(ACCOUNT_TOKEN_PATTERN).expect("account token pattern"),
        }
    }

    /// A recipient is valid only when its domain is the accepted domain
    /// and its local part is an account token.
    pub fn validate_recipient(&self, address: &EmailAddress) -> Result<()> {
        if !address.domain.eq_ignore_ascii_case(&self.accepted_domain) {
            return Err(Error::PolicyRejected(format!(
                "Relay access denied for domain {}",
                address.domain
            )));
        }
        if !self.account_token.is_match(&address.local) {
            return Err(Error::PolicyRejected(
                "Recipient address rejected: unknown address format".to_string(),
            ));
        }
        Ok(())
    }

    /// Sender validation applies only when an allow-list is configured.
    /// The null reverse path (`MAIL FROM:<>`) is always allowed; bounces
    /// must not be rejected on sender policy.
    pub fn validate_sender(&self, sender: Option<&EmailAddress>) -> Result<()> {
        let Some(address) = sender else {
            return Ok(());
        };
        if self.allowed_sender_domains.is_empty() {
            return Ok(());
        }
        let domain = address.domain.to_ascii_lowercase();
        if self.allowed_sender_domains.contains(&domain) {
            Ok(())
        } else {
            Err(Error::PolicyRejected(format!(
                "Sender domain {} not allowed",
                address.domain
            )))
        }
    }
}
