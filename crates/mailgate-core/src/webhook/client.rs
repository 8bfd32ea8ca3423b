//! Webhook HTTP client
//!
//! Enriched messages are posted as JSON to the configured endpoint. Any
//! non-2xx answer is a failed delivery; the job queue's retry schedule
//! owns what happens next.

use crate::message::ParsedMessage;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use mailgate_common::config::WebhookConfig;
use mailgate_common::types::JobPayload;
use mailgate_common::{Error, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::message::MailParty;

/// Attachment as carried in the webhook body
#[derive(Debug, Clone, Serialize)]
pub struct WebhookAttachment {
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub size: usize,
    /// Base64-encoded content
    pub content: String,
}

/// JSON body posted to the downstream endpoint
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub account_id: String,
    pub recipients: Vec<String>,
    pub sender: Option<String>,
    pub remote_ip: Option<String>,
    pub subject: Option<String>,
    pub from: Option<MailParty>,
    pub to: Vec<MailParty>,
    pub cc: Vec<MailParty>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<WebhookAttachment>,
    pub spam_score: Option<f64>,
    pub content_hash: String,
    pub size_bytes: u64,
    pub received_at: DateTime<Utc>,
}

impl WebhookPayload {
    /// Assemble the webhook body from the queued job and the parsed
    /// message
    pub fn assemble(
        account_id: &str,
        job: &JobPayload,
        message: &ParsedMessage,
        spam_score: Option<f64>,
    ) -> Self {
        let attachments = message
            .attachments
            .iter()
            .map(|a| WebhookAttachment {
                filename: a.file_name.clone(),
                mime_type: a.content_type.clone(),
                size: a.data.len(),
                content: BASE64.encode(&a.data),
            })
            .collect();

        Self {
            account_id: account_id.to_string(),
            recipients: job.recipients.clone(),
            sender: job.sender.clone(),
            remote_ip: job.remote_ip.clone(),
            subject: message.subject.clone(),
            from: message.from.clone(),
            to: message.to.clone(),
            cc: message.cc.clone(),
            message_id: message.message_id.clone(),
            in_reply_to: message.in_reply_to.clone(),
            text: message.body_text.clone(),
            html: message.body_html.clone(),
            attachments,
            spam_score,
            content_hash: job.content_hash.clone(),
            size_bytes: job.size_bytes,
            received_at: job.received_at,
        }
    }
}

pub struct WebhookClient {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookClient {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::DeliveryFailed(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            secret: config.secret.clone(),
        })
    }

    /// Post one payload downstream
    pub async fn deliver(&self, payload: &WebhookPayload) -> Result<()> {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(secret) = &self.secret {
            request = request.header("X-Webhook-Secret", secret);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::DeliveryFailed(format!("webhook request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            debug!(hash = %payload.content_hash, %status, "Webhook delivered");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(200).collect();
        Err(Error::DeliveryFailed(format!(
            "webhook returned {}: {}",
            status, excerpt
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn job() -> JobPayload {
        JobPayload {
            recipients: vec!["a1b2c3d4-e5f6-7890-abcd-ef1234567890@in.example.com".to_string()],
            sender: Some("alice@example.com".to_string()),
            remote_ip: Some("192.0.2.1".to_string()),
            spool_name: None,
            raw: None,
            content_hash: "deadbeef".to_string(),
            size_bytes: 42,
            received_at: Utc::now(),
        }
    }

    fn parsed() -> ParsedMessage {
        ParsedMessage {
            subject: Some("hello".to_string()),
            attachments: vec![crate::message::Attachment {
                file_name: Some("a.txt".to_string()),
                content_type: Some("text/plain".to_string()),
                data: b"hi".to_vec(),
            }],
            ..Default::default()
        }
    }

    fn config(url: String, secret: Option<&str>) -> WebhookConfig {
        WebhookConfig {
            url,
            timeout_secs: 5,
            secret: secret.map(|s| s.to_string()),
            account_check_url: None,
            account_cache_ttl_secs: 300,
        }
    }

    #[test]
    fn test_assemble_encodes_attachments() {
        let payload = WebhookPayload::assemble(
            "a1b2c3d4-e5f6-7890-abcd-ef1234567890",
            &job(),
            &parsed(),
            Some(0.4),
        );
        assert_eq!(payload.attachments.len(), 1);
        assert_eq!(payload.attachments[0].content, BASE64.encode(b"hi"));
        assert_eq!(payload.attachments[0].size, 2);
        assert_eq!(payload.spam_score, Some(0.4));
    }

    #[tokio::test]
    async fn test_deliver_posts_json_with_secret() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/incoming"))
            .and(header("X-Webhook-Secret", "s3cret"))
            .and(body_partial_json(serde_json::json!({
                "account_id": "a1b2c3d4-e5f6-7890-abcd-ef1234567890",
                "subject": "hello",
                "content_hash": "deadbeef",
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = WebhookClient::new(&config(
            format!("{}/incoming", server.uri()),
            Some("s3cret"),
        ))
        .unwrap();
        let payload = WebhookPayload::assemble(
            "a1b2c3d4-e5f6-7890-abcd-ef1234567890",
            &job(),
            &parsed(),
            None,
        );
        client.deliver(&payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_2xx_is_retryable_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = WebhookClient::new(&config(server.uri(), None)).unwrap();
        let payload = WebhookPayload::assemble("acct", &job(), &parsed(), None);
        let err = client.deliver(&payload).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retryable() {
        let client = WebhookClient::new(&config(
            // RFC 5737 test address, nothing listens there
            "http://192.0.2.55:9/hook".to_string(),
            None,
        ))
        .unwrap();
        let payload = WebhookPayload::assemble("acct", &job(), &parsed(), None);
        let err = client.deliver(&payload).await.unwrap_err();
        assert!(matches!(err, Error::DeliveryFailed(_)));
    }
}
