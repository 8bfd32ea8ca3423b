//! Account existence check
//!
//! Optional pre-delivery check against an internal endpoint. The answer
//! is cached in the counting store so a burst of mail for one account
//! asks the endpoint once per TTL. A cache outage only costs the
//! caching; the check itself still runs.

use mailgate_common::config::WebhookConfig;
use mailgate_common::{Error, Result};
use mailgate_storage::counters::CounterStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Serialize)]
struct AccountCheckRequest<'a> {
    account_id: &'a str,
}

#[derive(Deserialize)]
struct AccountCheckResponse {
    success: bool,
}

pub struct AccountChecker {
    client: reqwest::Client,
    url: Option<String>,
    store: Arc<dyn CounterStore>,
    ttl: Duration,
}

impl AccountChecker {
    pub fn new(config: &WebhookConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::DeliveryFailed(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.account_check_url.clone(),
            store,
            ttl: Duration::from_secs(config.account_cache_ttl_secs),
        })
    }

    /// Whether the account exists. With no check endpoint configured
    /// every account is presumed to exist.
    pub async fn exists(&self, account_id: &str) -> Result<bool> {
        let Some(url) = &self.url else {
            return Ok(true);
        };

        let key = format!("account:{}", account_id);
        match self.store.get(&key).await {
            Ok(Some(cached)) => {
                debug!(account_id, cached, "Account check cache hit");
                return Ok(cached == 1);
            }
            Ok(None) => {}
            Err(e) => warn!(account_id, error = %e, "Account cache read failed"),
        }

        let response = self
            .client
            .post(url)
            .json(&AccountCheckRequest { account_id })
            .send()
            .await
            .map_err(|e| Error::DeliveryFailed(format!("account check failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::DeliveryFailed(format!(
                "account check returned {}",
                status
            )));
        }

        let answer: AccountCheckResponse = response
            .json()
            .await
            .map_err(|e| Error::DeliveryFailed(format!("undecodable account check answer: {}", e)))?;

        if let Err(e) = self
            .store
            .set(&key, if answer.success { 1 } else { 0 }, self.ttl)
            .await
        {
            warn!(account_id, error = %e, "Account cache write failed");
        }
        Ok(answer.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailgate_storage::counters::MemoryCounterStore;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn checker(url: Option<String>) -> AccountChecker {
        AccountChecker::new(
            &WebhookConfig {
                url: "https://api.example.com/webhook".to_string(),
                timeout_secs: 5,
                secret: None,
                account_check_url: url,
                account_cache_ttl_secs: 300,
            },
            Arc::new(MemoryCounterStore::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_no_endpoint_presumes_existence() {
        assert!(checker(None).exists("anything").await.unwrap());
    }

    #[tokio::test]
    async fn test_known_account() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts/check"))
            .and(body_json(serde_json::json!({"account_id": "abc"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true
            })))
            .mount(&server)
            .await;

        let checker = checker(Some(format!("{}/accounts/check", server.uri())));
        assert!(checker.exists("abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false
            })))
            .mount(&server)
            .await;

        let checker = checker(Some(server.uri()));
        assert!(!checker.exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_answers_are_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let checker = checker(Some(server.uri()));
        assert!(checker.exists("abc").await.unwrap());
        // Second call is answered from the cache; the mock's expect(1)
        // verifies the endpoint saw a single request
        assert!(checker.exists("abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_endpoint_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let checker = checker(Some(server.uri()));
        let err = checker.exists("abc").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
