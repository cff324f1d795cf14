use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use switchboard_kernel::backoff_delay;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::warn;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("delivery transport error: {0}")]
    Transport(String),
    #[error("delivery timed out")]
    Timeout,
    #[error("provider rejected delivery with status {0}")]
    Status(u16),
}

impl DeliveryError {
    /// Client errors other than throttling will not succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Transport(_) | DeliveryError::Timeout => true,
            DeliveryError::Status(status) => *status == 429 || *status >= 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub message_id: Option<String>,
}

/// Outbound side of the messaging provider.
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        author: &str,
    ) -> Result<DeliveryReceipt, DeliveryError>;

    async fn set_typing(
        &self,
        conversation_id: &str,
        participant_id: &str,
        typing: bool,
    ) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Duration,
    pub attempt_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempts: usize,
    pub result: Result<DeliveryReceipt, DeliveryError>,
}

/// Sends `text`, retrying retryable failures with exponential backoff until
/// `max_attempts` is spent. Never retries past that; the caller records the
/// final failure.
pub async fn deliver_with_retry(
    gateway: &dyn DeliveryGateway,
    policy: &RetryPolicy,
    conversation_id: &str,
    text: &str,
    author: &str,
) -> DeliveryReport {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = DeliveryError::Timeout;
    let mut attempts = 0;

    for attempt in 0..max_attempts {
        attempts = attempt + 1;
        match timeout(
            policy.attempt_timeout,
            gateway.send_message(conversation_id, text, author),
        )
        .await
        {
            Ok(Ok(receipt)) => {
                return DeliveryReport {
                    attempts,
                    result: Ok(receipt),
                }
            }
            Ok(Err(err)) => last_error = err,
            Err(_) => last_error = DeliveryError::Timeout,
        }

        warn!(
            event_name = "delivery.attempt_failed",
            conversation_id,
            attempt = attempts,
            error = %last_error,
            "reply delivery attempt failed"
        );
        if !last_error.is_retryable() {
            break;
        }
        if attempt + 1 < max_attempts {
            let delay = backoff_delay(policy.backoff, attempt);
            if !delay.is_zero() {
                sleep(delay).await;
            }
        }
    }

    DeliveryReport {
        attempts,
        result: Err(last_error),
    }
}

/// Conversations REST API of the messaging provider.
pub struct ProviderGateway {
    client: Client,
    base_url: String,
    service_id: String,
    account_id: SecretString,
    auth_token: SecretString,
}

pub fn build_gateway(
    cfg: &switchboard_config::Delivery,
    account_id: SecretString,
    auth_token: SecretString,
) -> Result<Arc<dyn DeliveryGateway>, String> {
    let client = Client::builder()
        .timeout(Duration::from_millis(cfg.timeout_ms))
        .build()
        .map_err(|e| e.to_string())?;
    Ok(Arc::new(ProviderGateway {
        client,
        base_url: cfg.base_url.trim_end_matches('/').to_string(),
        service_id: cfg.service_id.clone(),
        account_id,
        auth_token,
    }))
}

impl ProviderGateway {
    fn conversation_url(&self, conversation_id: &str) -> String {
        format!(
            "{}/v1/Services/{}/Conversations/{}",
            self.base_url, self.service_id, conversation_id
        )
    }
}

#[async_trait]
impl DeliveryGateway for ProviderGateway {
    async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        author: &str,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let response = self
            .client
            .post(format!("{}/Messages", self.conversation_url(conversation_id)))
            .basic_auth(
                self.account_id.expose_secret(),
                Some(self.auth_token.expose_secret()),
            )
            .form(&[("Author", author), ("Body", text)])
            .send()
            .await
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            return Err(DeliveryError::Status(response.status().as_u16()));
        }
        let message_id = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v.get("sid").and_then(|sid| sid.as_str()).map(str::to_string));
        Ok(DeliveryReceipt { message_id })
    }

    async fn set_typing(
        &self,
        conversation_id: &str,
        participant_id: &str,
        typing: bool,
    ) -> Result<(), DeliveryError> {
        let attributes = json!({ "typing": typing }).to_string();
        let response = self
            .client
            .post(format!(
                "{}/Participants/{}",
                self.conversation_url(conversation_id),
                participant_id
            ))
            .basic_auth(
                self.account_id.expose_secret(),
                Some(self.auth_token.expose_secret()),
            )
            .form(&[("Attributes", attributes.as_str())])
            .send()
            .await
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            return Err(DeliveryError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

fn classify_transport(err: reqwest::Error) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::Timeout
    } else {
        DeliveryError::Transport(err.to_string())
    }
}
