use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::config::PaymentConfig;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("card payments are not configured")]
    NotConfigured,

    #[error("payment provider unreachable: {0}")]
    Transport(String),

    #[error("payment provider rejected session ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRequest {
    /// Amount in the smallest currency unit.
    pub amount: u64,
    pub currency: String,
    pub description: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PaymentSessionHandle {
    #[serde(rename = "id")]
    pub session_id: String,
    #[serde(rename = "url")]
    pub redirect_url: String,
}

#[async_trait]
pub trait PaymentSession: Send + Sync {
    async fn create_session(
        &self,
        request: SessionRequest,
    ) -> Result<PaymentSessionHandle, PaymentError>;
}

/// Provider reached over HTTP: `POST {base_url}/sessions` with a bearer key.
#[derive(Clone)]
pub struct HttpPaymentSession {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpPaymentSession {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PaymentError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| PaymentError::Transport(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl PaymentSession for HttpPaymentSession {
    async fn create_session(
        &self,
        request: SessionRequest,
    ) -> Result<PaymentSessionHandle, PaymentError> {
        let url = format!("{}/sessions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| PaymentError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "payment session creation failed");
            return Err(PaymentError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let handle: PaymentSessionHandle = response
            .json()
            .await
            .map_err(|err| PaymentError::Transport(format!("invalid session response: {err}")))?;

        info!(session_id = %handle.session_id, amount = request.amount, "payment session created");
        Ok(handle)
    }
}

/// Stand-in when no provider is configured; every card settlement fails.
pub struct Unconfigured;

#[async_trait]
impl PaymentSession for Unconfigured {
    async fn create_session(
        &self,
        _request: SessionRequest,
    ) -> Result<PaymentSessionHandle, PaymentError> {
        Err(PaymentError::NotConfigured)
    }
}

/// Picks the HTTP provider when both URL and key are set.
pub fn from_config(config: &PaymentConfig) -> Result<Arc<dyn PaymentSession>, PaymentError> {
    match (&config.provider_url, &config.api_key) {
        (Some(url), Some(key)) => Ok(Arc::new(HttpPaymentSession::new(
            url.clone(),
            key.clone(),
            config.timeout,
        )?)),
        _ => Ok(Arc::new(Unconfigured)),
    }
}
