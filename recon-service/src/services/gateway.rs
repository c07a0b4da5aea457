//! Payment gateway status client.
//!
//! Used by the order reconciler to re-check locally `pending` payments
//! against the gateway's view before trusting the local status.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::error::AppError;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{instrument, warn};

/// Gateway's view of one transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayStatus {
    pub status: String,
    pub amount: Decimal,
    pub currency: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_method: Option<String>,
}

/// Read-only lookup of a gateway transaction by its gateway-side id.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// `Ok(None)` means the gateway does not know the transaction.
    async fn query_status(&self, transaction_id: &str) -> Result<Option<GatewayStatus>, AppError>;
}

/// HTTP implementation against the gateway's REST API.
pub struct HttpGatewayClient {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpGatewayClient {
    pub fn new(
        base_url: impl Into<String>,
        api_token: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| {
                AppError::InternalError(anyhow::anyhow!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        })
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    async fn query_status(&self, transaction_id: &str) -> Result<Option<GatewayStatus>, AppError> {
        let url = format!("{}/transactions/{}", self.base_url, transaction_id);

        let mut request = self.client.get(&url);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            AppError::GatewayError(anyhow::anyhow!("Gateway request failed: {}", e))
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            warn!(status = %response.status(), "Gateway returned non-success status");
            return Err(AppError::GatewayError(anyhow::anyhow!(
                "Gateway returned status {}",
                response.status()
            )));
        }

        let status = response.json::<GatewayStatus>().await.map_err(|e| {
            AppError::GatewayError(anyhow::anyhow!("Invalid gateway response: {}", e))
        })?;

        Ok(Some(status))
    }
}
