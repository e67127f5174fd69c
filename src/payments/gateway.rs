use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::PaymentConfig;
use crate::errors::ServiceError;

/// Create-order request sent to the gateway. `receipt` is our public order number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrderRequest {
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Error)]
pub enum PaymentGatewayError {
    #[error("payment gateway timed out")]
    Timeout,
    #[error("payment gateway returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("payment gateway transport error: {0}")]
    Transport(String),
    #[error("unexpected payment gateway response: {0}")]
    Decode(String),
}

impl From<PaymentGatewayError> for ServiceError {
    fn from(err: PaymentGatewayError) -> Self {
        match err {
            PaymentGatewayError::Timeout => ServiceError::Timeout("payment gateway".to_string()),
            other => ServiceError::ExternalServiceError(other.to_string()),
        }
    }
}

/// Payment gateway collaborator.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(
        &self,
        request: GatewayOrderRequest,
    ) -> Result<GatewayOrder, PaymentGatewayError>;
}

/// REST gateway client using basic auth with the key id and secret.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

impl HttpPaymentGateway {
    pub fn new(config: &PaymentConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("payment http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.gateway_base_url.trim_end_matches('/').to_string(),
            key_id: config.key_id.clone(),
            key_secret: config.key_secret.clone(),
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, request), fields(receipt = %request.receipt))]
    async fn create_order(
        &self,
        request: GatewayOrderRequest,
    ) -> Result<GatewayOrder, PaymentGatewayError> {
        let response = self
            .client
            .post(format!("{}/v1/orders", self.base_url))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PaymentGatewayError::Timeout
                } else {
                    PaymentGatewayError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "payment gateway rejected create-order");
            return Err(PaymentGatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let order: GatewayOrder = response
            .json()
            .await
            .map_err(|e| PaymentGatewayError::Decode(e.to_string()))?;
        debug!(gateway_order_id = %order.id, "gateway order created");
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{basic_auth, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> PaymentConfig {
        PaymentConfig {
            gateway_base_url: base_url,
            key_id: "rzp_test".into(),
            key_secret: "secret".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn creates_gateway_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .and(basic_auth("rzp_test", "secret"))
            .and(body_partial_json(serde_json::json!({
                "amount": 918,
                "currency": "INR",
                "receipt": "2026101900001"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "order_abc",
                "amount": 918,
                "currency": "INR",
                "status": "created"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = HttpPaymentGateway::new(&config(server.uri())).unwrap();
        let order = gateway
            .create_order(GatewayOrderRequest {
                amount: 918,
                currency: "INR".into(),
                receipt: "2026101900001".into(),
                notes: BTreeMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(order.id, "order_abc");
        assert_eq!(order.status.as_deref(), Some("created"));
    }

    #[tokio::test]
    async fn server_error_is_reported_as_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let gateway = HttpPaymentGateway::new(&config(server.uri())).unwrap();
        let err = gateway
            .create_order(GatewayOrderRequest {
                amount: 100,
                currency: "INR".into(),
                receipt: "r".into(),
                notes: BTreeMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentGatewayError::Status { status: 503, .. }));
        assert!(ServiceError::from(err).is_retryable());
    }
}
