use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::NotificationConfig;

/// An outbound email-style message.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Types of notifications
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum NotificationKind {
    Otp,
    ShipmentConfirmed { order_number: String, waybill: String },
    RetrySucceeded { dedupe_key: String },
    RetryFailed { dedupe_key: String, attempts: i32, last: bool },
}

impl Notification {
    pub fn shipment_confirmed(to: impl Into<String>, order_number: &str, waybill: &str) -> Self {
        Self {
            kind: NotificationKind::ShipmentConfirmed {
                order_number: order_number.to_string(),
                waybill: waybill.to_string(),
            },
            to: to.into(),
            subject: format!("Your order {} has shipped", order_number),
            body: format!(
                "Order {} is on its way. Track it with waybill {}.",
                order_number, waybill
            ),
        }
    }

    pub fn retry_succeeded(to: impl Into<String>, dedupe_key: &str, job_type: &str) -> Self {
        Self {
            kind: NotificationKind::RetrySucceeded {
                dedupe_key: dedupe_key.to_string(),
            },
            to: to.into(),
            subject: format!("[retry] {} succeeded", dedupe_key),
            body: format!("Background {} job {} completed.", job_type, dedupe_key),
        }
    }

    pub fn retry_failed(
        to: impl Into<String>,
        dedupe_key: &str,
        attempts: i32,
        last: bool,
        error: &str,
    ) -> Self {
        let subject = if last {
            format!("[retry] {} is dead after {} attempts", dedupe_key, attempts)
        } else {
            format!("[retry] {} failed (attempt {})", dedupe_key, attempts)
        };
        Self {
            kind: NotificationKind::RetryFailed {
                dedupe_key: dedupe_key.to_string(),
                attempts,
                last,
            },
            to: to.into(),
            subject,
            body: format!("Last error: {}", error),
        }
    }

    /// One-time code message. Issuing and checking codes belongs to the
    /// login flow, which lives outside this service; only the message is here.
    pub fn otp(to: impl Into<String>, code: &str) -> Self {
        Self {
            kind: NotificationKind::Otp,
            to: to.into(),
            subject: "Your verification code".to_string(),
            body: format!("Your one-time code is {}. It expires in 10 minutes.", code),
        }
    }
}

/// Notification service errors
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Notification transport error: {0}")]
    Transport(String),
    #[error("Notification rejected with status {0}")]
    Rejected(u16),
    #[error("Internal error: {0}")]
    Internal(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Writes notifications to the log; used when no relay endpoint is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        info!(to = %notification.to, subject = %notification.subject, "notification");
        Ok(())
    }
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

/// Posts notifications to an HTTP email relay.
#[derive(Clone)]
pub struct HttpEmailNotifier {
    client: reqwest::Client,
    endpoint: String,
    api_token: Option<String>,
    from: String,
}

impl HttpEmailNotifier {
    pub fn new(
        endpoint: impl Into<String>,
        config: &NotificationConfig,
    ) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NotificationError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_token: config.api_token.clone(),
            from: config.from_address.clone(),
        })
    }
}

#[async_trait]
impl Notifier for HttpEmailNotifier {
    #[instrument(skip(self, notification), fields(to = %notification.to))]
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        let mut request = self.client.post(&self.endpoint).json(&RelayMessage {
            from: &self.from,
            to: &notification.to,
            subject: &notification.subject,
            text: &notification.body,
        });
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotificationError::Rejected(response.status().as_u16()));
        }
        debug!("notification relayed");
        Ok(())
    }
}

/// Builds the notifier selected by configuration.
pub fn notifier_from_config(
    config: &NotificationConfig,
) -> Result<Arc<dyn Notifier>, NotificationError> {
    match &config.endpoint {
        Some(endpoint) if !endpoint.trim().is_empty() => {
            Ok(Arc::new(HttpEmailNotifier::new(endpoint.clone(), config)?))
        }
        _ => Ok(Arc::new(LogNotifier)),
    }
}

/// Fire-and-forget dispatch. Sends run on their own task and failures are
/// only logged; callers never wait on delivery.
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    operator_address: Option<String>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, operator_address: Option<String>) -> Self {
        Self {
            notifier,
            operator_address,
        }
    }

    pub fn operator_address(&self) -> Option<&str> {
        self.operator_address.as_deref()
    }

    pub fn dispatch(&self, notification: Notification) -> JoinHandle<()> {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.send(&notification).await {
                warn!(
                    error = %e,
                    to = %notification.to,
                    subject = %notification.subject,
                    "notification failed"
                );
            }
        })
    }

    /// Sends to the operator address, if one is configured.
    pub fn dispatch_to_operator(
        &self,
        build: impl FnOnce(String) -> Notification,
    ) -> Option<JoinHandle<()>> {
        self.operator_address
            .clone()
            .map(|to| self.dispatch(build(to)))
    }
}
