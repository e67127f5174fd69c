//! Durable retry and dead-letter queue for failed side effects.
//!
//! Failures are upserted on a dedupe key, a single-flight scheduler picks up
//! due jobs in small batches, and jobs that exhaust their attempts go `dead`
//! until an operator requeues them.

mod handlers;
mod repository;
mod scheduler;

pub use handlers::{RetryJobHandler, ShipmentRetryHandler};
pub use repository::{NewRetryJob, RetryJobRepository};
pub use scheduler::{RetryScheduler, RunSummary};

use serde::{Deserialize, Serialize};

use crate::shipping::CarrierShipment;

/// Job type for deferred carrier shipment creation.
pub const SHIPMENT_JOB_TYPE: &str = "create_shipment";

/// One logical shipment attempt per order.
pub fn shipment_dedupe_key(order_number: &str) -> String {
    format!("shipment:{}", order_number)
}

/// Payload of a deferred shipment job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentJobPayload {
    pub order_number: String,
    /// Set when the carrier already issued a waybill that was never recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued: Option<CarrierShipment>,
}
