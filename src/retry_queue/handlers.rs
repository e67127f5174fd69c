use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{ShipmentJobPayload, SHIPMENT_JOB_TYPE};
use crate::entities::RetryJobModel;
use crate::errors::ServiceError;
use crate::services::orders::{OrderService, ShipmentTrigger};

/// Re-runs one kind of failed side effect from its stored payload.
#[async_trait]
pub trait RetryJobHandler: Send + Sync {
    fn job_type(&self) -> &'static str;

    async fn handle(&self, job: &RetryJobModel) -> Result<(), ServiceError>;
}

/// Completes a shipment that a client request could not create. Goes through
/// the same idempotent path as the client, so a shipment created in the
/// meantime counts as success.
pub struct ShipmentRetryHandler {
    orders: Arc<OrderService>,
}

impl ShipmentRetryHandler {
    pub fn new(orders: Arc<OrderService>) -> Self {
        Self { orders }
    }
}

#[async_trait]
impl RetryJobHandler for ShipmentRetryHandler {
    fn job_type(&self) -> &'static str {
        SHIPMENT_JOB_TYPE
    }

    async fn handle(&self, job: &RetryJobModel) -> Result<(), ServiceError> {
        let payload: ShipmentJobPayload = serde_json::from_value(job.payload.clone())?;
        let outcome = self
            .orders
            .create_shipment_with(&payload.order_number, ShipmentTrigger::RetryWorker)
            .await?;
        info!(
            order_number = %payload.order_number,
            waybill = %outcome.shipment.waybill,
            already_existed = outcome.already_existed,
            "deferred shipment completed"
        );
        Ok(())
    }
}
