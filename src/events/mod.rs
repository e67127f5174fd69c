use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event without waiting; a closed or full channel is logged
    /// and otherwise ignored.
    pub fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.sender.try_send(event) {
            counter!("events.dropped", 1);
            warn!(event = name, error = %e, "dropping domain event");
        }
    }
}

/// Domain events emitted by the fulfillment pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        total_amount: i64,
    },
    PaymentVerified {
        order_id: Uuid,
        order_number: String,
        method: String,
    },
    PaymentFailed {
        order_id: Uuid,
        order_number: String,
        reason: String,
    },
    ShipmentCreated {
        order_id: Uuid,
        order_number: String,
        waybill: String,
    },
    CartCleared {
        cart_id: Uuid,
    },
    RetryJobDead {
        dedupe_key: String,
        job_type: String,
        attempts: i32,
        at: DateTime<Utc>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::PaymentVerified { .. } => "payment_verified",
            Event::PaymentFailed { .. } => "payment_failed",
            Event::ShipmentCreated { .. } => "shipment_created",
            Event::CartCleared { .. } => "cart_cleared",
            Event::RetryJobDead { .. } => "retry_job_dead",
        }
    }
}

/// Drains the event channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        counter!("events.processed", 1, "event" => event.name());

        match &event {
            Event::OrderCreated {
                order_number,
                total_amount,
                ..
            } => info!(%order_number, total_amount, "order created"),
            Event::PaymentVerified {
                order_number,
                method,
                ..
            } => info!(%order_number, %method, "payment verified"),
            Event::PaymentFailed {
                order_number,
                reason,
                ..
            } => warn!(%order_number, %reason, "payment failed"),
            Event::ShipmentCreated {
                order_number,
                waybill,
                ..
            } => info!(%order_number, %waybill, "shipment created"),
            Event::CartCleared { cart_id } => debug!(%cart_id, "cart cleared"),
            Event::RetryJobDead {
                dedupe_key,
                job_type,
                attempts,
                ..
            } => warn!(
                %dedupe_key,
                %job_type,
                attempts,
                "retry job is dead and needs manual attention"
            ),
        }
    }

    info!("Event processing loop stopped");
}
