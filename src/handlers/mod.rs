pub mod cart;
pub mod common;
pub mod health;
pub mod orders;
pub mod retry_jobs;
pub mod shipments;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    notifications::NotificationDispatcher,
    retry_queue::{RetryJobRepository, RetryScheduler, ShipmentRetryHandler},
    services::{
        cart::CartService,
        orders::{OrderCollaborators, OrderService},
    },
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartService>,
    pub orders: Arc<OrderService>,
    pub retry_jobs: Arc<RetryJobRepository>,
    notifications: NotificationDispatcher,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
        collaborators: OrderCollaborators,
    ) -> Self {
        let notifications = collaborators.notifications.clone();
        let cart = Arc::new(CartService::new(db_pool.clone(), event_sender.clone()));
        let orders = Arc::new(OrderService::new(
            db_pool.clone(),
            event_sender.clone(),
            config.clone(),
            collaborators,
        ));
        let retry_jobs = Arc::new(RetryJobRepository::new(db_pool));

        Self {
            cart,
            orders,
            retry_jobs,
            notifications,
            event_sender,
            config,
        }
    }

    /// Retry scheduler wired with every job handler this service knows.
    pub fn retry_scheduler(&self) -> RetryScheduler {
        RetryScheduler::new(
            (*self.retry_jobs).clone(),
            self.notifications.clone(),
            self.event_sender.clone(),
            self.config.retry_queue.clone(),
        )
        .with_handler(Arc::new(ShipmentRetryHandler::new(self.orders.clone())))
    }
}
