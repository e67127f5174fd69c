use crate::{
    config::AppConfig,
    entities::{
        address, order, order::OrderLine, payment, shipment, Address, AddressModel, Cart, Order,
        OrderModel, OrderStatus, Payment, PaymentMethod, PaymentModel, PaymentStatus, Shipment,
        ShipmentModel,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    notifications::{Notification, NotificationDispatcher},
    payments::{GatewayOrderRequest, PaymentGateway, PaymentSignatureVerifier},
    retry_queue::{
        shipment_dedupe_key, NewRetryJob, RetryJobRepository, ShipmentJobPayload,
        SHIPMENT_JOB_TYPE,
    },
    services::{
        cart::{CartOwner, CartService},
        order_numbers::OrderNumberGenerator,
    },
    shipping::{
        build_shipment_request, sanitize_order_ref, weight, CarrierClient, CarrierShipment,
        ShipmentLine, ShipmentRequest, TrackingInfo, TrackingQuery,
    },
};
use chrono::{Duration as ChronoDuration, Utc};
use metrics::counter;
use sea_orm::{
    sea_query::Condition, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn, Instrument, Span};
use uuid::Uuid;

/// External collaborators the state machine talks to.
#[derive(Clone)]
pub struct OrderCollaborators {
    pub carrier: Arc<dyn CarrierClient>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifications: NotificationDispatcher,
}

/// Who asked for a shipment. Only client-triggered failures are queued; the
/// retry worker records its own failures on the job it is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipmentTrigger {
    Client,
    RetryWorker,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateOrderInput {
    /// Defaults to online payment
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyPaymentInput {
    pub gateway_order_id: String,
    pub gateway_payment_id: String,
    pub signature: String,
}

/// What a client needs to open the gateway checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInitiation {
    pub order_number: String,
    pub gateway_order_id: String,
    pub amount: i64,
    pub currency: String,
    pub key_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentOutcome {
    pub shipment: ShipmentModel,
    /// True when an earlier attempt had already created the shipment
    pub already_existed: bool,
}

/// Drives an order from creation through payment to exactly one carrier shipment.
///
/// All cross-request coordination happens in the database: the unique order
/// number, the unique shipment per order and a conditional-update claim on
/// the order row. No in-process lock is held across an await.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
    carts: CartService,
    numbers: OrderNumberGenerator,
    carrier: Arc<dyn CarrierClient>,
    gateway: Arc<dyn PaymentGateway>,
    verifier: PaymentSignatureVerifier,
    notifications: NotificationDispatcher,
    retry_jobs: RetryJobRepository,
}

impl OrderService {
    /// Creates a new `OrderService` instance.
    ///
    /// # Arguments
    ///
    /// * `db` - Database connection pool
    /// * `event_sender` - Event sender for publishing order events
    /// * `config` - Application configuration (payment secret, timeouts, retry budget)
    /// * `collaborators` - Carrier, payment gateway and notification channel
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
        collaborators: OrderCollaborators,
    ) -> Self {
        Self {
            carts: CartService::new(db.clone(), event_sender.clone()),
            numbers: OrderNumberGenerator::new(db.clone(), config.orders.number_strategy),
            retry_jobs: RetryJobRepository::new(db.clone()),
            verifier: PaymentSignatureVerifier::new(config.payment.key_secret.clone()),
            carrier: collaborators.carrier,
            gateway: collaborators.gateway,
            notifications: collaborators.notifications,
            db,
            event_sender,
            config,
        }
    }

    pub async fn get_order(&self, order_number: &str) -> Result<OrderModel, ServiceError> {
        Order::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_number)))
    }

    pub async fn get_payment(&self, order_id: Uuid) -> Result<PaymentModel, ServiceError> {
        Payment::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Payment for order {} not found", order_id))
            })
    }

    pub async fn find_shipment(
        &self,
        order_id: Uuid,
    ) -> Result<Option<ShipmentModel>, ServiceError> {
        Ok(Shipment::find()
            .filter(shipment::Column::OrderId.eq(order_id))
            .one(&*self.db)
            .await?)
    }

    /// Converts the owner's cart into an order with an `initiated` payment.
    ///
    /// The cart is left untouched; it is cleared once the shipment exists.
    /// A clash on the public order number is retried with a fresh number up
    /// to `orders.max_create_attempts` times.
    ///
    /// # Returns
    ///
    /// * `Ok(OrderModel)` - The persisted order
    /// * `Err(ServiceError::CartEmpty)` - Owner has no cart or no items
    /// * `Err(ServiceError::OrderCreateFailed)` - No unique order number could be allocated
    #[instrument(skip(self))]
    pub async fn create_order(
        &self,
        owner: &CartOwner,
        input: CreateOrderInput,
    ) -> Result<OrderModel, ServiceError> {
        let cart = self
            .carts
            .get_cart(owner)
            .await?
            .filter(|c| !c.items.is_empty())
            .ok_or(ServiceError::CartEmpty)?;

        let lines: Vec<OrderLine> = cart
            .items
            .iter()
            .map(|item| OrderLine {
                product_id: item.product_id,
                product_name: item.product_name.clone(),
                size: item.size.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                line_total: item.line_total,
            })
            .collect();
        let mut product_ids: Vec<Uuid> = Vec::with_capacity(lines.len());
        for line in &lines {
            if !product_ids.contains(&line.product_id) {
                product_ids.push(line.product_id);
            }
        }
        let draft = OrderDraft {
            owner,
            cart_id: cart.cart.id,
            method: input.payment_method.unwrap_or(PaymentMethod::Online),
            total_amount: cart.cart.total_price,
            product_count: cart.cart.product_count,
            product_ids: serde_json::to_value(&product_ids)?,
            line_items: serde_json::to_value(&lines)?,
        };

        let max_attempts = self.config.orders.max_create_attempts.max(1);
        for attempt in 1..=max_attempts {
            let order_number = self.numbers.next().await;
            match self.insert_order(&draft, &order_number).await {
                Ok(order) => {
                    counter!("orders.created", 1);
                    info!(
                        order_number = %order.order_number,
                        total = order.total_amount,
                        "order created"
                    );
                    self.event_sender.send_or_log(Event::OrderCreated {
                        order_id: order.id,
                        order_number: order.order_number.clone(),
                        total_amount: order.total_amount,
                    });
                    return Ok(order);
                }
                Err(e) if e.is_unique_violation() => {
                    counter!("orders.number_conflicts", 1);
                    warn!(%order_number, attempt, "order number already taken, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(ServiceError::OrderCreateFailed(format!(
            "no unique order number after {} attempts",
            max_attempts
        )))
    }

    async fn insert_order(
        &self,
        draft: &OrderDraft<'_>,
        order_number: &str,
    ) -> Result<OrderModel, ServiceError> {
        let now = Utc::now();
        let txn = self.db.begin().await?;

        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_number: Set(order_number.to_string()),
            user_id: Set(draft.owner.user_id()),
            session_id: Set(draft.owner.session_id()),
            cart_id: Set(draft.cart_id),
            status: Set(OrderStatus::Created),
            payment_method: Set(draft.method),
            total_amount: Set(draft.total_amount),
            currency: Set(self.config.payment.currency.clone()),
            product_ids: Set(draft.product_ids.clone()),
            product_count: Set(draft.product_count),
            line_items: Set(draft.line_items.clone()),
            carrier_order_ref: Set(None),
            gateway_order_id: Set(None),
            gateway_payment_id: Set(None),
            shipment_claimed_at: Set(None),
            issued_shipment: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            amount: Set(order.total_amount),
            currency: Set(order.currency.clone()),
            method: Set(draft.method),
            status: Set(PaymentStatus::Initiated),
            gateway_order_id: Set(None),
            gateway_payment_id: Set(None),
            failure_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        Ok(order)
    }

    /// Opens a gateway order for online payment and moves the order to
    /// `pending_payment`. Repeated calls reuse the first gateway order.
    #[instrument(skip(self))]
    pub async fn initiate_online_payment(
        &self,
        order_number: &str,
    ) -> Result<PaymentInitiation, ServiceError> {
        let order = self.get_order(order_number).await?;
        if !order.status.accepts_payment() {
            return Err(ServiceError::InvalidStatus(format!(
                "order {} is {:?}, payment cannot be initiated",
                order_number, order.status
            )));
        }

        let gateway_order_id = match order.gateway_order_id.clone() {
            Some(id) => {
                debug!(gateway_order_id = %id, "reusing gateway order");
                id
            }
            None => {
                let mut notes = BTreeMap::new();
                notes.insert("order_id".to_string(), order.id.to_string());
                let request = GatewayOrderRequest {
                    amount: order.total_amount,
                    currency: order.currency.clone(),
                    receipt: order.order_number.clone(),
                    notes,
                };
                let timeout = Duration::from_secs(self.config.payment.timeout_secs);
                with_timeout(timeout, "payment gateway", self.gateway.create_order(request))
                    .await?
                    .map_err(ServiceError::from)?
                    .id
            }
        };

        let now = Utc::now();
        let txn = self.db.begin().await?;
        let payment = Payment::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .one(&txn)
            .await?;
        let mut active: order::ActiveModel = order.clone().into();
        active.status = Set(OrderStatus::PendingPayment);
        active.payment_method = Set(PaymentMethod::Online);
        active.gateway_order_id = Set(Some(gateway_order_id.clone()));
        active.updated_at = Set(now);
        active.update(&txn).await?;
        if let Some(payment) = payment {
            let mut active: payment::ActiveModel = payment.into();
            active.method = Set(PaymentMethod::Online);
            active.gateway_order_id = Set(Some(gateway_order_id.clone()));
            active.updated_at = Set(now);
            active.update(&txn).await?;
        }
        txn.commit().await?;

        Ok(PaymentInitiation {
            order_number: order.order_number,
            gateway_order_id,
            amount: order.total_amount,
            currency: order.currency,
            key_id: self.config.payment.key_id.clone(),
        })
    }

    /// Checks the gateway signature and marks the order paid.
    ///
    /// On a mismatch only the payment record is marked failed; the order keeps
    /// its status so the customer can retry.
    #[instrument(skip(self, input), fields(gateway_payment_id = %input.gateway_payment_id))]
    pub async fn verify_online_payment(
        &self,
        order_number: &str,
        input: VerifyPaymentInput,
    ) -> Result<OrderModel, ServiceError> {
        let order = self.get_order(order_number).await?;

        if order.status.is_shippable()
            && order.gateway_payment_id.as_deref() == Some(input.gateway_payment_id.as_str())
        {
            debug!("payment already verified");
            return Ok(order);
        }
        if !order.status.accepts_payment() {
            return Err(ServiceError::InvalidStatus(format!(
                "order {} is {:?}, payment cannot be verified",
                order_number, order.status
            )));
        }

        let known_gateway_order = order
            .gateway_order_id
            .as_deref()
            .map_or(true, |id| id == input.gateway_order_id);
        let signature_ok = self.verifier.verify(
            &input.gateway_order_id,
            &input.gateway_payment_id,
            &input.signature,
        );
        let now = Utc::now();

        if !known_gateway_order || !signature_ok {
            let reason = if known_gateway_order {
                "signature mismatch"
            } else {
                "gateway order does not belong to this order"
            };
            let payment = self.get_payment(order.id).await?;
            let mut active: payment::ActiveModel = payment.into();
            active.status = Set(PaymentStatus::Failed);
            active.gateway_payment_id = Set(Some(input.gateway_payment_id.clone()));
            active.failure_reason = Set(Some(reason.to_string()));
            active.updated_at = Set(now);
            active.update(&*self.db).await?;

            counter!("payments.verification_failed", 1);
            warn!(%order_number, reason, "payment verification failed");
            self.event_sender.send_or_log(Event::PaymentFailed {
                order_id: order.id,
                order_number: order.order_number.clone(),
                reason: reason.to_string(),
            });
            return Err(ServiceError::PaymentVerificationFailed(reason.to_string()));
        }

        let txn = self.db.begin().await?;
        let payment = Payment::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Payment for order {} not found", order_number))
            })?;
        let mut active_payment: payment::ActiveModel = payment.into();
        active_payment.status = Set(PaymentStatus::Success);
        active_payment.method = Set(PaymentMethod::Online);
        active_payment.gateway_order_id = Set(Some(input.gateway_order_id.clone()));
        active_payment.gateway_payment_id = Set(Some(input.gateway_payment_id.clone()));
        active_payment.failure_reason = Set(None);
        active_payment.updated_at = Set(now);
        active_payment.update(&txn).await?;

        let mut active_order: order::ActiveModel = order.into();
        active_order.status = Set(OrderStatus::Paid);
        active_order.payment_method = Set(PaymentMethod::Online);
        active_order.gateway_order_id = Set(Some(input.gateway_order_id));
        active_order.gateway_payment_id = Set(Some(input.gateway_payment_id));
        active_order.updated_at = Set(now);
        let order = active_order.update(&txn).await?;
        txn.commit().await?;

        counter!("payments.verified", 1, "method" => "online");
        info!(%order_number, "online payment verified");
        self.event_sender.send_or_log(Event::PaymentVerified {
            order_id: order.id,
            order_number: order.order_number.clone(),
            method: "online".to_string(),
        });
        Ok(order)
    }

    /// Confirms cash on delivery; the payment stays `pending` until collected.
    #[instrument(skip(self))]
    pub async fn confirm_cod(&self, order_number: &str) -> Result<OrderModel, ServiceError> {
        let order = self.get_order(order_number).await?;
        if order.status == OrderStatus::CodConfirmed {
            return Ok(order);
        }
        if !order.status.accepts_payment() {
            return Err(ServiceError::InvalidStatus(format!(
                "order {} is {:?}, cash on delivery cannot be confirmed",
                order_number, order.status
            )));
        }

        let now = Utc::now();
        let txn = self.db.begin().await?;
        if let Some(payment) = Payment::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .one(&txn)
            .await?
        {
            let mut active: payment::ActiveModel = payment.into();
            active.status = Set(PaymentStatus::Pending);
            active.method = Set(PaymentMethod::Cod);
            active.failure_reason = Set(None);
            active.updated_at = Set(now);
            active.update(&txn).await?;
        }
        let mut active: order::ActiveModel = order.into();
        active.status = Set(OrderStatus::CodConfirmed);
        active.payment_method = Set(PaymentMethod::Cod);
        active.updated_at = Set(now);
        let order = active.update(&txn).await?;
        txn.commit().await?;

        counter!("payments.verified", 1, "method" => "cod");
        info!(%order_number, "cash on delivery confirmed");
        self.event_sender.send_or_log(Event::PaymentVerified {
            order_id: order.id,
            order_number: order.order_number.clone(),
            method: "cod".to_string(),
        });
        Ok(order)
    }

    /// Records a failure reported by the gateway (`pending_payment → payment_failed`).
    #[instrument(skip(self))]
    pub async fn record_payment_failure(
        &self,
        order_number: &str,
        reason: &str,
    ) -> Result<OrderModel, ServiceError> {
        let order = self.get_order(order_number).await?;
        match order.status {
            OrderStatus::PaymentFailed => return Ok(order),
            OrderStatus::PendingPayment => {}
            other => {
                return Err(ServiceError::InvalidStatus(format!(
                    "order {} is {:?}, only pending payments can fail",
                    order_number, other
                )))
            }
        }

        let now = Utc::now();
        let txn = self.db.begin().await?;
        if let Some(payment) = Payment::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .one(&txn)
            .await?
        {
            let mut active: payment::ActiveModel = payment.into();
            active.status = Set(PaymentStatus::Failed);
            active.failure_reason = Set(Some(reason.to_string()));
            active.updated_at = Set(now);
            active.update(&txn).await?;
        }
        let mut active: order::ActiveModel = order.into();
        active.status = Set(OrderStatus::PaymentFailed);
        active.updated_at = Set(now);
        let order = active.update(&txn).await?;
        txn.commit().await?;

        self.event_sender.send_or_log(Event::PaymentFailed {
            order_id: order.id,
            order_number: order.order_number.clone(),
            reason: reason.to_string(),
        });
        Ok(order)
    }

    /// Client entry point for shipment creation.
    pub async fn create_shipment(
        &self,
        order_number: &str,
    ) -> Result<ShipmentOutcome, ServiceError> {
        self.create_shipment_with(order_number, ShipmentTrigger::Client).await
    }

    /// Creates the carrier shipment for a paid order at most once.
    ///
    /// 1. An existing shipment short-circuits to cart clearing and is returned.
    /// 2. The order must be paid or COD-confirmed and have a default address.
    /// 3. The order row is claimed (`shipment_creating`) with a conditional
    ///    update so only one caller reaches the carrier.
    /// 4. The rest runs on its own task, so a dropped caller cannot strand
    ///    the claim. A waybill kept from an earlier attempt is reused;
    ///    otherwise the carrier is called with a timeout. On failure the
    ///    claim is released and, for client calls, a retry job is upserted.
    /// 5. The shipment insert is unique per order; losing that race means the
    ///    shipment already exists and it is returned instead. Any other
    ///    insert failure keeps the waybill on the order and queues a retry.
    #[instrument(skip(self))]
    pub async fn create_shipment_with(
        &self,
        order_number: &str,
        trigger: ShipmentTrigger,
    ) -> Result<ShipmentOutcome, ServiceError> {
        let order = self.get_order(order_number).await?;

        if let Some(existing) = self.find_shipment(order.id).await? {
            if !existing.waybill.is_empty() {
                debug!(waybill = %existing.waybill, "shipment already created");
                self.clear_cart_best_effort(order.cart_id).await;
                return Ok(ShipmentOutcome {
                    shipment: existing,
                    already_existed: true,
                });
            }
        }

        if !order.status.is_shippable() {
            return Err(ServiceError::InvalidStatus(format!(
                "order {} is {:?}, payment must be confirmed before shipping",
                order_number, order.status
            )));
        }

        let address = self
            .default_address(&order)
            .await?
            .ok_or(ServiceError::AddressMissing)?;

        let order_ref = order
            .carrier_order_ref
            .clone()
            .unwrap_or_else(|| sanitize_order_ref(&order.order_number));
        if !self.claim_for_shipment(&order, &order_ref).await? {
            return Err(ServiceError::ShipmentInProgress(order.order_number.clone()));
        }

        // Past the claim the attempt must run to completion even when the
        // caller is dropped, or the claim is never released and nothing is queued.
        let service = self.clone();
        let number = order.order_number.clone();
        let task = tokio::spawn(
            async move {
                service
                    .ship_claimed_order(order, address, order_ref, trigger)
                    .await
            }
            .instrument(Span::current()),
        );
        task.await.map_err(|e| {
            error!(order_number = %number, error = %e, "shipment task aborted");
            ServiceError::InternalError(format!("shipment task for {} failed: {}", number, e))
        })?
    }

    /// Everything between a successful claim and the recorded shipment.
    async fn ship_claimed_order(
        &self,
        order: OrderModel,
        address: AddressModel,
        order_ref: String,
        trigger: ShipmentTrigger,
    ) -> Result<ShipmentOutcome, ServiceError> {
        let order_number = order.order_number.as_str();
        let prepared = match self.issued_shipment(&order).await {
            Ok(issued) => self.shipment_lines(&order).await.map(|lines| (issued, lines)),
            Err(e) => Err(e),
        };
        let (issued, lines) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.release_claim(&order).await;
                return Err(e);
            }
        };
        let package = weight::select_package(weight::item_grams(
            lines.iter().map(|l| (l.size.as_str(), l.quantity)),
        ));
        let request = build_shipment_request(
            &order,
            &order_ref,
            &address,
            &lines,
            &package,
            &self.config.carrier,
        );
        let encoded = serde_json::to_value(&request.consignee)
            .and_then(|consignee| serde_json::to_value(&lines).map(|lines| (consignee, lines)));
        let (consignee, line_items) = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                self.release_claim(&order).await;
                return Err(e.into());
            }
        };

        let created = match issued {
            Some(issued) => {
                counter!("shipments.recovered_waybills", 1);
                info!(
                    %order_number,
                    waybill = %issued.waybill,
                    "recording waybill issued by an earlier attempt"
                );
                issued
            }
            None => match self.call_carrier(&request).await {
                Ok(created) => created,
                Err(err) => {
                    counter!("shipments.carrier_failures", 1);
                    warn!(%order_number, error = %err, "carrier shipment call failed");
                    self.release_claim(&order).await;
                    if trigger == ShipmentTrigger::Client {
                        self.enqueue_shipment_retry(order_number, &err, None).await;
                    }
                    return Err(err);
                }
            },
        };

        let now = Utc::now();
        let record = shipment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            order_number: Set(order.order_number.clone()),
            carrier_order_ref: Set(order_ref.clone()),
            waybill: Set(created.waybill.clone()),
            consignee: Set(consignee),
            payment_mode: Set(request.payment_mode.as_str().to_string()),
            cod_amount: Set(request.cod_amount),
            weight_grams: Set(package.shipped_grams),
            package_tier: Set(package.tier.code().to_string()),
            length_cm: Set(package.dimensions.length_cm),
            breadth_cm: Set(package.dimensions.breadth_cm),
            height_cm: Set(package.dimensions.height_cm),
            products_description: Set(request.products_description.clone()),
            line_items: Set(line_items),
            carrier_status: Set(Some(created.status.clone())),
            sort_code: Set(created.sort_code.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let shipment = match self.persist_shipment(&order, record).await {
            Ok(shipment) => shipment,
            Err(e) if e.is_unique_violation() => {
                warn!(%order_number, waybill = %created.waybill, "shipment recorded concurrently");
                let existing = self.find_shipment(order.id).await?.ok_or_else(|| {
                    ServiceError::InternalError(format!(
                        "shipment for {} vanished after conflict",
                        order_number
                    ))
                })?;
                self.clear_cart_best_effort(order.cart_id).await;
                return Ok(ShipmentOutcome {
                    shipment: existing,
                    already_existed: true,
                });
            }
            Err(e) => {
                error!(
                    %order_number,
                    waybill = %created.waybill,
                    error = %e,
                    "carrier accepted shipment but it could not be recorded"
                );
                // the next attempt records this waybill instead of calling the carrier again
                self.keep_issued_shipment(&order, &created).await;
                self.release_claim(&order).await;
                self.enqueue_shipment_retry(order_number, &e, Some(&created)).await;
                return Err(e);
            }
        };

        counter!("shipments.created", 1);
        info!(
            %order_number,
            waybill = %shipment.waybill,
            weight = shipment.weight_grams,
            "shipment created"
        );

        self.event_sender.send_or_log(Event::ShipmentCreated {
            order_id: order.id,
            order_number: order.order_number.clone(),
            waybill: shipment.waybill.clone(),
        });
        match address.email.as_deref().filter(|e| !e.trim().is_empty()) {
            Some(email) => {
                self.notifications.dispatch(Notification::shipment_confirmed(
                    email,
                    &order.order_number,
                    &shipment.waybill,
                ));
            }
            None => debug!("no customer email on address, skipping confirmation"),
        }
        self.clear_cart_best_effort(order.cart_id).await;

        Ok(ShipmentOutcome {
            shipment,
            already_existed: false,
        })
    }

    async fn call_carrier(
        &self,
        request: &ShipmentRequest,
    ) -> Result<CarrierShipment, ServiceError> {
        let timeout = Duration::from_secs(self.config.carrier.timeout_secs);
        with_timeout(timeout, "carrier", self.carrier.create_shipment(request))
            .await?
            .map_err(ServiceError::from)
    }

    /// A waybill the carrier issued on an earlier attempt that never made it
    /// into the shipments table. The order row is checked first, then the
    /// queued retry job.
    async fn issued_shipment(
        &self,
        order: &OrderModel,
    ) -> Result<Option<CarrierShipment>, ServiceError> {
        let stored = Order::find_by_id(order.id)
            .one(&*self.db)
            .await?
            .and_then(|current| current.issued_shipment)
            .and_then(|value| serde_json::from_value::<CarrierShipment>(value).ok());
        if stored.is_some() {
            return Ok(stored);
        }
        let queued = self
            .retry_jobs
            .find_by_dedupe_key(&shipment_dedupe_key(&order.order_number))
            .await?
            .and_then(|job| serde_json::from_value::<ShipmentJobPayload>(job.payload).ok())
            .and_then(|payload| payload.issued);
        Ok(queued)
    }

    async fn keep_issued_shipment(&self, order: &OrderModel, created: &CarrierShipment) {
        let value = match serde_json::to_value(created) {
            Ok(value) => value,
            Err(e) => {
                error!(
                    order_number = %order.order_number,
                    error = %e,
                    "failed to encode issued shipment"
                );
                return;
            }
        };
        let result = Order::update_many()
            .set(order::ActiveModel {
                issued_shipment: Set(Some(value)),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order.id))
            .exec(&*self.db)
            .await;
        if let Err(e) = result {
            error!(
                order_number = %order.order_number,
                waybill = %created.waybill,
                error = %e,
                "failed to keep issued waybill on the order"
            );
        }
    }

    /// Looks up carrier tracking and refreshes the stored carrier status.
    #[instrument(skip(self))]
    pub async fn track_shipment(&self, query: TrackingQuery) -> Result<TrackingInfo, ServiceError> {
        let filter = match &query {
            TrackingQuery::Waybill(waybill) => shipment::Column::Waybill.eq(waybill.clone()),
            TrackingQuery::OrderRef(order_ref) => {
                shipment::Column::CarrierOrderRef.eq(order_ref.clone())
            }
        };
        let record = Shipment::find()
            .filter(filter)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound("Shipment not found".to_string()))?;

        let timeout = Duration::from_secs(self.config.carrier.timeout_secs);
        let info = with_timeout(timeout, "carrier", self.carrier.track(&query))
            .await?
            .map_err(ServiceError::from)?;

        if record.carrier_status.as_deref() != Some(info.status.as_str()) {
            let mut active: shipment::ActiveModel = record.into();
            active.carrier_status = Set(Some(info.status.clone()));
            active.updated_at = Set(Utc::now());
            active.update(&*self.db).await?;
        }
        Ok(info)
    }

    async fn default_address(
        &self,
        order: &OrderModel,
    ) -> Result<Option<AddressModel>, ServiceError> {
        let mut owner = Condition::any();
        if let Some(user_id) = order.user_id {
            owner = owner.add(address::Column::UserId.eq(user_id));
        }
        if let Some(session_id) = &order.session_id {
            owner = owner.add(address::Column::SessionId.eq(session_id.clone()));
        }
        if order.user_id.is_none() && order.session_id.is_none() {
            return Ok(None);
        }
        Ok(Address::find()
            .filter(owner)
            .filter(address::Column::IsDefault.eq(true))
            .order_by_desc(address::Column::CreatedAt)
            .one(&*self.db)
            .await?)
    }

    /// Package contents come from the cart; the order snapshot is used once
    /// the cart has been emptied or removed.
    async fn shipment_lines(&self, order: &OrderModel) -> Result<Vec<ShipmentLine>, ServiceError> {
        let cart_items = match Cart::find_by_id(order.cart_id).one(&*self.db).await? {
            Some(cart) => self.carts.items(cart.id).await?,
            None => Vec::new(),
        };
        if !cart_items.is_empty() {
            return Ok(cart_items
                .into_iter()
                .map(|item| ShipmentLine {
                    product_name: item.product_name,
                    size: item.size,
                    quantity: item.quantity,
                })
                .collect());
        }
        Ok(order
            .lines()
            .into_iter()
            .map(|line| ShipmentLine {
                product_name: line.product_name,
                size: line.size,
                quantity: line.quantity,
            })
            .collect())
    }

    /// Conditional update taking the order into `shipment_creating`. A stale
    /// claim (older than the lease) may be taken over.
    async fn claim_for_shipment(
        &self,
        order: &OrderModel,
        order_ref: &str,
    ) -> Result<bool, ServiceError> {
        let now = Utc::now();
        let lease = ChronoDuration::seconds(self.config.orders.shipment_claim_lease_secs as i64);
        let claimable = Condition::any()
            .add(order::Column::Status.is_in([OrderStatus::Paid, OrderStatus::CodConfirmed]))
            .add(
                Condition::all()
                    .add(order::Column::Status.eq(OrderStatus::ShipmentCreating))
                    .add(
                        Condition::any()
                            .add(order::Column::ShipmentClaimedAt.lt(now - lease))
                            .add(order::Column::ShipmentClaimedAt.is_null()),
                    ),
            );

        let result = Order::update_many()
            .set(order::ActiveModel {
                status: Set(OrderStatus::ShipmentCreating),
                shipment_claimed_at: Set(Some(now)),
                carrier_order_ref: Set(Some(order_ref.to_string())),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order.id))
            .filter(claimable)
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            debug!(order_number = %order.order_number, "shipment claim held elsewhere");
        }
        Ok(result.rows_affected == 1)
    }

    /// Hands the order back to its paid state after a failed attempt.
    async fn release_claim(&self, order: &OrderModel) {
        let paid_status = if order.is_cod() {
            OrderStatus::CodConfirmed
        } else {
            OrderStatus::Paid
        };
        let result = Order::update_many()
            .set(order::ActiveModel {
                status: Set(paid_status),
                shipment_claimed_at: Set(None),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::Status.eq(OrderStatus::ShipmentCreating))
            .exec(&*self.db)
            .await;
        if let Err(e) = result {
            // the lease expires on its own
            warn!(
                order_number = %order.order_number,
                error = %e,
                "failed to release shipment claim"
            );
        }
    }

    async fn persist_shipment(
        &self,
        order: &OrderModel,
        record: shipment::ActiveModel,
    ) -> Result<ShipmentModel, ServiceError> {
        let txn = self.db.begin().await?;
        let shipment = record.insert(&txn).await?;
        Order::update_many()
            .set(order::ActiveModel {
                status: Set(OrderStatus::ShipmentCreated),
                shipment_claimed_at: Set(None),
                issued_shipment: Set(None),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order.id))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(shipment)
    }

    async fn enqueue_shipment_retry(
        &self,
        order_number: &str,
        err: &ServiceError,
        issued: Option<&CarrierShipment>,
    ) {
        let payload = ShipmentJobPayload {
            order_number: order_number.to_string(),
            issued: issued.cloned(),
        };
        let payload = match serde_json::to_value(&payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!(%order_number, error = %e, "failed to encode shipment retry payload");
                return;
            }
        };
        let job = NewRetryJob {
            dedupe_key: shipment_dedupe_key(order_number),
            job_type: SHIPMENT_JOB_TYPE.to_string(),
            payload,
            max_attempts: self.config.retry_queue.max_attempts,
            last_error: Some(err.to_string()),
            run_at: Utc::now(),
        };
        if let Err(e) = self.retry_jobs.enqueue(job).await {
            error!(%order_number, error = %e, "failed to queue shipment retry");
        }
    }

    async fn clear_cart_best_effort(&self, cart_id: Uuid) {
        if let Err(e) = self.carts.clear_cart(cart_id).await {
            warn!(%cart_id, error = %e, "failed to clear cart after shipment");
        }
    }
}

struct OrderDraft<'a> {
    owner: &'a CartOwner,
    cart_id: Uuid,
    method: PaymentMethod,
    total_amount: i64,
    product_count: i32,
    product_ids: serde_json::Value,
    line_items: serde_json::Value,
}

/// Bounds an external call; elapsing is reported as a retryable timeout.
async fn with_timeout<F, T>(limit: Duration, what: &str, fut: F) -> Result<T, ServiceError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ServiceError::Timeout(what.to_string()))
}

