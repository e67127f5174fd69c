use super::common::{created_response, success_response, validate_input, Owner};
use crate::{
    errors::ServiceError,
    services::orders::{CreateOrderInput, VerifyPaymentInput},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::Response,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use validator::Validate;

/// Creates the router for checkout, payment and shipment endpoints
pub fn orders_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/:order_number", get(get_order))
        .route(
            "/orders/:order_number/payment/initiate",
            post(initiate_payment),
        )
        .route("/orders/:order_number/payment/verify", post(verify_payment))
        .route("/orders/:order_number/payment/cod", post(confirm_cod))
        .route("/orders/:order_number/payment/failure", post(payment_failure))
        .route("/orders/:order_number/shipment", post(create_shipment))
}

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyPaymentRequest {
    #[validate(length(min = 1))]
    pub gateway_order_id: String,
    #[validate(length(min = 1))]
    pub gateway_payment_id: String,
    #[validate(length(min = 1))]
    pub signature: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PaymentFailureRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

/// Converts the caller's cart into an order. The body is optional.
async fn create_order(
    State(state): State<AppState>,
    Owner(owner): Owner,
    payload: Option<Json<CreateOrderInput>>,
) -> Result<Response, ServiceError> {
    let input = payload.map(|Json(input)| input).unwrap_or_default();
    let order = state.services.orders.create_order(&owner, input).await?;
    Ok(created_response(order))
}

async fn get_order(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> Result<Response, ServiceError> {
    let order = state.services.orders.get_order(&order_number).await?;
    Ok(success_response(order))
}

async fn initiate_payment(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> Result<Response, ServiceError> {
    let initiation = state
        .services
        .orders
        .initiate_online_payment(&order_number)
        .await?;
    Ok(success_response(initiation))
}

async fn verify_payment(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
    Json(payload): Json<VerifyPaymentRequest>,
) -> Result<Response, ServiceError> {
    validate_input(&payload)?;
    let input = VerifyPaymentInput {
        gateway_order_id: payload.gateway_order_id,
        gateway_payment_id: payload.gateway_payment_id,
        signature: payload.signature,
    };
    let order = state
        .services
        .orders
        .verify_online_payment(&order_number, input)
        .await?;
    Ok(success_response(order))
}

async fn confirm_cod(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> Result<Response, ServiceError> {
    let order = state.services.orders.confirm_cod(&order_number).await?;
    Ok(success_response(order))
}

async fn payment_failure(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
    Json(payload): Json<PaymentFailureRequest>,
) -> Result<Response, ServiceError> {
    validate_input(&payload)?;
    let order = state
        .services
        .orders
        .record_payment_failure(&order_number, &payload.reason)
        .await?;
    Ok(success_response(order))
}

/// Idempotent: repeated calls return the same shipment.
async fn create_shipment(
    State(state): State<AppState>,
    Path(order_number): Path<String>,
) -> Result<Response, ServiceError> {
    let outcome = state.services.orders.create_shipment(&order_number).await?;
    if outcome.already_existed {
        Ok(success_response(outcome))
    } else {
        Ok(created_response(outcome))
    }
}
