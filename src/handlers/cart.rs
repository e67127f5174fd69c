use super::common::{no_content_response, success_response, Owner};
use crate::{
    errors::ServiceError,
    services::cart::{AddItemInput, RemoveItemInput},
    AppState,
};
use axum::{
    extract::{Json, State},
    response::Response,
    routing::{get, post},
    Router,
};
use serde_json::json;

/// Creates the router for cart endpoints
pub fn cart_routes() -> Router<AppState> {
    Router::new()
        .route("/cart", get(get_cart).delete(clear_cart))
        .route("/cart/items", post(add_item).delete(remove_item))
}

/// Current cart with items; an owner without a cart gets an empty one.
async fn get_cart(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<Response, ServiceError> {
    match state.services.cart.get_cart(&owner).await? {
        Some(cart) => Ok(success_response(cart)),
        None => {
            let cart = state.services.cart.get_or_create_cart(&owner).await?;
            Ok(success_response(json!({
                "id": cart.id,
                "product_count": cart.product_count,
                "total_price": cart.total_price,
                "items": [],
            })))
        }
    }
}

async fn add_item(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(payload): Json<AddItemInput>,
) -> Result<Response, ServiceError> {
    let cart = state.services.cart.add_item(&owner, payload).await?;
    Ok(success_response(cart))
}

async fn remove_item(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(payload): Json<RemoveItemInput>,
) -> Result<Response, ServiceError> {
    let cart = state.services.cart.remove_item(&owner, payload).await?;
    Ok(success_response(cart))
}

async fn clear_cart(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<Response, ServiceError> {
    if let Some(cart) = state.services.cart.get_cart(&owner).await? {
        state.services.cart.clear_cart(cart.cart.id).await?;
    }
    Ok(no_content_response())
}
