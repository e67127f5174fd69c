use super::common::success_response;
use crate::{errors::ServiceError, shipping::TrackingQuery, AppState};
use axum::{
    extract::{Query, State},
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;

pub fn shipments_routes() -> Router<AppState> {
    Router::new().route("/shipments/track", get(track_shipment))
}

#[derive(Debug, Deserialize)]
pub struct TrackParams {
    pub waybill: Option<String>,
    pub order_ref: Option<String>,
}

impl TrackParams {
    fn into_query(self) -> Result<TrackingQuery, ServiceError> {
        let non_empty =
            |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        match (non_empty(self.waybill), non_empty(self.order_ref)) {
            (Some(waybill), _) => Ok(TrackingQuery::Waybill(waybill)),
            (None, Some(order_ref)) => Ok(TrackingQuery::OrderRef(order_ref)),
            (None, None) => Err(ServiceError::ValidationError(
                "waybill or order_ref is required".to_string(),
            )),
        }
    }
}

async fn track_shipment(
    State(state): State<AppState>,
    Query(params): Query<TrackParams>,
) -> Result<Response, ServiceError> {
    let info = state
        .services
        .orders
        .track_shipment(params.into_query()?)
        .await?;
    Ok(success_response(info))
}
