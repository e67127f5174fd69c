//! Carrier collaborator: payload rules, the HTTP client and tracking.
//!
//! The carrier treats every create call as a new shipment, so callers must
//! check for an existing shipment before invoking [`CarrierClient::create_shipment`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::weight::PackageSelection;
use crate::config::CarrierConfig;
use crate::entities::{AddressModel, OrderModel};
use crate::errors::ServiceError;

/// Longest order reference the carrier accepts.
pub const MAX_ORDER_REF_LEN: usize = 45;
const MAX_DESCRIBED_ITEMS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consignee {
    pub name: String,
    /// Last 10 digits of the recorded phone number
    pub phone: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub pincode: String,
    pub country: String,
}

impl Consignee {
    pub fn from_address(address: &AddressModel) -> Self {
        let street = match address.line2.as_deref().map(str::trim) {
            Some(line2) if !line2.is_empty() => format!("{}, {}", address.line1.trim(), line2),
            _ => address.line1.trim().to_string(),
        };
        Self {
            name: address.name.trim().to_string(),
            phone: sanitize_phone(&address.phone),
            address: street,
            city: address.city.clone(),
            state: address.state.clone(),
            pincode: address.pincode.trim().to_string(),
            country: address.country.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMode {
    Prepaid,
    #[serde(rename = "COD")]
    Cod,
}

impl PaymentMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMode::Prepaid => "Prepaid",
            PaymentMode::Cod => "COD",
        }
    }
}

/// One packed line, taken from the cart (or the order snapshot once the cart is gone).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentLine {
    pub product_name: String,
    pub size: String,
    pub quantity: i32,
}

/// Shipment-create payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentRequest {
    /// Sent as the carrier's `order` field and used for later lookups
    pub order_ref: String,
    pub consignee: Consignee,
    pub payment_mode: PaymentMode,
    pub cod_amount: i64,
    pub total_amount: i64,
    pub weight_grams: i32,
    pub length_cm: i32,
    pub breadth_cm: i32,
    pub height_cm: i32,
    pub products_description: String,
    pub quantity: i32,
    pub pickup_location: String,
    pub seller_name: String,
}

/// Carrier acknowledgement of a created shipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarrierShipment {
    pub waybill: String,
    pub order_ref: String,
    pub status: String,
    pub sort_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "by", content = "value")]
pub enum TrackingQuery {
    Waybill(String),
    OrderRef(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingInfo {
    pub status: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub expected_delivery: Option<String>,
}

#[derive(Debug, Error)]
pub enum CarrierError {
    #[error("carrier call timed out")]
    Timeout,
    #[error("carrier returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("carrier transport error: {0}")]
    Transport(String),
    #[error("carrier response carried no waybill")]
    MissingWaybill,
    #[error("unexpected carrier response: {0}")]
    Decode(String),
}

impl From<CarrierError> for ServiceError {
    fn from(err: CarrierError) -> Self {
        match err {
            CarrierError::Timeout => ServiceError::Timeout("carrier".to_string()),
            other => ServiceError::ExternalServiceError(other.to_string()),
        }
    }
}

#[async_trait]
pub trait CarrierClient: Send + Sync {
    async fn create_shipment(
        &self,
        request: &ShipmentRequest,
    ) -> Result<CarrierShipment, CarrierError>;

    async fn track(&self, query: &TrackingQuery) -> Result<TrackingInfo, CarrierError>;
}

/// Keeps ASCII alphanumerics, `-` and `_`, capped at [`MAX_ORDER_REF_LEN`].
/// Deterministic, so the same order always maps to the same reference.
pub fn sanitize_order_ref(order_number: &str) -> String {
    order_number
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_ORDER_REF_LEN)
        .collect()
}

/// Strips formatting and country prefixes, keeping the last 10 digits.
pub fn sanitize_phone(raw: &str) -> String {
    let digits: Vec<char> = raw.chars().filter(char::is_ascii_digit).collect();
    let start = digits.len().saturating_sub(10);
    digits[start..].iter().collect()
}

/// `"name size xQty"` fragments for the first ten lines, comma separated.
pub fn describe_items(lines: &[ShipmentLine]) -> String {
    lines
        .iter()
        .take(MAX_DESCRIBED_ITEMS)
        .map(|line| format!("{} {} x{}", line.product_name.trim(), line.size.trim(), line.quantity))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn build_shipment_request(
    order: &OrderModel,
    order_ref: &str,
    address: &AddressModel,
    lines: &[ShipmentLine],
    package: &PackageSelection,
    config: &CarrierConfig,
) -> ShipmentRequest {
    let payment_mode = if order.is_cod() {
        PaymentMode::Cod
    } else {
        PaymentMode::Prepaid
    };
    ShipmentRequest {
        order_ref: order_ref.to_string(),
        consignee: Consignee::from_address(address),
        payment_mode,
        cod_amount: match payment_mode {
            PaymentMode::Cod => order.total_amount,
            PaymentMode::Prepaid => 0,
        },
        total_amount: order.total_amount,
        weight_grams: package.shipped_grams,
        length_cm: package.dimensions.length_cm,
        breadth_cm: package.dimensions.breadth_cm,
        height_cm: package.dimensions.height_cm,
        products_description: describe_items(lines),
        quantity: lines.iter().map(|l| l.quantity.max(0)).sum(),
        pickup_location: config.pickup_location.clone(),
        seller_name: config.seller_name.clone(),
    }
}

#[derive(Debug, Deserialize)]
struct CreateShipmentResponse {
    #[serde(default)]
    waybill: Option<String>,
    #[serde(default)]
    order_ref: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    sort_code: Option<String>,
}

/// Token-authenticated JSON client for the carrier API.
#[derive(Clone)]
pub struct HttpCarrierClient {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl HttpCarrierClient {
    pub fn new(config: &CarrierConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("carrier http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, CarrierError> {
        let response = request
            .header("Authorization", format!("Token {}", self.api_token))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CarrierError::Timeout
                } else {
                    CarrierError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "carrier call rejected");
            Err(CarrierError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl CarrierClient for HttpCarrierClient {
    #[instrument(skip(self, request), fields(order_ref = %request.order_ref))]
    async fn create_shipment(
        &self,
        request: &ShipmentRequest,
    ) -> Result<CarrierShipment, CarrierError> {
        let response = self
            .send(
                self.client
                    .post(format!("{}/api/shipments", self.base_url))
                    .json(request),
            )
            .await?;

        let body: CreateShipmentResponse = response
            .json()
            .await
            .map_err(|e| CarrierError::Decode(e.to_string()))?;

        let waybill = body
            .waybill
            .filter(|w| !w.trim().is_empty())
            .ok_or(CarrierError::MissingWaybill)?;
        debug!(%waybill, "carrier issued waybill");

        Ok(CarrierShipment {
            waybill,
            order_ref: body.order_ref.unwrap_or_else(|| request.order_ref.clone()),
            status: body.status.unwrap_or_else(|| "manifested".to_string()),
            sort_code: body.sort_code,
        })
    }

    #[instrument(skip(self))]
    async fn track(&self, query: &TrackingQuery) -> Result<TrackingInfo, CarrierError> {
        let params = match query {
            TrackingQuery::Waybill(waybill) => [("waybill", waybill.as_str())],
            TrackingQuery::OrderRef(order_ref) => [("order_ref", order_ref.as_str())],
        };
        let response = self
            .send(
                self.client
                    .get(format!("{}/api/shipments/track", self.base_url))
                    .query(&params),
            )
            .await?;

        response
            .json()
            .await
            .map_err(|e| CarrierError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::order::{OrderStatus, PaymentMethod};
    use crate::shipping::weight::{select_package, PackageTier};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn address() -> AddressModel {
        AddressModel {
            id: Uuid::new_v4(),
            user_id: None,
            session_id: Some("sess".into()),
            name: " Asha Rao ".into(),
            phone: "+91 98765-43210".into(),
            email: None,
            line1: "12 MG Road".into(),
            line2: Some("Flat 4".into()),
            city: "Pune".into(),
            state: "MH".into(),
            pincode: "411001".into(),
            country: "India".into(),
            is_default: true,
            created_at: Utc::now(),
        }
    }

    fn order(method: PaymentMethod) -> OrderModel {
        OrderModel {
            id: Uuid::new_v4(),
            order_number: "2026101900001".into(),
            user_id: None,
            session_id: Some("sess".into()),
            cart_id: Uuid::new_v4(),
            status: OrderStatus::Paid,
            payment_method: method,
            total_amount: 918,
            currency: "INR".into(),
            product_ids: serde_json::json!([]),
            product_count: 2,
            line_items: serde_json::json!([]),
            carrier_order_ref: None,
            gateway_order_id: None,
            gateway_payment_id: None,
            shipment_claimed_at: None,
            issued_shipment: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn line(name: &str, qty: i32) -> ShipmentLine {
        ShipmentLine {
            product_name: name.into(),
            size: "227gm".into(),
            quantity: qty,
        }
    }

    #[test]
    fn order_ref_is_stable_and_bounded() {
        assert_eq!(sanitize_order_ref("2026101900001"), "2026101900001");
        assert_eq!(sanitize_order_ref("ORD #12/34 é"), "ORD1234");
        let long = "x".repeat(80);
        assert_eq!(sanitize_order_ref(&long).len(), MAX_ORDER_REF_LEN);
        assert_eq!(sanitize_order_ref(&long), sanitize_order_ref(&long));
    }

    #[test]
    fn phone_keeps_last_ten_digits() {
        assert_eq!(sanitize_phone("+91 98765-43210"), "9876543210");
        assert_eq!(sanitize_phone("098765 43210"), "9876543210");
        assert_eq!(sanitize_phone("12345"), "12345");
    }

    #[test]
    fn description_lists_at_most_ten_items() {
        let lines: Vec<_> = (0..12).map(|i| line(&format!("Tea {}", i), 1)).collect();
        let description = describe_items(&lines);
        assert_eq!(description.matches(", ").count(), 9);
        assert!(description.starts_with("Tea 0 227gm x1"));
        assert!(!description.contains("Tea 10"));
    }

    #[test]
    fn cod_orders_carry_collectable_amount() {
        let package = select_package(Decimal::from(227));
        let config = CarrierConfig::default();
        let cod = build_shipment_request(
            &order(PaymentMethod::Cod),
            "2026101900001",
            &address(),
            &[line("Tea", 1)],
            &package,
            &config,
        );
        assert_eq!(cod.payment_mode, PaymentMode::Cod);
        assert_eq!(cod.cod_amount, 918);
        assert_eq!(cod.weight_grams, 280);
        assert_eq!(cod.length_cm, PackageTier::P1.dimensions().length_cm);
        assert_eq!(cod.consignee.phone, "9876543210");
        assert_eq!(cod.consignee.address, "12 MG Road, Flat 4");

        let prepaid = build_shipment_request(
            &order(PaymentMethod::Online),
            "2026101900001",
            &address(),
            &[line("Tea", 2)],
            &package,
            &config,
        );
        assert_eq!(prepaid.payment_mode, PaymentMode::Prepaid);
        assert_eq!(prepaid.cod_amount, 0);
        assert_eq!(prepaid.quantity, 2);
        assert_eq!(
            serde_json::to_value(PaymentMode::Cod).unwrap(),
            serde_json::json!("COD")
        );
    }

    fn request() -> ShipmentRequest {
        build_shipment_request(
            &order(PaymentMethod::Online),
            "2026101900001",
            &address(),
            &[line("Tea", 1)],
            &select_package(Decimal::from(227)),
            &CarrierConfig::default(),
        )
    }

    fn client(base_url: String) -> HttpCarrierClient {
        HttpCarrierClient::new(&CarrierConfig {
            base_url,
            api_token: "tok".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn create_shipment_returns_waybill() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/shipments"))
            .and(header("Authorization", "Token tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "waybill": "WB123",
                "order_ref": "2026101900001",
                "status": "manifested",
                "sort_code": "PNQ/A"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let shipment = client(server.uri()).create_shipment(&request()).await.unwrap();
        assert_eq!(shipment.waybill, "WB123");
        assert_eq!(shipment.sort_code.as_deref(), Some("PNQ/A"));
    }

    #[tokio::test]
    async fn missing_waybill_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "error", "waybill": ""})),
            )
            .mount(&server)
            .await;

        let err = client(server.uri()).create_shipment(&request()).await.unwrap_err();
        assert!(matches!(err, CarrierError::MissingWaybill));
    }

    #[tokio::test]
    async fn tracks_by_order_ref() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/shipments/track"))
            .and(query_param("order_ref", "2026101900001"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "in_transit",
                "location": "Pune hub",
                "expected_delivery": "2026-10-22"
            })))
            .mount(&server)
            .await;

        let info = client(server.uri())
            .track(&TrackingQuery::OrderRef("2026101900001".into()))
            .await
            .unwrap();
        assert_eq!(info.status, "in_transit");
        assert_eq!(info.location.as_deref(), Some("Pune hub"));
    }
}
