use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order header. `order_number` is unique and immutable once assigned.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_number: String,
    #[sea_orm(nullable)]
    pub user_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub session_id: Option<String>,
    pub cart_id: Uuid,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub total_amount: i64,
    pub currency: String,
    /// Distinct product ids, in cart order
    pub product_ids: Json,
    pub product_count: i32,
    /// Snapshot of the cart lines at creation time
    pub line_items: Json,
    #[sea_orm(nullable)]
    pub carrier_order_ref: Option<String>,
    #[sea_orm(nullable)]
    pub gateway_order_id: Option<String>,
    #[sea_orm(nullable)]
    pub gateway_payment_id: Option<String>,
    /// Set while a shipment attempt holds the order
    #[sea_orm(nullable)]
    pub shipment_claimed_at: Option<DateTime<Utc>>,
    /// Carrier acknowledgement kept when the shipment row could not be written
    #[sea_orm(nullable)]
    pub issued_shipment: Option<Json>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Decodes the line snapshot; a corrupt snapshot reads as empty.
    pub fn lines(&self) -> Vec<OrderLine> {
        serde_json::from_value(self.line_items.clone()).unwrap_or_default()
    }

    pub fn is_cod(&self) -> bool {
        self.payment_method == PaymentMethod::Cod
    }
}

/// One cart line frozen onto the order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: Uuid,
    pub product_name: String,
    pub size: String,
    pub quantity: i32,
    pub unit_price: i64,
    pub line_total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "created")]
    Created,
    #[sea_orm(string_value = "pending_payment")]
    PendingPayment,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "cod_confirmed")]
    CodConfirmed,
    #[sea_orm(string_value = "payment_failed")]
    PaymentFailed,
    #[sea_orm(string_value = "shipment_creating")]
    ShipmentCreating,
    #[sea_orm(string_value = "shipment_created")]
    ShipmentCreated,
}

impl OrderStatus {
    /// Payment settled (online) or confirmed (COD); shipping may start.
    pub fn is_shippable(self) -> bool {
        matches!(
            self,
            Self::Paid | Self::CodConfirmed | Self::ShipmentCreating | Self::ShipmentCreated
        )
    }

    /// Payment may still be initiated, verified or switched to COD.
    pub fn accepts_payment(self) -> bool {
        matches!(self, Self::Created | Self::PendingPayment | Self::PaymentFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "online")]
    Online,
    #[sea_orm(string_value = "cod")]
    Cod,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_one = "super::payment::Entity")]
    Payment,
    #[sea_orm(has_one = "super::shipment::Entity")]
    Shipment,
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payment.def()
    }
}

impl Related<super::shipment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Shipment.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
