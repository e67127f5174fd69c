use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Carrier shipment. The unique `order_id` makes creation idempotent per order.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "shipments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_id: Uuid,
    pub order_number: String,
    pub carrier_order_ref: String,
    #[sea_orm(unique)]
    pub waybill: String,
    /// Consignee name, phone and address as sent to the carrier
    pub consignee: Json,
    pub payment_mode: String,
    pub cod_amount: i64,
    pub weight_grams: i32,
    pub package_tier: String,
    pub length_cm: i32,
    pub breadth_cm: i32,
    pub height_cm: i32,
    pub products_description: String,
    pub line_items: Json,
    #[sea_orm(nullable)]
    pub carrier_status: Option<String>,
    #[sea_orm(nullable)]
    pub sort_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
