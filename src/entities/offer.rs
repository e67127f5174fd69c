use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pricing::OfferTerms;

/// Quantity-gated percentage offer scoped to one product.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "offers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub product_id: Uuid,
    pub discount_percent: i32,
    pub min_quantity: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Model {
    pub fn terms(&self) -> OfferTerms {
        OfferTerms {
            offer_id: self.id,
            product_id: self.product_id,
            discount_percent: self.discount_percent,
            min_quantity: self.min_quantity,
            active: self.active,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::product::Entity",
        from = "Column::ProductId",
        to = "super::product::Column::Id"
    )]
    Product,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
