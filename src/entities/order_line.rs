use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order_discount::DiscountValueType;

/// Snapshot of a purchased variant. Catalog changes never reach existing lines.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_lines")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    #[sea_orm(nullable)]
    pub variant_id: Option<Uuid>,
    pub product_name: String,
    pub variant_name: String,
    pub product_sku: String,
    pub quantity: i32,
    pub quantity_fulfilled: i32,
    pub is_shipping_required: bool,
    pub is_gift_card: bool,
    pub currency: String,
    /// Catalog price at the time the line was added (net).
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub base_unit_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub undiscounted_unit_price_net: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub undiscounted_unit_price_gross: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub unit_price_net: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub unit_price_gross: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total_price_net: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total_price_gross: Decimal,
    #[sea_orm(nullable)]
    pub unit_discount_type: Option<DiscountValueType>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub unit_discount_value: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub unit_discount_amount: Decimal,
    #[sea_orm(nullable)]
    pub unit_discount_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Model {
    pub fn quantity_unfulfilled(&self) -> i32 {
        self.quantity - self.quantity_fulfilled
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id",
        on_delete = "Cascade"
    )]
    Order,
    #[sea_orm(has_many = "super::allocation::Entity")]
    Allocations,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl Related<super::allocation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Allocations.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
