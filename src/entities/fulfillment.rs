use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "fulfillments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    /// Per-order sequence number, starting at 1.
    pub fulfillment_order: i32,
    pub status: FulfillmentStatus,
    #[sea_orm(nullable)]
    pub warehouse_id: Option<Uuid>,
    pub tracking_number: String,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))", nullable)]
    pub shipping_refund_amount: Option<Decimal>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))", nullable)]
    pub total_refund_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
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
    #[sea_orm(has_many = "super::fulfillment_line::Entity")]
    Lines,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl Related<super::fulfillment_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lines.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum, Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FulfillmentStatus {
    #[sea_orm(string_value = "fulfilled")]
    Fulfilled,
    #[sea_orm(string_value = "refunded")]
    Refunded,
    #[sea_orm(string_value = "returned")]
    Returned,
    #[sea_orm(string_value = "refunded_and_returned")]
    RefundedAndReturned,
    #[sea_orm(string_value = "replaced")]
    Replaced,
    #[sea_orm(string_value = "canceled")]
    Canceled,
    #[sea_orm(string_value = "waiting_for_approval")]
    WaitingForApproval,
}

impl FulfillmentStatus {
    /// Lines of these fulfillments count as shipped to the customer.
    pub fn is_shipped(self) -> bool {
        matches!(self, FulfillmentStatus::Fulfilled)
    }

    /// Fulfillments that moved goods back or money back.
    pub fn is_return_or_refund(self) -> bool {
        matches!(
            self,
            FulfillmentStatus::Refunded
                | FulfillmentStatus::Returned
                | FulfillmentStatus::RefundedAndReturned
                | FulfillmentStatus::Replaced
        )
    }
}
