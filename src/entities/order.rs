use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Order aggregate root. Totals are only ever written by recalculation.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub number: i64,
    pub status: OrderStatus,
    pub origin: OrderOrigin,
    #[sea_orm(nullable)]
    pub original_id: Option<Uuid>,
    pub channel_id: Uuid,
    #[sea_orm(nullable, unique)]
    pub checkout_token: Option<Uuid>,
    #[sea_orm(nullable)]
    pub user_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub user_email: Option<String>,
    pub currency: String,
    #[sea_orm(column_type = "Json", nullable)]
    pub shipping_address: Option<Json>,
    #[sea_orm(column_type = "Json", nullable)]
    pub billing_address: Option<Json>,
    #[sea_orm(nullable)]
    pub shipping_method_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub shipping_method_name: Option<String>,
    #[sea_orm(nullable)]
    pub collection_point_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub collection_point_name: Option<String>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub base_shipping_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub shipping_price_net: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub shipping_price_gross: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub undiscounted_total_net: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub undiscounted_total_gross: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub subtotal_net: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub subtotal_gross: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total_net: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total_gross: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total_charged: Decimal,
    pub customer_note: String,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn is_fully_paid(&self) -> bool {
        self.total_charged >= self.total_gross
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_line::Entity")]
    Lines,
    #[sea_orm(has_many = "super::order_discount::Entity")]
    Discounts,
    #[sea_orm(has_many = "super::fulfillment::Entity")]
    Fulfillments,
}

impl Related<super::order_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lines.def()
    }
}

impl Related<super::order_discount::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Discounts.def()
    }
}

impl Related<super::fulfillment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Fulfillments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    Display,
    EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "draft")]
    Draft,
    #[sea_orm(string_value = "unconfirmed")]
    Unconfirmed,
    #[sea_orm(string_value = "unfulfilled")]
    Unfulfilled,
    #[sea_orm(string_value = "partially_fulfilled")]
    PartiallyFulfilled,
    #[sea_orm(string_value = "fulfilled")]
    Fulfilled,
    #[sea_orm(string_value = "partially_returned")]
    PartiallyReturned,
    #[sea_orm(string_value = "returned")]
    Returned,
    #[sea_orm(string_value = "canceled")]
    Canceled,
}

impl OrderStatus {
    /// Lines and discounts may still be edited.
    pub fn is_editable(self) -> bool {
        matches!(self, OrderStatus::Draft | OrderStatus::Unconfirmed)
    }

    /// Stock may be shipped against the order.
    pub fn is_fulfillable(self) -> bool {
        matches!(
            self,
            OrderStatus::Unfulfilled | OrderStatus::PartiallyFulfilled
        )
    }

    pub fn can_cancel(self) -> bool {
        !matches!(
            self,
            OrderStatus::Fulfilled
                | OrderStatus::Canceled
                | OrderStatus::Returned
                | OrderStatus::PartiallyReturned
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum OrderOrigin {
    #[sea_orm(string_value = "checkout")]
    Checkout,
    #[sea_orm(string_value = "draft")]
    Draft,
    #[sea_orm(string_value = "reissue")]
    Reissue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_names_round_trip_through_strum() {
        assert_eq!(OrderStatus::PartiallyFulfilled.to_string(), "partially_fulfilled");
        assert_eq!(
            OrderStatus::from_str("unconfirmed").unwrap(),
            OrderStatus::Unconfirmed
        );
    }

    #[test]
    fn terminal_statuses_cannot_be_canceled() {
        assert!(OrderStatus::Draft.can_cancel());
        assert!(OrderStatus::PartiallyFulfilled.can_cancel());
        assert!(!OrderStatus::Fulfilled.can_cancel());
        assert!(!OrderStatus::Canceled.can_cancel());
        assert!(!OrderStatus::Returned.can_cancel());
    }
}
