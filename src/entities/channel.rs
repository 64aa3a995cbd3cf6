use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sales channel: fixes currency and carries order-handling settings.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    #[sea_orm(unique)]
    pub slug: String,
    pub currency: String,
    pub default_country: String,
    pub automatically_confirm_all_new_orders: bool,
    /// Capture on checkout completion instead of only authorizing.
    pub capture_payments_on_checkout: bool,
    /// Capture an authorized payment when the order gets confirmed.
    pub automatically_capture_authorized_payments: bool,
    pub allow_unpaid_orders: bool,
    pub allocation_strategy: AllocationStrategy,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::channel_warehouse::Entity")]
    ChannelWarehouses,
}

impl Related<super::channel_warehouse::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ChannelWarehouses.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// How candidate warehouses are ordered when stock gets reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    #[sea_orm(string_value = "nearest_first")]
    NearestFirst,
    #[sea_orm(string_value = "highest_stock")]
    HighestStock,
}
