use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "warehouses")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    pub country_code: String,
    pub city: String,
    pub click_and_collect: ClickAndCollectOption,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::stock::Entity")]
    Stocks,
    #[sea_orm(has_many = "super::channel_warehouse::Entity")]
    ChannelWarehouses,
}

impl Related<super::stock::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Stocks.def()
    }
}

impl Related<super::channel_warehouse::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ChannelWarehouses.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Whether customers may pick orders up at the warehouse.
///
/// `Local` only allows pickup of lines the warehouse itself stocks, `All`
/// accepts any line available anywhere in the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum ClickAndCollectOption {
    #[sea_orm(string_value = "disabled")]
    Disabled,
    #[sea_orm(string_value = "local")]
    Local,
    #[sea_orm(string_value = "all")]
    All,
}
