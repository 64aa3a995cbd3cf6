use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "product_variants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub sku: String,
    pub name: String,
    pub product_name: String,
    pub track_inventory: bool,
    pub requires_shipping: bool,
    pub is_gift_card: bool,
    pub is_preorder: bool,
    #[sea_orm(nullable)]
    pub preorder_global_threshold: Option<i32>,
    pub preorder_global_sold_units: i32,
    #[sea_orm(nullable)]
    pub preorder_end_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Model {
    /// A preorder variant sells against thresholds instead of stock until its end date.
    pub fn is_preorder_active(&self, now: DateTime<Utc>) -> bool {
        self.is_preorder && self.preorder_end_date.map_or(true, |end| end > now)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::variant_channel_listing::Entity")]
    ChannelListings,
}

impl Related<super::variant_channel_listing::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ChannelListings.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
