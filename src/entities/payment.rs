use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

/// A payment attempt attached to a checkout and, after completion, to its order.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub gateway: String,
    pub is_active: bool,
    /// Gateway asked for an out-of-band confirmation.
    pub to_confirm: bool,
    pub charge_status: ChargeStatus,
    pub token: String,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub captured_amount: Decimal,
    pub currency: String,
    #[sea_orm(nullable)]
    pub checkout_token: Option<Uuid>,
    #[sea_orm(nullable)]
    pub order_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub psp_reference: Option<String>,
    #[sea_orm(nullable)]
    pub billing_email: Option<String>,
    /// Bumped by every charge-status write; guards against blind overwrites.
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Model {
    pub fn remaining_capturable(&self) -> Decimal {
        (self.total - self.captured_amount).max(Decimal::ZERO)
    }

    pub fn can_capture(&self) -> bool {
        self.is_active
            && matches!(
                self.charge_status,
                ChargeStatus::NotCharged | ChargeStatus::PartiallyCharged
            )
    }

    pub fn can_void(&self) -> bool {
        self.is_active && self.charge_status == ChargeStatus::NotCharged
    }

    pub fn can_refund(&self) -> bool {
        self.is_active
            && matches!(
                self.charge_status,
                ChargeStatus::PartiallyCharged
                    | ChargeStatus::FullyCharged
                    | ChargeStatus::PartiallyRefunded
            )
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::payment_transaction::Entity")]
    Transactions,
}

impl Related<super::payment_transaction::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Transactions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum, Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChargeStatus {
    #[sea_orm(string_value = "not_charged")]
    NotCharged,
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "partially_charged")]
    PartiallyCharged,
    #[sea_orm(string_value = "fully_charged")]
    FullyCharged,
    #[sea_orm(string_value = "partially_refunded")]
    PartiallyRefunded,
    #[sea_orm(string_value = "fully_refunded")]
    FullyRefunded,
    #[sea_orm(string_value = "refused")]
    Refused,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}
