use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

/// One gateway call under a payment. Written before the call, completed after it.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub payment_id: Uuid,
    pub kind: TransactionKind,
    pub is_success: bool,
    pub action_required: bool,
    #[sea_orm(column_type = "Json", nullable)]
    pub action_required_data: Option<Json>,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub amount: Decimal,
    pub currency: String,
    pub token: String,
    #[sea_orm(nullable)]
    pub error: Option<String>,
    pub already_processed: bool,
    #[sea_orm(column_type = "Json")]
    pub gateway_response: Json,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::payment::Entity",
        from = "Column::PaymentId",
        to = "super::payment::Column::Id",
        on_delete = "Cascade"
    )]
    Payment,
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payment.def()
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
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionKind {
    #[sea_orm(string_value = "external")]
    External,
    #[sea_orm(string_value = "auth")]
    Auth,
    #[sea_orm(string_value = "capture")]
    Capture,
    #[sea_orm(string_value = "capture_failed")]
    CaptureFailed,
    #[sea_orm(string_value = "action_to_confirm")]
    ActionToConfirm,
    #[sea_orm(string_value = "void")]
    Void,
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "refund")]
    Refund,
    #[sea_orm(string_value = "refund_ongoing")]
    RefundOngoing,
    #[sea_orm(string_value = "refund_failed")]
    RefundFailed,
    #[sea_orm(string_value = "refund_reversed")]
    RefundReversed,
    #[sea_orm(string_value = "confirm")]
    Confirm,
    #[sea_orm(string_value = "cancel")]
    Cancel,
}
