use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::payment_transaction::PaymentMethod;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReturnKind {
    #[sea_orm(string_value = "partial")]
    Partial,
    #[sea_orm(string_value = "full")]
    Full,
    #[sea_orm(string_value = "exchange")]
    Exchange,
}

/// The `returns` table. `code` is the idempotency key of a return event.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "returns")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    pub code: String,
    pub kind: ReturnKind,
    pub reason: Option<String>,
    pub refund_method: PaymentMethod,
    pub total_refund: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::return_line::Entity")]
    ReturnLine,
}

impl Related<super::return_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ReturnLine.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
