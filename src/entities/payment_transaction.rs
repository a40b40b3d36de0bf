use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

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
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(24))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "cash")]
    Cash,
    #[sea_orm(string_value = "bank_transfer")]
    BankTransfer,
    #[sea_orm(string_value = "card")]
    Card,
    #[sea_orm(string_value = "ewallet")]
    Ewallet,
    #[sea_orm(string_value = "cod")]
    Cod,
    #[sea_orm(string_value = "exchange_credit")]
    ExchangeCredit,
}

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
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(24))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionKind {
    /// Money collected from the customer.
    #[sea_orm(string_value = "payment")]
    Payment,
    /// Remainder collected automatically when an order completes.
    #[sea_orm(string_value = "completion")]
    Completion,
    /// Money paid back to the customer (negative amount).
    #[sea_orm(string_value = "refund")]
    Refund,
    /// Return value carried into a replacement order.
    #[sea_orm(string_value = "exchange_credit")]
    ExchangeCredit,
    /// Balance moved between orders by a merge (paired in/out entries).
    #[sea_orm(string_value = "merge_transfer")]
    MergeTransfer,
}

/// Immutable, append-only. The sum of `amount` per order equals `orders.paid_amount`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    pub receipt_number: String,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub kind: TransactionKind,
    pub note: Option<String>,
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
