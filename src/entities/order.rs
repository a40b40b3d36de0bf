use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Commercial lifecycle of an order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "open")]
    Open,
    #[sea_orm(string_value = "confirmed")]
    Confirmed,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "returned")]
    Returned,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Returned)
    }

    /// Whether `self -> next` is one of the declared lifecycle edges.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Confirmed)
                | (Self::Confirmed, Self::Completed)
                | (Self::Open | Self::Confirmed, Self::Cancelled)
                | (Self::Confirmed | Self::Completed, Self::Returned)
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Confirmed => "Confirmed",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
            Self::Returned => "Returned",
        }
    }
}

/// Physical progress of the parcel.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ShippingStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "packing")]
    Packing,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "in_transit")]
    InTransit,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "returned_to_sender")]
    ReturnedToSender,
    #[sea_orm(string_value = "delivery_failed")]
    DeliveryFailed,
}

impl ShippingStatus {
    /// Position on the forward path. Correction states sit outside it.
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Packing => Some(1),
            Self::Shipped => Some(2),
            Self::InTransit => Some(3),
            Self::Delivered => Some(4),
            Self::ReturnedToSender | Self::DeliveryFailed => None,
        }
    }

    pub fn is_correction(self) -> bool {
        matches!(self, Self::ReturnedToSender | Self::DeliveryFailed)
    }

    /// The parcel is with the carrier and not yet at its destination.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Shipped | Self::InTransit)
    }

    /// Forward-only progression. Correction states are reachable from any
    /// in-flight state; leaving one requires a manual correction.
    pub fn can_advance_to(self, next: ShippingStatus, manual_correction: bool) -> bool {
        if self == next {
            return false;
        }
        match (self, next) {
            (Self::DeliveryFailed, Self::ReturnedToSender) => true,
            (Self::DeliveryFailed | Self::ReturnedToSender, _) => manual_correction,
            (Self::Delivered, _) => false,
            (_, Self::DeliveryFailed | Self::ReturnedToSender) => self.is_in_flight(),
            (current, next) => match (current.rank(), next.rank()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Packing => "Packing",
            Self::Shipped => "Shipped",
            Self::InTransit => "In transit",
            Self::Delivered => "Delivered",
            Self::ReturnedToSender => "Returned to sender",
            Self::DeliveryFailed => "Delivery failed",
        }
    }
}

/// Derived from the payment ledger; never set directly by users.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "unpaid")]
    Unpaid,
    #[sea_orm(string_value = "partial")]
    Partial,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl PaymentStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Unpaid => "Unpaid",
            Self::Partial => "Partially paid",
            Self::Paid => "Paid",
            Self::Refunded => "Refunded",
        }
    }
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
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderSource {
    #[sea_orm(string_value = "manual")]
    Manual,
    #[sea_orm(string_value = "import")]
    Import,
    #[sea_orm(string_value = "merge_result")]
    MergeResult,
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
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ShippingPayer {
    #[sea_orm(string_value = "customer")]
    Customer,
    #[sea_orm(string_value = "shop")]
    Shop,
}

/// The `orders` table.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Unique per tenant, `ORD-YYYYMMDD-NNNN`.
    pub order_number: String,
    pub order_status: OrderStatus,
    pub shipping_status: ShippingStatus,
    pub payment_status: PaymentStatus,
    pub source: OrderSource,
    /// Fixed at creation. Imported orders never touch the inventory ledger.
    pub deducts_stock: bool,
    pub customer_id: Option<Uuid>,
    pub customer_phone: Option<String>,
    pub recipient_name: Option<String>,
    pub warehouse_id: Uuid,
    pub province_id: Option<i32>,
    pub district_id: Option<i32>,
    pub ward_code: Option<String>,
    pub street: Option<String>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub coupon_discount: Decimal,
    pub points_discount: Decimal,
    pub shipping_fee: Decimal,
    pub shipping_payer: ShippingPayer,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub cod_enabled: bool,
    pub cod_amount: Decimal,
    pub coupon_id: Option<Uuid>,
    pub points_used: i32,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_line::Entity")]
    OrderLine,
}

impl Related<super::order_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderLine.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
