use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::{Condition, Expr};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::entities::coupon::{self, CouponType};
use crate::entities::order::{self, OrderStatus};
use crate::entities::coupon_usage;
use crate::errors::ServiceError;
use crate::services::orders::compute_total;
use crate::services::payments::{summarize, transactions_for};
use crate::services::records::{find_order, find_order_lines, save_order};

/// Why a coupon cannot be used. Rendered into `ServiceError::CouponInvalid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CouponRejection {
    Inactive,
    NotStarted,
    Expired,
    UsageLimitReached,
    CustomerLimitReached,
    BelowMinimum { minimum: Decimal },
    NotApplicable,
    Unknown(String),
}

impl fmt::Display for CouponRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "coupon is not active"),
            Self::NotStarted => write!(f, "coupon is not valid yet"),
            Self::Expired => write!(f, "coupon has expired"),
            Self::UsageLimitReached => write!(f, "coupon usage limit reached"),
            Self::CustomerLimitReached => write!(f, "customer has already used this coupon"),
            Self::BelowMinimum { minimum } => {
                write!(f, "order subtotal is below the minimum of {}", minimum)
            }
            Self::NotApplicable => write!(f, "coupon does not apply to any product in the order"),
            Self::Unknown(code) => write!(f, "unknown coupon code {}", code),
        }
    }
}

impl From<CouponRejection> for ServiceError {
    fn from(rejection: CouponRejection) -> Self {
        ServiceError::CouponInvalid(rejection.to_string())
    }
}

/// Facts about the order a coupon is evaluated against.
#[derive(Debug, Clone)]
pub struct CouponContext<'a> {
    pub subtotal: Decimal,
    pub shipping_fee: Decimal,
    pub product_ids: &'a [Uuid],
    /// Net uses of this coupon by the same customer so far.
    pub customer_usage: i32,
    pub now: DateTime<Utc>,
}

/// Validates in a fixed order and returns the discount, clamped to the subtotal.
pub fn evaluate_coupon(
    coupon: &coupon::Model,
    ctx: &CouponContext<'_>,
) -> Result<Decimal, CouponRejection> {
    if !coupon.is_active {
        return Err(CouponRejection::Inactive);
    }
    if coupon.starts_at.map_or(false, |start| ctx.now < start) {
        return Err(CouponRejection::NotStarted);
    }
    if coupon.ends_at.map_or(false, |end| ctx.now > end) {
        return Err(CouponRejection::Expired);
    }
    if coupon
        .usage_limit
        .map_or(false, |limit| coupon.usage_count >= limit)
    {
        return Err(CouponRejection::UsageLimitReached);
    }
    if coupon
        .per_customer_limit
        .map_or(false, |limit| ctx.customer_usage >= limit)
    {
        return Err(CouponRejection::CustomerLimitReached);
    }
    if ctx.subtotal < coupon.min_order_value {
        return Err(CouponRejection::BelowMinimum {
            minimum: coupon.min_order_value,
        });
    }
    let applicable = coupon.applicable_product_ids();
    if !applicable.is_empty() && !ctx.product_ids.iter().any(|id| applicable.contains(id)) {
        return Err(CouponRejection::NotApplicable);
    }

    let discount = match coupon.coupon_type {
        CouponType::Percentage => {
            let raw = (ctx.subtotal * coupon.value / Decimal::ONE_HUNDRED).round_dp(2);
            match coupon.max_discount {
                Some(cap) => raw.min(cap),
                None => raw,
            }
        }
        CouponType::Fixed => coupon.value,
        CouponType::FreeShipping => ctx.shipping_fee,
    };

    Ok(discount.max(Decimal::ZERO).min(ctx.subtotal))
}

pub async fn find_coupon_by_code<C: ConnectionTrait>(
    conn: &C,
    tenant_id: Uuid,
    code: &str,
) -> Result<coupon::Model, ServiceError> {
    coupon::Entity::find()
        .filter(coupon::Column::TenantId.eq(tenant_id))
        .filter(coupon::Column::Code.eq(code))
        .one(conn)
        .await?
        .ok_or_else(|| CouponRejection::Unknown(code.to_string()).into())
}

/// Net uses by one customer, keyed by customer id or, for guests, by phone.
pub async fn customer_usage<C: ConnectionTrait>(
    conn: &C,
    coupon_id: Uuid,
    customer_id: Option<Uuid>,
    customer_phone: Option<&str>,
) -> Result<i32, ServiceError> {
    let mut query = coupon_usage::Entity::find().filter(coupon_usage::Column::CouponId.eq(coupon_id));
    query = match (customer_id, customer_phone) {
        (Some(id), _) => query.filter(coupon_usage::Column::CustomerId.eq(id)),
        (None, Some(phone)) => query.filter(coupon_usage::Column::CustomerPhone.eq(phone)),
        (None, None) => return Ok(0),
    };
    Ok(query.all(conn).await?.iter().map(|u| u.delta).sum())
}

pub async fn order_usage<C: ConnectionTrait>(
    conn: &C,
    coupon_id: Uuid,
    order_id: Uuid,
) -> Result<i32, ServiceError> {
    Ok(coupon_usage::Entity::find()
        .filter(coupon_usage::Column::CouponId.eq(coupon_id))
        .filter(coupon_usage::Column::OrderId.eq(order_id))
        .all(conn)
        .await?
        .iter()
        .map(|u| u.delta)
        .sum())
}

async fn append_usage<C: ConnectionTrait>(
    conn: &C,
    coupon_id: Uuid,
    order: &UsageOwner<'_>,
    delta: i32,
) -> Result<(), ServiceError> {
    coupon_usage::ActiveModel {
        id: Set(Uuid::new_v4()),
        coupon_id: Set(coupon_id),
        order_id: Set(order.order_id),
        customer_id: Set(order.customer_id),
        customer_phone: Set(order.customer_phone.map(str::to_string)),
        delta: Set(delta),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;
    Ok(())
}

/// Who takes a coupon use.
#[derive(Debug, Clone, Copy)]
pub struct UsageOwner<'a> {
    pub order_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub customer_phone: Option<&'a str>,
}

/// Takes one use. The counter increment is conditional on the limit, so two
/// orders racing for the last use cannot both win. `enforce_limit = false` is
/// for coupons carried from an order that still holds its own use.
pub async fn claim_coupon<C: ConnectionTrait>(
    conn: &C,
    coupon_id: Uuid,
    owner: UsageOwner<'_>,
    enforce_limit: bool,
) -> Result<(), ServiceError> {
    if order_usage(conn, coupon_id, owner.order_id).await? > 0 {
        return Ok(());
    }

    let mut update = coupon::Entity::update_many()
        .col_expr(
            coupon::Column::UsageCount,
            Expr::col(coupon::Column::UsageCount).add(1),
        )
        .filter(coupon::Column::Id.eq(coupon_id));
    if enforce_limit {
        update = update.filter(
            Condition::any()
                .add(coupon::Column::UsageLimit.is_null())
                .add(Expr::col(coupon::Column::UsageCount).lt(Expr::col(coupon::Column::UsageLimit))),
        );
    }

    let result = update.exec(conn).await?;
    if result.rows_affected == 0 {
        return Err(CouponRejection::UsageLimitReached.into());
    }

    append_usage(conn, coupon_id, &owner, 1).await
}

/// Gives back the order's use. Replays release nothing.
pub async fn release_coupon<C: ConnectionTrait>(
    conn: &C,
    coupon_id: Uuid,
    owner: UsageOwner<'_>,
) -> Result<bool, ServiceError> {
    if order_usage(conn, coupon_id, owner.order_id).await? <= 0 {
        return Ok(false);
    }

    coupon::Entity::update_many()
        .col_expr(
            coupon::Column::UsageCount,
            Expr::col(coupon::Column::UsageCount).sub(1),
        )
        .filter(coupon::Column::Id.eq(coupon_id))
        .filter(coupon::Column::UsageCount.gt(0))
        .exec(conn)
        .await?;

    append_usage(conn, coupon_id, &owner, -1).await?;
    Ok(true)
}

pub fn usage_owner(order: &order::Model) -> UsageOwner<'_> {
    UsageOwner {
        order_id: order.id,
        customer_id: order.customer_id,
        customer_phone: order.customer_phone.as_deref(),
    }
}

/// Coupon validation and the coupon usage ledger.
#[derive(Clone)]
pub struct PromotionService {
    db_pool: Arc<DatabaseConnection>,
}

impl PromotionService {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    /// Applies a coupon to an open or confirmed order and returns the discount.
    #[instrument(skip(self))]
    pub async fn apply_coupon(&self, order_id: Uuid, coupon_id: Uuid) -> Result<Decimal, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let order = find_order(&txn, order_id).await?;

        if !matches!(order.order_status, OrderStatus::Open | OrderStatus::Confirmed) {
            return Err(ServiceError::InvalidOperation(format!(
                "coupons cannot be applied to a {} order",
                order.order_status
            )));
        }
        match order.coupon_id {
            Some(existing) if existing == coupon_id => return Ok(order.coupon_discount),
            Some(_) => {
                return Err(ServiceError::CouponInvalid(
                    "order already carries a coupon".to_string(),
                ))
            }
            None => {}
        }

        let coupon = coupon::Entity::find_by_id(coupon_id)
            .one(&txn)
            .await?
            .filter(|c| c.tenant_id == order.tenant_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Coupon {} not found", coupon_id)))?;

        let product_ids: Vec<Uuid> = find_order_lines(&txn, order_id)
            .await?
            .iter()
            .map(|l| l.product_id)
            .collect();
        let usage = customer_usage(
            &txn,
            coupon_id,
            order.customer_id,
            order.customer_phone.as_deref(),
        )
        .await?;

        let discount = evaluate_coupon(
            &coupon,
            &CouponContext {
                subtotal: order.subtotal,
                shipping_fee: order.shipping_fee,
                product_ids: &product_ids,
                customer_usage: usage,
                now: Utc::now(),
            },
        )?;

        claim_coupon(&txn, coupon_id, usage_owner(&order), true).await?;

        let total = compute_total(
            order.subtotal,
            order.discount,
            discount,
            order.points_discount,
            order.shipping_fee,
            order.shipping_payer,
        );
        let status = summarize(total, &transactions_for(&txn, order_id).await?).status;
        save_order(&txn, &order, |active| {
            active.coupon_id = Set(Some(coupon_id));
            active.coupon_discount = Set(discount);
            active.total_amount = Set(total);
            active.payment_status = Set(status);
        })
        .await?;
        txn.commit().await?;

        info!(%order_id, code = %coupon.code, %discount, "coupon applied");
        Ok(discount)
    }

    /// Cached counter next to the ledger sum; the two agree when nothing is in flight.
    pub async fn usage_counts(&self, coupon_id: Uuid) -> Result<(i32, i32), ServiceError> {
        let db = &*self.db_pool;
        let coupon = coupon::Entity::find_by_id(coupon_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Coupon {} not found", coupon_id)))?;
        let ledger: i32 = coupon_usage::Entity::find()
            .filter(coupon_usage::Column::CouponId.eq(coupon_id))
            .all(db)
            .await?
            .iter()
            .map(|u| u.delta)
            .sum();
        Ok((coupon.usage_count, ledger))
    }
}
