use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::LoyaltyConfig;
use crate::entities::order::OrderStatus;
use crate::entities::point_transaction::{self, PointKind};
use crate::entities::customer;
use crate::errors::ServiceError;
use crate::services::orders::compute_total;
use crate::services::payments::{summarize, transactions_for};
use crate::services::records::{find_order, save_order};

/// Points a customer may spend on one order: bounded by the balance and by the
/// subtotal left after the coupon.
pub fn max_redeemable(
    available: i32,
    subtotal: Decimal,
    coupon_discount: Decimal,
    point_value: Decimal,
) -> i32 {
    if available <= 0 || point_value <= Decimal::ZERO {
        return 0;
    }
    let spendable = (subtotal - coupon_discount).max(Decimal::ZERO);
    let by_amount = (spendable / point_value).floor().to_i32().unwrap_or(i32::MAX);
    available.min(by_amount)
}

/// Points earned for a completed order.
pub fn points_for(total: Decimal, points_per_amount: Decimal) -> i32 {
    if points_per_amount <= Decimal::ZERO || total <= Decimal::ZERO {
        return 0;
    }
    (total / points_per_amount).floor().to_i32().unwrap_or(0)
}

pub fn points_value(points: i32, point_value: Decimal) -> Decimal {
    Decimal::from(points) * point_value
}

async fn ledger<C: ConnectionTrait>(
    conn: &C,
    customer_id: Uuid,
) -> Result<Vec<point_transaction::Model>, ServiceError> {
    Ok(point_transaction::Entity::find()
        .filter(point_transaction::Column::CustomerId.eq(customer_id))
        .all(conn)
        .await?)
}

pub async fn point_balance<C: ConnectionTrait>(conn: &C, customer_id: Uuid) -> Result<i32, ServiceError> {
    Ok(ledger(conn, customer_id).await?.iter().map(|t| t.points).sum())
}

/// Rewrites the cached balance from the ledger sum.
pub async fn refresh_balance<C: ConnectionTrait>(conn: &C, customer_id: Uuid) -> Result<i32, ServiceError> {
    let balance = point_balance(conn, customer_id).await?;
    customer::Entity::update_many()
        .col_expr(
            customer::Column::AvailablePoints,
            Expr::value(balance),
        )
        .filter(customer::Column::Id.eq(customer_id))
        .exec(conn)
        .await?;
    Ok(balance)
}

async fn append_points<C: ConnectionTrait>(
    conn: &C,
    customer_id: Uuid,
    order_id: Option<Uuid>,
    points: i32,
    kind: PointKind,
) -> Result<i32, ServiceError> {
    point_transaction::ActiveModel {
        id: Set(Uuid::new_v4()),
        customer_id: Set(customer_id),
        order_id: Set(order_id),
        points: Set(points),
        kind: Set(kind),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;
    refresh_balance(conn, customer_id).await
}

/// Debits the cached balance with one conditional UPDATE. Zero rows affected
/// means the customer cannot cover `points`; a concurrent debit holds the row
/// until it commits, so the condition is re-checked against its result.
async fn take_points<C: ConnectionTrait>(
    conn: &C,
    customer_id: Uuid,
    points: i32,
) -> Result<(), ServiceError> {
    let result = customer::Entity::update_many()
        .col_expr(
            customer::Column::AvailablePoints,
            Expr::col(customer::Column::AvailablePoints).sub(points),
        )
        .filter(customer::Column::Id.eq(customer_id))
        .filter(customer::Column::AvailablePoints.gte(points))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        let available = point_balance(conn, customer_id).await?;
        return Err(ServiceError::InvalidAmount(format!(
            "cannot take {} points, balance is {}",
            points, available
        )));
    }
    Ok(())
}

/// Spends points on an order.
pub async fn redeem_on<C: ConnectionTrait>(
    conn: &C,
    customer_id: Uuid,
    order_id: Uuid,
    points: i32,
) -> Result<(), ServiceError> {
    if points <= 0 {
        return Err(ServiceError::InvalidAmount(format!(
            "points to redeem must be positive, got {}",
            points
        )));
    }
    take_points(conn, customer_id, points).await?;
    append_points(conn, customer_id, Some(order_id), -points, PointKind::Redeem).await?;
    Ok(())
}

/// Credits points for a completed order, at most once per order.
pub async fn earn_on<C: ConnectionTrait>(
    conn: &C,
    customer_id: Uuid,
    order_id: Uuid,
    points: i32,
) -> Result<bool, ServiceError> {
    if points <= 0 {
        return Ok(false);
    }
    let already = ledger(conn, customer_id)
        .await?
        .iter()
        .any(|t| t.order_id == Some(order_id) && t.kind == PointKind::Earn);
    if already {
        return Ok(false);
    }
    append_points(conn, customer_id, Some(order_id), points, PointKind::Earn).await?;
    Ok(true)
}

/// Cancels the net point effect of an order (redemptions given back, earnings taken).
pub async fn reverse_for_order<C: ConnectionTrait>(
    conn: &C,
    customer_id: Uuid,
    order_id: Uuid,
) -> Result<i32, ServiceError> {
    let net: i32 = ledger(conn, customer_id)
        .await?
        .iter()
        .filter(|t| t.order_id == Some(order_id))
        .map(|t| t.points)
        .sum();
    if net == 0 {
        return Ok(0);
    }
    append_points(conn, customer_id, Some(order_id), -net, PointKind::Reversal).await?;
    info!(%customer_id, %order_id, points = -net, "loyalty points reversed");
    Ok(-net)
}

/// Loyalty points ledger.
#[derive(Clone)]
pub struct LoyaltyService {
    db_pool: Arc<DatabaseConnection>,
    config: LoyaltyConfig,
}

impl LoyaltyService {
    pub fn new(db_pool: Arc<DatabaseConnection>, config: LoyaltyConfig) -> Self {
        Self { db_pool, config }
    }

    pub async fn balance(&self, customer_id: Uuid) -> Result<i32, ServiceError> {
        point_balance(&*self.db_pool, customer_id).await
    }

    /// Manual credit or debit, e.g. goodwill points.
    pub async fn adjust(&self, customer_id: Uuid, points: i32) -> Result<i32, ServiceError> {
        let txn = self.db_pool.begin().await?;
        if points < 0 {
            take_points(&txn, customer_id, -points).await?;
        }
        let balance = append_points(&txn, customer_id, None, points, PointKind::Adjustment).await?;
        txn.commit().await?;
        Ok(balance)
    }

    /// Redeems points against an open order and returns the money discount.
    /// The amount is clamped to what the order can absorb.
    #[instrument(skip(self))]
    pub async fn redeem_points(
        &self,
        customer_id: Uuid,
        order_id: Uuid,
        points: i32,
    ) -> Result<Decimal, ServiceError> {
        if !self.config.enabled {
            return Err(ServiceError::InvalidOperation(
                "loyalty program is disabled".to_string(),
            ));
        }

        let txn = self.db_pool.begin().await?;
        let order = find_order(&txn, order_id).await?;
        if order.order_status != OrderStatus::Open {
            return Err(ServiceError::InvalidOperation(format!(
                "points can only be redeemed on open orders, order is {}",
                order.order_status
            )));
        }
        if order.customer_id != Some(customer_id) {
            return Err(ServiceError::ValidationError(format!(
                "order {} does not belong to customer {}",
                order.order_number, customer_id
            )));
        }

        let available = point_balance(&txn, customer_id).await?;
        let remaining_subtotal = order.subtotal - order.points_discount;
        let points = points.min(max_redeemable(
            available,
            remaining_subtotal,
            order.coupon_discount,
            self.config.point_value,
        ));
        if points <= 0 {
            return Err(ServiceError::InvalidAmount(
                "no points can be redeemed on this order".to_string(),
            ));
        }

        redeem_on(&txn, customer_id, order_id, points).await?;

        let discount = points_value(points, self.config.point_value);
        let points_discount = order.points_discount + discount;
        let total = compute_total(
            order.subtotal,
            order.discount,
            order.coupon_discount,
            points_discount,
            order.shipping_fee,
            order.shipping_payer,
        );
        let status = summarize(total, &transactions_for(&txn, order_id).await?).status;
        save_order(&txn, &order, |active| {
            active.points_used = Set(order.points_used + points);
            active.points_discount = Set(points_discount);
            active.total_amount = Set(total);
            active.payment_status = Set(status);
        })
        .await?;
        txn.commit().await?;

        info!(%customer_id, %order_id, points, %discount, "points redeemed");
        Ok(discount)
    }
}
