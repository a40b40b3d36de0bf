use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::activity::{Activity, ActivityLog};
use crate::config::LoyaltyConfig;
use crate::entities::order::{
    self, OrderSource, OrderStatus, PaymentStatus, ShippingPayer, ShippingStatus,
};
use crate::entities::payment_transaction::{PaymentMethod, TransactionKind};
use crate::entities::return_line::ItemCondition;
use crate::entities::return_record::ReturnKind;
use crate::entities::stock_movement::MovementKind;
use crate::entities::warranty::{self, WarrantyStatus};
use crate::entities::{customer, order_line, product};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::inventory::{deduct_for_order, restore_for_order};
use crate::services::loyalty;
use crate::services::payments::{
    append_transaction, has_transaction_of_kind, summarize, transactions_for, NewTransaction,
};
use crate::services::promotions::{
    claim_coupon, customer_usage, evaluate_coupon, find_coupon_by_code, release_coupon,
    usage_owner, CouponContext,
};
use crate::services::records::{
    append_note, find_order, find_order_by_number, find_order_lines, save_order,
};
use crate::services::returns::{
    insert_return, purchased_by_product, returned_quantities, NewReturnLine,
};

/// `subtotal - discount - coupon - points (+ shipping when the customer pays it)`, floored at zero.
pub fn compute_total(
    subtotal: Decimal,
    discount: Decimal,
    coupon_discount: Decimal,
    points_discount: Decimal,
    shipping_fee: Decimal,
    shipping_payer: ShippingPayer,
) -> Decimal {
    let shipping = match shipping_payer {
        ShippingPayer::Customer => shipping_fee,
        ShippingPayer::Shop => Decimal::ZERO,
    };
    (subtotal - discount - coupon_discount - points_discount + shipping).max(Decimal::ZERO)
}

fn default_payer() -> ShippingPayer {
    ShippingPayer::Customer
}

fn default_source() -> OrderSource {
    OrderSource::Manual
}

fn default_initial_status() -> OrderStatus {
    OrderStatus::Open
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftLine {
    pub product_id: Uuid,
    #[serde(default)]
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
    /// Catalog price when absent.
    #[serde(default)]
    pub unit_price: Option<Decimal>,
    #[serde(default)]
    pub line_discount: Decimal,
    #[serde(skip)]
    pub source_orders: Option<String>,
}

impl DraftLine {
    pub fn new(product_id: Uuid, quantity: i32) -> Self {
        Self {
            product_id,
            variant_id: None,
            quantity,
            unit_price: None,
            line_discount: Decimal::ZERO,
            source_orders: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub province_id: Option<i32>,
    pub district_id: Option<i32>,
    pub ward_code: Option<String>,
    pub street: Option<String>,
}

/// A coupon use inherited from another order (merge). Its discount is fixed and
/// the usage limit is not rechecked.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CarriedCoupon {
    pub coupon_id: Uuid,
    pub discount: Decimal,
}

/// Input to order creation.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OrderDraft {
    pub tenant_id: Uuid,
    /// Idempotency key: a draft whose number already exists returns that order.
    #[serde(default)]
    #[validate(length(min = 1, max = 64))]
    pub order_number: Option<String>,
    pub warehouse_id: Uuid,
    #[serde(default)]
    pub customer_id: Option<Uuid>,
    #[serde(default)]
    #[validate(length(min = 6, max = 20))]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub recipient_name: Option<String>,
    #[serde(default)]
    pub destination: Destination,
    #[validate(length(min = 1, message = "an order needs at least one line"))]
    pub lines: Vec<DraftLine>,
    #[serde(default)]
    pub discount: Decimal,
    #[serde(default)]
    pub shipping_fee: Decimal,
    #[serde(default = "default_payer")]
    pub shipping_payer: ShippingPayer,
    #[serde(default)]
    pub coupon_code: Option<String>,
    #[serde(skip)]
    pub carried_coupon: Option<CarriedCoupon>,
    #[serde(default)]
    pub points_to_redeem: i32,
    #[serde(default)]
    pub cod: bool,
    #[serde(default = "default_source")]
    pub source: OrderSource,
    #[serde(default = "default_initial_status")]
    pub initial_status: OrderStatus,
    #[serde(default)]
    pub note: Option<String>,
}

impl OrderDraft {
    pub fn new(tenant_id: Uuid, warehouse_id: Uuid) -> Self {
        Self {
            tenant_id,
            order_number: None,
            warehouse_id,
            customer_id: None,
            customer_phone: None,
            recipient_name: None,
            destination: Destination::default(),
            lines: Vec::new(),
            discount: Decimal::ZERO,
            shipping_fee: Decimal::ZERO,
            shipping_payer: ShippingPayer::Customer,
            coupon_code: None,
            carried_coupon: None,
            points_to_redeem: 0,
            cod: false,
            source: OrderSource::Manual,
            initial_status: OrderStatus::Open,
            note: None,
        }
    }

    pub fn line(mut self, product_id: Uuid, quantity: i32) -> Self {
        self.lines.push(DraftLine::new(product_id, quantity));
        self
    }

    fn check(&self) -> Result<(), ServiceError> {
        self.validate()?;
        if !matches!(self.initial_status, OrderStatus::Open | OrderStatus::Confirmed) {
            return Err(ServiceError::ValidationError(format!(
                "orders start open or confirmed, not {}",
                self.initial_status
            )));
        }
        for line in &self.lines {
            if line.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "quantity for product {} must be positive",
                    line.product_id
                )));
            }
            if line.line_discount < Decimal::ZERO
                || line.unit_price.map_or(false, |p| p < Decimal::ZERO)
            {
                return Err(ServiceError::ValidationError(format!(
                    "price and discount for product {} must not be negative",
                    line.product_id
                )));
            }
        }
        if self.discount < Decimal::ZERO || self.shipping_fee < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "discount and shipping fee must not be negative".to_string(),
            ));
        }
        if self.points_to_redeem < 0 {
            return Err(ServiceError::ValidationError(
                "points to redeem must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

async fn next_order_number<C: ConnectionTrait>(
    conn: &C,
    tenant_id: Uuid,
    now: DateTime<Utc>,
) -> Result<String, ServiceError> {
    let prefix = format!("ORD-{}-", now.format("%Y%m%d"));
    let taken = order::Entity::find()
        .filter(order::Column::TenantId.eq(tenant_id))
        .filter(order::Column::OrderNumber.starts_with(prefix.as_str()))
        .count(conn)
        .await?;
    Ok(format!("{}{:04}", prefix, taken + 1))
}

/// Inserts an order with its lines, coupon use and point redemption, and deducts
/// stock when it starts confirmed. Runs on the caller's connection.
pub async fn insert_order<C: ConnectionTrait>(
    conn: &C,
    draft: &OrderDraft,
    loyalty_config: &LoyaltyConfig,
) -> Result<(order::Model, Vec<order_line::Model>), ServiceError> {
    let now = Utc::now();
    let order_id = Uuid::new_v4();

    let mut customer_phone = draft
        .customer_phone
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);
    if let Some(customer_id) = draft.customer_id {
        let customer = customer::Entity::find_by_id(customer_id)
            .one(conn)
            .await?
            .filter(|c| c.tenant_id == draft.tenant_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Customer {} not found", customer_id)))?;
        customer_phone.get_or_insert(customer.phone);
    }

    let mut lines = Vec::with_capacity(draft.lines.len());
    let mut subtotal = Decimal::ZERO;
    let mut product_ids = Vec::with_capacity(draft.lines.len());
    for line in &draft.lines {
        let product = product::Entity::find_by_id(line.product_id)
            .one(conn)
            .await?
            .filter(|p| p.tenant_id == draft.tenant_id)
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", line.product_id))
            })?;
        let unit_price = line.unit_price.unwrap_or(product.price);
        let gross = unit_price * Decimal::from(line.quantity);
        if line.line_discount > gross {
            return Err(ServiceError::ValidationError(format!(
                "discount on {} exceeds the line amount",
                product.sku
            )));
        }

        subtotal += gross - line.line_discount;
        product_ids.push(product.id);
        lines.push(order_line::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            product_id: Set(product.id),
            variant_id: Set(line.variant_id),
            quantity: Set(line.quantity),
            unit_price: Set(unit_price),
            line_discount: Set(line.line_discount),
            total: Set(gross - line.line_discount),
            source_orders: Set(line.source_orders.clone()),
            created_at: Set(now),
        });
    }
    let (coupon_id, coupon_discount, enforce_limit) = match (&draft.carried_coupon, &draft.coupon_code) {
        (Some(carried), _) => (Some(carried.coupon_id), carried.discount.min(subtotal), false),
        (None, Some(code)) => {
            let coupon = find_coupon_by_code(conn, draft.tenant_id, code.trim()).await?;
            let usage = customer_usage(conn, coupon.id, draft.customer_id, customer_phone.as_deref()).await?;
            let discount = evaluate_coupon(
                &coupon,
                &CouponContext {
                    subtotal,
                    shipping_fee: draft.shipping_fee,
                    product_ids: &product_ids,
                    customer_usage: usage,
                    now,
                },
            )?;
            (Some(coupon.id), discount, true)
        }
        (None, None) => (None, Decimal::ZERO, true),
    };

    let mut points_used = 0;
    if draft.points_to_redeem > 0 {
        let customer_id = draft.customer_id.ok_or_else(|| {
            ServiceError::ValidationError("points can only be redeemed by a known customer".to_string())
        })?;
        if !loyalty_config.enabled {
            return Err(ServiceError::InvalidOperation(
                "loyalty program is disabled".to_string(),
            ));
        }
        let available = loyalty::point_balance(conn, customer_id).await?;
        points_used = draft.points_to_redeem.min(loyalty::max_redeemable(
            available,
            subtotal,
            coupon_discount,
            loyalty_config.point_value,
        ));
    }
    let points_discount = loyalty::points_value(points_used, loyalty_config.point_value);

    let total = compute_total(
        subtotal,
        draft.discount,
        coupon_discount,
        points_discount,
        draft.shipping_fee,
        draft.shipping_payer,
    );

    let order_number = match &draft.order_number {
        Some(number) => number.trim().to_string(),
        None => next_order_number(conn, draft.tenant_id, now).await?,
    };

    let order = order::ActiveModel {
        id: Set(order_id),
        tenant_id: Set(draft.tenant_id),
        order_number: Set(order_number),
        order_status: Set(draft.initial_status),
        shipping_status: Set(ShippingStatus::Pending),
        payment_status: Set(summarize(total, &[]).status),
        source: Set(draft.source),
        deducts_stock: Set(draft.source != OrderSource::Import),
        customer_id: Set(draft.customer_id),
        customer_phone: Set(customer_phone),
        recipient_name: Set(draft.recipient_name.clone()),
        warehouse_id: Set(draft.warehouse_id),
        province_id: Set(draft.destination.province_id),
        district_id: Set(draft.destination.district_id),
        ward_code: Set(draft.destination.ward_code.clone()),
        street: Set(draft.destination.street.clone()),
        subtotal: Set(subtotal),
        discount: Set(draft.discount),
        coupon_discount: Set(coupon_discount),
        points_discount: Set(points_discount),
        shipping_fee: Set(draft.shipping_fee),
        shipping_payer: Set(draft.shipping_payer),
        total_amount: Set(total),
        paid_amount: Set(Decimal::ZERO),
        cod_enabled: Set(draft.cod),
        cod_amount: Set(Decimal::ZERO),
        coupon_id: Set(coupon_id),
        points_used: Set(points_used),
        tracking_number: Set(None),
        carrier: Set(None),
        note: Set(draft.note.clone()),
        created_at: Set(now),
        updated_at: Set(now),
        version: Set(1),
    }
    .insert(conn)
    .await?;

    let mut saved_lines = Vec::with_capacity(lines.len());
    for line in lines {
        saved_lines.push(line.insert(conn).await?);
    }

    if let Some(coupon_id) = coupon_id {
        claim_coupon(conn, coupon_id, usage_owner(&order), enforce_limit).await?;
    }
    if let (Some(customer_id), true) = (order.customer_id, points_used > 0) {
        loyalty::redeem_on(conn, customer_id, order.id, points_used).await?;
    }
    if order.order_status == OrderStatus::Confirmed {
        deduct_for_order(conn, &order, &saved_lines).await?;
    }

    Ok((order, saved_lines))
}

/// What a transition changes, and which dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "dimension", content = "status", rename_all = "snake_case")]
pub enum TransitionTarget {
    Order(OrderStatus),
    Shipping(ShippingStatus),
    /// Always rejected; the payment ledger drives payment status.
    Payment(PaymentStatus),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionContext {
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    /// Allows leaving `delivery_failed` / `returned_to_sender`.
    #[serde(default)]
    pub manual_correction: bool,
    /// Method for the refund of a full return. Cash when absent.
    #[serde(default)]
    pub refund_method: Option<PaymentMethod>,
    /// Method for the completion receipt. COD orders default to cod, others to cash.
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
}

impl TransitionContext {
    pub fn by(actor: impl Into<String>) -> Self {
        Self {
            actor: Some(actor.into()),
            ..Self::default()
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Order after a transition plus the events to publish once the transaction commits.
#[derive(Debug, Clone)]
pub struct TransitionEffects {
    pub order: order::Model,
    pub from: OrderStatus,
    pub changed: bool,
    pub events: Vec<Event>,
}

async fn void_warranties<C: ConnectionTrait>(conn: &C, order_id: Uuid) -> Result<u64, ServiceError> {
    let result = warranty::Entity::update_many()
        .col_expr(warranty::Column::Status, Expr::value(WarrantyStatus::Void))
        .col_expr(warranty::Column::UpdatedAt, Expr::value(Some(Utc::now())))
        .filter(warranty::Column::OrderId.eq(order_id))
        .filter(warranty::Column::Status.eq(WarrantyStatus::Active))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

/// Gives back the coupon use and the order's net points.
async fn release_benefits<C: ConnectionTrait>(conn: &C, order: &order::Model) -> Result<(), ServiceError> {
    if let Some(coupon_id) = order.coupon_id {
        release_coupon(conn, coupon_id, usage_owner(order)).await?;
    }
    if let Some(customer_id) = order.customer_id {
        loyalty::reverse_for_order(conn, customer_id, order.id).await?;
    }
    Ok(())
}

/// Moves `order` along the commercial lifecycle with every side effect, on the
/// caller's connection. Replaying the current status changes nothing.
pub async fn apply_order_transition<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
    to: OrderStatus,
    ctx: &TransitionContext,
    loyalty_config: &LoyaltyConfig,
) -> Result<TransitionEffects, ServiceError> {
    let from = order.order_status;
    if from == to {
        return Ok(TransitionEffects {
            order,
            from,
            changed: false,
            events: Vec::new(),
        });
    }
    if !from.can_transition_to(to) {
        return Err(ServiceError::invalid_transition(from, to));
    }

    let order_id = order.id;
    let mut order = order;
    let mut events = Vec::new();

    match to {
        OrderStatus::Confirmed => {
            let lines = find_order_lines(conn, order_id).await?;
            deduct_for_order(conn, &order, &lines).await?;
            events.push(Event::OrderConfirmed(order_id));
        }
        OrderStatus::Completed => {
            // Owed is measured against the net ledger, refunds included.
            let owed = (order.total_amount - order.paid_amount).max(Decimal::ZERO);
            if owed > Decimal::ZERO
                && !has_transaction_of_kind(conn, order_id, TransactionKind::Completion).await?
            {
                let method = ctx.payment_method.unwrap_or(if order.cod_enabled {
                    PaymentMethod::Cod
                } else {
                    PaymentMethod::Cash
                });
                let (receipt, updated) = append_transaction(
                    conn,
                    &order,
                    NewTransaction {
                        amount: owed,
                        method,
                        kind: TransactionKind::Completion,
                        note: Some("Collected on completion".to_string()),
                        actor: ctx.actor.clone(),
                    },
                )
                .await?;
                order = updated;
                events.push(Event::PaymentRecorded {
                    order_id,
                    receipt_number: receipt.receipt_number,
                    amount: receipt.amount,
                });
            }
            if order.payment_status != PaymentStatus::Paid {
                order = save_order(conn, &order, |active| {
                    active.payment_status = Set(PaymentStatus::Paid);
                })
                .await?;
            }
            if let (Some(customer_id), true) = (order.customer_id, loyalty_config.enabled) {
                let points = loyalty::points_for(order.total_amount, loyalty_config.points_per_amount);
                loyalty::earn_on(conn, customer_id, order_id, points).await?;
            }
            events.push(Event::OrderCompleted(order_id));
        }
        OrderStatus::Cancelled => {
            restore_for_order(conn, &order, MovementKind::OrderRestore).await?;
            void_warranties(conn, order_id).await?;
            release_benefits(conn, &order).await?;
            if order.paid_amount > Decimal::ZERO {
                warn!(
                    %order_id,
                    paid = %order.paid_amount,
                    "cancelled order still holds customer money; refund it explicitly"
                );
            }
            events.push(Event::OrderCancelled(order_id));
        }
        OrderStatus::Returned => {
            let lines = find_order_lines(conn, order_id).await?;
            let returned = returned_quantities(conn, order_id).await?;
            let remaining: Vec<NewReturnLine> = purchased_by_product(&lines)
                .into_iter()
                .filter_map(|(product_id, (quantity, unit_price))| {
                    let left = quantity - returned.get(&product_id).copied().unwrap_or(0);
                    (left > 0).then_some(NewReturnLine {
                        product_id,
                        quantity: left,
                        condition: ItemCondition::New,
                        unit_price,
                    })
                })
                .collect();

            restore_for_order(conn, &order, MovementKind::ReturnRestock).await?;

            let refund_method = ctx.refund_method.unwrap_or(PaymentMethod::Cash);
            let refund = order.paid_amount.max(Decimal::ZERO);
            let code = format!("RT-{}-FULL", order.order_number);
            let (record, _) = insert_return(
                conn,
                &order,
                &code,
                ReturnKind::Full,
                ctx.note.clone(),
                refund_method,
                &remaining,
                refund,
            )
            .await?;

            if refund > Decimal::ZERO {
                let (receipt, updated) = append_transaction(
                    conn,
                    &order,
                    NewTransaction {
                        amount: -refund,
                        method: refund_method,
                        kind: TransactionKind::Refund,
                        note: Some(format!("Full return {}", code)),
                        actor: ctx.actor.clone(),
                    },
                )
                .await?;
                order = updated;
                events.push(Event::RefundIssued {
                    order_id,
                    receipt_number: receipt.receipt_number,
                    amount: refund,
                });
            }

            void_warranties(conn, order_id).await?;
            release_benefits(conn, &order).await?;
            events.push(Event::ReturnSubmitted {
                order_id,
                return_id: record.id,
                code,
            });
            events.push(Event::OrderReturned(order_id));
        }
        OrderStatus::Open => return Err(ServiceError::invalid_transition(from, to)),
    }

    let note = ctx
        .note
        .as_deref()
        .map(|line| append_note(order.note.as_deref(), line));
    let order = save_order(conn, &order, |active| {
        active.order_status = Set(to);
        if let Some(note) = note {
            active.note = Set(Some(note));
        }
    })
    .await?;

    events.insert(
        0,
        Event::OrderStatusChanged {
            order_id,
            old_status: from,
            new_status: to,
        },
    );

    info!(%order_id, %from, %to, "order status changed");
    Ok(TransitionEffects {
        order,
        from,
        changed: true,
        events,
    })
}

/// Owns order creation and the three status dimensions.
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: EventSender,
    activity: ActivityLog,
    loyalty: LoyaltyConfig,
}

impl OrderService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        event_sender: EventSender,
        loyalty: LoyaltyConfig,
    ) -> Self {
        let activity = ActivityLog::new(db_pool.clone());
        Self {
            db_pool,
            event_sender,
            activity,
            loyalty,
        }
    }

    pub(crate) async fn publish(&self, events: Vec<Event>) {
        for event in events {
            self.event_sender.send_or_log(event).await;
        }
    }

    /// Creates an order. A draft carrying an order number that already exists
    /// returns the existing order untouched.
    #[instrument(skip(self, draft), fields(tenant_id = %draft.tenant_id, lines = draft.lines.len()))]
    pub async fn create(&self, draft: OrderDraft) -> Result<order::Model, ServiceError> {
        draft.check()?;

        if let Some(number) = draft.order_number.as_deref() {
            if let Some(existing) = find_order_by_number(&*self.db_pool, draft.tenant_id, number.trim()).await? {
                info!(order_number = %existing.order_number, "order creation replayed");
                return Ok(existing);
            }
        }

        let txn = self.db_pool.begin().await?;
        let (order, lines) = insert_order(&txn, &draft, &self.loyalty).await?;
        txn.commit().await?;

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = %order.total_amount,
            status = %order.order_status,
            "order created"
        );

        let mut events = vec![Event::OrderCreated(order.id)];
        if order.order_status == OrderStatus::Confirmed {
            events.push(Event::OrderConfirmed(order.id));
        }
        self.publish(events).await;
        self.activity
            .record(
                Activity::order(order.tenant_id, order.id, "created")
                    .with_detail(format!("{} with {} lines", order.order_number, lines.len())),
            )
            .await;

        Ok(order)
    }

    #[instrument(skip(self, ctx))]
    pub async fn transition(
        &self,
        order_id: Uuid,
        target: TransitionTarget,
        ctx: TransitionContext,
    ) -> Result<order::Model, ServiceError> {
        match target {
            TransitionTarget::Order(to) => self.transition_order(order_id, to, &ctx).await,
            TransitionTarget::Shipping(to) => self.transition_shipping(order_id, to, &ctx).await,
            TransitionTarget::Payment(_) => Err(ServiceError::InvalidOperation(
                "payment status follows the payment ledger and cannot be set".to_string(),
            )),
        }
    }

    async fn transition_order(
        &self,
        order_id: Uuid,
        to: OrderStatus,
        ctx: &TransitionContext,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let order = find_order(&txn, order_id).await?;
        let effects = apply_order_transition(&txn, order, to, ctx, &self.loyalty).await?;
        if !effects.changed {
            return Ok(effects.order);
        }
        txn.commit().await?;

        self.publish(effects.events).await;
        self.activity
            .record(
                Activity::order(effects.order.tenant_id, order_id, to.to_string())
                    .with_detail(format!("{} -> {}", effects.from.label(), to.label()))
                    .with_actor(ctx.actor.clone()),
            )
            .await;

        Ok(effects.order)
    }

    async fn transition_shipping(
        &self,
        order_id: Uuid,
        to: ShippingStatus,
        ctx: &TransitionContext,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let order = find_order(&txn, order_id).await?;
        let from = order.shipping_status;
        if from == to {
            return Ok(order);
        }
        if !matches!(order.order_status, OrderStatus::Confirmed | OrderStatus::Completed) {
            return Err(ServiceError::InvalidOperation(format!(
                "shipping cannot move while the order is {}",
                order.order_status
            )));
        }
        if to == ShippingStatus::Packing && order.order_status != OrderStatus::Confirmed {
            return Err(ServiceError::InvalidOperation(format!(
                "only confirmed orders can be packed, this one is {}",
                order.order_status
            )));
        }
        if !from.can_advance_to(to, ctx.manual_correction) {
            return Err(ServiceError::invalid_transition(from, to));
        }

        let note = ctx
            .note
            .as_deref()
            .map(|line| append_note(order.note.as_deref(), line));
        let order = save_order(&txn, &order, |active| {
            active.shipping_status = Set(to);
            if let Some(note) = note {
                active.note = Set(Some(note));
            }
        })
        .await?;
        txn.commit().await?;

        info!(%order_id, %from, %to, manual = ctx.manual_correction, "shipping status changed");

        let mut events = vec![Event::ShippingStatusChanged {
            order_id,
            old_status: from,
            new_status: to,
        }];
        if to == ShippingStatus::Delivered {
            events.push(Event::OrderDelivered {
                order_id,
                tracking_number: order.tracking_number.clone(),
            });
        }
        self.publish(events).await;
        self.activity
            .record(
                Activity::order(order.tenant_id, order_id, "shipping_status_changed")
                    .with_detail(format!("{} -> {}", from.label(), to.label()))
                    .with_actor(ctx.actor.clone()),
            )
            .await;

        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        find_order(&*self.db_pool, order_id).await
    }

    pub async fn lines(&self, order_id: Uuid) -> Result<Vec<order_line::Model>, ServiceError> {
        find_order_lines(&*self.db_pool, order_id).await
    }

    /// Links a sold unit's serial number to the order. Re-linking the same serial is a no-op.
    pub async fn link_warranty(
        &self,
        order_id: Uuid,
        product_id: Uuid,
        serial_number: &str,
        ends_at: Option<DateTime<Utc>>,
    ) -> Result<warranty::Model, ServiceError> {
        let serial_number = serial_number.trim();
        if serial_number.is_empty() {
            return Err(ServiceError::ValidationError(
                "serial number must not be empty".to_string(),
            ));
        }

        let db = &*self.db_pool;
        let order = find_order(db, order_id).await?;
        if !matches!(order.order_status, OrderStatus::Confirmed | OrderStatus::Completed) {
            return Err(ServiceError::InvalidOperation(format!(
                "warranties attach to confirmed or completed orders, order is {}",
                order.order_status
            )));
        }
        if !find_order_lines(db, order_id)
            .await?
            .iter()
            .any(|l| l.product_id == product_id)
        {
            return Err(ServiceError::ValidationError(format!(
                "product {} is not part of order {}",
                product_id, order.order_number
            )));
        }

        let existing = warranty::Entity::find()
            .filter(warranty::Column::SerialNumber.eq(serial_number))
            .filter(warranty::Column::Status.eq(WarrantyStatus::Active))
            .one(db)
            .await?;
        if let Some(existing) = existing {
            if existing.order_id == order_id {
                return Ok(existing);
            }
            return Err(ServiceError::ValidationError(format!(
                "serial {} is already under warranty on another order",
                serial_number
            )));
        }

        let model = warranty::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            product_id: Set(product_id),
            serial_number: Set(serial_number.to_string()),
            status: Set(WarrantyStatus::Active),
            ends_at: Set(ends_at),
            ..Default::default()
        }
        .insert(db)
        .await?;

        self.activity
            .record(
                Activity::order(order.tenant_id, order_id, "warranty_linked")
                    .with_detail(serial_number.to_string()),
            )
            .await;
        Ok(model)
    }

    pub async fn warranties(&self, order_id: Uuid) -> Result<Vec<warranty::Model>, ServiceError> {
        Ok(warranty::Entity::find()
            .filter(warranty::Column::OrderId.eq(order_id))
            .all(&*self.db_pool)
            .await?)
    }

    /// Quantity still held per product, for order detail views.
    pub async fn stock_held(&self, order_id: Uuid) -> Result<BTreeMap<Uuid, i32>, ServiceError> {
        crate::services::inventory::outstanding_for_order(&*self.db_pool, order_id).await
    }
}
