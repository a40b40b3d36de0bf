use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::entities::stock_movement::MovementKind;
use crate::entities::{combo_component, order, order_line, product, stock_movement, stock_position};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

/// A product and quantity to move, before combo expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLine {
    pub product_id: Uuid,
    pub quantity: i32,
}

impl From<&order_line::Model> for StockLine {
    fn from(line: &order_line::Model) -> Self {
        Self {
            product_id: line.product_id,
            quantity: line.quantity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockDirection {
    Deduct,
    Restore,
}

impl StockDirection {
    fn signed(self, quantity: i32) -> i32 {
        match self {
            StockDirection::Deduct => -quantity,
            StockDirection::Restore => quantity,
        }
    }
}

/// Context recorded on every movement row.
#[derive(Debug, Clone)]
pub struct MovementContext {
    pub kind: MovementKind,
    pub order_id: Option<Uuid>,
    pub reference: Option<String>,
}

impl MovementContext {
    pub fn manual(reference: impl Into<String>) -> Self {
        Self {
            kind: MovementKind::Manual,
            order_id: None,
            reference: Some(reference.into()),
        }
    }

    pub fn for_order(kind: MovementKind, order: &order::Model) -> Self {
        Self {
            kind,
            order_id: Some(order.id),
            reference: Some(order.order_number.clone()),
        }
    }
}

/// Physical products a line consumes: itself, or its combo children scaled by the line quantity.
pub async fn expand_line<C: ConnectionTrait>(
    conn: &C,
    line: StockLine,
) -> Result<Vec<StockLine>, ServiceError> {
    let product = product::Entity::find_by_id(line.product_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", line.product_id)))?;

    if !product.is_combo {
        return Ok(vec![line]);
    }

    let components = combo_components(conn, product.id).await?;
    if components.is_empty() {
        return Err(ServiceError::ValidationError(format!(
            "Combo product {} has no components",
            product.sku
        )));
    }

    Ok(components
        .into_iter()
        .map(|c| StockLine {
            product_id: c.child_product_id,
            quantity: c.units_per_combo * line.quantity,
        })
        .collect())
}

pub async fn combo_components<C: ConnectionTrait>(
    conn: &C,
    combo_id: Uuid,
) -> Result<Vec<combo_component::Model>, ServiceError> {
    Ok(combo_component::Entity::find()
        .filter(combo_component::Column::ComboId.eq(combo_id))
        .all(conn)
        .await?)
}

pub async fn position_quantity<C: ConnectionTrait>(
    conn: &C,
    warehouse_id: Uuid,
    product_id: Uuid,
) -> Result<Option<i32>, ServiceError> {
    Ok(stock_position::Entity::find()
        .filter(stock_position::Column::WarehouseId.eq(warehouse_id))
        .filter(stock_position::Column::ProductId.eq(product_id))
        .one(conn)
        .await?
        .map(|p| p.quantity))
}

/// `min over children(floor(child_qty / units_per_combo))`; a combo without children has none.
pub async fn combo_stock_on<C: ConnectionTrait>(
    conn: &C,
    warehouse_id: Uuid,
    combo_id: Uuid,
) -> Result<i32, ServiceError> {
    let components = combo_components(conn, combo_id).await?;
    let mut levels = Vec::with_capacity(components.len());
    for component in &components {
        let quantity = position_quantity(conn, warehouse_id, component.child_product_id)
            .await?
            .unwrap_or(0);
        levels.push((quantity, component.units_per_combo));
    }
    Ok(combo_availability(&levels))
}

/// Pure form of the combo rule over `(child_quantity, units_per_combo)` pairs.
pub fn combo_availability(levels: &[(i32, i32)]) -> i32 {
    levels
        .iter()
        .map(|&(quantity, units)| {
            if units <= 0 {
                0
            } else {
                quantity.max(0) / units
            }
        })
        .min()
        .unwrap_or(0)
}

pub async fn available_on<C: ConnectionTrait>(
    conn: &C,
    warehouse_id: Uuid,
    product_id: Uuid,
) -> Result<i32, ServiceError> {
    let product = product::Entity::find_by_id(product_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;

    if product.is_combo {
        combo_stock_on(conn, warehouse_id, product_id).await
    } else {
        Ok(position_quantity(conn, warehouse_id, product_id)
            .await?
            .unwrap_or(0))
    }
}

/// Applies one signed delta with a single conditional update. The floor guard
/// lives in the statement, so concurrent writers can never drive a position negative.
pub async fn adjust_stock<C: ConnectionTrait>(
    conn: &C,
    warehouse_id: Uuid,
    product_id: Uuid,
    delta: i32,
    context: &MovementContext,
) -> Result<(), ServiceError> {
    if delta == 0 {
        return Ok(());
    }

    let result = stock_position::Entity::update_many()
        .col_expr(
            stock_position::Column::Quantity,
            Expr::col(stock_position::Column::Quantity).add(delta),
        )
        .col_expr(stock_position::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(stock_position::Column::WarehouseId.eq(warehouse_id))
        .filter(stock_position::Column::ProductId.eq(product_id))
        .filter(Expr::expr(Expr::col(stock_position::Column::Quantity).add(delta)).gte(0))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        let current = position_quantity(conn, warehouse_id, product_id).await?;
        match current {
            None if delta > 0 => {
                stock_position::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    warehouse_id: Set(warehouse_id),
                    product_id: Set(product_id),
                    quantity: Set(delta),
                    updated_at: Set(Utc::now()),
                }
                .insert(conn)
                .await?;
            }
            available => {
                return Err(ServiceError::InsufficientStock {
                    product_id,
                    requested: -delta,
                    available: available.unwrap_or(0),
                });
            }
        }
    }

    stock_movement::ActiveModel {
        id: Set(Uuid::new_v4()),
        warehouse_id: Set(warehouse_id),
        product_id: Set(product_id),
        order_id: Set(context.order_id),
        delta: Set(delta),
        kind: Set(context.kind),
        reference: Set(context.reference.clone()),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;

    debug!(%warehouse_id, %product_id, delta, kind = %context.kind, "stock adjusted");
    Ok(())
}

/// Applies every line, expanding combos. When a combo child fails, the children
/// already applied for that line are reverted before the error is returned.
pub async fn apply_lines<C: ConnectionTrait>(
    conn: &C,
    warehouse_id: Uuid,
    lines: &[StockLine],
    direction: StockDirection,
    context: &MovementContext,
) -> Result<(), ServiceError> {
    for line in lines {
        let parts = expand_line(conn, *line).await?;
        let mut applied: Vec<StockLine> = Vec::with_capacity(parts.len());

        for part in &parts {
            let delta = direction.signed(part.quantity);
            if let Err(err) = adjust_stock(conn, warehouse_id, part.product_id, delta, context).await
            {
                for done in applied.iter().rev() {
                    let undo = -direction.signed(done.quantity);
                    if let Err(undo_err) =
                        adjust_stock(conn, warehouse_id, done.product_id, undo, context).await
                    {
                        warn!(product_id = %done.product_id, error = %undo_err, "combo compensation failed");
                    }
                }
                return Err(err);
            }
            applied.push(*part);
        }
    }
    Ok(())
}

/// Units of each physical product the order still holds, read from the movement ledger.
pub async fn outstanding_for_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<BTreeMap<Uuid, i32>, ServiceError> {
    let movements = stock_movement::Entity::find()
        .filter(stock_movement::Column::OrderId.eq(order_id))
        .filter(stock_movement::Column::Kind.is_in([
            MovementKind::OrderDeduct,
            MovementKind::OrderRestore,
            MovementKind::ReturnRestock,
        ]))
        .all(conn)
        .await?;

    let mut held: BTreeMap<Uuid, i32> = BTreeMap::new();
    for movement in movements {
        *held.entry(movement.product_id).or_default() -= movement.delta;
    }
    held.retain(|_, quantity| *quantity > 0);
    Ok(held)
}

pub async fn is_stock_held<C: ConnectionTrait>(conn: &C, order_id: Uuid) -> Result<bool, ServiceError> {
    Ok(!outstanding_for_order(conn, order_id).await?.is_empty())
}

/// Deducts the order's lines once. Returns `false` when the order never touches
/// stock or the ledger already shows its deduction.
pub async fn deduct_for_order<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
    lines: &[order_line::Model],
) -> Result<bool, ServiceError> {
    if !order.deducts_stock {
        return Ok(false);
    }
    if is_stock_held(conn, order.id).await? {
        debug!(order_id = %order.id, "stock already deducted for order");
        return Ok(false);
    }

    let stock_lines: Vec<StockLine> = lines.iter().map(StockLine::from).collect();
    apply_lines(
        conn,
        order.warehouse_id,
        &stock_lines,
        StockDirection::Deduct,
        &MovementContext::for_order(MovementKind::OrderDeduct, order),
    )
    .await?;

    info!(order_id = %order.id, lines = stock_lines.len(), "stock deducted for order");
    Ok(true)
}

/// Returns whatever the order still holds. Replays restore nothing.
pub async fn restore_for_order<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
    kind: MovementKind,
) -> Result<BTreeMap<Uuid, i32>, ServiceError> {
    if !order.deducts_stock {
        return Ok(BTreeMap::new());
    }

    let outstanding = outstanding_for_order(conn, order.id).await?;
    let context = MovementContext::for_order(kind, order);
    for (product_id, quantity) in &outstanding {
        adjust_stock(conn, order.warehouse_id, *product_id, *quantity, &context).await?;
    }

    if !outstanding.is_empty() {
        info!(order_id = %order.id, products = outstanding.len(), "stock restored for order");
    }
    Ok(outstanding)
}

/// Restocks returned units, never more than the order still holds per product.
pub async fn restock_returned<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
    lines: &[StockLine],
    reference: &str,
) -> Result<(), ServiceError> {
    if !order.deducts_stock {
        return Ok(());
    }

    let mut outstanding = outstanding_for_order(conn, order.id).await?;
    let context = MovementContext {
        kind: MovementKind::ReturnRestock,
        order_id: Some(order.id),
        reference: Some(reference.to_string()),
    };

    for line in lines {
        for part in expand_line(conn, *line).await? {
            let held = outstanding.entry(part.product_id).or_default();
            let quantity = part.quantity.min(*held);
            if quantity > 0 {
                adjust_stock(conn, order.warehouse_id, part.product_id, quantity, &context).await?;
                *held -= quantity;
            }
        }
    }
    Ok(())
}

/// Per-warehouse stock ledger with combo resolution.
#[derive(Clone)]
pub struct InventoryService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl InventoryService {
    pub fn new(db_pool: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Advisory availability check. The conditional update at deduction time stays authoritative.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn reserve(&self, warehouse_id: Uuid, lines: &[StockLine]) -> Result<(), ServiceError> {
        let db = &*self.db_pool;

        let mut required: BTreeMap<Uuid, i32> = BTreeMap::new();
        for line in lines {
            if line.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "Quantity for product {} must be positive",
                    line.product_id
                )));
            }
            for part in expand_line(db, *line).await? {
                *required.entry(part.product_id).or_default() += part.quantity;
            }
        }

        for (product_id, quantity) in required {
            let available = position_quantity(db, warehouse_id, product_id)
                .await?
                .unwrap_or(0);
            if available < quantity {
                return Err(ServiceError::InsufficientStock {
                    product_id,
                    requested: quantity,
                    available,
                });
            }
        }
        Ok(())
    }

    /// Manual adjustment of a single position.
    #[instrument(skip(self))]
    pub async fn adjust(
        &self,
        warehouse_id: Uuid,
        product_id: Uuid,
        delta: i32,
        reason: &str,
    ) -> Result<i32, ServiceError> {
        let txn = self.db_pool.begin().await?;
        adjust_stock(&txn, warehouse_id, product_id, delta, &MovementContext::manual(reason)).await?;
        let quantity = position_quantity(&txn, warehouse_id, product_id)
            .await?
            .unwrap_or(0);
        txn.commit().await?;

        info!(%warehouse_id, %product_id, delta, quantity, "stock position adjusted");
        self.event_sender
            .send_or_log(Event::StockAdjusted {
                warehouse_id,
                product_id,
                delta,
            })
            .await;
        Ok(quantity)
    }

    /// Sets a position to an absolute level (receiving, stock takes).
    #[instrument(skip(self))]
    pub async fn set_stock(
        &self,
        warehouse_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if quantity < 0 {
            return Err(ServiceError::ValidationError(
                "Stock level cannot be negative".to_string(),
            ));
        }
        let current = position_quantity(&*self.db_pool, warehouse_id, product_id)
            .await?
            .unwrap_or(0);
        self.adjust(warehouse_id, product_id, quantity - current, "stock take")
            .await
            .map(|_| ())
    }

    pub async fn combo_stock(&self, warehouse_id: Uuid, combo_id: Uuid) -> Result<i32, ServiceError> {
        combo_stock_on(&*self.db_pool, warehouse_id, combo_id).await
    }

    pub async fn available(&self, warehouse_id: Uuid, product_id: Uuid) -> Result<i32, ServiceError> {
        available_on(&*self.db_pool, warehouse_id, product_id).await
    }

    pub async fn movements_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<stock_movement::Model>, ServiceError> {
        Ok(stock_movement::Entity::find()
            .filter(stock_movement::Column::OrderId.eq(order_id))
            .all(&*self.db_pool)
            .await?)
    }
}
