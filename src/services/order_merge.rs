use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{DatabaseConnection, TransactionTrait};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{Activity, ActivityLog};
use crate::config::LoyaltyConfig;
use crate::entities::order::{self, OrderSource, OrderStatus, ShippingPayer, ShippingStatus};
use crate::entities::order_line;
use crate::entities::payment_transaction::{PaymentMethod, TransactionKind};
use crate::entities::saga_log::{SagaKind, SagaStatus};
use crate::entities::saga_step::StepStatus;
use crate::entities::stock_movement::MovementKind;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::saga::{self, SagaState};
use crate::services::inventory::{deduct_for_order, restore_for_order};
use crate::services::orders::{
    apply_order_transition, insert_order, CarriedCoupon, Destination, DraftLine, OrderDraft,
    TransitionContext,
};
use crate::services::payments::{append_transaction, transactions_for, NewTransaction};
use crate::services::records::{find_order, find_order_lines};

const CREATE_TARGET: &str = "create_target";
const DEDUCT_TARGET: &str = "deduct_target";

fn migrate_key(source: Uuid) -> String {
    format!("migrate_payments:{}", source)
}

fn restore_key(source: Uuid) -> String {
    format!("restore_stock:{}", source)
}

fn cancel_key(source: Uuid) -> String {
    format!("cancel_source:{}", source)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeSource {
    pub order_id: Uuid,
    pub order_number: String,
    pub order_status: OrderStatus,
    pub paid_amount: Decimal,
}

/// One consolidated line of the merged order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedLine {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_discount: Decimal,
    pub total: Decimal,
    pub source_orders: Vec<String>,
}

/// Everything the merge will do, computed without writing anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    pub tenant_id: Uuid,
    pub warehouse_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub customer_phone: Option<String>,
    pub recipient_name: Option<String>,
    pub destination: Destination,
    pub sources: Vec<MergeSource>,
    pub lines: Vec<MergedLine>,
    pub discount: Decimal,
    pub shipping_fee: Decimal,
    pub shipping_payer: ShippingPayer,
    pub carried_coupon: Option<CarriedCoupon>,
    pub cod: bool,
    /// The merged order is confirmed when any source was.
    pub confirm_target: bool,
}

impl MergePlan {
    pub fn source_ids(&self) -> Vec<Uuid> {
        self.sources.iter().map(|s| s.order_id).collect()
    }

    pub fn subtotal(&self) -> Decimal {
        self.lines.iter().map(|l| l.total).sum()
    }
}

/// Folds duplicate (product, variant) lines together, keeping first-seen order.
/// When prices differ the unit price is the average rounded up, and the line
/// discount absorbs the rounding so totals stay exact.
pub fn consolidate_lines(lines: &[(String, order_line::Model)]) -> Vec<MergedLine> {
    let mut merged: Vec<MergedLine> = Vec::new();
    let mut index: HashMap<(Uuid, Option<Uuid>), usize> = HashMap::new();

    for (order_number, line) in lines {
        let key = (line.product_id, line.variant_id);
        match index.get(&key) {
            Some(&i) => {
                let existing = &mut merged[i];
                existing.quantity += line.quantity;
                existing.total += line.total;
                existing.line_discount += line.line_discount;
                if existing.unit_price != line.unit_price {
                    existing.unit_price = Decimal::MIN;
                }
                if !existing.source_orders.contains(order_number) {
                    existing.source_orders.push(order_number.clone());
                }
            }
            None => {
                index.insert(key, merged.len());
                merged.push(MergedLine {
                    product_id: line.product_id,
                    variant_id: line.variant_id,
                    quantity: line.quantity,
                    unit_price: line.unit_price,
                    line_discount: line.line_discount,
                    total: line.total,
                    source_orders: vec![order_number.clone()],
                });
            }
        }
    }

    // Mixed prices: recompute from the exact total.
    for line in merged.iter_mut().filter(|l| l.unit_price == Decimal::MIN) {
        let gross = line.total + line.line_discount;
        line.unit_price = (gross / Decimal::from(line.quantity))
            .round_dp_with_strategy(2, RoundingStrategy::ToPositiveInfinity);
        line.line_discount = line.unit_price * Decimal::from(line.quantity) - line.total;
    }
    merged
}

fn validate_sources(orders: &[order::Model]) -> Result<(), ServiceError> {
    if orders.len() < 2 {
        return Err(ServiceError::ValidationError(
            "a merge needs at least two distinct orders".to_string(),
        ));
    }
    let first = &orders[0];
    for order in orders {
        if order.tenant_id != first.tenant_id {
            return Err(ServiceError::ValidationError(
                "orders belong to different tenants".to_string(),
            ));
        }
        if order.warehouse_id != first.warehouse_id {
            return Err(ServiceError::ValidationError(format!(
                "order {} ships from a different warehouse",
                order.order_number
            )));
        }
        if !matches!(order.order_status, OrderStatus::Open | OrderStatus::Confirmed)
            || order.shipping_status != ShippingStatus::Pending
            || order.tracking_number.is_some()
        {
            return Err(ServiceError::InvalidOperation(format!(
                "order {} is {} / {} and cannot be merged",
                order.order_number, order.order_status, order.shipping_status
            )));
        }
    }

    let same_customer = if first.customer_id.is_some() {
        orders.iter().all(|o| o.customer_id == first.customer_id)
    } else {
        let phone = first.customer_phone.as_deref().map(str::trim);
        phone.is_some()
            && orders
                .iter()
                .all(|o| o.customer_id.is_none() && o.customer_phone.as_deref().map(str::trim) == phone)
    };
    if !same_customer {
        return Err(ServiceError::ValidationError(
            "orders belong to different customers".to_string(),
        ));
    }
    Ok(())
}

/// What a merge produced.
#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub saga_id: Uuid,
    pub status: SagaStatus,
    pub target: Option<order::Model>,
    pub source_ids: Vec<Uuid>,
    /// Why the saga stopped, when it failed.
    pub error: Option<String>,
}

/// Combines open or confirmed orders of one customer into a single order.
#[derive(Clone)]
pub struct OrderMergeService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: EventSender,
    activity: ActivityLog,
    loyalty: LoyaltyConfig,
}

impl OrderMergeService {
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

    /// Validates the set and computes the merged order without writing.
    #[instrument(skip(self))]
    pub async fn preview(&self, order_ids: &[Uuid]) -> Result<MergePlan, ServiceError> {
        let db = &*self.db_pool;
        let mut ids: Vec<Uuid> = Vec::with_capacity(order_ids.len());
        for id in order_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }

        let mut orders = Vec::with_capacity(ids.len());
        for id in &ids {
            orders.push(find_order(db, *id).await?);
        }
        validate_sources(&orders)?;

        let mut all_lines = Vec::new();
        for order in &orders {
            for line in find_order_lines(db, order.id).await? {
                all_lines.push((order.order_number.clone(), line));
            }
        }

        let first = &orders[0];
        let carried_coupon = orders
            .iter()
            .filter_map(|o| {
                o.coupon_id.map(|coupon_id| CarriedCoupon {
                    coupon_id,
                    discount: o.coupon_discount,
                })
            })
            .max_by(|a, b| a.discount.cmp(&b.discount));

        Ok(MergePlan {
            tenant_id: first.tenant_id,
            warehouse_id: first.warehouse_id,
            customer_id: first.customer_id,
            customer_phone: first.customer_phone.clone(),
            recipient_name: first.recipient_name.clone(),
            destination: Destination {
                province_id: first.province_id,
                district_id: first.district_id,
                ward_code: first.ward_code.clone(),
                street: first.street.clone(),
            },
            sources: orders
                .iter()
                .map(|o| MergeSource {
                    order_id: o.id,
                    order_number: o.order_number.clone(),
                    order_status: o.order_status,
                    paid_amount: o.paid_amount,
                })
                .collect(),
            lines: consolidate_lines(&all_lines),
            discount: orders.iter().map(|o| o.discount).sum(),
            shipping_fee: orders
                .iter()
                .map(|o| o.shipping_fee)
                .max()
                .unwrap_or(Decimal::ZERO),
            shipping_payer: first.shipping_payer,
            carried_coupon,
            cod: orders.iter().any(|o| o.cod_enabled),
            confirm_target: orders.iter().any(|o| o.order_status == OrderStatus::Confirmed),
        })
    }

    /// Runs the merge as a durable saga. The plan is recomputed from the current
    /// rows first, so a stale preview cannot merge orders that moved on.
    #[instrument(skip(self, plan), fields(sources = plan.sources.len()))]
    pub async fn commit(&self, plan: MergePlan) -> Result<MergeOutcome, ServiceError> {
        let plan = self.preview(&plan.source_ids()).await?;
        let saga = saga::start(&*self.db_pool, SagaKind::OrderMerge, &plan).await?;
        let state = saga::load(&*self.db_pool, saga.id).await?;
        self.run_reporting(state).await
    }

    /// Continues a failed or interrupted merge from its first unfinished step.
    #[instrument(skip(self))]
    pub async fn resume(&self, saga_id: Uuid) -> Result<MergeOutcome, ServiceError> {
        let state = saga::load(&*self.db_pool, saga_id).await?;
        if state.saga.kind != SagaKind::OrderMerge {
            return Err(ServiceError::ValidationError(format!(
                "saga {} is not an order merge",
                saga_id
            )));
        }
        match state.saga.status {
            SagaStatus::Completed => return self.outcome(&state).await,
            SagaStatus::Compensated => {
                return Err(ServiceError::InvalidOperation(format!(
                    "merge {} was rolled back and cannot resume",
                    saga_id
                )))
            }
            SagaStatus::Running | SagaStatus::Failed => {}
        }
        saga::set_status(&*self.db_pool, saga_id, SagaStatus::Running, None).await?;
        self.run_reporting(state).await
    }

    /// A step failure is reported as a failed outcome so the caller keeps the
    /// saga id for `resume` or `compensate`.
    async fn run_reporting(&self, state: SagaState) -> Result<MergeOutcome, ServiceError> {
        let saga_id = state.id();
        match self.run(state).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let state = saga::load(&*self.db_pool, saga_id).await?;
                if state.saga.status == SagaStatus::Failed {
                    self.outcome(&state).await
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn outcome(&self, state: &SagaState) -> Result<MergeOutcome, ServiceError> {
        let plan: MergePlan = state.plan()?;
        let target = match target_id(state)? {
            Some(id) => Some(find_order(&*self.db_pool, id).await?),
            None => None,
        };
        Ok(MergeOutcome {
            saga_id: state.id(),
            status: state.saga.status,
            target,
            source_ids: plan.source_ids(),
            error: state.saga.last_error.clone(),
        })
    }

    /// Records a step failure and marks the saga failed.
    async fn settle(&self, saga_id: Uuid, key: &str, result: Result<(), ServiceError>) -> Result<(), ServiceError> {
        if let Err(err) = result {
            error!(%saga_id, step = key, error = %err, "merge step failed");
            let message = err.to_string();
            saga::record_step(&*self.db_pool, saga_id, key, StepStatus::Failed, None, Some(message.clone()))
                .await?;
            saga::set_status(&*self.db_pool, saga_id, SagaStatus::Failed, Some(message)).await?;
            return Err(err);
        }
        Ok(())
    }

    async fn run(&self, state: SagaState) -> Result<MergeOutcome, ServiceError> {
        let saga_id = state.id();
        let plan: MergePlan = state.plan()?;
        let mut events = Vec::new();

        let target_id = match target_id(&state)? {
            Some(id) => id,
            None => {
                let result = self.create_target(saga_id, &plan).await;
                let id = result.as_ref().ok().copied();
                self.settle(saga_id, CREATE_TARGET, result.map(|_| ())).await?;
                let id = id.ok_or_else(|| ServiceError::InternalError("merge target missing".into()))?;
                events.push(Event::OrderCreated(id));
                id
            }
        };

        for source in &plan.sources {
            let key = migrate_key(source.order_id);
            if !state.is_done(&key) {
                let result = self.migrate_payments(saga_id, &key, source.order_id, target_id).await;
                self.settle(saga_id, &key, result).await?;
            }

            let key = restore_key(source.order_id);
            if !state.is_done(&key) {
                let result = self.restore_source_stock(saga_id, &key, source.order_id).await;
                self.settle(saga_id, &key, result).await?;
            }
        }

        if !state.is_done(DEDUCT_TARGET) {
            let result = self.deduct_target(saga_id, &plan, target_id, &mut events).await;
            self.settle(saga_id, DEDUCT_TARGET, result).await?;
        }

        let target_number = find_order(&*self.db_pool, target_id).await?.order_number;
        for source in &plan.sources {
            let key = cancel_key(source.order_id);
            if !state.is_done(&key) {
                let result = self
                    .cancel_source(saga_id, &key, source.order_id, &target_number, &mut events)
                    .await;
                self.settle(saga_id, &key, result).await?;
            }
        }

        saga::set_status(&*self.db_pool, saga_id, SagaStatus::Completed, None).await?;
        let target = find_order(&*self.db_pool, target_id).await?;

        info!(%saga_id, target = %target.order_number, sources = plan.sources.len(), "orders merged");

        events.push(Event::OrdersMerged {
            target_order_id: target_id,
            source_order_ids: plan.source_ids(),
        });
        for event in events {
            self.event_sender.send_or_log(event).await;
        }
        self.activity
            .record(
                Activity::order(target.tenant_id, target_id, "merged")
                    .with_detail(
                        plan.sources
                            .iter()
                            .map(|s| s.order_number.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                    ),
            )
            .await;

        Ok(MergeOutcome {
            saga_id,
            status: SagaStatus::Completed,
            target: Some(target),
            source_ids: plan.source_ids(),
            error: None,
        })
    }

    async fn create_target(&self, saga_id: Uuid, plan: &MergePlan) -> Result<Uuid, ServiceError> {
        let mut draft = OrderDraft::new(plan.tenant_id, plan.warehouse_id);
        let short = saga_id.simple().to_string();
        draft.order_number = Some(format!("MRG-{}", short[..8].to_uppercase()));
        draft.customer_id = plan.customer_id;
        draft.customer_phone = plan.customer_phone.clone();
        draft.recipient_name = plan.recipient_name.clone();
        draft.destination = plan.destination.clone();
        draft.lines = plan
            .lines
            .iter()
            .map(|l| DraftLine {
                product_id: l.product_id,
                variant_id: l.variant_id,
                quantity: l.quantity,
                unit_price: Some(l.unit_price),
                line_discount: l.line_discount,
                source_orders: Some(l.source_orders.join(",")),
            })
            .collect();
        draft.discount = plan.discount;
        draft.shipping_fee = plan.shipping_fee;
        draft.shipping_payer = plan.shipping_payer;
        draft.carried_coupon = plan.carried_coupon;
        draft.cod = plan.cod;
        draft.source = OrderSource::MergeResult;
        draft.initial_status = OrderStatus::Open;
        draft.note = Some(format!(
            "Merged from {}",
            plan.sources
                .iter()
                .map(|s| s.order_number.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));

        let txn = self.db_pool.begin().await?;
        let (target, _) = insert_order(&txn, &draft, &self.loyalty).await?;
        saga::record_step(
            &txn,
            saga_id,
            CREATE_TARGET,
            StepStatus::Done,
            Some(target.id.to_string()),
            None,
        )
        .await?;
        txn.commit().await?;

        info!(%saga_id, target = %target.order_number, "merge target created");
        Ok(target.id)
    }

    /// Moves the source's net paid amount onto the target as paired transfers.
    async fn migrate_payments(
        &self,
        saga_id: Uuid,
        key: &str,
        source_id: Uuid,
        target_id: Uuid,
    ) -> Result<(), ServiceError> {
        let txn = self.db_pool.begin().await?;
        let source = find_order(&txn, source_id).await?;
        let amount = source.paid_amount.max(Decimal::ZERO);

        if amount > Decimal::ZERO {
            let method = transactions_for(&txn, source_id)
                .await?
                .iter()
                .rev()
                .find(|tx| tx.amount > Decimal::ZERO)
                .map(|tx| tx.method)
                .unwrap_or(PaymentMethod::Cash);
            let target = find_order(&txn, target_id).await?;
            transfer(&txn, &source, &target, amount, method).await?;
        }

        saga::record_step(&txn, saga_id, key, StepStatus::Done, Some(amount.to_string()), None).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn restore_source_stock(&self, saga_id: Uuid, key: &str, source_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db_pool.begin().await?;
        let source = find_order(&txn, source_id).await?;
        let restored = restore_for_order(&txn, &source, MovementKind::OrderRestore).await?;
        saga::record_step(
            &txn,
            saga_id,
            key,
            StepStatus::Done,
            Some(serde_json::to_string(&restored)?),
            None,
        )
        .await?;
        txn.commit().await?;
        Ok(())
    }

    async fn deduct_target(
        &self,
        saga_id: Uuid,
        plan: &MergePlan,
        target_id: Uuid,
        events: &mut Vec<Event>,
    ) -> Result<(), ServiceError> {
        let txn = self.db_pool.begin().await?;
        let target = find_order(&txn, target_id).await?;
        if plan.confirm_target {
            let effects = apply_order_transition(
                &txn,
                target,
                OrderStatus::Confirmed,
                &TransitionContext::by("merge"),
                &self.loyalty,
            )
            .await?;
            events.extend(effects.events);
        }
        saga::record_step(&txn, saga_id, DEDUCT_TARGET, StepStatus::Done, None, None).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn cancel_source(
        &self,
        saga_id: Uuid,
        key: &str,
        source_id: Uuid,
        target_number: &str,
        events: &mut Vec<Event>,
    ) -> Result<(), ServiceError> {
        let txn = self.db_pool.begin().await?;
        let source = find_order(&txn, source_id).await?;
        let effects = apply_order_transition(
            &txn,
            source,
            OrderStatus::Cancelled,
            &TransitionContext::by("merge").with_note(format!("Merged into {}", target_number)),
            &self.loyalty,
        )
        .await?;
        saga::record_step(&txn, saga_id, key, StepStatus::Done, None, None).await?;
        txn.commit().await?;
        events.extend(effects.events);
        Ok(())
    }

    /// Undoes the finished steps of a failed merge, most recent first. Once a
    /// source has been cancelled the merge can only go forward.
    #[instrument(skip(self))]
    pub async fn compensate(&self, saga_id: Uuid) -> Result<MergeOutcome, ServiceError> {
        let state = saga::load(&*self.db_pool, saga_id).await?;
        match state.saga.status {
            SagaStatus::Compensated => return self.outcome(&state).await,
            SagaStatus::Completed => {
                return Err(ServiceError::InvalidOperation(format!(
                    "merge {} already completed",
                    saga_id
                )))
            }
            SagaStatus::Running | SagaStatus::Failed => {}
        }
        if state
            .steps
            .iter()
            .any(|s| s.step_key.starts_with("cancel_source:") && s.status == StepStatus::Done)
        {
            return Err(ServiceError::InvalidOperation(format!(
                "merge {} already cancelled source orders; resume instead",
                saga_id
            )));
        }

        let target = target_id(&state)?;
        for step in state.done_steps_reversed() {
            let key = step.step_key.as_str();
            let txn = self.db_pool.begin().await?;

            if key == DEDUCT_TARGET {
                if let Some(target_id) = target {
                    let order = find_order(&txn, target_id).await?;
                    restore_for_order(&txn, &order, MovementKind::OrderRestore).await?;
                }
            } else if key == CREATE_TARGET {
                if let Some(target_id) = target {
                    let order = find_order(&txn, target_id).await?;
                    if order.order_status != OrderStatus::Cancelled {
                        apply_order_transition(
                            &txn,
                            order,
                            OrderStatus::Cancelled,
                            &TransitionContext::by("merge").with_note("Merge rolled back"),
                            &self.loyalty,
                        )
                        .await?;
                    }
                }
            } else if let Some(source) = key.strip_prefix("restore_stock:") {
                let restored = step.output.as_deref().unwrap_or("{}");
                let restored: BTreeMap<Uuid, i32> = serde_json::from_str(restored)?;
                if !restored.is_empty() {
                    let source = find_order(&txn, parse_id(source)?).await?;
                    let lines = find_order_lines(&txn, source.id).await?;
                    deduct_for_order(&txn, &source, &lines).await?;
                }
            } else if let Some(source) = key.strip_prefix("migrate_payments:") {
                let amount: Decimal = step
                    .output
                    .as_deref()
                    .unwrap_or("0")
                    .parse()
                    .map_err(|e| ServiceError::InternalError(format!("bad step output: {}", e)))?;
                if let (Some(target_id), true) = (target, amount > Decimal::ZERO) {
                    let source = find_order(&txn, parse_id(source)?).await?;
                    let target = find_order(&txn, target_id).await?;
                    transfer(&txn, &target, &source, amount, PaymentMethod::Cash).await?;
                }
            } else {
                warn!(%saga_id, step = key, "no compensation for step");
            }

            saga::record_step(&txn, saga_id, key, StepStatus::Compensated, None, None).await?;
            txn.commit().await?;
            info!(%saga_id, step = key, "merge step compensated");
        }

        saga::set_status(&*self.db_pool, saga_id, SagaStatus::Compensated, None).await?;
        let state = saga::load(&*self.db_pool, saga_id).await?;
        self.outcome(&state).await
    }

    pub async fn saga(&self, saga_id: Uuid) -> Result<SagaState, ServiceError> {
        saga::load(&*self.db_pool, saga_id).await
    }
}

fn parse_id(raw: &str) -> Result<Uuid, ServiceError> {
    Uuid::parse_str(raw).map_err(|e| ServiceError::InternalError(format!("bad saga step key: {}", e)))
}

/// The merged order, once created. Still readable after compensation.
fn target_id(state: &SagaState) -> Result<Option<Uuid>, ServiceError> {
    state
        .step(CREATE_TARGET)
        .and_then(|s| s.output.as_deref())
        .map(parse_id)
        .transpose()
}

/// Paired out/in ledger entries moving `amount` from one order to another.
async fn transfer<C: sea_orm::ConnectionTrait>(
    conn: &C,
    from: &order::Model,
    to: &order::Model,
    amount: Decimal,
    method: PaymentMethod,
) -> Result<(), ServiceError> {
    append_transaction(
        conn,
        from,
        NewTransaction {
            amount: -amount,
            method,
            kind: TransactionKind::MergeTransfer,
            note: Some(format!("Transferred to {}", to.order_number)),
            actor: Some("merge".to_string()),
        },
    )
    .await?;
    append_transaction(
        conn,
        to,
        NewTransaction {
            amount,
            method,
            kind: TransactionKind::MergeTransfer,
            note: Some(format!("Transferred from {}", from.order_number)),
            actor: Some("merge".to_string()),
        },
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn line(product_id: Uuid, quantity: i32, unit_price: Decimal, discount: Decimal) -> order_line::Model {
        order_line::Model {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            product_id,
            variant_id: None,
            quantity,
            unit_price,
            line_discount: discount,
            total: unit_price * Decimal::from(quantity) - discount,
            source_orders: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn duplicate_products_are_summed() {
        let a = Uuid::new_v4();
        let merged = consolidate_lines(&[
            ("O1".into(), line(a, 1, dec!(10), dec!(0))),
            ("O2".into(), line(a, 2, dec!(10), dec!(0))),
        ]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].quantity, 3);
        assert_eq!(merged[0].unit_price, dec!(10));
        assert_eq!(merged[0].total, dec!(30));
        assert_eq!(merged[0].source_orders, vec!["O1".to_string(), "O2".to_string()]);
    }

    #[test]
    fn variants_stay_apart() {
        let a = Uuid::new_v4();
        let mut red = line(a, 1, dec!(10), dec!(0));
        red.variant_id = Some(Uuid::new_v4());
        let merged = consolidate_lines(&[
            ("O1".into(), red),
            ("O2".into(), line(a, 1, dec!(10), dec!(0))),
        ]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn mixed_prices_keep_exact_totals() {
        let a = Uuid::new_v4();
        let merged = consolidate_lines(&[
            ("O1".into(), line(a, 1, dec!(10), dec!(0))),
            ("O2".into(), line(a, 2, dec!(11), dec!(1))),
        ]);

        let only = &merged[0];
        assert_eq!(only.quantity, 3);
        assert_eq!(only.total, dec!(31));
        assert_eq!(only.unit_price, dec!(10.67));
        assert_eq!(only.unit_price * Decimal::from(3) - only.line_discount, dec!(31));
    }
}
