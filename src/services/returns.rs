use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::activity::{Activity, ActivityLog};
use crate::config::LoyaltyConfig;
use crate::entities::order::{self, OrderSource, OrderStatus};
use crate::entities::payment_transaction::{self, PaymentMethod, TransactionKind};
use crate::entities::return_line::{self, ItemCondition};
use crate::entities::return_record::{self, ReturnKind};
use crate::entities::order_line;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::inventory::{restock_returned, InventoryService, StockLine};
use crate::services::orders::{insert_order, DraftLine, OrderDraft, Destination};
use crate::services::payments::{append_transaction, transactions_for, summarize, NewTransaction};
use crate::services::records::{find_order, find_order_by_number, find_order_lines};

/// Purchased quantity and net unit price (after line discounts) per product.
pub fn purchased_by_product(lines: &[order_line::Model]) -> BTreeMap<Uuid, (i32, Decimal)> {
    let mut totals: BTreeMap<Uuid, (i32, Decimal)> = BTreeMap::new();
    for line in lines {
        let entry = totals.entry(line.product_id).or_default();
        entry.0 += line.quantity;
        entry.1 += line.total;
    }
    totals
        .into_iter()
        .map(|(product_id, (quantity, total))| {
            let unit = if quantity > 0 {
                (total / Decimal::from(quantity)).round_dp(2)
            } else {
                Decimal::ZERO
            };
            (product_id, (quantity, unit))
        })
        .collect()
}

pub async fn returned_quantities<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<HashMap<Uuid, i32>, ServiceError> {
    let mut returned = HashMap::new();
    for line in return_line::Entity::find()
        .filter(return_line::Column::OrderId.eq(order_id))
        .all(conn)
        .await?
    {
        *returned.entry(line.product_id).or_insert(0) += line.quantity;
    }
    Ok(returned)
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReturnLine {
    pub product_id: Uuid,
    pub quantity: i32,
    pub condition: ItemCondition,
    pub unit_price: Decimal,
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_return<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
    code: &str,
    kind: ReturnKind,
    reason: Option<String>,
    refund_method: PaymentMethod,
    lines: &[NewReturnLine],
    total_refund: Decimal,
) -> Result<(return_record::Model, Vec<return_line::Model>), ServiceError> {
    let record = return_record::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        code: Set(code.to_string()),
        kind: Set(kind),
        reason: Set(reason),
        refund_method: Set(refund_method),
        total_refund: Set(total_refund),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;

    let mut saved = Vec::with_capacity(lines.len());
    for line in lines {
        saved.push(
            return_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                return_id: Set(record.id),
                order_id: Set(order.id),
                product_id: Set(line.product_id),
                quantity: Set(line.quantity),
                condition: Set(line.condition),
                unit_price: Set(line.unit_price),
            }
            .insert(conn)
            .await?,
        );
    }
    Ok((record, saved))
}

pub async fn find_return<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    code: &str,
) -> Result<Option<(return_record::Model, Vec<return_line::Model>)>, ServiceError> {
    let Some(record) = return_record::Entity::find()
        .filter(return_record::Column::OrderId.eq(order_id))
        .filter(return_record::Column::Code.eq(code))
        .one(conn)
        .await?
    else {
        return Ok(None);
    };
    let lines = return_line::Entity::find()
        .filter(return_line::Column::ReturnId.eq(record.id))
        .all(conn)
        .await?;
    Ok(Some((record, lines)))
}

async fn refund_for_return<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    code: &str,
) -> Result<Option<payment_transaction::Model>, ServiceError> {
    Ok(transactions_for(conn, order_id)
        .await?
        .into_iter()
        .find(|tx| tx.kind == TransactionKind::Refund && tx.note.as_deref() == Some(code)))
}

fn default_condition() -> ItemCondition {
    ItemCondition::New
}

fn default_refund_method() -> PaymentMethod {
    PaymentMethod::Cash
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnLineRequest {
    pub product_id: Uuid,
    pub quantity: i32,
    #[serde(default = "default_condition")]
    pub condition: ItemCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnRequest {
    /// Taken from the URL when submitted over HTTP.
    #[serde(default)]
    pub order_id: Uuid,
    /// Idempotency key; generated as `RT-<order number>-NN` when absent.
    #[serde(default)]
    pub code: Option<String>,
    pub lines: Vec<ReturnLineRequest>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default = "default_refund_method")]
    pub refund_method: PaymentMethod,
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReturnOutcome {
    pub record: return_record::Model,
    pub lines: Vec<return_line::Model>,
    /// Value of the returned goods at the prices paid.
    pub return_value: Decimal,
    pub refund: Option<payment_transaction::Model>,
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRequest {
    #[serde(default)]
    pub order_id: Uuid,
    #[serde(default)]
    pub code: Option<String>,
    pub return_lines: Vec<ReturnLineRequest>,
    pub new_lines: Vec<DraftLine>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Method used to collect a positive difference.
    #[serde(default = "default_refund_method")]
    pub payment_method: PaymentMethod,
    /// Method used to pay back a negative difference.
    #[serde(default = "default_refund_method")]
    pub refund_method: PaymentMethod,
    #[serde(default)]
    pub actor: Option<String>,
}

/// How the value difference of an exchange was settled.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "settlement", rename_all = "snake_case")]
pub enum Settlement {
    Even,
    CollectedFromCustomer { receipt: payment_transaction::Model },
    RefundedToCustomer { receipt: payment_transaction::Model },
}

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeOutcome {
    pub returned: ReturnOutcome,
    pub new_order: order::Model,
    /// Return value carried onto the new order.
    pub credit: Decimal,
    pub settlement: Settlement,
}

struct PreparedReturn {
    code: String,
    lines: Vec<NewReturnLine>,
    value: Decimal,
}

/// Checks the requested quantities against what is still returnable.
async fn prepare_return<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
    code: Option<&str>,
    requested: &[ReturnLineRequest],
) -> Result<PreparedReturn, ServiceError> {
    if !matches!(order.order_status, OrderStatus::Confirmed | OrderStatus::Completed) {
        return Err(ServiceError::InvalidOperation(format!(
            "returns are accepted for confirmed or completed orders, order {} is {}",
            order.order_number, order.order_status
        )));
    }
    if requested.is_empty() {
        return Err(ServiceError::ValidationError(
            "a return needs at least one line".to_string(),
        ));
    }

    let purchased = purchased_by_product(&find_order_lines(conn, order.id).await?);
    let mut returned = returned_quantities(conn, order.id).await?;

    let mut lines = Vec::with_capacity(requested.len());
    let mut value = Decimal::ZERO;
    for request in requested {
        if request.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "return quantity for product {} must be positive",
                request.product_id
            )));
        }
        let (bought, unit_price) = purchased.get(&request.product_id).copied().ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "product {} was not bought on order {}",
                request.product_id, order.order_number
            ))
        })?;
        let already = returned.entry(request.product_id).or_insert(0);
        if request.quantity > bought - *already {
            return Err(ServiceError::ValidationError(format!(
                "cannot return {} of product {}: {} bought, {} already returned",
                request.quantity, request.product_id, bought, already
            )));
        }
        *already += request.quantity;

        value += unit_price * Decimal::from(request.quantity);
        lines.push(NewReturnLine {
            product_id: request.product_id,
            quantity: request.quantity,
            condition: request.condition,
            unit_price,
        });
    }

    let code = match code.map(str::trim).filter(|c| !c.is_empty()) {
        Some(code) => code.to_string(),
        None => {
            let count = return_record::Entity::find()
                .filter(return_record::Column::OrderId.eq(order.id))
                .count(conn)
                .await?;
            format!("RT-{}-{:02}", order.order_number, count + 1)
        }
    };

    Ok(PreparedReturn { code, lines, value })
}

fn return_value(lines: &[return_line::Model]) -> Decimal {
    lines
        .iter()
        .map(|l| l.unit_price * Decimal::from(l.quantity))
        .sum()
}

/// Partial returns and exchanges against confirmed or completed orders.
#[derive(Clone)]
pub struct ReturnService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: EventSender,
    activity: ActivityLog,
    inventory: InventoryService,
    loyalty: LoyaltyConfig,
}

impl ReturnService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        event_sender: EventSender,
        loyalty: LoyaltyConfig,
    ) -> Self {
        let activity = ActivityLog::new(db_pool.clone());
        let inventory = InventoryService::new(db_pool.clone(), event_sender.clone());
        Self {
            db_pool,
            event_sender,
            activity,
            inventory,
            loyalty,
        }
    }

    /// Takes goods back, restocks them and refunds their value, never more than
    /// was collected. Order totals stay as they were.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn submit_return(&self, request: ReturnRequest) -> Result<ReturnOutcome, ServiceError> {
        let txn = self.db_pool.begin().await?;
        let order = find_order(&txn, request.order_id).await?;

        if let Some(code) = request.code.as_deref() {
            if let Some((record, lines)) = find_return(&txn, order.id, code).await? {
                let refund = refund_for_return(&txn, order.id, &record.code).await?;
                return Ok(ReturnOutcome {
                    return_value: return_value(&lines),
                    record,
                    lines,
                    refund,
                    replayed: true,
                });
            }
        }

        let prepared = prepare_return(&txn, &order, request.code.as_deref(), &request.lines).await?;
        let refund_amount = prepared.value.min(order.paid_amount).max(Decimal::ZERO);

        let stock_lines: Vec<StockLine> = prepared
            .lines
            .iter()
            .map(|l| StockLine {
                product_id: l.product_id,
                quantity: l.quantity,
            })
            .collect();
        restock_returned(&txn, &order, &stock_lines, &prepared.code).await?;

        let (record, lines) = insert_return(
            &txn,
            &order,
            &prepared.code,
            ReturnKind::Partial,
            request.reason.clone(),
            request.refund_method,
            &prepared.lines,
            refund_amount,
        )
        .await?;

        let refund = if refund_amount > Decimal::ZERO {
            let (receipt, _) = append_transaction(
                &txn,
                &order,
                NewTransaction {
                    amount: -refund_amount,
                    method: request.refund_method,
                    kind: TransactionKind::Refund,
                    note: Some(prepared.code.clone()),
                    actor: request.actor.clone(),
                },
            )
            .await?;
            Some(receipt)
        } else {
            None
        };
        txn.commit().await?;

        info!(
            order_id = %order.id,
            code = %record.code,
            value = %prepared.value,
            refunded = %refund_amount,
            "return accepted"
        );

        self.event_sender
            .send_or_log(Event::ReturnSubmitted {
                order_id: order.id,
                return_id: record.id,
                code: record.code.clone(),
            })
            .await;
        if let Some(receipt) = &refund {
            self.event_sender
                .send_or_log(Event::RefundIssued {
                    order_id: order.id,
                    receipt_number: receipt.receipt_number.clone(),
                    amount: refund_amount,
                })
                .await;
        }
        self.activity
            .record(
                Activity::order(order.tenant_id, order.id, "return_submitted")
                    .with_detail(format!("{} refund {}", record.code, refund_amount))
                    .with_actor(request.actor),
            )
            .await;

        Ok(ReturnOutcome {
            record,
            lines,
            return_value: prepared.value,
            refund,
            replayed: false,
        })
    }

    /// Returns goods and issues a replacement order in one transaction. The
    /// return value becomes credit on the new order; the difference is
    /// collected or paid back.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn submit_exchange(&self, request: ExchangeRequest) -> Result<ExchangeOutcome, ServiceError> {
        if request.new_lines.is_empty() {
            return Err(ServiceError::ValidationError(
                "an exchange needs at least one replacement line".to_string(),
            ));
        }

        let original = find_order(&*self.db_pool, request.order_id).await?;
        if let Some(code) = request.code.as_deref() {
            if let Some(outcome) = self.replay_exchange(&original, code).await? {
                return Ok(outcome);
            }
        }

        let advisory: Vec<StockLine> = request
            .new_lines
            .iter()
            .map(|l| StockLine {
                product_id: l.product_id,
                quantity: l.quantity,
            })
            .collect();
        self.inventory.reserve(original.warehouse_id, &advisory).await?;

        let txn = self.db_pool.begin().await?;
        let original = find_order(&txn, request.order_id).await?;
        let prepared =
            prepare_return(&txn, &original, request.code.as_deref(), &request.return_lines).await?;

        let stock_lines: Vec<StockLine> = prepared
            .lines
            .iter()
            .map(|l| StockLine {
                product_id: l.product_id,
                quantity: l.quantity,
            })
            .collect();
        restock_returned(&txn, &original, &stock_lines, &prepared.code).await?;

        let mut draft = OrderDraft::new(original.tenant_id, original.warehouse_id);
        draft.order_number = Some(format!("EX-{}", prepared.code));
        draft.customer_id = original.customer_id;
        draft.customer_phone = original.customer_phone.clone();
        draft.recipient_name = original.recipient_name.clone();
        draft.destination = Destination {
            province_id: original.province_id,
            district_id: original.district_id,
            ward_code: original.ward_code.clone(),
            street: original.street.clone(),
        };
        draft.lines = request
            .new_lines
            .iter()
            .map(|l| DraftLine {
                unit_price: None,
                ..l.clone()
            })
            .collect();
        draft.cod = original.cod_enabled;
        draft.source = OrderSource::Manual;
        draft.initial_status = OrderStatus::Confirmed;
        draft.note = Some(format!("Exchange from {}", original.order_number));
        let (new_order, _) = insert_order(&txn, &draft, &self.loyalty).await?;

        let credit = prepared
            .value
            .min(new_order.total_amount)
            .min(original.paid_amount)
            .max(Decimal::ZERO);
        let refundable = prepared.value.min(original.paid_amount).max(Decimal::ZERO);

        let (record, lines) = insert_return(
            &txn,
            &original,
            &prepared.code,
            ReturnKind::Exchange,
            request.reason.clone(),
            PaymentMethod::ExchangeCredit,
            &prepared.lines,
            refundable,
        )
        .await?;

        let mut original = original;
        let mut new_order = new_order;
        if credit > Decimal::ZERO {
            let (_, updated) = append_transaction(
                &txn,
                &original,
                NewTransaction {
                    amount: -credit,
                    method: PaymentMethod::ExchangeCredit,
                    kind: TransactionKind::Refund,
                    note: Some(format!("{} credit to {}", prepared.code, new_order.order_number)),
                    actor: request.actor.clone(),
                },
            )
            .await?;
            original = updated;

            let (_, updated) = append_transaction(
                &txn,
                &new_order,
                NewTransaction {
                    amount: credit,
                    method: PaymentMethod::ExchangeCredit,
                    kind: TransactionKind::ExchangeCredit,
                    note: Some(format!("Credit from {}", prepared.code)),
                    actor: request.actor.clone(),
                },
            )
            .await?;
            new_order = updated;
        }

        let remaining = summarize(new_order.total_amount, &transactions_for(&txn, new_order.id).await?).remaining;
        let overpaid = refundable - credit;
        let settlement = if remaining > Decimal::ZERO {
            let (receipt, updated) = append_transaction(
                &txn,
                &new_order,
                NewTransaction {
                    amount: remaining,
                    method: request.payment_method,
                    kind: TransactionKind::Payment,
                    note: Some(format!("Exchange difference for {}", prepared.code)),
                    actor: request.actor.clone(),
                },
            )
            .await?;
            new_order = updated;
            Settlement::CollectedFromCustomer { receipt }
        } else if overpaid > Decimal::ZERO {
            let (receipt, updated) = append_transaction(
                &txn,
                &original,
                NewTransaction {
                    amount: -overpaid,
                    method: request.refund_method,
                    kind: TransactionKind::Refund,
                    note: Some(prepared.code.clone()),
                    actor: request.actor.clone(),
                },
            )
            .await?;
            original = updated;
            Settlement::RefundedToCustomer { receipt }
        } else {
            Settlement::Even
        };
        txn.commit().await?;

        info!(
            original = %original.order_number,
            new_order = %new_order.order_number,
            code = %record.code,
            %credit,
            "exchange completed"
        );

        let mut events = vec![
            Event::ReturnSubmitted {
                order_id: original.id,
                return_id: record.id,
                code: record.code.clone(),
            },
            Event::OrderCreated(new_order.id),
            Event::OrderConfirmed(new_order.id),
            Event::ExchangeCompleted {
                original_order_id: original.id,
                new_order_id: new_order.id,
            },
        ];
        if let Settlement::RefundedToCustomer { receipt } = &settlement {
            events.push(Event::RefundIssued {
                order_id: original.id,
                receipt_number: receipt.receipt_number.clone(),
                amount: -receipt.amount,
            });
        }
        for event in events {
            self.event_sender.send_or_log(event).await;
        }
        self.activity
            .record(
                Activity::order(original.tenant_id, original.id, "exchanged")
                    .with_detail(format!("{} -> {}", record.code, new_order.order_number))
                    .with_actor(request.actor.clone()),
            )
            .await;

        Ok(ExchangeOutcome {
            returned: ReturnOutcome {
                return_value: prepared.value,
                record,
                lines,
                refund: None,
                replayed: false,
            },
            new_order,
            credit,
            settlement,
        })
    }

    async fn replay_exchange(
        &self,
        original: &order::Model,
        code: &str,
    ) -> Result<Option<ExchangeOutcome>, ServiceError> {
        let db = &*self.db_pool;
        let Some((record, lines)) = find_return(db, original.id, code).await? else {
            return Ok(None);
        };
        if record.kind != ReturnKind::Exchange {
            return Err(ServiceError::ValidationError(format!(
                "return {} is not an exchange",
                code
            )));
        }

        let number = format!("EX-{}", record.code);
        let new_order = find_order_by_number(db, original.tenant_id, &number)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", number)))?;
        let new_ledger = transactions_for(db, new_order.id).await?;

        let credit: Decimal = new_ledger
            .iter()
            .filter(|tx| tx.kind == TransactionKind::ExchangeCredit)
            .map(|tx| tx.amount)
            .sum();
        let settlement = match new_ledger
            .iter()
            .find(|tx| tx.kind == TransactionKind::Payment)
        {
            Some(receipt) => Settlement::CollectedFromCustomer {
                receipt: receipt.clone(),
            },
            None => match refund_for_return(db, original.id, &record.code).await? {
                Some(receipt) => Settlement::RefundedToCustomer { receipt },
                None => Settlement::Even,
            },
        };

        Ok(Some(ExchangeOutcome {
            returned: ReturnOutcome {
                return_value: return_value(&lines),
                record,
                lines,
                refund: None,
                replayed: true,
            },
            new_order,
            credit,
            settlement,
        }))
    }

    pub async fn returns_for(&self, order_id: Uuid) -> Result<Vec<return_record::Model>, ServiceError> {
        Ok(return_record::Entity::find()
            .filter(return_record::Column::OrderId.eq(order_id))
            .all(&*self.db_pool)
            .await?)
    }
}
