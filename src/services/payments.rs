use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::activity::{Activity, ActivityLog};
use crate::entities::order::{self, OrderStatus, PaymentStatus};
use crate::entities::payment_transaction::{self, PaymentMethod, TransactionKind};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::records::{find_order, save_order};

/// Money position of one order, derived from its transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSummary {
    /// Everything ever received (payments, completions, credits, transfers in).
    pub collected: Decimal,
    /// Money paid back to the customer.
    pub refunded: Decimal,
    /// Balance moved to another order by a merge.
    pub transferred_out: Decimal,
    /// Net ledger sum; always equals `orders.paid_amount`.
    pub paid: Decimal,
    /// What the customer still owes.
    pub remaining: Decimal,
    pub status: PaymentStatus,
}

/// Folds an order's transactions into its payment position.
pub fn summarize(total: Decimal, transactions: &[payment_transaction::Model]) -> PaymentSummary {
    let mut collected = Decimal::ZERO;
    let mut refunded = Decimal::ZERO;
    let mut transferred_out = Decimal::ZERO;

    for tx in transactions {
        match tx.kind {
            TransactionKind::Refund => refunded -= tx.amount,
            TransactionKind::MergeTransfer if tx.amount < Decimal::ZERO => {
                transferred_out -= tx.amount
            }
            _ => collected += tx.amount,
        }
    }

    let paid = collected - refunded - transferred_out;
    let settled = collected - transferred_out;

    let status = if refunded > Decimal::ZERO && paid <= Decimal::ZERO {
        PaymentStatus::Refunded
    } else if settled >= total {
        PaymentStatus::Paid
    } else if settled <= Decimal::ZERO {
        PaymentStatus::Unpaid
    } else {
        PaymentStatus::Partial
    };

    PaymentSummary {
        collected,
        refunded,
        transferred_out,
        paid,
        remaining: (total - settled).max(Decimal::ZERO),
        status,
    }
}

fn receipt_prefix(kind: TransactionKind) -> &'static str {
    match kind {
        TransactionKind::Payment | TransactionKind::Completion => "RC",
        TransactionKind::Refund => "RF",
        TransactionKind::ExchangeCredit => "EC",
        TransactionKind::MergeTransfer => "MT",
    }
}

/// A ledger entry about to be appended. `amount` carries its sign.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub kind: TransactionKind,
    pub note: Option<String>,
    pub actor: Option<String>,
}

pub async fn transactions_for<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<payment_transaction::Model>, ServiceError> {
    Ok(payment_transaction::Entity::find()
        .filter(payment_transaction::Column::OrderId.eq(order_id))
        .order_by_asc(payment_transaction::Column::CreatedAt)
        .all(conn)
        .await?)
}

pub async fn has_transaction_of_kind<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    kind: TransactionKind,
) -> Result<bool, ServiceError> {
    let count = payment_transaction::Entity::find()
        .filter(payment_transaction::Column::OrderId.eq(order_id))
        .filter(payment_transaction::Column::Kind.eq(kind))
        .count(conn)
        .await?;
    Ok(count > 0)
}

/// Appends one entry and rewrites `paid_amount` and `payment_status` from the ledger.
pub async fn append_transaction<C: ConnectionTrait>(
    conn: &C,
    order: &order::Model,
    entry: NewTransaction,
) -> Result<(payment_transaction::Model, order::Model), ServiceError> {
    let sequence = payment_transaction::Entity::find()
        .filter(payment_transaction::Column::OrderId.eq(order.id))
        .count(conn)
        .await?
        + 1;
    let receipt_number = format!(
        "{}-{}-{:03}",
        receipt_prefix(entry.kind),
        order.order_number,
        sequence
    );

    let transaction = payment_transaction::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        receipt_number: Set(receipt_number),
        amount: Set(entry.amount),
        method: Set(entry.method),
        kind: Set(entry.kind),
        note: Set(entry.note),
        actor: Set(entry.actor),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await?;

    let ledger = transactions_for(conn, order.id).await?;
    let summary = summarize(order.total_amount, &ledger);
    let updated = save_order(conn, order, |active| {
        active.paid_amount = Set(summary.paid);
        active.payment_status = Set(summary.status);
    })
    .await?;

    Ok((transaction, updated))
}

/// Result of a money movement: the new ledger row and the order after it.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentReceipt {
    pub transaction: payment_transaction::Model,
    pub order: order::Model,
}

/// Payment ledger: receipts and refunds against an order.
#[derive(Clone)]
pub struct PaymentService {
    db_pool: Arc<DatabaseConnection>,
    event_sender: EventSender,
    activity: ActivityLog,
}

impl PaymentService {
    pub fn new(db_pool: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        let activity = ActivityLog::new(db_pool.clone());
        Self {
            db_pool,
            event_sender,
            activity,
        }
    }

    /// Records money received. Rejects anything above the remaining balance.
    #[instrument(skip(self, note, actor))]
    pub async fn record_payment(
        &self,
        order_id: Uuid,
        amount: Decimal,
        method: PaymentMethod,
        note: Option<String>,
        actor: Option<String>,
    ) -> Result<PaymentReceipt, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::InvalidAmount(format!(
                "payment amount must be positive, got {}",
                amount
            )));
        }

        let txn = self.db_pool.begin().await?;
        let order = find_order(&txn, order_id).await?;
        if matches!(order.order_status, OrderStatus::Cancelled | OrderStatus::Returned) {
            return Err(ServiceError::InvalidOperation(format!(
                "cannot take payment on a {} order",
                order.order_status
            )));
        }

        let summary = summarize(order.total_amount, &transactions_for(&txn, order_id).await?);
        if amount > summary.remaining {
            warn!(%order_id, %amount, remaining = %summary.remaining, "payment exceeds balance");
            return Err(ServiceError::InvalidAmount(format!(
                "payment of {} exceeds remaining balance {}",
                amount, summary.remaining
            )));
        }

        let (transaction, order) = append_transaction(
            &txn,
            &order,
            NewTransaction {
                amount,
                method,
                kind: TransactionKind::Payment,
                note,
                actor: actor.clone(),
            },
        )
        .await?;
        txn.commit().await?;

        info!(
            %order_id,
            receipt = %transaction.receipt_number,
            %amount,
            payment_status = %order.payment_status,
            "payment recorded"
        );

        self.event_sender
            .send_or_log(Event::PaymentRecorded {
                order_id,
                receipt_number: transaction.receipt_number.clone(),
                amount,
            })
            .await;
        self.activity
            .record(
                Activity::order(order.tenant_id, order_id, "payment_recorded")
                    .with_detail(format!(
                        "{} {}, now {}",
                        transaction.receipt_number,
                        amount,
                        order.payment_status.label()
                    ))
                    .with_actor(actor),
            )
            .await;

        Ok(PaymentReceipt { transaction, order })
    }

    /// Pays money back. Never more than the order currently holds.
    #[instrument(skip(self, reason, actor))]
    pub async fn record_refund(
        &self,
        order_id: Uuid,
        amount: Decimal,
        method: PaymentMethod,
        reason: Option<String>,
        actor: Option<String>,
    ) -> Result<PaymentReceipt, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::InvalidAmount(format!(
                "refund amount must be positive, got {}",
                amount
            )));
        }

        let txn = self.db_pool.begin().await?;
        let order = find_order(&txn, order_id).await?;
        if amount > order.paid_amount {
            return Err(ServiceError::InvalidAmount(format!(
                "refund of {} exceeds collected amount {}",
                amount, order.paid_amount
            )));
        }

        let (transaction, order) = append_transaction(
            &txn,
            &order,
            NewTransaction {
                amount: -amount,
                method,
                kind: TransactionKind::Refund,
                note: reason,
                actor: actor.clone(),
            },
        )
        .await?;
        txn.commit().await?;

        info!(%order_id, receipt = %transaction.receipt_number, %amount, "refund recorded");

        self.event_sender
            .send_or_log(Event::RefundIssued {
                order_id,
                receipt_number: transaction.receipt_number.clone(),
                amount,
            })
            .await;
        self.activity
            .record(
                Activity::order(order.tenant_id, order_id, "refund_recorded")
                    .with_detail(format!(
                        "{} {}, now {}",
                        transaction.receipt_number,
                        amount,
                        order.payment_status.label()
                    ))
                    .with_actor(actor),
            )
            .await;

        Ok(PaymentReceipt { transaction, order })
    }

    pub async fn transactions(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<payment_transaction::Model>, ServiceError> {
        transactions_for(&*self.db_pool, order_id).await
    }

    pub async fn summary(&self, order_id: Uuid) -> Result<PaymentSummary, ServiceError> {
        let db = &*self.db_pool;
        let order = find_order(db, order_id).await?;
        Ok(summarize(order.total_amount, &transactions_for(db, order_id).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tx(amount: Decimal, kind: TransactionKind) -> payment_transaction::Model {
        payment_transaction::Model {
            id: Uuid::new_v4(),
            order_id: Uuid::nil(),
            receipt_number: "RC-TEST".into(),
            amount,
            method: PaymentMethod::Cash,
            kind,
            note: None,
            actor: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn partial_then_paid() {
        let total = dec!(500000);
        let first = [tx(dec!(300000), TransactionKind::Payment)];
        let summary = summarize(total, &first);
        assert_eq!(summary.status, PaymentStatus::Partial);
        assert_eq!(summary.remaining, dec!(200000));

        let both = [first[0].clone(), tx(dec!(200000), TransactionKind::Payment)];
        let summary = summarize(total, &both);
        assert_eq!(summary.status, PaymentStatus::Paid);
        assert_eq!(summary.paid, total);
        assert_eq!(summary.remaining, Decimal::ZERO);
    }

    #[test]
    fn empty_ledger_is_unpaid_unless_nothing_is_owed() {
        assert_eq!(summarize(dec!(10), &[]).status, PaymentStatus::Unpaid);
        assert_eq!(summarize(Decimal::ZERO, &[]).status, PaymentStatus::Paid);
    }

    #[test]
    fn full_refund_flips_to_refunded() {
        let ledger = [
            tx(dec!(100), TransactionKind::Payment),
            tx(dec!(-100), TransactionKind::Refund),
        ];
        let summary = summarize(dec!(100), &ledger);
        assert_eq!(summary.paid, Decimal::ZERO);
        assert_eq!(summary.refunded, dec!(100));
        assert_eq!(summary.status, PaymentStatus::Refunded);
    }

    #[test]
    fn partial_refund_does_not_reopen_the_balance() {
        let ledger = [
            tx(dec!(100), TransactionKind::Payment),
            tx(dec!(-30), TransactionKind::Refund),
        ];
        let summary = summarize(dec!(100), &ledger);
        assert_eq!(summary.paid, dec!(70));
        assert_eq!(summary.remaining, Decimal::ZERO);
        assert_eq!(summary.status, PaymentStatus::Paid);
    }

    #[test]
    fn transferred_balance_leaves_the_source_unpaid() {
        let ledger = [
            tx(dec!(40), TransactionKind::Payment),
            tx(dec!(-40), TransactionKind::MergeTransfer),
        ];
        let summary = summarize(dec!(100), &ledger);
        assert_eq!(summary.paid, Decimal::ZERO);
        assert_eq!(summary.transferred_out, dec!(40));
        assert_eq!(summary.status, PaymentStatus::Unpaid);
    }
}
