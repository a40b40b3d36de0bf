//! Order merges as durable sagas: consolidation, payment migration, stock
//! handover, resume after a failed step and compensation.

mod common;

use assert_matches::assert_matches;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use common::TestApp;
use retail_fulfillment::entities::order::{self, OrderSource, OrderStatus};
use retail_fulfillment::entities::payment_transaction::{PaymentMethod, TransactionKind};
use retail_fulfillment::entities::saga_log::SagaStatus;
use retail_fulfillment::entities::saga_step::StepStatus;
use retail_fulfillment::errors::ServiceError;
use retail_fulfillment::events::Event;

async fn place(app: &TestApp, product_id: Uuid, quantity: i32, status: OrderStatus) -> order::Model {
    let mut draft = app.draft().line(product_id, quantity);
    draft.initial_status = status;
    app.services().orders.create(draft).await.unwrap()
}

async fn pay(app: &TestApp, order_id: Uuid, amount: Decimal) {
    app.services()
        .payments
        .record_payment(order_id, amount, PaymentMethod::BankTransfer, None, None)
        .await
        .unwrap();
}

async fn ledger_sum(app: &TestApp, order_id: Uuid) -> Decimal {
    app.services()
        .payments
        .transactions(order_id)
        .await
        .unwrap()
        .iter()
        .map(|tx| tx.amount)
        .sum()
}

#[tokio::test]
async fn preview_consolidates_lines_without_writing() {
    let app = TestApp::new().await;
    let p = app.product("P", dec!(10)).await;
    app.stock(p, 10).await;
    let o1 = place(&app, p, 2, OrderStatus::Confirmed).await;
    let o2 = place(&app, p, 1, OrderStatus::Open).await;

    let plan = app.services().merges.preview(&[o1.id, o2.id, o1.id]).await.unwrap();

    assert_eq!(plan.sources.len(), 2);
    assert_eq!(plan.lines.len(), 1);
    assert_eq!(plan.lines[0].quantity, 3);
    assert_eq!(plan.lines[0].total, dec!(30));
    assert_eq!(
        plan.lines[0].source_orders,
        vec![o1.order_number.clone(), o2.order_number.clone()]
    );
    assert!(plan.confirm_target);
    assert_eq!(plan.subtotal(), dec!(30));

    let o1 = app.services().orders.get_order(o1.id).await.unwrap();
    assert_eq!(o1.order_status, OrderStatus::Confirmed);
    assert_eq!(app.available(p).await, 8);
}

#[tokio::test]
async fn merge_moves_payments_and_stock_onto_one_order() {
    let app = TestApp::new().await;
    let p = app.product("P", dec!(100000)).await;
    app.stock(p, 10).await;
    let o1 = place(&app, p, 2, OrderStatus::Confirmed).await;
    let o2 = place(&app, p, 1, OrderStatus::Open).await;
    pay(&app, o1.id, dec!(150000)).await;
    assert_eq!(app.available(p).await, 8);

    let merges = &app.services().merges;
    let plan = merges.preview(&[o1.id, o2.id]).await.unwrap();
    let outcome = merges.commit(plan).await.unwrap();

    assert_eq!(outcome.status, SagaStatus::Completed);
    assert_eq!(outcome.error, None);
    let target = outcome.target.expect("merged order");
    assert!(target.order_number.starts_with("MRG-"));
    assert_eq!(target.source, OrderSource::MergeResult);
    assert_eq!(target.order_status, OrderStatus::Confirmed);
    assert_eq!(target.subtotal, dec!(300000));
    assert_eq!(target.paid_amount, dec!(150000));

    let lines = app.services().orders.lines(target.id).await.unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].quantity, 3);
    assert_eq!(lines[0].total, dec!(300000));

    for source in [o1.id, o2.id] {
        let source = app.services().orders.get_order(source).await.unwrap();
        assert_eq!(source.order_status, OrderStatus::Cancelled);
        assert_eq!(source.paid_amount, dec!(0));
        assert_eq!(ledger_sum(&app, source.id).await, dec!(0));
    }
    assert_eq!(ledger_sum(&app, target.id).await, dec!(150000));
    let target_ledger = app.services().payments.transactions(target.id).await.unwrap();
    assert!(target_ledger.iter().all(|tx| tx.kind == TransactionKind::MergeTransfer));

    // O1's two units came back before the merged order took three.
    assert_eq!(app.available(p).await, 7);

    let events = app.drain_events();
    assert!(events.contains(&Event::OrdersMerged {
        target_order_id: target.id,
        source_order_ids: vec![o1.id, o2.id],
    }));

    let again = merges.resume(outcome.saga_id).await.unwrap();
    assert_eq!(again.status, SagaStatus::Completed);
    assert_eq!(again.target.map(|t| t.id), Some(target.id));
    assert_eq!(app.available(p).await, 7);
}

#[tokio::test]
async fn merge_candidates_are_validated() {
    let app = TestApp::new().await;
    let p = app.product("P", dec!(100000)).await;
    app.stock(p, 10).await;
    let merges = &app.services().merges;

    let o1 = place(&app, p, 1, OrderStatus::Open).await;
    let err = merges.preview(&[o1.id, o1.id]).await.unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let mut other = app.draft().line(p, 1);
    other.customer_phone = Some("0988777666".to_string());
    let stranger = app.services().orders.create(other).await.unwrap();
    let err = merges.preview(&[o1.id, stranger.id]).await.unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(message) if message.contains("different customers"));

    let shipped = place(&app, p, 1, OrderStatus::Confirmed).await;
    app.services().carriers.create_shipment(shipped.id).await.unwrap();
    let err = merges.preview(&[o1.id, shipped.id]).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    let err = merges.preview(&[o1.id, Uuid::new_v4()]).await.unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

/// O1 holds the only unit; O2 wants two more. The merged order cannot be
/// stocked, so the saga stops at `deduct_target`.
async fn starved_merge(app: &TestApp) -> (Uuid, order::Model, order::Model, Uuid) {
    let a = app.product("A", dec!(100000)).await;
    app.stock(a, 1).await;
    let o1 = place(app, a, 1, OrderStatus::Confirmed).await;
    let o2 = place(app, a, 2, OrderStatus::Open).await;
    pay(app, o1.id, dec!(50000)).await;
    assert_eq!(app.available(a).await, 0);

    let merges = &app.services().merges;
    let plan = merges.preview(&[o1.id, o2.id]).await.unwrap();
    let outcome = merges.commit(plan).await.unwrap();
    assert_eq!(outcome.status, SagaStatus::Failed);
    assert!(outcome.error.is_some());
    assert_eq!(app.available(a).await, 1);

    let state = merges.saga(outcome.saga_id).await.unwrap();
    assert_eq!(
        state.step("deduct_target").map(|s| s.status),
        Some(StepStatus::Failed)
    );
    (outcome.saga_id, o1, o2, a)
}

#[tokio::test]
async fn failed_merge_resumes_from_the_failed_step() {
    let app = TestApp::new().await;
    let (saga_id, o1, o2, a) = starved_merge(&app).await;

    app.stock(a, 3).await;
    let outcome = app.services().merges.resume(saga_id).await.unwrap();

    assert_eq!(outcome.status, SagaStatus::Completed);
    let target = outcome.target.expect("merged order");
    assert_eq!(target.order_status, OrderStatus::Confirmed);
    assert_eq!(target.paid_amount, dec!(50000));
    assert_eq!(app.available(a).await, 0);

    for source in [o1.id, o2.id] {
        let source = app.services().orders.get_order(source).await.unwrap();
        assert_eq!(source.order_status, OrderStatus::Cancelled);
    }
    let movements = app.services().inventory.movements_for_order(o1.id).await.unwrap();
    assert_eq!(movements.iter().map(|m| m.delta).sum::<i32>(), 0);
}

#[tokio::test]
async fn failed_merge_compensates_back_to_the_sources() {
    let app = TestApp::new().await;
    let (saga_id, o1, o2, a) = starved_merge(&app).await;
    let merges = &app.services().merges;

    let outcome = merges.compensate(saga_id).await.unwrap();
    assert_eq!(outcome.status, SagaStatus::Compensated);
    let target = outcome.target.expect("target stays readable");
    let target = app.services().orders.get_order(target.id).await.unwrap();
    assert_eq!(target.order_status, OrderStatus::Cancelled);
    assert_eq!(target.paid_amount, dec!(0));

    let o1 = app.services().orders.get_order(o1.id).await.unwrap();
    assert_eq!(o1.order_status, OrderStatus::Confirmed);
    assert_eq!(o1.paid_amount, dec!(50000));
    assert_eq!(ledger_sum(&app, o1.id).await, dec!(50000));
    let o2 = app.services().orders.get_order(o2.id).await.unwrap();
    assert_eq!(o2.order_status, OrderStatus::Open);
    assert_eq!(app.available(a).await, 0);

    let state = merges.saga(saga_id).await.unwrap();
    assert_eq!(
        state.step("create_target").map(|s| s.status),
        Some(StepStatus::Compensated)
    );

    let err = merges.resume(saga_id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
    let again = merges.compensate(saga_id).await.unwrap();
    assert_eq!(again.status, SagaStatus::Compensated);
    assert_eq!(app.available(a).await, 0);
}

#[tokio::test]
async fn completed_merge_cannot_be_compensated() {
    let app = TestApp::new().await;
    let p = app.product("P", dec!(100000)).await;
    app.stock(p, 10).await;
    let o1 = place(&app, p, 1, OrderStatus::Open).await;
    let o2 = place(&app, p, 1, OrderStatus::Open).await;

    let merges = &app.services().merges;
    let plan = merges.preview(&[o1.id, o2.id]).await.unwrap();
    assert!(!plan.confirm_target);
    let outcome = merges.commit(plan).await.unwrap();
    assert_eq!(outcome.target.map(|t| t.order_status), Some(OrderStatus::Open));
    assert_eq!(app.available(p).await, 10);

    let err = merges.compensate(outcome.saga_id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
}
