//! Partial returns and exchanges: restocking, refunds capped at what was
//! collected, and settlement of the value difference.

mod common;

use assert_matches::assert_matches;
use axum::http::{Method, StatusCode};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

use common::{response_json, TestApp};
use retail_fulfillment::entities::order::{self, OrderStatus, PaymentStatus};
use retail_fulfillment::entities::payment_transaction::PaymentMethod;
use retail_fulfillment::entities::return_line::ItemCondition;
use retail_fulfillment::entities::return_record::ReturnKind;
use retail_fulfillment::errors::ServiceError;
use retail_fulfillment::services::orders::DraftLine;
use retail_fulfillment::services::returns::{
    ExchangeRequest, ReturnLineRequest, ReturnRequest, Settlement,
};

fn give_back(product_id: Uuid, quantity: i32) -> ReturnLineRequest {
    ReturnLineRequest {
        product_id,
        quantity,
        condition: ItemCondition::New,
    }
}

fn return_request(order_id: Uuid, lines: Vec<ReturnLineRequest>) -> ReturnRequest {
    ReturnRequest {
        order_id,
        code: None,
        lines,
        reason: Some("wrong size".to_string()),
        refund_method: PaymentMethod::Cash,
        actor: None,
    }
}

fn exchange_request(order_id: Uuid, give: ReturnLineRequest, take: Uuid) -> ExchangeRequest {
    ExchangeRequest {
        order_id,
        code: None,
        return_lines: vec![give],
        new_lines: vec![DraftLine::new(take, 1)],
        reason: None,
        payment_method: PaymentMethod::BankTransfer,
        refund_method: PaymentMethod::Cash,
        actor: None,
    }
}

/// A confirmed order for `quantity` units, paid in full when `paid` is set.
async fn bought(app: &TestApp, product_id: Uuid, quantity: i32, paid: bool) -> order::Model {
    let mut draft = app.draft().line(product_id, quantity);
    draft.initial_status = OrderStatus::Confirmed;
    let order = app.services().orders.create(draft).await.unwrap();
    if paid {
        return app
            .services()
            .payments
            .record_payment(order.id, order.total_amount, PaymentMethod::Cash, None, None)
            .await
            .unwrap()
            .order;
    }
    order
}

#[tokio::test]
async fn partial_return_restocks_and_refunds_its_value() {
    let app = TestApp::new().await;
    let a = app.product("A", dec!(100000)).await;
    app.stock(a, 10).await;
    let order = bought(&app, a, 3, true).await;
    assert_eq!(app.available(a).await, 7);

    let outcome = app
        .services()
        .returns
        .submit_return(return_request(order.id, vec![give_back(a, 1)]))
        .await
        .unwrap();

    assert!(!outcome.replayed);
    assert_eq!(outcome.return_value, dec!(100000));
    assert_eq!(outcome.record.kind, ReturnKind::Partial);
    assert_eq!(outcome.record.code, format!("RT-{}-01", order.order_number));
    let refund = outcome.refund.expect("refund receipt");
    assert_eq!(refund.amount, dec!(-100000));
    assert_eq!(app.available(a).await, 8);

    let order = app.services().orders.get_order(order.id).await.unwrap();
    assert_eq!(order.paid_amount, dec!(200000));
    assert_eq!(order.payment_status, PaymentStatus::Partial);
    assert_eq!(order.total_amount, dec!(300000));
    assert_eq!(order.order_status, OrderStatus::Confirmed);
}

#[tokio::test]
async fn return_code_replays_without_a_second_refund() {
    let app = TestApp::new().await;
    let a = app.product("A", dec!(100000)).await;
    app.stock(a, 10).await;
    let order = bought(&app, a, 3, true).await;

    let mut request = return_request(order.id, vec![give_back(a, 1)]);
    request.code = Some("RMA-7".to_string());
    let first = app.services().returns.submit_return(request.clone()).await.unwrap();
    let second = app.services().returns.submit_return(request).await.unwrap();

    assert!(second.replayed);
    assert_eq!(second.record.id, first.record.id);
    assert_eq!(app.available(a).await, 8);
    assert_eq!(app.services().payments.transactions(order.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn cannot_return_more_than_was_bought() {
    let app = TestApp::new().await;
    let a = app.product("A", dec!(100000)).await;
    let b = app.product("B", dec!(100000)).await;
    app.stock(a, 10).await;
    let order = bought(&app, a, 2, true).await;
    let returns = &app.services().returns;

    returns
        .submit_return(return_request(order.id, vec![give_back(a, 1)]))
        .await
        .unwrap();
    let err = returns
        .submit_return(return_request(order.id, vec![give_back(a, 2)]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(message) if message.contains("1 already returned"));

    let err = returns
        .submit_return(return_request(order.id, vec![give_back(b, 1)]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    let err = returns
        .submit_return(return_request(order.id, vec![give_back(a, 1), give_back(a, 1)]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
    assert_eq!(app.available(a).await, 9);
}

#[tokio::test]
async fn unpaid_return_refunds_nothing() {
    let app = TestApp::new().await;
    let a = app.product("A", dec!(100000)).await;
    app.stock(a, 10).await;
    let order = bought(&app, a, 2, false).await;

    let outcome = app
        .services()
        .returns
        .submit_return(return_request(order.id, vec![give_back(a, 2)]))
        .await
        .unwrap();
    assert!(outcome.refund.is_none());
    assert_eq!(outcome.record.total_refund, dec!(0));
    assert_eq!(app.available(a).await, 10);
}

#[tokio::test]
async fn open_orders_take_no_returns() {
    let app = TestApp::new().await;
    let a = app.product("A", dec!(100000)).await;
    app.stock(a, 10).await;
    let order = app.services().orders.create(app.draft().line(a, 1)).await.unwrap();

    let err = app
        .services()
        .returns
        .submit_return(return_request(order.id, vec![give_back(a, 1)]))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
}

#[tokio::test]
async fn dearer_exchange_collects_the_difference() {
    let app = TestApp::new().await;
    let a = app.product("A", dec!(100000)).await;
    let b = app.product("B", dec!(150000)).await;
    app.stock(a, 10).await;
    app.stock(b, 10).await;
    let original = bought(&app, a, 1, true).await;

    let outcome = app
        .services()
        .returns
        .submit_exchange(exchange_request(original.id, give_back(a, 1), b))
        .await
        .unwrap();

    assert_eq!(outcome.credit, dec!(100000));
    assert_matches!(
        &outcome.settlement,
        Settlement::CollectedFromCustomer { receipt } if receipt.amount == dec!(50000)
    );
    assert_eq!(outcome.returned.record.kind, ReturnKind::Exchange);

    let new_order = &outcome.new_order;
    assert_eq!(new_order.order_status, OrderStatus::Confirmed);
    assert_eq!(new_order.total_amount, dec!(150000));
    assert_eq!(new_order.paid_amount, dec!(150000));
    assert_eq!(new_order.payment_status, PaymentStatus::Paid);
    assert!(new_order.order_number.starts_with("EX-RT-"));

    let original = app.services().orders.get_order(original.id).await.unwrap();
    assert_eq!(original.paid_amount, dec!(0));
    assert_eq!(app.available(a).await, 10);
    assert_eq!(app.available(b).await, 9);
}

#[tokio::test]
async fn cheaper_exchange_pays_back_the_difference() {
    let app = TestApp::new().await;
    let a = app.product("A", dec!(200000)).await;
    let b = app.product("B", dec!(150000)).await;
    app.stock(a, 10).await;
    app.stock(b, 10).await;
    let original = bought(&app, a, 1, true).await;

    let outcome = app
        .services()
        .returns
        .submit_exchange(exchange_request(original.id, give_back(a, 1), b))
        .await
        .unwrap();

    assert_eq!(outcome.credit, dec!(150000));
    assert_matches!(
        &outcome.settlement,
        Settlement::RefundedToCustomer { receipt } if receipt.amount == dec!(-50000)
    );
    assert_eq!(outcome.new_order.payment_status, PaymentStatus::Paid);

    let original = app.services().orders.get_order(original.id).await.unwrap();
    assert_eq!(original.paid_amount, dec!(0));
}

#[tokio::test]
async fn like_for_like_exchange_is_even_and_replayable() {
    let app = TestApp::new().await;
    let a = app.product("A", dec!(100000)).await;
    let b = app.product("B", dec!(100000)).await;
    app.stock(a, 10).await;
    app.stock(b, 10).await;
    let original = bought(&app, a, 2, true).await;

    let mut request = exchange_request(original.id, give_back(a, 1), b);
    request.code = Some("SWAP-1".to_string());
    let first = app.services().returns.submit_exchange(request.clone()).await.unwrap();
    assert_matches!(first.settlement, Settlement::Even);
    assert!(!first.returned.replayed);

    let second = app.services().returns.submit_exchange(request).await.unwrap();
    assert!(second.returned.replayed);
    assert_eq!(second.new_order.id, first.new_order.id);
    assert_eq!(second.credit, dec!(100000));
    assert_matches!(second.settlement, Settlement::Even);
    assert_eq!(app.available(b).await, 9);
}

#[tokio::test]
async fn exchange_without_stock_changes_nothing() {
    let app = TestApp::new().await;
    let a = app.product("A", dec!(100000)).await;
    let b = app.product("B", dec!(100000)).await;
    app.stock(a, 10).await;
    let original = bought(&app, a, 1, true).await;

    let err = app
        .services()
        .returns
        .submit_exchange(exchange_request(original.id, give_back(a, 1), b))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InsufficientStock { product_id, .. } if product_id == b);
    assert!(app.services().returns.returns_for(original.id).await.unwrap().is_empty());
    assert_eq!(app.available(a).await, 9);
}

#[tokio::test]
async fn returns_over_http_report_replays() {
    let app = TestApp::new().await;
    let a = app.product("A", dec!(100000)).await;
    app.stock(a, 10).await;
    let order = bought(&app, a, 2, true).await;
    let path = format!("/api/v1/orders/{}/returns", order.id);
    let body = json!({
        "code": "WEB-1",
        "lines": [{ "product_id": a, "quantity": 1, "condition": "opened" }],
    });

    let response = app.request(Method::POST, &path, Some(body.clone())).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = response_json(response).await;
    assert_eq!(created["record"]["code"], "WEB-1");
    assert_eq!(created["replayed"], false);

    let response = app.request(Method::POST, &path, Some(body)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["replayed"], true);
}
