//! Shipment booking, carrier callbacks and the signed webhook endpoint.

mod common;

use assert_matches::assert_matches;
use axum::http::{Method, StatusCode};
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::json;
use uuid::Uuid;

use common::{response_json, FakeCarrier, TestApp};
use retail_fulfillment::entities::cod_reconciliation::{self, CodStatus};
use retail_fulfillment::entities::order::{OrderStatus, ShippingStatus};
use retail_fulfillment::errors::ServiceError;
use retail_fulfillment::events::Event;
use retail_fulfillment::handlers::webhooks::{sign, SIGNATURE_HEADER};
use retail_fulfillment::services::carriers::{CarrierWebhook, WebhookOutcome};
use retail_fulfillment::services::orders::{OrderDraft, TransitionContext, TransitionTarget};

fn confirmed(mut draft: OrderDraft) -> OrderDraft {
    draft.initial_status = OrderStatus::Confirmed;
    draft
}

fn webhook(tracking_number: &str, status_code: &str) -> CarrierWebhook {
    CarrierWebhook {
        tracking_number: tracking_number.to_string(),
        status_code: status_code.to_string(),
        status_text: None,
    }
}

async fn shipped_order(app: &TestApp) -> (Uuid, String) {
    let p = app.product("P", dec!(100000)).await;
    app.stock(p, 10).await;
    let order = app
        .services()
        .orders
        .create(confirmed(app.draft().line(p, 1)))
        .await
        .unwrap();
    let booking = app.services().carriers.create_shipment(order.id).await.unwrap();
    (order.id, booking.tracking_number)
}

#[tokio::test]
async fn booking_stores_tracking_and_cod_once() {
    let app = TestApp::new().await;
    let p = app.product("P", dec!(150000)).await;
    app.stock(p, 10).await;
    let mut draft = confirmed(app.draft().line(p, 2));
    draft.cod = true;
    let order = app.services().orders.create(draft).await.unwrap();
    app.services()
        .payments
        .record_payment(
            order.id,
            dec!(100000),
            retail_fulfillment::entities::payment_transaction::PaymentMethod::Cash,
            None,
            None,
        )
        .await
        .unwrap();

    let carriers = &app.services().carriers;
    let booking = carriers.create_shipment(order.id).await.unwrap();
    assert!(!booking.already_booked);
    assert_eq!(booking.tracking_number, FakeCarrier::tracking_for(&order.order_number));
    assert_eq!(booking.order.shipping_status, ShippingStatus::Shipped);
    assert_eq!(booking.order.cod_amount, dec!(200000));

    let bookings = app.carrier.bookings();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].client_order_code, order.order_number);
    assert_eq!(bookings[0].cod_amount, dec!(200000));
    assert_eq!(bookings[0].address.ward_code, "20109");

    let cod = cod_reconciliation::Entity::find()
        .filter(cod_reconciliation::Column::OrderId.eq(order.id))
        .one(&*app.db)
        .await
        .unwrap()
        .expect("cod row");
    assert_eq!(cod.amount, dec!(200000));
    assert_eq!(cod.status, CodStatus::Pending);

    let again = carriers.create_shipment(order.id).await.unwrap();
    assert!(again.already_booked);
    assert_eq!(again.tracking_number, booking.tracking_number);
    assert_eq!(app.carrier.bookings().len(), 1);

    let events = app.drain_events();
    assert!(events.contains(&Event::ShipmentCreated {
        order_id: order.id,
        tracking_number: booking.tracking_number.clone(),
    }));
}

#[tokio::test]
async fn booking_requires_a_full_address_and_a_phone() {
    let app = TestApp::new().await;
    let p = app.product("P", dec!(100000)).await;
    app.stock(p, 10).await;
    let carriers = &app.services().carriers;

    let mut no_ward = confirmed(app.draft().line(p, 1));
    no_ward.destination.ward_code = None;
    let order = app.services().orders.create(no_ward).await.unwrap();
    let err = carriers.create_shipment(order.id).await.unwrap_err();
    assert_matches!(err, ServiceError::MissingAddress(field) if field == "ward");

    let mut no_phone = confirmed(app.draft().line(p, 1));
    no_phone.customer_phone = None;
    let order = app.services().orders.create(no_phone).await.unwrap();
    let err = carriers.create_shipment(order.id).await.unwrap_err();
    assert_matches!(err, ServiceError::MissingPhone);

    assert!(app.carrier.bookings().is_empty());
}

#[tokio::test]
async fn open_orders_do_not_ship() {
    let app = TestApp::new().await;
    let p = app.product("P", dec!(100000)).await;
    app.stock(p, 10).await;
    let order = app.services().orders.create(app.draft().line(p, 1)).await.unwrap();

    let err = app.services().carriers.create_shipment(order.id).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
    assert!(app.carrier.bookings().is_empty());
}

#[tokio::test]
async fn carrier_rejection_leaves_the_order_untouched() {
    let app = TestApp::new().await;
    let p = app.product("P", dec!(100000)).await;
    app.stock(p, 10).await;
    let order = app
        .services()
        .orders
        .create(confirmed(app.draft().line(p, 1)))
        .await
        .unwrap();
    app.carrier.reject(&order.order_number);

    let err = app.services().carriers.create_shipment(order.id).await.unwrap_err();
    assert_matches!(err, ServiceError::CarrierRejected(reason) if reason.contains("Ward"));

    let order = app.services().orders.get_order(order.id).await.unwrap();
    assert_eq!(order.tracking_number, None);
    assert_eq!(order.shipping_status, ShippingStatus::Pending);
}

#[tokio::test]
async fn callbacks_apply_once_and_never_backwards() {
    let app = TestApp::new().await;
    let (order_id, tracking) = shipped_order(&app).await;
    let carriers = &app.services().carriers;

    let outcome = carriers.apply_webhook(&webhook(&tracking, "transporting")).await.unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::Applied {
            order_id,
            from: ShippingStatus::Shipped,
            to: ShippingStatus::InTransit,
        }
    );

    let delivered = webhook(&tracking, "delivered");
    assert_matches!(
        carriers.apply_webhook(&delivered).await.unwrap(),
        WebhookOutcome::Applied { to: ShippingStatus::Delivered, .. }
    );
    assert_eq!(
        carriers.apply_webhook(&delivered).await.unwrap(),
        WebhookOutcome::Duplicate { order_id }
    );
    assert_eq!(
        carriers.apply_webhook(&webhook(&tracking, "picking")).await.unwrap(),
        WebhookOutcome::Stale {
            order_id,
            current: ShippingStatus::Delivered,
            reported: ShippingStatus::Shipped,
        }
    );

    let order = app.services().orders.get_order(order_id).await.unwrap();
    assert_eq!(order.shipping_status, ShippingStatus::Delivered);

    let delivered_events = app
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, Event::OrderDelivered { .. }))
        .count();
    assert_eq!(delivered_events, 1);
}

#[tokio::test]
async fn unmapped_codes_and_unknown_parcels_are_acknowledged() {
    let app = TestApp::new().await;
    let (_, tracking) = shipped_order(&app).await;
    let carriers = &app.services().carriers;

    assert_eq!(
        carriers.apply_webhook(&webhook(&tracking, "cancel")).await.unwrap(),
        WebhookOutcome::Unmapped {
            status_code: "cancel".to_string()
        }
    );
    assert_eq!(
        carriers.apply_webhook(&webhook("NOPE-1", "delivered")).await.unwrap(),
        WebhookOutcome::UnknownTracking {
            tracking_number: "NOPE-1".to_string()
        }
    );
}

#[tokio::test]
async fn attached_parcels_follow_callbacks_and_polling() {
    let app = TestApp::new().await;
    let p = app.product("P", dec!(100000)).await;
    app.stock(p, 10).await;
    let order = app
        .services()
        .orders
        .create(confirmed(app.draft().line(p, 1)))
        .await
        .unwrap();
    let carriers = &app.services().carriers;

    let attached = carriers.attach_tracking(order.id, " EXT-77 ", None).await.unwrap();
    assert_eq!(attached.tracking_number.as_deref(), Some("EXT-77"));
    assert_eq!(attached.shipping_status, ShippingStatus::Pending);
    assert!(app.carrier.bookings().is_empty());

    let err = carriers.attach_tracking(order.id, "EXT-78", None).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    assert_matches!(
        carriers.apply_webhook(&webhook("EXT-77", "picked")).await.unwrap(),
        WebhookOutcome::Applied { from: ShippingStatus::Pending, to: ShippingStatus::Shipped, .. }
    );

    app.carrier.set_status("EXT-77", "delivering");
    assert_matches!(
        carriers.sync_tracking(order.id).await.unwrap(),
        WebhookOutcome::Applied { to: ShippingStatus::InTransit, .. }
    );
}

async fn tracked_pending_order(app: &TestApp, tracking: &str) -> Uuid {
    let p = app.product("P", dec!(100000)).await;
    app.stock(p, 10).await;
    let order = app
        .services()
        .orders
        .create(confirmed(app.draft().line(p, 1)))
        .await
        .unwrap();
    app.services()
        .carriers
        .attach_tracking(order.id, tracking, None)
        .await
        .unwrap();
    order.id
}

#[tokio::test]
async fn delivered_callback_on_a_pending_order_applies_once() {
    let app = TestApp::new().await;
    let order_id = tracked_pending_order(&app, "EXT-90").await;
    let carriers = &app.services().carriers;

    let delivered = webhook("EXT-90", "delivered");
    assert_eq!(
        carriers.apply_webhook(&delivered).await.unwrap(),
        WebhookOutcome::Applied {
            order_id,
            from: ShippingStatus::Pending,
            to: ShippingStatus::Delivered,
        }
    );
    assert_eq!(
        carriers.apply_webhook(&delivered).await.unwrap(),
        WebhookOutcome::Duplicate { order_id }
    );
    let order = app.services().orders.get_order(order_id).await.unwrap();
    assert_eq!(order.shipping_status, ShippingStatus::Delivered);
}

#[tokio::test]
async fn failure_callback_applies_to_a_tracked_pending_order() {
    let app = TestApp::new().await;
    let order_id = tracked_pending_order(&app, "EXT-91").await;

    assert_eq!(
        app.services()
            .carriers
            .apply_webhook(&webhook("EXT-91", "delivery_fail"))
            .await
            .unwrap(),
        WebhookOutcome::Applied {
            order_id,
            from: ShippingStatus::Pending,
            to: ShippingStatus::DeliveryFailed,
        }
    );
}

#[tokio::test]
async fn callbacks_leave_cancelled_orders_alone() {
    let app = TestApp::new().await;
    let order_id = tracked_pending_order(&app, "EXT-92").await;
    app.services()
        .orders
        .transition(
            order_id,
            TransitionTarget::Order(OrderStatus::Cancelled),
            TransitionContext::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        app.services()
            .carriers
            .apply_webhook(&webhook("EXT-92", "picking"))
            .await
            .unwrap(),
        WebhookOutcome::Closed {
            order_id,
            order_status: OrderStatus::Cancelled,
        }
    );
    let order = app.services().orders.get_order(order_id).await.unwrap();
    assert_eq!(order.shipping_status, ShippingStatus::Pending);
}

#[tokio::test]
async fn webhook_endpoint_checks_the_signature() {
    let app = TestApp::with_config(|cfg| {
        cfg.carrier.webhook_secret = Some("s3cret".to_string());
    })
    .await;
    let (order_id, tracking) = shipped_order(&app).await;
    let body = serde_json::to_vec(&json!({
        "trackingNumber": tracking,
        "statusCode": "delivered",
    }))
    .unwrap();

    let response = app
        .send(
            Method::POST,
            "/api/v1/webhooks/carrier",
            body.clone(),
            &[(SIGNATURE_HEADER, "deadbeef")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let error = response_json(response).await;
    assert_eq!(error["code"], "unauthorized");

    let unsigned = app
        .send(Method::POST, "/api/v1/webhooks/carrier", body.clone(), &[])
        .await;
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

    let signature = sign("s3cret", &body).unwrap();
    let response = app
        .send(
            Method::POST,
            "/api/v1/webhooks/carrier",
            body,
            &[(SIGNATURE_HEADER, signature.as_str())],
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let outcome = response_json(response).await;
    assert_eq!(outcome["outcome"], "applied");
    assert_eq!(outcome["to"], "delivered");
    assert_eq!(outcome["order_id"], order_id.to_string());
}

#[tokio::test]
async fn webhook_endpoint_rejects_malformed_bodies() {
    let app = TestApp::new().await;
    let response = app
        .send(Method::POST, "/api/v1/webhooks/carrier", b"not json".to_vec(), &[])
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .request(
            Method::POST,
            "/api/v1/webhooks/carrier",
            Some(json!({ "trackingNumber": "UNKNOWN", "statusCode": "delivered" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["outcome"], "unknown_tracking");
}
