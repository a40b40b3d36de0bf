use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::entities::payment_transaction::PaymentMethod;
use crate::entities::saga_log::SagaStatus;
use crate::entities::{order, order_line, payment_transaction};
use crate::errors::ServiceError;
use crate::services::order_merge::MergePlan;
use crate::services::orders::{OrderDraft, TransitionContext, TransitionTarget};
use crate::services::returns::{ExchangeRequest, ReturnRequest};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct OrderDetail {
    pub order: order::Model,
    pub lines: Vec<order_line::Model>,
    pub transactions: Vec<payment_transaction::Model>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub target: TransitionTarget,
    #[serde(default)]
    pub context: TransitionContext,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PaymentRequest {
    pub amount: Decimal,
    pub method: PaymentMethod,
    #[validate(length(max = 500))]
    pub note: Option<String>,
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CouponRequest {
    pub coupon_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct OrderIds {
    pub order_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct CouponApplied {
    pub order_id: Uuid,
    pub discount: Decimal,
}

// POST /api/v1/orders
pub async fn create_order(
    State(state): State<AppState>,
    Json(draft): Json<OrderDraft>,
) -> Result<impl IntoResponse, ServiceError> {
    let order = state.services.orders.create(draft).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

// GET /api/v1/orders/:id
pub async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OrderDetail>, ServiceError> {
    let order = state.services.orders.get_order(id).await?;
    let lines = state.services.orders.lines(id).await?;
    let transactions = state.services.payments.transactions(id).await?;
    Ok(Json(OrderDetail {
        order,
        lines,
        transactions,
    }))
}

// POST /api/v1/orders/:id/transitions
pub async fn transition_order(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<TransitionRequest>,
) -> Result<Json<order::Model>, ServiceError> {
    let order = state
        .services
        .orders
        .transition(id, request.target, request.context)
        .await?;
    Ok(Json(order))
}

// POST /api/v1/orders/:id/payments
pub async fn record_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<PaymentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    request.validate()?;
    let receipt = state
        .services
        .payments
        .record_payment(id, request.amount, request.method, request.note, request.actor)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

// POST /api/v1/orders/:id/refunds
pub async fn record_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<PaymentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    request.validate()?;
    let receipt = state
        .services
        .payments
        .record_refund(id, request.amount, request.method, request.note, request.actor)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

// POST /api/v1/orders/:id/coupon
pub async fn apply_coupon(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CouponRequest>,
) -> Result<Json<CouponApplied>, ServiceError> {
    let discount = state
        .services
        .promotions
        .apply_coupon(id, request.coupon_id)
        .await?;
    Ok(Json(CouponApplied {
        order_id: id,
        discount,
    }))
}

// POST /api/v1/orders/:id/shipment
pub async fn create_shipment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let booking = state.services.carriers.create_shipment(id).await?;
    let status = if booking.already_booked {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(booking)))
}

// POST /api/v1/orders/:id/returns
pub async fn submit_return(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(mut request): Json<ReturnRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    request.order_id = id;
    let outcome = state.services.returns.submit_return(request).await?;
    let status = if outcome.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

// POST /api/v1/orders/:id/exchanges
pub async fn submit_exchange(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(mut request): Json<ExchangeRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    request.order_id = id;
    let outcome = state.services.returns.submit_exchange(request).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

// POST /api/v1/orders/merge/preview
pub async fn preview_merge(
    State(state): State<AppState>,
    Json(request): Json<OrderIds>,
) -> Result<Json<MergePlan>, ServiceError> {
    Ok(Json(state.services.merges.preview(&request.order_ids).await?))
}

// POST /api/v1/orders/merge
pub async fn commit_merge(
    State(state): State<AppState>,
    Json(plan): Json<MergePlan>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state.services.merges.commit(plan).await?;
    let status = if outcome.status == SagaStatus::Completed {
        StatusCode::CREATED
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(outcome)))
}

// POST /api/v1/orders/merge/:saga_id/resume
pub async fn resume_merge(
    State(state): State<AppState>,
    Path(saga_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(state.services.merges.resume(saga_id).await?))
}

// POST /api/v1/orders/merge/:saga_id/compensate
pub async fn compensate_merge(
    State(state): State<AppState>,
    Path(saga_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(state.services.merges.compensate(saga_id).await?))
}

// POST /api/v1/orders/dispatch
pub async fn dispatch_orders(
    State(state): State<AppState>,
    Json(request): Json<OrderIds>,
) -> Result<impl IntoResponse, ServiceError> {
    let report = state.services.dispatch.dispatch(&request.order_ids).await?;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

// GET /api/v1/orders/dispatch/:saga_id
pub async fn dispatch_report(
    State(state): State<AppState>,
    Path(saga_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(state.services.dispatch.report(saga_id).await?))
}

// POST /api/v1/orders/dispatch/:saga_id/resume
pub async fn resume_dispatch(
    State(state): State<AppState>,
    Path(saga_id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    Ok(Json(state.services.dispatch.resume(saga_id).await?))
}
