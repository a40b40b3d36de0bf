pub mod orders;
pub mod webhooks;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::services::{
    bulk_dispatch::BulkDispatchCoordinator, carriers::CarrierClient, carriers::CarrierGateway,
    inventory::InventoryService, loyalty::LoyaltyService, order_merge::OrderMergeService,
    orders::OrderService, payments::PaymentService, promotions::PromotionService,
    returns::ReturnService,
};

pub use crate::AppState;

/// Services layer used by the HTTP handlers.
#[derive(Clone)]
pub struct AppServices {
    pub orders: OrderService,
    pub inventory: InventoryService,
    pub payments: PaymentService,
    pub promotions: PromotionService,
    pub loyalty: LoyaltyService,
    pub carriers: CarrierGateway,
    pub returns: ReturnService,
    pub merges: OrderMergeService,
    pub dispatch: BulkDispatchCoordinator,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        carrier_client: Arc<dyn CarrierClient>,
        config: &AppConfig,
    ) -> Self {
        let carriers = CarrierGateway::new(
            db_pool.clone(),
            carrier_client,
            &config.carrier,
            event_sender.clone(),
        );

        Self {
            orders: OrderService::new(db_pool.clone(), event_sender.clone(), config.loyalty.clone()),
            inventory: InventoryService::new(db_pool.clone(), event_sender.clone()),
            payments: PaymentService::new(db_pool.clone(), event_sender.clone()),
            promotions: PromotionService::new(db_pool.clone()),
            loyalty: LoyaltyService::new(db_pool.clone(), config.loyalty.clone()),
            returns: ReturnService::new(db_pool.clone(), event_sender.clone(), config.loyalty.clone()),
            merges: OrderMergeService::new(db_pool.clone(), event_sender, config.loyalty.clone()),
            dispatch: BulkDispatchCoordinator::new(
                db_pool,
                carriers.clone(),
                config.dispatch_concurrency,
            ),
            carriers,
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Full HTTP surface with request tracing.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/orders", post(orders::create_order))
        .route("/orders/merge/preview", post(orders::preview_merge))
        .route("/orders/merge", post(orders::commit_merge))
        .route("/orders/merge/:saga_id/resume", post(orders::resume_merge))
        .route("/orders/merge/:saga_id/compensate", post(orders::compensate_merge))
        .route("/orders/dispatch", post(orders::dispatch_orders))
        .route("/orders/dispatch/:saga_id", get(orders::dispatch_report))
        .route("/orders/dispatch/:saga_id/resume", post(orders::resume_dispatch))
        .route("/orders/:id", get(orders::get_order))
        .route("/orders/:id/transitions", post(orders::transition_order))
        .route("/orders/:id/payments", post(orders::record_payment))
        .route("/orders/:id/refunds", post(orders::record_refund))
        .route("/orders/:id/coupon", post(orders::apply_coupon))
        .route("/orders/:id/shipment", post(orders::create_shipment))
        .route("/orders/:id/returns", post(orders::submit_return))
        .route("/orders/:id/exchanges", post(orders::submit_exchange))
        .route("/webhooks/carrier", post(webhooks::carrier_webhook));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
