//! Retail Fulfillment
//!
//! Order fulfillment engine for multi-tenant retail: order lifecycle across
//! three status dimensions, a per-warehouse stock ledger with combo products,
//! payment and loyalty ledgers, carrier dispatch, returns, exchanges and merges.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod activity;
pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod saga;
pub mod services;

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::events::EventSender;
use crate::services::carriers::CarrierClient;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: EventSender,
    pub services: handlers::AppServices,
}

impl AppState {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: config::AppConfig,
        event_sender: EventSender,
        carrier_client: Arc<dyn CarrierClient>,
    ) -> Self {
        let services =
            handlers::AppServices::new(db.clone(), event_sender.clone(), carrier_client, &config);
        Self {
            db,
            config: Arc::new(config),
            event_sender,
            services,
        }
    }
}
