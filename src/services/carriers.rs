use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::activity::{Activity, ActivityLog};
use crate::cache::TtlCache;
use crate::config::CarrierConfig;
use crate::entities::cod_reconciliation::{self, CodStatus};
use crate::entities::order::{self, OrderStatus, ShippingStatus};
use crate::entities::product;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::records::{find_order, find_order_lines, save_order};

/// Parcel weight assumed per unit when the catalog carries none.
pub const DEFAULT_UNIT_WEIGHT_GRAMS: i32 = 500;

const STATUS_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub province_id: i32,
    pub district_id: i32,
    pub ward_code: String,
    pub street: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentItem {
    pub name: String,
    pub quantity: i32,
}

/// Everything the carrier needs to book a pickup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentRequest {
    /// Our order number; carriers reject a second booking with the same code.
    pub client_order_code: String,
    pub recipient_name: String,
    pub recipient_phone: String,
    pub address: Address,
    pub cod_amount: Decimal,
    pub insurance_value: Decimal,
    pub weight_grams: i32,
    pub items: Vec<ShipmentItem>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub to_district_id: i32,
    pub to_ward_code: String,
    pub weight_grams: i32,
    pub insurance_value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarrierOrder {
    pub tracking_number: String,
    pub fee: Option<Decimal>,
    pub expected_delivery: Option<DateTime<Utc>>,
}

/// Raw tracking state as the carrier reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarrierStatus {
    pub tracking_number: String,
    pub status_code: String,
    pub status_text: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Province {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct District {
    pub id: i32,
    pub province_id: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ward {
    pub code: String,
    pub district_id: i32,
    pub name: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CarrierError {
    /// The carrier understood the request and refused it.
    #[error("carrier rejected request: {0}")]
    Rejected(String),
    #[error("carrier unreachable: {0}")]
    Transport(String),
    #[error("carrier request timed out")]
    Timeout,
    #[error("unexpected carrier response: {0}")]
    InvalidResponse(String),
}

impl From<CarrierError> for ServiceError {
    fn from(err: CarrierError) -> Self {
        match err {
            CarrierError::Rejected(reason) => ServiceError::CarrierRejected(reason),
            other => ServiceError::ExternalServiceError(other.to_string()),
        }
    }
}

/// Capability over one shipping carrier's API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CarrierClient: Send + Sync {
    async fn quote(&self, request: &QuoteRequest) -> Result<Decimal, CarrierError>;
    async fn create_order(&self, request: &ShipmentRequest) -> Result<CarrierOrder, CarrierError>;
    async fn get_tracking(&self, tracking_number: &str) -> Result<CarrierStatus, CarrierError>;
    async fn provinces(&self) -> Result<Vec<Province>, CarrierError>;
    async fn districts(&self, province_id: i32) -> Result<Vec<District>, CarrierError>;
    async fn wards(&self, district_id: i32) -> Result<Vec<Ward>, CarrierError>;
}

/// Carrier status codes grouped by what they mean for the parcel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CarrierStatusClass {
    Pickup,
    Transit,
    Delivered,
    Failure,
    Return,
}

impl CarrierStatusClass {
    pub fn from_code(code: &str) -> Option<Self> {
        let class = match code.trim().to_ascii_lowercase().as_str() {
            "ready_to_pick" | "picking" | "money_collect_picking" | "picked" | "storing" => {
                Self::Pickup
            }
            "transporting" | "sorting" | "delivering" | "money_collect_delivering" => {
                Self::Transit
            }
            "delivered" => Self::Delivered,
            "delivery_fail" | "lost" | "damage" | "exception" => Self::Failure,
            "waiting_to_return" | "return" | "return_transporting" | "return_sorting"
            | "returning" | "returned" => Self::Return,
            _ => return None,
        };
        Some(class)
    }

    pub fn shipping_status(self) -> ShippingStatus {
        match self {
            Self::Pickup => ShippingStatus::Shipped,
            Self::Transit => ShippingStatus::InTransit,
            Self::Delivered => ShippingStatus::Delivered,
            Self::Failure => ShippingStatus::DeliveryFailed,
            Self::Return => ShippingStatus::ReturnedToSender,
        }
    }
}

/// Inbound status callback body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarrierWebhook {
    pub tracking_number: String,
    pub status_code: String,
    #[serde(default)]
    pub status_text: Option<String>,
}

/// What a status update did to the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied {
        order_id: Uuid,
        from: ShippingStatus,
        to: ShippingStatus,
    },
    /// The order is already in the mapped state.
    Duplicate { order_id: Uuid },
    /// The mapped state is behind the current one (late or reordered callback).
    Stale {
        order_id: Uuid,
        current: ShippingStatus,
        reported: ShippingStatus,
    },
    Unmapped { status_code: String },
    UnknownTracking { tracking_number: String },
    /// The order was cancelled or returned; carrier news no longer moves it.
    Closed {
        order_id: Uuid,
        order_status: OrderStatus,
    },
}

/// Province/district/ward lookups, cached for the configured TTL.
#[derive(Clone)]
pub struct AddressDirectory {
    client: Arc<dyn CarrierClient>,
    provinces: TtlCache<(), Vec<Province>>,
    districts: TtlCache<i32, Vec<District>>,
    wards: TtlCache<i32, Vec<Ward>>,
}

impl AddressDirectory {
    pub fn new(client: Arc<dyn CarrierClient>, ttl: std::time::Duration) -> Self {
        Self {
            client,
            provinces: TtlCache::new(ttl),
            districts: TtlCache::new(ttl),
            wards: TtlCache::new(ttl),
        }
    }

    pub async fn provinces(&self) -> Result<Vec<Province>, ServiceError> {
        let client = self.client.clone();
        Ok(self
            .provinces
            .get_or_try_insert_with((), || async move { client.provinces().await })
            .await?)
    }

    pub async fn districts(&self, province_id: i32) -> Result<Vec<District>, ServiceError> {
        let client = self.client.clone();
        Ok(self
            .districts
            .get_or_try_insert_with(province_id, || async move {
                client.districts(province_id).await
            })
            .await?)
    }

    pub async fn wards(&self, district_id: i32) -> Result<Vec<Ward>, ServiceError> {
        let client = self.client.clone();
        Ok(self
            .wards
            .get_or_try_insert_with(district_id, || async move { client.wards(district_id).await })
            .await?)
    }

    /// Drops every cached lookup, e.g. after the carrier publishes new boundaries.
    pub fn invalidate(&self) {
        self.provinces.clear();
        self.districts.clear();
        self.wards.clear();
    }
}

/// Result of booking a shipment.
#[derive(Debug, Clone, Serialize)]
pub struct ShipmentBooking {
    pub tracking_number: String,
    pub fee: Option<Decimal>,
    /// `true` when the order already had a tracking number and the carrier was not called.
    pub already_booked: bool,
    pub order: order::Model,
}

pub fn cod_amount_for(order: &order::Model) -> Decimal {
    if order.cod_enabled {
        (order.total_amount - order.paid_amount).max(Decimal::ZERO)
    } else {
        Decimal::ZERO
    }
}

fn destination(order: &order::Model) -> Result<Address, ServiceError> {
    let province_id = order
        .province_id
        .ok_or_else(|| ServiceError::MissingAddress("province".to_string()))?;
    let district_id = order
        .district_id
        .ok_or_else(|| ServiceError::MissingAddress("district".to_string()))?;
    let ward_code = order
        .ward_code
        .clone()
        .filter(|w| !w.trim().is_empty())
        .ok_or_else(|| ServiceError::MissingAddress("ward".to_string()))?;

    Ok(Address {
        province_id,
        district_id,
        ward_code,
        street: order.street.clone(),
    })
}

/// Boundary to the shipping carrier: bookings, quotes, tracking and status callbacks.
#[derive(Clone)]
pub struct CarrierGateway {
    db_pool: Arc<DatabaseConnection>,
    client: Arc<dyn CarrierClient>,
    carrier_name: String,
    directory: AddressDirectory,
    event_sender: EventSender,
    activity: ActivityLog,
}

impl CarrierGateway {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        client: Arc<dyn CarrierClient>,
        config: &CarrierConfig,
        event_sender: EventSender,
    ) -> Self {
        let directory = AddressDirectory::new(client.clone(), config.address_cache_ttl());
        let activity = ActivityLog::new(db_pool.clone());
        Self {
            db_pool,
            client,
            carrier_name: config.name.clone(),
            directory,
            event_sender,
            activity,
        }
    }

    pub fn directory(&self) -> &AddressDirectory {
        &self.directory
    }

    pub fn carrier_name(&self) -> &str {
        &self.carrier_name
    }

    pub async fn quote(&self, request: &QuoteRequest) -> Result<Decimal, ServiceError> {
        Ok(self.client.quote(request).await?)
    }

    /// Shipping fee for an order's destination and contents.
    pub async fn quote_for_order(&self, order_id: Uuid) -> Result<Decimal, ServiceError> {
        let db = &*self.db_pool;
        let order = find_order(db, order_id).await?;
        let address = destination(&order)?;
        let units: i32 = find_order_lines(db, order_id).await?.iter().map(|l| l.quantity).sum();

        self.quote(&QuoteRequest {
            to_district_id: address.district_id,
            to_ward_code: address.ward_code,
            weight_grams: units.max(1) * DEFAULT_UNIT_WEIGHT_GRAMS,
            insurance_value: order.subtotal,
        })
        .await
    }

    async fn shipment_request(&self, order: &order::Model) -> Result<ShipmentRequest, ServiceError> {
        let address = destination(order)?;
        let phone = order
            .customer_phone
            .clone()
            .filter(|p| !p.trim().is_empty())
            .ok_or(ServiceError::MissingPhone)?;

        let db = &*self.db_pool;
        let lines = find_order_lines(db, order.id).await?;
        let mut items = Vec::with_capacity(lines.len());
        for line in &lines {
            let name = product::Entity::find_by_id(line.product_id)
                .one(db)
                .await?
                .map(|p| p.name)
                .unwrap_or_else(|| line.product_id.to_string());
            items.push(ShipmentItem {
                name,
                quantity: line.quantity,
            });
        }
        let units: i32 = lines.iter().map(|l| l.quantity).sum();

        Ok(ShipmentRequest {
            client_order_code: order.order_number.clone(),
            recipient_name: order.recipient_name.clone().unwrap_or_else(|| phone.clone()),
            recipient_phone: phone,
            address,
            cod_amount: cod_amount_for(order),
            insurance_value: order.subtotal,
            weight_grams: units.max(1) * DEFAULT_UNIT_WEIGHT_GRAMS,
            items,
            note: order.note.clone(),
        })
    }

    /// Books the parcel with the carrier and moves the order to `shipped`.
    /// An order that already carries a tracking number is returned as is.
    #[instrument(skip(self))]
    pub async fn create_shipment(&self, order_id: Uuid) -> Result<ShipmentBooking, ServiceError> {
        let order = find_order(&*self.db_pool, order_id).await?;
        if let Some(tracking_number) = order.tracking_number.clone() {
            return Ok(ShipmentBooking {
                tracking_number,
                fee: None,
                already_booked: true,
                order,
            });
        }

        if !matches!(order.order_status, OrderStatus::Confirmed | OrderStatus::Completed) {
            return Err(ServiceError::InvalidOperation(format!(
                "only confirmed or completed orders can ship, order {} is {}",
                order.order_number, order.order_status
            )));
        }
        if !order
            .shipping_status
            .can_advance_to(ShippingStatus::Shipped, false)
        {
            return Err(ServiceError::invalid_transition(
                order.shipping_status,
                ShippingStatus::Shipped,
            ));
        }

        let request = self.shipment_request(&order).await?;
        let booked = self.client.create_order(&request).await.map_err(|e| {
            warn!(%order_id, error = %e, "carrier booking failed");
            ServiceError::from(e)
        })?;

        let txn = self.db_pool.begin().await?;
        let current = find_order(&txn, order_id).await?;
        if let Some(existing) = current.tracking_number.clone() {
            warn!(%order_id, kept = %existing, discarded = %booked.tracking_number, "order was booked concurrently");
            return Ok(ShipmentBooking {
                tracking_number: existing,
                fee: None,
                already_booked: true,
                order: current,
            });
        }

        let cod_amount = cod_amount_for(&current);
        let from = current.shipping_status;
        let updated = save_order(&txn, &current, |active| {
            active.tracking_number = Set(Some(booked.tracking_number.clone()));
            active.carrier = Set(Some(self.carrier_name.clone()));
            active.shipping_status = Set(ShippingStatus::Shipped);
            active.cod_amount = Set(cod_amount);
        })
        .await?;

        if cod_amount > Decimal::ZERO {
            let existing = cod_reconciliation::Entity::find()
                .filter(cod_reconciliation::Column::OrderId.eq(order_id))
                .one(&txn)
                .await?;
            if existing.is_none() {
                cod_reconciliation::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    order_id: Set(order_id),
                    tracking_number: Set(booked.tracking_number.clone()),
                    carrier: Set(self.carrier_name.clone()),
                    amount: Set(cod_amount),
                    status: Set(CodStatus::Pending),
                    created_at: Set(Utc::now()),
                }
                .insert(&txn)
                .await?;
            }
        }
        txn.commit().await?;

        info!(
            %order_id,
            tracking_number = %booked.tracking_number,
            %cod_amount,
            "shipment created"
        );

        self.event_sender
            .send_or_log(Event::ShipmentCreated {
                order_id,
                tracking_number: booked.tracking_number.clone(),
            })
            .await;
        self.event_sender
            .send_or_log(Event::ShippingStatusChanged {
                order_id,
                old_status: from,
                new_status: ShippingStatus::Shipped,
            })
            .await;
        self.activity
            .record(
                Activity::order(updated.tenant_id, order_id, "shipment_created")
                    .with_detail(format!("{} via {}", booked.tracking_number, self.carrier_name)),
            )
            .await;

        Ok(ShipmentBooking {
            tracking_number: booked.tracking_number,
            fee: booked.fee,
            already_booked: false,
            order: updated,
        })
    }

    /// Records a parcel booked outside the system. Shipping status is left to
    /// the carrier's callbacks.
    pub async fn attach_tracking(
        &self,
        order_id: Uuid,
        tracking_number: &str,
        carrier: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let tracking_number = tracking_number.trim();
        if tracking_number.is_empty() {
            return Err(ServiceError::ValidationError(
                "tracking number must not be empty".to_string(),
            ));
        }

        let txn = self.db_pool.begin().await?;
        let order = find_order(&txn, order_id).await?;
        match order.tracking_number.as_deref() {
            Some(existing) if existing == tracking_number => return Ok(order),
            Some(existing) => {
                return Err(ServiceError::InvalidOperation(format!(
                    "order {} already tracks parcel {}",
                    order.order_number, existing
                )))
            }
            None => {}
        }

        let carrier = carrier.unwrap_or_else(|| self.carrier_name.clone());
        let updated = save_order(&txn, &order, |active| {
            active.tracking_number = Set(Some(tracking_number.to_string()));
            active.carrier = Set(Some(carrier));
        })
        .await?;
        txn.commit().await?;

        info!(%order_id, %tracking_number, "tracking number attached");
        Ok(updated)
    }

    pub async fn fetch_status(&self, tracking_number: &str) -> Result<CarrierStatus, ServiceError> {
        Ok(self.client.get_tracking(tracking_number).await?)
    }

    pub fn map_status(&self, status_code: &str) -> Option<ShippingStatus> {
        CarrierStatusClass::from_code(status_code).map(CarrierStatusClass::shipping_status)
    }

    /// Applies a carrier callback. Replays and out-of-order deliveries are
    /// reported, never applied twice or backwards.
    #[instrument(skip(self, payload), fields(tracking_number = %payload.tracking_number, status_code = %payload.status_code))]
    pub async fn apply_webhook(&self, payload: &CarrierWebhook) -> Result<WebhookOutcome, ServiceError> {
        let order = order::Entity::find()
            .filter(order::Column::TrackingNumber.eq(payload.tracking_number.as_str()))
            .one(&*self.db_pool)
            .await?;
        let Some(order) = order else {
            warn!("webhook for unknown tracking number");
            return Ok(WebhookOutcome::UnknownTracking {
                tracking_number: payload.tracking_number.clone(),
            });
        };

        self.apply_status(order.id, &payload.status_code, payload.status_text.as_deref())
            .await
    }

    /// Pulls the carrier's current status and applies it like a callback.
    pub async fn sync_tracking(&self, order_id: Uuid) -> Result<WebhookOutcome, ServiceError> {
        let order = find_order(&*self.db_pool, order_id).await?;
        let tracking_number = order.tracking_number.clone().ok_or_else(|| {
            ServiceError::InvalidOperation(format!(
                "order {} has no tracking number",
                order.order_number
            ))
        })?;

        let status = self.fetch_status(&tracking_number).await?;
        self.apply_status(order_id, &status.status_code, status.status_text.as_deref())
            .await
    }

    async fn apply_status(
        &self,
        order_id: Uuid,
        status_code: &str,
        status_text: Option<&str>,
    ) -> Result<WebhookOutcome, ServiceError> {
        let Some(reported) = self.map_status(status_code) else {
            warn!(%order_id, status_code, ?status_text, "ignoring unmapped carrier status");
            return Ok(WebhookOutcome::Unmapped {
                status_code: status_code.to_string(),
            });
        };

        let mut attempt = 0;
        let (order, from) = loop {
            attempt += 1;
            let current = find_order(&*self.db_pool, order_id).await?;
            let from = current.shipping_status;

            if current.order_status.is_terminal() {
                info!(%order_id, order_status = %current.order_status, %reported, "carrier status for a closed order");
                return Ok(WebhookOutcome::Closed {
                    order_id,
                    order_status: current.order_status,
                });
            }
            if from == reported {
                return Ok(WebhookOutcome::Duplicate { order_id });
            }
            // A tracked parcel is with the carrier even before pickup is reported.
            let correction_from_tracked = reported.is_correction()
                && current.tracking_number.is_some()
                && matches!(from, ShippingStatus::Pending | ShippingStatus::Packing);
            if !correction_from_tracked && !from.can_advance_to(reported, false) {
                info!(%order_id, current = %from, %reported, "stale carrier status");
                return Ok(WebhookOutcome::Stale {
                    order_id,
                    current: from,
                    reported,
                });
            }

            match save_order(&*self.db_pool, &current, |active| {
                active.shipping_status = Set(reported);
            })
            .await
            {
                Ok(updated) => break (updated, from),
                Err(ServiceError::ConcurrentModification(_)) if attempt < STATUS_WRITE_ATTEMPTS => {
                    continue
                }
                Err(err) => return Err(err),
            }
        };

        info!(%order_id, %from, to = %reported, status_code, "shipping status updated from carrier");

        self.event_sender
            .send_or_log(Event::ShippingStatusChanged {
                order_id,
                old_status: from,
                new_status: reported,
            })
            .await;
        if reported == ShippingStatus::Delivered {
            self.event_sender
                .send_or_log(Event::OrderDelivered {
                    order_id,
                    tracking_number: order.tracking_number.clone(),
                })
                .await;
        }
        self.activity
            .record(
                Activity::order(order.tenant_id, order_id, "shipping_status_changed")
                    .with_detail(format!("{} -> {} ({})", from.label(), reported.label(), status_code))
                    .with_actor(Some(self.carrier_name.clone())),
            )
            .await;

        Ok(WebhookOutcome::Applied {
            order_id,
            from,
            to: reported,
        })
    }
}
