use std::sync::Arc;

use futures::stream::{self, StreamExt};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::entities::saga_log::{SagaKind, SagaStatus};
use crate::entities::saga_step::StepStatus;
use crate::errors::ServiceError;
use crate::saga::{self, SagaState};
use crate::services::carriers::CarrierGateway;

fn step_key(order_id: Uuid) -> String {
    format!("dispatch:{}", order_id)
}

/// Per-order result of a bulk dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Shipped { tracking_number: String },
    Failed { kind: String, message: String },
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub order_id: Uuid,
    #[serde(flatten)]
    pub outcome: DispatchOutcome,
}

/// Outcome of a batch, one entry per order in submission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReport {
    pub saga_id: Uuid,
    pub status: SagaStatus,
    pub results: Vec<DispatchResult>,
}

impl DispatchReport {
    pub fn shipped(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, DispatchOutcome::Shipped { .. }))
            .count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &DispatchResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, DispatchOutcome::Failed { .. }))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StepFailure {
    kind: String,
    message: String,
}

/// Books shipments for many orders with bounded parallelism. One order failing
/// never stops the others; every result is persisted as a saga step.
#[derive(Clone)]
pub struct BulkDispatchCoordinator {
    db_pool: Arc<DatabaseConnection>,
    gateway: CarrierGateway,
    concurrency: usize,
}

impl BulkDispatchCoordinator {
    pub fn new(db_pool: Arc<DatabaseConnection>, gateway: CarrierGateway, concurrency: usize) -> Self {
        Self {
            db_pool,
            gateway,
            concurrency: concurrency.max(1),
        }
    }

    #[instrument(skip(self, order_ids), fields(orders = order_ids.len()))]
    pub async fn dispatch(&self, order_ids: &[Uuid]) -> Result<DispatchReport, ServiceError> {
        let mut orders: Vec<Uuid> = Vec::with_capacity(order_ids.len());
        for id in order_ids {
            if !orders.contains(id) {
                orders.push(*id);
            }
        }
        if orders.is_empty() {
            return Err(ServiceError::ValidationError(
                "no orders to dispatch".to_string(),
            ));
        }

        let saga = saga::start(&*self.db_pool, SagaKind::BulkDispatch, &orders).await?;
        let positioned: Vec<(i32, Uuid)> = (0..).zip(orders.iter().copied()).collect();
        self.run(saga.id, &positioned).await?;
        self.report(saga.id).await
    }

    /// Retries every order of the batch that has not shipped yet.
    #[instrument(skip(self))]
    pub async fn resume(&self, saga_id: Uuid) -> Result<DispatchReport, ServiceError> {
        let state = self.load(saga_id).await?;
        let orders: Vec<Uuid> = state.plan()?;
        let pending: Vec<(i32, Uuid)> = (0..)
            .zip(orders)
            .filter(|(_, id)| !state.is_done(&step_key(*id)))
            .collect();

        if !pending.is_empty() {
            saga::set_status(&*self.db_pool, saga_id, SagaStatus::Running, None).await?;
            self.run(saga_id, &pending).await?;
        }
        self.report(saga_id).await
    }

    pub async fn report(&self, saga_id: Uuid) -> Result<DispatchReport, ServiceError> {
        let state = self.load(saga_id).await?;
        let orders: Vec<Uuid> = state.plan()?;
        let results = orders
            .into_iter()
            .map(|order_id| DispatchResult {
                order_id,
                outcome: outcome_of(&state, order_id),
            })
            .collect();

        Ok(DispatchReport {
            saga_id,
            status: state.saga.status,
            results,
        })
    }

    async fn load(&self, saga_id: Uuid) -> Result<SagaState, ServiceError> {
        let state = saga::load(&*self.db_pool, saga_id).await?;
        if state.saga.kind != SagaKind::BulkDispatch {
            return Err(ServiceError::ValidationError(format!(
                "saga {} is not a bulk dispatch",
                saga_id
            )));
        }
        Ok(state)
    }

    /// Dispatches `(position in plan, order id)` pairs.
    async fn run(&self, saga_id: Uuid, orders: &[(i32, Uuid)]) -> Result<(), ServiceError> {
        // Each order persists its own step so no connection is held by a
        // future the stream is not polling.
        let results: Vec<(Uuid, Result<bool, ServiceError>)> = stream::iter(orders.iter().copied())
            .map(|(sequence, order_id)| async move {
                (order_id, self.dispatch_one(saga_id, sequence, order_id).await)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut failures = 0usize;
        for (order_id, result) in results {
            match result {
                Ok(true) => {}
                Ok(false) => failures += 1,
                Err(err) => {
                    // The step stays unrecorded, so the order reads as pending and resume retries it.
                    error!(%saga_id, %order_id, error = %err, "could not record dispatch result");
                    failures += 1;
                }
            }
        }

        let state = saga::load(&*self.db_pool, saga_id).await?;
        let plan: Vec<Uuid> = state.plan()?;
        let all_done = plan.iter().all(|id| state.is_done(&step_key(*id)));
        let status = if all_done {
            SagaStatus::Completed
        } else {
            SagaStatus::Failed
        };
        let last_error = (!all_done).then(|| format!("{} order(s) failed to dispatch", failures));
        saga::set_status(&*self.db_pool, saga_id, status, last_error).await?;

        info!(%saga_id, attempted = orders.len(), failures, "bulk dispatch finished");
        Ok(())
    }

    /// Books one order and records the result. `Ok(false)` is a recorded failure.
    async fn dispatch_one(
        &self,
        saga_id: Uuid,
        sequence: i32,
        order_id: Uuid,
    ) -> Result<bool, ServiceError> {
        let key = step_key(order_id);
        match self.gateway.create_shipment(order_id).await {
            Ok(booking) => {
                saga::record_step_at(
                    &*self.db_pool,
                    saga_id,
                    &key,
                    sequence,
                    StepStatus::Done,
                    Some(booking.tracking_number),
                    None,
                )
                .await?;
                Ok(true)
            }
            Err(err) => {
                warn!(%saga_id, %order_id, error = %err, "order dispatch failed");
                let failure = StepFailure {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                };
                saga::record_step_at(
                    &*self.db_pool,
                    saga_id,
                    &key,
                    sequence,
                    StepStatus::Failed,
                    None,
                    Some(serde_json::to_string(&failure)?),
                )
                .await?;
                Ok(false)
            }
        }
    }
}

fn outcome_of(state: &SagaState, order_id: Uuid) -> DispatchOutcome {
    let Some(step) = state.step(&step_key(order_id)) else {
        return DispatchOutcome::Pending;
    };
    match step.status {
        StepStatus::Done => DispatchOutcome::Shipped {
            tracking_number: step.output.clone().unwrap_or_default(),
        },
        StepStatus::Failed => {
            let failure = step
                .error
                .as_deref()
                .and_then(|raw| serde_json::from_str::<StepFailure>(raw).ok())
                .unwrap_or_else(|| StepFailure {
                    kind: "unknown".to_string(),
                    message: step.error.clone().unwrap_or_default(),
                });
            DispatchOutcome::Failed {
                kind: failure.kind,
                message: failure.message,
            }
        }
        _ => DispatchOutcome::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn results_serialize_flat() {
        let result = DispatchResult {
            order_id: Uuid::nil(),
            outcome: DispatchOutcome::Failed {
                kind: "missing_phone".into(),
                message: "Recipient phone number is missing".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "order_id": Uuid::nil(),
                "outcome": "failed",
                "kind": "missing_phone",
                "message": "Recipient phone number is missing"
            })
        );
    }
}
