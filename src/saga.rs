//! Durable saga log. Every step outcome is persisted before the next step runs,
//! so an interrupted saga can be resumed or compensated from the rows alone.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::entities::saga_log::{self, SagaKind, SagaStatus};
use crate::entities::saga_step::{self, StepStatus};
use crate::errors::ServiceError;

/// A saga row with its steps in execution order.
#[derive(Debug, Clone)]
pub struct SagaState {
    pub saga: saga_log::Model,
    pub steps: Vec<saga_step::Model>,
}

impl SagaState {
    pub fn id(&self) -> Uuid {
        self.saga.id
    }

    pub fn plan<P: DeserializeOwned>(&self) -> Result<P, ServiceError> {
        Ok(serde_json::from_str(&self.saga.plan)?)
    }

    pub fn step(&self, key: &str) -> Option<&saga_step::Model> {
        self.steps.iter().find(|s| s.step_key == key)
    }

    pub fn is_done(&self, key: &str) -> bool {
        self.step(key)
            .map(|s| s.status == StepStatus::Done)
            .unwrap_or(false)
    }

    /// Finished steps, most recent first.
    pub fn done_steps_reversed(&self) -> Vec<&saga_step::Model> {
        self.steps
            .iter()
            .rev()
            .filter(|s| s.status == StepStatus::Done)
            .collect()
    }
}

pub async fn start<C, P>(conn: &C, kind: SagaKind, plan: &P) -> Result<saga_log::Model, ServiceError>
where
    C: ConnectionTrait,
    P: Serialize,
{
    let now = Utc::now();
    let saga = saga_log::ActiveModel {
        id: Set(Uuid::new_v4()),
        kind: Set(kind),
        status: Set(SagaStatus::Running),
        plan: Set(serde_json::to_string(plan)?),
        last_error: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?;

    tracing::info!(saga_id = %saga.id, kind = %kind, "saga started");
    Ok(saga)
}

pub async fn load<C: ConnectionTrait>(conn: &C, saga_id: Uuid) -> Result<SagaState, ServiceError> {
    let saga = saga_log::Entity::find_by_id(saga_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Saga {} not found", saga_id)))?;

    let steps = saga_step::Entity::find()
        .filter(saga_step::Column::SagaId.eq(saga_id))
        .order_by_asc(saga_step::Column::Sequence)
        .all(conn)
        .await?;

    Ok(SagaState { saga, steps })
}

/// Upserts the outcome of `step_key`. Call it on the same connection as the
/// step's own writes so both commit together.
pub async fn record_step<C: ConnectionTrait>(
    conn: &C,
    saga_id: Uuid,
    step_key: &str,
    status: StepStatus,
    output: Option<String>,
    error: Option<String>,
) -> Result<(), ServiceError> {
    upsert_step(conn, saga_id, step_key, None, status, output, error).await
}

/// Like [`record_step`], with the step's position fixed by the caller. Steps
/// recorded concurrently use this so positions never collide.
pub async fn record_step_at<C: ConnectionTrait>(
    conn: &C,
    saga_id: Uuid,
    step_key: &str,
    sequence: i32,
    status: StepStatus,
    output: Option<String>,
    error: Option<String>,
) -> Result<(), ServiceError> {
    upsert_step(conn, saga_id, step_key, Some(sequence), status, output, error).await
}

async fn upsert_step<C: ConnectionTrait>(
    conn: &C,
    saga_id: Uuid,
    step_key: &str,
    sequence: Option<i32>,
    status: StepStatus,
    output: Option<String>,
    error: Option<String>,
) -> Result<(), ServiceError> {
    let existing = saga_step::Entity::find()
        .filter(saga_step::Column::SagaId.eq(saga_id))
        .filter(saga_step::Column::StepKey.eq(step_key))
        .one(conn)
        .await?;

    match existing {
        Some(step) => {
            let mut active: saga_step::ActiveModel = step.into();
            active.status = Set(status);
            if output.is_some() {
                active.output = Set(output);
            }
            active.error = Set(error);
            active.updated_at = Set(Utc::now());
            active.update(conn).await?;
        }
        None => {
            let sequence = match sequence {
                Some(sequence) => sequence,
                None => saga_step::Entity::find()
                    .filter(saga_step::Column::SagaId.eq(saga_id))
                    .count(conn)
                    .await? as i32,
            };

            saga_step::ActiveModel {
                id: Set(Uuid::new_v4()),
                saga_id: Set(saga_id),
                step_key: Set(step_key.to_string()),
                sequence: Set(sequence),
                status: Set(status),
                output: Set(output),
                error: Set(error),
                updated_at: Set(Utc::now()),
            }
            .insert(conn)
            .await?;
        }
    }

    tracing::debug!(%saga_id, step = step_key, status = %status, "saga step recorded");
    Ok(())
}

pub async fn set_status<C: ConnectionTrait>(
    conn: &C,
    saga_id: Uuid,
    status: SagaStatus,
    last_error: Option<String>,
) -> Result<(), ServiceError> {
    let saga = saga_log::Entity::find_by_id(saga_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Saga {} not found", saga_id)))?;

    let mut active: saga_log::ActiveModel = saga.into();
    active.status = Set(status);
    active.last_error = Set(last_error);
    active.updated_at = Set(Utc::now());
    active.update(conn).await?;

    tracing::info!(%saga_id, status = %status, "saga status changed");
    Ok(())
}
