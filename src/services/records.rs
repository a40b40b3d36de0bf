//! Row access shared by the services. Every helper is generic over the
//! connection so it runs equally on the pool or inside a transaction.

use chrono::Utc;
use sea_orm::{
    ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

use crate::entities::{order, order_line};
use crate::errors::ServiceError;

pub async fn find_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<order::Model, ServiceError> {
    order::Entity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

pub async fn find_order_by_number<C: ConnectionTrait>(
    conn: &C,
    tenant_id: Uuid,
    order_number: &str,
) -> Result<Option<order::Model>, ServiceError> {
    Ok(order::Entity::find()
        .filter(order::Column::TenantId.eq(tenant_id))
        .filter(order::Column::OrderNumber.eq(order_number))
        .one(conn)
        .await?)
}

pub async fn find_order_lines<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<order_line::Model>, ServiceError> {
    Ok(order_line::Entity::find()
        .filter(order_line::Column::OrderId.eq(order_id))
        .order_by_asc(order_line::Column::CreatedAt)
        .all(conn)
        .await?)
}

/// Writes the columns `mutate` sets, guarded by the version `current` was read at.
/// A lost race surfaces as `ConcurrentModification`.
pub async fn save_order<C, F>(
    conn: &C,
    current: &order::Model,
    mutate: F,
) -> Result<order::Model, ServiceError>
where
    C: ConnectionTrait,
    F: FnOnce(&mut order::ActiveModel),
{
    let mut active: order::ActiveModel = current.clone().into();
    mutate(&mut active);
    active.version = Set(current.version + 1);
    active.updated_at = Set(Utc::now());

    let result = order::Entity::update_many()
        .set(active)
        .filter(order::Column::Id.eq(current.id))
        .filter(order::Column::Version.eq(current.version))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        tracing::warn!(order_id = %current.id, version = current.version, "order version moved underneath write");
        return Err(ServiceError::ConcurrentModification(current.id));
    }

    find_order(conn, current.id).await
}

/// Appends `line` to an existing note, one entry per line.
pub fn append_note(existing: Option<&str>, line: &str) -> String {
    match existing {
        Some(note) if !note.trim().is_empty() => format!("{}\n{}", note, line),
        _ => line.to_string(),
    }
}
