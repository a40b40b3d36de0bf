use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::entities::activity_log;

/// One audit row, e.g. `("order", id, "confirmed")`.
#[derive(Debug, Clone)]
pub struct Activity {
    pub tenant_id: Option<Uuid>,
    pub entity_type: &'static str,
    pub entity_id: Uuid,
    pub action: String,
    pub detail: Option<String>,
    pub actor: Option<String>,
}

impl Activity {
    pub fn order(tenant_id: Uuid, order_id: Uuid, action: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            entity_type: "order",
            entity_id: order_id,
            action: action.into(),
            detail: None,
            actor: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }
}

/// Append-only audit sink. Writes happen after the business transaction
/// committed and never fail the caller.
#[derive(Clone)]
pub struct ActivityLog {
    db: Arc<DatabaseConnection>,
}

impl ActivityLog {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn record(&self, activity: Activity) {
        let row = activity_log::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(activity.tenant_id),
            entity_type: Set(activity.entity_type.to_string()),
            entity_id: Set(activity.entity_id),
            action: Set(activity.action.clone()),
            detail: Set(activity.detail),
            actor: Set(activity.actor),
            created_at: Set(Utc::now()),
        };

        if let Err(e) = row.insert(&*self.db).await {
            warn!(
                entity_id = %activity.entity_id,
                action = %activity.action,
                error = %e,
                "failed to write activity log"
            );
        }
    }
}
