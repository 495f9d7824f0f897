use async_trait::async_trait;
use uuid::Uuid;

use crate::models::plan_history::{NewPlanHistory, PlanHistory};

/// Append-only ledger. There is deliberately no update or delete.
#[async_trait]
pub trait PlanHistoryRepository: Send + Sync {
    async fn append_entry(&self, entry: NewPlanHistory) -> Result<PlanHistory, sqlx::Error>;

    /// Newest first.
    async fn list_entries_for_user(&self, user_id: Uuid) -> Result<Vec<PlanHistory>, sqlx::Error>;
}
