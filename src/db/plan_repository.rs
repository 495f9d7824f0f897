use async_trait::async_trait;

use crate::models::plan::Plan;

/// Persisted plan catalog. Read-only from the settlement engine's side.
#[async_trait]
pub trait PlanRepository: Send + Sync {
    async fn find_plan_by_id(&self, plan_id: &str) -> Result<Option<Plan>, sqlx::Error>;

    /// Matches a tier name or a display name, case-insensitively.
    async fn find_plan_by_label(&self, label: &str) -> Result<Option<Plan>, sqlx::Error>;

    async fn list_active_plans(&self) -> Result<Vec<Plan>, sqlx::Error>;
}
