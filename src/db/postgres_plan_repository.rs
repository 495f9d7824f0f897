use async_trait::async_trait;
use sqlx::PgPool;

use crate::{db::plan_repository::PlanRepository, models::plan::Plan};

pub struct PostgresPlanRepository {
    pub pool: PgPool,
}

#[async_trait]
impl PlanRepository for PostgresPlanRepository {
    async fn find_plan_by_id(&self, plan_id: &str) -> Result<Option<Plan>, sqlx::Error> {
        sqlx::query_as::<_, Plan>("SELECT id, name, tier, price, active FROM plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn find_plan_by_label(&self, label: &str) -> Result<Option<Plan>, sqlx::Error> {
        // Tier matches win over display-name matches.
        sqlx::query_as::<_, Plan>(
            r#"
            SELECT id, name, tier, price, active
            FROM plans
            WHERE tier::text = lower($1) OR lower(name) = lower($1)
            ORDER BY (tier::text = lower($1)) DESC, active DESC, price ASC
            LIMIT 1
            "#,
        )
        .bind(label.trim())
        .fetch_optional(&self.pool)
        .await
    }

    async fn list_active_plans(&self) -> Result<Vec<Plan>, sqlx::Error> {
        sqlx::query_as::<_, Plan>(
            "SELECT id, name, tier, price, active FROM plans WHERE active ORDER BY price, id",
        )
        .fetch_all(&self.pool)
        .await
    }
}
