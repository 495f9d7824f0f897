use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    db::plan_history_repository::PlanHistoryRepository,
    models::plan_history::{NewPlanHistory, PlanHistory},
};

const HISTORY_COLUMNS: &str = "id, user_id, plan_change_id, from_plan, to_plan, action, \
    old_price, new_price, cycle_start, cycle_end, remaining_days, credit_calculated, \
    discount_applied_minor, refund_processed_minor, refund_ref, payment_id, note, created_at";

pub struct PostgresPlanHistoryRepository {
    pub pool: PgPool,
}

#[async_trait]
impl PlanHistoryRepository for PostgresPlanHistoryRepository {
    async fn append_entry(&self, entry: NewPlanHistory) -> Result<PlanHistory, sqlx::Error> {
        let sql = format!(
            r#"
            INSERT INTO plan_history (
                id, user_id, plan_change_id, from_plan, to_plan, action,
                old_price, new_price, cycle_start, cycle_end, remaining_days,
                credit_calculated, discount_applied_minor, refund_processed_minor,
                refund_ref, payment_id, note
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING {HISTORY_COLUMNS}
            "#
        );
        sqlx::query_as::<_, PlanHistory>(&sql)
            .bind(Uuid::new_v4())
            .bind(entry.user_id)
            .bind(entry.plan_change_id)
            .bind(entry.from_plan)
            .bind(entry.to_plan)
            .bind(entry.action)
            .bind(entry.old_price)
            .bind(entry.new_price)
            .bind(entry.cycle_start)
            .bind(entry.cycle_end)
            .bind(entry.remaining_days)
            .bind(entry.credit_calculated)
            .bind(entry.discount_applied_minor)
            .bind(entry.refund_processed_minor)
            .bind(entry.refund_ref)
            .bind(entry.payment_id)
            .bind(entry.note)
            .fetch_one(&self.pool)
            .await
    }

    async fn list_entries_for_user(&self, user_id: Uuid) -> Result<Vec<PlanHistory>, sqlx::Error> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM plan_history WHERE user_id = $1 ORDER BY created_at DESC, id"
        );
        sqlx::query_as::<_, PlanHistory>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
    }
}
