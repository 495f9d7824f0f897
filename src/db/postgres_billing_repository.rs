use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::db::billing_repository::{AssignmentOutcome, BillingRepository, PlanAssignment};
use crate::models::{
    billing_cycle::BillingCycle,
    payment::Payment,
    plan_change::{NewPlanChange, PlanChange, PlanChangeState},
};

const CHANGE_COLUMNS: &str = "id, user_id, from_plan, to_plan, action, old_price, new_price, \
    cycle_start, cycle_end, total_days, remaining_days, credit_calculated, discount_minor, \
    net_amount_minor, refund_due_minor, prior_payment_id, prior_charge_ref, prior_captured_minor, \
    base_plan_version, effective_at, gateway_intent_ref, payment_id, refund_ref, state, note, \
    created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, user_id, plan_id, plan_change_id, status, amount, currency, \
    gateway_charge_ref, gateway_intent_ref, created_at";

const CYCLE_COLUMNS: &str = "user_id, plan_id, plan_price, payment_id, cycle_start, cycle_end, \
    captured_minor, gateway_charge_ref, plan_version, updated_at";

pub struct PostgresBillingRepository {
    pub pool: PgPool,
}

async fn change_state(
    conn: &mut PgConnection,
    change_id: Uuid,
) -> Result<Option<PlanChangeState>, sqlx::Error> {
    sqlx::query_scalar::<_, PlanChangeState>("SELECT state FROM plan_changes WHERE id = $1")
        .bind(change_id)
        .fetch_optional(conn)
        .await
}

async fn swap_cycle(
    tx: &mut Transaction<'_, Postgres>,
    assignment: &PlanAssignment,
) -> Result<bool, sqlx::Error> {
    let cycle = &assignment.cycle;
    let conn: &mut PgConnection = &mut *tx;
    let affected = if assignment.expected_version == 0 {
        sqlx::query(
            r#"
            INSERT INTO billing_cycles (
                user_id, plan_id, plan_price, payment_id, cycle_start, cycle_end,
                captured_minor, gateway_charge_ref, plan_version, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(assignment.user_id)
        .bind(&cycle.plan_id)
        .bind(cycle.plan_price)
        .bind(cycle.payment_id)
        .bind(cycle.cycle_start)
        .bind(cycle.cycle_end)
        .bind(cycle.captured_minor)
        .bind(&cycle.gateway_charge_ref)
        .bind(cycle.plan_version)
        .execute(conn)
        .await?
        .rows_affected()
    } else {
        sqlx::query(
            r#"
            UPDATE billing_cycles
            SET plan_id = $2,
                plan_price = $3,
                payment_id = $4,
                cycle_start = $5,
                cycle_end = $6,
                captured_minor = $7,
                gateway_charge_ref = $8,
                plan_version = $9,
                updated_at = now()
            WHERE user_id = $1 AND plan_version = $10
            "#,
        )
        .bind(assignment.user_id)
        .bind(&cycle.plan_id)
        .bind(cycle.plan_price)
        .bind(cycle.payment_id)
        .bind(cycle.cycle_start)
        .bind(cycle.cycle_end)
        .bind(cycle.captured_minor)
        .bind(&cycle.gateway_charge_ref)
        .bind(cycle.plan_version)
        .bind(assignment.expected_version)
        .execute(conn)
        .await?
        .rows_affected()
    };
    Ok(affected == 1)
}

#[async_trait]
impl BillingRepository for PostgresBillingRepository {
    async fn find_billing_cycle(
        &self,
        user_id: Uuid,
    ) -> Result<Option<BillingCycle>, sqlx::Error> {
        let sql = format!("SELECT {CYCLE_COLUMNS} FROM billing_cycles WHERE user_id = $1");
        sqlx::query_as::<_, BillingCycle>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn find_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, sqlx::Error> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1");
        sqlx::query_as::<_, Payment>(&sql)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn insert_plan_change(
        &self,
        change: NewPlanChange,
    ) -> Result<Option<PlanChange>, sqlx::Error> {
        let sql = format!(
            r#"
            INSERT INTO plan_changes (
                id, user_id, from_plan, to_plan, action, old_price, new_price,
                cycle_start, cycle_end, total_days, remaining_days, credit_calculated,
                discount_minor, net_amount_minor, refund_due_minor, prior_payment_id,
                prior_charge_ref, prior_captured_minor, base_plan_version, effective_at, state
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, 'initiated')
            ON CONFLICT (user_id) WHERE state = 'initiated' DO NOTHING
            RETURNING {CHANGE_COLUMNS}
            "#
        );
        sqlx::query_as::<_, PlanChange>(&sql)
            .bind(Uuid::new_v4())
            .bind(change.user_id)
            .bind(change.from_plan)
            .bind(change.to_plan)
            .bind(change.action)
            .bind(change.old_price)
            .bind(change.new_price)
            .bind(change.cycle_start)
            .bind(change.cycle_end)
            .bind(change.total_days)
            .bind(change.remaining_days)
            .bind(change.credit_calculated)
            .bind(change.discount_minor)
            .bind(change.net_amount_minor)
            .bind(change.refund_due_minor)
            .bind(change.prior_payment_id)
            .bind(change.prior_charge_ref)
            .bind(change.prior_captured_minor)
            .bind(change.base_plan_version)
            .bind(change.effective_at)
            .fetch_optional(&self.pool)
            .await
    }

    async fn find_plan_change(&self, change_id: Uuid) -> Result<Option<PlanChange>, sqlx::Error> {
        let sql = format!("SELECT {CHANGE_COLUMNS} FROM plan_changes WHERE id = $1");
        sqlx::query_as::<_, PlanChange>(&sql)
            .bind(change_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn find_plan_change_by_intent(
        &self,
        intent_ref: &str,
    ) -> Result<Option<PlanChange>, sqlx::Error> {
        let sql = format!("SELECT {CHANGE_COLUMNS} FROM plan_changes WHERE gateway_intent_ref = $1");
        sqlx::query_as::<_, PlanChange>(&sql)
            .bind(intent_ref)
            .fetch_optional(&self.pool)
            .await
    }

    async fn find_open_plan_change(
        &self,
        user_id: Uuid,
    ) -> Result<Option<PlanChange>, sqlx::Error> {
        let sql = format!(
            "SELECT {CHANGE_COLUMNS} FROM plan_changes WHERE user_id = $1 AND state = 'initiated'"
        );
        sqlx::query_as::<_, PlanChange>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn attach_intent(&self, change_id: Uuid, intent_ref: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE plan_changes SET gateway_intent_ref = $2, updated_at = now() WHERE id = $1",
        )
        .bind(change_id)
        .bind(intent_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn transition_plan_change(
        &self,
        change_id: Uuid,
        from: PlanChangeState,
        to: PlanChangeState,
        note: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"
            UPDATE plan_changes
            SET state = $3, note = COALESCE($4, note), updated_at = now()
            WHERE id = $1 AND state = $2
            "#,
        )
        .bind(change_id)
        .bind(from)
        .bind(to)
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_charge(
        &self,
        change_id: Uuid,
        payment: Payment,
    ) -> Result<Payment, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let insert = format!(
            r#"
            INSERT INTO payments (
                id, user_id, plan_id, plan_change_id, status, amount, currency,
                gateway_charge_ref, gateway_intent_ref, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (plan_change_id) DO NOTHING
            RETURNING {PAYMENT_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, Payment>(&insert)
            .bind(payment.id)
            .bind(payment.user_id)
            .bind(&payment.plan_id)
            .bind(change_id)
            .bind(payment.status)
            .bind(payment.amount)
            .bind(&payment.currency)
            .bind(&payment.gateway_charge_ref)
            .bind(&payment.gateway_intent_ref)
            .bind(payment.created_at)
            .fetch_optional(&mut *tx)
            .await?;

        let stored = match inserted {
            Some(p) => p,
            None => {
                let existing = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE plan_change_id = $1");
                sqlx::query_as::<_, Payment>(&existing)
                    .bind(change_id)
                    .fetch_one(&mut *tx)
                    .await?
            }
        };

        sqlx::query(
            r#"
            UPDATE plan_changes
            SET state = 'charged', payment_id = $2, updated_at = now()
            WHERE id = $1 AND state = 'initiated'
            "#,
        )
        .bind(change_id)
        .bind(stored.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn commit_assignment(
        &self,
        assignment: PlanAssignment,
    ) -> Result<AssignmentOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let settled = sqlx::query(
            r#"
            UPDATE plan_changes
            SET state = 'settled', updated_at = now()
            WHERE id = $1 AND state = 'charged'
            "#,
        )
        .bind(assignment.change_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if settled != 1 {
            let state = change_state(&mut tx, assignment.change_id).await?;
            tx.rollback().await?;
            return Ok(match state {
                Some(s) if s.is_settled() => AssignmentOutcome::AlreadySettled,
                _ => AssignmentOutcome::VersionConflict,
            });
        }

        if !swap_cycle(&mut tx, &assignment).await? {
            tx.rollback().await?;
            return Ok(AssignmentOutcome::VersionConflict);
        }

        sqlx::query("UPDATE users SET plan = $2 WHERE id = $1")
            .bind(assignment.user_id)
            .bind(&assignment.cycle.plan_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(AssignmentOutcome::Committed)
    }

    async fn complete_refund(
        &self,
        change_id: Uuid,
        to: PlanChangeState,
        refund_ref: Option<&str>,
        note: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        if !PlanChangeState::RefundPending.can_transition_to(to) {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"
            UPDATE plan_changes
            SET state = $2, refund_ref = $3, note = COALESCE($4, note), updated_at = now()
            WHERE id = $1 AND state = 'refund_pending'
            "#,
        )
        .bind(change_id)
        .bind(to)
        .bind(refund_ref)
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
