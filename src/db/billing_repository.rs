use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    billing_cycle::BillingCycle,
    payment::Payment,
    plan_change::{NewPlanChange, PlanChange, PlanChangeState},
};

/// Everything needed to move a charged change to `settled` in one step.
#[derive(Debug, Clone)]
pub struct PlanAssignment {
    pub change_id: Uuid,
    pub user_id: Uuid,
    /// `plan_version` the change was priced against; 0 when the user had no cycle.
    pub expected_version: i64,
    /// Replacement cycle. Its `plan_version` is `expected_version + 1`.
    pub cycle: BillingCycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentOutcome {
    Committed,
    /// The change was already settled by an earlier call.
    AlreadySettled,
    /// The user's cycle moved on since the change was priced.
    VersionConflict,
}

#[async_trait]
pub trait BillingRepository: Send + Sync {
    async fn find_billing_cycle(&self, user_id: Uuid)
        -> Result<Option<BillingCycle>, sqlx::Error>;

    async fn find_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, sqlx::Error>;

    /// Returns `None` when the user already has an `initiated` change.
    async fn insert_plan_change(
        &self,
        change: NewPlanChange,
    ) -> Result<Option<PlanChange>, sqlx::Error>;

    async fn find_plan_change(&self, change_id: Uuid) -> Result<Option<PlanChange>, sqlx::Error>;

    async fn find_plan_change_by_intent(
        &self,
        intent_ref: &str,
    ) -> Result<Option<PlanChange>, sqlx::Error>;

    async fn find_open_plan_change(&self, user_id: Uuid)
        -> Result<Option<PlanChange>, sqlx::Error>;

    async fn attach_intent(&self, change_id: Uuid, intent_ref: &str) -> Result<(), sqlx::Error>;

    /// Compare-and-set on the change state. `false` when the change was not in `from`.
    async fn transition_plan_change(
        &self,
        change_id: Uuid,
        from: PlanChangeState,
        to: PlanChangeState,
        note: Option<&str>,
    ) -> Result<bool, sqlx::Error>;

    /// Stores the payment and moves the change from `initiated` to `charged`.
    /// Payments are unique per change; a repeat returns the stored payment.
    async fn record_charge(&self, change_id: Uuid, payment: Payment)
        -> Result<Payment, sqlx::Error>;

    /// Replaces the billing cycle (compare-and-swap on `plan_version`), sets the
    /// user's active plan and moves the change to `settled`, atomically.
    async fn commit_assignment(
        &self,
        assignment: PlanAssignment,
    ) -> Result<AssignmentOutcome, sqlx::Error>;

    /// Moves a `refund_pending` change to its final refund state.
    async fn complete_refund(
        &self,
        change_id: Uuid,
        to: PlanChangeState,
        refund_ref: Option<&str>,
        note: Option<&str>,
    ) -> Result<bool, sqlx::Error>;
}
