use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::billing_repository::{AssignmentOutcome, BillingRepository, PlanAssignment};
use crate::db::plan_history_repository::PlanHistoryRepository;
use crate::db::plan_repository::PlanRepository;
use crate::db::user_repository::UserRepository;
use crate::models::{
    billing_cycle::BillingCycle,
    payment::Payment,
    plan::Plan,
    plan_change::{NewPlanChange, PlanChange, PlanChangeState},
    plan_history::{NewPlanHistory, PlanHistory},
    user::User,
};

/// In-memory stand-in for all four repositories. Each operation holds a
/// single lock for its whole read-modify-write, mirroring the transactional
/// behaviour of the Postgres implementations.
#[derive(Default)]
pub struct MockDb {
    pub users: Mutex<HashMap<Uuid, User>>,
    pub plans: Mutex<Vec<Plan>>,
    pub cycles: Mutex<HashMap<Uuid, BillingCycle>>,
    pub payments: Mutex<Vec<Payment>>,
    pub changes: Mutex<HashMap<Uuid, PlanChange>>,
    pub history: Mutex<Vec<PlanHistory>>,
    pub fail_plan_lookups: bool,
    pub fail_history_writes: AtomicBool,
    /// Number of upcoming `settled -> refund_pending` transitions to fail.
    pub fail_refund_starts: AtomicUsize,
}

fn mock_failure() -> sqlx::Error {
    sqlx::Error::Protocol("Mock DB failure".into())
}

impl MockDb {
    pub fn with_user(self, user: User) -> Self {
        self.users.lock().unwrap().insert(user.id, user);
        self
    }

    pub fn with_plan(self, plan: Plan) -> Self {
        self.plans.lock().unwrap().push(plan);
        self
    }

    pub fn with_cycle(self, cycle: BillingCycle) -> Self {
        self.cycles.lock().unwrap().insert(cycle.user_id, cycle);
        self
    }

    pub fn with_payment(self, payment: Payment) -> Self {
        self.payments.lock().unwrap().push(payment);
        self
    }

    pub fn payments_for(&self, user_id: Uuid) -> Vec<Payment> {
        self.payments
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Oldest first.
    pub fn history_for(&self, user_id: Uuid) -> Vec<PlanHistory> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn changes_for(&self, user_id: Uuid) -> Vec<PlanChange> {
        let mut changes: Vec<PlanChange> = self
            .changes
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        changes.sort_by_key(|c| c.created_at);
        changes
    }

    pub fn user_plan(&self, user_id: Uuid) -> Option<String> {
        self.users
            .lock()
            .unwrap()
            .get(&user_id)
            .and_then(|u| u.plan.clone())
    }
}

#[async_trait]
impl UserRepository for MockDb {
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, sqlx::Error> {
        Ok(self.users.lock().unwrap().get(&user_id).cloned())
    }
}

#[async_trait]
impl PlanRepository for MockDb {
    async fn find_plan_by_id(&self, plan_id: &str) -> Result<Option<Plan>, sqlx::Error> {
        if self.fail_plan_lookups {
            return Err(mock_failure());
        }
        Ok(self
            .plans
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == plan_id)
            .cloned())
    }

    async fn find_plan_by_label(&self, label: &str) -> Result<Option<Plan>, sqlx::Error> {
        if self.fail_plan_lookups {
            return Err(mock_failure());
        }
        let plans = self.plans.lock().unwrap();
        let by_tier = plans
            .iter()
            .find(|p| p.tier.as_str().eq_ignore_ascii_case(label.trim()));
        Ok(by_tier
            .or_else(|| plans.iter().find(|p| p.matches_label(label)))
            .cloned())
    }

    async fn list_active_plans(&self) -> Result<Vec<Plan>, sqlx::Error> {
        if self.fail_plan_lookups {
            return Err(mock_failure());
        }
        let mut plans: Vec<Plan> = self
            .plans
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.active)
            .cloned()
            .collect();
        plans.sort_by(|a, b| a.price.cmp(&b.price));
        Ok(plans)
    }
}

#[async_trait]
impl PlanHistoryRepository for MockDb {
    async fn append_entry(&self, entry: NewPlanHistory) -> Result<PlanHistory, sqlx::Error> {
        if self.fail_history_writes.load(Ordering::SeqCst) {
            return Err(mock_failure());
        }
        let row = PlanHistory {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            plan_change_id: entry.plan_change_id,
            from_plan: entry.from_plan,
            to_plan: entry.to_plan,
            action: entry.action,
            old_price: entry.old_price,
            new_price: entry.new_price,
            cycle_start: entry.cycle_start,
            cycle_end: entry.cycle_end,
            remaining_days: entry.remaining_days,
            credit_calculated: entry.credit_calculated,
            discount_applied_minor: entry.discount_applied_minor,
            refund_processed_minor: entry.refund_processed_minor,
            refund_ref: entry.refund_ref,
            payment_id: entry.payment_id,
            note: entry.note,
            created_at: OffsetDateTime::now_utc(),
        };
        self.history.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn list_entries_for_user(&self, user_id: Uuid) -> Result<Vec<PlanHistory>, sqlx::Error> {
        let mut entries = self.history_for(user_id);
        entries.reverse();
        Ok(entries)
    }
}

#[async_trait]
impl BillingRepository for MockDb {
    async fn find_billing_cycle(
        &self,
        user_id: Uuid,
    ) -> Result<Option<BillingCycle>, sqlx::Error> {
        Ok(self.cycles.lock().unwrap().get(&user_id).cloned())
    }

    async fn find_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, sqlx::Error> {
        Ok(self
            .payments
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == payment_id)
            .cloned())
    }

    async fn insert_plan_change(
        &self,
        change: NewPlanChange,
    ) -> Result<Option<PlanChange>, sqlx::Error> {
        let mut changes = self.changes.lock().unwrap();
        let open = changes
            .values()
            .any(|c| c.user_id == change.user_id && c.state == PlanChangeState::Initiated);
        if open {
            return Ok(None);
        }
        let now = OffsetDateTime::now_utc();
        let row = PlanChange {
            id: Uuid::new_v4(),
            user_id: change.user_id,
            from_plan: change.from_plan,
            to_plan: change.to_plan,
            action: change.action,
            old_price: change.old_price,
            new_price: change.new_price,
            cycle_start: change.cycle_start,
            cycle_end: change.cycle_end,
            total_days: change.total_days,
            remaining_days: change.remaining_days,
            credit_calculated: change.credit_calculated,
            discount_minor: change.discount_minor,
            net_amount_minor: change.net_amount_minor,
            refund_due_minor: change.refund_due_minor,
            prior_payment_id: change.prior_payment_id,
            prior_charge_ref: change.prior_charge_ref,
            prior_captured_minor: change.prior_captured_minor,
            base_plan_version: change.base_plan_version,
            effective_at: change.effective_at,
            gateway_intent_ref: None,
            payment_id: None,
            refund_ref: None,
            state: PlanChangeState::Initiated,
            note: None,
            created_at: now,
            updated_at: now,
        };
        changes.insert(row.id, row.clone());
        Ok(Some(row))
    }

    async fn find_plan_change(&self, change_id: Uuid) -> Result<Option<PlanChange>, sqlx::Error> {
        Ok(self.changes.lock().unwrap().get(&change_id).cloned())
    }

    async fn find_plan_change_by_intent(
        &self,
        intent_ref: &str,
    ) -> Result<Option<PlanChange>, sqlx::Error> {
        Ok(self
            .changes
            .lock()
            .unwrap()
            .values()
            .find(|c| c.gateway_intent_ref.as_deref() == Some(intent_ref))
            .cloned())
    }

    async fn find_open_plan_change(
        &self,
        user_id: Uuid,
    ) -> Result<Option<PlanChange>, sqlx::Error> {
        Ok(self
            .changes
            .lock()
            .unwrap()
            .values()
            .find(|c| c.user_id == user_id && c.state == PlanChangeState::Initiated)
            .cloned())
    }

    async fn attach_intent(&self, change_id: Uuid, intent_ref: &str) -> Result<(), sqlx::Error> {
        if let Some(change) = self.changes.lock().unwrap().get_mut(&change_id) {
            change.gateway_intent_ref = Some(intent_ref.to_string());
            change.updated_at = OffsetDateTime::now_utc();
        }
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
        if to == PlanChangeState::RefundPending
            && self
                .fail_refund_starts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(mock_failure());
        }
        let mut changes = self.changes.lock().unwrap();
        match changes.get_mut(&change_id) {
            Some(change) if change.state == from => {
                change.state = to;
                if let Some(note) = note {
                    change.note = Some(note.to_string());
                }
                change.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_charge(
        &self,
        change_id: Uuid,
        payment: Payment,
    ) -> Result<Payment, sqlx::Error> {
        let mut changes = self.changes.lock().unwrap();
        let mut payments = self.payments.lock().unwrap();

        let stored = match payments
            .iter()
            .find(|p| p.plan_change_id == Some(change_id))
        {
            Some(existing) => existing.clone(),
            None => {
                let mut fresh = payment;
                fresh.plan_change_id = Some(change_id);
                payments.push(fresh.clone());
                fresh
            }
        };

        if let Some(change) = changes.get_mut(&change_id) {
            if change.state == PlanChangeState::Initiated {
                change.state = PlanChangeState::Charged;
                change.payment_id = Some(stored.id);
                change.updated_at = OffsetDateTime::now_utc();
            }
        }
        Ok(stored)
    }

    async fn commit_assignment(
        &self,
        assignment: PlanAssignment,
    ) -> Result<AssignmentOutcome, sqlx::Error> {
        let mut changes = self.changes.lock().unwrap();
        let mut cycles = self.cycles.lock().unwrap();
        let mut users = self.users.lock().unwrap();

        let Some(change) = changes.get_mut(&assignment.change_id) else {
            return Ok(AssignmentOutcome::VersionConflict);
        };
        if change.state.is_settled() {
            return Ok(AssignmentOutcome::AlreadySettled);
        }
        if change.state != PlanChangeState::Charged {
            return Ok(AssignmentOutcome::VersionConflict);
        }

        let current_version = cycles
            .get(&assignment.user_id)
            .map(|c| c.plan_version)
            .unwrap_or(0);
        if current_version != assignment.expected_version {
            return Ok(AssignmentOutcome::VersionConflict);
        }

        let now = OffsetDateTime::now_utc();
        let mut cycle = assignment.cycle;
        cycle.updated_at = now;
        cycles.insert(assignment.user_id, cycle.clone());
        if let Some(user) = users.get_mut(&assignment.user_id) {
            user.plan = Some(cycle.plan_id);
        }
        change.state = PlanChangeState::Settled;
        change.updated_at = now;
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
        let mut changes = self.changes.lock().unwrap();
        match changes.get_mut(&change_id) {
            Some(change) if change.state == PlanChangeState::RefundPending => {
                change.state = to;
                change.refund_ref = refund_ref.map(str::to_string);
                if let Some(note) = note {
                    change.note = Some(note.to_string());
                }
                change.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
