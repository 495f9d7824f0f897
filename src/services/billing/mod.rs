//! Plan-change settlement: pricing a switch, charging the net amount,
//! confirming the charge and refunding unused days after a downgrade.

pub mod catalog;
pub mod cycle;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod proration;
pub mod refund;
pub mod settlement;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::db::{
    billing_repository::BillingRepository, plan_history_repository::PlanHistoryRepository,
    plan_repository::PlanRepository, user_repository::UserRepository,
};
use crate::models::plan::Plan;
use crate::services::gateway::PaymentGateway;

pub use catalog::PlanCatalog;
pub use error::BillingError;
pub use orchestrator::{ChargeOrchestrator, ChargeOutcome};
pub use refund::{RefundOutcome, RefundProcessor};
pub use settlement::{ConfirmOutcome, Settlement, SettlementConfirmer};

pub const DEFAULT_FREE_PLAN: &str = "free";

/// Serializes plan-change work per user inside this process.
#[derive(Clone, Default)]
pub struct UserLocks {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub async fn acquire(&self, user_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

#[derive(Clone)]
pub struct BillingEngine {
    catalog: PlanCatalog,
    orchestrator: ChargeOrchestrator,
    confirmer: SettlementConfirmer,
    locks: UserLocks,
}

impl BillingEngine {
    pub fn new(
        users: Arc<dyn UserRepository>,
        plans: Arc<dyn PlanRepository>,
        billing: Arc<dyn BillingRepository>,
        history: Arc<dyn PlanHistoryRepository>,
        gateway: Arc<dyn PaymentGateway>,
        currency: impl Into<String>,
    ) -> Self {
        let catalog = PlanCatalog::new(plans);
        let ledger = ledger::Ledger::new(history);
        let refunds = RefundProcessor::new(billing.clone(), gateway.clone(), ledger.clone());
        let confirmer = SettlementConfirmer::new(
            users.clone(),
            billing.clone(),
            catalog.clone(),
            gateway.clone(),
            refunds,
        );
        let orchestrator = ChargeOrchestrator::new(
            users,
            billing,
            catalog.clone(),
            ledger,
            gateway,
            confirmer.clone(),
            currency.into(),
        );
        Self {
            catalog,
            orchestrator,
            confirmer,
            locks: UserLocks::default(),
        }
    }

    pub async fn create_charge(
        &self,
        user_id: Uuid,
        target_reference: &str,
    ) -> Result<ChargeOutcome, BillingError> {
        let _guard = self.locks.acquire(user_id).await;
        self.orchestrator.create(user_id, target_reference).await
    }

    pub async fn confirm(
        &self,
        user_id: Uuid,
        intent_ref: &str,
    ) -> Result<ConfirmOutcome, BillingError> {
        let _guard = self.locks.acquire(user_id).await;
        self.confirmer.confirm(user_id, intent_ref).await
    }

    pub async fn activate_free(
        &self,
        user_id: Uuid,
        target_reference: Option<&str>,
    ) -> Result<Settlement, BillingError> {
        let _guard = self.locks.acquire(user_id).await;
        let reference = target_reference
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_FREE_PLAN);
        self.orchestrator.activate_free(user_id, reference).await
    }

    pub async fn list_plans(&self) -> Vec<Plan> {
        self.catalog.list_plans().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock_db::MockDb;
    use crate::models::{
        billing_cycle::BillingCycle,
        payment::{Payment, PaymentStatus},
        plan_change::PlanChangeState,
        plan_history::PlanAction,
        user::User,
    };
    use crate::services::gateway::{
        CreatedIntent, GatewayError, InMemoryGateway, IntentSnapshot, MockPaymentGateway,
    };
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;
    use rust_decimal::Decimal;
    use time::{Duration, OffsetDateTime};

    fn user(id: Uuid) -> User {
        User {
            id,
            email: "subscriber@example.com".into(),
            first_name: "Sam".into(),
            last_name: "Rivera".into(),
            plan: None,
            created_at: OffsetDateTime::now_utc() - Duration::days(90),
        }
    }

    /// User on `plan_id` since `days_in` days ago, in a 30-day cycle.
    fn subscribed(
        user_id: Uuid,
        plan_id: &str,
        price_minor: i64,
        captured_minor: i64,
        days_in: i64,
    ) -> MockDb {
        let start = OffsetDateTime::now_utc() - Duration::days(days_in);
        let payment_id = Uuid::new_v4();
        let mut u = user(user_id);
        u.plan = Some(plan_id.to_string());
        MockDb::default()
            .with_user(u)
            .with_payment(Payment {
                id: payment_id,
                user_id,
                plan_id: plan_id.to_string(),
                plan_change_id: None,
                status: PaymentStatus::Success,
                amount: Decimal::new(captured_minor, 2),
                currency: "usd".into(),
                gateway_charge_ref: Some("ch_prior".into()),
                gateway_intent_ref: Some("pi_prior".into()),
                created_at: start,
            })
            .with_cycle(BillingCycle {
                user_id,
                plan_id: plan_id.to_string(),
                plan_price: Decimal::new(price_minor, 2),
                payment_id,
                cycle_start: start,
                cycle_end: start + Duration::days(30),
                captured_minor,
                gateway_charge_ref: Some("ch_prior".into()),
                plan_version: 1,
                updated_at: start,
            })
    }

    fn engine(db: &Arc<MockDb>, gateway: Arc<dyn PaymentGateway>) -> BillingEngine {
        BillingEngine::new(
            db.clone(),
            db.clone(),
            db.clone(),
            db.clone(),
            gateway,
            "usd",
        )
    }

    fn awaiting(outcome: ChargeOutcome) -> (String, i64, PlanAction) {
        match outcome {
            ChargeOutcome::AwaitingPayment {
                intent_ref,
                net_amount_minor,
                action,
                ..
            } => (intent_ref, net_amount_minor, action),
            other => panic!("expected a pending payment, got {other:?}"),
        }
    }

    fn settled(outcome: ConfirmOutcome) -> Settlement {
        match outcome {
            ConfirmOutcome::Settled(s) => s,
            other => panic!("expected settlement, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_purchase_charges_full_price_and_starts_cycle() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(MockDb::default().with_user(user(user_id)));
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let (intent_ref, net, action) =
            awaiting(engine.create_charge(user_id, "premium").await.unwrap());
        assert_eq!(net, 2900);
        assert_eq!(action, PlanAction::Start);

        let history = db.history_for(user_id);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, PlanAction::Start);
        assert_eq!(history[0].old_price, Decimal::ZERO);
        assert_eq!(history[0].new_price, Decimal::new(2900, 2));
        assert_eq!(history[0].discount_applied_minor, 0);

        gateway.succeed_intent(&intent_ref);
        let settlement = settled(engine.confirm(user_id, &intent_ref).await.unwrap());
        assert_eq!(settlement.user.plan.as_deref(), Some("premium"));
        assert!(settlement.refund.is_none());

        let payments = db.payments_for(user_id);
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].amount, Decimal::new(2900, 2));
        assert!(payments[0].gateway_charge_ref.is_some());

        let cycle = db.cycles.lock().unwrap().get(&user_id).cloned().unwrap();
        assert_eq!(cycle.plan_id, "premium");
        assert_eq!(cycle.plan_version, 1);
        assert_eq!(cycle.captured_minor, 2900);
        assert_eq!(db.user_plan(user_id).as_deref(), Some("premium"));
    }

    #[tokio::test]
    async fn mid_cycle_upgrade_charges_net_of_unused_days() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(subscribed(user_id, "premium", 2900, 2900, 15));
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let (intent_ref, net, action) =
            awaiting(engine.create_charge(user_id, "pro").await.unwrap());
        assert_eq!(action, PlanAction::Upgrade);
        assert_eq!(net, 8450);

        let request = gateway.intent_requests.lock().unwrap()[0].clone();
        assert_eq!(request.amount_minor, 8450);
        assert_eq!(request.currency, "usd");
        assert_eq!(request.metadata["discount_minor"], "1450");
        assert_eq!(request.metadata["target_plan"], "pro");
        assert_eq!(request.metadata["user_id"], user_id.to_string());

        let entry = &db.history_for(user_id)[0];
        assert_eq!(entry.credit_calculated, Decimal::new(1450, 2));
        assert_eq!(entry.discount_applied_minor, 1450);
        assert_eq!(entry.remaining_days, 15);

        gateway.succeed_intent(&intent_ref);
        let settlement = settled(engine.confirm(user_id, &intent_ref).await.unwrap());
        assert_eq!(settlement.user.plan.as_deref(), Some("pro"));
        assert_eq!(
            settlement.payment.unwrap().amount,
            Decimal::new(8450, 2)
        );
        assert!(gateway.refund_requests.lock().unwrap().is_empty());

        let cycle = db.cycles.lock().unwrap().get(&user_id).cloned().unwrap();
        assert_eq!(cycle.plan_version, 2);
        assert_eq!(cycle.plan_price, Decimal::new(9900, 2));
    }

    #[tokio::test]
    async fn downgrade_to_free_refunds_unused_premium_days() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(subscribed(user_id, "premium", 2900, 2900, 15));
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let settlement = engine.activate_free(user_id, None).await.unwrap();
        assert_eq!(settlement.user.plan.as_deref(), Some("free"));
        assert!(gateway.intent_requests.lock().unwrap().is_empty());

        let refund_ref = match settlement.refund {
            Some(RefundOutcome::Refunded {
                refund_ref,
                amount_minor,
            }) => {
                assert_eq!(amount_minor, 1450);
                refund_ref
            }
            other => panic!("expected a refund, got {other:?}"),
        };

        let refunds = gateway.refund_requests.lock().unwrap().clone();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].charge_ref, "ch_prior");
        assert_eq!(refunds[0].amount_minor, 1450);

        let history = db.history_for(user_id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, PlanAction::Downgrade);
        assert_eq!(history[0].refund_processed_minor, 0);
        assert_eq!(history[1].refund_processed_minor, 1450);
        assert_eq!(history[1].refund_ref.as_deref(), Some(refund_ref.as_str()));
        assert_eq!(history[1].payment_id, settlement.payment.as_ref().map(|p| p.id));

        let change = db.changes_for(user_id).pop().unwrap();
        assert_eq!(change.state, PlanChangeState::RefundSettled);
        assert_eq!(settlement.payment.unwrap().amount, Decimal::ZERO);
    }

    #[tokio::test]
    async fn paid_downgrade_refunds_after_confirmation_only() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(subscribed(user_id, "pro", 9900, 9900, 15));
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let (intent_ref, net, action) =
            awaiting(engine.create_charge(user_id, "premium").await.unwrap());
        assert_eq!(action, PlanAction::Downgrade);
        assert_eq!(net, 2900);
        assert!(gateway.refund_requests.lock().unwrap().is_empty());

        gateway.succeed_intent(&intent_ref);
        let settlement = settled(engine.confirm(user_id, &intent_ref).await.unwrap());
        match settlement.refund {
            Some(RefundOutcome::Refunded { amount_minor, .. }) => assert_eq!(amount_minor, 4950),
            other => panic!("expected a refund, got {other:?}"),
        }
        let refunds = gateway.refund_requests.lock().unwrap().clone();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].amount_minor, 4950);
    }

    #[tokio::test]
    async fn refund_is_capped_at_prior_capture() {
        let user_id = Uuid::new_v4();
        // pro cycle that was itself discounted down to 10.00
        let db = Arc::new(subscribed(user_id, "pro", 9900, 1000, 15));
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let settlement = engine.activate_free(user_id, Some("free")).await.unwrap();
        match settlement.refund {
            Some(RefundOutcome::Refunded { amount_minor, .. }) => assert_eq!(amount_minor, 1000),
            other => panic!("expected a refund, got {other:?}"),
        }
        assert_eq!(gateway.refund_requests.lock().unwrap()[0].amount_minor, 1000);
    }

    #[tokio::test]
    async fn refund_failure_is_recorded_and_switch_stands() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(subscribed(user_id, "premium", 2900, 2900, 15));
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_create_intent().never();
        gateway
            .expect_create_refund()
            .times(1)
            .returning(|_| Err(GatewayError::Api("charge_already_refunded".into())));
        let engine = engine(&db, Arc::new(gateway));

        let settlement = engine.activate_free(user_id, None).await.unwrap();
        assert!(matches!(settlement.refund, Some(RefundOutcome::Failed { .. })));
        assert_eq!(db.user_plan(user_id).as_deref(), Some("free"));

        let history = db.history_for(user_id);
        let last = history.last().unwrap();
        assert_eq!(last.refund_processed_minor, 0);
        assert!(last.refund_ref.is_none());
        assert!(last.note.as_deref().unwrap().contains("failed"));

        let change = db.changes_for(user_id).pop().unwrap();
        assert_eq!(change.state, PlanChangeState::RefundFailed);
    }

    #[tokio::test]
    async fn missing_prior_charge_reference_is_a_recorded_failure() {
        let user_id = Uuid::new_v4();
        let db = subscribed(user_id, "premium", 2900, 2900, 15);
        db.cycles
            .lock()
            .unwrap()
            .get_mut(&user_id)
            .unwrap()
            .gateway_charge_ref = None;
        let db = Arc::new(db);
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_create_refund().never();
        let engine = engine(&db, Arc::new(gateway));

        let settlement = engine.activate_free(user_id, None).await.unwrap();
        assert_eq!(
            settlement.refund,
            Some(RefundOutcome::Failed {
                reason: "prior charge has no gateway reference".into()
            })
        );
        assert_eq!(db.history_for(user_id).len(), 2);
    }

    #[tokio::test]
    async fn ended_cycle_downgrade_skips_refund() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(subscribed(user_id, "premium", 2900, 2900, 40));
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let settlement = engine.activate_free(user_id, None).await.unwrap();
        assert!(settlement.refund.is_none());
        assert!(gateway.refund_requests.lock().unwrap().is_empty());
        let change = db.changes_for(user_id).pop().unwrap();
        assert_eq!(change.remaining_days, 0);
        assert_eq!(change.state, PlanChangeState::Settled);
    }

    #[tokio::test]
    async fn unknown_plan_is_rejected_before_any_write() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(MockDb::default().with_user(user(user_id)));
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let err = engine
            .create_charge(user_id, "nonexistent-tier")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PlanNotFound(_)));
        assert!(db.history_for(user_id).is_empty());
        assert!(db.changes_for(user_id).is_empty());
        assert!(gateway.intent_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn polling_an_unpaid_intent_writes_nothing() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(MockDb::default().with_user(user(user_id)));
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let (intent_ref, _, _) = awaiting(engine.create_charge(user_id, "pro").await.unwrap());
        for _ in 0..3 {
            match engine.confirm(user_id, &intent_ref).await.unwrap() {
                ConfirmOutcome::Pending { status } => {
                    assert_eq!(status, "requires_payment_method")
                }
                other => panic!("expected pending, got {other:?}"),
            }
        }
        assert_eq!(*gateway.retrieve_calls.lock().unwrap(), 3);
        assert!(db.payments_for(user_id).is_empty());
        assert_eq!(
            db.changes_for(user_id)[0].state,
            PlanChangeState::Initiated
        );
    }

    #[tokio::test]
    async fn reconfirming_a_settled_intent_creates_no_second_payment() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(MockDb::default().with_user(user(user_id)));
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let (intent_ref, _, _) = awaiting(engine.create_charge(user_id, "premium").await.unwrap());
        gateway.succeed_intent(&intent_ref);

        let first = settled(engine.confirm(user_id, &intent_ref).await.unwrap());
        let second = settled(engine.confirm(user_id, &intent_ref).await.unwrap());
        assert!(!first.repeated);
        assert!(second.repeated);
        assert_eq!(
            first.payment.map(|p| p.id),
            second.payment.map(|p| p.id)
        );
        assert_eq!(db.payments_for(user_id).len(), 1);
        assert_eq!(db.history_for(user_id).len(), 1);
    }

    #[tokio::test]
    async fn another_users_intent_cannot_be_confirmed() {
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        let db = Arc::new(
            MockDb::default()
                .with_user(user(owner))
                .with_user(user(intruder)),
        );
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let (intent_ref, _, _) = awaiting(engine.create_charge(owner, "premium").await.unwrap());
        gateway.succeed_intent(&intent_ref);

        let err = engine.confirm(intruder, &intent_ref).await.unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert!(db.payments_for(owner).is_empty());
    }

    #[tokio::test]
    async fn paid_open_change_blocks_a_new_one() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(MockDb::default().with_user(user(user_id)));
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let (intent_ref, _, _) = awaiting(engine.create_charge(user_id, "premium").await.unwrap());
        gateway.succeed_intent(&intent_ref);

        let err = engine.create_charge(user_id, "pro").await.unwrap_err();
        assert!(matches!(err, BillingError::ChangeInProgress));
        assert_eq!(db.changes_for(user_id).len(), 1);
    }

    #[tokio::test]
    async fn unpaid_open_change_is_superseded() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(MockDb::default().with_user(user(user_id)));
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let (first_ref, _, _) = awaiting(engine.create_charge(user_id, "premium").await.unwrap());
        let (second_ref, _, _) = awaiting(engine.create_charge(user_id, "pro").await.unwrap());
        assert_ne!(first_ref, second_ref);
        assert_eq!(gateway.cancelled.lock().unwrap().clone(), vec![first_ref]);

        let changes = db.changes_for(user_id);
        assert_eq!(changes.len(), 2);
        let states: Vec<_> = changes.iter().map(|c| c.state).collect();
        assert!(states.contains(&PlanChangeState::Abandoned));
        assert!(states.contains(&PlanChangeState::Initiated));
    }

    #[tokio::test]
    async fn concurrent_requests_leave_one_open_change() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(MockDb::default().with_user(user(user_id)));
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let (a, b) = tokio::join!(
            engine.create_charge(user_id, "premium"),
            engine.create_charge(user_id, "pro")
        );
        assert!(a.is_ok());
        assert!(b.is_ok());

        let open = db
            .changes_for(user_id)
            .into_iter()
            .filter(|c| c.state == PlanChangeState::Initiated)
            .count();
        assert_eq!(open, 1);
    }

    #[tokio::test]
    async fn cycle_moved_under_a_paid_change_needs_reconciliation() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(subscribed(user_id, "premium", 2900, 2900, 15));
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let (intent_ref, _, _) = awaiting(engine.create_charge(user_id, "pro").await.unwrap());
        db.cycles
            .lock()
            .unwrap()
            .get_mut(&user_id)
            .unwrap()
            .plan_version = 2;
        gateway.succeed_intent(&intent_ref);

        let err = engine.confirm(user_id, &intent_ref).await.unwrap_err();
        assert!(matches!(err, BillingError::SettlementInconsistency(_)));
        // the capture itself is on record for reconciliation
        assert_eq!(db.payments_for(user_id).len(), 2);
        assert_eq!(db.user_plan(user_id).as_deref(), Some("premium"));
    }

    #[tokio::test]
    async fn gateway_failure_abandons_change_and_keeps_ledger_entry() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(MockDb::default().with_user(user(user_id)));
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.set_fail_create_intent(true);
        let engine = engine(&db, gateway.clone());

        let err = engine.create_charge(user_id, "premium").await.unwrap_err();
        assert!(matches!(err, BillingError::Gateway(_)));
        assert_eq!(db.history_for(user_id).len(), 1);
        assert_eq!(
            db.changes_for(user_id)[0].state,
            PlanChangeState::Abandoned
        );

        gateway.set_fail_create_intent(false);
        assert!(engine.create_charge(user_id, "premium").await.is_ok());
    }

    #[tokio::test]
    async fn processing_open_intent_is_not_superseded() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(MockDb::default().with_user(user(user_id)));
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let (first_ref, _, _) = awaiting(engine.create_charge(user_id, "premium").await.unwrap());
        gateway.set_intent_status(&first_ref, "processing");

        let err = engine.create_charge(user_id, "pro").await.unwrap_err();
        assert!(matches!(err, BillingError::ChangeInProgress));
        assert!(gateway.cancelled.lock().unwrap().is_empty());
        assert_eq!(gateway.intent_requests.lock().unwrap().len(), 1);
        let changes = db.changes_for(user_id);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].state, PlanChangeState::Initiated);

        // the in-flight payment still settles normally
        gateway.succeed_intent(&first_ref);
        let settlement = settled(engine.confirm(user_id, &first_ref).await.unwrap());
        assert_eq!(settlement.user.plan.as_deref(), Some("premium"));
        assert_eq!(db.payments_for(user_id).len(), 1);
    }

    #[tokio::test]
    async fn failed_cancel_keeps_open_change() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(MockDb::default().with_user(user(user_id)));
        let mut gateway = MockPaymentGateway::new();
        gateway.expect_create_intent().times(1).returning(|_| {
            Ok(CreatedIntent {
                intent_ref: "pi_open".into(),
                client_secret: "pi_open_secret_abc".into(),
            })
        });
        gateway.expect_retrieve_intent().times(1).returning(|_| {
            Ok(IntentSnapshot {
                intent_ref: "pi_open".into(),
                status: "requires_payment_method".into(),
                captured_amount_minor: 0,
                currency: "usd".into(),
                latest_charge_ref: None,
                metadata: BTreeMap::new(),
            })
        });
        gateway
            .expect_cancel_intent()
            .times(1)
            .returning(|_| Err(GatewayError::Api("connection reset".into())));
        let engine = engine(&db, Arc::new(gateway));

        awaiting(engine.create_charge(user_id, "premium").await.unwrap());
        let err = engine.create_charge(user_id, "pro").await.unwrap_err();
        assert!(matches!(err, BillingError::ChangeInProgress));

        let changes = db.changes_for(user_id);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].state, PlanChangeState::Initiated);
    }

    #[tokio::test]
    async fn refund_that_could_not_start_is_retried_on_reconfirm() {
        let user_id = Uuid::new_v4();
        let db = subscribed(user_id, "pro", 9900, 9900, 15);
        db.fail_refund_starts.store(1, Ordering::SeqCst);
        let db = Arc::new(db);
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let (intent_ref, _, _) = awaiting(engine.create_charge(user_id, "premium").await.unwrap());
        gateway.succeed_intent(&intent_ref);

        let first = settled(engine.confirm(user_id, &intent_ref).await.unwrap());
        assert_eq!(
            first.refund,
            Some(RefundOutcome::Failed {
                reason: "refund could not be started".into()
            })
        );
        assert!(gateway.refund_requests.lock().unwrap().is_empty());
        assert_eq!(
            db.changes_for(user_id)[0].state,
            PlanChangeState::Settled
        );
        let history = db.history_for(user_id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].refund_processed_minor, 0);
        assert!(history[1].note.as_deref().unwrap().contains("not started"));

        let second = settled(engine.confirm(user_id, &intent_ref).await.unwrap());
        assert!(second.repeated);
        match second.refund {
            Some(RefundOutcome::Refunded { amount_minor, .. }) => assert_eq!(amount_minor, 4950),
            other => panic!("expected a refund, got {other:?}"),
        }
        assert_eq!(gateway.refund_requests.lock().unwrap().len(), 1);
        assert_eq!(
            db.changes_for(user_id)[0].state,
            PlanChangeState::RefundSettled
        );
        let history = db.history_for(user_id);
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].refund_processed_minor, 4950);

        let third = settled(engine.confirm(user_id, &intent_ref).await.unwrap());
        assert!(third.refund.is_none());
        assert_eq!(gateway.refund_requests.lock().unwrap().len(), 1);
        assert_eq!(db.payments_for(user_id).len(), 2);
    }

    #[tokio::test]
    async fn pre_charge_ledger_failure_abandons_change() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(MockDb::default().with_user(user(user_id)));
        db.fail_history_writes.store(true, Ordering::SeqCst);
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let err = engine.create_charge(user_id, "premium").await.unwrap_err();
        assert!(matches!(err, BillingError::Database(_)));
        assert!(gateway.intent_requests.lock().unwrap().is_empty());
        assert!(db.history_for(user_id).is_empty());
        assert_eq!(
            db.changes_for(user_id)[0].state,
            PlanChangeState::Abandoned
        );

        db.fail_history_writes.store(false, Ordering::SeqCst);
        assert!(engine.create_charge(user_id, "premium").await.is_ok());
    }

    #[tokio::test]
    async fn ledger_failure_after_charge_still_settles() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(subscribed(user_id, "pro", 9900, 9900, 15));
        let gateway = Arc::new(InMemoryGateway::new());
        let engine = engine(&db, gateway.clone());

        let (intent_ref, _, _) = awaiting(engine.create_charge(user_id, "premium").await.unwrap());
        db.fail_history_writes.store(true, Ordering::SeqCst);
        gateway.succeed_intent(&intent_ref);

        let settlement = settled(engine.confirm(user_id, &intent_ref).await.unwrap());
        assert_eq!(settlement.user.plan.as_deref(), Some("premium"));
        match settlement.refund {
            Some(RefundOutcome::Refunded { amount_minor, .. }) => assert_eq!(amount_minor, 4950),
            other => panic!("expected a refund, got {other:?}"),
        }
        assert_eq!(db.history_for(user_id).len(), 1);
        assert_eq!(
            db.changes_for(user_id)[0].state,
            PlanChangeState::RefundSettled
        );
    }

    #[tokio::test]
    async fn same_plan_mid_cycle_is_rejected() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(subscribed(user_id, "premium", 2900, 2900, 10));
        let engine = engine(&db, Arc::new(InMemoryGateway::new()));

        let err = engine.create_charge(user_id, "Premium").await.unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert!(db.changes_for(user_id).is_empty());
    }

    #[tokio::test]
    async fn activate_free_rejects_paid_plans() {
        let user_id = Uuid::new_v4();
        let db = Arc::new(MockDb::default().with_user(user(user_id)));
        let engine = engine(&db, Arc::new(InMemoryGateway::new()));

        let err = engine
            .activate_free(user_id, Some("pro"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert!(db.changes_for(user_id).is_empty());
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let db = Arc::new(MockDb::default());
        let engine = engine(&db, Arc::new(InMemoryGateway::new()));
        let missing = Uuid::new_v4();
        assert!(matches!(
            engine.create_charge(missing, "premium").await,
            Err(BillingError::UserNotFound(id)) if id == missing
        ));
    }
}
