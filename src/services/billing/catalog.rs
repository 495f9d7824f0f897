use std::sync::Arc;

use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use tracing::warn;

use crate::db::plan_repository::PlanRepository;
use crate::models::plan::{Plan, PlanTier};
use crate::services::billing::error::BillingError;

/// Compiled-in catalog consulted when the persisted one has no match.
static BUILT_IN_PLANS: Lazy<Vec<Plan>> = Lazy::new(|| {
    vec![
        Plan {
            id: "free".into(),
            name: "Free".into(),
            tier: PlanTier::Free,
            price: Decimal::ZERO,
            active: true,
        },
        Plan {
            id: "premium".into(),
            name: "Premium".into(),
            tier: PlanTier::Premium,
            price: Decimal::new(2900, 2),
            active: true,
        },
        Plan {
            id: "pro".into(),
            name: "Pro".into(),
            tier: PlanTier::Pro,
            price: Decimal::new(9900, 2),
            active: true,
        },
    ]
});

pub fn built_in_plans() -> &'static [Plan] {
    &BUILT_IN_PLANS
}

#[derive(Clone)]
pub struct PlanCatalog {
    plans: Arc<dyn PlanRepository>,
}

impl PlanCatalog {
    pub fn new(plans: Arc<dyn PlanRepository>) -> Self {
        Self { plans }
    }

    /// Exact id, then tier or display name, in the persisted catalog; then the
    /// same two lookups against the built-in catalog.
    pub async fn resolve(&self, reference: &str) -> Result<Plan, BillingError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BillingError::PlanNotFound(String::new()));
        }

        match self.plans.find_plan_by_id(reference).await {
            Ok(Some(plan)) => return Ok(plan),
            Ok(None) => {}
            Err(err) => warn!(?err, reference, "persisted plan lookup by id failed"),
        }
        match self.plans.find_plan_by_label(reference).await {
            Ok(Some(plan)) => return Ok(plan),
            Ok(None) => {}
            Err(err) => warn!(?err, reference, "persisted plan lookup by label failed"),
        }

        let builtin = built_in_plans();
        builtin
            .iter()
            .find(|p| p.id == reference)
            .or_else(|| builtin.iter().find(|p| p.matches_label(reference)))
            .cloned()
            .ok_or_else(|| BillingError::PlanNotFound(reference.to_string()))
    }

    /// Active persisted plans by price, or the built-in catalog when there are none.
    pub async fn list_plans(&self) -> Vec<Plan> {
        match self.plans.list_active_plans().await {
            Ok(plans) if !plans.is_empty() => plans,
            Ok(_) => built_in_plans().to_vec(),
            Err(err) => {
                warn!(?err, "listing persisted plans failed; serving built-in catalog");
                built_in_plans().to_vec()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock_db::MockDb;

    fn persisted_premium() -> Plan {
        Plan {
            id: "plan_2026_premium".into(),
            name: "Premium Monthly".into(),
            tier: PlanTier::Premium,
            price: Decimal::new(3400, 2),
            active: true,
        }
    }

    #[tokio::test]
    async fn persisted_catalog_wins_over_built_in() {
        let catalog = PlanCatalog::new(Arc::new(MockDb::default().with_plan(persisted_premium())));

        let by_id = catalog.resolve("plan_2026_premium").await.unwrap();
        assert_eq!(by_id.price, Decimal::new(3400, 2));

        let by_tier = catalog.resolve("Premium").await.unwrap();
        assert_eq!(by_tier.id, "plan_2026_premium");

        let by_name = catalog.resolve("premium monthly").await.unwrap();
        assert_eq!(by_name.id, "plan_2026_premium");
    }

    #[tokio::test]
    async fn falls_back_to_built_in_catalog() {
        let catalog = PlanCatalog::new(Arc::new(MockDb::default()));
        let pro = catalog.resolve("PRO").await.unwrap();
        assert_eq!(pro.id, "pro");
        assert_eq!(pro.price_minor(), 9900);
    }

    #[tokio::test]
    async fn database_errors_fall_back_to_built_in_catalog() {
        let db = MockDb {
            fail_plan_lookups: true,
            ..Default::default()
        };
        let catalog = PlanCatalog::new(Arc::new(db));
        assert_eq!(catalog.resolve("premium").await.unwrap().price_minor(), 2900);
        assert_eq!(catalog.list_plans().await.len(), 3);
    }

    #[tokio::test]
    async fn unknown_or_blank_reference_is_not_found() {
        let catalog = PlanCatalog::new(Arc::new(MockDb::default()));
        assert!(matches!(
            catalog.resolve("nonexistent-tier").await,
            Err(BillingError::PlanNotFound(_))
        ));
        assert!(matches!(
            catalog.resolve("   ").await,
            Err(BillingError::PlanNotFound(_))
        ));
    }

    #[tokio::test]
    async fn listing_prefers_persisted_active_plans() {
        let mut retired = persisted_premium();
        retired.id = "plan_legacy".into();
        retired.active = false;
        let db = MockDb::default()
            .with_plan(persisted_premium())
            .with_plan(retired);
        let catalog = PlanCatalog::new(Arc::new(db));

        let plans = catalog.list_plans().await;
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].id, "plan_2026_premium");
    }
}
