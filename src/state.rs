use std::sync::Arc;

use crate::config::Config;
use crate::db::{
    billing_repository::BillingRepository, plan_history_repository::PlanHistoryRepository,
    user_repository::UserRepository,
};
use crate::services::billing::BillingEngine;
use crate::utils::jwt::{JwtKeyProvider, JwtKeys};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn UserRepository>,
    pub billing_repo: Arc<dyn BillingRepository>,
    pub history_repo: Arc<dyn PlanHistoryRepository>,
    pub billing: BillingEngine,
    pub config: Arc<Config>,
    pub jwt_keys: Arc<JwtKeys>,
}

impl JwtKeyProvider for AppState {
    fn jwt_keys(&self) -> &JwtKeys {
        &self.jwt_keys
    }

    fn jwt_issuer(&self) -> &str {
        &self.config.jwt_issuer
    }

    fn jwt_audience(&self) -> &str {
        &self.config.jwt_audience
    }
}
