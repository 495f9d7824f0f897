use thiserror::Error;
use uuid::Uuid;

use crate::services::gateway::GatewayError;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("plan not found: {0}")]
    PlanNotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("another plan change is already being paid for")]
    ChangeInProgress,
    #[error("user {0} not found")]
    UserNotFound(Uuid),
    #[error("payment gateway error: {0}")]
    Gateway(#[from] GatewayError),
    /// Money moved on the gateway but local state could not follow.
    #[error("settlement requires manual reconciliation: {0}")]
    SettlementInconsistency(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
