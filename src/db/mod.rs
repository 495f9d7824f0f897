pub mod billing_repository;
pub mod mock_db;
pub mod plan_history_repository;
pub mod plan_repository;
pub mod postgres_billing_repository;
pub mod postgres_plan_history_repository;
pub mod postgres_plan_repository;
pub mod postgres_user_repository;
pub mod user_repository;
