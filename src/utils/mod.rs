pub mod jwt;
pub mod money;
