pub mod billing;
pub mod gateway;
