use std::env;
use std::net::SocketAddr;

use thiserror::Error;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
pub const DEFAULT_CURRENCY: &str = "usd";
pub const DEFAULT_JWT_ISSUER: &str = "plan-settlement";
pub const DEFAULT_JWT_AUDIENCE: &str = "plan-settlement";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Clone, Debug)]
pub struct StripeSettings {
    pub secret_key: String,
}

#[derive(Clone, Debug)]
pub struct BillingSettings {
    /// Lowercase ISO currency code used for every charge and refund.
    pub currency: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub frontend_origin: String,
    pub bind_addr: SocketAddr,
    pub stripe: StripeSettings,
    pub billing: BillingSettings,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn optional(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_currency(raw: &str) -> Result<String, ConfigError> {
    let code = raw.trim().to_ascii_lowercase();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code)
    } else {
        Err(ConfigError::Invalid {
            name: "BILLING_CURRENCY",
            reason: format!("expected a three-letter ISO code, got {raw:?}"),
        })
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok(); // Load .env file

        let bind_raw = optional("BIND_ADDR", DEFAULT_BIND_ADDR);
        let bind_addr = bind_raw
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                name: "BIND_ADDR",
                reason: e.to_string(),
            })?;

        Ok(Config {
            database_url: required("DATABASE_URL")?,
            frontend_origin: required("FRONTEND_ORIGIN")?,
            bind_addr,
            stripe: StripeSettings {
                secret_key: required("STRIPE_SECRET_KEY")?,
            },
            billing: BillingSettings {
                currency: parse_currency(&optional("BILLING_CURRENCY", DEFAULT_CURRENCY))?,
            },
            jwt_secret: required("JWT_SECRET")?,
            jwt_issuer: optional("JWT_ISSUER", DEFAULT_JWT_ISSUER),
            jwt_audience: optional("JWT_AUDIENCE", DEFAULT_JWT_AUDIENCE),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_codes_are_normalized() {
        assert_eq!(parse_currency(" USD ").unwrap(), "usd");
        assert!(matches!(
            parse_currency("us dollars"),
            Err(ConfigError::Invalid { name: "BILLING_CURRENCY", .. })
        ));
    }

    #[test]
    fn missing_required_variable_is_reported_by_name() {
        let err = required("PLAN_SETTLEMENT_TEST_UNSET_VARIABLE").unwrap_err();
        assert_eq!(err, ConfigError::Missing("PLAN_SETTLEMENT_TEST_UNSET_VARIABLE"));
    }
}
