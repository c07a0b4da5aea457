//! Configuration module for recon-service.

use recon_core::config as core_config;
use recon_core::error::AppError;
use rust_decimal::Decimal;
use std::env;

use crate::services::matching::{MissingDatePolicy, TolerancePolicy};

#[derive(Debug, Clone)]
pub struct ReconConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub tolerances: ToleranceConfig,
    /// Runs with more discrepancies than this finish as `partial`.
    pub partial_threshold: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: Option<String>,
    pub api_token: Option<String>,
    pub timeout_secs: u64,
}

/// Environment-sourced matching tolerances. Out-of-range values are clamped
/// by the policy, never rejected.
#[derive(Debug, Clone)]
pub struct ToleranceConfig {
    pub amount_percentage: Option<Decimal>,
    pub amount_absolute: Option<Decimal>,
    pub date_days: Option<i64>,
    pub fuzzy_threshold: Option<u8>,
    pub fail_closed_on_missing_date: bool,
}

impl ToleranceConfig {
    pub fn to_policy(&self) -> TolerancePolicy {
        let mut policy = TolerancePolicy::default();
        if let Some(pct) = self.amount_percentage {
            policy = policy.with_amount_percentage_tolerance(pct);
        }
        if let Some(abs) = self.amount_absolute {
            policy = policy.with_amount_absolute_tolerance(abs);
        }
        if let Some(days) = self.date_days {
            policy = policy.with_date_tolerance_days(days);
        }
        if let Some(threshold) = self.fuzzy_threshold {
            policy = policy.with_fuzzy_match_threshold(i64::from(threshold));
        }
        if self.fail_closed_on_missing_date {
            policy = policy.with_missing_date_policy(MissingDatePolicy::FailClosed);
        }
        policy
    }
}

impl ReconConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "recon-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            gateway: GatewayConfig {
                url: env::var("GATEWAY_URL").ok().filter(|s| !s.is_empty()),
                api_token: env::var("GATEWAY_API_TOKEN").ok(),
                timeout_secs: env::var("GATEWAY_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            },
            tolerances: ToleranceConfig {
                amount_percentage: env::var("RECON_AMOUNT_PCT_TOLERANCE")
                    .ok()
                    .and_then(|s| s.parse().ok()),
                amount_absolute: env::var("RECON_AMOUNT_ABS_TOLERANCE")
                    .ok()
                    .and_then(|s| s.parse().ok()),
                date_days: env::var("RECON_DATE_TOLERANCE_DAYS")
                    .ok()
                    .and_then(|s| s.parse().ok()),
                fuzzy_threshold: env::var("RECON_FUZZY_THRESHOLD")
                    .ok()
                    .and_then(|s| s.parse().ok()),
                fail_closed_on_missing_date: env::var("RECON_MISSING_DATE_FAIL_CLOSED")
                    .map(|s| s == "true" || s == "1")
                    .unwrap_or(false),
            },
            partial_threshold: env::var("RECON_PARTIAL_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok()),
        })
    }
}
