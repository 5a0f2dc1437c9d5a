//! Configuration module for finance-service.

use crate::services::gateway::PollPolicy;
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FinanceConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// `None` runs the ledger in memory.
    pub database: Option<DatabaseConfig>,
    pub billing: BillingConfig,
    pub payments: PaymentsConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Offset of the property's local time from UTC. Month boundaries are
    /// computed in this zone.
    pub utc_offset_minutes: i32,
    pub invoice_due_day: u32,
    pub history_default_limit: usize,
    pub history_max_limit: usize,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 180,
            invoice_due_day: 5,
            history_default_limit: 50,
            history_max_limit: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    pub mpesa: Option<MpesaConfig>,
    pub kcb: Option<KcbConfig>,
    pub manual_enabled: bool,
    /// How long finished attempts stay queryable.
    pub attempt_retention: Duration,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            mpesa: None,
            kcb: None,
            manual_enabled: true,
            attempt_retention: Duration::from_secs(3600),
        }
    }
}

/// Safaricom Daraja STK push credentials.
#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub base_url: String,
    pub consumer_key: Secret<String>,
    pub consumer_secret: Secret<String>,
    pub short_code: String,
    pub pass_key: Secret<String>,
    pub callback_url: String,
    /// Shared token callback requests must present as `?token=`. Callbacks
    /// are refused while unset.
    pub callback_token: Option<Secret<String>>,
    /// How long issued handles accept callbacks.
    pub callback_retention: Duration,
    pub account_reference: String,
    pub transaction_type: String,
    pub min_amount: Decimal,
    pub poll: PollPolicy,
}

/// KCB Buni STK push credentials.
#[derive(Debug, Clone)]
pub struct KcbConfig {
    pub base_url: String,
    pub consumer_key: Secret<String>,
    pub consumer_secret: Secret<String>,
    pub org_short_code: String,
    pub org_pass_key: Secret<String>,
    pub callback_url: String,
    pub callback_token: Option<Secret<String>>,
    pub callback_retention: Duration,
    pub min_amount: Decimal,
    pub poll: PollPolicy,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_secret(key: &str) -> Secret<String> {
    Secret::new(env::var(key).unwrap_or_default())
}

fn env_optional_secret(key: &str) -> Option<Secret<String>> {
    env::var(key).ok().filter(|v| !v.is_empty()).map(Secret::new)
}

fn retention_from_env() -> Duration {
    Duration::from_secs(env_parse("PAYMENTS_ATTEMPT_RETENTION_SECS", 3600))
}

fn poll_from_env(prefix: &str, default: PollPolicy) -> PollPolicy {
    PollPolicy {
        interval: Duration::from_millis(env_parse(
            &format!("{}_POLL_INTERVAL_MS", prefix),
            default.interval.as_millis() as u64,
        )),
        max_polls: env_parse(&format!("{}_POLL_MAX_ATTEMPTS", prefix), default.max_polls),
        ceiling: Duration::from_secs(env_parse(
            &format!("{}_POLL_CEILING_SECS", prefix),
            default.ceiling.as_secs(),
        )),
    }
}

impl MpesaConfig {
    /// Enabled when `MPESA_CONSUMER_KEY` is set.
    pub fn from_env() -> Option<Self> {
        env::var("MPESA_CONSUMER_KEY").ok().filter(|k| !k.is_empty())?;

        Some(Self {
            base_url: env::var("MPESA_BASE_URL")
                .unwrap_or_else(|_| "https://sandbox.safaricom.co.ke".to_string()),
            consumer_key: env_secret("MPESA_CONSUMER_KEY"),
            consumer_secret: env_secret("MPESA_CONSUMER_SECRET"),
            short_code: env::var("MPESA_SHORT_CODE").unwrap_or_else(|_| "174379".to_string()),
            pass_key: env_secret("MPESA_PASS_KEY"),
            callback_url: env::var("MPESA_CALLBACK_URL").unwrap_or_else(|_| {
                "http://localhost:8080/payments/mpesa/callback".to_string()
            }),
            callback_token: env_optional_secret("MPESA_CALLBACK_TOKEN"),
            callback_retention: retention_from_env(),
            account_reference: env::var("MPESA_ACCOUNT_REFERENCE")
                .unwrap_or_else(|_| "RENT".to_string()),
            transaction_type: env::var("MPESA_TRANSACTION_TYPE")
                .unwrap_or_else(|_| "CustomerPayBillOnline".to_string()),
            min_amount: env_parse("MPESA_MIN_AMOUNT", Decimal::ONE),
            poll: poll_from_env("MPESA", PollPolicy::mpesa_default()),
        })
    }
}

impl KcbConfig {
    /// Enabled when `KCB_CONSUMER_KEY` is set.
    pub fn from_env() -> Option<Self> {
        env::var("KCB_CONSUMER_KEY").ok().filter(|k| !k.is_empty())?;

        Some(Self {
            base_url: env::var("KCB_BASE_URL")
                .unwrap_or_else(|_| "https://uat.buni.kcbgroup.com".to_string()),
            consumer_key: env_secret("KCB_CONSUMER_KEY"),
            consumer_secret: env_secret("KCB_CONSUMER_SECRET"),
            org_short_code: env::var("KCB_ORG_SHORT_CODE").unwrap_or_else(|_| "174379".to_string()),
            org_pass_key: env_secret("KCB_ORG_PASS_KEY"),
            callback_url: env::var("KCB_CALLBACK_URL")
                .unwrap_or_else(|_| "http://localhost:8080/payments/kcb/callback".to_string()),
            callback_token: env_optional_secret("KCB_CALLBACK_TOKEN"),
            callback_retention: retention_from_env(),
            min_amount: env_parse("KCB_MIN_AMOUNT", Decimal::TEN),
            poll: poll_from_env("KCB", PollPolicy::kcb_default()),
        })
    }
}

impl FinanceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let database = match env::var("DATABASE_URL") {
            Ok(url) if !url.is_empty() => Some(DatabaseConfig {
                url,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS", 2),
            }),
            _ => None,
        };

        let defaults = BillingConfig::default();
        let billing = BillingConfig {
            utc_offset_minutes: env_parse("BILLING_UTC_OFFSET_MINUTES", defaults.utc_offset_minutes),
            invoice_due_day: env_parse("BILLING_INVOICE_DUE_DAY", defaults.invoice_due_day),
            history_default_limit: env_parse(
                "HISTORY_DEFAULT_LIMIT",
                defaults.history_default_limit,
            ),
            history_max_limit: env_parse("HISTORY_MAX_LIMIT", defaults.history_max_limit),
        };

        if !(-14 * 60..=14 * 60).contains(&billing.utc_offset_minutes) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BILLING_UTC_OFFSET_MINUTES must be within +/-840"
            )));
        }
        if !(1..=28).contains(&billing.invoice_due_day) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BILLING_INVOICE_DUE_DAY must be between 1 and 28"
            )));
        }

        let payments = PaymentsConfig {
            mpesa: MpesaConfig::from_env(),
            kcb: KcbConfig::from_env(),
            manual_enabled: env_parse("MANUAL_PROVIDER_ENABLED", true),
            attempt_retention: retention_from_env(),
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "finance-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database,
            billing,
            payments,
        })
    }
}
