//! Payment provider adapters.
//!
//! Every provider speaks the same two-step protocol: `initiate` a charge and
//! receive an opaque handle, then `check_status` on that handle until the
//! provider reports a terminal result. Push-style providers deliver results
//! through a [`CallbackInbox`] which `check_status` consults first.

pub mod callback;
pub mod kcb;
pub mod manual;
pub mod mpesa;
pub mod msisdn;

pub use callback::{tokenized_callback_url, CallbackInbox, Delivery, ProviderCallback};
pub use kcb::KcbGateway;
pub use manual::ManualGateway;
pub use mpesa::MpesaGateway;
pub use msisdn::normalize_msisdn;

use crate::error::GatewayError;
use crate::models::{PaymentMethod, PaymentSource};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Mpesa,
    Kcb,
    Manual,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mpesa => "mpesa",
            Self::Kcb => "kcb",
            Self::Manual => "manual",
        }
    }

    /// Payment method recorded on the ledger for money collected this way.
    pub fn payment_method(&self) -> PaymentMethod {
        match self {
            Self::Mpesa => PaymentMethod::Mpesa,
            Self::Kcb => PaymentMethod::Bank,
            Self::Manual => PaymentMethod::Manual,
        }
    }

    pub fn payment_source(&self) -> PaymentSource {
        match self {
            Self::Mpesa => PaymentSource::Portal,
            Self::Kcb => PaymentSource::Sandbox,
            Self::Manual => PaymentSource::Counter,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mpesa" | "m-pesa" => Ok(Self::Mpesa),
            "kcb" => Ok(Self::Kcb),
            "manual" => Ok(Self::Manual),
            other => Err(GatewayError::UnsupportedProvider(other.to_string())),
        }
    }
}

/// How often and for how long a pending charge is polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
    /// Wall-clock ceiling measured from initiation.
    pub ceiling: Duration,
}

impl PollPolicy {
    pub fn mpesa_default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_polls: 36,
            ceiling: Duration::from_secs(180),
        }
    }

    pub fn kcb_default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_polls: 60,
            ceiling: Duration::from_secs(180),
        }
    }

    pub fn immediate() -> Self {
        Self {
            interval: Duration::from_millis(0),
            max_polls: 1,
            ceiling: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    /// Our correlation id for this charge; echoed in provider references.
    pub reference: Uuid,
    pub tenant_id: Uuid,
    pub amount: Decimal,
    pub phone: Option<String>,
    pub narrative: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Pending,
    Paid,
    Failed,
}

impl GatewayStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Provider acknowledgement of a charge request.
#[derive(Debug, Clone)]
pub struct ChargeHandle {
    pub payment_handle: String,
    pub provider_message: String,
    pub status: GatewayStatus,
    /// Normalised MSISDN the prompt was sent to.
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: GatewayStatus,
    pub notes: Option<String>,
    /// Provider receipt, when the provider issues one.
    pub receipt: Option<String>,
    /// Amount the provider reports as collected.
    pub amount: Option<Decimal>,
}

impl StatusReport {
    pub fn pending() -> Self {
        Self {
            status: GatewayStatus::Pending,
            notes: None,
            receipt: None,
            amount: None,
        }
    }

    pub fn paid(receipt: Option<String>, amount: Option<Decimal>) -> Self {
        Self {
            status: GatewayStatus::Paid,
            notes: None,
            receipt,
            amount,
        }
    }

    pub fn failed(notes: impl Into<String>) -> Self {
        Self {
            status: GatewayStatus::Failed,
            notes: Some(notes.into()),
            receipt: None,
            amount: None,
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> Provider;

    fn poll_policy(&self) -> PollPolicy;

    async fn initiate(&self, request: &ChargeRequest) -> Result<ChargeHandle, GatewayError>;

    /// Idempotent: once a terminal status is reported it is reported again
    /// on every later call for the same handle.
    async fn check_status(&self, payment_handle: &str) -> Result<StatusReport, GatewayError>;

    /// Inbox for provider push notifications, if the provider sends them.
    fn callbacks(&self) -> Option<&CallbackInbox> {
        None
    }
}

/// The configured gateways, keyed by provider.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<Provider, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.register(gateway);
        self
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        self.gateways.insert(gateway.provider(), gateway);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn PaymentGateway>, GatewayError> {
        self.gateways
            .get(&provider)
            .cloned()
            .ok_or(GatewayError::NotConfigured(provider.as_str()))
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.gateways.keys().copied().collect();
        providers.sort_by_key(|p| p.as_str());
        providers
    }
}

/// Minimum-amount and positivity check shared by the mobile-money adapters.
pub(crate) fn check_amount(
    provider: Provider,
    amount: Decimal,
    minimum: Decimal,
) -> Result<(), GatewayError> {
    if amount <= Decimal::ZERO || amount < minimum {
        return Err(GatewayError::BelowMinimum {
            provider: provider.as_str(),
            amount,
            minimum,
        });
    }
    Ok(())
}

/// Mobile-money rails take whole shillings only.
pub(crate) fn whole_shillings(provider: Provider, amount: Decimal) -> Result<u64, GatewayError> {
    if amount.fract() != Decimal::ZERO {
        return Err(GatewayError::rejected(
            provider.as_str(),
            format!("amount {} must be a whole number of shillings", amount),
        ));
    }
    amount
        .to_u64()
        .ok_or_else(|| GatewayError::rejected(provider.as_str(), "amount out of range"))
}
