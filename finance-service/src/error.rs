//! Domain error taxonomy for the finance ledger and payment reconciliation.

use rust_decimal::Decimal;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by ledger writes, queries and payment attempts.
#[derive(Debug, Error)]
pub enum FinanceError {
    #[error("{0}")]
    Validation(String),

    #[error("Tenant {0} not found")]
    TenantNotFound(Uuid),

    #[error("Payment {0} not found")]
    PaymentNotFound(Uuid),

    #[error("Payment attempt {0} not found")]
    AttemptNotFound(Uuid),

    #[error("{0}")]
    Conflict(String),

    #[error("A payment is already in progress for tenant {tenant_id} (attempt {attempt_id})")]
    AlreadyInProgress { tenant_id: Uuid, attempt_id: Uuid },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("Ledger store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for FinanceError {
    fn from(err: sqlx::Error) -> Self {
        FinanceError::Store(anyhow::Error::new(err))
    }
}

impl FinanceError {
    pub fn validation(message: impl Into<String>) -> Self {
        FinanceError::Validation(message.into())
    }

    /// Metric label for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            FinanceError::Validation(_) => "validation",
            FinanceError::TenantNotFound(_)
            | FinanceError::PaymentNotFound(_)
            | FinanceError::AttemptNotFound(_) => "not_found",
            FinanceError::Conflict(_) | FinanceError::AlreadyInProgress { .. } => "conflict",
            FinanceError::Gateway(_) => "gateway",
            FinanceError::Store(_) => "store",
            FinanceError::Internal(_) => "internal",
        }
    }
}

/// Errors reported by a payment provider adapter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("Invalid phone number '{phone}' for {provider}")]
    InvalidPhone {
        provider: &'static str,
        phone: String,
    },

    #[error("A phone number is required for {0}")]
    PhoneRequired(&'static str),

    #[error("Amount {amount} is below the {provider} minimum of {minimum}")]
    BelowMinimum {
        provider: &'static str,
        amount: Decimal,
        minimum: Decimal,
    },

    #[error("{provider} rejected the request: {message}")]
    Rejected {
        provider: &'static str,
        message: String,
    },

    #[error("{provider} is unavailable: {message}")]
    Unavailable {
        provider: &'static str,
        message: String,
    },

    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("Unknown payment handle {0}")]
    UnknownHandle(String),

    #[error("Unsupported payment provider '{0}'")]
    UnsupportedProvider(String),
}

impl GatewayError {
    /// A failure worth retrying on the next poll: the provider could not be
    /// reached or answered with a server error.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable { .. })
    }

    pub fn unavailable(provider: &'static str, message: impl Into<String>) -> Self {
        GatewayError::Unavailable {
            provider,
            message: message.into(),
        }
    }

    pub fn rejected(provider: &'static str, message: impl Into<String>) -> Self {
        GatewayError::Rejected {
            provider,
            message: message.into(),
        }
    }
}

impl From<FinanceError> for AppError {
    fn from(err: FinanceError) -> Self {
        match err {
            FinanceError::Validation(msg) => AppError::Unprocessable(anyhow::anyhow!(msg)),
            e @ (FinanceError::TenantNotFound(_)
            | FinanceError::PaymentNotFound(_)
            | FinanceError::AttemptNotFound(_)) => AppError::NotFound(anyhow::anyhow!(e.to_string())),
            e @ (FinanceError::Conflict(_) | FinanceError::AlreadyInProgress { .. }) => {
                AppError::Conflict(anyhow::anyhow!(e.to_string()))
            }
            FinanceError::Gateway(e) => match e {
                GatewayError::Unavailable { .. } => AppError::BadGateway(e.to_string()),
                GatewayError::NotConfigured(_) => AppError::ServiceUnavailable(e.to_string()),
                GatewayError::UnknownHandle(_) | GatewayError::UnsupportedProvider(_) => {
                    AppError::NotFound(anyhow::anyhow!(e.to_string()))
                }
                GatewayError::InvalidPhone { .. }
                | GatewayError::PhoneRequired(_)
                | GatewayError::BelowMinimum { .. }
                | GatewayError::Rejected { .. } => {
                    AppError::Unprocessable(anyhow::anyhow!(e.to_string()))
                }
            },
            FinanceError::Store(e) => AppError::DatabaseError(e),
            FinanceError::Internal(msg) => AppError::InternalError(anyhow::anyhow!(msg)),
        }
    }
}
