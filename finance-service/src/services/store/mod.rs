//! Durable state behind the ledger.
//!
//! Each write for a tenant is serialised with every other write for the same
//! tenant and applies its allocations atomically with the record itself.

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use crate::error::FinanceError;
use crate::models::{
    Adjustment, Invoice, Payment, PaymentAllocation, PaymentStatus, Tenant, Unit,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Everything recorded for one tenant.
#[derive(Debug, Clone)]
pub struct TenantBook {
    pub tenant: Tenant,
    pub invoices: Vec<Invoice>,
    pub payments: Vec<Payment>,
    pub allocations: Vec<PaymentAllocation>,
    pub adjustments: Vec<Adjustment>,
}

impl TenantBook {
    pub fn new(tenant: Tenant) -> Self {
        Self {
            tenant,
            invoices: Vec::new(),
            payments: Vec::new(),
            allocations: Vec::new(),
            adjustments: Vec::new(),
        }
    }
}

/// Outcome of recording a payment.
#[derive(Debug, Clone)]
pub struct RecordedPayment {
    pub payment: Payment,
    /// False when an earlier payment with the same external transaction id
    /// was returned instead.
    pub created: bool,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a tenant, or refresh name and contact details of an existing one.
    async fn upsert_tenant(&self, tenant: Tenant) -> Result<Tenant, FinanceError>;

    async fn assign_unit(&self, tenant_id: Uuid, unit: Unit) -> Result<Tenant, FinanceError>;

    async fn tenant_ids(&self) -> Result<Vec<Uuid>, FinanceError>;

    /// Insert an invoice and apply any credit the tenant holds to it.
    /// Rejects a second invoice for the same tenant and period.
    async fn insert_invoice(&self, invoice: Invoice) -> Result<Invoice, FinanceError>;

    /// Insert a payment, allocating it if paid. A payment whose external
    /// transaction id is already recorded for the tenant is not duplicated.
    async fn insert_payment(&self, payment: Payment) -> Result<RecordedPayment, FinanceError>;

    /// Move a pending payment to paid or failed, exactly once.
    async fn settle_payment(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        settled_at: DateTime<Utc>,
        notes: Option<String>,
    ) -> Result<Payment, FinanceError>;

    async fn insert_adjustment(&self, adjustment: Adjustment) -> Result<Adjustment, FinanceError>;

    async fn load_book(&self, tenant_id: Uuid) -> Result<TenantBook, FinanceError>;

    async fn health_check(&self) -> Result<(), FinanceError>;
}

pub(crate) fn check_settlement(payment: &Payment, status: PaymentStatus) -> Result<(), FinanceError> {
    if status == PaymentStatus::Pending {
        return Err(FinanceError::validation(
            "A payment can only be settled as paid or failed",
        ));
    }
    if payment.status != PaymentStatus::Pending {
        return Err(FinanceError::Conflict(format!(
            "Payment {} is already {}",
            payment.payment_id,
            payment.status.as_str()
        )));
    }
    Ok(())
}

pub(crate) fn duplicate_invoice(invoice: &Invoice) -> FinanceError {
    FinanceError::Conflict(format!(
        "An invoice for {} already exists for tenant {}",
        invoice.period(),
        invoice.tenant_id
    ))
}
