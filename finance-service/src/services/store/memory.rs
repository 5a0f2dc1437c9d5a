//! In-process ledger store.
//!
//! One async mutex per tenant book; map guards are never held across an
//! await.

use super::{check_settlement, duplicate_invoice, LedgerStore, RecordedPayment, TenantBook};
use crate::error::FinanceError;
use crate::models::{Adjustment, Invoice, Payment, PaymentStatus, Tenant, Unit};
use crate::services::allocation::{allocate_payment, apply_credit, available_credit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryLedgerStore {
    books: DashMap<Uuid, Arc<Mutex<TenantBook>>>,
    payment_owners: DashMap<Uuid, Uuid>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn book(&self, tenant_id: Uuid) -> Result<Arc<Mutex<TenantBook>>, FinanceError> {
        self.books
            .get(&tenant_id)
            .map(|b| b.value().clone())
            .ok_or(FinanceError::TenantNotFound(tenant_id))
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn upsert_tenant(&self, tenant: Tenant) -> Result<Tenant, FinanceError> {
        let existing = match self.books.entry(tenant.tenant_id) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(v) => {
                v.insert(Arc::new(Mutex::new(TenantBook::new(tenant.clone()))));
                return Ok(tenant);
            }
        };

        let mut book = existing.lock().await;
        book.tenant.name = tenant.name;
        book.tenant.phone = tenant.phone;
        book.tenant.email = tenant.email;
        if tenant.unit.is_some() {
            book.tenant.unit = tenant.unit;
        }
        Ok(book.tenant.clone())
    }

    async fn assign_unit(&self, tenant_id: Uuid, unit: Unit) -> Result<Tenant, FinanceError> {
        let handle = self.book(tenant_id)?;
        let mut book = handle.lock().await;
        book.tenant.unit = Some(unit);
        Ok(book.tenant.clone())
    }

    async fn tenant_ids(&self) -> Result<Vec<Uuid>, FinanceError> {
        Ok(self.books.iter().map(|e| *e.key()).collect())
    }

    async fn insert_invoice(&self, mut invoice: Invoice) -> Result<Invoice, FinanceError> {
        let handle = self.book(invoice.tenant_id)?;
        let mut book = handle.lock().await;

        if book.invoices.iter().any(|i| i.period() == invoice.period()) {
            return Err(duplicate_invoice(&invoice));
        }

        let credit = available_credit(&book.payments, &book.allocations);
        let issued_at = invoice.issued_at;
        let allocations = apply_credit(&mut invoice, &credit, issued_at);
        book.allocations.extend(allocations);
        book.invoices.push(invoice.clone());
        Ok(invoice)
    }

    async fn insert_payment(&self, payment: Payment) -> Result<RecordedPayment, FinanceError> {
        let handle = self.book(payment.tenant_id)?;
        let mut book = handle.lock().await;

        if let Some(tx_id) = payment.external_tx_id.as_deref() {
            if let Some(existing) = book
                .payments
                .iter()
                .find(|p| p.external_tx_id.as_deref() == Some(tx_id))
            {
                return Ok(RecordedPayment {
                    payment: existing.clone(),
                    created: false,
                });
            }
        }

        if payment.is_paid() {
            let outcome = allocate_payment(
                payment.payment_id,
                payment.amount,
                &mut book.invoices,
                payment.recorded_at,
            );
            book.allocations.extend(outcome.allocations);
        }
        book.payments.push(payment.clone());
        self.payment_owners.insert(payment.payment_id, payment.tenant_id);

        Ok(RecordedPayment {
            payment,
            created: true,
        })
    }

    async fn settle_payment(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        settled_at: DateTime<Utc>,
        notes: Option<String>,
    ) -> Result<Payment, FinanceError> {
        let tenant_id = self
            .payment_owners
            .get(&payment_id)
            .map(|e| *e.value())
            .ok_or(FinanceError::PaymentNotFound(payment_id))?;
        let handle = self.book(tenant_id)?;
        let mut book = handle.lock().await;
        let book = &mut *book;

        let payment = book
            .payments
            .iter_mut()
            .find(|p| p.payment_id == payment_id)
            .ok_or(FinanceError::PaymentNotFound(payment_id))?;
        check_settlement(payment, status)?;

        payment.status = status;
        if notes.is_some() {
            payment.notes = notes;
        }
        if status == PaymentStatus::Paid {
            payment.paid_at = settled_at;
            let outcome =
                allocate_payment(payment.payment_id, payment.amount, &mut book.invoices, settled_at);
            book.allocations.extend(outcome.allocations);
        }
        Ok(payment.clone())
    }

    async fn insert_adjustment(&self, adjustment: Adjustment) -> Result<Adjustment, FinanceError> {
        let handle = self.book(adjustment.tenant_id)?;
        let mut book = handle.lock().await;
        book.adjustments.push(adjustment.clone());
        Ok(adjustment)
    }

    async fn load_book(&self, tenant_id: Uuid) -> Result<TenantBook, FinanceError> {
        let handle = self.book(tenant_id)?;
        let book = handle.lock().await;
        Ok(book.clone())
    }

    async fn health_check(&self) -> Result<(), FinanceError> {
        Ok(())
    }
}
