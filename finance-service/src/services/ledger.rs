//! The ledger facade used by handlers and the reconciler.
//!
//! Every successful write invalidates the tenant's cached summary before it
//! returns and publishes a [`LedgerEvent`] to subscribers.

use crate::config::BillingConfig;
use crate::error::FinanceError;
use crate::models::money::to_cents;
use crate::models::{
    Adjustment, AdjustmentKind, BillingPeriod, FinanceSummary, HistoryLine, Invoice,
    InvoiceStatus, LedgerEntry, Payment, PaymentMethod, PaymentSource, PaymentStatus, Tenant, Unit,
};
use crate::services::clock::{BillingCalendar, Clock};
use crate::services::metrics::{LEDGER_WRITES_TOTAL, SUMMARY_REQUESTS_TOTAL};
use crate::services::store::{LedgerStore, TenantBook};
use crate::services::summary::{calculate, SummaryCache};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::instrument;
use uuid::Uuid;

/// Change notification published after each committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    TenantChanged { tenant_id: Uuid },
    InvoiceIssued { tenant_id: Uuid, invoice_id: Uuid },
    PaymentRecorded { tenant_id: Uuid, payment_id: Uuid },
    PaymentSettled { tenant_id: Uuid, payment_id: Uuid },
    AdjustmentRecorded { tenant_id: Uuid, adjustment_id: Uuid },
}

impl LedgerEvent {
    pub fn tenant_id(&self) -> Uuid {
        match self {
            Self::TenantChanged { tenant_id }
            | Self::InvoiceIssued { tenant_id, .. }
            | Self::PaymentRecorded { tenant_id, .. }
            | Self::PaymentSettled { tenant_id, .. }
            | Self::AdjustmentRecorded { tenant_id, .. } => *tenant_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewTenant {
    pub tenant_id: Option<Uuid>,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub tenant_id: Uuid,
    pub unit_id: Option<Uuid>,
    pub period: BillingPeriod,
    /// Defaults to the unit's monthly rent.
    pub amount_due: Option<Decimal>,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub tenant_id: Uuid,
    pub unit_id: Option<Uuid>,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub source: PaymentSource,
    pub external_tx_id: Option<String>,
    pub phone: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone)]
pub struct NewAdjustment {
    pub tenant_id: Uuid,
    pub unit_id: Option<Uuid>,
    pub amount: Decimal,
    pub kind: AdjustmentKind,
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    cache: Arc<SummaryCache>,
    events: broadcast::Sender<LedgerEvent>,
    clock: Arc<dyn Clock>,
    calendar: BillingCalendar,
    history_default_limit: usize,
    history_max_limit: usize,
}

fn require_tenant(tenant_id: Uuid) -> Result<(), FinanceError> {
    if tenant_id.is_nil() {
        return Err(FinanceError::validation("tenantId is required"));
    }
    Ok(())
}

fn positive_amount(amount: Decimal, field: &str) -> Result<Decimal, FinanceError> {
    let amount = to_cents(amount);
    if amount <= Decimal::ZERO {
        return Err(FinanceError::validation(format!(
            "{} must be greater than zero",
            field
        )));
    }
    Ok(amount)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>, billing: &BillingConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            cache: Arc::new(SummaryCache::new()),
            events,
            clock,
            calendar: BillingCalendar::new(billing.utc_offset_minutes, billing.invoice_due_day),
            history_default_limit: billing.history_default_limit,
            history_max_limit: billing.history_max_limit.max(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    pub fn cache(&self) -> &SummaryCache {
        &self.cache
    }

    pub fn calendar(&self) -> &BillingCalendar {
        &self.calendar
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn health_check(&self) -> Result<(), FinanceError> {
        self.store.health_check().await
    }

    fn committed(&self, kind: &'static str, event: LedgerEvent) {
        self.cache.invalidate(event.tenant_id());
        LEDGER_WRITES_TOTAL.with_label_values(&[kind, "ok"]).inc();
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn failed(&self, kind: &'static str, err: FinanceError) -> FinanceError {
        LEDGER_WRITES_TOTAL
            .with_label_values(&[kind, err.kind()])
            .inc();
        err
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn register_tenant(&self, request: NewTenant) -> Result<Tenant, FinanceError> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(FinanceError::validation("name is required"));
        }
        let tenant_id = request.tenant_id.unwrap_or_else(Uuid::new_v4);
        require_tenant(tenant_id)?;

        let tenant = self
            .store
            .upsert_tenant(Tenant {
                tenant_id,
                name,
                phone: non_empty(request.phone),
                email: non_empty(request.email),
                unit: None,
                created_at: self.clock.now(),
            })
            .await
            .map_err(|e| self.failed("tenant", e))?;

        tracing::info!(tenant_id = %tenant.tenant_id, "Tenant registered");
        self.committed("tenant", LedgerEvent::TenantChanged { tenant_id });
        Ok(tenant)
    }

    /// Set the tenant's active unit, optionally issuing the current period's
    /// invoice. An invoice already issued for the period is returned as is.
    #[instrument(skip(self, unit), fields(unit_id = %unit.unit_id))]
    pub async fn assign_unit(
        &self,
        tenant_id: Uuid,
        mut unit: Unit,
        issue_invoice: bool,
    ) -> Result<(Tenant, Option<Invoice>), FinanceError> {
        require_tenant(tenant_id)?;
        unit.monthly_rent = positive_amount(unit.monthly_rent, "monthlyRent")?;
        unit.label = non_empty(unit.label);

        let tenant = self
            .store
            .assign_unit(tenant_id, unit)
            .await
            .map_err(|e| self.failed("tenant", e))?;
        self.committed("tenant", LedgerEvent::TenantChanged { tenant_id });

        if !issue_invoice {
            return Ok((tenant, None));
        }

        let period = self.calendar.period_at(self.clock.now());
        let invoice = match self
            .issue_invoice(NewInvoice {
                tenant_id,
                unit_id: tenant.unit_id(),
                period,
                amount_due: None,
                due_date: None,
            })
            .await
        {
            Ok(invoice) => Some(invoice),
            Err(FinanceError::Conflict(_)) => self.get_active_invoice(tenant_id).await?,
            Err(e) => return Err(e),
        };
        Ok((tenant, invoice))
    }

    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, period = %request.period))]
    pub async fn issue_invoice(&self, request: NewInvoice) -> Result<Invoice, FinanceError> {
        require_tenant(request.tenant_id)?;
        let tenant = self.tenant(request.tenant_id).await?;

        let amount_due = match request.amount_due.or_else(|| tenant.monthly_rent()) {
            Some(amount) => positive_amount(amount, "amountDue")?,
            None => {
                return Err(FinanceError::validation(
                    "amountDue is required when the tenant has no unit",
                ))
            }
        };

        let invoice = Invoice {
            invoice_id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            unit_id: request.unit_id.or_else(|| tenant.unit_id()),
            period_year: request.period.year,
            period_month: request.period.month,
            amount_due,
            amount_paid: Decimal::ZERO,
            status: InvoiceStatus::Open,
            due_date: request
                .due_date
                .unwrap_or_else(|| self.calendar.default_due_date(request.period)),
            issued_at: self.clock.now(),
        };

        let invoice = self
            .store
            .insert_invoice(invoice)
            .await
            .map_err(|e| self.failed("invoice", e))?;

        tracing::info!(
            invoice_id = %invoice.invoice_id,
            amount_due = %invoice.amount_due,
            amount_paid = %invoice.amount_paid,
            "Invoice issued"
        );
        self.committed(
            "invoice",
            LedgerEvent::InvoiceIssued {
                tenant_id: invoice.tenant_id,
                invoice_id: invoice.invoice_id,
            },
        );
        Ok(invoice)
    }

    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, amount = %request.amount, status = request.status.as_str()))]
    pub async fn record_payment(&self, request: NewPayment) -> Result<Payment, FinanceError> {
        require_tenant(request.tenant_id)?;
        let amount = positive_amount(request.amount, "amount")?;
        let now = self.clock.now();

        let payment = Payment {
            payment_id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            unit_id: request.unit_id,
            amount,
            method: request.method,
            source: request.source,
            external_tx_id: non_empty(request.external_tx_id),
            phone: non_empty(request.phone),
            paid_at: request.paid_at.unwrap_or(now),
            status: request.status,
            description: non_empty(request.description),
            notes: non_empty(request.notes),
            recorded_at: now,
        };

        let recorded = self
            .store
            .insert_payment(payment)
            .await
            .map_err(|e| self.failed("payment", e))?;

        if recorded.created {
            tracing::info!(payment_id = %recorded.payment.payment_id, "Payment recorded");
            self.committed(
                "payment",
                LedgerEvent::PaymentRecorded {
                    tenant_id: recorded.payment.tenant_id,
                    payment_id: recorded.payment.payment_id,
                },
            );
        } else {
            tracing::info!(
                payment_id = %recorded.payment.payment_id,
                external_tx_id = ?recorded.payment.external_tx_id,
                "Duplicate payment ignored"
            );
        }
        Ok(recorded.payment)
    }

    #[instrument(skip(self, notes))]
    pub async fn settle_payment(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        notes: Option<String>,
    ) -> Result<Payment, FinanceError> {
        let payment = self
            .store
            .settle_payment(payment_id, status, self.clock.now(), non_empty(notes))
            .await
            .map_err(|e| self.failed("settlement", e))?;

        tracing::info!(tenant_id = %payment.tenant_id, status = payment.status.as_str(), "Payment settled");
        self.committed(
            "settlement",
            LedgerEvent::PaymentSettled {
                tenant_id: payment.tenant_id,
                payment_id,
            },
        );
        Ok(payment)
    }

    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, kind = request.kind.as_str()))]
    pub async fn record_adjustment(&self, request: NewAdjustment) -> Result<Adjustment, FinanceError> {
        require_tenant(request.tenant_id)?;
        let amount = positive_amount(request.amount, "amount")?;

        let adjustment = self
            .store
            .insert_adjustment(Adjustment {
                adjustment_id: Uuid::new_v4(),
                tenant_id: request.tenant_id,
                unit_id: request.unit_id,
                amount,
                kind: request.kind,
                reason: non_empty(request.reason),
                created_at: self.clock.now(),
            })
            .await
            .map_err(|e| self.failed("adjustment", e))?;

        tracing::info!(adjustment_id = %adjustment.adjustment_id, amount = %adjustment.amount, "Adjustment recorded");
        self.committed(
            "adjustment",
            LedgerEvent::AdjustmentRecorded {
                tenant_id: adjustment.tenant_id,
                adjustment_id: adjustment.adjustment_id,
            },
        );
        Ok(adjustment)
    }

    pub async fn tenant(&self, tenant_id: Uuid) -> Result<Tenant, FinanceError> {
        require_tenant(tenant_id)?;
        Ok(self.store.load_book(tenant_id).await?.tenant)
    }

    /// Newest first, at most `limit` lines (configured default when `None`).
    #[instrument(skip(self))]
    pub async fn list_history(
        &self,
        tenant_id: Uuid,
        unit_id: Option<Uuid>,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryLine>, FinanceError> {
        require_tenant(tenant_id)?;
        let limit = limit
            .unwrap_or(self.history_default_limit)
            .min(self.history_max_limit);
        let book = self.store.load_book(tenant_id).await?;
        let mut lines = history(&book, unit_id);
        lines.truncate(limit);
        Ok(lines)
    }

    /// The invoice for the current billing period, if one was issued.
    pub async fn get_active_invoice(&self, tenant_id: Uuid) -> Result<Option<Invoice>, FinanceError> {
        require_tenant(tenant_id)?;
        let period = self.calendar.period_at(self.clock.now());
        let book = self.store.load_book(tenant_id).await?;
        Ok(book.invoices.into_iter().find(|i| i.period() == period))
    }

    #[instrument(skip(self))]
    pub async fn summary(&self, tenant_id: Uuid) -> Result<FinanceSummary, FinanceError> {
        require_tenant(tenant_id)?;
        let now = self.clock.now();
        let period = self.calendar.period_at(now);

        if let Some(cached) = self.cache.get(tenant_id, period) {
            SUMMARY_REQUESTS_TOTAL.with_label_values(&["hit"]).inc();
            return Ok(cached);
        }
        SUMMARY_REQUESTS_TOTAL.with_label_values(&["miss"]).inc();

        let generation = self.cache.generation(tenant_id);
        let book = self.store.load_book(tenant_id).await?;
        let summary = calculate(&book, &self.calendar, now);
        self.cache.store(tenant_id, generation, summary.clone());
        Ok(summary)
    }

    pub async fn summaries(&self) -> Result<Vec<FinanceSummary>, FinanceError> {
        let mut summaries = Vec::new();
        for tenant_id in self.store.tenant_ids().await? {
            summaries.push(self.summary(tenant_id).await?);
        }
        Ok(summaries)
    }
}

/// Chronological projection with running balance, returned newest first.
pub fn history(book: &TenantBook, unit_id: Option<Uuid>) -> Vec<HistoryLine> {
    let mut entries: Vec<LedgerEntry> = book
        .invoices
        .iter()
        .cloned()
        .map(LedgerEntry::Charge)
        .chain(book.payments.iter().cloned().map(LedgerEntry::Payment))
        .chain(book.adjustments.iter().cloned().map(LedgerEntry::Adjustment))
        .filter(|e| unit_id.is_none() || e.unit_id() == unit_id)
        .collect();
    entries.sort_by_key(|e| (e.occurred_at(), e.order_key()));

    let mut running = Decimal::ZERO;
    let mut lines: Vec<HistoryLine> = entries
        .into_iter()
        .map(|entry| {
            running += entry.balance_effect();
            HistoryLine {
                entry,
                running_balance: running,
            }
        })
        .collect();
    lines.reverse();
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PaymentAllocation, Unit};
    use chrono::Duration;

    fn book_with_activity() -> TenantBook {
        let tenant_id = Uuid::new_v4();
        let unit_id = Uuid::new_v4();
        let t0: DateTime<Utc> = "2026-03-01T06:00:00Z".parse().unwrap();
        let mut book = TenantBook::new(Tenant {
            tenant_id,
            name: "Wanjiru".to_string(),
            phone: None,
            email: None,
            unit: Some(Unit {
                unit_id,
                property_id: None,
                label: Some("B4".to_string()),
                monthly_rent: Decimal::from(20000),
            }),
            created_at: t0,
        });

        book.invoices.push(Invoice {
            invoice_id: Uuid::new_v4(),
            tenant_id,
            unit_id: Some(unit_id),
            period_year: 2026,
            period_month: 3,
            amount_due: Decimal::from(20000),
            amount_paid: Decimal::ZERO,
            status: InvoiceStatus::Open,
            due_date: NaiveDate::from_ymd_opt(2026, 3, 5).unwrap(),
            issued_at: t0,
        });
        for (offset, status) in [(1, PaymentStatus::Paid), (2, PaymentStatus::Failed)] {
            book.payments.push(Payment {
                payment_id: Uuid::new_v4(),
                tenant_id,
                unit_id: Some(unit_id),
                amount: Decimal::from(8000),
                method: PaymentMethod::Mpesa,
                source: PaymentSource::Portal,
                external_tx_id: None,
                phone: None,
                paid_at: t0 + Duration::days(offset),
                status,
                description: None,
                notes: None,
                recorded_at: t0 + Duration::days(offset),
            });
        }
        book.adjustments.push(Adjustment {
            adjustment_id: Uuid::new_v4(),
            tenant_id,
            unit_id: None,
            amount: Decimal::from(500),
            kind: AdjustmentKind::Debit,
            reason: Some("Water".to_string()),
            created_at: t0 + Duration::days(3),
        });
        book.allocations.push(PaymentAllocation {
            payment_id: book.payments[0].payment_id,
            invoice_id: book.invoices[0].invoice_id,
            amount: Decimal::from(8000),
            applied_at: t0 + Duration::days(1),
        });
        book
    }

    #[test]
    fn history_is_newest_first_with_running_balance() {
        let book = book_with_activity();
        let lines = history(&book, None);

        assert_eq!(lines.len(), 4);
        assert!(matches!(lines[0].entry, LedgerEntry::Adjustment(_)));
        assert!(matches!(lines[3].entry, LedgerEntry::Charge(_)));
        assert_eq!(lines[3].running_balance, Decimal::from(20000));
        assert_eq!(lines[2].running_balance, Decimal::from(12000));
        // Failed payment leaves the balance untouched.
        assert_eq!(lines[1].running_balance, Decimal::from(12000));
        assert_eq!(lines[0].running_balance, Decimal::from(12500));
    }

    #[test]
    fn unit_filter_drops_unscoped_entries() {
        let book = book_with_activity();
        let unit_id = book.tenant.unit_id();
        let lines = history(&book, unit_id);
        assert_eq!(lines.len(), 3);
        assert!(lines
            .iter()
            .all(|l| !matches!(l.entry, LedgerEntry::Adjustment(_))));
    }

    #[test]
    fn history_lines_serialize_with_type_tag() {
        let book = book_with_activity();
        let json = serde_json::to_value(&history(&book, None)[3]).unwrap();
        assert_eq!(json["type"], "charge");
        assert_eq!(json["periodMonth"], 3);
        assert_eq!(json["runningBalance"], "20000");
    }

    #[test]
    fn rejects_non_positive_amounts() {
        assert!(positive_amount(Decimal::ZERO, "amount").is_err());
        assert!(positive_amount(Decimal::new(-1, 0), "amount").is_err());
        // Rounds to zero cents.
        assert!(positive_amount(Decimal::new(4, 3), "amount").is_err());
        assert_eq!(
            positive_amount(Decimal::new(10005, 3), "amount").unwrap(),
            Decimal::new(1001, 2)
        );
    }
}
