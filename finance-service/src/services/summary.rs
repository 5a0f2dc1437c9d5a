//! Finance summary calculation and caching.

use crate::models::money::to_cents;
use crate::models::{BillingPeriod, FinanceStatus, FinanceSummary, Payment};
use crate::services::clock::BillingCalendar;
use crate::services::store::TenantBook;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Compute a tenant's summary as of `now`.
///
/// * `current_month_due` is the current period's invoice, or the unit rent
///   when none has been issued yet.
/// * `amount_paid_mtd` sums paid payments dated within the current period.
/// * `arrears_to_date` is what prior-period invoices still owed at the start
///   of the period, less credit paid in before it, plus net adjustments.
/// * Invoices for later periods are ignored.
pub fn calculate(book: &TenantBook, calendar: &BillingCalendar, now: DateTime<Utc>) -> FinanceSummary {
    let period = calendar.period_at(now);
    let period_start = calendar.period_start(period);
    let period_end = calendar.period_start(period.next());

    let paid: HashMap<Uuid, &Payment> = book
        .payments
        .iter()
        .filter(|p| p.is_paid())
        .map(|p| (p.payment_id, p))
        .collect();

    let current_month_due = book
        .invoices
        .iter()
        .filter(|i| i.period() == period)
        .map(|i| i.amount_due)
        .reduce(|a, b| a + b)
        .or_else(|| book.tenant.monthly_rent())
        .unwrap_or(Decimal::ZERO);

    let amount_paid_mtd: Decimal = paid
        .values()
        .filter(|p| p.paid_at >= period_start && p.paid_at < period_end)
        .map(|p| p.amount)
        .sum();

    let prior: HashSet<Uuid> = book
        .invoices
        .iter()
        .filter(|i| i.period() < period)
        .map(|i| i.invoice_id)
        .collect();

    // Allocations made by payments received before the period began.
    let mut settled_before: HashMap<Uuid, Decimal> = HashMap::new();
    let mut applied_to_prior: HashMap<Uuid, Decimal> = HashMap::new();
    for a in &book.allocations {
        let Some(payment) = paid.get(&a.payment_id) else {
            continue;
        };
        if payment.paid_at >= period_start || !prior.contains(&a.invoice_id) {
            continue;
        }
        *settled_before.entry(a.invoice_id).or_default() += a.amount;
        *applied_to_prior.entry(a.payment_id).or_default() += a.amount;
    }

    let owed_on_prior: Decimal = book
        .invoices
        .iter()
        .filter(|i| prior.contains(&i.invoice_id))
        .map(|i| {
            let settled = settled_before.get(&i.invoice_id).copied().unwrap_or_default();
            (i.amount_due - settled).max(Decimal::ZERO)
        })
        .sum();

    let carried_credit: Decimal = paid
        .values()
        .filter(|p| p.paid_at < period_start)
        .map(|p| {
            let applied = applied_to_prior.get(&p.payment_id).copied().unwrap_or_default();
            (p.amount - applied).max(Decimal::ZERO)
        })
        .sum();

    let net_adjustments: Decimal = book
        .adjustments
        .iter()
        .map(|a| a.kind.signed(a.amount))
        .sum();

    let arrears_to_date = to_cents(owed_on_prior - carried_credit + net_adjustments);
    let current_month_due = to_cents(current_month_due);
    let amount_paid_mtd = to_cents(amount_paid_mtd);
    let balance_now = arrears_to_date + current_month_due - amount_paid_mtd;

    FinanceSummary {
        tenant_id: book.tenant.tenant_id,
        period,
        current_month_due,
        amount_paid_mtd,
        arrears_to_date,
        balance_now,
        status: FinanceStatus::from_balance(balance_now),
        computed_at: now,
    }
}

#[derive(Debug, Default)]
struct CacheSlot {
    generation: u64,
    summary: Option<FinanceSummary>,
}

/// Per-tenant summary cache.
///
/// Each invalidation bumps the tenant's generation. A summary computed
/// against an older generation is discarded on store, so a read racing a
/// write can never park a stale value.
#[derive(Debug, Default)]
pub struct SummaryCache {
    slots: DashMap<Uuid, CacheSlot>,
}

impl SummaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self, tenant_id: Uuid) -> u64 {
        self.slots
            .get(&tenant_id)
            .map(|s| s.generation)
            .unwrap_or(0)
    }

    /// Cached summary for `period`, if any.
    pub fn get(&self, tenant_id: Uuid, period: BillingPeriod) -> Option<FinanceSummary> {
        self.slots
            .get(&tenant_id)
            .and_then(|s| s.summary.clone())
            .filter(|s| s.period == period)
    }

    /// Returns false if the tenant was invalidated after `generation` was read.
    pub fn store(&self, tenant_id: Uuid, generation: u64, summary: FinanceSummary) -> bool {
        let mut slot = self.slots.entry(tenant_id).or_default();
        if slot.generation != generation {
            return false;
        }
        slot.summary = Some(summary);
        true
    }

    pub fn invalidate(&self, tenant_id: Uuid) {
        let mut slot = self.slots.entry(tenant_id).or_default();
        slot.generation += 1;
        slot.summary = None;
    }

    pub fn contains(&self, tenant_id: Uuid) -> bool {
        self.slots
            .get(&tenant_id)
            .is_some_and(|s| s.summary.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(tenant_id: Uuid, period: BillingPeriod) -> FinanceSummary {
        FinanceSummary {
            tenant_id,
            period,
            current_month_due: Decimal::from(1000),
            amount_paid_mtd: Decimal::ZERO,
            arrears_to_date: Decimal::ZERO,
            balance_now: Decimal::from(1000),
            status: FinanceStatus::Overdue,
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn stale_generation_is_not_stored() {
        let cache = SummaryCache::new();
        let tenant = Uuid::new_v4();
        let period = BillingPeriod::new(2026, 3).unwrap();

        let seen = cache.generation(tenant);
        cache.invalidate(tenant);
        assert!(!cache.store(tenant, seen, summary(tenant, period)));
        assert!(!cache.contains(tenant));

        let seen = cache.generation(tenant);
        assert!(cache.store(tenant, seen, summary(tenant, period)));
        assert!(cache.get(tenant, period).is_some());
    }

    #[test]
    fn entries_expire_with_the_period() {
        let cache = SummaryCache::new();
        let tenant = Uuid::new_v4();
        let march = BillingPeriod::new(2026, 3).unwrap();
        cache.store(tenant, 0, summary(tenant, march));

        assert!(cache.get(tenant, march).is_some());
        assert!(cache.get(tenant, march.next()).is_none());
    }

    #[test]
    fn invalidate_clears_entry() {
        let cache = SummaryCache::new();
        let tenant = Uuid::new_v4();
        let march = BillingPeriod::new(2026, 3).unwrap();
        cache.store(tenant, 0, summary(tenant, march));
        cache.invalidate(tenant);
        assert!(cache.get(tenant, march).is_none());
        assert_eq!(cache.generation(tenant), 1);
    }
}
