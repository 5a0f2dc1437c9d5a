//! Applying payments to invoices, oldest billing period first.

use crate::models::{Invoice, Payment, PaymentAllocation};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct AllocationOutcome {
    pub allocations: Vec<PaymentAllocation>,
    /// Left over after every open invoice is settled; held as tenant credit.
    pub unapplied: Decimal,
}

/// Spread `amount` over the open invoices in `invoices`, oldest period first.
/// Invoices are updated in place.
pub fn allocate_payment(
    payment_id: Uuid,
    amount: Decimal,
    invoices: &mut [Invoice],
    applied_at: DateTime<Utc>,
) -> AllocationOutcome {
    let mut order: Vec<usize> = (0..invoices.len())
        .filter(|&i| invoices[i].outstanding() > Decimal::ZERO)
        .collect();
    order.sort_by_key(|&i| (invoices[i].period(), invoices[i].issued_at));

    let mut remaining = amount;
    let mut allocations = Vec::new();
    for i in order {
        if remaining <= Decimal::ZERO {
            break;
        }
        let taken = invoices[i].apply(remaining);
        if taken > Decimal::ZERO {
            remaining -= taken;
            allocations.push(PaymentAllocation {
                payment_id,
                invoice_id: invoices[i].invoice_id,
                amount: taken,
                applied_at,
            });
        }
    }

    AllocationOutcome {
        allocations,
        unapplied: remaining.max(Decimal::ZERO),
    }
}

/// Paid payments with money not yet applied to any invoice, oldest first.
pub fn available_credit(
    payments: &[Payment],
    allocations: &[PaymentAllocation],
) -> Vec<(Uuid, Decimal)> {
    let mut applied: HashMap<Uuid, Decimal> = HashMap::new();
    for a in allocations {
        *applied.entry(a.payment_id).or_default() += a.amount;
    }

    let mut paid: Vec<&Payment> = payments.iter().filter(|p| p.is_paid()).collect();
    paid.sort_by_key(|p| (p.paid_at, p.recorded_at));

    paid.into_iter()
        .filter_map(|p| {
            let left = p.amount - applied.get(&p.payment_id).copied().unwrap_or_default();
            (left > Decimal::ZERO).then_some((p.payment_id, left))
        })
        .collect()
}

/// Apply held credit to a newly issued invoice.
pub fn apply_credit(
    invoice: &mut Invoice,
    credit: &[(Uuid, Decimal)],
    applied_at: DateTime<Utc>,
) -> Vec<PaymentAllocation> {
    let mut allocations = Vec::new();
    for &(payment_id, available) in credit {
        if invoice.outstanding() <= Decimal::ZERO {
            break;
        }
        let taken = invoice.apply(available);
        if taken > Decimal::ZERO {
            allocations.push(PaymentAllocation {
                payment_id,
                invoice_id: invoice.invoice_id,
                amount: taken,
                applied_at,
            });
        }
    }
    allocations
}
