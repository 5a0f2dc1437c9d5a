use super::{Adjustment, Invoice, Payment};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// One line of a tenant's finance history.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LedgerEntry {
    Charge(Invoice),
    Payment(Payment),
    Adjustment(Adjustment),
}

impl LedgerEntry {
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::Charge(i) => i.issued_at,
            Self::Payment(p) => p.paid_at,
            Self::Adjustment(a) => a.created_at,
        }
    }

    pub fn unit_id(&self) -> Option<Uuid> {
        match self {
            Self::Charge(i) => i.unit_id,
            Self::Payment(p) => p.unit_id,
            Self::Adjustment(a) => a.unit_id,
        }
    }

    /// Effect on the amount owed. Pending and failed payments move nothing.
    pub fn balance_effect(&self) -> Decimal {
        match self {
            Self::Charge(i) => i.amount_due,
            Self::Payment(p) if p.is_paid() => -p.amount,
            Self::Payment(_) => Decimal::ZERO,
            Self::Adjustment(a) => a.kind.signed(a.amount),
        }
    }

    /// Tie-break for entries sharing a timestamp: charges first.
    pub(crate) fn order_key(&self) -> u8 {
        match self {
            Self::Charge(_) => 0,
            Self::Adjustment(_) => 1,
            Self::Payment(_) => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryLine {
    #[serde(flatten)]
    pub entry: LedgerEntry,
    pub running_balance: Decimal,
}
