use super::period::BillingPeriod;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Open,
    PartiallyPaid,
    Paid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::PartiallyPaid => "partially_paid",
            Self::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "partially_paid" => Some(Self::PartiallyPaid),
            "paid" => Some(Self::Paid),
            _ => None,
        }
    }
}

/// A monthly rent charge raised against a tenant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub unit_id: Option<Uuid>,
    pub period_year: i32,
    pub period_month: u32,
    pub amount_due: Decimal,
    pub amount_paid: Decimal,
    pub status: InvoiceStatus,
    pub due_date: NaiveDate,
    pub issued_at: DateTime<Utc>,
}

impl Invoice {
    pub fn period(&self) -> BillingPeriod {
        BillingPeriod {
            year: self.period_year,
            month: self.period_month,
        }
    }

    pub fn outstanding(&self) -> Decimal {
        (self.amount_due - self.amount_paid).max(Decimal::ZERO)
    }

    /// Apply up to `available` to this invoice and return the amount taken.
    pub fn apply(&mut self, available: Decimal) -> Decimal {
        let taken = available.min(self.outstanding()).max(Decimal::ZERO);
        if taken > Decimal::ZERO {
            self.amount_paid += taken;
            self.refresh_status();
        }
        taken
    }

    pub fn refresh_status(&mut self) {
        self.status = if self.amount_paid >= self.amount_due {
            InvoiceStatus::Paid
        } else if self.amount_paid > Decimal::ZERO {
            InvoiceStatus::PartiallyPaid
        } else {
            InvoiceStatus::Open
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoice(due: i64) -> Invoice {
        Invoice {
            invoice_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            unit_id: None,
            period_year: 2026,
            period_month: 3,
            amount_due: Decimal::from(due),
            amount_paid: Decimal::ZERO,
            status: InvoiceStatus::Open,
            due_date: NaiveDate::from_ymd_opt(2026, 3, 5).unwrap(),
            issued_at: Utc::now(),
        }
    }

    #[test]
    fn apply_caps_at_outstanding() {
        let mut inv = invoice(1000);
        assert_eq!(inv.apply(Decimal::from(400)), Decimal::from(400));
        assert_eq!(inv.status, InvoiceStatus::PartiallyPaid);
        assert_eq!(inv.apply(Decimal::from(900)), Decimal::from(600));
        assert_eq!(inv.status, InvoiceStatus::Paid);
        assert_eq!(inv.outstanding(), Decimal::ZERO);
        assert_eq!(inv.apply(Decimal::from(50)), Decimal::ZERO);
    }

    #[test]
    fn status_round_trips_through_storage_names() {
        for status in [InvoiceStatus::Open, InvoiceStatus::PartiallyPaid, InvoiceStatus::Paid] {
            assert_eq!(InvoiceStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(InvoiceStatus::parse("void"), None);
    }
}
