use super::period::BillingPeriod;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FinanceStatus {
    Cleared,
    Overdue,
    Prepaid,
}

impl FinanceStatus {
    pub fn from_balance(balance: Decimal) -> Self {
        if balance > Decimal::ZERO {
            Self::Overdue
        } else if balance < Decimal::ZERO {
            Self::Prepaid
        } else {
            Self::Cleared
        }
    }
}

/// Point-in-time view of what a tenant owes for the current billing period.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinanceSummary {
    pub tenant_id: Uuid,
    pub period: BillingPeriod,
    pub current_month_due: Decimal,
    pub amount_paid_mtd: Decimal,
    pub arrears_to_date: Decimal,
    pub balance_now: Decimal,
    pub status: FinanceStatus,
    pub computed_at: DateTime<Utc>,
}
