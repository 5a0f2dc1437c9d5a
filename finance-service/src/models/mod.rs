//! Domain models for finance-service.

pub mod adjustment;
pub mod entry;
pub mod invoice;
pub mod money;
pub mod payment;
pub mod period;
pub mod summary;
pub mod tenant;

pub use adjustment::{Adjustment, AdjustmentKind};
pub use entry::{HistoryLine, LedgerEntry};
pub use invoice::{Invoice, InvoiceStatus};
pub use payment::{Payment, PaymentAllocation, PaymentMethod, PaymentSource, PaymentStatus};
pub use period::BillingPeriod;
pub use summary::{FinanceStatus, FinanceSummary};
pub use tenant::{Tenant, Unit};
