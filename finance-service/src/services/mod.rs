//! Services module for finance-service.

pub mod allocation;
pub mod clock;
pub mod gateway;
pub mod ledger;
pub mod metrics;
pub mod reconciliation;
pub mod store;
pub mod summary;

pub use clock::{BillingCalendar, Clock, FixedClock, SystemClock};
pub use gateway::{GatewayRegistry, PaymentGateway, Provider};
pub use ledger::{Ledger, LedgerEvent, NewAdjustment, NewInvoice, NewPayment, NewTenant};
pub use metrics::{get_metrics, init_metrics};
pub use reconciliation::{AttemptState, AttemptView, InitiatePayment, Reconciler};
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
pub use summary::SummaryCache;
