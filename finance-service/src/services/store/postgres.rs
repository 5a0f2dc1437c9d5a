//! PostgreSQL ledger store.
//!
//! Writes take a row lock on the tenant (`SELECT ... FOR UPDATE`) so that
//! allocation for one tenant never interleaves.

use super::{check_settlement, duplicate_invoice, LedgerStore, RecordedPayment, TenantBook};
use crate::error::FinanceError;
use crate::models::{
    Adjustment, AdjustmentKind, Invoice, InvoiceStatus, Payment, PaymentAllocation, PaymentMethod,
    PaymentSource, PaymentStatus, Tenant, Unit,
};
use crate::services::allocation::{allocate_payment, apply_credit, available_credit};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, PgConnection};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, FromRow)]
struct TenantRow {
    tenant_id: Uuid,
    name: String,
    phone: Option<String>,
    email: Option<String>,
    unit_id: Option<Uuid>,
    property_id: Option<Uuid>,
    unit_label: Option<String>,
    monthly_rent: Option<Decimal>,
    created_utc: DateTime<Utc>,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        let unit = match (row.unit_id, row.monthly_rent) {
            (Some(unit_id), Some(monthly_rent)) => Some(Unit {
                unit_id,
                property_id: row.property_id,
                label: row.unit_label,
                monthly_rent,
            }),
            _ => None,
        };
        Tenant {
            tenant_id: row.tenant_id,
            name: row.name,
            phone: row.phone,
            email: row.email,
            unit,
            created_at: row.created_utc,
        }
    }
}

#[derive(Debug, FromRow)]
struct InvoiceRow {
    invoice_id: Uuid,
    tenant_id: Uuid,
    unit_id: Option<Uuid>,
    period_year: i32,
    period_month: i32,
    amount_due: Decimal,
    amount_paid: Decimal,
    status: String,
    due_date: NaiveDate,
    issued_utc: DateTime<Utc>,
}

impl TryFrom<InvoiceRow> for Invoice {
    type Error = FinanceError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        Ok(Invoice {
            invoice_id: row.invoice_id,
            tenant_id: row.tenant_id,
            unit_id: row.unit_id,
            period_year: row.period_year,
            period_month: u32::try_from(row.period_month)
                .map_err(|_| corrupt("period_month", &row.period_month.to_string()))?,
            amount_due: row.amount_due,
            amount_paid: row.amount_paid,
            status: InvoiceStatus::parse(&row.status)
                .ok_or_else(|| corrupt("invoice status", &row.status))?,
            due_date: row.due_date,
            issued_at: row.issued_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    payment_id: Uuid,
    tenant_id: Uuid,
    unit_id: Option<Uuid>,
    amount: Decimal,
    method: String,
    source: String,
    external_tx_id: Option<String>,
    phone: Option<String>,
    paid_utc: DateTime<Utc>,
    status: String,
    description: Option<String>,
    notes: Option<String>,
    recorded_utc: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = FinanceError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            payment_id: row.payment_id,
            tenant_id: row.tenant_id,
            unit_id: row.unit_id,
            amount: row.amount,
            method: PaymentMethod::parse(&row.method)
                .ok_or_else(|| corrupt("payment method", &row.method))?,
            source: PaymentSource::parse(&row.source)
                .ok_or_else(|| corrupt("payment source", &row.source))?,
            external_tx_id: row.external_tx_id,
            phone: row.phone,
            paid_at: row.paid_utc,
            status: PaymentStatus::parse(&row.status)
                .ok_or_else(|| corrupt("payment status", &row.status))?,
            description: row.description,
            notes: row.notes,
            recorded_at: row.recorded_utc,
        })
    }
}

#[derive(Debug, FromRow)]
struct AllocationRow {
    payment_id: Uuid,
    invoice_id: Uuid,
    amount: Decimal,
    applied_utc: DateTime<Utc>,
}

impl From<AllocationRow> for PaymentAllocation {
    fn from(row: AllocationRow) -> Self {
        PaymentAllocation {
            payment_id: row.payment_id,
            invoice_id: row.invoice_id,
            amount: row.amount,
            applied_at: row.applied_utc,
        }
    }
}

#[derive(Debug, FromRow)]
struct AdjustmentRow {
    adjustment_id: Uuid,
    tenant_id: Uuid,
    unit_id: Option<Uuid>,
    amount: Decimal,
    kind: String,
    reason: Option<String>,
    created_utc: DateTime<Utc>,
}

impl TryFrom<AdjustmentRow> for Adjustment {
    type Error = FinanceError;

    fn try_from(row: AdjustmentRow) -> Result<Self, Self::Error> {
        Ok(Adjustment {
            adjustment_id: row.adjustment_id,
            tenant_id: row.tenant_id,
            unit_id: row.unit_id,
            amount: row.amount,
            kind: AdjustmentKind::parse(&row.kind)
                .ok_or_else(|| corrupt("adjustment kind", &row.kind))?,
            reason: row.reason,
            created_at: row.created_utc,
        })
    }
}

fn corrupt(field: &str, value: &str) -> FinanceError {
    FinanceError::Store(anyhow::anyhow!("Unrecognised {} '{}' in store", field, value))
}

fn db_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> FinanceError {
    move |e| FinanceError::Store(anyhow::anyhow!("{}: {}", context, e))
}

const TENANT_COLUMNS: &str = "tenant_id, name, phone, email, unit_id, property_id, unit_label, monthly_rent, created_utc";
const INVOICE_COLUMNS: &str = "invoice_id, tenant_id, unit_id, period_year, period_month, amount_due, amount_paid, status, due_date, issued_utc";
const PAYMENT_COLUMNS: &str = "payment_id, tenant_id, unit_id, amount, method, source, external_tx_id, phone, paid_utc, status, description, notes, recorded_utc";

/// Database-backed [`LedgerStore`].
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "finance-service"))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, FinanceError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(db_err("Failed to connect"))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), FinanceError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| FinanceError::Store(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn lock_tenant(conn: &mut PgConnection, tenant_id: Uuid) -> Result<(), FinanceError> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT tenant_id FROM finance_tenants WHERE tenant_id = $1 FOR UPDATE",
        )
        .bind(tenant_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err("Failed to lock tenant"))?
        .map(|_| ())
        .ok_or(FinanceError::TenantNotFound(tenant_id))
    }

    async fn fetch_tenant(
        conn: &mut PgConnection,
        tenant_id: Uuid,
    ) -> Result<Tenant, FinanceError> {
        let query = format!("SELECT {} FROM finance_tenants WHERE tenant_id = $1", TENANT_COLUMNS);
        sqlx::query_as::<_, TenantRow>(&query)
            .bind(tenant_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err("Failed to fetch tenant"))?
            .map(Tenant::from)
            .ok_or(FinanceError::TenantNotFound(tenant_id))
    }

    async fn fetch_invoices(
        conn: &mut PgConnection,
        tenant_id: Uuid,
        open_only: bool,
    ) -> Result<Vec<Invoice>, FinanceError> {
        let filter = if open_only { "AND status <> 'paid'" } else { "" };
        let query = format!(
            "SELECT {} FROM finance_invoices WHERE tenant_id = $1 {} ORDER BY period_year, period_month, issued_utc",
            INVOICE_COLUMNS, filter
        );
        sqlx::query_as::<_, InvoiceRow>(&query)
            .bind(tenant_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err("Failed to fetch invoices"))?
            .into_iter()
            .map(Invoice::try_from)
            .collect()
    }

    async fn fetch_payments(
        conn: &mut PgConnection,
        tenant_id: Uuid,
    ) -> Result<Vec<Payment>, FinanceError> {
        let query = format!(
            "SELECT {} FROM finance_payments WHERE tenant_id = $1 ORDER BY paid_utc, recorded_utc",
            PAYMENT_COLUMNS
        );
        sqlx::query_as::<_, PaymentRow>(&query)
            .bind(tenant_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err("Failed to fetch payments"))?
            .into_iter()
            .map(Payment::try_from)
            .collect()
    }

    async fn fetch_allocations(
        conn: &mut PgConnection,
        tenant_id: Uuid,
    ) -> Result<Vec<PaymentAllocation>, FinanceError> {
        let rows = sqlx::query_as::<_, AllocationRow>(
            r#"
            SELECT a.payment_id, a.invoice_id, a.amount, a.applied_utc
            FROM finance_payment_allocations a
            JOIN finance_payments p ON p.payment_id = a.payment_id
            WHERE p.tenant_id = $1
            ORDER BY a.applied_utc
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err("Failed to fetch allocations"))?;
        Ok(rows.into_iter().map(PaymentAllocation::from).collect())
    }

    async fn insert_payment_row(
        conn: &mut PgConnection,
        payment: &Payment,
    ) -> Result<(), FinanceError> {
        sqlx::query(
            r#"
            INSERT INTO finance_payments (
                payment_id, tenant_id, unit_id, amount, method, source, external_tx_id,
                phone, paid_utc, status, description, notes, recorded_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(payment.payment_id)
        .bind(payment.tenant_id)
        .bind(payment.unit_id)
        .bind(payment.amount)
        .bind(payment.method.as_str())
        .bind(payment.source.as_str())
        .bind(payment.external_tx_id.as_deref())
        .bind(payment.phone.as_deref())
        .bind(payment.paid_at)
        .bind(payment.status.as_str())
        .bind(payment.description.as_deref())
        .bind(payment.notes.as_deref())
        .bind(payment.recorded_at)
        .execute(&mut *conn)
        .await
        .map_err(db_err("Failed to insert payment"))?;
        Ok(())
    }

    /// Persist allocations and the invoice totals they changed.
    async fn persist_allocations(
        conn: &mut PgConnection,
        allocations: &[PaymentAllocation],
        invoices: &[Invoice],
    ) -> Result<(), FinanceError> {
        for allocation in allocations {
            sqlx::query(
                r#"
                INSERT INTO finance_payment_allocations (payment_id, invoice_id, amount, applied_utc)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(allocation.payment_id)
            .bind(allocation.invoice_id)
            .bind(allocation.amount)
            .bind(allocation.applied_at)
            .execute(&mut *conn)
            .await
            .map_err(db_err("Failed to insert allocation"))?;

            if let Some(invoice) = invoices
                .iter()
                .find(|i| i.invoice_id == allocation.invoice_id)
            {
                sqlx::query(
                    "UPDATE finance_invoices SET amount_paid = $2, status = $3 WHERE invoice_id = $1",
                )
                .bind(invoice.invoice_id)
                .bind(invoice.amount_paid)
                .bind(invoice.status.as_str())
                .execute(&mut *conn)
                .await
                .map_err(db_err("Failed to update invoice"))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.tenant_id))]
    async fn upsert_tenant(&self, tenant: Tenant) -> Result<Tenant, FinanceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_tenant"])
            .start_timer();

        let unit = tenant.unit.as_ref();
        let query = format!(
            r#"
            INSERT INTO finance_tenants (
                tenant_id, name, phone, email, unit_id, property_id, unit_label, monthly_rent,
                created_utc, updated_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            ON CONFLICT (tenant_id) DO UPDATE SET
                name = EXCLUDED.name,
                phone = EXCLUDED.phone,
                email = EXCLUDED.email,
                unit_id = COALESCE(EXCLUDED.unit_id, finance_tenants.unit_id),
                property_id = CASE WHEN EXCLUDED.unit_id IS NULL
                    THEN finance_tenants.property_id ELSE EXCLUDED.property_id END,
                unit_label = CASE WHEN EXCLUDED.unit_id IS NULL
                    THEN finance_tenants.unit_label ELSE EXCLUDED.unit_label END,
                monthly_rent = CASE WHEN EXCLUDED.unit_id IS NULL
                    THEN finance_tenants.monthly_rent ELSE EXCLUDED.monthly_rent END,
                updated_utc = NOW()
            RETURNING {}
            "#,
            TENANT_COLUMNS
        );

        let row = sqlx::query_as::<_, TenantRow>(&query)
            .bind(tenant.tenant_id)
            .bind(&tenant.name)
            .bind(tenant.phone.as_deref())
            .bind(tenant.email.as_deref())
            .bind(unit.map(|u| u.unit_id))
            .bind(unit.and_then(|u| u.property_id))
            .bind(unit.and_then(|u| u.label.as_deref()))
            .bind(unit.map(|u| u.monthly_rent))
            .bind(tenant.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("Failed to upsert tenant"))?;

        timer.observe_duration();
        Ok(row.into())
    }

    #[instrument(skip(self, unit))]
    async fn assign_unit(&self, tenant_id: Uuid, unit: Unit) -> Result<Tenant, FinanceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["assign_unit"])
            .start_timer();

        let query = format!(
            r#"
            UPDATE finance_tenants
            SET unit_id = $2, property_id = $3, unit_label = $4, monthly_rent = $5, updated_utc = NOW()
            WHERE tenant_id = $1
            RETURNING {}
            "#,
            TENANT_COLUMNS
        );
        let row = sqlx::query_as::<_, TenantRow>(&query)
            .bind(tenant_id)
            .bind(unit.unit_id)
            .bind(unit.property_id)
            .bind(unit.label.as_deref())
            .bind(unit.monthly_rent)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("Failed to assign unit"))?
            .ok_or(FinanceError::TenantNotFound(tenant_id))?;

        timer.observe_duration();
        Ok(row.into())
    }

    async fn tenant_ids(&self) -> Result<Vec<Uuid>, FinanceError> {
        sqlx::query_scalar::<_, Uuid>("SELECT tenant_id FROM finance_tenants ORDER BY created_utc")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("Failed to list tenants"))
    }

    #[instrument(skip(self, invoice), fields(tenant_id = %invoice.tenant_id, period = %invoice.period()))]
    async fn insert_invoice(&self, mut invoice: Invoice) -> Result<Invoice, FinanceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err("Failed to begin transaction"))?;
        Self::lock_tenant(&mut tx, invoice.tenant_id).await?;

        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM finance_invoices
                WHERE tenant_id = $1 AND period_year = $2 AND period_month = $3
            )
            "#,
        )
        .bind(invoice.tenant_id)
        .bind(invoice.period_year)
        .bind(invoice.period_month as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err("Failed to check invoice period"))?;
        if exists {
            return Err(duplicate_invoice(&invoice));
        }

        let payments = Self::fetch_payments(&mut tx, invoice.tenant_id).await?;
        let allocations = Self::fetch_allocations(&mut tx, invoice.tenant_id).await?;
        let credit = available_credit(&payments, &allocations);
        let issued_at = invoice.issued_at;
        let applied = apply_credit(&mut invoice, &credit, issued_at);

        sqlx::query(
            r#"
            INSERT INTO finance_invoices (
                invoice_id, tenant_id, unit_id, period_year, period_month, amount_due,
                amount_paid, status, due_date, issued_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(invoice.tenant_id)
        .bind(invoice.unit_id)
        .bind(invoice.period_year)
        .bind(invoice.period_month as i32)
        .bind(invoice.amount_due)
        .bind(invoice.amount_paid)
        .bind(invoice.status.as_str())
        .bind(invoice.due_date)
        .bind(invoice.issued_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to insert invoice"))?;

        Self::persist_allocations(&mut tx, &applied, std::slice::from_ref(&invoice)).await?;

        tx.commit().await.map_err(db_err("Failed to commit transaction"))?;
        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self, payment), fields(tenant_id = %payment.tenant_id, payment_id = %payment.payment_id))]
    async fn insert_payment(&self, payment: Payment) -> Result<RecordedPayment, FinanceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_payment"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err("Failed to begin transaction"))?;
        Self::lock_tenant(&mut tx, payment.tenant_id).await?;

        if let Some(tx_id) = payment.external_tx_id.as_deref() {
            let query = format!(
                "SELECT {} FROM finance_payments WHERE tenant_id = $1 AND external_tx_id = $2",
                PAYMENT_COLUMNS
            );
            let existing = sqlx::query_as::<_, PaymentRow>(&query)
                .bind(payment.tenant_id)
                .bind(tx_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err("Failed to check external transaction id"))?;
            if let Some(row) = existing {
                info!(external_tx_id = %tx_id, "Payment already recorded");
                return Ok(RecordedPayment {
                    payment: row.try_into()?,
                    created: false,
                });
            }
        }

        Self::insert_payment_row(&mut tx, &payment).await?;

        if payment.is_paid() {
            let mut invoices = Self::fetch_invoices(&mut tx, payment.tenant_id, true).await?;
            let outcome = allocate_payment(
                payment.payment_id,
                payment.amount,
                &mut invoices,
                payment.recorded_at,
            );
            Self::persist_allocations(&mut tx, &outcome.allocations, &invoices).await?;
        }

        tx.commit().await.map_err(db_err("Failed to commit transaction"))?;
        timer.observe_duration();
        Ok(RecordedPayment {
            payment,
            created: true,
        })
    }

    #[instrument(skip(self, notes))]
    async fn settle_payment(
        &self,
        payment_id: Uuid,
        status: PaymentStatus,
        settled_at: DateTime<Utc>,
        notes: Option<String>,
    ) -> Result<Payment, FinanceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["settle_payment"])
            .start_timer();

        let tenant_id: Uuid =
            sqlx::query_scalar("SELECT tenant_id FROM finance_payments WHERE payment_id = $1")
                .bind(payment_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err("Failed to look up payment"))?
                .ok_or(FinanceError::PaymentNotFound(payment_id))?;

        let mut tx = self.pool.begin().await.map_err(db_err("Failed to begin transaction"))?;
        Self::lock_tenant(&mut tx, tenant_id).await?;

        let query = format!(
            "SELECT {} FROM finance_payments WHERE payment_id = $1",
            PAYMENT_COLUMNS
        );
        let mut payment: Payment = sqlx::query_as::<_, PaymentRow>(&query)
            .bind(payment_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("Failed to fetch payment"))?
            .ok_or(FinanceError::PaymentNotFound(payment_id))?
            .try_into()?;
        check_settlement(&payment, status)?;

        payment.status = status;
        if notes.is_some() {
            payment.notes = notes;
        }
        if status == PaymentStatus::Paid {
            payment.paid_at = settled_at;
        }

        sqlx::query(
            "UPDATE finance_payments SET status = $2, paid_utc = $3, notes = $4 WHERE payment_id = $1",
        )
        .bind(payment.payment_id)
        .bind(payment.status.as_str())
        .bind(payment.paid_at)
        .bind(payment.notes.as_deref())
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to settle payment"))?;

        if payment.is_paid() {
            let mut invoices = Self::fetch_invoices(&mut tx, tenant_id, true).await?;
            let outcome =
                allocate_payment(payment.payment_id, payment.amount, &mut invoices, settled_at);
            Self::persist_allocations(&mut tx, &outcome.allocations, &invoices).await?;
        }

        tx.commit().await.map_err(db_err("Failed to commit transaction"))?;
        timer.observe_duration();
        Ok(payment)
    }

    #[instrument(skip(self, adjustment), fields(tenant_id = %adjustment.tenant_id))]
    async fn insert_adjustment(&self, adjustment: Adjustment) -> Result<Adjustment, FinanceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_adjustment"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(db_err("Failed to begin transaction"))?;
        Self::lock_tenant(&mut tx, adjustment.tenant_id).await?;

        sqlx::query(
            r#"
            INSERT INTO finance_adjustments (adjustment_id, tenant_id, unit_id, amount, kind, reason, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(adjustment.adjustment_id)
        .bind(adjustment.tenant_id)
        .bind(adjustment.unit_id)
        .bind(adjustment.amount)
        .bind(adjustment.kind.as_str())
        .bind(adjustment.reason.as_deref())
        .bind(adjustment.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to insert adjustment"))?;

        tx.commit().await.map_err(db_err("Failed to commit transaction"))?;
        timer.observe_duration();
        Ok(adjustment)
    }

    #[instrument(skip(self))]
    async fn load_book(&self, tenant_id: Uuid) -> Result<TenantBook, FinanceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_book"])
            .start_timer();

        // One snapshot for the whole book.
        let mut tx = self.pool.begin().await.map_err(db_err("Failed to begin transaction"))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to set isolation level"))?;

        let tenant = Self::fetch_tenant(&mut tx, tenant_id).await?;
        let invoices = Self::fetch_invoices(&mut tx, tenant_id, false).await?;
        let payments = Self::fetch_payments(&mut tx, tenant_id).await?;
        let allocations = Self::fetch_allocations(&mut tx, tenant_id).await?;
        let adjustments = sqlx::query_as::<_, AdjustmentRow>(
            r#"
            SELECT adjustment_id, tenant_id, unit_id, amount, kind, reason, created_utc
            FROM finance_adjustments
            WHERE tenant_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err("Failed to fetch adjustments"))?
        .into_iter()
        .map(Adjustment::try_from)
        .collect::<Result<Vec<_>, _>>()?;

        tx.commit().await.map_err(db_err("Failed to commit transaction"))?;
        timer.observe_duration();

        Ok(TenantBook {
            tenant,
            invoices,
            payments,
            allocations,
            adjustments,
        })
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), FinanceError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err("Health check failed"))?;

        timer.observe_duration();
        Ok(())
    }
}
