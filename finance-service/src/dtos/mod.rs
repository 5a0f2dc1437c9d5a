//! Request and response bodies for the HTTP API.

use crate::models::{
    AdjustmentKind, BillingPeriod, Invoice, PaymentMethod, PaymentSource, PaymentStatus, Tenant,
    Unit,
};
use crate::services::ledger::{NewAdjustment, NewPayment, NewTenant};
use crate::services::reconciliation::{AttemptState, AttemptView, InitiatePayment};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTenantRequest {
    pub tenant_id: Option<Uuid>,
    #[validate(length(min = 1, max = 200, message = "Name is required"))]
    pub name: String,
    #[validate(length(max = 20, message = "Phone number is too long"))]
    pub phone: Option<String>,
    #[validate(email(message = "Invalid email format"))]
    pub email: Option<String>,
}

impl From<RegisterTenantRequest> for NewTenant {
    fn from(req: RegisterTenantRequest) -> Self {
        Self {
            tenant_id: req.tenant_id,
            name: req.name,
            phone: req.phone,
            email: req.email,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AssignUnitRequest {
    pub unit_id: Uuid,
    pub property_id: Option<Uuid>,
    #[validate(length(max = 64, message = "Unit label is too long"))]
    pub label: Option<String>,
    pub monthly_rent: Decimal,
    /// Also raise the current period's invoice.
    #[serde(default)]
    pub issue_invoice: bool,
}

impl AssignUnitRequest {
    pub fn unit(&self) -> Unit {
        Unit {
            unit_id: self.unit_id,
            property_id: self.property_id,
            label: self.label.clone(),
            monthly_rent: self.monthly_rent,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AssignUnitResponse {
    pub tenant: Tenant,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<Invoice>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IssueInvoiceRequest {
    pub tenant_id: Uuid,
    pub unit_id: Option<Uuid>,
    #[validate(range(min = 2000, max = 9999, message = "periodYear is out of range"))]
    pub period_year: i32,
    #[validate(range(min = 1, max = 12, message = "periodMonth must be between 1 and 12"))]
    pub period_month: u32,
    pub amount_due: Option<Decimal>,
    pub due_date: Option<NaiveDate>,
}

impl IssueInvoiceRequest {
    pub fn period(&self) -> Option<BillingPeriod> {
        BillingPeriod::new(self.period_year, self.period_month)
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RecordPaymentRequest {
    pub tenant_id: Uuid,
    pub unit_id: Option<Uuid>,
    pub amount: Decimal,
    #[serde(default)]
    pub method: PaymentMethod,
    #[serde(default)]
    pub source: PaymentSource,
    #[serde(alias = "externalTxId")]
    #[validate(length(max = 128, message = "txId is too long"))]
    pub tx_id: Option<String>,
    #[serde(alias = "phone")]
    #[validate(length(max = 20, message = "msisdn is too long"))]
    pub msisdn: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    #[validate(length(max = 500, message = "Description is too long"))]
    pub description: Option<String>,
    #[validate(length(max = 1000, message = "Notes are too long"))]
    pub notes: Option<String>,
    #[serde(default)]
    pub status: PaymentStatus,
}

impl From<RecordPaymentRequest> for NewPayment {
    fn from(req: RecordPaymentRequest) -> Self {
        Self {
            tenant_id: req.tenant_id,
            unit_id: req.unit_id,
            amount: req.amount,
            method: req.method,
            source: req.source,
            external_tx_id: req.tx_id,
            phone: req.msisdn,
            paid_at: req.paid_at,
            description: req.description,
            notes: req.notes,
            status: req.status,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SettlePaymentRequest {
    pub status: PaymentStatus,
    #[validate(length(max = 1000, message = "Notes are too long"))]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RecordAdjustmentRequest {
    pub tenant_id: Uuid,
    pub unit_id: Option<Uuid>,
    pub amount: Decimal,
    pub kind: AdjustmentKind,
    #[validate(length(max = 500, message = "Reason is too long"))]
    pub reason: Option<String>,
}

impl From<RecordAdjustmentRequest> for NewAdjustment {
    fn from(req: RecordAdjustmentRequest) -> Self {
        Self {
            tenant_id: req.tenant_id,
            unit_id: req.unit_id,
            amount: req.amount,
            kind: req.kind,
            reason: req.reason,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub unit_id: Option<Uuid>,
}

/// Query string on provider callbacks.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentRequest {
    pub tenant_id: Uuid,
    pub unit_id: Option<Uuid>,
    pub amount: Decimal,
    #[serde(alias = "msisdn")]
    #[validate(length(max = 20, message = "Phone number is too long"))]
    pub phone: Option<String>,
    #[validate(length(max = 100, message = "Narrative is too long"))]
    pub narrative: Option<String>,
}

impl From<InitiatePaymentRequest> for InitiatePayment {
    fn from(req: InitiatePaymentRequest) -> Self {
        Self {
            tenant_id: req.tenant_id,
            unit_id: req.unit_id,
            amount: req.amount,
            phone: req.phone,
            narrative: req.narrative,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentResponse {
    pub payment_id: Uuid,
    pub status: AttemptState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_handle: Option<String>,
}

impl From<AttemptView> for InitiatePaymentResponse {
    fn from(view: AttemptView) -> Self {
        let message = view
            .notes
            .clone()
            .or(view.message.clone())
            .unwrap_or_else(|| "Payment request submitted".to_string());
        Self {
            payment_id: view.payment_id,
            status: view.status,
            message,
            payment_handle: view.payment_handle,
        }
    }
}
