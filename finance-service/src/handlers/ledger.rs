//! Direct ledger writes: invoices, adjustments, recorded payments.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{
    IssueInvoiceRequest, RecordAdjustmentRequest, RecordPaymentRequest, SettlePaymentRequest,
};
use crate::models::{Adjustment, Invoice, Payment};
use crate::services::ledger::NewInvoice;
use crate::startup::AppState;

pub async fn issue_invoice(
    State(state): State<AppState>,
    Json(payload): Json<IssueInvoiceRequest>,
) -> Result<(StatusCode, Json<Invoice>), AppError> {
    payload.validate()?;
    let period = payload
        .period()
        .ok_or_else(|| AppError::Unprocessable(anyhow::anyhow!("Invalid billing period")))?;

    let invoice = state
        .ledger
        .issue_invoice(NewInvoice {
            tenant_id: payload.tenant_id,
            unit_id: payload.unit_id,
            period,
            amount_due: payload.amount_due,
            due_date: payload.due_date,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn record_adjustment(
    State(state): State<AppState>,
    Json(payload): Json<RecordAdjustmentRequest>,
) -> Result<(StatusCode, Json<Adjustment>), AppError> {
    payload.validate()?;
    let adjustment = state.ledger.record_adjustment(payload.into()).await?;
    Ok((StatusCode::CREATED, Json(adjustment)))
}

/// Record a payment taken outside the gateways (counter, bank, import).
pub async fn record_payment(
    State(state): State<AppState>,
    Json(payload): Json<RecordPaymentRequest>,
) -> Result<(StatusCode, Json<Payment>), AppError> {
    payload.validate()?;
    let payment = state.ledger.record_payment(payload.into()).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

/// Confirm or fail a pending payment.
pub async fn settle_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(payload): Json<SettlePaymentRequest>,
) -> Result<Json<Payment>, AppError> {
    payload.validate()?;
    let payment = state
        .ledger
        .settle_payment(payment_id, payload.status, payload.notes)
        .await?;
    Ok(Json(payment))
}
