//! Provider-backed payments: initiation, status, cancellation, callbacks.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{CallbackQuery, InitiatePaymentRequest, InitiatePaymentResponse};
use crate::error::FinanceError;
use crate::services::gateway::{Delivery, Provider, ProviderCallback};
use crate::services::reconciliation::AttemptView;
use crate::startup::AppState;

fn provider(name: &str) -> Result<Provider, AppError> {
    name.parse::<Provider>()
        .map_err(|e| AppError::from(FinanceError::from(e)))
}

pub async fn initiate_payment(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    Json(payload): Json<InitiatePaymentRequest>,
) -> Result<(StatusCode, Json<InitiatePaymentResponse>), AppError> {
    payload.validate()?;
    let provider = provider(&provider_name)?;

    tracing::info!(
        provider = %provider,
        tenant_id = %payload.tenant_id,
        amount = %payload.amount,
        "Initiating payment"
    );

    let view = state.reconciler.initiate(provider, payload.into()).await?;
    Ok((StatusCode::ACCEPTED, Json(view.into())))
}

pub async fn payment_status(
    State(state): State<AppState>,
    Path((provider_name, payment_id)): Path<(String, Uuid)>,
) -> Result<Json<AttemptView>, AppError> {
    let provider = provider(&provider_name)?;
    Ok(Json(state.reconciler.status(provider, payment_id).await?))
}

/// Stop polling an attempt. The provider-side charge is not reversed.
pub async fn cancel_payment(
    State(state): State<AppState>,
    Path((provider_name, payment_id)): Path<(String, Uuid)>,
) -> Result<Json<AttemptView>, AppError> {
    let provider = provider(&provider_name)?;
    Ok(Json(state.reconciler.cancel(provider, payment_id).await?))
}

/// STK result pushed by the provider. Stored for the next status check;
/// the ledger is only written by the reconciler.
///
/// The request must carry the provider's callback token, and only handles
/// this service issued are accepted.
pub async fn provider_callback(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    Query(params): Query<CallbackQuery>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let provider = provider(&provider_name)?;
    let gateway = state
        .reconciler
        .gateways()
        .get(provider)
        .map_err(|e| AppError::from(FinanceError::from(e)))?;
    let inbox = gateway.callbacks().ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!("{} does not send callbacks", provider))
    })?;

    if !inbox.authenticate(params.token.as_deref()) {
        tracing::warn!(provider = %provider, "Rejected callback with a missing or invalid token");
        return Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid callback token"
        )));
    }

    let callback = ProviderCallback::parse_stk(&payload).map_err(|e| {
        tracing::warn!(provider = %provider, error = %e, "Rejected malformed callback");
        AppError::BadRequest(anyhow::anyhow!(e.to_string()))
    })?;

    let payment_handle = callback.payment_handle.clone();
    let status = callback.report.status;
    let delivery = inbox.deliver(callback);
    tracing::info!(
        provider = %provider,
        payment_handle = %payment_handle,
        status = ?status,
        delivery = ?delivery,
        "Provider callback received"
    );
    if delivery == Delivery::UnknownHandle {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "Unknown payment handle {}",
            payment_handle
        )));
    }

    Ok(Json(json!({ "ResultCode": 0, "ResultDesc": "Accepted" })))
}
