//! Tenant registry and per-tenant finance views.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{AssignUnitRequest, AssignUnitResponse, HistoryQuery, RegisterTenantRequest};
use crate::models::{FinanceSummary, HistoryLine, Invoice, Tenant};
use crate::startup::AppState;

pub async fn register_tenant(
    State(state): State<AppState>,
    Json(payload): Json<RegisterTenantRequest>,
) -> Result<(StatusCode, Json<Tenant>), AppError> {
    payload.validate()?;
    let tenant = state.ledger.register_tenant(payload.into()).await?;
    Ok((StatusCode::CREATED, Json(tenant)))
}

/// Set the tenant's unit, optionally issuing this period's invoice.
pub async fn assign_unit(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(payload): Json<AssignUnitRequest>,
) -> Result<Json<AssignUnitResponse>, AppError> {
    payload.validate()?;
    tracing::info!(
        tenant_id = %tenant_id,
        unit_id = %payload.unit_id,
        monthly_rent = %payload.monthly_rent,
        "Assigning unit"
    );

    let (tenant, invoice) = state
        .ledger
        .assign_unit(tenant_id, payload.unit(), payload.issue_invoice)
        .await?;
    Ok(Json(AssignUnitResponse { tenant, invoice }))
}

pub async fn tenant_summary(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<FinanceSummary>, AppError> {
    Ok(Json(state.ledger.summary(tenant_id).await?))
}

pub async fn all_summaries(
    State(state): State<AppState>,
) -> Result<Json<Vec<FinanceSummary>>, AppError> {
    Ok(Json(state.ledger.summaries().await?))
}

pub async fn finance_history(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryLine>>, AppError> {
    let lines = state
        .ledger
        .list_history(tenant_id, query.unit_id, query.limit)
        .await?;
    Ok(Json(lines))
}

pub async fn active_invoice(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<Invoice>, AppError> {
    state
        .ledger
        .get_active_invoice(tenant_id)
        .await?
        .map(Json)
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "No invoice issued for the current period"
            ))
        })
}
