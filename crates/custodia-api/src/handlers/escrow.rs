//! Escrow Handlers
//!
//! One handler per engine operation. Handlers only translate; every rule is
//! enforced by the engine.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use custodia_escrow::{CreateEscrowResponse, FundOptions};
use custodia_types::{EscrowTransaction, TimelineEntry, UserId};

use crate::dto::{
    CancelEscrowBody, CreateEscrowBody, FundEscrowBody, OpenDisputeBody, ReleaseEscrowBody,
    ResolveDisputeBody, UserEscrowQuery,
};
use crate::error::ApiResult;
use crate::extractors::{EscrowPath, ValidatedJson, ValidatedQuery};
use crate::state::AppState;

/// Create a new escrow
///
/// POST /api/v1/escrows
pub async fn create_escrow(
    State(state): State<Arc<AppState>>,
    ValidatedJson(body): ValidatedJson<CreateEscrowBody>,
) -> ApiResult<(StatusCode, Json<CreateEscrowResponse>)> {
    let request = body.into_request()?;
    let created = state.escrow.create_escrow_transaction(request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/v1/escrows/:id
pub async fn get_escrow(
    State(state): State<Arc<AppState>>,
    EscrowPath(escrow_id): EscrowPath,
) -> ApiResult<Json<EscrowTransaction>> {
    let escrow = state.escrow.get_escrow_transaction(&escrow_id).await?;
    Ok(Json(escrow))
}

/// GET /api/v1/escrows/:id/timeline
pub async fn get_timeline(
    State(state): State<Arc<AppState>>,
    EscrowPath(escrow_id): EscrowPath,
) -> ApiResult<Json<Vec<TimelineEntry>>> {
    let timeline = state.escrow.get_escrow_timeline(&escrow_id).await?;
    Ok(Json(timeline))
}

/// Capture the sender's funds
///
/// POST /api/v1/escrows/:id/fund
pub async fn fund_escrow(
    State(state): State<Arc<AppState>>,
    EscrowPath(escrow_id): EscrowPath,
    ValidatedJson(body): ValidatedJson<FundEscrowBody>,
) -> ApiResult<Json<EscrowTransaction>> {
    let escrow = state
        .escrow
        .fund_escrow(&escrow_id, FundOptions::from(body))
        .await?;
    Ok(Json(escrow))
}

/// Release all or part of the remaining balance
///
/// POST /api/v1/escrows/:id/release
pub async fn release_escrow(
    State(state): State<Arc<AppState>>,
    EscrowPath(escrow_id): EscrowPath,
    ValidatedJson(body): ValidatedJson<ReleaseEscrowBody>,
) -> ApiResult<Json<EscrowTransaction>> {
    let escrow = state.escrow.release_escrow(&escrow_id, body.into()).await?;
    Ok(Json(escrow))
}

/// POST /api/v1/escrows/:id/cancel
pub async fn cancel_escrow(
    State(state): State<Arc<AppState>>,
    EscrowPath(escrow_id): EscrowPath,
    ValidatedJson(body): ValidatedJson<CancelEscrowBody>,
) -> ApiResult<Json<EscrowTransaction>> {
    let escrow = state.escrow.cancel_escrow(&escrow_id, body.into()).await?;
    Ok(Json(escrow))
}

/// POST /api/v1/escrows/:id/dispute
pub async fn open_dispute(
    State(state): State<Arc<AppState>>,
    EscrowPath(escrow_id): EscrowPath,
    ValidatedJson(body): ValidatedJson<OpenDisputeBody>,
) -> ApiResult<Json<EscrowTransaction>> {
    let escrow = state.escrow.open_dispute(&escrow_id, body.into()).await?;
    Ok(Json(escrow))
}

/// POST /api/v1/escrows/:id/dispute/resolve
pub async fn resolve_dispute(
    State(state): State<Arc<AppState>>,
    EscrowPath(escrow_id): EscrowPath,
    ValidatedJson(body): ValidatedJson<ResolveDisputeBody>,
) -> ApiResult<Json<EscrowTransaction>> {
    let options = body.into_options()?;
    let escrow = state.escrow.resolve_dispute(&escrow_id, options).await?;
    Ok(Json(escrow))
}

/// Escrows where the user is sender or recipient, newest first
///
/// GET /api/v1/users/:user_id/escrows
pub async fn list_user_escrows(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    ValidatedQuery(query): ValidatedQuery<UserEscrowQuery>,
) -> ApiResult<Json<Vec<EscrowTransaction>>> {
    let filter = query.into_filter()?;
    let escrows = state
        .escrow
        .get_user_escrow_transactions(&UserId(user_id), &filter)
        .await?;
    Ok(Json(escrows))
}
