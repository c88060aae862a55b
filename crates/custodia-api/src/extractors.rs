//! Custom Axum Extractors
//!
//! JSON and query extractors that validate before the handler runs, plus the
//! escrow id path extractor. All rejections use the API error body.

use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Path, Query, Request},
    http::request::Parts,
    Json,
};
use custodia_types::EscrowId;
use serde::de::DeserializeOwned;

use crate::error::ApiError;

// =============================================================================
// Validated JSON Extractor
// =============================================================================

/// JSON extractor with validation
pub struct ValidatedJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned + validator::Validate,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;

        value.validate()?;
        Ok(ValidatedJson(value))
    }
}

// =============================================================================
// Validated Query Extractor
// =============================================================================

/// Query extractor with validation
pub struct ValidatedQuery<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ValidatedQuery<T>
where
    S: Send + Sync,
    T: DeserializeOwned + validator::Validate,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;

        value.validate()?;
        Ok(ValidatedQuery(value))
    }
}

// =============================================================================
// Escrow Id Extractor
// =============================================================================

/// `{id}` path segment parsed as an escrow id, prefixed or bare
pub struct EscrowPath(pub EscrowId);

#[async_trait]
impl<S> FromRequestParts<S> for EscrowPath
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(raw) = Path::<String>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;

        EscrowId::parse(&raw)
            .map(EscrowPath)
            .map_err(|_| ApiError::InvalidParameter(format!("id: '{}' is not an escrow id", raw)))
    }
}
