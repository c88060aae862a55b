//! Health Check Handlers
//!
//! Endpoints for service health monitoring.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Storage backend in use
    pub storage: String,
    /// Registered processors
    pub processors: Vec<String>,
    /// Timestamp in milliseconds
    pub timestamp: i64,
}

/// Health check endpoint
///
/// Returns 200 while the service is up and its store answers, 503 otherwise.
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let (storage, healthy) = match &state.db {
        Some(db) => ("sqlite", db.health_check().await.healthy),
        None => ("memory", true),
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            storage: storage.to_string(),
            processors: state
                .escrow
                .processors()
                .names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }),
    )
}
