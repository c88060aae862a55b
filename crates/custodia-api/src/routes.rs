//! API Routes
//!
//! Route definitions for all API endpoints.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers;
use crate::state::AppState;

/// Create API v1 routes
pub fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(escrow_routes())
        // Query routes
        .route(
            "/users/:user_id/escrows",
            get(handlers::escrow::list_user_escrows),
        )
}

/// Escrow lifecycle routes
fn escrow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/escrows", post(handlers::escrow::create_escrow))
        .route("/escrows/:id", get(handlers::escrow::get_escrow))
        .route("/escrows/:id/timeline", get(handlers::escrow::get_timeline))
        .route("/escrows/:id/fund", post(handlers::escrow::fund_escrow))
        .route("/escrows/:id/release", post(handlers::escrow::release_escrow))
        .route("/escrows/:id/cancel", post(handlers::escrow::cancel_escrow))
        .route("/escrows/:id/dispute", post(handlers::escrow::open_dispute))
        .route(
            "/escrows/:id/dispute/resolve",
            post(handlers::escrow::resolve_dispute),
        )
}
