//! Application state shared across handlers

use std::sync::Arc;

use custodia_db::Database;
use custodia_escrow::EscrowService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Escrow engine
    pub escrow: Arc<EscrowService>,
    /// SQLite pool, absent with the in-memory backend
    pub db: Option<Arc<Database>>,
}

impl AppState {
    pub fn new(escrow: Arc<EscrowService>, db: Option<Arc<Database>>) -> Self {
        Self { escrow, db }
    }
}
