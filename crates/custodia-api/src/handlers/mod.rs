//! API Handlers

pub mod escrow;
pub mod health;
