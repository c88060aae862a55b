//! Custodia Types - Canonical domain types for the escrow engine
//!
//! This crate contains the foundational types shared by every Custodia crate:
//!
//! - Identity types (EscrowId, EscrowTransactionId, UserId)
//! - Currency codes and decimal money
//! - The escrow record, its dispute sub-record and audit timeline entries
//! - The error taxonomy every escrow operation reports through
//!
//! # Record Invariants
//!
//! 1. `0 <= released_amount <= amount`
//! 2. `status` is always one of the defined states
//! 3. `dispute` is present iff a dispute was ever opened
//! 4. `timeline` only grows, one entry per committed transition
//! 5. `version` increases by exactly one per committed mutation

pub mod identity;
pub mod money;
pub mod escrow;
pub mod error;

pub use identity::*;
pub use money::*;
pub use escrow::*;
pub use error::*;
