//! Repository implementations

pub mod escrow;

pub use escrow::SqliteEscrowRepository;
