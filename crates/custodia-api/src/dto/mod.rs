//! Data Transfer Objects
//!
//! Request structures for the API. Responses are the engine's own
//! serializable types.

pub mod escrow;

pub use escrow::*;
