//! Custodia Escrow - the escrow transaction lifecycle engine
//!
//! Holds third-party funds in trust between a sender and a recipient while
//! an external processor moves the money. This crate provides:
//!
//! - **State machine**: the transition table and the released-amount guard
//! - **Dispute resolution**: release, refund or split by ratio
//! - **Repository port**: versioned conditional commits, plus an in-memory store
//! - **Audit timeline**: append-only entries stamped at commit time
//! - **Service**: the public operations tying these to a processor
//!
//! # Concurrency
//!
//! The engine never locks a record across a processor call. It loads the
//! record, validates, calls the processor, and commits only if the version
//! is unchanged. The loser of a race gets `ConcurrencyConflict`; processor
//! idempotency keys keep the money from moving twice.

pub mod config;
pub mod dispute;
pub mod options;
pub mod repository;
pub mod service;
pub mod state_machine;
pub mod timeline;

pub use config::EscrowConfig;
pub use dispute::{DisputeResolver, ResolutionPlan};
pub use options::*;
pub use repository::{EscrowMutation, EscrowRepository, InMemoryEscrowRepository, UserEscrowFilter};
pub use service::EscrowService;
pub use state_machine::{EscrowStateMachine, Resolution, Transition, TransitionKind, TransitionOutcome};
pub use timeline::PendingEntry;
