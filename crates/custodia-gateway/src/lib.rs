//! Custodia Gateway - the processor side of the escrow engine
//!
//! The engine never moves money itself. Every transition is delegated to an
//! [`EscrowGateway`], implemented once per payment processor, and only
//! gateways that declare escrow capability can be registered in the
//! [`ProcessorRegistry`].
//!
//! Every call carries an [`IdempotencyKey`] derived from the escrow
//! transaction id, so a retry after a timeout is answered from the
//! processor's memory instead of executing twice. A key never stands for
//! two different requests.

pub mod request;
pub mod registry;
pub mod sandbox;

pub use request::*;
pub use registry::ProcessorRegistry;
pub use sandbox::{SandboxOperation, SandboxProcessor};

use custodia_types::ProcessorError;

/// Error code for a repeated idempotency key whose request differs
pub const IDEMPOTENCY_KEY_IN_USE: &str = "idempotency_key_in_use";

/// Result type for processor calls
pub type ProcessorResult<T> = std::result::Result<T, ProcessorError>;

/// Escrow-capable payment processor
///
/// Implementations must be idempotent on `request.context.idempotency_key`:
/// a repeated key with the same [`RequestFingerprint`] returns the original
/// receipt without re-executing. A repeated key with a different fingerprint
/// must fail with the non-retryable [`IDEMPOTENCY_KEY_IN_USE`] code and move
/// no money.
#[async_trait::async_trait]
pub trait EscrowGateway: Send + Sync {
    /// Registered processor name
    fn name(&self) -> &str;

    /// Whether this processor can hold funds in escrow
    fn supports_escrow(&self) -> bool {
        true
    }

    /// Open the escrow on the processor side
    async fn create_escrow_payment(
        &self,
        request: &CreateEscrowPayment,
    ) -> ProcessorResult<ProcessorReceipt>;

    /// Capture the sender's funds into escrow
    async fn fund_escrow(&self, request: &FundEscrow) -> ProcessorResult<ProcessorReceipt>;

    /// Transfer (part of) the held funds to the recipient
    async fn release_escrow(&self, request: &ReleaseEscrow) -> ProcessorResult<ProcessorReceipt>;

    /// Void the escrow, returning any held funds to the sender
    async fn cancel_escrow(&self, request: &CancelEscrow) -> ProcessorResult<ProcessorReceipt>;

    /// Freeze the escrow under a dispute
    async fn create_escrow_dispute(
        &self,
        request: &CreateEscrowDispute,
    ) -> ProcessorResult<ProcessorReceipt>;

    /// Settle a dispute entirely to one party
    async fn resolve_escrow_dispute(
        &self,
        request: &ResolveEscrowDispute,
    ) -> ProcessorResult<ProcessorReceipt>;

    /// Settle a dispute by dividing the funds
    async fn resolve_escrow_dispute_split(
        &self,
        request: &ResolveEscrowDisputeSplit,
    ) -> ProcessorResult<ProcessorReceipt>;
}
