//! Request and receipt types exchanged with processors

use std::fmt;

use chrono::{DateTime, Utc};
use custodia_types::{
    Currency, EscrowOperation, EscrowTransactionId, EscrowType, ProcessorRefs, UserId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Processor-side deduplication key
///
/// Always `{escrow_transaction_id}:{operation}:{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(
        escrow_transaction_id: &EscrowTransactionId,
        operation: EscrowOperation,
        suffix: &str,
    ) -> Self {
        Self(format!("{}:{}:{}", escrow_transaction_id, operation, suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical form of what a call asks the processor to do
///
/// Two calls under one idempotency key must carry the same fingerprint.
/// Amounts are normalized so `60` and `60.00` compare equal.
pub trait RequestFingerprint {
    fn fingerprint(&self) -> String;
}

impl RequestFingerprint for CreateEscrowPayment {
    fn fingerprint(&self) -> String {
        format!(
            "create:{}:{}:{}:{}:{}",
            self.sender_id,
            self.recipient_id,
            self.amount.normalize(),
            self.currency,
            self.payment_method_id
        )
    }
}

impl RequestFingerprint for FundEscrow {
    fn fingerprint(&self) -> String {
        format!(
            "fund:{}:{}:{}",
            self.amount.normalize(),
            self.currency,
            self.payment_method_id
        )
    }
}

impl RequestFingerprint for ReleaseEscrow {
    fn fingerprint(&self) -> String {
        format!(
            "release:{}:{}:{}",
            self.recipient_id,
            self.amount.normalize(),
            self.currency
        )
    }
}

impl RequestFingerprint for CancelEscrow {
    fn fingerprint(&self) -> String {
        format!(
            "cancel:{}:{}:{}",
            self.sender_id,
            self.refund_amount.normalize(),
            self.currency
        )
    }
}

impl RequestFingerprint for CreateEscrowDispute {
    fn fingerprint(&self) -> String {
        format!("dispute:{}:{}", self.opened_by, self.reason)
    }
}

impl RequestFingerprint for ResolveEscrowDispute {
    fn fingerprint(&self) -> String {
        let direction = match self.direction {
            ResolutionDirection::ToRecipient => "to_recipient",
            ResolutionDirection::ToSender => "to_sender",
        };
        format!(
            "resolve:{}:{}:{}",
            direction,
            self.amount.normalize(),
            self.currency
        )
    }
}

impl RequestFingerprint for ResolveEscrowDisputeSplit {
    fn fingerprint(&self) -> String {
        format!(
            "split:{}:{}:{}:{}",
            self.split_ratio.normalize(),
            self.recipient_amount.normalize(),
            self.sender_amount.normalize(),
            self.currency
        )
    }
}

/// Fields shared by every processor call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowCallContext {
    pub escrow_transaction_id: EscrowTransactionId,
    /// Absent only on the creating call
    pub processor_escrow_id: Option<String>,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEscrowPayment {
    pub context: EscrowCallContext,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub amount: Decimal,
    pub currency: Currency,
    pub description: String,
    pub payment_method_id: String,
    pub escrow_type: EscrowType,
    pub expiry_date: DateTime<Utc>,
    pub release_conditions: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundEscrow {
    pub context: EscrowCallContext,
    pub amount: Decimal,
    pub currency: Currency,
    pub payment_method_id: String,
    /// Processor-specific funding options, passed through
    pub options: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseEscrow {
    pub context: EscrowCallContext,
    pub recipient_id: UserId,
    pub amount: Decimal,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelEscrow {
    pub context: EscrowCallContext,
    pub sender_id: UserId,
    /// Funds to hand back; zero when nothing was captured yet
    pub refund_amount: Decimal,
    pub currency: Currency,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEscrowDispute {
    pub context: EscrowCallContext,
    pub opened_by: UserId,
    pub reason: String,
    pub evidence: Vec<String>,
}

/// Which party receives the funds of a whole-amount resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionDirection {
    ToRecipient,
    ToSender,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveEscrowDispute {
    pub context: EscrowCallContext,
    pub processor_dispute_id: Option<String>,
    pub direction: ResolutionDirection,
    pub amount: Decimal,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveEscrowDisputeSplit {
    pub context: EscrowCallContext,
    pub processor_dispute_id: Option<String>,
    pub split_ratio: Decimal,
    pub recipient_amount: Decimal,
    pub sender_amount: Decimal,
    pub currency: Currency,
}

/// What a processor hands back on success
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorReceipt {
    pub refs: ProcessorRefs,
    /// Hosted checkout or 3-D Secure redirect, when the processor needs one
    pub redirect_url: Option<String>,
    pub client_secret: Option<String>,
    /// Raw processor payload
    #[serde(default)]
    pub raw: serde_json::Value,
}
