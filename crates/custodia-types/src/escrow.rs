//! Escrow record types
//!
//! The [`EscrowTransaction`] is the single persisted entity of the engine.
//! It is created in `Pending`, mutated only through versioned commits and
//! never deleted; terminal records stay around for audit.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{Currency, EscrowError, EscrowId, EscrowTransactionId, Result, UserId};

/// Lifecycle state of an escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// Created, waiting for funds
    Pending,
    /// Funds held by the processor
    Funded,
    /// Some, but not all, of the funds released to the recipient
    PartiallyReleased,
    /// Everything released to the recipient
    Released,
    /// Cancelled before any release
    Cancelled,
    /// Frozen pending a dispute decision
    Disputed,
    /// Returned to the sender by dispute decision
    Refunded,
    /// Divided between sender and recipient by dispute decision
    Split,
}

impl EscrowStatus {
    pub const ALL: [EscrowStatus; 8] = [
        Self::Pending,
        Self::Funded,
        Self::PartiallyReleased,
        Self::Released,
        Self::Cancelled,
        Self::Disputed,
        Self::Refunded,
        Self::Split,
    ];

    /// Terminal states have no outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Released | Self::Cancelled | Self::Refunded | Self::Split
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Funded => "funded",
            Self::PartiallyReleased => "partially_released",
            Self::Released => "released",
            Self::Cancelled => "cancelled",
            Self::Disputed => "disputed",
            Self::Refunded => "refunded",
            Self::Split => "split",
        }
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscrowStatus {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| EscrowError::validation(format!("unknown escrow status '{}'", s)))
    }
}

/// Operations that can be attempted against an escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowOperation {
    Create,
    Fund,
    Release,
    Cancel,
    OpenDispute,
    ResolveDispute,
}

impl EscrowOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Fund => "fund",
            Self::Release => "release",
            Self::Cancel => "cancel",
            Self::OpenDispute => "open_dispute",
            Self::ResolveDispute => "resolve_dispute",
        }
    }
}

impl fmt::Display for EscrowOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy tag; does not alter the lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowType {
    #[default]
    Standard,
    Milestone,
    Conditional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Open,
    Resolved,
}

/// Outcome chosen when resolving a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeResolutionKind {
    /// Release the remaining funds to the recipient
    Release,
    /// Return the funds to the sender
    Refund,
    /// Divide by ratio between recipient and sender
    Split,
}

impl DisputeResolutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Refund => "refund",
            Self::Split => "split",
        }
    }
}

impl fmt::Display for DisputeResolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisputeResolutionKind {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "release" => Ok(Self::Release),
            "refund" => Ok(Self::Refund),
            "split" => Ok(Self::Split),
            other => Err(EscrowError::validation(format!(
                "unknown resolution kind '{}', expected release, refund or split",
                other
            ))),
        }
    }
}

/// Dispute sub-record; kept after resolution, never deleted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowDispute {
    pub opened_by: UserId,
    pub open_date: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub status: DisputeStatus,
    pub resolution: Option<DisputeResolutionKind>,
    pub resolved_by: Option<UserId>,
    pub resolve_date: Option<DateTime<Utc>>,
    pub split_ratio: Option<Decimal>,
}

impl EscrowDispute {
    pub fn open(opened_by: UserId, reason: String, evidence: Vec<String>) -> Self {
        Self {
            opened_by,
            open_date: Utc::now(),
            reason,
            evidence,
            status: DisputeStatus::Open,
            resolution: None,
            resolved_by: None,
            resolve_date: None,
            split_ratio: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == DisputeStatus::Open
    }
}

/// One immutable entry of the audit timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub status: EscrowStatus,
    pub timestamp: DateTime<Utc>,
    /// Assigned by the repository at commit time
    pub sequence_no: u64,
    pub note: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Cross-references into the external processor; stored, never interpreted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorRefs {
    pub processor_transaction_id: Option<String>,
    pub processor_escrow_id: Option<String>,
    pub processor_transfer_id: Option<String>,
    pub processor_refund_id: Option<String>,
    pub processor_dispute_id: Option<String>,
}

impl ProcessorRefs {
    /// Overlay any identifiers present in `other`
    pub fn merge(&mut self, other: &ProcessorRefs) {
        fn take(slot: &mut Option<String>, value: &Option<String>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
        take(&mut self.processor_transaction_id, &other.processor_transaction_id);
        take(&mut self.processor_escrow_id, &other.processor_escrow_id);
        take(&mut self.processor_transfer_id, &other.processor_transfer_id);
        take(&mut self.processor_refund_id, &other.processor_refund_id);
        take(&mut self.processor_dispute_id, &other.processor_dispute_id);
    }
}

/// The escrow record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowTransaction {
    pub escrow_id: EscrowId,
    pub escrow_transaction_id: EscrowTransactionId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub amount: Decimal,
    pub currency: Currency,
    /// Running total ever released to the recipient
    pub released_amount: Decimal,
    pub status: EscrowStatus,
    pub escrow_type: EscrowType,
    pub description: String,
    pub payment_method_id: String,
    pub release_conditions: Option<serde_json::Value>,
    pub processor: String,
    #[serde(flatten)]
    pub processor_refs: ProcessorRefs,
    pub dispute: Option<EscrowDispute>,
    #[serde(default)]
    pub timeline: Vec<TimelineEntry>,
    pub expiry_date: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl EscrowTransaction {
    /// Amount still held for the recipient
    pub fn remaining_amount(&self) -> Decimal {
        self.amount - self.released_amount
    }

    /// Whether the user is a party to this escrow
    pub fn involves(&self, user: &UserId) -> bool {
        &self.sender_id == user || &self.recipient_id == user
    }

    /// Describe every record invariant that does not hold
    pub fn invariant_violations(&self) -> Vec<String> {
        let mut violations = Vec::new();

        if self.released_amount < Decimal::ZERO || self.released_amount > self.amount {
            violations.push(format!(
                "released amount {} outside [0, {}]",
                self.released_amount, self.amount
            ));
        }

        let dispute_states = matches!(
            self.status,
            EscrowStatus::Disputed | EscrowStatus::Refunded | EscrowStatus::Split
        );
        if dispute_states && self.dispute.is_none() {
            violations.push(format!("status {} without a dispute record", self.status));
        }

        if self.timeline.len() as u64 != self.version {
            violations.push(format!(
                "timeline has {} entries at version {}",
                self.timeline.len(),
                self.version
            ));
        }

        for (index, entry) in self.timeline.iter().enumerate() {
            if entry.sequence_no != index as u64 + 1 {
                violations.push(format!(
                    "timeline entry {} has sequence number {}",
                    index, entry.sequence_no
                ));
            }
        }

        if let Some(last) = self.timeline.last() {
            if last.status != self.status {
                violations.push(format!(
                    "last timeline status {} differs from record status {}",
                    last.status, self.status
                ));
            }
        }

        violations
    }
}
