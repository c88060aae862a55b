//! Escrow lifecycle state machine
//!
//! [`EscrowStateMachine::edge`] is the transition table. Every other check in
//! the engine asks it; nothing else decides which operation is legal in
//! which state.
//!
//! ```text
//! Pending ──fund──▶ Funded ──release──▶ PartiallyReleased ──release──▶ Released
//!    │                │  └──────────────release (full)──────────────────▲
//!    └─cancel─▶ Cancelled ◀─cancel─┘
//!                     └─open_dispute─▶ Disputed ──resolve──▶ Released | Refunded | Split
//! ```

use custodia_types::{
    EscrowError, EscrowOperation, EscrowStatus, EscrowTransaction, Result,
};
use rust_decimal::Decimal;

/// How a dispute ends, as far as the state machine is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Release,
    Refund,
    /// Ratio of the escrowed amount that goes to the recipient
    Split { ratio: Decimal },
}

/// A requested lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Fund,
    Release { amount: Decimal },
    Cancel,
    OpenDispute,
    Resolve(Resolution),
}

impl Transition {
    pub fn operation(&self) -> EscrowOperation {
        match self {
            Self::Fund => EscrowOperation::Fund,
            Self::Release { .. } => EscrowOperation::Release,
            Self::Cancel => EscrowOperation::Cancel,
            Self::OpenDispute => EscrowOperation::OpenDispute,
            Self::Resolve(_) => EscrowOperation::ResolveDispute,
        }
    }

    fn kind(&self) -> TransitionKind {
        match self {
            Self::Fund => TransitionKind::Fund,
            Self::Release { .. } => TransitionKind::Release,
            Self::Cancel => TransitionKind::Cancel,
            Self::OpenDispute => TransitionKind::OpenDispute,
            Self::Resolve(Resolution::Release) => TransitionKind::ResolveRelease,
            Self::Resolve(Resolution::Refund) => TransitionKind::ResolveRefund,
            Self::Resolve(Resolution::Split { .. }) => TransitionKind::ResolveSplit,
        }
    }
}

/// Transition without its payload, the key of the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    Fund,
    Release,
    Cancel,
    OpenDispute,
    ResolveRelease,
    ResolveRefund,
    ResolveSplit,
}

impl TransitionKind {
    pub const ALL: [TransitionKind; 7] = [
        Self::Fund,
        Self::Release,
        Self::Cancel,
        Self::OpenDispute,
        Self::ResolveRelease,
        Self::ResolveRefund,
        Self::ResolveSplit,
    ];
}

/// Where a legal transition leads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Status(EscrowStatus),
    /// `Released` once everything is out, `PartiallyReleased` otherwise
    ByReleasedBalance,
}

/// Result of validating a transition against a loaded record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub from: EscrowStatus,
    pub to: EscrowStatus,
    /// Running total after the transition
    pub released_amount: Decimal,
    /// Amount this transition sends to the recipient
    pub released_now: Decimal,
}

pub struct EscrowStateMachine;

impl EscrowStateMachine {
    /// The transition table
    pub fn edge(from: EscrowStatus, kind: TransitionKind) -> Option<Target> {
        use EscrowStatus::*;
        use TransitionKind as K;

        match from {
            Pending => match kind {
                K::Fund => Some(Target::Status(Funded)),
                K::Cancel => Some(Target::Status(Cancelled)),
                _ => None,
            },
            Funded => match kind {
                K::Release => Some(Target::ByReleasedBalance),
                K::Cancel => Some(Target::Status(Cancelled)),
                K::OpenDispute => Some(Target::Status(Disputed)),
                _ => None,
            },
            PartiallyReleased => match kind {
                K::Release => Some(Target::ByReleasedBalance),
                _ => None,
            },
            Disputed => match kind {
                K::ResolveRelease => Some(Target::Status(Released)),
                K::ResolveRefund => Some(Target::Status(Refunded)),
                K::ResolveSplit => Some(Target::Status(Split)),
                _ => None,
            },
            Released | Cancelled | Refunded | Split => None,
        }
    }

    /// Operations that are legal from `from`
    pub fn allowed(from: EscrowStatus) -> Vec<TransitionKind> {
        TransitionKind::ALL
            .iter()
            .copied()
            .filter(|kind| Self::edge(from, *kind).is_some())
            .collect()
    }

    /// Validate `transition` against the record and compute the new state
    ///
    /// Pure: nothing is mutated, so a rejected transition leaves no trace.
    pub fn apply(
        escrow: &EscrowTransaction,
        transition: &Transition,
    ) -> Result<TransitionOutcome> {
        let from = escrow.status;
        let target = Self::edge(from, transition.kind()).ok_or(
            EscrowError::InvalidStateTransition {
                from,
                operation: transition.operation(),
            },
        )?;

        let (released_amount, released_now) = match transition {
            Transition::Release { amount } => {
                if *amount <= Decimal::ZERO {
                    return Err(EscrowError::validation(format!(
                        "release amount must be greater than zero, got {}",
                        amount
                    )));
                }
                let total = escrow.released_amount + *amount;
                if total > escrow.amount {
                    return Err(EscrowError::validation(format!(
                        "release of {} exceeds the available balance of {}",
                        amount,
                        escrow.remaining_amount()
                    )));
                }
                (total, *amount)
            }
            Transition::Resolve(Resolution::Release) => {
                (escrow.amount, escrow.remaining_amount())
            }
            Transition::Resolve(Resolution::Split { ratio }) => {
                if *ratio <= Decimal::ZERO || *ratio >= Decimal::ONE {
                    return Err(EscrowError::validation(format!(
                        "split ratio must be strictly between 0 and 1, got {}",
                        ratio
                    )));
                }
                let recipient = escrow.amount * *ratio;
                (recipient, recipient - escrow.released_amount)
            }
            Transition::Fund
            | Transition::Cancel
            | Transition::OpenDispute
            | Transition::Resolve(Resolution::Refund) => (escrow.released_amount, Decimal::ZERO),
        };

        let to = match target {
            Target::Status(status) => status,
            Target::ByReleasedBalance if released_amount == escrow.amount => EscrowStatus::Released,
            Target::ByReleasedBalance => EscrowStatus::PartiallyReleased,
        };

        Ok(TransitionOutcome {
            from,
            to,
            released_amount,
            released_now,
        })
    }
}
