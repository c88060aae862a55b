//! Dispute resolution
//!
//! Turns a resolution decision into a state transition, the amounts each
//! party receives and the processor call that moves them.

use chrono::Utc;
use custodia_gateway::{
    EscrowCallContext, EscrowGateway, ProcessorReceipt, ProcessorResult, ResolutionDirection,
    ResolveEscrowDispute, ResolveEscrowDisputeSplit,
};
use custodia_types::{
    DisputeResolutionKind, DisputeStatus, EscrowDispute, EscrowError, EscrowTransaction, Result,
    UserId,
};
use rust_decimal::Decimal;

use crate::state_machine::{EscrowStateMachine, Resolution, Transition, TransitionOutcome};

/// A validated resolution, ready to be sent to the processor
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionPlan {
    pub kind: DisputeResolutionKind,
    pub split_ratio: Option<Decimal>,
    pub outcome: TransitionOutcome,
    /// Paid to the recipient by this resolution
    pub recipient_amount: Decimal,
    /// Returned to the sender by this resolution
    pub sender_amount: Decimal,
}

pub struct DisputeResolver;

impl DisputeResolver {
    /// Validate the decision against the record
    pub fn plan(
        escrow: &EscrowTransaction,
        kind: DisputeResolutionKind,
        split_ratio: Option<Decimal>,
    ) -> Result<ResolutionPlan> {
        let resolution = match kind {
            DisputeResolutionKind::Release => Resolution::Release,
            DisputeResolutionKind::Refund => Resolution::Refund,
            DisputeResolutionKind::Split => {
                let ratio = split_ratio.ok_or_else(|| {
                    EscrowError::validation("splitRatio is required for a split resolution")
                })?;
                if ratio <= Decimal::ZERO || ratio >= Decimal::ONE {
                    return Err(EscrowError::validation(format!(
                        "splitRatio must be strictly between 0 and 1, got {}",
                        ratio
                    )));
                }
                Resolution::Split { ratio }
            }
        };

        let outcome = EscrowStateMachine::apply(escrow, &Transition::Resolve(resolution))?;
        let remaining = escrow.remaining_amount();

        let (recipient_amount, sender_amount, split_ratio) = match resolution {
            Resolution::Release => (remaining, Decimal::ZERO, None),
            Resolution::Refund => (Decimal::ZERO, remaining, None),
            Resolution::Split { ratio } => {
                let recipient = outcome.released_now;
                (recipient, remaining - recipient, Some(ratio))
            }
        };

        Ok(ResolutionPlan {
            kind,
            split_ratio,
            outcome,
            recipient_amount,
            sender_amount,
        })
    }

    /// Ask the processor to move the funds
    pub async fn settle(
        gateway: &dyn EscrowGateway,
        escrow: &EscrowTransaction,
        plan: &ResolutionPlan,
        context: EscrowCallContext,
    ) -> ProcessorResult<ProcessorReceipt> {
        let processor_dispute_id = escrow.processor_refs.processor_dispute_id.clone();

        match (plan.kind, plan.split_ratio) {
            (DisputeResolutionKind::Split, Some(split_ratio)) => {
                gateway
                    .resolve_escrow_dispute_split(&ResolveEscrowDisputeSplit {
                        context,
                        processor_dispute_id,
                        split_ratio,
                        recipient_amount: plan.recipient_amount,
                        sender_amount: plan.sender_amount,
                        currency: escrow.currency.clone(),
                    })
                    .await
            }
            (DisputeResolutionKind::Refund, _) => {
                gateway
                    .resolve_escrow_dispute(&ResolveEscrowDispute {
                        context,
                        processor_dispute_id,
                        direction: ResolutionDirection::ToSender,
                        amount: plan.sender_amount,
                        currency: escrow.currency.clone(),
                    })
                    .await
            }
            _ => {
                gateway
                    .resolve_escrow_dispute(&ResolveEscrowDispute {
                        context,
                        processor_dispute_id,
                        direction: ResolutionDirection::ToRecipient,
                        amount: plan.recipient_amount,
                        currency: escrow.currency.clone(),
                    })
                    .await
            }
        }
    }

    /// The dispute record as it reads after the resolution commits
    pub fn resolved(
        escrow: &EscrowTransaction,
        plan: &ResolutionPlan,
        resolved_by: Option<UserId>,
    ) -> Result<EscrowDispute> {
        let mut dispute = escrow.dispute.clone().ok_or_else(|| {
            EscrowError::storage(format!(
                "escrow {} is disputed but has no dispute record",
                escrow.escrow_id
            ))
        })?;

        dispute.status = DisputeStatus::Resolved;
        dispute.resolution = Some(plan.kind);
        dispute.resolved_by = resolved_by;
        dispute.resolve_date = Some(Utc::now());
        dispute.split_ratio = plan.split_ratio;
        Ok(dispute)
    }
}
