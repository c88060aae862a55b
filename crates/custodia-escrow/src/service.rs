//! Escrow service façade
//!
//! Every mutating operation follows the same protocol:
//!
//! 1. load the record and its version
//! 2. validate the transition against what was loaded
//! 3. call the processor, bounded by the configured timeout
//! 4. commit conditionally on the loaded version, with one timeline entry
//!
//! No lock is held across the processor call. When the commit loses a race
//! the processor is not called again; the caller gets `ConcurrencyConflict`
//! and reconciles with a fresh load.
//!
//! Without a caller key the processor key is `{etx}:{operation}:v{version}`,
//! one slot per operation and version. If a call reached the processor but
//! its commit was lost, the next attempt at that version lands in the same
//! slot. Repeating the original request replays it and commits. Asking for
//! something else is refused by the processor, so the record never claims a
//! movement the processor did not make.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use custodia_gateway::{
    CancelEscrow, CreateEscrowDispute, CreateEscrowPayment, EscrowCallContext, EscrowGateway,
    FundEscrow, IdempotencyKey, ProcessorReceipt, ProcessorRegistry, ProcessorResult,
    ReleaseEscrow, IDEMPOTENCY_KEY_IN_USE,
};
use custodia_types::{
    ensure_positive, EscrowDispute, EscrowError, EscrowId, EscrowOperation, EscrowStatus,
    EscrowTransaction, EscrowTransactionId, ProcessorError, Result, TimelineEntry,
    UserId,
};
use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EscrowConfig;
use crate::dispute::DisputeResolver;
use crate::options::*;
use crate::repository::{EscrowMutation, EscrowRepository, UserEscrowFilter};
use crate::state_machine::{EscrowStateMachine, Transition};
use crate::timeline::{self, PendingEntry};

/// A loaded record with everything needed to call its processor
struct Attempt {
    escrow: EscrowTransaction,
    gateway: Arc<dyn EscrowGateway>,
    context: EscrowCallContext,
}

impl Attempt {
    fn entry(
        &self,
        operation: EscrowOperation,
        status: EscrowStatus,
        actor: Option<&UserId>,
        caller_key: Option<&str>,
    ) -> PendingEntry {
        PendingEntry::new(operation, status)
            .actor(actor)
            .idempotency_key(caller_key)
            .processor_key(self.context.idempotency_key.as_str())
    }
}

enum Begin {
    /// Already committed under the caller's idempotency key
    Replayed(EscrowTransaction),
    Ready(Attempt),
}

/// Public entry point of the escrow engine
pub struct EscrowService {
    repository: Arc<dyn EscrowRepository>,
    processors: Arc<ProcessorRegistry>,
    config: EscrowConfig,
}

impl EscrowService {
    pub fn new(
        repository: Arc<dyn EscrowRepository>,
        processors: ProcessorRegistry,
        config: EscrowConfig,
    ) -> Self {
        Self {
            repository,
            processors: Arc::new(processors),
            config,
        }
    }

    pub fn config(&self) -> &EscrowConfig {
        &self.config
    }

    pub fn processors(&self) -> &ProcessorRegistry {
        &self.processors
    }

    /// Open an escrow with the processor and persist it as `Pending`
    #[instrument(skip(self, request), fields(sender = %request.sender_id, recipient = %request.recipient_id))]
    pub async fn create_escrow_transaction(
        &self,
        request: CreateEscrowRequest,
    ) -> Result<CreateEscrowResponse> {
        request.validate()?;
        let gateway = self.processors.resolve(request.processor_name.as_deref())?;

        let operation = EscrowOperation::Create;
        let escrow_transaction_id = EscrowTransactionId::new();
        let expiry_days = request.expiry_days.unwrap_or(self.config.default_expiry_days);
        let expiry_date = Utc::now() + chrono::Duration::days(i64::from(expiry_days));
        let idempotency_key = IdempotencyKey::new(&escrow_transaction_id, operation, "v0");

        let payment = CreateEscrowPayment {
            context: EscrowCallContext {
                escrow_transaction_id,
                processor_escrow_id: None,
                idempotency_key: idempotency_key.clone(),
            },
            sender_id: request.sender_id.clone(),
            recipient_id: request.recipient_id.clone(),
            amount: request.amount,
            currency: request.currency.clone(),
            description: request.description.clone(),
            payment_method_id: request.payment_method_id.clone(),
            escrow_type: request.escrow_type,
            expiry_date,
            release_conditions: request.release_conditions.clone(),
        };
        let receipt = self
            .invoke(operation, gateway.as_ref(), gateway.create_escrow_payment(&payment))
            .await?;

        let now = Utc::now();
        let draft = EscrowTransaction {
            escrow_id: EscrowId::new(),
            escrow_transaction_id,
            sender_id: request.sender_id,
            recipient_id: request.recipient_id,
            amount: request.amount,
            currency: request.currency,
            released_amount: Decimal::ZERO,
            status: EscrowStatus::Pending,
            escrow_type: request.escrow_type,
            description: request.description,
            payment_method_id: request.payment_method_id,
            release_conditions: request.release_conditions,
            processor: gateway.name().to_string(),
            processor_refs: receipt.refs.clone(),
            dispute: None,
            timeline: Vec::new(),
            expiry_date,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        let entry = PendingEntry::new(operation, EscrowStatus::Pending)
            .actor(Some(&draft.sender_id))
            .processor_key(idempotency_key.as_str());

        let escrow = self.repository.insert(draft, entry).await?;

        info!(
            escrow_id = %escrow.escrow_id,
            escrow_transaction_id = %escrow.escrow_transaction_id,
            processor = %escrow.processor,
            amount = %escrow.amount,
            currency = %escrow.currency,
            "Escrow created"
        );
        metrics::counter!(
            "custodia_escrow_transitions_total",
            "operation" => operation.as_str(),
            "status" => EscrowStatus::Pending.as_str()
        )
        .increment(1);

        Ok(CreateEscrowResponse {
            escrow_id: escrow.escrow_id,
            escrow_transaction_id: escrow.escrow_transaction_id,
            processor: escrow.processor,
            redirect_url: receipt.redirect_url,
            client_secret: receipt.client_secret,
            status: escrow.status,
            amount: escrow.amount,
            currency: escrow.currency,
        })
    }

    /// Capture the sender's funds: `Pending -> Funded`
    #[instrument(skip(self, options), fields(escrow_id = %escrow_id))]
    pub async fn fund_escrow(
        &self,
        escrow_id: &EscrowId,
        options: FundOptions,
    ) -> Result<EscrowTransaction> {
        let operation = EscrowOperation::Fund;
        let attempt = match self
            .begin(escrow_id, operation, options.idempotency_key.as_deref())
            .await?
        {
            Begin::Replayed(escrow) => return Ok(escrow),
            Begin::Ready(attempt) => attempt,
        };
        let escrow = &attempt.escrow;
        let outcome = EscrowStateMachine::apply(escrow, &Transition::Fund)?;

        let request = FundEscrow {
            context: attempt.context.clone(),
            amount: escrow.amount,
            currency: escrow.currency.clone(),
            payment_method_id: options
                .payment_method_id
                .clone()
                .unwrap_or_else(|| escrow.payment_method_id.clone()),
            options: options.options.clone(),
        };
        let receipt = self
            .invoke(operation, attempt.gateway.as_ref(), attempt.gateway.fund_escrow(&request))
            .await?;

        let entry = attempt
            .entry(
                operation,
                outcome.to,
                options.funded_by.as_ref(),
                options.idempotency_key.as_deref(),
            )
            .note(options.note)
            .context(options.metadata);
        let mutation = EscrowMutation {
            status: outcome.to,
            released_amount: outcome.released_amount,
            processor_refs: receipt.refs,
            dispute: None,
            entry,
        };
        self.commit(&attempt, operation, mutation).await
    }

    /// Release part or all of the held funds to the recipient
    #[instrument(skip(self, options), fields(escrow_id = %escrow_id))]
    pub async fn release_escrow(
        &self,
        escrow_id: &EscrowId,
        options: ReleaseOptions,
    ) -> Result<EscrowTransaction> {
        if let Some(amount) = options.release_amount {
            ensure_positive(amount, "releaseAmount")?;
        }

        let operation = EscrowOperation::Release;
        let attempt = match self
            .begin(escrow_id, operation, options.idempotency_key.as_deref())
            .await?
        {
            Begin::Replayed(escrow) => return Ok(escrow),
            Begin::Ready(attempt) => attempt,
        };
        let escrow = &attempt.escrow;
        let amount = options
            .release_amount
            .unwrap_or_else(|| escrow.remaining_amount());
        let outcome = EscrowStateMachine::apply(escrow, &Transition::Release { amount })?;

        let request = ReleaseEscrow {
            context: attempt.context.clone(),
            recipient_id: escrow.recipient_id.clone(),
            amount: outcome.released_now,
            currency: escrow.currency.clone(),
        };
        let receipt = self
            .invoke(operation, attempt.gateway.as_ref(), attempt.gateway.release_escrow(&request))
            .await?;

        let entry = attempt
            .entry(
                operation,
                outcome.to,
                options.released_by.as_ref(),
                options.idempotency_key.as_deref(),
            )
            .note(options.note)
            .context(options.metadata);
        let mutation = EscrowMutation {
            status: outcome.to,
            released_amount: outcome.released_amount,
            processor_refs: receipt.refs,
            dispute: None,
            entry,
        };
        self.commit(&attempt, operation, mutation).await
    }

    /// Cancel before any release, refunding captured funds
    #[instrument(skip(self, options), fields(escrow_id = %escrow_id))]
    pub async fn cancel_escrow(
        &self,
        escrow_id: &EscrowId,
        options: CancelOptions,
    ) -> Result<EscrowTransaction> {
        let operation = EscrowOperation::Cancel;
        let attempt = match self
            .begin(escrow_id, operation, options.idempotency_key.as_deref())
            .await?
        {
            Begin::Replayed(escrow) => return Ok(escrow),
            Begin::Ready(attempt) => attempt,
        };
        let escrow = &attempt.escrow;
        let outcome = EscrowStateMachine::apply(escrow, &Transition::Cancel)?;

        let refund_amount = match escrow.status {
            EscrowStatus::Funded => escrow.remaining_amount(),
            _ => Decimal::ZERO,
        };
        let request = CancelEscrow {
            context: attempt.context.clone(),
            sender_id: escrow.sender_id.clone(),
            refund_amount,
            currency: escrow.currency.clone(),
            reason: options.reason.clone(),
        };
        let receipt = self
            .invoke(operation, attempt.gateway.as_ref(), attempt.gateway.cancel_escrow(&request))
            .await?;

        let entry = attempt
            .entry(
                operation,
                outcome.to,
                options.cancelled_by.as_ref(),
                options.idempotency_key.as_deref(),
            )
            .note(options.reason)
            .context(options.metadata);
        let mutation = EscrowMutation {
            status: outcome.to,
            released_amount: outcome.released_amount,
            processor_refs: receipt.refs,
            dispute: None,
            entry,
        };
        self.commit(&attempt, operation, mutation).await
    }

    /// Freeze a funded escrow under a dispute
    #[instrument(skip(self, options), fields(escrow_id = %escrow_id))]
    pub async fn open_dispute(
        &self,
        escrow_id: &EscrowId,
        options: OpenDisputeOptions,
    ) -> Result<EscrowTransaction> {
        if options.dispute_reason.trim().is_empty() {
            return Err(EscrowError::validation("disputeReason is required"));
        }

        let operation = EscrowOperation::OpenDispute;
        let attempt = match self
            .begin(escrow_id, operation, options.idempotency_key.as_deref())
            .await?
        {
            Begin::Replayed(escrow) => return Ok(escrow),
            Begin::Ready(attempt) => attempt,
        };
        let escrow = &attempt.escrow;
        let outcome = EscrowStateMachine::apply(escrow, &Transition::OpenDispute)?;

        if !escrow.involves(&options.opened_by) {
            debug!(opened_by = %options.opened_by, "Dispute opened by a non-party");
        }

        let request = CreateEscrowDispute {
            context: attempt.context.clone(),
            opened_by: options.opened_by.clone(),
            reason: options.dispute_reason.clone(),
            evidence: options.evidence.clone(),
        };
        let receipt = self
            .invoke(
                operation,
                attempt.gateway.as_ref(),
                attempt.gateway.create_escrow_dispute(&request),
            )
            .await?;

        let entry = attempt
            .entry(
                operation,
                outcome.to,
                Some(&options.opened_by),
                options.idempotency_key.as_deref(),
            )
            .note(Some(options.dispute_reason.clone()))
            .context(options.metadata);
        let dispute = EscrowDispute::open(options.opened_by, options.dispute_reason, options.evidence);
        let mutation = EscrowMutation {
            status: outcome.to,
            released_amount: outcome.released_amount,
            processor_refs: receipt.refs,
            dispute: Some(dispute),
            entry,
        };
        self.commit(&attempt, operation, mutation).await
    }

    /// Settle an open dispute by release, refund or split
    #[instrument(skip(self, options), fields(escrow_id = %escrow_id, resolution = %options.resolution))]
    pub async fn resolve_dispute(
        &self,
        escrow_id: &EscrowId,
        options: ResolveDisputeOptions,
    ) -> Result<EscrowTransaction> {
        let operation = EscrowOperation::ResolveDispute;
        let attempt = match self
            .begin(escrow_id, operation, options.idempotency_key.as_deref())
            .await?
        {
            Begin::Replayed(escrow) => return Ok(escrow),
            Begin::Ready(attempt) => attempt,
        };
        let escrow = &attempt.escrow;
        let plan = DisputeResolver::plan(escrow, options.resolution, options.split_ratio)?;
        let dispute = DisputeResolver::resolved(escrow, &plan, options.resolved_by.clone())?;

        let receipt = self
            .invoke(
                operation,
                attempt.gateway.as_ref(),
                DisputeResolver::settle(attempt.gateway.as_ref(), escrow, &plan, attempt.context.clone()),
            )
            .await?;

        info!(
            resolution = %plan.kind,
            recipient_amount = %plan.recipient_amount,
            sender_amount = %plan.sender_amount,
            "Dispute settled by processor"
        );

        let entry = attempt
            .entry(
                operation,
                plan.outcome.to,
                options.resolved_by.as_ref(),
                options.idempotency_key.as_deref(),
            )
            .note(options.note)
            .context(options.metadata);
        let mutation = EscrowMutation {
            status: plan.outcome.to,
            released_amount: plan.outcome.released_amount,
            processor_refs: receipt.refs,
            dispute: Some(dispute),
            entry,
        };
        self.commit(&attempt, operation, mutation).await
    }

    pub async fn get_escrow_transaction(&self, escrow_id: &EscrowId) -> Result<EscrowTransaction> {
        self.repository.load(escrow_id).await
    }

    /// Escrows where the user is sender or recipient, newest first
    pub async fn get_user_escrow_transactions(
        &self,
        user_id: &UserId,
        filter: &UserEscrowFilter,
    ) -> Result<Vec<EscrowTransaction>> {
        filter.validate()?;
        self.repository.list_for_user(user_id, filter).await
    }

    /// Audit timeline in commit order
    pub async fn get_escrow_timeline(&self, escrow_id: &EscrowId) -> Result<Vec<TimelineEntry>> {
        let escrow = self.repository.load(escrow_id).await?;
        Ok(timeline::ordered(&escrow))
    }

    async fn begin(
        &self,
        escrow_id: &EscrowId,
        operation: EscrowOperation,
        caller_key: Option<&str>,
    ) -> Result<Begin> {
        let escrow = self.repository.load(escrow_id).await?;

        if let Some(key) = caller_key {
            if let Some(entry) = timeline::find_replay(&escrow, operation, key) {
                debug!(
                    operation = %operation,
                    idempotency_key = key,
                    sequence_no = entry.sequence_no,
                    "Replayed committed operation"
                );
                return Ok(Begin::Replayed(escrow));
            }
        }

        let gateway = self.processors.get(&escrow.processor)?;
        let suffix = caller_key
            .map(str::to_string)
            .unwrap_or_else(|| format!("v{}", escrow.version));
        let context = EscrowCallContext {
            escrow_transaction_id: escrow.escrow_transaction_id,
            processor_escrow_id: escrow.processor_refs.processor_escrow_id.clone(),
            idempotency_key: IdempotencyKey::new(&escrow.escrow_transaction_id, operation, &suffix),
        };

        Ok(Begin::Ready(Attempt {
            escrow,
            gateway,
            context,
        }))
    }

    async fn invoke<F>(
        &self,
        operation: EscrowOperation,
        gateway: &dyn EscrowGateway,
        call: F,
    ) -> Result<ProcessorReceipt>
    where
        F: Future<Output = ProcessorResult<ProcessorReceipt>>,
    {
        let limit = self.config.processor_timeout();
        let result = match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(ProcessorError::timeout(gateway.name(), limit)),
        };

        result.map_err(|failure| {
            if failure.code == IDEMPOTENCY_KEY_IN_USE {
                error!(
                    operation = %operation,
                    processor = %failure.processor,
                    details = %failure.details,
                    "Processor already executed a different request under this key; \
                     repeat the original request to reconcile"
                );
            } else {
                warn!(
                    operation = %operation,
                    processor = %failure.processor,
                    code = %failure.code,
                    retryable = failure.retryable,
                    "Processor call failed: {}",
                    failure.message
                );
            }
            metrics::counter!(
                "custodia_processor_failures_total",
                "operation" => operation.as_str(),
                "processor" => gateway.name().to_string()
            )
            .increment(1);
            EscrowError::from(failure)
        })
    }

    async fn commit(
        &self,
        attempt: &Attempt,
        operation: EscrowOperation,
        mutation: EscrowMutation,
    ) -> Result<EscrowTransaction> {
        let escrow_id = attempt.escrow.escrow_id;
        let expected_version = attempt.escrow.version;

        match self
            .repository
            .commit(&escrow_id, expected_version, mutation)
            .await
        {
            Ok(escrow) => {
                info!(
                    escrow_id = %escrow_id,
                    operation = %operation,
                    from = %attempt.escrow.status,
                    to = %escrow.status,
                    version = escrow.version,
                    released_amount = %escrow.released_amount,
                    "Escrow transition committed"
                );
                metrics::counter!(
                    "custodia_escrow_transitions_total",
                    "operation" => operation.as_str(),
                    "status" => escrow.status.as_str()
                )
                .increment(1);
                Ok(escrow)
            }
            Err(error) => {
                if let EscrowError::ConcurrencyConflict { .. } = error {
                    warn!(
                        escrow_id = %escrow_id,
                        operation = %operation,
                        expected_version,
                        idempotency_key = %attempt.context.idempotency_key,
                        "Processor call succeeded but the commit lost a race"
                    );
                    metrics::counter!(
                        "custodia_escrow_conflicts_total",
                        "operation" => operation.as_str()
                    )
                    .increment(1);
                }
                Err(error)
            }
        }
    }
}
