//! In-process sandbox processor
//!
//! Behaves like a well-mannered escrow processor: it mints identifiers,
//! tracks the money it moved per escrow and answers repeated idempotency
//! keys from memory. A key that comes back with different parameters is
//! refused with `idempotency_key_in_use`. Failures and latency can be
//! scripted for tests and local development.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use custodia_types::{EscrowTransactionId, ProcessorError, ProcessorRefs};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    CancelEscrow, CreateEscrowDispute, CreateEscrowPayment, EscrowCallContext, EscrowGateway,
    FundEscrow, ProcessorReceipt, ProcessorResult, ReleaseEscrow, ResolutionDirection,
    RequestFingerprint, ResolveEscrowDispute, ResolveEscrowDisputeSplit,
    IDEMPOTENCY_KEY_IN_USE,
};

/// Sandbox call kinds, used to script failures and count executions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxOperation {
    CreatePayment,
    Fund,
    Release,
    Cancel,
    CreateDispute,
    ResolveDispute,
    ResolveDisputeSplit,
}

/// Money the sandbox has moved for one escrow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxLedger {
    pub captured: Decimal,
    pub to_recipient: Decimal,
    pub to_sender: Decimal,
}

/// A receipt and the request it answered
struct StoredReceipt {
    fingerprint: String,
    receipt: ProcessorReceipt,
}

/// In-memory escrow processor
pub struct SandboxProcessor {
    name: String,
    escrow_enabled: bool,
    latency: Option<Duration>,
    receipts: DashMap<String, StoredReceipt>,
    executions: DashMap<SandboxOperation, u64>,
    ledgers: DashMap<EscrowTransactionId, SandboxLedger>,
    scripted_failures: DashMap<SandboxOperation, VecDeque<ProcessorError>>,
}

impl SandboxProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            escrow_enabled: true,
            latency: None,
            receipts: DashMap::new(),
            executions: DashMap::new(),
            ledgers: DashMap::new(),
            scripted_failures: DashMap::new(),
        }
    }

    /// Report no escrow capability (a payouts-only processor)
    pub fn without_escrow(mut self) -> Self {
        self.escrow_enabled = false;
        self
    }

    /// Delay every call, to widen race windows or trip timeouts
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Make the next call of `operation` fail with `error`
    pub fn fail_next(&self, operation: SandboxOperation, error: ProcessorError) {
        self.scripted_failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// How many times `operation` actually executed (replays excluded)
    pub fn executions(&self, operation: SandboxOperation) -> u64 {
        self.executions.get(&operation).map(|c| *c).unwrap_or(0)
    }

    pub fn ledger(&self, escrow_transaction_id: &EscrowTransactionId) -> SandboxLedger {
        self.ledgers
            .get(escrow_transaction_id)
            .map(|l| *l)
            .unwrap_or_default()
    }

    fn mint(prefix: &str) -> String {
        format!("{}_{}", prefix, Uuid::new_v4().simple())
    }

    /// Run `execute` at most once per idempotency key
    async fn call<R, F>(
        &self,
        operation: SandboxOperation,
        context: &EscrowCallContext,
        request: &R,
        execute: F,
    ) -> ProcessorResult<ProcessorReceipt>
    where
        R: RequestFingerprint,
        F: FnOnce(&mut SandboxLedger) -> ProcessorResult<ProcessorReceipt>,
    {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let key = context.idempotency_key.as_str().to_string();
        let fingerprint = request.fingerprint();
        if let Some(stored) = self.receipts.get(&key) {
            return self.replay(&key, &stored, &fingerprint);
        }

        if let Some(error) = self
            .scripted_failures
            .get_mut(&operation)
            .and_then(|mut queue| queue.pop_front())
        {
            return Err(error);
        }

        // The entry guard holds the shard lock, so two racing calls with the
        // same key cannot both execute.
        let entry = match self.receipts.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                return self.replay(&key, existing.get(), &fingerprint);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => vacant,
        };

        let receipt = {
            let mut ledger = self
                .ledgers
                .entry(context.escrow_transaction_id)
                .or_default();
            execute(&mut *ledger)?
        };

        *self.executions.entry(operation).or_insert(0) += 1;
        entry.insert(StoredReceipt {
            fingerprint,
            receipt: receipt.clone(),
        });
        Ok(receipt)
    }

    fn replay(
        &self,
        key: &str,
        stored: &StoredReceipt,
        fingerprint: &str,
    ) -> ProcessorResult<ProcessorReceipt> {
        if stored.fingerprint != fingerprint {
            warn!(processor = %self.name, key = %key, "Idempotency key reused with different parameters");
            return Err(self
                .error(
                    IDEMPOTENCY_KEY_IN_USE,
                    format!("key {} was already used for a different request", key),
                )
                .with_details(serde_json::json!({
                    "original": stored.fingerprint,
                    "requested": fingerprint,
                })));
        }
        debug!(processor = %self.name, key = %key, "Replayed idempotent call");
        Ok(stored.receipt.clone())
    }

    fn error(&self, code: &str, message: impl Into<String>) -> ProcessorError {
        ProcessorError::new(self.name.clone(), code, message)
    }

    fn require_escrow_id(&self, context: &EscrowCallContext) -> ProcessorResult<()> {
        if context.processor_escrow_id.is_none() {
            return Err(self.error("missing_escrow", "processor escrow id is required"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EscrowGateway for SandboxProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_escrow(&self) -> bool {
        self.escrow_enabled
    }

    async fn create_escrow_payment(
        &self,
        request: &CreateEscrowPayment,
    ) -> ProcessorResult<ProcessorReceipt> {
        let escrow_id = Self::mint("sbx_esc");
        let transaction_id = Self::mint("sbx_txn");
        let secret = format!("{}_secret_{}", escrow_id, Uuid::new_v4().simple());

        self.call(SandboxOperation::CreatePayment, &request.context, request, |_| {
            Ok(ProcessorReceipt {
                refs: ProcessorRefs {
                    processor_transaction_id: Some(transaction_id),
                    processor_escrow_id: Some(escrow_id.clone()),
                    ..Default::default()
                },
                redirect_url: Some(format!("https://sandbox.custodia.local/checkout/{}", escrow_id)),
                client_secret: Some(secret),
                raw: serde_json::json!({
                    "amount": request.amount,
                    "currency": request.currency,
                }),
            })
        })
        .await
    }

    async fn fund_escrow(&self, request: &FundEscrow) -> ProcessorResult<ProcessorReceipt> {
        self.require_escrow_id(&request.context)?;
        self.call(SandboxOperation::Fund, &request.context, request, |ledger| {
            ledger.captured += request.amount;
            Ok(ProcessorReceipt {
                refs: ProcessorRefs {
                    processor_transaction_id: Some(Self::mint("sbx_cap")),
                    ..Default::default()
                },
                ..Default::default()
            })
        })
        .await
    }

    async fn release_escrow(&self, request: &ReleaseEscrow) -> ProcessorResult<ProcessorReceipt> {
        self.require_escrow_id(&request.context)?;
        let name = self.name.clone();
        self.call(SandboxOperation::Release, &request.context, request, |ledger| {
            let held = ledger.captured - ledger.to_recipient - ledger.to_sender;
            if request.amount > held {
                return Err(ProcessorError::new(
                    name,
                    "insufficient_escrow_balance",
                    format!("cannot release {} with {} held", request.amount, held),
                ));
            }
            ledger.to_recipient += request.amount;
            Ok(ProcessorReceipt {
                refs: ProcessorRefs {
                    processor_transfer_id: Some(Self::mint("sbx_tr")),
                    ..Default::default()
                },
                ..Default::default()
            })
        })
        .await
    }

    async fn cancel_escrow(&self, request: &CancelEscrow) -> ProcessorResult<ProcessorReceipt> {
        self.require_escrow_id(&request.context)?;
        self.call(SandboxOperation::Cancel, &request.context, request, |ledger| {
            let refund_id = if request.refund_amount > Decimal::ZERO {
                ledger.to_sender += request.refund_amount;
                Some(Self::mint("sbx_re"))
            } else {
                None
            };
            Ok(ProcessorReceipt {
                refs: ProcessorRefs {
                    processor_refund_id: refund_id,
                    ..Default::default()
                },
                ..Default::default()
            })
        })
        .await
    }

    async fn create_escrow_dispute(
        &self,
        request: &CreateEscrowDispute,
    ) -> ProcessorResult<ProcessorReceipt> {
        self.require_escrow_id(&request.context)?;
        self.call(SandboxOperation::CreateDispute, &request.context, request, |_| {
            Ok(ProcessorReceipt {
                refs: ProcessorRefs {
                    processor_dispute_id: Some(Self::mint("sbx_dp")),
                    ..Default::default()
                },
                ..Default::default()
            })
        })
        .await
    }

    async fn resolve_escrow_dispute(
        &self,
        request: &ResolveEscrowDispute,
    ) -> ProcessorResult<ProcessorReceipt> {
        self.require_escrow_id(&request.context)?;
        self.call(SandboxOperation::ResolveDispute, &request.context, request, |ledger| {
            let mut refs = ProcessorRefs::default();
            match request.direction {
                ResolutionDirection::ToRecipient => {
                    ledger.to_recipient += request.amount;
                    refs.processor_transfer_id = Some(Self::mint("sbx_tr"));
                }
                ResolutionDirection::ToSender => {
                    ledger.to_sender += request.amount;
                    refs.processor_refund_id = Some(Self::mint("sbx_re"));
                }
            }
            Ok(ProcessorReceipt {
                refs,
                ..Default::default()
            })
        })
        .await
    }

    async fn resolve_escrow_dispute_split(
        &self,
        request: &ResolveEscrowDisputeSplit,
    ) -> ProcessorResult<ProcessorReceipt> {
        self.require_escrow_id(&request.context)?;
        self.call(
            SandboxOperation::ResolveDisputeSplit,
            &request.context,
            request,
            |ledger| {
                ledger.to_recipient += request.recipient_amount;
                ledger.to_sender += request.sender_amount;
                Ok(ProcessorReceipt {
                    refs: ProcessorRefs {
                        processor_transfer_id: Some(Self::mint("sbx_tr")),
                        processor_refund_id: Some(Self::mint("sbx_re")),
                        ..Default::default()
                    },
                    ..Default::default()
                })
            },
        )
        .await
    }
}
