#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use custodia_escrow::{
    CreateEscrowRequest, EscrowConfig, EscrowRepository, EscrowService, FundOptions,
    InMemoryEscrowRepository,
};
use custodia_gateway::{ProcessorRegistry, SandboxProcessor};
use custodia_types::{Currency, EscrowId, EscrowTransaction, EscrowType, UserId};
use rust_decimal::Decimal;

pub struct Harness {
    pub service: EscrowService,
    pub sandbox: Arc<SandboxProcessor>,
    pub repository: Arc<dyn EscrowRepository>,
}

pub fn registry(sandbox: &Arc<SandboxProcessor>) -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();
    registry.register(sandbox.clone()).unwrap();
    registry
}

pub fn harness() -> Harness {
    harness_with(
        SandboxProcessor::new("sandbox").shared(),
        Arc::new(InMemoryEscrowRepository::new()),
        EscrowConfig::default(),
    )
}

pub fn harness_with(
    sandbox: Arc<SandboxProcessor>,
    repository: Arc<dyn EscrowRepository>,
    config: EscrowConfig,
) -> Harness {
    let service = EscrowService::new(repository.clone(), registry(&sandbox), config);
    Harness {
        service,
        sandbox,
        repository,
    }
}

pub fn short_timeout(timeout: Duration) -> EscrowConfig {
    EscrowConfig::default().with_processor_timeout(timeout)
}

pub fn create_request(amount: Decimal, currency: Currency) -> CreateEscrowRequest {
    CreateEscrowRequest {
        sender_id: UserId::from("alice"),
        recipient_id: UserId::from("bob"),
        amount,
        currency,
        description: "website redesign".to_string(),
        processor_name: None,
        payment_method_id: "pm_card_visa".to_string(),
        release_conditions: None,
        expiry_days: None,
        escrow_type: EscrowType::Standard,
        metadata: serde_json::Value::Null,
    }
}

pub async fn created(service: &EscrowService, amount: Decimal, currency: Currency) -> EscrowId {
    service
        .create_escrow_transaction(create_request(amount, currency))
        .await
        .unwrap()
        .escrow_id
}

pub async fn funded(
    service: &EscrowService,
    amount: Decimal,
    currency: Currency,
) -> EscrowTransaction {
    let escrow_id = created(service, amount, currency).await;
    service
        .fund_escrow(&escrow_id, FundOptions::default())
        .await
        .unwrap()
}

pub fn assert_invariants(escrow: &EscrowTransaction) {
    let violations = escrow.invariant_violations();
    assert!(violations.is_empty(), "invariants violated: {:?}", violations);
}
