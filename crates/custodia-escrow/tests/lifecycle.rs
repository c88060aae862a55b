mod common;

use std::time::Duration;

use common::*;
use custodia_escrow::{
    CancelOptions, FundOptions, InMemoryEscrowRepository, OpenDisputeOptions, ReleaseOptions,
    ResolveDisputeOptions, UserEscrowFilter,
};
use custodia_gateway::{SandboxOperation, SandboxProcessor};
use custodia_types::{
    Currency, DisputeResolutionKind, DisputeStatus, EscrowError, EscrowId, EscrowOperation,
    EscrowStatus, ProcessorError, UserId,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn release(amount: Decimal) -> ReleaseOptions {
    ReleaseOptions {
        released_by: Some(UserId::from("alice")),
        release_amount: Some(amount),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_fund_release_full() {
    let h = harness();

    let created = h
        .service
        .create_escrow_transaction(create_request(dec!(200), Currency::usd()))
        .await
        .unwrap();
    assert_eq!(created.status, EscrowStatus::Pending);
    assert_eq!(created.processor, "sandbox");
    assert!(created.redirect_url.is_some());
    assert!(created.client_secret.is_some());

    let funded = h
        .service
        .fund_escrow(&created.escrow_id, FundOptions::default())
        .await
        .unwrap();
    assert_eq!(funded.status, EscrowStatus::Funded);

    let released = h
        .service
        .release_escrow(&created.escrow_id, release(dec!(200)))
        .await
        .unwrap();
    assert_eq!(released.status, EscrowStatus::Released);
    assert_eq!(released.released_amount, dec!(200));
    assert_eq!(released.version, 3);
    assert!(released.processor_refs.processor_transfer_id.is_some());
    assert_invariants(&released);
}

#[tokio::test]
async fn test_partial_then_full_release() {
    let h = harness();
    let escrow = funded(&h.service, dec!(150), Currency::eur()).await;

    let partial = h
        .service
        .release_escrow(&escrow.escrow_id, release(dec!(50)))
        .await
        .unwrap();
    assert_eq!(partial.status, EscrowStatus::PartiallyReleased);
    assert_eq!(partial.released_amount, dec!(50));

    let full = h
        .service
        .release_escrow(&escrow.escrow_id, release(dec!(100)))
        .await
        .unwrap();
    assert_eq!(full.status, EscrowStatus::Released);
    assert_eq!(full.released_amount, dec!(150));
    assert_eq!(h.sandbox.ledger(&full.escrow_transaction_id).to_recipient, dec!(150));
    assert_invariants(&full);
}

#[tokio::test]
async fn test_release_without_amount_takes_remaining_balance() {
    let h = harness();
    let escrow = funded(&h.service, dec!(90), Currency::usd()).await;
    h.service
        .release_escrow(&escrow.escrow_id, release(dec!(30)))
        .await
        .unwrap();

    let rest = h
        .service
        .release_escrow(&escrow.escrow_id, ReleaseOptions::default())
        .await
        .unwrap();
    assert_eq!(rest.status, EscrowStatus::Released);
    assert_eq!(rest.released_amount, dec!(90));
}

#[tokio::test]
async fn test_dispute_refund() {
    let h = harness();
    let escrow = funded(&h.service, dec!(100), Currency::usd()).await;

    let disputed = h
        .service
        .open_dispute(
            &escrow.escrow_id,
            OpenDisputeOptions {
                evidence: vec!["photo-1.jpg".to_string()],
                ..OpenDisputeOptions::new("alice", "item never arrived")
            },
        )
        .await
        .unwrap();
    assert_eq!(disputed.status, EscrowStatus::Disputed);
    assert!(disputed.processor_refs.processor_dispute_id.is_some());
    let dispute = disputed.dispute.as_ref().unwrap();
    assert_eq!(dispute.status, DisputeStatus::Open);
    assert_eq!(dispute.evidence, vec!["photo-1.jpg".to_string()]);

    let refunded = h
        .service
        .resolve_dispute(
            &escrow.escrow_id,
            ResolveDisputeOptions {
                resolved_by: Some(UserId::from("arbiter")),
                ..ResolveDisputeOptions::new(DisputeResolutionKind::Refund)
            },
        )
        .await
        .unwrap();
    assert_eq!(refunded.status, EscrowStatus::Refunded);
    assert_eq!(refunded.released_amount, Decimal::ZERO);

    let dispute = refunded.dispute.as_ref().unwrap();
    assert_eq!(dispute.status, DisputeStatus::Resolved);
    assert_eq!(dispute.resolution, Some(DisputeResolutionKind::Refund));
    assert_eq!(dispute.resolved_by, Some(UserId::from("arbiter")));
    assert_eq!(h.sandbox.ledger(&refunded.escrow_transaction_id).to_sender, dec!(100));
    assert_invariants(&refunded);
}

#[tokio::test]
async fn test_dispute_split_half() {
    let h = harness();
    let escrow = funded(&h.service, dec!(100), Currency::usd()).await;
    h.service
        .open_dispute(&escrow.escrow_id, OpenDisputeOptions::new("bob", "scope disagreement"))
        .await
        .unwrap();

    let split = h
        .service
        .resolve_dispute(&escrow.escrow_id, ResolveDisputeOptions::split(dec!(0.5)))
        .await
        .unwrap();
    assert_eq!(split.status, EscrowStatus::Split);
    assert_eq!(split.released_amount, dec!(50));
    assert_eq!(split.dispute.as_ref().unwrap().split_ratio, Some(dec!(0.5)));

    let ledger = h.sandbox.ledger(&split.escrow_transaction_id);
    assert_eq!((ledger.to_recipient, ledger.to_sender), (dec!(50), dec!(50)));
    assert_invariants(&split);
}

#[tokio::test]
async fn test_dispute_release_to_recipient() {
    let h = harness();
    let escrow = funded(&h.service, dec!(75), Currency::usd()).await;
    h.service
        .open_dispute(&escrow.escrow_id, OpenDisputeOptions::new("alice", "late"))
        .await
        .unwrap();

    let released = h
        .service
        .resolve_dispute(
            &escrow.escrow_id,
            ResolveDisputeOptions::new(DisputeResolutionKind::Release),
        )
        .await
        .unwrap();
    assert_eq!(released.status, EscrowStatus::Released);
    assert_eq!(released.released_amount, dec!(75));
}

#[tokio::test]
async fn test_cancel_released_escrow_is_rejected_without_change() {
    let h = harness();
    let escrow = funded(&h.service, dec!(200), Currency::usd()).await;
    let released = h
        .service
        .release_escrow(&escrow.escrow_id, release(dec!(200)))
        .await
        .unwrap();

    let err = h
        .service
        .cancel_escrow(&escrow.escrow_id, CancelOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EscrowError::InvalidStateTransition {
            from: EscrowStatus::Released,
            operation: EscrowOperation::Cancel
        }
    ));

    let after = h.service.get_escrow_transaction(&escrow.escrow_id).await.unwrap();
    assert_eq!(after, released);
    assert_eq!(h.sandbox.executions(SandboxOperation::Cancel), 0);
}

#[tokio::test]
async fn test_cancel_pending_and_funded() {
    let h = harness();

    let pending = created(&h.service, dec!(40), Currency::usd()).await;
    let cancelled = h
        .service
        .cancel_escrow(
            &pending,
            CancelOptions {
                cancelled_by: Some(UserId::from("alice")),
                reason: Some("changed my mind".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cancelled.status, EscrowStatus::Cancelled);
    assert!(cancelled.processor_refs.processor_refund_id.is_none());
    assert_eq!(
        cancelled.timeline.last().unwrap().note.as_deref(),
        Some("changed my mind")
    );

    let escrow = funded(&h.service, dec!(40), Currency::usd()).await;
    let cancelled = h
        .service
        .cancel_escrow(&escrow.escrow_id, CancelOptions::default())
        .await
        .unwrap();
    assert_eq!(cancelled.status, EscrowStatus::Cancelled);
    assert!(cancelled.processor_refs.processor_refund_id.is_some());
    assert_eq!(h.sandbox.ledger(&cancelled.escrow_transaction_id).to_sender, dec!(40));
}

#[tokio::test]
async fn test_rejected_transitions_leave_record_untouched() {
    let h = harness();
    let escrow = funded(&h.service, dec!(100), Currency::usd()).await;
    h.service
        .release_escrow(&escrow.escrow_id, release(dec!(60)))
        .await
        .unwrap();
    let before = h.service.get_escrow_transaction(&escrow.escrow_id).await.unwrap();

    let attempts = vec![
        h.service
            .fund_escrow(&escrow.escrow_id, FundOptions::default())
            .await,
        h.service
            .release_escrow(&escrow.escrow_id, release(dec!(41)))
            .await,
        h.service
            .release_escrow(&escrow.escrow_id, release(dec!(-5)))
            .await,
        h.service
            .cancel_escrow(&escrow.escrow_id, CancelOptions::default())
            .await,
        h.service
            .open_dispute(&escrow.escrow_id, OpenDisputeOptions::new("alice", "too late"))
            .await,
        h.service
            .resolve_dispute(
                &escrow.escrow_id,
                ResolveDisputeOptions::new(DisputeResolutionKind::Refund),
            )
            .await,
    ];

    for attempt in attempts {
        let err = attempt.unwrap_err();
        assert!(
            matches!(
                err,
                EscrowError::InvalidStateTransition { .. } | EscrowError::Validation { .. }
            ),
            "{err}"
        );
    }

    let after = h.service.get_escrow_transaction(&escrow.escrow_id).await.unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.status, before.status);
    assert_eq!(after.timeline.len(), before.timeline.len());
    assert_eq!(after.released_amount, dec!(60));
}

#[tokio::test]
async fn test_processor_failure_leaves_no_mutation() {
    let h = harness();
    let escrow_id = created(&h.service, dec!(100), Currency::usd()).await;

    h.sandbox.fail_next(
        SandboxOperation::Fund,
        ProcessorError::new("sandbox", "card_declined", "the card was declined")
            .with_details(serde_json::json!({"decline_code": "insufficient_funds"})),
    );

    let err = h
        .service
        .fund_escrow(&escrow_id, FundOptions::default())
        .await
        .unwrap_err();
    let processor = err.processor_error().unwrap();
    assert_eq!(processor.code, "card_declined");
    assert_eq!(processor.details["decline_code"], "insufficient_funds");
    assert!(!err.is_retryable());

    let after = h.service.get_escrow_transaction(&escrow_id).await.unwrap();
    assert_eq!(after.status, EscrowStatus::Pending);
    assert_eq!(after.version, 1);

    let funded = h
        .service
        .fund_escrow(&escrow_id, FundOptions::default())
        .await
        .unwrap();
    assert_eq!(funded.status, EscrowStatus::Funded);
}

#[tokio::test]
async fn test_processor_timeout_is_retryable_and_leaves_no_mutation() {
    let sandbox = SandboxProcessor::new("sandbox")
        .with_latency(Duration::from_millis(200))
        .shared();
    let repository = Arc::new(InMemoryEscrowRepository::new());
    let patient = harness_with(sandbox.clone(), repository.clone(), short_timeout(Duration::from_secs(5)));
    let hasty = harness_with(sandbox.clone(), repository, short_timeout(Duration::from_millis(20)));

    let escrow_id = created(&patient.service, dec!(100), Currency::usd()).await;

    let err = hasty
        .service
        .fund_escrow(&escrow_id, FundOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.processor_error().unwrap().code, "timeout");
    assert!(err.is_retryable());
    assert_eq!(sandbox.executions(SandboxOperation::Fund), 0);

    let after = hasty.service.get_escrow_transaction(&escrow_id).await.unwrap();
    assert_eq!((after.status, after.version), (EscrowStatus::Pending, 1));
}

#[tokio::test]
async fn test_timeline_records_each_transition() {
    let h = harness();
    let escrow = funded(&h.service, dec!(100), Currency::usd()).await;
    h.service
        .release_escrow(
            &escrow.escrow_id,
            ReleaseOptions {
                released_by: Some(UserId::from("alice")),
                release_amount: Some(dec!(25)),
                note: Some("milestone 1".to_string()),
                metadata: Some(serde_json::json!({"milestone": 1})),
                idempotency_key: Some("m1".to_string()),
            },
        )
        .await
        .unwrap();

    let timeline = h.service.get_escrow_timeline(&escrow.escrow_id).await.unwrap();
    let statuses: Vec<_> = timeline.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            EscrowStatus::Pending,
            EscrowStatus::Funded,
            EscrowStatus::PartiallyReleased
        ]
    );
    assert_eq!(
        timeline.iter().map(|e| e.sequence_no).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let last = &timeline[2];
    assert_eq!(last.note.as_deref(), Some("milestone 1"));
    assert_eq!(last.metadata["operation"], "release");
    assert_eq!(last.metadata["actor"], "alice");
    assert_eq!(last.metadata["idempotencyKey"], "m1");
    assert_eq!(last.metadata["context"]["milestone"], 1);
    assert!(timeline.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn test_unknown_escrow() {
    let h = harness();
    let missing = EscrowId::new();

    assert!(matches!(
        h.service.get_escrow_transaction(&missing).await,
        Err(EscrowError::NotFound { .. })
    ));
    assert!(matches!(
        h.service.fund_escrow(&missing, FundOptions::default()).await,
        Err(EscrowError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_create_validation_happens_before_processor_call() {
    let h = harness();
    let mut request = create_request(Decimal::ZERO, Currency::usd());
    request.expiry_days = Some(3);

    let err = h.service.create_escrow_transaction(request).await.unwrap_err();
    assert!(matches!(err, EscrowError::Validation { .. }));
    assert_eq!(h.sandbox.executions(SandboxOperation::CreatePayment), 0);

    let mut request = create_request(dec!(10), Currency::usd());
    request.processor_name = Some("stripe".to_string());
    assert!(matches!(
        h.service.create_escrow_transaction(request).await,
        Err(EscrowError::Validation { .. })
    ));
}

#[tokio::test]
async fn test_expiry_defaults_to_configured_days() {
    let h = harness();
    let escrow_id = created(&h.service, dec!(10), Currency::usd()).await;
    let escrow = h.service.get_escrow_transaction(&escrow_id).await.unwrap();

    let days = (escrow.expiry_date - escrow.created_at).num_days();
    assert!((29..=30).contains(&days), "{days}");
}

#[tokio::test]
async fn test_user_escrows() {
    let h = harness();
    let first = funded(&h.service, dec!(10), Currency::usd()).await;
    created(&h.service, dec!(20), Currency::usd()).await;

    let all = h
        .service
        .get_user_escrow_transactions(&UserId::from("bob"), &UserEscrowFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let funded_only = h
        .service
        .get_user_escrow_transactions(
            &UserId::from("alice"),
            &UserEscrowFilter {
                status: Some(EscrowStatus::Funded),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(funded_only.len(), 1);
    assert_eq!(funded_only[0].escrow_id, first.escrow_id);

    let stranger = h
        .service
        .get_user_escrow_transactions(&UserId::from("mallory"), &UserEscrowFilter::default())
        .await
        .unwrap();
    assert!(stranger.is_empty());
}
