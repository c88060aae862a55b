use std::sync::Arc;
use std::time::Duration;

use custodia_db::{Database, DatabaseConfig};
use custodia_escrow::{
    CreateEscrowRequest, EscrowConfig, EscrowMutation, EscrowRepository, EscrowService,
    FundOptions, OpenDisputeOptions, PendingEntry, ReleaseOptions, ResolveDisputeOptions,
    UserEscrowFilter,
};
use custodia_gateway::{ProcessorRegistry, SandboxProcessor};
use custodia_types::{
    Currency, DisputeStatus, EscrowError, EscrowId, EscrowOperation, EscrowStatus, EscrowType,
    ProcessorRefs, UserId,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

async fn service_on(db: &Database, sandbox: Arc<SandboxProcessor>) -> EscrowService {
    let mut registry = ProcessorRegistry::new();
    registry.register(sandbox).unwrap();
    EscrowService::new(
        Arc::new(db.escrow_repo()),
        registry,
        EscrowConfig::default(),
    )
}

fn request(amount: Decimal) -> CreateEscrowRequest {
    CreateEscrowRequest {
        sender_id: UserId::from("alice"),
        recipient_id: UserId::from("bob"),
        amount,
        currency: Currency::usd(),
        description: "translation work".to_string(),
        processor_name: None,
        payment_method_id: "pm_card_visa".to_string(),
        release_conditions: Some(serde_json::json!({"deliverable": "final.pdf"})),
        expiry_days: Some(14),
        escrow_type: EscrowType::Milestone,
        metadata: serde_json::json!({"orderId": "ord_42"}),
    }
}

async fn memory_db() -> Database {
    Database::open(&DatabaseConfig::in_memory()).await.unwrap()
}

#[tokio::test]
async fn test_full_lifecycle_persists() {
    let db = memory_db().await;
    let service = service_on(&db, SandboxProcessor::new("sandbox").shared()).await;

    let created = service.create_escrow_transaction(request(dec!(150))).await.unwrap();
    let id = created.escrow_id;
    service.fund_escrow(&id, FundOptions::default()).await.unwrap();
    service
        .release_escrow(
            &id,
            ReleaseOptions {
                release_amount: Some(dec!(50)),
                note: Some("first milestone".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let stored = db.escrow_repo().load(&id).await.unwrap();
    assert_eq!(stored.status, EscrowStatus::PartiallyReleased);
    assert_eq!(stored.released_amount, dec!(50));
    assert_eq!(stored.version, 3);
    assert_eq!(stored.escrow_type, EscrowType::Milestone);
    assert_eq!(stored.metadata["orderId"], "ord_42");
    assert!(stored.processor_refs.processor_escrow_id.is_some());
    assert!(stored.processor_refs.processor_transfer_id.is_some());
    assert_eq!(stored.timeline[2].note.as_deref(), Some("first milestone"));
    assert!(stored.invariant_violations().is_empty());
}

#[tokio::test]
async fn test_dispute_split_persists_dispute_record() {
    let db = memory_db().await;
    let service = service_on(&db, SandboxProcessor::new("sandbox").shared()).await;

    let id = service
        .create_escrow_transaction(request(dec!(100)))
        .await
        .unwrap()
        .escrow_id;
    service.fund_escrow(&id, FundOptions::default()).await.unwrap();
    service
        .open_dispute(&id, OpenDisputeOptions::new("bob", "partial delivery"))
        .await
        .unwrap();
    service
        .resolve_dispute(&id, ResolveDisputeOptions::split(dec!(0.25)))
        .await
        .unwrap();

    let stored = service.get_escrow_transaction(&id).await.unwrap();
    assert_eq!(stored.status, EscrowStatus::Split);
    assert_eq!(stored.released_amount, dec!(25));
    let dispute = stored.dispute.unwrap();
    assert_eq!(dispute.status, DisputeStatus::Resolved);
    assert_eq!(dispute.split_ratio, Some(dec!(0.25)));
}

#[tokio::test]
async fn test_stale_commit_is_conflict() {
    let db = memory_db().await;
    let service = service_on(&db, SandboxProcessor::new("sandbox").shared()).await;
    let id = service
        .create_escrow_transaction(request(dec!(100)))
        .await
        .unwrap()
        .escrow_id;
    service.fund_escrow(&id, FundOptions::default()).await.unwrap();

    let repo = db.escrow_repo();
    let stale = EscrowMutation {
        status: EscrowStatus::Funded,
        released_amount: Decimal::ZERO,
        processor_refs: ProcessorRefs::default(),
        dispute: None,
        entry: PendingEntry::new(EscrowOperation::Fund, EscrowStatus::Funded),
    };
    let err = repo.commit(&id, 1, stale).await.unwrap_err();
    assert!(matches!(
        err,
        EscrowError::ConcurrencyConflict { expected_version: 1, .. }
    ));

    let stored = repo.load(&id).await.unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.timeline.len(), 2);
}

#[tokio::test]
async fn test_commit_ahead_of_stored_version_is_conflict() {
    let db = memory_db().await;
    let service = service_on(&db, SandboxProcessor::new("sandbox").shared()).await;
    let id = service
        .create_escrow_transaction(request(dec!(100)))
        .await
        .unwrap()
        .escrow_id;

    let repo = db.escrow_repo();
    let ahead = EscrowMutation {
        status: EscrowStatus::Funded,
        released_amount: Decimal::ZERO,
        processor_refs: ProcessorRefs::default(),
        dispute: None,
        entry: PendingEntry::new(EscrowOperation::Fund, EscrowStatus::Funded),
    };
    let err = repo.commit(&id, 5, ahead).await.unwrap_err();
    assert!(matches!(
        err,
        EscrowError::ConcurrencyConflict { expected_version: 5, .. }
    ));

    let stored = repo.load(&id).await.unwrap();
    assert_eq!((stored.status, stored.version), (EscrowStatus::Pending, 1));
    assert_eq!(stored.timeline.len(), 1);
}

#[tokio::test]
async fn test_concurrent_releases_commit_once() {
    let db = memory_db().await;
    let sandbox = SandboxProcessor::new("sandbox")
        .with_latency(Duration::from_millis(40))
        .shared();
    let service = service_on(&db, sandbox.clone()).await;
    let id = service
        .create_escrow_transaction(request(dec!(100)))
        .await
        .unwrap()
        .escrow_id;
    service.fund_escrow(&id, FundOptions::default()).await.unwrap();

    let release = || ReleaseOptions {
        release_amount: Some(dec!(60)),
        ..Default::default()
    };
    let (a, b) = tokio::join!(
        service.release_escrow(&id, release()),
        service.release_escrow(&id, release()),
    );
    assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);

    let stored = service.get_escrow_transaction(&id).await.unwrap();
    assert_eq!(stored.released_amount, dec!(60));
    assert_eq!(stored.version, 3);
}

#[tokio::test]
async fn test_missing_escrow_is_not_found() {
    let db = memory_db().await;
    let err = db.escrow_repo().load(&EscrowId::new()).await.unwrap_err();
    assert!(matches!(err, EscrowError::NotFound { .. }));
}

#[tokio::test]
async fn test_list_for_user() {
    let db = memory_db().await;
    let service = service_on(&db, SandboxProcessor::new("sandbox").shared()).await;

    let first = service
        .create_escrow_transaction(request(dec!(10)))
        .await
        .unwrap()
        .escrow_id;
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = service
        .create_escrow_transaction(request(dec!(20)))
        .await
        .unwrap()
        .escrow_id;
    service.fund_escrow(&first, FundOptions::default()).await.unwrap();

    let repo = db.escrow_repo();
    let all = repo
        .list_for_user(&UserId::from("bob"), &UserEscrowFilter::default())
        .await
        .unwrap();
    assert_eq!(
        all.iter().map(|e| e.escrow_id).collect::<Vec<_>>(),
        vec![second, first]
    );

    let pending = repo
        .list_for_user(
            &UserId::from("alice"),
            &UserEscrowFilter {
                status: Some(EscrowStatus::Pending),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].escrow_id, second);

    let none = repo
        .list_for_user(&UserId::from("carol"), &UserEscrowFilter::default())
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let path = std::env::temp_dir().join(format!("custodia-{}.db", EscrowId::new()));
    let config = DatabaseConfig {
        url: format!("sqlite://{}", path.display()),
        ..DatabaseConfig::default()
    };

    let id = {
        let db = Database::open(&config).await.unwrap();
        let service = service_on(&db, SandboxProcessor::new("sandbox").shared()).await;
        let id = service
            .create_escrow_transaction(request(dec!(75)))
            .await
            .unwrap()
            .escrow_id;
        service.fund_escrow(&id, FundOptions::default()).await.unwrap();
        db.pool.close().await;
        id
    };

    let db = Database::open(&config).await.unwrap();
    let stored = db.escrow_repo().load(&id).await.unwrap();
    assert_eq!(stored.status, EscrowStatus::Funded);
    assert_eq!(stored.amount, dec!(75));
    db.pool.close().await;
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_timeline_rows_are_immutable() {
    let db = memory_db().await;
    let service = service_on(&db, SandboxProcessor::new("sandbox").shared()).await;
    let id = service
        .create_escrow_transaction(request(dec!(5)))
        .await
        .unwrap()
        .escrow_id;

    let tampered = sqlx::query("UPDATE escrow_timeline SET status = 'released' WHERE escrow_id = ?")
        .bind(id.to_string())
        .execute(&db.pool)
        .await;
    assert!(tampered.is_err());

    let deleted = sqlx::query("DELETE FROM escrow_timeline WHERE escrow_id = ?")
        .bind(id.to_string())
        .execute(&db.pool)
        .await;
    assert!(deleted.is_err());
}
