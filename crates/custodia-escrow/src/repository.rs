//! Escrow persistence port
//!
//! Every mutation goes through [`EscrowRepository::commit`], a conditional
//! write on the version the caller loaded. A commit either lands the whole
//! mutation together with its timeline entry, or nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use custodia_types::{
    EscrowDispute, EscrowError, EscrowId, EscrowStatus, EscrowTransaction, ProcessorRefs, Result,
    UserId,
};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::timeline::PendingEntry;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

/// Everything a transition changes on the record
#[derive(Debug, Clone, PartialEq)]
pub struct EscrowMutation {
    pub status: EscrowStatus,
    pub released_amount: Decimal,
    /// Merged over the stored refs
    pub processor_refs: ProcessorRefs,
    /// Replaces the stored dispute when present
    pub dispute: Option<EscrowDispute>,
    pub entry: PendingEntry,
}

impl EscrowMutation {
    /// Apply onto a record at `expected_version`, producing the next version
    pub fn apply_to(self, escrow: &mut EscrowTransaction, now: DateTime<Utc>) {
        let next_version = escrow.version + 1;

        escrow.status = self.status;
        escrow.released_amount = self.released_amount;
        escrow.processor_refs.merge(&self.processor_refs);
        if let Some(dispute) = self.dispute {
            escrow.dispute = Some(dispute);
        }
        escrow.timeline.push(self.entry.stamp(next_version, now));
        escrow.updated_at = now;
        escrow.version = next_version;
    }
}

/// Filter for a user's escrows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEscrowFilter {
    pub status: Option<EscrowStatus>,
    /// Inclusive lower bound on `createdAt`
    pub start_date: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `createdAt`
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl UserEscrowFilter {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }

    pub fn matches(&self, escrow: &EscrowTransaction) -> bool {
        self.status.map_or(true, |status| escrow.status == status)
            && self.start_date.map_or(true, |start| escrow.created_at >= start)
            && self.end_date.map_or(true, |end| escrow.created_at <= end)
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(EscrowError::validation("startDate is after endDate"));
            }
        }
        Ok(())
    }
}

/// Storage for escrow records
#[async_trait]
pub trait EscrowRepository: Send + Sync {
    /// Persist a new record at version 1 with `entry` as its first timeline entry
    async fn insert(
        &self,
        escrow: EscrowTransaction,
        entry: PendingEntry,
    ) -> Result<EscrowTransaction>;

    /// Latest committed record; its `version` is what a later commit must expect
    async fn load(&self, escrow_id: &EscrowId) -> Result<EscrowTransaction>;

    /// Apply `mutation` if the stored version still equals `expected_version`
    ///
    /// Fails with `ConcurrencyConflict` otherwise, leaving the record untouched.
    async fn commit(
        &self,
        escrow_id: &EscrowId,
        expected_version: u64,
        mutation: EscrowMutation,
    ) -> Result<EscrowTransaction>;

    /// Escrows where the user is sender or recipient, newest first
    async fn list_for_user(
        &self,
        user_id: &UserId,
        filter: &UserEscrowFilter,
    ) -> Result<Vec<EscrowTransaction>>;
}

/// Prepare a draft record for insertion
pub fn first_version(mut escrow: EscrowTransaction, entry: PendingEntry) -> EscrowTransaction {
    let now = Utc::now();
    escrow.version = 1;
    escrow.timeline = vec![entry.stamp(1, now)];
    escrow.created_at = now;
    escrow.updated_at = now;
    escrow
}

/// In-process repository
///
/// Each record sits behind its DashMap shard lock, which makes the version
/// check and the write one atomic step.
#[derive(Default)]
pub struct InMemoryEscrowRepository {
    escrows: DashMap<EscrowId, EscrowTransaction>,
}

impl InMemoryEscrowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.escrows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.escrows.is_empty()
    }
}

#[async_trait]
impl EscrowRepository for InMemoryEscrowRepository {
    async fn insert(
        &self,
        escrow: EscrowTransaction,
        entry: PendingEntry,
    ) -> Result<EscrowTransaction> {
        let escrow = first_version(escrow, entry);
        match self.escrows.entry(escrow.escrow_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EscrowError::storage(format!(
                "escrow {} already exists",
                escrow.escrow_id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(escrow.clone());
                Ok(escrow)
            }
        }
    }

    async fn load(&self, escrow_id: &EscrowId) -> Result<EscrowTransaction> {
        self.escrows
            .get(escrow_id)
            .map(|escrow| escrow.clone())
            .ok_or_else(|| EscrowError::NotFound {
                escrow_id: escrow_id.to_string(),
            })
    }

    async fn commit(
        &self,
        escrow_id: &EscrowId,
        expected_version: u64,
        mutation: EscrowMutation,
    ) -> Result<EscrowTransaction> {
        let mut escrow = self
            .escrows
            .get_mut(escrow_id)
            .ok_or_else(|| EscrowError::NotFound {
                escrow_id: escrow_id.to_string(),
            })?;

        if escrow.version != expected_version {
            return Err(EscrowError::ConcurrencyConflict {
                escrow_id: escrow_id.to_string(),
                expected_version,
            });
        }

        mutation.apply_to(&mut *escrow, Utc::now());
        Ok(escrow.clone())
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        filter: &UserEscrowFilter,
    ) -> Result<Vec<EscrowTransaction>> {
        filter.validate()?;

        let mut escrows: Vec<EscrowTransaction> = self
            .escrows
            .iter()
            .filter(|escrow| escrow.involves(user_id) && filter.matches(escrow))
            .map(|escrow| escrow.clone())
            .collect();

        escrows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        escrows.truncate(filter.effective_limit());
        Ok(escrows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use custodia_types::{Currency, EscrowOperation, EscrowTransactionId, EscrowType};
    use rust_decimal_macros::dec;

    fn draft(sender: &str, recipient: &str) -> EscrowTransaction {
        let now = Utc::now();
        EscrowTransaction {
            escrow_id: EscrowId::new(),
            escrow_transaction_id: EscrowTransactionId::new(),
            sender_id: UserId::from(sender),
            recipient_id: UserId::from(recipient),
            amount: dec!(100),
            currency: Currency::usd(),
            released_amount: Decimal::ZERO,
            status: EscrowStatus::Pending,
            escrow_type: EscrowType::Standard,
            description: "test".to_string(),
            payment_method_id: "pm_1".to_string(),
            release_conditions: None,
            processor: "sandbox".to_string(),
            processor_refs: ProcessorRefs::default(),
            dispute: None,
            timeline: Vec::new(),
            expiry_date: now + Duration::days(30),
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    fn created() -> PendingEntry {
        PendingEntry::new(EscrowOperation::Create, EscrowStatus::Pending)
    }

    fn fund() -> EscrowMutation {
        EscrowMutation {
            status: EscrowStatus::Funded,
            released_amount: Decimal::ZERO,
            processor_refs: ProcessorRefs {
                processor_transaction_id: Some("txn_1".to_string()),
                ..Default::default()
            },
            dispute: None,
            entry: PendingEntry::new(EscrowOperation::Fund, EscrowStatus::Funded),
        }
    }

    #[tokio::test]
    async fn test_insert_starts_at_version_one() {
        let repo = InMemoryEscrowRepository::new();
        let escrow = repo.insert(draft("alice", "bob"), created()).await.unwrap();

        assert_eq!(escrow.version, 1);
        assert_eq!(escrow.timeline.len(), 1);
        assert_eq!(escrow.timeline[0].sequence_no, 1);
        assert!(escrow.invariant_violations().is_empty());
    }

    #[tokio::test]
    async fn test_commit_advances_version_and_timeline() {
        let repo = InMemoryEscrowRepository::new();
        let escrow = repo.insert(draft("alice", "bob"), created()).await.unwrap();

        let funded = repo.commit(&escrow.escrow_id, 1, fund()).await.unwrap();
        assert_eq!(funded.version, 2);
        assert_eq!(funded.status, EscrowStatus::Funded);
        assert_eq!(funded.timeline[1].sequence_no, 2);
        assert_eq!(funded.processor_refs.processor_transaction_id.as_deref(), Some("txn_1"));
        assert!(funded.invariant_violations().is_empty());
    }

    #[tokio::test]
    async fn test_stale_version_conflicts_without_writing() {
        let repo = InMemoryEscrowRepository::new();
        let escrow = repo.insert(draft("alice", "bob"), created()).await.unwrap();
        repo.commit(&escrow.escrow_id, 1, fund()).await.unwrap();

        let err = repo.commit(&escrow.escrow_id, 1, fund()).await.unwrap_err();
        assert!(matches!(
            err,
            EscrowError::ConcurrencyConflict { expected_version: 1, .. }
        ));

        let stored = repo.load(&escrow.escrow_id).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.timeline.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_escrow() {
        let repo = InMemoryEscrowRepository::new();
        let id = EscrowId::new();
        assert!(matches!(repo.load(&id).await, Err(EscrowError::NotFound { .. })));
        assert!(matches!(
            repo.commit(&id, 1, fund()).await,
            Err(EscrowError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_for_user_filters_and_orders() {
        let repo = InMemoryEscrowRepository::new();
        let first = repo.insert(draft("alice", "bob"), created()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = repo.insert(draft("carol", "alice"), created()).await.unwrap();
        repo.insert(draft("carol", "dave"), created()).await.unwrap();
        repo.commit(&first.escrow_id, 1, fund()).await.unwrap();

        let all = repo
            .list_for_user(&UserId::from("alice"), &UserEscrowFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].escrow_id, second.escrow_id);

        let funded = repo
            .list_for_user(
                &UserId::from("alice"),
                &UserEscrowFilter {
                    status: Some(EscrowStatus::Funded),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(funded.len(), 1);
        assert_eq!(funded[0].escrow_id, first.escrow_id);

        let limited = repo
            .list_for_user(
                &UserId::from("alice"),
                &UserEscrowFilter {
                    limit: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_limit_is_clamped() {
        assert_eq!(UserEscrowFilter::default().effective_limit(), DEFAULT_LIST_LIMIT);
        let huge = UserEscrowFilter {
            limit: Some(10_000),
            ..Default::default()
        };
        assert_eq!(huge.effective_limit(), MAX_LIST_LIMIT);
    }

    #[test]
    fn test_inverted_date_range_rejected() {
        let now = Utc::now();
        let filter = UserEscrowFilter {
            start_date: Some(now),
            end_date: Some(now - Duration::days(1)),
            ..Default::default()
        };
        assert!(filter.validate().is_err());
    }
}
