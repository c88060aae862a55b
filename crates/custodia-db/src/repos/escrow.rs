//! Escrow repository

use async_trait::async_trait;
use chrono::Utc;
use custodia_escrow::repository::first_version;
use custodia_escrow::{EscrowMutation, EscrowRepository, PendingEntry, UserEscrowFilter};
use custodia_types::{EscrowId, EscrowTransaction, Result, TimelineEntry, UserId};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::debug;

use crate::{format_timestamp, DbError, DbEscrow, DbResult, DbTimelineEntry};

/// Escrow records in SQLite
#[derive(Clone)]
pub struct SqliteEscrowRepository {
    pool: SqlitePool,
}

impl SqliteEscrowRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Serialized record without its timeline, which lives in its own table
    fn document(escrow: &EscrowTransaction) -> DbResult<String> {
        let mut value = serde_json::to_value(escrow)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("timeline");
        }
        Ok(serde_json::to_string(&value)?)
    }

    async fn insert_entry(
        tx: &mut Transaction<'_, Sqlite>,
        escrow_id: &EscrowId,
        entry: &TimelineEntry,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO escrow_timeline (escrow_id, sequence_no, status, timestamp, note, metadata)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(escrow_id.to_string())
        .bind(entry.sequence_no as i64)
        .bind(entry.status.as_str())
        .bind(format_timestamp(&entry.timestamp))
        .bind(entry.note.as_deref())
        .bind(serde_json::to_string(&entry.metadata)?)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn fetch_row(
        conn: &mut SqliteConnection,
        escrow_id: &EscrowId,
    ) -> DbResult<DbEscrow> {
        sqlx::query_as::<_, DbEscrow>(
            "SELECT escrow_id, document, version FROM escrow_transactions WHERE escrow_id = ?",
        )
        .bind(escrow_id.to_string())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DbError::NotFound(escrow_id.to_string()))
    }

    /// Rebuild the full record from its row and timeline
    async fn hydrate(conn: &mut SqliteConnection, row: DbEscrow) -> DbResult<EscrowTransaction> {
        let mut escrow: EscrowTransaction = serde_json::from_str(&row.document)?;
        escrow.version = u64::try_from(row.version)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        let entries = sqlx::query_as::<_, DbTimelineEntry>(
            r#"
            SELECT sequence_no, status, timestamp, note, metadata
            FROM escrow_timeline
            WHERE escrow_id = ?
            ORDER BY sequence_no ASC
            "#,
        )
        .bind(&row.escrow_id)
        .fetch_all(&mut *conn)
        .await?;

        escrow.timeline = entries
            .into_iter()
            .map(DbTimelineEntry::into_entry)
            .collect::<DbResult<Vec<_>>>()?;
        Ok(escrow)
    }

    async fn insert_record(
        &self,
        escrow: EscrowTransaction,
        entry: PendingEntry,
    ) -> DbResult<EscrowTransaction> {
        let escrow = first_version(escrow, entry);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO escrow_transactions
                (escrow_id, escrow_transaction_id, sender_id, recipient_id, status,
                 processor, document, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(escrow.escrow_id.to_string())
        .bind(escrow.escrow_transaction_id.to_string())
        .bind(escrow.sender_id.as_str())
        .bind(escrow.recipient_id.as_str())
        .bind(escrow.status.as_str())
        .bind(&escrow.processor)
        .bind(Self::document(&escrow)?)
        .bind(escrow.version as i64)
        .bind(format_timestamp(&escrow.created_at))
        .bind(format_timestamp(&escrow.updated_at))
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(db_err)) = &inserted {
            if db_err.is_unique_violation() {
                return Err(DbError::Duplicate(escrow.escrow_id.to_string()));
            }
        }
        inserted?;

        for entry in &escrow.timeline {
            Self::insert_entry(&mut tx, &escrow.escrow_id, entry).await?;
        }

        tx.commit().await?;
        Ok(escrow)
    }

    async fn commit_mutation(
        &self,
        escrow_id: &EscrowId,
        expected_version: u64,
        mutation: EscrowMutation,
    ) -> DbResult<EscrowTransaction> {
        // A writer that held the database lock first has most likely moved
        // the version on.
        self.try_commit(escrow_id, expected_version, mutation)
            .await
            .map_err(|e| match e {
                DbError::Query(ref err) if is_busy(err) => DbError::Conflict {
                    escrow_id: escrow_id.to_string(),
                    expected_version,
                },
                other => other,
            })
    }

    async fn try_commit(
        &self,
        escrow_id: &EscrowId,
        expected_version: u64,
        mutation: EscrowMutation,
    ) -> DbResult<EscrowTransaction> {
        let conflict = || DbError::Conflict {
            escrow_id: escrow_id.to_string(),
            expected_version,
        };

        let mut tx = self.pool.begin().await?;

        // The stored document is only the base for the next one. Whether it
        // may be written is decided by the version predicate below alone: a
        // stale base leaves zero rows to update.
        let row = Self::fetch_row(&mut tx, escrow_id).await?;
        let mut escrow = Self::hydrate(&mut tx, row).await?;
        mutation.apply_to(&mut escrow, Utc::now());

        let updated = sqlx::query(
            r#"
            UPDATE escrow_transactions
            SET status = ?, document = ?, version = ?, updated_at = ?
            WHERE escrow_id = ? AND version = ?
            "#,
        )
        .bind(escrow.status.as_str())
        .bind(Self::document(&escrow)?)
        .bind(escrow.version as i64)
        .bind(format_timestamp(&escrow.updated_at))
        .bind(escrow_id.to_string())
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(conflict());
        }

        if let Some(entry) = escrow.timeline.last() {
            Self::insert_entry(&mut tx, escrow_id, entry).await?;
        }

        tx.commit().await?;

        debug!(escrow_id = %escrow_id, version = escrow.version, "Escrow commit applied");
        Ok(escrow)
    }

    async fn load_record(&self, escrow_id: &EscrowId) -> DbResult<EscrowTransaction> {
        let mut conn = self.pool.acquire().await?;
        let row = Self::fetch_row(&mut conn, escrow_id).await?;
        Self::hydrate(&mut conn, row).await
    }

    async fn list_records(
        &self,
        user_id: &UserId,
        filter: &UserEscrowFilter,
    ) -> DbResult<Vec<EscrowTransaction>> {
        let status = filter.status.map(|s| s.as_str());
        let start = filter.start_date.as_ref().map(format_timestamp);
        let end = filter.end_date.as_ref().map(format_timestamp);

        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query_as::<_, DbEscrow>(
            r#"
            SELECT escrow_id, document, version
            FROM escrow_transactions
            WHERE (sender_id = ? OR recipient_id = ?)
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR created_at >= ?)
              AND (? IS NULL OR created_at <= ?)
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id.as_str())
        .bind(user_id.as_str())
        .bind(status)
        .bind(status)
        .bind(start.as_deref())
        .bind(start.as_deref())
        .bind(end.as_deref())
        .bind(end.as_deref())
        .bind(filter.effective_limit() as i64)
        .fetch_all(&mut *conn)
        .await?;

        let mut escrows = Vec::with_capacity(rows.len());
        for row in rows {
            escrows.push(Self::hydrate(&mut conn, row).await?);
        }
        Ok(escrows)
    }
}

/// SQLITE_BUSY and its extended codes
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map_or(false, |code| code & 0xff == 5),
        _ => false,
    }
}

#[async_trait]
impl EscrowRepository for SqliteEscrowRepository {
    async fn insert(
        &self,
        escrow: EscrowTransaction,
        entry: PendingEntry,
    ) -> Result<EscrowTransaction> {
        Ok(self.insert_record(escrow, entry).await?)
    }

    async fn load(&self, escrow_id: &EscrowId) -> Result<EscrowTransaction> {
        Ok(self.load_record(escrow_id).await?)
    }

    async fn commit(
        &self,
        escrow_id: &EscrowId,
        expected_version: u64,
        mutation: EscrowMutation,
    ) -> Result<EscrowTransaction> {
        Ok(self
            .commit_mutation(escrow_id, expected_version, mutation)
            .await?)
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        filter: &UserEscrowFilter,
    ) -> Result<Vec<EscrowTransaction>> {
        filter.validate()?;
        Ok(self.list_records(user_id, filter).await?)
    }
}
