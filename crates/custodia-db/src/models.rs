//! Database rows

use chrono::{DateTime, SecondsFormat, Utc};
use custodia_types::{EscrowStatus, TimelineEntry};
use sqlx::FromRow;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, FromRow)]
pub struct DbEscrow {
    pub escrow_id: String,
    pub document: String,
    pub version: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct DbTimelineEntry {
    pub sequence_no: i64,
    pub status: String,
    pub timestamp: String,
    pub note: Option<String>,
    pub metadata: String,
}

impl DbTimelineEntry {
    pub fn into_entry(self) -> DbResult<TimelineEntry> {
        Ok(TimelineEntry {
            status: self
                .status
                .parse::<EscrowStatus>()
                .map_err(|e| DbError::Serialization(e.to_string()))?,
            timestamp: parse_timestamp(&self.timestamp)?,
            sequence_no: u64::try_from(self.sequence_no)
                .map_err(|e| DbError::Serialization(e.to_string()))?,
            note: self.note,
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}

/// Fixed-width UTC timestamps, so text order is time order
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> DbResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| DbError::Serialization(format!("timestamp '{}': {}", raw, e)))
}
