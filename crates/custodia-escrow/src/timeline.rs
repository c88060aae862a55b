//! Audit timeline
//!
//! The timeline is append-only. The engine describes the entry it wants
//! ([`PendingEntry`]); the repository stamps it with a sequence number and
//! timestamp inside the same atomic commit that moves the version.

use chrono::{DateTime, Utc};
use custodia_types::{EscrowOperation, EscrowStatus, EscrowTransaction, TimelineEntry, UserId};
use serde_json::{json, Map, Value};

/// Metadata keys the engine writes on every entry
pub const META_OPERATION: &str = "operation";
pub const META_ACTOR: &str = "actor";
pub const META_IDEMPOTENCY_KEY: &str = "idempotencyKey";
pub const META_PROCESSOR_KEY: &str = "processorKey";
pub const META_CONTEXT: &str = "context";

/// A timeline entry before the repository has stamped it
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub status: EscrowStatus,
    pub note: Option<String>,
    pub metadata: Value,
}

impl PendingEntry {
    pub fn new(operation: EscrowOperation, status: EscrowStatus) -> Self {
        let mut metadata = Map::new();
        metadata.insert(META_OPERATION.into(), json!(operation.as_str()));
        Self {
            status,
            note: None,
            metadata: Value::Object(metadata),
        }
    }

    pub fn note(mut self, note: Option<String>) -> Self {
        self.note = note;
        self
    }

    pub fn actor(self, actor: Option<&UserId>) -> Self {
        match actor {
            Some(actor) => self.with(META_ACTOR, json!(actor.as_str())),
            None => self,
        }
    }

    /// Caller-supplied key, the one replays are matched on
    pub fn idempotency_key(self, key: Option<&str>) -> Self {
        match key {
            Some(key) => self.with(META_IDEMPOTENCY_KEY, json!(key)),
            None => self,
        }
    }

    /// Key that was actually sent to the processor
    pub fn processor_key(self, key: &str) -> Self {
        self.with(META_PROCESSOR_KEY, json!(key))
    }

    /// Free-form caller metadata, kept under its own key
    pub fn context(self, context: Option<Value>) -> Self {
        match context {
            Some(value) if !value.is_null() => self.with(META_CONTEXT, value),
            _ => self,
        }
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.metadata {
            map.insert(key.to_string(), value);
        }
        self
    }

    /// Stamp the entry for the given position
    pub fn stamp(self, sequence_no: u64, timestamp: DateTime<Utc>) -> TimelineEntry {
        TimelineEntry {
            status: self.status,
            timestamp,
            sequence_no,
            note: self.note,
            metadata: self.metadata,
        }
    }
}

/// Entry committed earlier for the same operation and caller key, if any
pub fn find_replay<'a>(
    escrow: &'a EscrowTransaction,
    operation: EscrowOperation,
    idempotency_key: &str,
) -> Option<&'a TimelineEntry> {
    escrow.timeline.iter().find(|entry| {
        entry.metadata.get(META_OPERATION).and_then(Value::as_str) == Some(operation.as_str())
            && entry.metadata.get(META_IDEMPOTENCY_KEY).and_then(Value::as_str)
                == Some(idempotency_key)
    })
}

/// Timeline ordered by sequence number
pub fn ordered(escrow: &EscrowTransaction) -> Vec<TimelineEntry> {
    let mut entries = escrow.timeline.clone();
    entries.sort_by_key(|entry| entry.sequence_no);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_entry_metadata() {
        let entry = PendingEntry::new(EscrowOperation::Release, EscrowStatus::PartiallyReleased)
            .actor(Some(&UserId::from("alice")))
            .idempotency_key(Some("rel-1"))
            .processor_key("etx:release:rel-1")
            .context(Some(json!({"milestone": 2})))
            .stamp(3, Utc::now());

        assert_eq!(entry.sequence_no, 3);
        assert_eq!(entry.metadata[META_OPERATION], "release");
        assert_eq!(entry.metadata[META_ACTOR], "alice");
        assert_eq!(entry.metadata[META_IDEMPOTENCY_KEY], "rel-1");
        assert_eq!(entry.metadata[META_CONTEXT]["milestone"], 2);
    }

    #[test]
    fn test_absent_fields_are_not_written() {
        let entry = PendingEntry::new(EscrowOperation::Fund, EscrowStatus::Funded)
            .actor(None)
            .idempotency_key(None)
            .context(Some(Value::Null));

        let map = entry.metadata.as_object().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(META_OPERATION));
    }
}
