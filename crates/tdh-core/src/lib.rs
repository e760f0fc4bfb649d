//! Core domain model for the Torn data harvester.

use chrono::{DateTime, LocalResult, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tdh-core";

/// Starting timestamp used when the caller supplies no start date; predates
/// the oldest attack log the API still serves.
pub const FALLBACK_START_TIMESTAMP: i64 = 1_675_467_539;

/// Formats an epoch-seconds timestamp as the human-readable UTC form used in
/// run summaries, e.g. `February 03, 2023 @ 11:38:59 PM`.
pub fn format_timestamp(epoch_seconds: i64) -> String {
    match Utc.timestamp_opt(epoch_seconds, 0) {
        LocalResult::Single(dt) => dt.format("%B %d, %Y @ %I:%M:%S %p").to_string(),
        _ => "Not Available".to_string(),
    }
}

/// One combat event as returned by the faction attacks selection.
///
/// Only the three natural-key fields are interpreted; everything else the API
/// sends rides along unmodified in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackRecord {
    pub timestamp_started: i64,
    pub attacker_id: i64,
    pub defender_id: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AttackRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            timestamp_started: self.timestamp_started,
            attacker_id: self.attacker_id,
            defender_id: self.defender_id,
        }
    }
}

/// The minimal attribute combination that uniquely identifies one attack,
/// independent of any storage-assigned identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub timestamp_started: i64,
    pub attacker_id: i64,
    pub defender_id: i64,
}

impl NaturalKey {
    /// Deterministic storage identity. The components are integers, so the
    /// underscore delimiter cannot collide.
    pub fn derived_id(&self) -> String {
        format!(
            "{}_{}_{}",
            self.timestamp_started, self.attacker_id, self.defender_id
        )
    }
}

/// Process-local pagination progress. Never persisted; a re-run restarts from
/// the caller-supplied start (or the fallback constant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionCursor {
    /// Inclusive lower bound for the next page request.
    pub next_fetch_timestamp: i64,
    /// Upper bound discovered by the exploratory fetch, fixed for the run.
    pub newest_known_timestamp: i64,
}

impl IngestionCursor {
    pub fn new(start: i64, newest_known: i64) -> Self {
        Self {
            next_fetch_timestamp: start,
            newest_known_timestamp: newest_known,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.next_fetch_timestamp > self.newest_known_timestamp
    }

    /// Advances the cursor past `page_max_timestamp`. Returns `false` when the
    /// page would not move the cursor forward, which callers must treat as a
    /// stall rather than looping.
    pub fn advance_past(&mut self, page_max_timestamp: i64) -> bool {
        if page_max_timestamp < self.next_fetch_timestamp {
            return false;
        }
        self.next_fetch_timestamp = page_max_timestamp + 1;
        true
    }
}

/// One point-in-time status observation. Append-only; never deduplicated or
/// updated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStatusSnapshot {
    pub snapshot_id: Uuid,
    pub player_id: i64,
    pub status: Value,
    pub timestamp: DateTime<Utc>,
}

/// Latest-known-state projection, at most one per `player_id`. Fully
/// overwritten on every new snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfileSummary {
    pub player_id: i64,
    pub latest_status: Uuid,
    pub latest_name: String,
    pub latest_level: i64,
    pub last_status_update: String,
    pub status_inventory: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_codec_renders_utc() {
        assert_eq!(format_timestamp(0), "January 01, 1970 @ 12:00:00 AM");
    }

    #[test]
    fn derived_id_joins_the_triple() {
        let key = NaturalKey {
            timestamp_started: 150,
            attacker_id: 7,
            defender_id: 9,
        };
        assert_eq!(key.derived_id(), "150_7_9");
    }

    #[test]
    fn cursor_advances_monotonically_and_exhausts() {
        let mut cursor = IngestionCursor::new(100, 200);
        assert!(!cursor.exhausted());
        assert!(cursor.advance_past(150));
        assert_eq!(cursor.next_fetch_timestamp, 151);
        assert!(cursor.advance_past(200));
        assert_eq!(cursor.next_fetch_timestamp, 201);
        assert!(cursor.exhausted());
    }

    #[test]
    fn cursor_refuses_to_move_backwards() {
        let mut cursor = IngestionCursor::new(100, 200);
        assert!(!cursor.advance_past(99));
        assert_eq!(cursor.next_fetch_timestamp, 100);
    }
}
