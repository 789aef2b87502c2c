//! Conflict resolution protocol.
//!
//! When the remote authority rejects a push with a version conflict, the sync
//! engine looks up the collection's [`ConflictStrategy`] and asks [`decide`]
//! what to do with that single record:
//!
//! | Strategy | Decision |
//! |---|---|
//! | `server_wins` | overwrite the local copy with the server's |
//! | `client_wins` | force-push the local copy if it is strictly newer, else `server_wins` |
//! | `manual_merge` | park both versions in the holding area for a human |
//!
//! Every resolution, whatever the strategy, is written to the audit trail
//! with a [`ConflictNote`].

use crate::{queue::QueueOperation, CollectionName, DeviceId, RecordId, SessionId, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-collection conflict policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Reference data: the authority's copy always wins
    ServerWins,
    /// Field data: the newer write wins, ties go to the server
    ClientWins,
    /// Anything else: hold for a human decision
    #[default]
    ManualMerge,
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictStrategy::ServerWins => write!(f, "server_wins"),
            ConflictStrategy::ClientWins => write!(f, "client_wins"),
            ConflictStrategy::ManualMerge => write!(f, "manual_merge"),
        }
    }
}

/// What to do with one conflicting record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Overwrite local with the server payload and mark the entry synced
    AcceptServer,
    /// Re-push the local payload with the override flag
    ForcePushLocal,
    /// Move both versions to the holding area
    Hold,
}

/// Decide how a conflict on a single record is resolved.
///
/// `client_wins` compares wall-clock `updatedAt` values. A tie, or a server
/// copy without a timestamp, goes to the server.
pub fn decide(
    strategy: ConflictStrategy,
    local_updated_at: DateTime<Utc>,
    server_updated_at: Option<DateTime<Utc>>,
) -> ConflictDecision {
    match strategy {
        ConflictStrategy::ServerWins => ConflictDecision::AcceptServer,
        ConflictStrategy::ClientWins => match server_updated_at {
            Some(server) if local_updated_at > server => ConflictDecision::ForcePushLocal,
            _ => ConflictDecision::AcceptServer,
        },
        ConflictStrategy::ManualMerge => ConflictDecision::Hold,
    }
}

/// Read `updatedAt` from a record payload.
pub fn updated_at_of(payload: &Value) -> Option<DateTime<Utc>> {
    payload
        .get("updatedAt")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// How a conflict ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    /// Settled automatically or by a human
    Resolved,
    /// Parked in the holding area
    Deferred,
    /// The resolving call itself failed; the entry will be retried
    Failed,
}

/// Which side's data survived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Local,
    Server,
    Merged,
}

/// Conflict details attached to `CONFLICT` audit entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictNote {
    /// Strategy that fired
    pub strategy: ConflictStrategy,
    /// Outcome
    pub resolution: ConflictResolution,
    /// Surviving side, when resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<Winner>,
}

/// One conflict met during a sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSummary {
    pub queue_id: String,
    pub collection: CollectionName,
    pub record_id: RecordId,
    pub strategy: ConflictStrategy,
    pub resolution: ConflictResolution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<Winner>,
    /// Holding-area entry, for `manual_merge`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<String>,
}

/// State of a held conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Unresolved,
    Resolved,
}

/// A conflict parked in the holding area for human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub device_id: DeviceId,
    pub collector_id: SessionId,
    /// Queue entry frozen by this conflict
    pub queue_id: String,
    pub object_store: CollectionName,
    pub record_id: RecordId,
    pub operation: QueueOperation,
    /// Local payload as pushed
    pub local_value: Value,
    /// Server payload from the 409 body
    pub server_value: Value,
    pub strategy: ConflictStrategy,
    pub status: ConflictStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<Winner>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    pub fn is_unresolved(&self) -> bool {
        self.status == ConflictStatus::Unresolved
    }
}

/// A human decision on a held conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualResolution {
    /// Push the local copy over the server's on the next pass
    KeepLocal,
    /// Take the server's copy
    KeepServer,
    /// Write these business fields as a new version above both sides
    Merged(Map<String, Value>),
}

impl ManualResolution {
    pub fn winner(&self) -> Winner {
        match self {
            ManualResolution::KeepLocal => Winner::Local,
            ManualResolution::KeepServer => Winner::Server,
            ManualResolution::Merged(_) => Winner::Merged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn server_wins_always_accepts_server() {
        let now = Utc::now();
        assert_eq!(
            decide(
                ConflictStrategy::ServerWins,
                now,
                Some(now - Duration::hours(1))
            ),
            ConflictDecision::AcceptServer
        );
    }

    #[test]
    fn client_wins_forces_only_when_strictly_newer() {
        let now = Utc::now();
        let earlier = now - Duration::minutes(5);

        assert_eq!(
            decide(ConflictStrategy::ClientWins, now, Some(earlier)),
            ConflictDecision::ForcePushLocal
        );
        assert_eq!(
            decide(ConflictStrategy::ClientWins, earlier, Some(now)),
            ConflictDecision::AcceptServer
        );
        assert_eq!(
            decide(ConflictStrategy::ClientWins, now, Some(now)),
            ConflictDecision::AcceptServer
        );
        assert_eq!(
            decide(ConflictStrategy::ClientWins, now, None),
            ConflictDecision::AcceptServer
        );
    }

    #[test]
    fn manual_merge_holds() {
        let now = Utc::now();
        assert_eq!(
            decide(ConflictStrategy::ManualMerge, now, Some(now)),
            ConflictDecision::Hold
        );
    }

    #[test]
    fn updated_at_parses_rfc3339() {
        let payload = json!({"updatedAt": "2024-05-01T10:00:00+02:00"});
        let parsed = updated_at_of(&payload).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-05-01T08:00:00+00:00");

        assert!(updated_at_of(&json!({"updatedAt": 12})).is_none());
        assert!(updated_at_of(&json!({})).is_none());
    }

    #[test]
    fn strategy_serializes_snake_case() {
        let json = serde_json::to_string(&ConflictStrategy::ClientWins).unwrap();
        assert_eq!(json, "\"client_wins\"");
        assert_eq!(ConflictStrategy::ManualMerge.to_string(), "manual_merge");
        assert_eq!(ConflictStrategy::default(), ConflictStrategy::ManualMerge);
    }

    #[test]
    fn note_skips_missing_winner() {
        let note = ConflictNote {
            strategy: ConflictStrategy::ManualMerge,
            resolution: ConflictResolution::Deferred,
            winner: None,
        };
        let value = serde_json::to_value(&note).unwrap();
        assert_eq!(value, json!({"strategy": "manual_merge", "resolution": "deferred"}));
    }
}
