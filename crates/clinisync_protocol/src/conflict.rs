//! Conflict resolution strategies.

use crate::document::document_timestamp;
use crate::record::{ConflictResolution, SyncRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Engine-wide strategy applied when central reports a version conflict.
///
/// Chosen once when the engine is built; there is no per-collection
/// override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// The later `updatedAt` wins; ties go to central.
    #[default]
    LastWriteWins,
    /// Central always wins.
    CentralWins,
    /// Local always wins and is force-pushed.
    LocalWins,
    /// The record is frozen in `conflict` for an operator.
    Manual,
}

/// What the resolver must do with a conflicting record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Apply central's version locally and mark the record synced.
    ApplyCentral,
    /// Re-queue the local version for a forced push.
    RepushLocal,
    /// Leave the record in `conflict`.
    Hold,
}

impl ConflictDecision {
    /// Resolution recorded on the record for this decision.
    pub fn resolution(&self) -> ConflictResolution {
        match self {
            ConflictDecision::ApplyCentral => ConflictResolution::CentralWins,
            ConflictDecision::RepushLocal => ConflictResolution::LocalWins,
            ConflictDecision::Hold => ConflictResolution::Manual,
        }
    }
}

impl ConflictStrategy {
    /// Returns true if this strategy settles conflicts without an operator.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictStrategy::Manual)
    }

    /// Decides a conflict between a local record and central's version.
    ///
    /// Pure and deterministic: the same inputs always give the same answer.
    /// Under last-write-wins a central version without a readable
    /// `updatedAt` (including a central delete) is treated as authoritative.
    pub fn decide(&self, local: &SyncRecord, central_version: Option<&Value>) -> ConflictDecision {
        match self {
            ConflictStrategy::CentralWins => ConflictDecision::ApplyCentral,
            ConflictStrategy::LocalWins => ConflictDecision::RepushLocal,
            ConflictStrategy::Manual => ConflictDecision::Hold,
            ConflictStrategy::LastWriteWins => {
                match central_version.and_then(document_timestamp) {
                    Some(central_ts) if local.local_timestamp() > central_ts => {
                        ConflictDecision::RepushLocal
                    }
                    _ => ConflictDecision::ApplyCentral,
                }
            }
        }
    }

    /// Configuration name of the strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriteWins => "last-write-wins",
            ConflictStrategy::CentralWins => "central-wins",
            ConflictStrategy::LocalWins => "local-wins",
            ConflictStrategy::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last-write-wins" => Ok(ConflictStrategy::LastWriteWins),
            "central-wins" => Ok(ConflictStrategy::CentralWins),
            "local-wins" => Ok(ConflictStrategy::LocalWins),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(format!("unknown conflict strategy: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    fn local(updated_at: &str) -> SyncRecord {
        SyncRecord::new(
            "clinic-1",
            Operation::Update,
            "appointments",
            "a1",
            Some(json!({"updatedAt": updated_at, "slot": "09:00"})),
            Utc.timestamp_opt(0, 0).unwrap(),
        )
    }

    #[test]
    fn last_write_wins_prefers_later() {
        let strategy = ConflictStrategy::LastWriteWins;
        let central = json!({"updatedAt": "2024-05-01T12:00:00Z"});

        assert_eq!(
            strategy.decide(&local("2024-05-01T11:00:00Z"), Some(&central)),
            ConflictDecision::ApplyCentral
        );
        assert_eq!(
            strategy.decide(&local("2024-05-01T13:00:00Z"), Some(&central)),
            ConflictDecision::RepushLocal
        );
    }

    #[test]
    fn last_write_wins_tie_goes_to_central() {
        let central = json!({"updatedAt": "2024-05-01T12:00:00Z"});
        assert_eq!(
            ConflictStrategy::LastWriteWins.decide(&local("2024-05-01T12:00:00Z"), Some(&central)),
            ConflictDecision::ApplyCentral
        );
    }

    #[test]
    fn last_write_wins_central_delete() {
        assert_eq!(
            ConflictStrategy::LastWriteWins.decide(&local("2024-05-01T12:00:00Z"), None),
            ConflictDecision::ApplyCentral
        );
    }

    #[test]
    fn fixed_strategies() {
        let record = local("2024-05-01T12:00:00Z");
        assert_eq!(
            ConflictStrategy::CentralWins.decide(&record, None),
            ConflictDecision::ApplyCentral
        );
        assert_eq!(
            ConflictStrategy::LocalWins.decide(&record, None),
            ConflictDecision::RepushLocal
        );
        assert_eq!(ConflictStrategy::Manual.decide(&record, None), ConflictDecision::Hold);
        assert!(!ConflictStrategy::Manual.auto_resolves());
    }

    #[test]
    fn names_roundtrip() {
        for strategy in [
            ConflictStrategy::LastWriteWins,
            ConflictStrategy::CentralWins,
            ConflictStrategy::LocalWins,
            ConflictStrategy::Manual,
        ] {
            assert_eq!(strategy.as_str().parse::<ConflictStrategy>().unwrap(), strategy);
            let json = serde_json::to_string(&strategy).unwrap();
            assert_eq!(json, format!("\"{}\"", strategy.as_str()));
        }
        assert!("newest".parse::<ConflictStrategy>().is_err());
    }

    proptest! {
        #[test]
        fn last_write_wins_is_deterministic(local_secs in 0i64..1_000_000, central_secs in 0i64..1_000_000) {
            let ts = |s: i64| Utc.timestamp_opt(1_700_000_000 + s, 0).unwrap().to_rfc3339();
            let record = local(&ts(local_secs));
            let central = json!({"updatedAt": ts(central_secs)});

            let first = ConflictStrategy::LastWriteWins.decide(&record, Some(&central));
            let second = ConflictStrategy::LastWriteWins.decide(&record.clone(), Some(&central.clone()));
            prop_assert_eq!(first, second);

            let expected = if local_secs > central_secs {
                ConflictDecision::RepushLocal
            } else {
                ConflictDecision::ApplyCentral
            };
            prop_assert_eq!(first, expected);
        }
    }
}
