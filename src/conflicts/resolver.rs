//! Conflict resolution strategies. Everything here is pure: given two
//! versions and a strategy, decide a winner or escalate.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::config::ConflictPolicyConfig;
use crate::models::enums::{ConflictSide, ConflictStrategy};

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    pub data: JsonValue,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Winner {
    Local,
    Remote,
    Merged,
}

impl From<ConflictSide> for Winner {
    fn from(side: ConflictSide) -> Self {
        match side {
            ConflictSide::Local => Winner::Local,
            ConflictSide::Remote => Winner::Remote,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved { winner: Winner, record: JsonValue },
    Escalated { reason: String },
}

impl Resolution {
    fn side(side: ConflictSide, local: &VersionedRecord, remote: &VersionedRecord) -> Self {
        let record = match side {
            ConflictSide::Local => local.data.clone(),
            ConflictSide::Remote => remote.data.clone(),
        };
        Resolution::Resolved {
            winner: side.into(),
            record,
        }
    }
}

/// Which strategy applies to a resource type on a connection.
#[derive(Debug, Clone)]
pub struct ConflictPolicy {
    config: ConflictPolicyConfig,
}

impl ConflictPolicy {
    pub fn new(config: ConflictPolicyConfig) -> Self {
        Self { config }
    }

    /// Manual-review types, then per-type overrides, then the connection's
    /// strategy, then the default.
    pub fn strategy_for(
        &self,
        resource_type: &str,
        connection_strategy: Option<ConflictStrategy>,
    ) -> ConflictStrategy {
        if self
            .config
            .manual_review_resource_types
            .iter()
            .any(|manual| manual.eq_ignore_ascii_case(resource_type))
        {
            return ConflictStrategy::ManualReview;
        }
        if let Some(strategy) = self
            .config
            .resource_strategies
            .iter()
            .find(|(configured, _)| configured.eq_ignore_ascii_case(resource_type))
            .map(|(_, strategy)| *strategy)
        {
            return strategy;
        }
        connection_strategy.unwrap_or(self.config.default_strategy)
    }

    pub fn source_priority(&self) -> ConflictSide {
        self.config.source_priority
    }
}

/// Newer side by timestamp, `None` when either is missing or they are equal.
fn newer_side(local: &VersionedRecord, remote: &VersionedRecord) -> Option<ConflictSide> {
    match (local.modified_at, remote.modified_at) {
        (Some(local_at), Some(remote_at)) if local_at > remote_at => Some(ConflictSide::Local),
        (Some(local_at), Some(remote_at)) if remote_at > local_at => Some(ConflictSide::Remote),
        _ => None,
    }
}

pub fn resolve(
    strategy: ConflictStrategy,
    source_priority: ConflictSide,
    local: &VersionedRecord,
    remote: &VersionedRecord,
) -> Resolution {
    match strategy {
        ConflictStrategy::LastWriteWins => {
            let side = newer_side(local, remote).unwrap_or(source_priority);
            Resolution::side(side, local, remote)
        }
        ConflictStrategy::SourcePriority => Resolution::side(source_priority, local, remote),
        ConflictStrategy::FieldLevelMerge => field_level_merge(source_priority, local, remote),
        ConflictStrategy::ManualReview => Resolution::Escalated {
            reason: "resource type requires manual review".to_string(),
        },
    }
}

fn field_level_merge(
    source_priority: ConflictSide,
    local: &VersionedRecord,
    remote: &VersionedRecord,
) -> Resolution {
    let (Some(local_fields), Some(remote_fields)) =
        (local.data.as_object(), remote.data.as_object())
    else {
        // Nothing to merge field by field.
        return resolve(ConflictStrategy::LastWriteWins, source_priority, local, remote);
    };

    let keys: BTreeSet<&String> = local_fields.keys().chain(remote_fields.keys()).collect();
    let mut merged = Map::new();
    let mut overlapping = Vec::new();

    for key in keys {
        let value = match (local_fields.get(key), remote_fields.get(key)) {
            (Some(local_value), Some(remote_value)) if local_value == remote_value => {
                local_value.clone()
            }
            (Some(local_value), Some(remote_value)) => {
                overlapping.push(key.clone());
                match newer_side(local, remote) {
                    Some(ConflictSide::Local) => local_value.clone(),
                    Some(ConflictSide::Remote) => remote_value.clone(),
                    None => continue,
                }
            }
            (Some(only), None) | (None, Some(only)) => only.clone(),
            (None, None) => continue,
        };
        merged.insert(key.clone(), value);
    }

    if !overlapping.is_empty() && newer_side(local, remote).is_none() {
        return Resolution::Escalated {
            reason: format!(
                "fields {} changed on both sides and modification times cannot order them",
                overlapping.join(", ")
            ),
        };
    }

    Resolution::Resolved {
        winner: Winner::Merged,
        record: JsonValue::Object(merged),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn at(hour: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap())
    }

    fn version(data: JsonValue, modified_at: Option<DateTime<Utc>>) -> VersionedRecord {
        VersionedRecord { data, modified_at }
    }

    #[test]
    fn last_write_wins_prefers_newer_side() {
        let local = version(json!({"value": 1}), at(10));
        let remote = version(json!({"value": 2}), at(9));

        assert_eq!(
            resolve(ConflictStrategy::LastWriteWins, ConflictSide::Remote, &local, &remote),
            Resolution::Resolved {
                winner: Winner::Local,
                record: json!({"value": 1})
            }
        );
    }

    #[test]
    fn last_write_wins_tie_falls_to_source_priority() {
        let local = version(json!({"value": 1}), at(10));
        let remote = version(json!({"value": 2}), at(10));

        let resolution =
            resolve(ConflictStrategy::LastWriteWins, ConflictSide::Remote, &local, &remote);
        assert!(matches!(
            resolution,
            Resolution::Resolved {
                winner: Winner::Remote,
                ..
            }
        ));

        let missing = version(json!({"value": 1}), None);
        let resolution =
            resolve(ConflictStrategy::LastWriteWins, ConflictSide::Local, &missing, &remote);
        assert!(matches!(
            resolution,
            Resolution::Resolved {
                winner: Winner::Local,
                ..
            }
        ));
    }

    #[test]
    fn source_priority_ignores_timestamps() {
        let local = version(json!({"value": 1}), at(23));
        let remote = version(json!({"value": 2}), at(1));
        assert!(matches!(
            resolve(ConflictStrategy::SourcePriority, ConflictSide::Remote, &local, &remote),
            Resolution::Resolved {
                winner: Winner::Remote,
                ..
            }
        ));
    }

    #[test]
    fn field_merge_combines_disjoint_changes() {
        let local = version(json!({"id": "p1", "phone": "555-0100"}), at(8));
        let remote = version(json!({"id": "p1", "email": "a@example.org"}), at(9));

        assert_eq!(
            resolve(ConflictStrategy::FieldLevelMerge, ConflictSide::Remote, &local, &remote),
            Resolution::Resolved {
                winner: Winner::Merged,
                record: json!({"id": "p1", "phone": "555-0100", "email": "a@example.org"})
            }
        );
    }

    #[test]
    fn field_merge_overlap_uses_last_write() {
        let local = version(json!({"id": "p1", "status": "active", "phone": "1"}), at(12));
        let remote = version(json!({"id": "p1", "status": "inactive", "email": "e"}), at(9));

        let Resolution::Resolved { record, .. } =
            resolve(ConflictStrategy::FieldLevelMerge, ConflictSide::Remote, &local, &remote)
        else {
            panic!("expected resolution");
        };
        assert_eq!(record["status"], "active");
        assert_eq!(record["phone"], "1");
        assert_eq!(record["email"], "e");
    }

    #[test]
    fn field_merge_escalates_unorderable_overlap() {
        let local = version(json!({"status": "active"}), None);
        let remote = version(json!({"status": "inactive"}), at(9));

        assert!(matches!(
            resolve(ConflictStrategy::FieldLevelMerge, ConflictSide::Remote, &local, &remote),
            Resolution::Escalated { .. }
        ));
    }

    #[test]
    fn manual_review_always_escalates() {
        let local = version(json!({"a": 1}), at(1));
        let remote = version(json!({"a": 2}), at(2));
        assert!(matches!(
            resolve(ConflictStrategy::ManualReview, ConflictSide::Remote, &local, &remote),
            Resolution::Escalated { .. }
        ));
    }

    #[test]
    fn policy_lookup_order() {
        let policy = ConflictPolicy::new(ConflictPolicyConfig {
            default_strategy: ConflictStrategy::LastWriteWins,
            source_priority: ConflictSide::Remote,
            resource_strategies: BTreeMap::from([(
                "Observation".to_string(),
                ConflictStrategy::FieldLevelMerge,
            )]),
            manual_review_resource_types: vec!["MedicationRequest".to_string()],
        });

        assert_eq!(
            policy.strategy_for("MedicationRequest", Some(ConflictStrategy::SourcePriority)),
            ConflictStrategy::ManualReview
        );
        assert_eq!(
            policy.strategy_for("Observation", Some(ConflictStrategy::SourcePriority)),
            ConflictStrategy::FieldLevelMerge
        );
        assert_eq!(
            policy.strategy_for("Patient", Some(ConflictStrategy::SourcePriority)),
            ConflictStrategy::SourcePriority
        );
        assert_eq!(
            policy.strategy_for("Patient", None),
            ConflictStrategy::LastWriteWins
        );
    }
}
