//! # Transformation Pipeline
//!
//! Converts provider payloads into canonical records (and back) by applying
//! an ordered [`RuleSet`]. Application is a pure function of the input record
//! and the rule set; loading rule sets is the only part that touches storage.

pub mod rules;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sea_orm::DbErr;
use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;

use crate::error::SyncFailure;
use crate::models::enums::FailureKind;
use crate::repositories::TransformationRuleRepository;

pub use rules::{Condition, Rule, RuleSet, Transform, decode_rule};

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("invalid transformation rule: {0}")]
    InvalidRule(String),
    #[error("unsupported rule schema version {0}")]
    UnsupportedSchemaVersion(u64),
    #[error("required field {0} is missing")]
    MissingField(String),
    #[error("{transform} failed on field {field}: {message}")]
    TransformFailed {
        field: String,
        transform: &'static str,
        message: String,
    },
    #[error("cannot write path {0}")]
    InvalidPath(String),
    #[error("record must be a JSON object")]
    NotAnObject,
    #[error("failed to load rules: {0}")]
    Database(#[from] DbErr),
}

impl TransformError {
    /// Whether the error is about a single record rather than the rule configuration.
    pub fn is_record_scoped(&self) -> bool {
        matches!(
            self,
            TransformError::MissingField(_)
                | TransformError::TransformFailed { .. }
                | TransformError::InvalidPath(_)
                | TransformError::NotAnObject
        )
    }
}

impl From<TransformError> for SyncFailure {
    fn from(error: TransformError) -> Self {
        match error {
            TransformError::Database(db) => SyncFailure::from(db),
            other => SyncFailure::new(FailureKind::Transformation, other.to_string()),
        }
    }
}

/// Which way a record is travelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineDirection {
    /// Provider payload -> canonical record
    Inbound,
    /// Canonical record -> provider payload
    Outbound,
}

impl RuleSet {
    /// Applies every rule in order.
    ///
    /// Inbound, rules that build output (`map`, `constant`) write into a fresh
    /// document; without any of them the input passes through and `remove` /
    /// `require` act on that copy. Outbound, only `map` rules apply, inverted.
    pub fn apply(
        &self,
        input: &JsonValue,
        direction: PipelineDirection,
    ) -> Result<JsonValue, TransformError> {
        if !input.is_object() {
            return Err(TransformError::NotAnObject);
        }
        match direction {
            PipelineDirection::Inbound => self.apply_inbound(input),
            PipelineDirection::Outbound => self.apply_outbound(input),
        }
    }

    fn apply_inbound(&self, input: &JsonValue) -> Result<JsonValue, TransformError> {
        let mut output = if self.rules.iter().any(Rule::builds_output) {
            JsonValue::Object(Map::new())
        } else {
            input.clone()
        };

        for rule in &self.rules {
            if !self.condition_holds(rule, input) {
                continue;
            }
            match rule {
                Rule::Map {
                    source,
                    target,
                    transform,
                    ..
                } => {
                    let Some(value) = get_path(input, source) else {
                        continue;
                    };
                    let value = match transform {
                        Some(transform) => apply_transform(transform, value, source)?,
                        None => value.clone(),
                    };
                    set_path(&mut output, target, value)?;
                }
                Rule::Constant { target, value, .. } => {
                    set_path(&mut output, target, value.clone())?;
                }
                Rule::Remove { field } => {
                    remove_path(&mut output, field);
                }
                Rule::Require { field } => {
                    if get_path(&output, field).is_none_or(JsonValue::is_null) {
                        return Err(TransformError::MissingField(field.clone()));
                    }
                }
            }
        }

        Ok(output)
    }

    fn apply_outbound(&self, canonical: &JsonValue) -> Result<JsonValue, TransformError> {
        if !self.rules.iter().any(|rule| matches!(rule, Rule::Map { .. })) {
            return Ok(canonical.clone());
        }

        let mut output = JsonValue::Object(Map::new());
        for rule in &self.rules {
            let Rule::Map {
                source,
                target,
                transform,
                ..
            } = rule
            else {
                continue;
            };
            let Some(value) = get_path(canonical, target) else {
                continue;
            };
            let value = match transform {
                Some(Transform::ValueMap { values, .. }) => invert_value_map(values, value),
                _ => value.clone(),
            };
            set_path(&mut output, source, value)?;
        }
        Ok(output)
    }
}

fn invert_value_map(
    values: &std::collections::BTreeMap<String, JsonValue>,
    canonical: &JsonValue,
) -> JsonValue {
    values
        .iter()
        .find(|(_, mapped)| *mapped == canonical)
        .map(|(key, _)| JsonValue::String(key.clone()))
        .unwrap_or_else(|| canonical.clone())
}

fn apply_transform(
    transform: &Transform,
    value: &JsonValue,
    field: &str,
) -> Result<JsonValue, TransformError> {
    if value.is_null() {
        return Ok(JsonValue::Null);
    }

    let fail = |message: String| TransformError::TransformFailed {
        field: field.to_string(),
        transform: transform.name(),
        message,
    };

    match transform {
        Transform::Uppercase => string_value(value)
            .map(|text| JsonValue::String(text.to_uppercase()))
            .ok_or_else(|| fail("expected a string".to_string())),
        Transform::Lowercase => string_value(value)
            .map(|text| JsonValue::String(text.to_lowercase()))
            .ok_or_else(|| fail("expected a string".to_string())),
        Transform::Trim => string_value(value)
            .map(|text| JsonValue::String(text.trim().to_string()))
            .ok_or_else(|| fail("expected a string".to_string())),
        Transform::ToString => match value {
            JsonValue::String(_) => Ok(value.clone()),
            JsonValue::Number(number) => Ok(JsonValue::String(number.to_string())),
            JsonValue::Bool(flag) => Ok(JsonValue::String(flag.to_string())),
            _ => Err(fail("expected a scalar".to_string())),
        },
        Transform::ToNumber => match value {
            JsonValue::Number(_) => Ok(value.clone()),
            JsonValue::String(text) => parse_number(text.trim())
                .ok_or_else(|| fail(format!("{text:?} is not a number"))),
            _ => Err(fail("expected a number or numeric string".to_string())),
        },
        Transform::ToIso8601 => {
            let text = string_value(value).ok_or_else(|| fail("expected a string".to_string()))?;
            to_iso8601(text.trim())
                .map(JsonValue::String)
                .ok_or_else(|| fail(format!("{text:?} is not a recognised date")))
        }
        Transform::ValueMap { values, default } => {
            let key = match value {
                JsonValue::String(text) => text.clone(),
                JsonValue::Number(number) => number.to_string(),
                JsonValue::Bool(flag) => flag.to_string(),
                _ => return Err(fail("expected a scalar".to_string())),
            };
            Ok(values
                .get(&key)
                .or(default.as_ref())
                .cloned()
                .unwrap_or_else(|| value.clone()))
        }
    }
}

fn string_value(value: &JsonValue) -> Option<&str> {
    value.as_str()
}

fn parse_number(text: &str) -> Option<JsonValue> {
    if let Ok(integer) = text.parse::<i64>() {
        return Some(JsonValue::Number(integer.into()));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(JsonValue::Number)
}

/// Normalises timestamps to RFC 3339 UTC and bare dates to `YYYY-MM-DD`.
fn to_iso8601(text: &str) -> Option<String> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(text) {
        return Some(
            timestamp
                .with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
    ["%Y-%m-%d", "%Y%m%d", "%m/%d/%Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
}

/// Reads a dotted path; numeric segments index arrays.
pub fn get_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(value, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Writes a dotted path, creating intermediate objects (or arrays for numeric
/// segments) as needed.
pub fn set_path(target: &mut JsonValue, path: &str, value: JsonValue) -> Result<(), TransformError> {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(TransformError::InvalidPath(path.to_string()));
    };

    let mut current = target;
    for (position, segment) in parents.iter().enumerate() {
        let next_is_index = segments[position + 1].parse::<usize>().is_ok();
        current = child_mut(current, segment, next_is_index)
            .ok_or_else(|| TransformError::InvalidPath(path.to_string()))?;
    }

    match current {
        JsonValue::Object(map) => {
            map.insert((*last).to_string(), value);
            Ok(())
        }
        JsonValue::Array(items) => {
            let index = last
                .parse::<usize>()
                .map_err(|_| TransformError::InvalidPath(path.to_string()))?;
            match index.cmp(&items.len()) {
                std::cmp::Ordering::Less => items[index] = value,
                std::cmp::Ordering::Equal => items.push(value),
                std::cmp::Ordering::Greater => {
                    return Err(TransformError::InvalidPath(path.to_string()));
                }
            }
            Ok(())
        }
        _ => Err(TransformError::InvalidPath(path.to_string())),
    }
}

fn child_mut<'a>(
    current: &'a mut JsonValue,
    segment: &str,
    next_is_index: bool,
) -> Option<&'a mut JsonValue> {
    let empty = || {
        if next_is_index {
            JsonValue::Array(Vec::new())
        } else {
            JsonValue::Object(Map::new())
        }
    };
    match current {
        JsonValue::Object(map) => Some(map.entry(segment.to_string()).or_insert_with(empty)),
        JsonValue::Array(items) => {
            let index = segment.parse::<usize>().ok()?;
            if index == items.len() {
                items.push(empty());
            }
            items.get_mut(index)
        }
        _ => None,
    }
}

fn remove_path(target: &mut JsonValue, path: &str) {
    let (parent_path, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (Some(parent), last),
        None => (None, path),
    };
    let parent = match parent_path {
        Some(parent_path) => {
            let mut current = Some(target);
            for segment in parent_path.split('.') {
                current = current.and_then(|value| match value {
                    JsonValue::Object(map) => map.get_mut(segment),
                    JsonValue::Array(items) => {
                        segment.parse::<usize>().ok().and_then(|i| items.get_mut(i))
                    }
                    _ => None,
                });
            }
            current
        }
        None => Some(target),
    };
    match parent {
        Some(JsonValue::Object(map)) => {
            map.remove(last);
        }
        Some(JsonValue::Array(items)) => {
            if let Ok(index) = last.parse::<usize>()
                && index < items.len()
            {
                items.remove(index);
            }
        }
        _ => {}
    }
}

/// Loads rule sets for a provider and resource type.
#[derive(Debug, Clone)]
pub struct TransformationPipeline {
    rules: TransformationRuleRepository,
}

impl TransformationPipeline {
    pub fn new(rules: TransformationRuleRepository) -> Self {
        Self { rules }
    }

    pub async fn load(
        &self,
        provider_slug: &str,
        resource_type: &str,
    ) -> Result<RuleSet, TransformError> {
        let stored = self.rules.list_active(provider_slug, resource_type).await?;
        let rule_set = RuleSet::from_documents(stored.iter().map(|rule| &rule.rule))?;
        tracing::debug!(
            provider = provider_slug,
            resource_type,
            rules = rule_set.len(),
            "Loaded transformation rules"
        );
        Ok(rule_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule_set(documents: JsonValue) -> RuleSet {
        let documents = documents.as_array().unwrap().clone();
        RuleSet::from_documents(documents.iter()).unwrap()
    }

    fn observation() -> JsonValue {
        json!({
            "resourceType": "Observation",
            "id": "obs-1",
            "status": " final ",
            "code": {"coding": [{"system": "http://loinc.org", "code": "8867-4"}]},
            "valueQuantity": {"value": "72", "unit": "beats/min"},
            "effectiveDateTime": "2024-03-01T10:15:00+02:00",
            "interpretation": "H"
        })
    }

    #[test]
    fn empty_rule_set_passes_record_through() {
        let input = observation();
        let output = RuleSet::default()
            .apply(&input, PipelineDirection::Inbound)
            .unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn map_rules_build_canonical_record() {
        let rules = rule_set(json!([
            {"kind": "map", "source": "id", "target": "id"},
            {"kind": "map", "source": "status", "target": "status", "transform": "trim"},
            {"kind": "map", "source": "code.coding.0.code", "target": "code"},
            {"kind": "map", "source": "valueQuantity.value", "target": "value.amount", "transform": "to_number"},
            {"kind": "map", "source": "effectiveDateTime", "target": "effectiveAt", "transform": "to_iso8601"},
            {"kind": "map", "source": "interpretation", "target": "interpretation",
             "transform": {"fn": "value_map", "values": {"H": "high", "L": "low"}}},
            {"kind": "constant", "target": "source", "value": "ehr",
             "condition": {"op": "equals", "field": "resourceType", "value": "Observation"}},
            {"kind": "require", "field": "code"}
        ]));

        let output = rules
            .apply(&observation(), PipelineDirection::Inbound)
            .unwrap();

        assert_eq!(
            output,
            json!({
                "id": "obs-1",
                "status": "final",
                "code": "8867-4",
                "value": {"amount": 72},
                "effectiveAt": "2024-03-01T08:15:00Z",
                "interpretation": "high",
                "source": "ehr"
            })
        );
    }

    #[test]
    fn application_is_deterministic() {
        let rules = rule_set(json!([
            {"kind": "map", "source": "status", "target": "status", "transform": "uppercase"},
            {"kind": "map", "source": "id", "target": "id"}
        ]));
        let input = observation();
        let first = rules.apply(&input, PipelineDirection::Inbound).unwrap();
        let second = rules.apply(&input, PipelineDirection::Inbound).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn require_fails_record_when_field_missing() {
        let rules = rule_set(json!([
            {"kind": "map", "source": "id", "target": "id"},
            {"kind": "require", "field": "subject"}
        ]));
        let err = rules
            .apply(&observation(), PipelineDirection::Inbound)
            .unwrap_err();
        assert!(matches!(err, TransformError::MissingField(ref field) if field == "subject"));
        assert!(err.is_record_scoped());
    }

    #[test]
    fn transform_type_errors_are_record_scoped() {
        let rules = rule_set(json!([
            {"kind": "map", "source": "code", "target": "code", "transform": "uppercase"}
        ]));
        let err = rules
            .apply(&observation(), PipelineDirection::Inbound)
            .unwrap_err();
        assert!(matches!(
            err,
            TransformError::TransformFailed { transform: "uppercase", .. }
        ));
    }

    #[test]
    fn conditions_gate_rules() {
        let rules = rule_set(json!([
            {"kind": "map", "source": "id", "target": "id"},
            {"kind": "constant", "target": "flagged", "value": true,
             "condition": {"op": "matches", "field": "status", "pattern": "^\\s*final"}},
            {"kind": "constant", "target": "noSubject", "value": true,
             "condition": {"op": "missing", "field": "subject"}},
            {"kind": "constant", "target": "hasSubject", "value": true,
             "condition": {"op": "exists", "field": "subject"}}
        ]));
        let output = rules
            .apply(&observation(), PipelineDirection::Inbound)
            .unwrap();
        assert_eq!(output["flagged"], json!(true));
        assert_eq!(output["noSubject"], json!(true));
        assert!(output.get("hasSubject").is_none());
    }

    #[test]
    fn remove_drops_field_from_passthrough() {
        let rules = rule_set(json!([{"kind": "remove", "field": "valueQuantity.unit"}]));
        let output = rules
            .apply(&observation(), PipelineDirection::Inbound)
            .unwrap();
        assert_eq!(output["valueQuantity"], json!({"value": "72"}));
    }

    #[test]
    fn outbound_inverts_map_rules() {
        let rules = rule_set(json!([
            {"kind": "map", "source": "id", "target": "id"},
            {"kind": "map", "source": "gender", "target": "sex",
             "transform": {"fn": "value_map", "values": {"M": "male", "F": "female"}}},
            {"kind": "constant", "target": "source", "value": "ehr"},
            {"kind": "require", "field": "id"}
        ]));
        let canonical = json!({"id": "pat-1", "sex": "female", "source": "ehr"});

        let payload = rules
            .apply(&canonical, PipelineDirection::Outbound)
            .unwrap();
        assert_eq!(payload, json!({"id": "pat-1", "gender": "F"}));
    }

    #[test]
    fn iso8601_accepts_common_date_layouts() {
        assert_eq!(to_iso8601("2024-03-01").as_deref(), Some("2024-03-01"));
        assert_eq!(to_iso8601("20240301").as_deref(), Some("2024-03-01"));
        assert_eq!(to_iso8601("03/01/2024").as_deref(), Some("2024-03-01"));
        assert_eq!(to_iso8601("yesterday"), None);
    }

    #[test]
    fn non_object_records_are_rejected() {
        assert!(matches!(
            RuleSet::default().apply(&json!([1, 2]), PipelineDirection::Inbound),
            Err(TransformError::NotAnObject)
        ));
    }

    #[test]
    fn set_path_creates_arrays_for_numeric_segments() {
        let mut doc = json!({});
        set_path(&mut doc, "identifier.0.value", json!("MRN-1")).unwrap();
        assert_eq!(doc, json!({"identifier": [{"value": "MRN-1"}]}));
    }
}
