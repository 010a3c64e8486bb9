//! Transformation rule definitions.
//!
//! Rules are stored as JSON documents carrying a `schemaVersion` and a `kind`
//! tag. They are decoded once per load into a [`RuleSet`]; nothing downstream
//! touches raw JSON rules.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

use super::TransformError;

pub const CURRENT_SCHEMA_VERSION: u64 = 1;

/// One decoded rule (schema version 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    /// Copy `source` to `target`, optionally transforming the value.
    Map {
        source: String,
        target: String,
        #[serde(default, deserialize_with = "transform_or_name")]
        transform: Option<Transform>,
        #[serde(default)]
        condition: Option<Condition>,
    },
    /// Write a fixed value to `target`.
    Constant {
        target: String,
        value: JsonValue,
        #[serde(default)]
        condition: Option<Condition>,
    },
    Remove {
        field: String,
    },
    /// Fail the record when `field` is absent or null.
    Require {
        field: String,
    },
}

impl Rule {
    fn condition(&self) -> Option<&Condition> {
        match self {
            Rule::Map { condition, .. } | Rule::Constant { condition, .. } => condition.as_ref(),
            Rule::Remove { .. } | Rule::Require { .. } => None,
        }
    }

    pub(super) fn builds_output(&self) -> bool {
        matches!(self, Rule::Map { .. } | Rule::Constant { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum Transform {
    Uppercase,
    Lowercase,
    Trim,
    ToString,
    ToNumber,
    #[serde(rename = "to_iso8601")]
    ToIso8601,
    ValueMap {
        values: BTreeMap<String, JsonValue>,
        #[serde(default)]
        default: Option<JsonValue>,
    },
}

impl Transform {
    pub fn name(&self) -> &'static str {
        match self {
            Transform::Uppercase => "uppercase",
            Transform::Lowercase => "lowercase",
            Transform::Trim => "trim",
            Transform::ToString => "to_string",
            Transform::ToNumber => "to_number",
            Transform::ToIso8601 => "to_iso8601",
            Transform::ValueMap { .. } => "value_map",
        }
    }
}

/// Guards a rule; evaluated against the input record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Exists { field: String },
    Missing { field: String },
    Equals { field: String, value: JsonValue },
    Matches { field: String, pattern: String },
}

/// Accepts either `"uppercase"` or `{"fn": "uppercase"}`.
fn transform_or_name<'de, D>(deserializer: D) -> Result<Option<Transform>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Name(String),
        Tagged(Transform),
    }

    match Option::<Repr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Repr::Tagged(transform)) => Ok(Some(transform)),
        Some(Repr::Name(name)) => serde_json::from_value(serde_json::json!({ "fn": name }))
            .map(Some)
            .map_err(D::Error::custom),
    }
}

/// Decodes a stored rule document, checking its schema version.
pub fn decode_rule(raw: &JsonValue) -> Result<Rule, TransformError> {
    let version = raw
        .get("schemaVersion")
        .and_then(JsonValue::as_u64)
        .unwrap_or(CURRENT_SCHEMA_VERSION);
    if version != CURRENT_SCHEMA_VERSION {
        return Err(TransformError::UnsupportedSchemaVersion(version));
    }
    serde_json::from_value(raw.clone()).map_err(|e| TransformError::InvalidRule(e.to_string()))
}

/// An ordered, validated rule list with its regex conditions compiled.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub(super) rules: Vec<Rule>,
    pub(super) patterns: HashMap<String, Regex>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Result<Self, TransformError> {
        let mut patterns = HashMap::new();
        for rule in &rules {
            if let Some(Condition::Matches { pattern, .. }) = rule.condition()
                && !patterns.contains_key(pattern)
            {
                let regex = Regex::new(pattern).map_err(|e| {
                    TransformError::InvalidRule(format!("invalid pattern {pattern:?}: {e}"))
                })?;
                patterns.insert(pattern.clone(), regex);
            }
        }
        Ok(Self { rules, patterns })
    }

    /// Decodes raw rule documents already sorted by priority.
    pub fn from_documents<'a, I>(documents: I) -> Result<Self, TransformError>
    where
        I: IntoIterator<Item = &'a JsonValue>,
    {
        let rules = documents
            .into_iter()
            .map(decode_rule)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(rules)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub(super) fn condition_holds(&self, rule: &Rule, input: &JsonValue) -> bool {
        let Some(condition) = rule.condition() else {
            return true;
        };
        match condition {
            Condition::Exists { field } => {
                super::get_path(input, field).is_some_and(|value| !value.is_null())
            }
            Condition::Missing { field } => {
                super::get_path(input, field).is_none_or(JsonValue::is_null)
            }
            Condition::Equals { field, value } => super::get_path(input, field) == Some(value),
            Condition::Matches { field, pattern } => {
                let Some(JsonValue::String(text)) = super::get_path(input, field) else {
                    return false;
                };
                self.patterns
                    .get(pattern)
                    .is_some_and(|regex| regex.is_match(text))
            }
        }
    }
}
