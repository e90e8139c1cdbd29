//! Query descriptors and their canonical form.
//!
//! - [`QueryDescriptor`]: equality predicates plus a single sort field
//! - [`PredicateValue`]: closed set of predicate value types
//! - [`fingerprint`]: canonicalization into a deterministic cache key

pub mod fingerprint;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use fingerprint::{canonicalize, CanonicalQuery, Fingerprint, QueryError};

/// Direction of the single sort field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "asc"),
            SortDirection::Desc => write!(f, "desc"),
        }
    }
}

/// Sort field and direction applied to every page of a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    /// Field whose value orders the collection.
    pub field: String,

    /// Ascending or descending.
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn new(field: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self::new(field, SortDirection::Asc)
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self::new(field, SortDirection::Desc)
    }
}

/// Value of an equality predicate.
///
/// `Absent` (and the empty string) mean "no filter on this field" and are
/// dropped during canonicalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredicateValue {
    Absent,
    Bool(bool),
    Number(f64),
    String(String),
}

impl PredicateValue {
    /// Parse a raw query-string value.
    ///
    /// Empty strings are `Absent`, `true`/`false` are booleans and finite
    /// numerics are numbers. Everything else stays a string.
    pub fn from_param(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return PredicateValue::Absent;
        }
        match trimmed {
            "true" => return PredicateValue::Bool(true),
            "false" => return PredicateValue::Bool(false),
            _ => {}
        }
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() && !trimmed.starts_with('+') => PredicateValue::Number(n),
            _ => PredicateValue::String(raw.to_string()),
        }
    }

    /// Whether this value filters nothing.
    pub fn is_unfiltered(&self) -> bool {
        match self {
            PredicateValue::Absent => true,
            PredicateValue::String(s) => s.is_empty(),
            PredicateValue::Bool(_) | PredicateValue::Number(_) => false,
        }
    }

    /// Equality against a stored field value. A missing field never matches.
    pub fn matches(&self, value: Option<&serde_json::Value>) -> bool {
        use serde_json::Value;

        match (self, value) {
            (PredicateValue::Absent, _) => true,
            (PredicateValue::Bool(expected), Some(Value::Bool(actual))) => expected == actual,
            (PredicateValue::Number(expected), Some(Value::Number(actual))) => {
                actual.as_f64() == Some(*expected)
            }
            (PredicateValue::String(expected), Some(Value::String(actual))) => expected == actual,
            _ => false,
        }
    }
}

impl From<&str> for PredicateValue {
    fn from(value: &str) -> Self {
        PredicateValue::String(value.to_string())
    }
}

impl From<String> for PredicateValue {
    fn from(value: String) -> Self {
        PredicateValue::String(value)
    }
}

impl From<bool> for PredicateValue {
    fn from(value: bool) -> Self {
        PredicateValue::Bool(value)
    }
}

impl From<f64> for PredicateValue {
    fn from(value: f64) -> Self {
        PredicateValue::Number(value)
    }
}

impl From<i64> for PredicateValue {
    fn from(value: i64) -> Self {
        PredicateValue::Number(value as f64)
    }
}

impl From<i32> for PredicateValue {
    fn from(value: i32) -> Self {
        PredicateValue::Number(value as f64)
    }
}

impl<T: Into<PredicateValue>> From<Option<T>> for PredicateValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(PredicateValue::Absent)
    }
}

impl TryFrom<&serde_json::Value> for PredicateValue {
    type Error = &'static str;

    /// Converts a JSON value, returning the name of the unsupported kind on failure.
    fn try_from(value: &serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;

        match value {
            Value::Null => Ok(PredicateValue::Absent),
            Value::Bool(b) => Ok(PredicateValue::Bool(*b)),
            Value::Number(n) => n.as_f64().map(PredicateValue::Number).ok_or("number"),
            Value::String(s) => Ok(PredicateValue::String(s.clone())),
            Value::Array(_) => Err("array"),
            Value::Object(_) => Err("object"),
        }
    }
}

/// A filter/sort query over the remote collection.
///
/// Predicates form an unordered set; two descriptors built in different
/// insertion orders canonicalize to the same [`Fingerprint`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    #[serde(default)]
    pub predicates: HashMap<String, PredicateValue>,

    pub sort: SortSpec,
}

impl QueryDescriptor {
    pub fn new(sort: SortSpec) -> Self {
        Self {
            predicates: HashMap::new(),
            sort,
        }
    }

    /// Add (or replace) an equality predicate.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<PredicateValue>) -> Self {
        self.predicates.insert(field.into(), value.into());
        self
    }

    /// Build a descriptor from raw query-string parameters.
    pub fn from_params<'a>(
        sort: SortSpec,
        params: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let predicates = params
            .into_iter()
            .map(|(field, raw)| (field.to_string(), PredicateValue::from_param(raw)))
            .collect();
        Self { predicates, sort }
    }

    /// Canonical cache key for this descriptor.
    pub fn fingerprint(&self) -> Result<Fingerprint, QueryError> {
        canonicalize(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_param_types() {
        assert_eq!(PredicateValue::from_param(""), PredicateValue::Absent);
        assert_eq!(PredicateValue::from_param("true"), PredicateValue::Bool(true));
        assert_eq!(PredicateValue::from_param("42"), PredicateValue::Number(42.0));
        assert_eq!(PredicateValue::from_param("-1.5"), PredicateValue::Number(-1.5));
        assert_eq!(
            PredicateValue::from_param("Tokyo"),
            PredicateValue::String("Tokyo".into())
        );
        // "NaN" and "inf" parse as f64 but are not numeric filters.
        assert_eq!(
            PredicateValue::from_param("NaN"),
            PredicateValue::String("NaN".into())
        );
        assert_eq!(
            PredicateValue::from_param("inf"),
            PredicateValue::String("inf".into())
        );
    }

    #[test]
    fn test_matches_is_type_strict() {
        let five = json!(5);
        let five_str = json!("5");
        assert!(PredicateValue::Number(5.0).matches(Some(&five)));
        assert!(!PredicateValue::Number(5.0).matches(Some(&five_str)));
        assert!(PredicateValue::from("5").matches(Some(&five_str)));
        assert!(!PredicateValue::Bool(true).matches(None));
    }

    #[test]
    fn test_try_from_json_rejects_containers() {
        assert!(PredicateValue::try_from(&json!([1, 2])).is_err());
        assert!(PredicateValue::try_from(&json!({"a": 1})).is_err());
        assert_eq!(
            PredicateValue::try_from(&json!(null)),
            Ok(PredicateValue::Absent)
        );
    }

    #[test]
    fn test_descriptor_deserializes_untagged_values() {
        let descriptor: QueryDescriptor = serde_json::from_value(json!({
            "predicates": {"age": 30, "email": "a@b.c", "active": false, "address": null},
            "sort": {"field": "id", "direction": "desc"}
        }))
        .unwrap();
        assert_eq!(descriptor.predicates["age"], PredicateValue::Number(30.0));
        assert_eq!(descriptor.predicates["active"], PredicateValue::Bool(false));
        assert_eq!(descriptor.predicates["address"], PredicateValue::Absent);
        assert_eq!(descriptor.sort, SortSpec::desc("id"));
    }
}
