//! Canonicalization of a [`QueryDescriptor`] into a deterministic cache key.
//!
//! Predicates with no filtering effect are stripped, the remaining fields are
//! sorted, and every value is encoded with its type tag so that `"5"` and `5`
//! produce different keys. The encoding goes through `serde_json`, which
//! escapes field names and string values, so distinct descriptors can never
//! collide on a delimiter.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::query::{PredicateValue, QueryDescriptor, SortDirection, SortSpec};
use crate::store::{Cursor, Item};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("Predicate field name must not be empty")]
    EmptyField,

    #[error("Sort field must not be empty")]
    EmptySortField,

    #[error("Predicate on '{field}' is not a finite number")]
    NonFiniteNumber { field: String },

    #[error("Predicate on '{field}' has unsupported value type {kind}")]
    UnsupportedValue { field: String, kind: &'static str },

    #[error("Failed to encode fingerprint: {0}")]
    Encoding(String),
}

/// Deterministic cache key for a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A filtering predicate value after canonicalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
enum Tagged<'a> {
    #[serde(rename = "s")]
    Str(&'a str),
    #[serde(rename = "n")]
    Num(f64),
    #[serde(rename = "b")]
    Bool(bool),
}

#[derive(Serialize)]
struct Encoded<'a> {
    #[serde(rename = "p")]
    predicates: Vec<(&'a str, Tagged<'a>)>,
    #[serde(rename = "s")]
    sort: &'a str,
    #[serde(rename = "d")]
    direction: SortDirection,
}

/// A validated query: stripped, sorted predicates plus its fingerprint.
///
/// This is the shape handed to the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalQuery {
    fingerprint: Fingerprint,
    predicates: Vec<(String, PredicateValue)>,
    sort: SortSpec,
}

impl CanonicalQuery {
    pub fn new(descriptor: &QueryDescriptor) -> Result<Self, QueryError> {
        if descriptor.sort.field.is_empty() {
            return Err(QueryError::EmptySortField);
        }

        let mut predicates = Vec::with_capacity(descriptor.predicates.len());
        for (field, value) in &descriptor.predicates {
            if field.is_empty() {
                return Err(QueryError::EmptyField);
            }
            if value.is_unfiltered() {
                continue;
            }
            let value = match value {
                PredicateValue::Number(n) if !n.is_finite() => {
                    return Err(QueryError::NonFiniteNumber {
                        field: field.clone(),
                    });
                }
                // -0.0 and 0.0 select the same items.
                PredicateValue::Number(n) if *n == 0.0 => PredicateValue::Number(0.0),
                other => other.clone(),
            };
            predicates.push((field.clone(), value));
        }
        predicates.sort_by(|(a, _), (b, _)| a.cmp(b));

        let encoded = Encoded {
            predicates: predicates
                .iter()
                .filter_map(|(field, value)| {
                    let tagged = match value {
                        PredicateValue::String(s) => Tagged::Str(s),
                        PredicateValue::Number(n) => Tagged::Num(*n),
                        PredicateValue::Bool(b) => Tagged::Bool(*b),
                        PredicateValue::Absent => return None,
                    };
                    Some((field.as_str(), tagged))
                })
                .collect(),
            sort: &descriptor.sort.field,
            direction: descriptor.sort.direction,
        };
        let key = serde_json::to_string(&encoded).map_err(|e| QueryError::Encoding(e.to_string()))?;

        Ok(Self {
            fingerprint: Fingerprint(key),
            predicates,
            sort: descriptor.sort.clone(),
        })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn sort(&self) -> &SortSpec {
        &self.sort
    }

    /// Filtering predicates in field order.
    pub fn predicates(&self) -> &[(String, PredicateValue)] {
        &self.predicates
    }

    /// Whether an item satisfies every predicate.
    pub fn matches(&self, item: &Item) -> bool {
        self.predicates
            .iter()
            .all(|(field, value)| value.matches(item.field(field)))
    }

    /// Cursor of `item` under this query's sort.
    pub fn cursor_of(&self, item: &Item) -> Cursor {
        item.cursor(&self.sort.field)
    }

    /// Order two positions according to the sort field and direction.
    pub fn compare(&self, a: &Cursor, b: &Cursor) -> Ordering {
        let ordering = a.cmp_ascending(b);
        match self.sort.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }
}

/// Derive the fingerprint of a descriptor.
pub fn canonicalize(descriptor: &QueryDescriptor) -> Result<Fingerprint, QueryError> {
    CanonicalQuery::new(descriptor).map(|query| query.fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SortSpec;

    fn base() -> QueryDescriptor {
        QueryDescriptor::new(SortSpec::asc("id"))
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let a = base().with("email", "a@test.com").with("address", "Tokyo").with("age", 30);
        let b = base().with("age", 30).with("address", "Tokyo").with("email", "a@test.com");
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
    }

    #[test]
    fn test_types_are_tagged() {
        let string = canonicalize(&base().with("age", "5")).unwrap();
        let number = canonicalize(&base().with("age", 5)).unwrap();
        let boolean = canonicalize(&base().with("age", true)).unwrap();
        let bool_string = canonicalize(&base().with("age", "true")).unwrap();
        assert_ne!(string, number);
        assert_ne!(boolean, bool_string);
        assert_ne!(number, boolean);
    }

    #[test]
    fn test_unfiltered_values_are_stripped() {
        let plain = canonicalize(&base()).unwrap();
        let absent = canonicalize(&base().with("email", PredicateValue::Absent)).unwrap();
        let empty = canonicalize(&base().with("email", "")).unwrap();
        assert_eq!(plain, absent);
        assert_eq!(plain, empty);

        // false and 0 are real filters.
        assert_ne!(plain, canonicalize(&base().with("active", false)).unwrap());
        assert_ne!(plain, canonicalize(&base().with("age", 0)).unwrap());
    }

    #[test]
    fn test_sort_is_part_of_key() {
        let asc = canonicalize(&QueryDescriptor::new(SortSpec::asc("id"))).unwrap();
        let desc = canonicalize(&QueryDescriptor::new(SortSpec::desc("id"))).unwrap();
        let other = canonicalize(&QueryDescriptor::new(SortSpec::asc("age"))).unwrap();
        assert_ne!(asc, desc);
        assert_ne!(asc, other);
    }

    #[test]
    fn test_delimiters_in_values_do_not_collide() {
        let a = base().with("a", "x\",[\"b").with("c", "y");
        let b = base().with("a", "x").with("b\",[\"c", "y");
        assert_ne!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
    }

    #[test]
    fn test_negative_zero_normalized() {
        let pos = canonicalize(&base().with("n", 0.0)).unwrap();
        let neg = canonicalize(&base().with("n", -0.0)).unwrap();
        assert_eq!(pos, neg);
    }

    #[test]
    fn test_invalid_descriptors_rejected() {
        assert_eq!(
            canonicalize(&base().with("age", f64::NAN)),
            Err(QueryError::NonFiniteNumber {
                field: "age".into()
            })
        );
        assert_eq!(canonicalize(&base().with("", 1)), Err(QueryError::EmptyField));
        assert_eq!(
            canonicalize(&QueryDescriptor::new(SortSpec::asc(""))),
            Err(QueryError::EmptySortField)
        );
    }

    #[test]
    fn test_canonical_predicates_sorted() {
        let query = CanonicalQuery::new(&base().with("b", 1).with("a", 2).with("c", "")).unwrap();
        let fields: Vec<_> = query.predicates().iter().map(|(f, _)| f.as_str()).collect();
        assert_eq!(fields, vec!["a", "b"]);
    }
}
