//! Helpers for building queries from caller input and shaping results.

use crate::backend::Record;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Characters with special meaning inside an LDAP filter.
const FILTER_METACHARACTERS: [char; 4] = ['(', ')', '*', '\\'];

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Query {query:?} contains the disallowed character {character:?}")]
pub struct InvalidQuery {
    pub query: String,
    pub character: char,
}

/// Rejects caller input which could alter the structure of a filter it is
/// interpolated into.
pub fn validate_query(query: &str) -> Result<(), InvalidQuery> {
    match query.chars().find(|c| FILTER_METACHARACTERS.contains(c)) {
        Some(character) => Err(InvalidQuery {
            query: query.to_string(),
            character,
        }),
        None => Ok(()),
    }
}

/// An attribute after flattening: single-valued attributes are unwrapped.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Single(String),
    Multi(Vec<String>),
}

pub type FlatRecord = BTreeMap<String, AttributeValue>;

/// Unwraps the first value of every attribute named in `single_valued`.
///
/// Other attributes, and single-valued attributes without any value, keep
/// their list form.
pub fn flatten<S: AsRef<str>>(record: &Record, single_valued: &[S]) -> FlatRecord {
    record
        .iter()
        .map(|(name, values)| {
            let single = single_valued.iter().any(|s| s.as_ref() == name);
            let value = match values.first() {
                Some(first) if single => AttributeValue::Single(first.clone()),
                _ => AttributeValue::Multi(values.clone()),
            };
            (name.clone(), value)
        })
        .collect()
}

/// Wraps every value back into a list.
pub fn unflatten(record: &FlatRecord) -> Record {
    record
        .iter()
        .map(|(name, value)| {
            let values = match value {
                AttributeValue::Single(value) => vec![value.clone()],
                AttributeValue::Multi(values) => values.clone(),
            };
            (name.clone(), values)
        })
        .collect()
}
