// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Normalized record model shared by the router and the host adapter.
//!
//! The host hands over loosely typed payloads. They are converted once, at the
//! adapter boundary, into a [`Record`]: a map of string keys to tagged
//! [`Value`]s. Everything downstream operates on this shape only.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// A single log record with string keys.
pub type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(Record),
}

impl Value {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&Record> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Renders the value the way it appears inside a log line: strings are
    /// emitted verbatim, scalars in their natural form and containers as JSON.
    #[must_use]
    pub fn to_line_string(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::List(_) | Value::Map(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line_string())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Record> for Value {
    fn from(m: Record) -> Self {
        Value::Map(m)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Converts a decoded JSON object into a [`Record`].
///
/// Returns `None` when the payload is not an object.
#[must_use]
pub fn record_from_json(value: serde_json::Value) -> Option<Record> {
    match Value::from(value) {
        Value::Map(record) => Some(record),
        _ => None,
    }
}

/// Builds a [`Record`] from key/value pairs whose keys are not guaranteed to
/// be strings. Pairs with a non-string key are skipped; their count is
/// returned alongside the record.
#[must_use]
pub fn record_from_pairs(
    pairs: impl IntoIterator<Item = (serde_json::Value, serde_json::Value)>,
) -> (Record, usize) {
    let mut record = Record::new();
    let mut skipped = 0;
    for (key, value) in pairs {
        match key {
            serde_json::Value::String(key) => {
                record.insert(key, Value::from(value));
            }
            _ => skipped += 1,
        }
    }
    (record, skipped)
}
