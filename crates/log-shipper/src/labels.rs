// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Label sets and the nested field paths used to extract them.

use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt::Write;

use crate::metadata::KUBERNETES_KEY;
use crate::record::{Record, Value};

/// Label name to label value. Ordered so the canonical form is stable.
pub type LabelSet = BTreeMap<String, String>;

/// Canonical serialization used to key streams: `{a="1", b="2"}`. Names
/// outside `[A-Za-z0-9_]` are quoted like values.
#[must_use]
pub fn label_set_key(labels: &LabelSet) -> String {
    let mut key = String::with_capacity(labels.len() * 16 + 2);
    key.push('{');
    for (i, (name, value)) in labels.iter().enumerate() {
        if i > 0 {
            key.push_str(", ");
        }
        if is_plain_label_name(name) {
            let _ = write!(key, "{name}={value:?}");
        } else {
            let _ = write!(key, "{name:?}={value:?}");
        }
    }
    key.push('}');
    key
}

fn is_plain_label_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Replaces every character not allowed in a label name with `_`.
#[must_use]
pub fn sanitize_label_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}

/// One level of a nested field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathNode {
    /// Read the record value at this key and use it under the given name.
    Label(String),
    /// Descend into the nested map at this key.
    Nested(FieldPath),
}

/// A tree of record keys, e.g. `{"kubernetes": {"namespace_name": "namespace"}}`.
///
/// Leaves name the label (or, for dynamic host paths, are informational only).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPath(BTreeMap<String, PathNode>);

impl FieldPath {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builds a path from a JSON object. A JSON string holding an object is
    /// accepted as well, which is how the path arrives from environment
    /// variables.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        match value {
            serde_json::Value::String(raw) => {
                if raw.trim().is_empty() {
                    return Ok(FieldPath::default());
                }
                let parsed: serde_json::Value = serde_json::from_str(raw)
                    .map_err(|e| format!("field path {raw:?} is not valid JSON: {e}"))?;
                match parsed {
                    serde_json::Value::Object(_) => FieldPath::from_json(&parsed),
                    _ => Err(format!("field path {raw:?} must be a JSON object")),
                }
            }
            serde_json::Value::Object(map) => {
                let mut nodes = BTreeMap::new();
                for (key, node) in map {
                    let node = match node {
                        serde_json::Value::String(name) => PathNode::Label(name.clone()),
                        serde_json::Value::Object(_) => PathNode::Nested(FieldPath::from_json(node)?),
                        other => {
                            return Err(format!(
                                "field path entry {key:?} must be a string or an object, got {other}"
                            ))
                        }
                    };
                    nodes.insert(key.clone(), node);
                }
                Ok(FieldPath(nodes))
            }
            serde_json::Value::Null => Ok(FieldPath::default()),
            other => Err(format!("field path must be a JSON object, got {other}")),
        }
    }

    /// Walks the path through `record` and returns the value found at the
    /// first leaf that exists, or the empty string when a segment is missing.
    #[must_use]
    pub fn resolve(&self, record: &Record) -> String {
        for (key, node) in &self.0 {
            let Some(value) = record.get(key) else {
                continue;
            };
            return match (node, value) {
                (PathNode::Label(_), Value::String(s)) => s.clone(),
                (PathNode::Label(_), Value::Map(_) | Value::List(_) | Value::Null) => String::new(),
                (PathNode::Label(_), scalar) => scalar.to_line_string(),
                (PathNode::Nested(next), Value::Map(sub)) => next.resolve(sub),
                (PathNode::Nested(_), _) => String::new(),
            };
        }
        String::new()
    }

    /// Collects every leaf of the path that exists in `record` into `labels`.
    pub fn extract_labels(&self, record: &Record, labels: &mut LabelSet) {
        for (key, node) in &self.0 {
            match (node, record.get(key)) {
                (PathNode::Label(name), Some(value)) if !matches!(value, Value::Map(_)) => {
                    labels.insert(name.clone(), value.to_line_string());
                }
                (PathNode::Nested(next), Some(Value::Map(sub))) => next.extract_labels(sub, labels),
                _ => {}
            }
        }
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        FieldPath::from_json(&value).map_err(serde::de::Error::custom)
    }
}

/// How labels are derived from a record. The strategies are exclusive; see
/// [`LabelStrategy::select`] for precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelStrategy {
    /// Flatten the nested Kubernetes metadata map.
    AutoKubernetes,
    /// Walk a configured label map.
    Map(FieldPath),
    /// Copy an explicit allow-list of top-level record keys.
    Keys(Vec<String>),
}

impl LabelStrategy {
    /// Automatic extraction wins, then a non-empty label map, then the key list.
    #[must_use]
    pub fn select(auto_kubernetes: bool, label_map: &FieldPath, label_keys: &[String]) -> Self {
        if auto_kubernetes {
            LabelStrategy::AutoKubernetes
        } else if !label_map.is_empty() {
            LabelStrategy::Map(label_map.clone())
        } else {
            LabelStrategy::Keys(label_keys.to_vec())
        }
    }

    #[must_use]
    pub fn extract(&self, record: &Record) -> LabelSet {
        let mut labels = LabelSet::new();
        match self {
            LabelStrategy::AutoKubernetes => auto_kubernetes_labels(record, &mut labels),
            LabelStrategy::Map(map) => map.extract_labels(record, &mut labels),
            LabelStrategy::Keys(keys) => {
                for key in keys {
                    if let Some(value) = record.get(key) {
                        labels.insert(key.clone(), value.to_line_string());
                    }
                }
            }
        }
        labels
    }

    /// Record keys consumed by this strategy that must not appear in the line.
    #[must_use]
    pub fn consumed_keys(&self) -> &[String] {
        match self {
            LabelStrategy::Keys(keys) => keys,
            _ => &[],
        }
    }
}

fn auto_kubernetes_labels(record: &Record, labels: &mut LabelSet) {
    let Some(Value::Map(kubernetes)) = record.get(KUBERNETES_KEY) else {
        return;
    };
    for (key, value) in kubernetes {
        match (key.as_str(), value) {
            ("labels", Value::Map(pod_labels)) => {
                for (name, label_value) in pod_labels {
                    labels.insert(sanitize_label_name(name), label_value.to_line_string());
                }
            }
            ("annotations" | "docker_id" | "pod_id", _) => {}
            (_, Value::Map(_) | Value::List(_)) => {}
            (_, scalar) => {
                labels.insert(sanitize_label_name(key), scalar.to_line_string());
            }
        }
    }
}
