// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Recovery of Kubernetes metadata from the record's tag.
//!
//! Container log tags follow the kubelet file naming scheme
//! `kubernetes.var.log.containers.<pod>_<namespace>_<container>-<container id>.log`.
//! When a record arrives without the nested `kubernetes` map, the tag is
//! parsed and the map is synthesized from it.

use regex::Regex;
use thiserror::Error;

use crate::record::{Record, Value};

pub const KUBERNETES_KEY: &str = "kubernetes";
pub const POD_NAME_KEY: &str = "pod_name";
pub const NAMESPACE_NAME_KEY: &str = "namespace_name";
pub const CONTAINER_NAME_KEY: &str = "container_name";
pub const CONTAINER_ID_KEY: &str = "docker_id";

pub const DEFAULT_TAG_KEY: &str = "tag";
pub const DEFAULT_TAG_PREFIX: &str = r"kubernetes\.var\.log\.containers";
pub const DEFAULT_TAG_EXPRESSION: &str = r"\.([^_]+)_([^_]+)_(.+)-([a-z0-9]{64})\.log$";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("record has no {0:?} key to recover metadata from")]
    TagKeyMissing(String),
    #[error("tag {0:?} does not match the expected prefix")]
    PrefixMismatch(String),
    #[error("tag {0:?} does not match the expected format")]
    FormatMismatch(String),
}

impl MetadataError {
    /// Short label used when counting the error.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            MetadataError::TagKeyMissing(_) => "tag_key_missing",
            MetadataError::PrefixMismatch(_) => "tag_prefix_mismatch",
            MetadataError::FormatMismatch(_) => "tag_format_mismatch",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TagFallback {
    tag_key: String,
    prefix: Regex,
    expression: Regex,
}

impl TagFallback {
    /// Compiles the prefix and expression.
    ///
    /// The expression must capture pod name, namespace, container name and
    /// container id, in that order.
    pub fn new(tag_key: &str, tag_prefix: &str, tag_expression: &str) -> Result<Self, String> {
        let prefix = Regex::new(&format!("^{tag_prefix}"))
            .map_err(|e| format!("invalid tag prefix {tag_prefix:?}: {e}"))?;
        // the expression is matched directly after the prefix
        let expression = Regex::new(&format!("{tag_prefix}{tag_expression}"))
            .map_err(|e| format!("invalid tag expression {tag_expression:?}: {e}"))?;
        // captures_len counts the implicit whole-match group
        if expression.captures_len() < 5 {
            return Err(format!(
                "tag expression {tag_expression:?} must capture pod, namespace, container and container id"
            ));
        }
        Ok(TagFallback {
            tag_key: tag_key.to_string(),
            prefix,
            expression,
        })
    }

    #[must_use]
    pub fn tag_key(&self) -> &str {
        &self.tag_key
    }

    /// Parses `tag` into a synthesized metadata map.
    pub fn parse_tag(&self, tag: &str) -> Result<Record, MetadataError> {
        if !self.prefix.is_match(tag) {
            return Err(MetadataError::PrefixMismatch(tag.to_string()));
        }
        let captures = self
            .expression
            .captures(tag)
            .ok_or_else(|| MetadataError::FormatMismatch(tag.to_string()))?;

        let mut metadata = Record::new();
        for (index, key) in [
            POD_NAME_KEY,
            NAMESPACE_NAME_KEY,
            CONTAINER_NAME_KEY,
            CONTAINER_ID_KEY,
        ]
        .into_iter()
        .enumerate()
        {
            let value = captures
                .get(index + 1)
                .map(|m| m.as_str())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| MetadataError::FormatMismatch(tag.to_string()))?;
            metadata.insert(key.to_string(), Value::from(value));
        }
        Ok(metadata)
    }

    /// Reads the tag out of `record` and inserts the recovered metadata map
    /// under [`KUBERNETES_KEY`]. The record is left untouched on error.
    pub fn recover(&self, record: &mut Record) -> Result<(), MetadataError> {
        let tag = record
            .get(&self.tag_key)
            .and_then(Value::as_str)
            .ok_or_else(|| MetadataError::TagKeyMissing(self.tag_key.clone()))?;
        let metadata = self.parse_tag(tag)?;
        record.insert(KUBERNETES_KEY.to_string(), Value::Map(metadata));
        Ok(())
    }
}

impl Default for TagFallback {
    fn default() -> Self {
        #[allow(clippy::expect_used)]
        TagFallback::new(DEFAULT_TAG_KEY, DEFAULT_TAG_PREFIX, DEFAULT_TAG_EXPRESSION)
            .expect("default tag expressions compile")
    }
}

/// Returns true when the record carries a nested metadata map.
#[must_use]
pub fn has_metadata(record: &Record) -> bool {
    matches!(record.get(KUBERNETES_KEY), Some(Value::Map(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTAINER_ID: &str = "4c5ed8e4bd3fd2e4c3ad1ad7b1d1e5c0d5e6f7a8b9c0d1e2f3a4b5c6d7e8f9a0";

    #[test]
    fn test_parse_tag_exact() {
        let fallback = TagFallback::default();
        let tag = format!("kubernetes.var.log.containers.pod-x_ns-y_container-z-{CONTAINER_ID}.log");

        let metadata = fallback.parse_tag(&tag).unwrap();

        assert_eq!(metadata[POD_NAME_KEY].as_str(), Some("pod-x"));
        assert_eq!(metadata[NAMESPACE_NAME_KEY].as_str(), Some("ns-y"));
        assert_eq!(metadata[CONTAINER_NAME_KEY].as_str(), Some("container-z"));
        assert_eq!(metadata[CONTAINER_ID_KEY].as_str(), Some(CONTAINER_ID));
        assert_eq!(metadata.len(), 4);
    }

    #[test]
    fn test_parse_tag_missing_namespace() {
        let fallback = TagFallback::default();
        let tag = format!("kubernetes.var.log.containers.pod-x_container-z-{CONTAINER_ID}.log");

        let err = fallback.parse_tag(&tag).unwrap_err();

        assert_eq!(err, MetadataError::FormatMismatch(tag));
    }

    #[test]
    fn test_parse_tag_wrong_prefix() {
        let fallback = TagFallback::default();
        let tag = format!("systemd.var.log.containers.pod-x_ns-y_container-z-{CONTAINER_ID}.log");

        let err = fallback.parse_tag(&tag).unwrap_err();

        assert_eq!(err.kind(), "tag_prefix_mismatch");
    }

    #[test]
    fn test_recover_inserts_metadata() {
        let fallback = TagFallback::default();
        let mut record = Record::new();
        record.insert(
            "tag".to_string(),
            Value::from(format!(
                "kubernetes.var.log.containers.web-0_shoot--dev--a_app-{CONTAINER_ID}.log"
            )),
        );
        record.insert("log".to_string(), Value::from("hello"));

        fallback.recover(&mut record).unwrap();

        assert!(has_metadata(&record));
        let metadata = record[KUBERNETES_KEY].as_map().unwrap();
        assert_eq!(metadata[NAMESPACE_NAME_KEY].as_str(), Some("shoot--dev--a"));
    }

    #[test]
    fn test_recover_without_tag_key() {
        let fallback = TagFallback::default();
        let mut record = Record::new();
        record.insert("log".to_string(), Value::from("hello"));

        let err = fallback.recover(&mut record).unwrap_err();

        assert_eq!(err, MetadataError::TagKeyMissing("tag".to_string()));
        assert!(!has_metadata(&record));
    }

    #[test]
    fn test_expression_without_enough_captures() {
        let result = TagFallback::new("tag", "kube", r"\.([^_]+)_([^_]+)\.log$");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_regex_rejected() {
        assert!(TagFallback::new("tag", "(unclosed", DEFAULT_TAG_EXPRESSION).is_err());
    }
}
