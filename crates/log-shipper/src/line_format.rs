// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Deserialize;
use std::fmt::Write;

use crate::record::{Record, Value};

/// Output format of the log line built from the remaining record fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineFormat {
    #[default]
    Json,
    /// `key=value` pairs with values written verbatim.
    KeyValue,
    /// logfmt: like `KeyValue` but values are quoted when needed.
    Logfmt,
}

/// Builds the line sent to the backend.
///
/// With `drop_single_key`, a record reduced to exactly one field is sent as
/// that field's stringified value.
pub fn format_line(
    record: &Record,
    format: LineFormat,
    drop_single_key: bool,
) -> Result<String, serde_json::Error> {
    if drop_single_key && record.len() == 1 {
        if let Some(value) = record.values().next() {
            return Ok(value.to_line_string());
        }
    }

    match format {
        LineFormat::Json => serde_json::to_string(record),
        LineFormat::KeyValue => Ok(join_pairs(record, |value| value.to_line_string())),
        LineFormat::Logfmt => Ok(join_pairs(record, |value| logfmt_value(&value.to_line_string()))),
    }
}

fn join_pairs(record: &Record, render: impl Fn(&Value) -> String) -> String {
    let mut line = String::new();
    for (i, (key, value)) in record.iter().enumerate() {
        if i > 0 {
            line.push(' ');
        }
        let _ = write!(line, "{key}={}", render(value));
    }
    line
}

fn logfmt_value(raw: &str) -> String {
    let needs_quotes = raw.is_empty()
        || raw
            .chars()
            .any(|c| c.is_whitespace() || c == '=' || c == '"' || c.is_control());
    if !needs_quotes {
        return raw.to_string();
    }
    let mut quoted = String::with_capacity(raw.len() + 2);
    quoted.push('"');
    for c in raw.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::record_from_json;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        record_from_json(value).unwrap()
    }

    #[test]
    fn test_json_format() {
        let rec = record(json!({"log": "hello", "level": "info"}));
        let line = format_line(&rec, LineFormat::Json, false).unwrap();
        assert_eq!(line, r#"{"level":"info","log":"hello"}"#);
    }

    #[test]
    fn test_key_value_format() {
        let rec = record(json!({"log": "hello world", "level": "info", "n": 3}));
        let line = format_line(&rec, LineFormat::KeyValue, false).unwrap();
        assert_eq!(line, "level=info log=hello world n=3");
    }

    #[test]
    fn test_logfmt_quotes_when_needed() {
        let rec = record(json!({"log": "say \"hi\" now", "level": "info", "empty": ""}));
        let line = format_line(&rec, LineFormat::Logfmt, false).unwrap();
        assert_eq!(line, r#"empty="" level=info log="say \"hi\" now""#);
    }

    #[test]
    fn test_drop_single_key_sends_raw_value() {
        let rec = record(json!({"log": "only the message"}));

        assert_eq!(
            format_line(&rec, LineFormat::Json, true).unwrap(),
            "only the message"
        );
        assert_eq!(
            format_line(&rec, LineFormat::KeyValue, true).unwrap(),
            "only the message"
        );
        assert_eq!(
            format_line(&rec, LineFormat::KeyValue, false).unwrap(),
            "log=only the message"
        );
    }

    #[test]
    fn test_drop_single_key_ignored_with_more_fields() {
        let rec = record(json!({"log": "m", "level": "warn"}));
        assert_eq!(
            format_line(&rec, LineFormat::KeyValue, true).unwrap(),
            "level=warn log=m"
        );
    }

    #[test]
    fn test_drop_single_key_non_string_value() {
        let rec = record(json!({"payload": {"a": 1}}));
        assert_eq!(format_line(&rec, LineFormat::Json, true).unwrap(), r#"{"a":1}"#);
    }
}
