// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backend push protocols.
//!
//! Two payload shapes are supported, both sent as a single HTTP POST:
//!
//! ```text
//!   push:  {"streams":[{"stream":{<labels>},"values":[["<unix nanos>","<line>"], ..]}, ..]}
//!
//!   otlp:  {"resourceLogs":[{"resource":{"attributes":[<labels>]},
//!           "scopeLogs":[{"scope":{..},"logRecords":[{"timeUnixNano":"..","body":{"stringValue":".."}}]}]}]}
//! ```
//!
//! Response classification: 2xx is success, 429, 5xx and transport errors are
//! transient, anything else is permanent.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Debug;
use thiserror::Error;

use crate::batch::Batch;
use crate::labels::LabelSet;

const MAX_ERROR_BODY_LEN: usize = 1024;
const OTLP_SCOPE_NAME: &str = "log-shipper";

#[derive(Debug, Error)]
pub enum PushError {
    #[error("transient push failure: {0}")]
    Transient(String),
    #[error("backend rejected the push with status {status}: {body}")]
    Permanent { status: u16, body: String },
    #[error("failed to encode push payload: {0}")]
    Encode(String),
}

impl PushError {
    /// Transient failures may succeed on a later attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, PushError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Line-oriented label/stream push.
    #[default]
    Push,
    /// OTLP/HTTP JSON logs export.
    Otlp,
}

/// Sends one sealed batch to a backend.
#[async_trait]
pub trait Pusher: Send + Sync + Debug {
    async fn push(&self, batch: &Batch) -> Result<(), PushError>;

    fn endpoint(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSettings {
    pub backend: BackendKind,
    pub headers: Vec<(String, String)>,
    pub tenant_header: String,
    pub tenant_id: Option<String>,
    pub basic_auth: Option<BasicAuth>,
    pub bearer_token: Option<String>,
    /// zstd level; `None` disables compression.
    pub compression_level: Option<i32>,
    pub number_of_batch_ids: u64,
    pub id_label_name: String,
    pub static_labels: LabelSet,
}

impl Default for PushSettings {
    fn default() -> Self {
        PushSettings {
            backend: BackendKind::Push,
            headers: Vec::new(),
            tenant_header: "X-Scope-OrgID".to_string(),
            tenant_id: None,
            basic_auth: None,
            bearer_token: None,
            compression_level: None,
            number_of_batch_ids: 0,
            id_label_name: "id".to_string(),
            static_labels: LabelSet::new(),
        }
    }
}

#[derive(Serialize)]
struct PushRequest {
    streams: Vec<PushStream>,
}

#[derive(Serialize)]
struct PushStream {
    stream: LabelSet,
    values: Vec<[String; 2]>,
}

#[derive(Debug)]
pub struct HttpPusher {
    client: reqwest::Client,
    url: Url,
    endpoint: String,
    headers: HeaderMap,
    settings: PushSettings,
}

impl HttpPusher {
    /// `endpoint` is the configured URL, `url` the one requests go to.
    pub fn new(
        client: reqwest::Client,
        endpoint: String,
        url: Url,
        settings: PushSettings,
    ) -> Result<Self, PushError> {
        let headers = build_headers(&settings)?;
        Ok(HttpPusher {
            client,
            url,
            endpoint,
            headers,
            settings,
        })
    }

    fn stream_labels(&self, labels: &LabelSet, seq: u64) -> LabelSet {
        let mut merged = self.settings.static_labels.clone();
        merged.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        if self.settings.number_of_batch_ids > 1 {
            merged.insert(
                self.settings.id_label_name.clone(),
                (seq % self.settings.number_of_batch_ids).to_string(),
            );
        }
        merged
    }

    /// Serializes `batch` in the configured protocol. Streams are emitted in
    /// label order so payloads are deterministic.
    pub fn encode(&self, batch: &Batch) -> Result<Vec<u8>, PushError> {
        let mut streams: Vec<_> = batch.streams().collect();
        streams.sort_by(|a, b| a.labels.cmp(&b.labels));

        let body = match self.settings.backend {
            BackendKind::Push => {
                let request = PushRequest {
                    streams: streams
                        .into_iter()
                        .map(|stream| PushStream {
                            stream: self.stream_labels(&stream.labels, batch.seq),
                            values: stream
                                .entries
                                .iter()
                                .map(|e| [e.timestamp.to_string(), e.line.clone()])
                                .collect(),
                        })
                        .collect(),
                };
                serde_json::to_vec(&request)
            }
            BackendKind::Otlp => {
                let resource_logs: Vec<_> = streams
                    .into_iter()
                    .map(|stream| {
                        let attributes: Vec<_> = self
                            .stream_labels(&stream.labels, batch.seq)
                            .into_iter()
                            .map(|(key, value)| json!({"key": key, "value": {"stringValue": value}}))
                            .collect();
                        let records: Vec<_> = stream
                            .entries
                            .iter()
                            .map(|e| {
                                json!({
                                    "timeUnixNano": e.timestamp.to_string(),
                                    "body": {"stringValue": e.line},
                                })
                            })
                            .collect();
                        json!({
                            "resource": {"attributes": attributes},
                            "scopeLogs": [{
                                "scope": {"name": OTLP_SCOPE_NAME},
                                "logRecords": records,
                            }],
                        })
                    })
                    .collect();
                serde_json::to_vec(&json!({ "resourceLogs": resource_logs }))
            }
        }
        .map_err(|e| PushError::Encode(e.to_string()))?;

        match self.settings.compression_level {
            Some(level) => zstd::encode_all(body.as_slice(), level)
                .map_err(|e| PushError::Encode(format!("zstd: {e}"))),
            None => Ok(body),
        }
    }
}

#[async_trait]
impl Pusher for HttpPusher {
    async fn push(&self, batch: &Batch) -> Result<(), PushError> {
        let body = self.encode(batch)?;
        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .body(body);
        if let Some(auth) = &self.settings.basic_auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        } else if let Some(token) = &self.settings.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PushError::Transient(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(PushError::Transient(format!("status {status}")));
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY_LEN {
            let mut cut = MAX_ERROR_BODY_LEN;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(PushError::Permanent {
            status: status.as_u16(),
            body,
        })
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn build_headers(settings: &PushSettings) -> Result<HeaderMap, PushError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if settings.compression_level.is_some() {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
    }
    for (name, value) in &settings.headers {
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(name, &e))?;
        let value = HeaderValue::from_str(value).map_err(|e| invalid(name, &e))?;
        headers.insert(header, value);
    }
    if let Some(tenant_id) = &settings.tenant_id {
        let name = &settings.tenant_header;
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(name, &e))?;
        let value = HeaderValue::from_str(tenant_id).map_err(|e| invalid(name, &e))?;
        headers.insert(header, value);
    }
    Ok(headers)
}

fn invalid(name: &str, e: &dyn std::fmt::Display) -> PushError {
    PushError::Encode(format!("invalid header {name}: {e}"))
}
