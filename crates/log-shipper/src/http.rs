// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client construction for backend pushes.
//!
//! Every delivery client gets its own `reqwest::Client` so that TLS material
//! and timeouts can differ per backend. The builder applies:
//! - the request timeout
//! - connection pooling with a 270s idle timeout and TCP keep-alive
//! - CA bundle, client identity, protocol version bounds and skip-verify
//! - a server name override: the request URL is rewritten to the server name
//!   and that name is pinned to the addresses of the configured host

use core::time::Duration;
use reqwest::{tls, Certificate, Identity, Url};
use serde::Deserialize;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid TLS configuration: {0}")]
    Tls(String),
    #[error("invalid endpoint {0}")]
    InvalidUrl(String),
    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub server_name: Option<String>,
    /// "1.2" or "1.3".
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub tls: TlsSettings,
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            timeout: Duration::from_secs(10),
            tls: TlsSettings::default(),
        }
    }
}

/// Builds the client for `endpoint`. Returns the URL requests must be sent
/// to, which differs from `endpoint` when a server name override is set.
pub fn build_client(
    settings: &HttpSettings,
    endpoint: &str,
) -> Result<(reqwest::Client, Url), HttpClientError> {
    let mut url =
        Url::parse(endpoint).map_err(|e| HttpClientError::InvalidUrl(format!("{endpoint}: {e}")))?;

    let mut client = reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(settings.timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    let tls = &settings.tls;
    if let Some(ca_file) = &tls.ca_file {
        let pem = read(ca_file)?;
        for cert in Certificate::from_pem_bundle(&pem)? {
            client = client.add_root_certificate(cert);
        }
    }

    match (&tls.cert_file, &tls.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let mut pem = read(cert_file)?;
            pem.push(b'\n');
            pem.extend(read(key_file)?);
            client = client.identity(Identity::from_pem(&pem)?);
        }
        (None, None) => {}
        _ => {
            return Err(HttpClientError::Tls(
                "cert_file and key_file must be set together".to_string(),
            ))
        }
    }

    if let Some(version) = &tls.min_version {
        client = client.min_tls_version(parse_tls_version(version)?);
    }
    if let Some(version) = &tls.max_version {
        client = client.max_tls_version(parse_tls_version(version)?);
    }
    if tls.insecure_skip_verify {
        client = client.danger_accept_invalid_certs(true);
    }

    if let Some(server_name) = &tls.server_name {
        let host = url
            .host_str()
            .ok_or_else(|| HttpClientError::InvalidUrl(endpoint.to_string()))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(443);
        let addrs: Vec<_> = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| HttpClientError::Resolve {
                host: host.clone(),
                reason: e.to_string(),
            })?
            .collect();
        debug!("CLIENT | Pinning {server_name} to {addrs:?} for {endpoint}");
        client = client.resolve_to_addrs(server_name, &addrs);
        url.set_host(Some(server_name))
            .map_err(|e| HttpClientError::InvalidUrl(format!("{server_name}: {e}")))?;
    }

    Ok((client.build()?, url))
}

fn read(path: &Path) -> Result<Vec<u8>, HttpClientError> {
    std::fs::read(path).map_err(|source| HttpClientError::Read {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse_tls_version(raw: &str) -> Result<tls::Version, HttpClientError> {
    match raw.trim().trim_start_matches("TLS").trim_start_matches("tls") {
        "1.0" | "10" => Ok(tls::Version::TLS_1_0),
        "1.1" | "11" => Ok(tls::Version::TLS_1_1),
        "1.2" | "12" => Ok(tls::Version::TLS_1_2),
        "1.3" | "13" => Ok(tls::Version::TLS_1_3),
        other => Err(HttpClientError::Tls(format!(
            "unknown TLS version {other:?}, expected one of 1.0, 1.1, 1.2, 1.3"
        ))),
    }
}
