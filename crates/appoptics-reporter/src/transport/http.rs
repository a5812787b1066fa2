// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector transport over HTTP with protobuf bodies.
//!
//! Each collector call maps to a `POST` on its own path. Request and response bodies
//! are the protobuf encodings of the collector messages. Any non-success HTTP status is
//! a transport error; collector-level outcomes are carried by the result code inside a
//! successfully decoded response.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use appoptics_collector_proto::{MessageRequest, MessageResult, SettingsRequest, SettingsResult};
use async_trait::async_trait;
use prost::Message;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Certificate, Client};
use tracing::debug;

use crate::error::TransportError;
use crate::transport::{CollectorClient, Dialer};

pub const EVENTS_ENDPOINT: &str = "/v1/events";
pub const METRICS_ENDPOINT: &str = "/v1/metrics";
pub const STATUS_ENDPOINT: &str = "/v1/status";
pub const SETTINGS_ENDPOINT: &str = "/v1/settings";

const API_KEY_HEADER: &str = "x-api-key";
const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// How collector channels are built.
#[derive(Debug, Clone)]
pub struct HttpDialerOptions {
    pub api_key: String,
    /// Extra PEM root certificate trusted on top of the built-in roots.
    pub trusted_cert_path: Option<PathBuf>,
    /// Use `http://` instead of `https://`. Only meant for local collectors.
    pub plaintext: bool,
    pub timeout: Duration,
}

impl Default for HttpDialerOptions {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            trusted_cert_path: None,
            plaintext: false,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpDialer {
    options: HttpDialerOptions,
}

impl HttpDialer {
    pub fn new(options: HttpDialerOptions) -> Self {
        Self { options }
    }

    fn dial_error(addr: &str, reason: impl Into<String>) -> TransportError {
        TransportError::Dial {
            addr: addr.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Dialer for HttpDialer {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn CollectorClient>, TransportError> {
        let mut builder = Client::builder().timeout(self.options.timeout);

        if let Some(path) = &self.options.trusted_cert_path {
            let pem = std::fs::read(path).map_err(|e| {
                Self::dial_error(addr, format!("no cert file found at {}: {e}", path.display()))
            })?;
            let cert = Certificate::from_pem(&pem).map_err(|e| {
                Self::dial_error(addr, format!("unable to parse certificate: {e}"))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| Self::dial_error(addr, e.to_string()))?;

        let scheme = if self.options.plaintext { "http" } else { "https" };
        let base_url = format!("{scheme}://{}", addr.trim_end_matches('/'));

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("appoptics-reporter/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|e| Self::dial_error(addr, e.to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(PROTOBUF_CONTENT_TYPE));
        headers.insert(
            API_KEY_HEADER,
            HeaderValue::from_str(&self.options.api_key)
                .map_err(|_| Self::dial_error(addr, "service key is not a valid header value"))?,
        );

        debug!("dialed collector at {base_url}");
        Ok(Arc::new(HttpCollectorClient {
            client,
            base_url,
            headers,
        }))
    }
}

pub struct HttpCollectorClient {
    client: Client,
    base_url: String,
    headers: HeaderMap,
}

impl HttpCollectorClient {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<Req, Res>(&self, path: &str, request: &Req) -> Result<Res, TransportError>
    where
        Req: Message,
        Res: Message + Default,
    {
        let url = format!("{}{}", self.base_url, path);
        let body = request.encode_to_vec();
        debug!(
            url = %url,
            headers = ?redact_headers(&self.headers),
            body_len = body.len(),
            "collector request"
        );

        let response = self
            .client
            .post(&url)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            debug!(
                url = %url,
                status = %status,
                body = %String::from_utf8_lossy(&body),
                "collector response"
            );
            return Err(TransportError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        debug!(url = %url, status = %status, body_len = body.len(), "collector response");
        Ok(Res::decode(body)?)
    }
}

#[async_trait]
impl CollectorClient for HttpCollectorClient {
    async fn post_events(&self, request: MessageRequest) -> Result<MessageResult, TransportError> {
        self.post(EVENTS_ENDPOINT, &request).await
    }

    async fn post_metrics(
        &self,
        request: MessageRequest,
    ) -> Result<MessageResult, TransportError> {
        self.post(METRICS_ENDPOINT, &request).await
    }

    async fn post_status(&self, request: MessageRequest) -> Result<MessageResult, TransportError> {
        self.post(STATUS_ENDPOINT, &request).await
    }

    async fn get_settings(
        &self,
        request: SettingsRequest,
    ) -> Result<SettingsResult, TransportError> {
        self.post(SETTINGS_ENDPOINT, &request).await
    }
}

/// Request headers as logged: credentials are never written out.
fn redact_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    const SENSITIVE_HEADERS: [&str; 2] = [API_KEY_HEADER, "authorization"];

    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.as_str().to_ascii_lowercase();
            let display = if SENSITIVE_HEADERS.contains(&lower.as_str()) {
                "<redacted>".to_string()
            } else {
                value
                    .to_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| "<non-utf8>".to_string())
            };
            (lower, display)
        })
        .collect()
}
