// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::time::Duration;

use async_trait::async_trait;
use rand::RngCore;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::error::{NetError, NetworkError, Result};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(20_000);

pub const CLIENT_VERSION_HEADER: &str = "X-Client-Version";
pub const CLIENT_TYPE_HEADER: &str = "X-Client-Type";
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";
pub const REQUEST_ID_PREFIX: &str = "quorum_";

pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Clone)]
pub struct NodeRequest {
    pub url: String,
    pub path: String,
    pub body: Value,
    pub headers: Vec<(String, String)>,
}

impl NodeRequest {
    pub fn new(url: &str, path: &str, body: Value, request_id: &str) -> Self {
        Self {
            url: url.to_string(),
            path: path.to_string(),
            body,
            headers: vec![
                ("Accept".into(), "application/json".into()),
                (
                    CLIENT_VERSION_HEADER.into(),
                    env!("CARGO_PKG_VERSION").into(),
                ),
                (CLIENT_TYPE_HEADER.into(), "rust".into()),
                (
                    REQUEST_ID_HEADER.into(),
                    format!("{REQUEST_ID_PREFIX}{request_id}"),
                ),
            ],
        }
    }

    pub fn full_url(&self) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), self.path)
    }
}

/// A node's answer. Rejections are data, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeReply {
    Accepted(Value),
    Rejected { status: u16, body: Option<Value> },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &NodeRequest,
        timeout: Duration,
    ) -> std::result::Result<NodeReply, NetworkError>;
}

pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| NetError::InvalidConfig(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn post(
        &self,
        request: &NodeRequest,
        url: &str,
    ) -> std::result::Result<NodeReply, NetworkError> {
        let mut builder = self.client.post(url).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| classify(url, e))?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| classify(url, e))?;

        if status.is_success() {
            serde_json::from_slice(&bytes)
                .map(NodeReply::Accepted)
                .map_err(|e| NetworkError::malformed(url, format!("invalid JSON body: {e}")))
        } else {
            Ok(NodeReply::Rejected {
                status: status.as_u16(),
                body: serde_json::from_slice(&bytes).ok(),
            })
        }
    }
}

fn classify(url: &str, e: reqwest::Error) -> NetworkError {
    if e.is_timeout() {
        NetworkError::timeout(url, e.to_string())
    } else if e.is_decode() || e.is_body() {
        NetworkError::malformed(url, e.to_string())
    } else {
        NetworkError::connection(url, e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &NodeRequest,
        timeout: Duration,
    ) -> std::result::Result<NodeReply, NetworkError> {
        let url = request.full_url();
        debug!(url = %url, timeout_ms = timeout.as_millis(), "Sending node request");
        match tokio::time::timeout(timeout, self.post(request, &url)).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::timeout(
                &url,
                format!("no response within {}ms", timeout.as_millis()),
            )),
        }
    }
}
