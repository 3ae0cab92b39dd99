// Copyright 2025 CounterMesh Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Outbound HTTP as a trait, so `FanoutEngine`/`RegistrationClient` never
//! touch a process-wide HTTP client directly (spec §9's "mutable
//! globals" note). Production wires `ReqwestTransport`; tests inject
//! `MockTransport`.

use async_trait::async_trait;
use bytes::Bytes;
use countermesh_core::ServerInfo;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accept {
    Json,
    BondCompactBinary,
}

impl Accept {
    pub fn content_type(self) -> &'static str {
        match self {
            Accept::Json => "application/json",
            Accept::BondCompactBinary => "application/bond-compact-binary",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
    pub content_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(
        &self,
        target: &ServerInfo,
        path: &str,
        body: Bytes,
        accept: Accept,
        deadline: Instant,
    ) -> Result<TransportResponse, TransportError>;
}

/// Production transport backed by a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post(
        &self,
        target: &ServerInfo,
        path: &str,
        body: Bytes,
        accept: Accept,
        deadline: Instant,
    ) -> Result<TransportResponse, TransportError> {
        let url = format!("http://{}:{}{}", target.hostname, target.port, path);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Timeout);
        }

        let request = self
            .client
            .post(&url)
            .header("Accept", accept.content_type())
            .header("Content-Type", accept.content_type())
            .body(body)
            .timeout(remaining);

        match tokio::time::timeout(remaining, request.send()).await {
            Ok(Ok(resp)) => {
                let status = resp.status().as_u16();
                let content_type = resp
                    .headers()
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = resp
                    .bytes()
                    .await
                    .map_err(|e| TransportError::Network(e.to_string()))?;
                Ok(TransportResponse {
                    status,
                    body,
                    content_type,
                })
            }
            Ok(Err(e)) => Err(TransportError::Network(e.to_string())),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

/// Scripted responses for a given path, consumed in order. Built for
/// `FanoutEngine`/`RegistrationClient` unit tests.
pub struct MockTransport {
    responses: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    default_ok: bool,
}

impl MockTransport {
    pub fn new(responses: Vec<Result<TransportResponse, TransportError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            default_ok: false,
        }
    }

    /// A transport that answers every request with an empty 200, useful
    /// when the test only cares about call count/timing.
    pub fn always_ok() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_ok: true,
        }
    }

    pub fn always_timeout() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            default_ok: false,
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn post(
        &self,
        _target: &ServerInfo,
        _path: &str,
        _body: Bytes,
        _accept: Accept,
        deadline: Instant,
    ) -> Result<TransportResponse, TransportError> {
        let mut queue = self.responses.lock().await;
        if let Some(next) = queue.pop_front() {
            return next;
        }
        drop(queue);

        if self.default_ok {
            return Ok(TransportResponse {
                status: 200,
                body: Bytes::new(),
                content_type: Some("application/json".to_string()),
            });
        }

        // No scripted response and no default: behave like a hang that
        // the caller's own deadline eventually cuts off.
        tokio::time::sleep_until(deadline).await;
        Err(TransportError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_transport_replays_scripted_responses_in_order() {
        let transport = MockTransport::new(vec![
            Ok(TransportResponse {
                status: 200,
                body: Bytes::from_static(b"first"),
                content_type: None,
            }),
            Ok(TransportResponse {
                status: 404,
                body: Bytes::new(),
                content_type: None,
            }),
        ]);

        let target = ServerInfo::new("h", 1);
        let deadline = Instant::now() + Duration::from_secs(1);
        let first = transport
            .post(&target, "/x", Bytes::new(), Accept::Json, deadline)
            .await
            .unwrap();
        assert_eq!(first.status, 200);

        let second = transport
            .post(&target, "/x", Bytes::new(), Accept::Json, deadline)
            .await
            .unwrap();
        assert_eq!(second.status, 404);
    }

    #[tokio::test]
    async fn always_ok_never_exhausts() {
        let transport = MockTransport::always_ok();
        let target = ServerInfo::new("h", 1);
        let deadline = Instant::now() + Duration::from_secs(1);
        for _ in 0..3 {
            let resp = transport
                .post(&target, "/x", Bytes::new(), Accept::Json, deadline)
                .await
                .unwrap();
            assert_eq!(resp.status, 200);
        }
    }
}
