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

//! Recursive fanout: splits sources into blocks, elects a leader per
//! block, dispatches one downstream request per block and feeds decoded
//! (or synthesized) responses into a sink. All blocks run concurrently;
//! a block's own lifecycle never blocks another block's.

use bytes::Bytes;
use countermesh_core::{
    BatchQueryResponse, CounterInfoResponse, CounterQueryResponse, EventId, FanoutEnvelope,
    RequestDetails, RequestStatus, ServerInfo, SharedTracer,
};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::codec::{BondCompactCodec, Decoder, Encoder};
use crate::transport::{Accept, Transport, TransportError};

/// A response type the engine can fabricate in place of a real decode,
/// to carry synthesized diagnostic rows for a failed block.
pub trait SyntheticResponse {
    fn synthetic(details: Vec<RequestDetails>) -> Self;
}

impl SyntheticResponse for CounterQueryResponse {
    fn synthetic(details: Vec<RequestDetails>) -> Self {
        let mut resp = Self::empty(0);
        resp.details = details;
        resp
    }
}

impl SyntheticResponse for CounterInfoResponse {
    fn synthetic(details: Vec<RequestDetails>) -> Self {
        Self {
            http_code: 0,
            error: None,
            info: None,
            details,
        }
    }
}

impl SyntheticResponse for BatchQueryResponse {
    fn synthetic(details: Vec<RequestDetails>) -> Self {
        Self {
            responses: Vec::new(),
            details,
        }
    }
}

pub struct FanoutEngine<T: Transport> {
    transport: Arc<T>,
    tracer: SharedTracer,
    timeout_scale_factor: f64,
}

impl<T: Transport + 'static> FanoutEngine<T> {
    /// `timeout_scale_factor` is the fraction of the remaining local
    /// timeout handed down to a block's leader (spec §4.5), read from
    /// `FanoutConfig::timeout_scale_factor`.
    pub fn new(transport: Arc<T>, tracer: SharedTracer, timeout_scale_factor: f64) -> Self {
        Self { transport, tracer, timeout_scale_factor }
    }

    /// Partition `sources` per spec §4.5: singleton blocks when the
    /// fleet fits within `max_fanout`, otherwise exactly `max_fanout`
    /// contiguous blocks over the name-sorted list.
    pub fn split_blocks(sources: &[ServerInfo], max_fanout: u32) -> Vec<Vec<ServerInfo>> {
        let max_fanout = (max_fanout as usize).max(1);
        if sources.len() <= max_fanout {
            return sources.iter().cloned().map(|s| vec![s]).collect();
        }

        let mut sorted = sources.to_vec();
        sorted.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        let n = sorted.len();
        let mut blocks: Vec<Vec<ServerInfo>> = vec![Vec::new(); max_fanout];
        for (i, server) in sorted.into_iter().enumerate() {
            let idx = (i * max_fanout / n).min(max_fanout - 1);
            blocks[idx].push(server);
        }
        blocks
    }

    /// Run the fanout for `request`, POSTing the narrowed per-block
    /// request to `path(leader)` and feeding every decoded or
    /// synthesized response to `sink`.
    pub async fn run<Req, Resp>(
        &self,
        request: &Req,
        path: impl Fn(&ServerInfo) -> String + Send + Sync + 'static,
        sink: impl Fn(Resp) + Send + Sync + 'static,
    ) where
        Req: FanoutEnvelope + Serialize + Send + Sync + 'static,
        Resp: DeserializeOwned + SyntheticResponse + Send + 'static,
    {
        let sources = request.sources().to_vec();
        let blocks = Self::split_blocks(&sources, request.max_fanout());
        let diagnostics_enabled = request.include_request_diagnostics();
        let overall_deadline = Instant::now() + Duration::from_millis(request.fanout_timeout_ms());
        let scaled_timeout_ms =
            (request.fanout_timeout_ms() as f64 * self.timeout_scale_factor).max(0.0) as u64;

        let path = Arc::new(path);
        let sink = Arc::new(sink);

        let mut tasks = Vec::new();
        for block in blocks.into_iter().filter(|b| !b.is_empty()) {
            let request = request.clone();
            let transport = self.transport.clone();
            let tracer = self.tracer.clone();
            let path = path.clone();
            let sink = sink.clone();

            tasks.push(tokio::spawn(async move {
                run_block(
                    transport,
                    tracer,
                    request,
                    block,
                    scaled_timeout_ms,
                    overall_deadline,
                    diagnostics_enabled,
                    path.as_ref(),
                    sink.as_ref(),
                )
                .await;
            }));
        }

        let _ = futures::future::join_all(tasks).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_block<T, Req, Resp>(
    transport: Arc<T>,
    tracer: SharedTracer,
    request: Req,
    mut block: Vec<ServerInfo>,
    scaled_timeout_ms: u64,
    overall_deadline: Instant,
    diagnostics_enabled: bool,
    path: &(impl Fn(&ServerInfo) -> String + ?Sized),
    sink: &(impl Fn(Resp) + ?Sized),
) where
    T: Transport,
    Req: FanoutEnvelope + Serialize,
    Resp: DeserializeOwned + SyntheticResponse,
{
    let leader_idx = rand::thread_rng().gen_range(0..block.len());
    let leader = block.remove(leader_idx);
    let others = block;

    tracer.event(
        EventId::FanoutBlockDispatched,
        &[
            ("leader", leader.hostname.clone().into()),
            ("leader_node_id", leader.node_id.clone().into()),
        ],
    );

    let narrowed = request.narrowed(others.clone(), scaled_timeout_ms);
    let codec = BondCompactCodec;
    let body: Bytes = match codec.encode(&narrowed) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode narrowed fanout request");
            return;
        }
    };

    let result = transport
        .post(
            &leader,
            &path(&leader),
            body,
            Accept::BondCompactBinary,
            overall_deadline,
        )
        .await;

    match result {
        Ok(resp) if (200..300).contains(&resp.status) => match codec.decode::<Resp>(&resp.body) {
            Ok(decoded) => {
                sink(decoded);
            }
            Err(e) => {
                tracing::warn!(leader = %leader, error = %e, "failed to decode fanout response");
                tracer.event(
                    EventId::FanoutLeaderFailed,
                    &[("leader", leader.hostname.clone().into()), ("reason", e.to_string().into())],
                );
                emit_failure(
                    &leader,
                    &others,
                    RequestStatus::RequestException,
                    0,
                    &e.to_string(),
                    diagnostics_enabled,
                    sink,
                );
            }
        },
        Ok(resp) if resp.status == 404 => {
            emit_failure(
                &leader,
                &others,
                RequestStatus::ServerFailureResponse,
                404,
                "not found",
                diagnostics_enabled,
                sink,
            );
        }
        Ok(resp) => {
            let status = resp.status;
            tracer.event(
                EventId::FanoutLeaderFailed,
                &[("leader", leader.hostname.clone().into()), ("status", (status as i64).into())],
            );
            emit_failure_asymmetric(
                &leader,
                &others,
                RequestStatus::ServerFailureResponse,
                status,
                "non-2xx from leader",
                RequestStatus::FederationError,
                0,
                diagnostics_enabled,
                sink,
            );
        }
        Err(TransportError::Timeout) => {
            tracer.event(
                EventId::FanoutLeaderTimedOut,
                &[("leader", leader.hostname.clone().into())],
            );
            emit_failure_asymmetric(
                &leader,
                &others,
                RequestStatus::TimedOut,
                504,
                "timed out",
                RequestStatus::FederationError,
                0,
                diagnostics_enabled,
                sink,
            );
        }
        Err(TransportError::Network(msg)) => {
            tracer.event(
                EventId::FanoutLeaderFailed,
                &[("leader", leader.hostname.clone().into()), ("reason", msg.as_str().into())],
            );
            emit_failure_asymmetric(
                &leader,
                &others,
                RequestStatus::RequestException,
                0,
                &msg,
                RequestStatus::FederationError,
                0,
                diagnostics_enabled,
                sink,
            );
        }
    }

    tracer.event(EventId::FanoutCompleted, &[("block_size", (others.len() as i64 + 1).into())]);
}

#[allow(clippy::too_many_arguments)]
fn emit_failure<Resp: SyntheticResponse>(
    leader: &ServerInfo,
    others: &[ServerInfo],
    status: RequestStatus,
    http_code: u16,
    description: &str,
    diagnostics_enabled: bool,
    sink: &(impl Fn(Resp) + ?Sized),
) {
    emit_failure_asymmetric(
        leader,
        others,
        status,
        http_code,
        description,
        status,
        http_code,
        diagnostics_enabled,
        sink,
    );
}

/// Build diagnostics where the leader row and the other-sources rows
/// may carry different status/code, per the §4.5 failure table.
#[allow(clippy::too_many_arguments)]
fn emit_failure_asymmetric<Resp: SyntheticResponse>(
    leader: &ServerInfo,
    others: &[ServerInfo],
    leader_status: RequestStatus,
    leader_code: u16,
    leader_description: &str,
    other_status: RequestStatus,
    other_code: u16,
    diagnostics_enabled: bool,
    sink: &(impl Fn(Resp) + ?Sized),
) {
    if !diagnostics_enabled {
        sink(Resp::synthetic(Vec::new()));
        return;
    }

    let mut details = Vec::with_capacity(others.len() + 1);
    details.push(RequestDetails::new(
        leader.clone(),
        leader_status,
        leader_code,
        leader_description,
        false,
    ));
    for other in others {
        details.push(RequestDetails::new(
            other.clone(),
            other_status,
            other_code,
            "sibling of failed leader",
            false,
        ));
    }
    sink(Resp::synthetic(details));
}
