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

//! Combines the local `DataManager` with an optional fanout, per spec
//! §4.6: populate sources from the Registry when the caller left them
//! blank, query local and remote in parallel, merge, and compute the
//! final HTTP status from both sides' outcomes.

use chrono::DateTime;
use countermesh_core::util::glob_match;
use countermesh_core::{
    BatchQueryRequest, BatchQueryResponse, CounterInfoResponse, CounterQueryResponse,
    DimensionSpec, QueryError, QueryResult, RequestDetails, RequestStatus, ServerInfo, SubQuery,
    TieredRequest,
};
use countermesh_query::{BatchAggregator, CounterAggregator, CounterInfoCombiner, DiagnosticsMode};
use countermesh_storage::DataManager;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

use crate::fanout::FanoutEngine;
use crate::registry::Registry;
use crate::transport::Transport;

/// Combines the local `DataManager` with a `FanoutEngine` per spec §4.6.
/// Event tracing for the network leg lives on `FanoutEngine` itself; this
/// type only owns the merge/status logic sitting above it.
pub struct QueryHandler<T: Transport> {
    data_manager: Arc<dyn DataManager>,
    fanout: Arc<FanoutEngine<T>>,
    registry: Arc<Registry>,
    local_server: ServerInfo,
    /// Whether this node acts as a query-aggregator (spec §4.6 step 1):
    /// gates whether missing `sources` get auto-populated from the
    /// Registry at all, independent of whether the Registry happens to
    /// have any peers.
    query_aggregator: bool,
}

impl<T: Transport + 'static> QueryHandler<T> {
    pub fn new(
        data_manager: Arc<dyn DataManager>,
        fanout: Arc<FanoutEngine<T>>,
        registry: Arc<Registry>,
        local_server: ServerInfo,
        query_aggregator: bool,
    ) -> Self {
        Self {
            data_manager,
            fanout,
            registry,
            local_server,
            query_aggregator,
        }
    }

    pub async fn handle_counter_query(
        &self,
        counter: &str,
        mut request: TieredRequest,
    ) -> QueryResult<CounterQueryResponse> {
        let diagnostics = request.include_request_diagnostics;
        let collapse = dimension_flag(&request.dimensions, "aggregate");

        let aggregator = Arc::new(CounterAggregator::new());
        // Side effect only: records percentile intent (or errors on a
        // malformed value) for `get_response` later. The request's own
        // dimensions are untouched — local query, source population, and
        // what gets sent downstream all still need `start`/`end` and any
        // machineFunction/datacenter filters (matches `BatchAggregator::new`'s
        // handling of the same reserved key).
        aggregator.apply_percentile_calculation_aggregation(Some(&request.dimensions))?;

        self.populate_sources_if_aggregator(&mut request);
        let has_remote = !request.sources.is_empty();

        let (local_samples, local_detail) = self.query_local(counter, &request.dimensions).await;
        let local_resp = CounterQueryResponse {
            http_code: local_detail.http_code,
            error: None,
            user_context: None,
            samples: local_samples,
            details: if diagnostics { vec![local_detail.clone()] } else { vec![] },
        };
        aggregator.add_machine_response(&local_resp)?;

        if has_remote {
            let sink_aggregator = aggregator.clone();
            let path_counter = counter.to_string();
            self.fanout
                .run::<TieredRequest, CounterQueryResponse>(
                    &request,
                    move |_server| format!("/counters/{}/query", path_counter),
                    move |resp| {
                        if let Err(e) = sink_aggregator.add_machine_response(&resp) {
                            tracing::warn!(error = %e, "failed to merge fanout response");
                        }
                    },
                )
                .await;
        }

        let response = aggregator.get_response(collapse)?;
        Ok(finalize(response, diagnostics, &local_detail))
    }

    pub async fn handle_counter_info(
        &self,
        counter: &str,
        mut request: TieredRequest,
    ) -> QueryResult<CounterInfoResponse> {
        let diagnostics = request.include_request_diagnostics;
        self.populate_sources_if_aggregator(&mut request);
        let has_remote = !request.sources.is_empty();

        let local_info = match self.data_manager.info(counter).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(counter, error = %e, "local info lookup failed");
                None
            }
        };
        let local_detail = RequestDetails::new(
            self.local_server.clone(),
            RequestStatus::Success,
            if local_info.is_some() { 200 } else { 404 },
            "local info lookup",
            true,
        );
        let local_resp = CounterInfoResponse {
            http_code: if local_info.is_some() { 200 } else { 404 },
            error: None,
            info: local_info,
            details: if diagnostics { vec![local_detail] } else { vec![] },
        };

        let mut collected = vec![local_resp];

        if has_remote {
            let collected_arc = Arc::new(Mutex::new(Vec::new()));
            let sink_collected = collected_arc.clone();
            let path_counter = counter.to_string();
            self.fanout
                .run::<TieredRequest, CounterInfoResponse>(
                    &request,
                    move |_server| format!("/counters/{}/info", path_counter),
                    move |resp| sink_collected.lock().push(resp),
                )
                .await;
            collected.extend(Arc::try_unwrap(collected_arc).map(|m| m.into_inner()).unwrap_or_default());
        }

        let mode = if diagnostics {
            DiagnosticsMode::Aggregate
        } else {
            DiagnosticsMode::Drop
        };
        Ok(CounterInfoCombiner::new(mode).combine(&collected))
    }

    pub async fn handle_batch_query(
        &self,
        mut request: BatchQueryRequest,
    ) -> QueryResult<BatchQueryResponse> {
        let diagnostics = request.include_request_diagnostics;
        for query in request.queries.iter_mut() {
            if query.user_context.is_empty() {
                query.user_context = Uuid::new_v4().to_string();
            }
        }

        let batch = Arc::new(BatchAggregator::new(&request.queries)?);
        self.populate_batch_sources_if_aggregator(&mut request);
        let has_remote = !request.sources.is_empty();

        let mut local_responses = Vec::with_capacity(request.queries.len());
        let mut local_details = Vec::with_capacity(request.queries.len());
        for query in &request.queries {
            let (samples, detail) = self.query_local(&query.counter, &query.dimensions).await;
            local_responses.push(CounterQueryResponse {
                http_code: detail.http_code,
                error: None,
                user_context: Some(query.user_context.clone()),
                samples,
                details: if diagnostics { vec![detail.clone()] } else { vec![] },
            });
            local_details.push(detail);
        }
        batch.add_response(&BatchQueryResponse {
            responses: local_responses,
            details: Vec::new(),
        })?;

        if has_remote {
            let sink_batch = batch.clone();
            self.fanout
                .run::<BatchQueryRequest, BatchQueryResponse>(
                    &request,
                    |_server| "/batchQuery".to_string(),
                    move |resp| {
                        if let Err(e) = sink_batch.add_response(&resp) {
                            tracing::warn!(error = %e, "failed to merge fanout batch response");
                        }
                    },
                )
                .await;
        }

        let mut response = batch.get_response()?;
        // `BatchAggregator` preserves the order `request.queries` was
        // supplied in, so responses line up positionally with `local_details`.
        for (local_detail, sub_resp) in local_details.iter().zip(response.responses.iter_mut()) {
            let samples_present = !sub_resp.samples.is_empty();
            let mut details_for_status = sub_resp.details.clone();
            if !diagnostics {
                details_for_status.push(local_detail.clone());
            }
            sub_resp.http_code = compute_status(samples_present, &details_for_status);
        }
        Ok(response)
    }

    async fn query_local(
        &self,
        counter: &str,
        dimensions: &DimensionSpec,
    ) -> (Vec<countermesh_core::DataSample>, RequestDetails) {
        let (start, end) = match parse_time_window(dimensions) {
            Ok(window) => window,
            Err(e) => {
                return (
                    Vec::new(),
                    RequestDetails::new(self.local_server.clone(), RequestStatus::ServerFailureResponse, 400, e.to_string(), true),
                );
            }
        };
        let match_dims = strip_reserved_dimensions(dimensions);

        match self.data_manager.query(counter, &match_dims, start, end).await {
            Ok(samples) => (
                samples,
                RequestDetails::new(self.local_server.clone(), RequestStatus::Success, 200, "local query ok", true),
            ),
            Err(e) => {
                tracing::warn!(counter, error = %e, "local query failed");
                let (status, code) = map_query_error(&e);
                (Vec::new(), RequestDetails::new(self.local_server.clone(), status, code, e.to_string(), true))
            }
        }
    }

    /// Spec §4.6 step 1: a fanout only starts when the caller supplied
    /// sources, or this node is configured as a query-aggregator and has
    /// known peers to fan out to.
    fn populate_sources_if_aggregator(&self, request: &mut TieredRequest) {
        if !request.sources.is_empty() || !self.query_aggregator || self.registry.is_empty() {
            return;
        }
        let mf_glob = request.dimensions.get("machineFunction").map(str::to_string);
        let dc_glob = request.dimensions.get("datacenter").map(str::to_string);
        request.sources = filter_peers(self.registry.list(), mf_glob.as_deref(), dc_glob.as_deref());
    }

    fn populate_batch_sources_if_aggregator(&self, request: &mut BatchQueryRequest) {
        if !request.sources.is_empty() || !self.query_aggregator || self.registry.is_empty() {
            return;
        }
        request.sources = self.registry.list();
    }
}

/// Reserved query-modifier keys (spec §6's reserved dimensions table)
/// that are never real dimension tags a sample was written under, so
/// they must not take part in bucket-key matching against the store.
const RESERVED_DIMENSIONS: &[&str] = &["start", "end", "dimension", "aggregate", "percentile", "machineFunction", "datacenter"];

fn strip_reserved_dimensions(dims: &DimensionSpec) -> DimensionSpec {
    let mut stripped = dims.clone();
    for key in RESERVED_DIMENSIONS {
        stripped.take(key);
    }
    stripped
}

fn filter_peers(peers: Vec<ServerInfo>, mf_glob: Option<&str>, dc_glob: Option<&str>) -> Vec<ServerInfo> {
    peers
        .into_iter()
        .filter(|s| {
            mf_glob
                .map(|g| s.machine_function.as_deref().is_some_and(|mf| glob_match(g, mf)))
                .unwrap_or(true)
                && dc_glob
                    .map(|g| s.datacenter.as_deref().is_some_and(|dc| glob_match(g, dc)))
                    .unwrap_or(true)
        })
        .collect()
}

fn dimension_flag(dims: &DimensionSpec, name: &str) -> bool {
    dims.get(name).map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

fn parse_timestamp(raw: &str) -> QueryResult<u64> {
    if let Ok(ms) = raw.parse::<u64>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp_millis().max(0) as u64)
        .map_err(|_| QueryError::InvalidDimension(format!("unparseable timestamp: {raw}")))
}

fn parse_time_window(dims: &DimensionSpec) -> QueryResult<(u64, u64)> {
    let start = match dims.get("start") {
        Some(v) => parse_timestamp(v)?,
        None => 0,
    };
    let end = match dims.get("end") {
        Some(v) => parse_timestamp(v)?,
        None => u64::MAX,
    };
    Ok((start, end))
}

fn map_query_error(err: &QueryError) -> (RequestStatus, u16) {
    match err {
        QueryError::InvalidDimension(_) => (RequestStatus::ServerFailureResponse, 400),
        QueryError::CounterNotFound(_) => (RequestStatus::ServerFailureResponse, 404),
        _ => (RequestStatus::ServerFailureResponse, 500),
    }
}

/// Spec §4.6 step 4: OK if samples exist; else, among rows that actually
/// failed, a single code every one agrees on; else a generic conflict.
/// No samples and no failing rows just means nobody had data: 404, the
/// same default `CounterAggregator::get_response` uses for an empty merge.
fn compute_status(samples_present: bool, details: &[RequestDetails]) -> u16 {
    if samples_present {
        return 200;
    }
    let mut failure_codes = details
        .iter()
        .filter(|d| d.status != RequestStatus::Success)
        .map(|d| d.http_code);
    let Some(first) = failure_codes.next() else {
        return 404;
    };
    if failure_codes.all(|c| c == first) {
        first
    } else {
        409
    }
}

fn finalize(mut response: CounterQueryResponse, diagnostics: bool, local_detail: &RequestDetails) -> CounterQueryResponse {
    let samples_present = !response.samples.is_empty();
    let mut details_for_status = response.details.clone();
    if !diagnostics {
        details_for_status.push(local_detail.clone());
    }
    response.http_code = compute_status(samples_present, &details_for_status);
    response
}
