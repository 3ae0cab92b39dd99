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

//! Wire-level and in-memory data model for the tiered fanout query engine.
//!
//! Everything here is plain data: construction validates the cross-field
//! invariants from the specification (`end >= start`, non-empty counter
//! names, ...) but the types carry no behavior beyond that. Merge
//! arithmetic lives in [`crate::merge`].

use crate::error::{QueryError, QueryResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Identity of a fleet node, as carried on the wire and stored by the
/// [`Registry`](crate) (registry lives in `countermesh-server`; this is
/// just the value type).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub hostname: String,
    pub port: u16,
    /// Stable random id generated once at process startup. Purely an
    /// operational tie-breaker for leader-election logging; identity for
    /// equality/hashing purposes is still `hostname:port` alone (see the
    /// hand-written impls below), so two `ServerInfo` naming the same
    /// peer still compare equal regardless of which process stamped them.
    #[serde(default = "new_node_id")]
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub machine_function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub datacenter: Option<String>,
}

fn new_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl PartialEq for ServerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.hostname.eq_ignore_ascii_case(&other.hostname) && self.port == other.port
    }
}
impl Eq for ServerInfo {}

impl std::hash::Hash for ServerInfo {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hostname.to_ascii_lowercase().hash(state);
        self.port.hash(state);
    }
}

impl ServerInfo {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            node_id: new_node_id(),
            machine_function: None,
            datacenter: None,
        }
    }

    pub fn with_machine_function(mut self, mf: impl Into<String>) -> Self {
        self.machine_function = Some(mf.into());
        self
    }

    pub fn with_datacenter(mut self, dc: impl Into<String>) -> Self {
        self.datacenter = Some(dc.into());
        self
    }

    /// Key used by the Registry's hostname map; hostnames compare
    /// case-insensitively.
    pub fn registry_key(&self) -> String {
        self.hostname.to_ascii_lowercase()
    }
}

impl std::fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// An ordered name -> value binding. Dimension *names* always compare
/// case-insensitively; dimension *values* compare case-insensitively only
/// where the spec calls for it (bucket matching, dimension_value union) —
/// callers that need that do so explicitly via [`DimensionSpec::bucket_key`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DimensionSpec {
    entries: Vec<(String, String)>,
}

impl DimensionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut spec = Self::default();
        for (k, v) in pairs {
            spec.insert(k, v);
        }
        spec
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            existing.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    /// Case-insensitive lookup by dimension name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Remove and return a reserved dimension by name, case-insensitively.
    /// Used to strip `percentile`/`aggregate`/... before forwarding a
    /// narrowed request downstream.
    pub fn take(&mut self, name: &str) -> Option<String> {
        if let Some(idx) = self
            .entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            Some(self.entries.remove(idx).1)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Canonical key used to decide whether two samples belong in the same
    /// aggregation bucket: names and values lowercased, then sorted by
    /// name so insertion order doesn't matter.
    pub fn bucket_key(&self) -> Vec<(String, String)> {
        let mut normalized: Vec<(String, String)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.to_ascii_lowercase()))
            .collect();
        normalized.sort();
        normalized
    }
}

impl PartialEq for DimensionSpec {
    fn eq(&self, other: &Self) -> bool {
        self.bucket_key() == other.bucket_key()
    }
}
impl Eq for DimensionSpec {}

/// The kind of a data sample; decides which [`crate::merge::SampleMerger`]
/// branch runs. Kept as a flat enum (per the "deep inheritance" design
/// note) rather than a trait object hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleKind {
    HitCount,
    Histogram,
    Average,
    Min,
    Max,
    Percentile,
}

/// Kind-specific payload of a [`DataSample`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SamplePayload {
    HitCount {
        hits: u64,
    },
    Histogram {
        /// bucket boundary -> observation count.
        buckets: BTreeMap<i64, u64>,
        count: u64,
    },
    Average {
        avg: f64,
        n: u64,
    },
    /// Shared by `Min` and `Max`; `SampleKind` decides the comparison
    /// direction used when merging.
    Extremum {
        value: f64,
        count: u64,
    },
    Percentile {
        /// The requested percentile, e.g. `99.9`, or a reserved alias
        /// (`average`/`minimum`/`maximum`) resolved to a value already.
        percentile: f64,
        value: f64,
    },
}

/// One time-bucketed observation of a counter from one machine, or the
/// result of merging several such observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSample {
    pub kind: SampleKind,
    pub dimensions: DimensionSpec,
    pub start: u64,
    pub end: u64,
    pub payload: SamplePayload,
    pub machine_count: u64,
}

impl DataSample {
    pub fn new(
        kind: SampleKind,
        dimensions: DimensionSpec,
        start: u64,
        end: u64,
        payload: SamplePayload,
        machine_count: u64,
    ) -> QueryResult<Self> {
        if end < start {
            return Err(QueryError::InvalidDimension(format!(
                "sample end {end} precedes start {start}"
            )));
        }
        Ok(Self {
            kind,
            dimensions,
            start,
            end,
            payload,
            machine_count,
        })
    }

    /// `(dimensions, start, end)` key used by `CounterAggregator` when it
    /// is not collapsing time buckets.
    pub fn time_bucket_key(&self) -> (Vec<(String, String)>, u64, u64) {
        (self.dimensions.bucket_key(), self.start, self.end)
    }
}

/// Status of one source's contribution to a fanout, per spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Success,
    TimedOut,
    ServerFailureResponse,
    RequestException,
    FederationError,
}

/// One diagnostic row. `RequestDetails` lists are additive: nothing ever
/// mutates a row contributed by a sub-tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDetails {
    pub server: ServerInfo,
    pub status: RequestStatus,
    pub http_code: u16,
    pub status_description: String,
    pub is_aggregator: bool,
}

impl RequestDetails {
    pub fn new(
        server: ServerInfo,
        status: RequestStatus,
        http_code: u16,
        status_description: impl Into<String>,
        is_aggregator: bool,
    ) -> Self {
        Self {
            server,
            status,
            http_code,
            status_description: status_description.into(),
            is_aggregator,
        }
    }
}

/// Response to one counter query, at any tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterQueryResponse {
    pub http_code: u16,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_context: Option<String>,
    pub samples: Vec<DataSample>,
    pub details: Vec<RequestDetails>,
}

impl CounterQueryResponse {
    pub fn empty(http_code: u16) -> Self {
        Self {
            http_code,
            ..Default::default()
        }
    }
}

/// Schema/metadata for one counter, as produced by `CounterInfoCombiner`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterInfo {
    pub counter: String,
    /// Dimension names, normalized lowercase, union across sources.
    pub dimensions: BTreeSet<String>,
    /// dimension name (lowercase) -> observed values (normalized lowercase once, then deduplicated).
    pub dimension_values: BTreeMap<String, BTreeSet<String>>,
    pub start_time: u64,
    pub end_time: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterInfoResponse {
    pub http_code: u16,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub info: Option<CounterInfo>,
    pub details: Vec<RequestDetails>,
}

/// One sub-query inside a [`BatchQueryRequest`]. `user_context` is the
/// merge key: it must be unique within the batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubQuery {
    pub user_context: String,
    pub counter: String,
    pub dimensions: DimensionSpec,
}

/// Anything that carries the common fanout envelope fields, so
/// `FanoutEngine` can narrow either request kind the same way (spec §4.5).
pub trait FanoutEnvelope: Clone {
    fn sources(&self) -> &[ServerInfo];
    fn max_fanout(&self) -> u32;
    fn fanout_timeout_ms(&self) -> u64;
    fn include_request_diagnostics(&self) -> bool;

    /// Clone this request with `sources` replaced and the timeout scaled;
    /// `include_request_diagnostics` is always preserved (see spec §9,
    /// resolved open question #2).
    fn narrowed(&self, sources: Vec<ServerInfo>, timeout_ms: u64) -> Self;
}

/// Request body for `/counters/<name>/query` and `/counters/<name>/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredRequest {
    pub dimensions: DimensionSpec,
    pub sources: Vec<ServerInfo>,
    pub max_fanout: u32,
    pub fanout_timeout_ms: u64,
    pub include_request_diagnostics: bool,
}

impl TieredRequest {
    pub fn new(dimensions: DimensionSpec, max_fanout: u32, fanout_timeout_ms: u64) -> Self {
        Self {
            dimensions,
            sources: Vec::new(),
            max_fanout,
            fanout_timeout_ms,
            include_request_diagnostics: false,
        }
    }
}

impl FanoutEnvelope for TieredRequest {
    fn sources(&self) -> &[ServerInfo] {
        &self.sources
    }
    fn max_fanout(&self) -> u32 {
        self.max_fanout
    }
    fn fanout_timeout_ms(&self) -> u64 {
        self.fanout_timeout_ms
    }
    fn include_request_diagnostics(&self) -> bool {
        self.include_request_diagnostics
    }
    fn narrowed(&self, sources: Vec<ServerInfo>, timeout_ms: u64) -> Self {
        Self {
            dimensions: self.dimensions.clone(),
            sources,
            max_fanout: self.max_fanout,
            fanout_timeout_ms: timeout_ms,
            include_request_diagnostics: self.include_request_diagnostics,
        }
    }
}

/// Request body for `/batchQuery`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchQueryRequest {
    pub queries: Vec<SubQuery>,
    pub sources: Vec<ServerInfo>,
    pub max_fanout: u32,
    pub fanout_timeout_ms: u64,
    pub include_request_diagnostics: bool,
}

impl FanoutEnvelope for BatchQueryRequest {
    fn sources(&self) -> &[ServerInfo] {
        &self.sources
    }
    fn max_fanout(&self) -> u32 {
        self.max_fanout
    }
    fn fanout_timeout_ms(&self) -> u64 {
        self.fanout_timeout_ms
    }
    fn include_request_diagnostics(&self) -> bool {
        self.include_request_diagnostics
    }
    fn narrowed(&self, sources: Vec<ServerInfo>, timeout_ms: u64) -> Self {
        Self {
            queries: self.queries.clone(),
            sources,
            max_fanout: self.max_fanout,
            fanout_timeout_ms: timeout_ms,
            include_request_diagnostics: self.include_request_diagnostics,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchQueryResponse {
    pub responses: Vec<CounterQueryResponse>,
    pub details: Vec<RequestDetails>,
}

/// Body for `/write/<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterWriteRequest {
    pub samples: Vec<DataSample>,
}

/// Body for `/transfer/<name>`; `start`/`end` are normally supplied as
/// query parameters, the body is only needed for edge cases (e.g.
/// resuming a partial transfer).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferRequest {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

/// Body for `/register`: a peer announcing itself and its latest
/// per-counter end-times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRegistration {
    pub server: ServerInfo,
    pub counters: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListServerResponse {
    pub servers: Vec<ServerInfo>,
}

/// Snapshot of one peer as tracked by the Registry. The live, mutable
/// version lives in `countermesh-server::registry` behind a `DashMap`;
/// this is the value type handed to readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub server: ServerInfo,
    pub last_update_ms: u64,
    pub counter_end_times: BTreeMap<String, u64>,
}
