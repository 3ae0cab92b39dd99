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

//! `DataManager`: the boundary between the fanout/aggregation engine and
//! the local counter store. The store itself (compaction, persistence,
//! on-disk layout) is out of scope — this crate owns only the interface
//! and an in-memory implementation suitable for tests and for a node that
//! hasn't wired a durable backend.

use async_trait::async_trait;
use countermesh_core::{CounterInfo, DataSample, DimensionSpec, QueryResult};

/// Counters and their samples, as seen by the fanout/query layer.
#[async_trait]
pub trait DataManager: Send + Sync {
    /// Samples for `counter` matching `dimensions` (exact bucket-key match;
    /// the caller is responsible for any reserved-dimension filtering)
    /// within `[start, end)`.
    async fn query(
        &self,
        counter: &str,
        dimensions: &DimensionSpec,
        start: u64,
        end: u64,
    ) -> QueryResult<Vec<DataSample>>;

    /// Schema/metadata for `counter`, or `None` if this node has never
    /// seen it.
    async fn info(&self, counter: &str) -> QueryResult<Option<CounterInfo>>;

    /// Append samples produced locally or received via `/write`.
    async fn write(&self, counter: &str, samples: Vec<DataSample>) -> QueryResult<()>;

    /// Raw samples for `counter` in `[start, end)`, defaulting to the
    /// counter's full retained range when either bound is omitted. Used to
    /// serve `/transfer` requests between peers.
    async fn transfer(
        &self,
        counter: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> QueryResult<Vec<DataSample>>;

    /// Every counter this node currently holds data for, for the
    /// `AggregationPoller` to iterate.
    fn known_counters(&self) -> Vec<String>;

    /// The latest sample end-time held locally for `counter`, used to
    /// compute the next pending aggregation window and to populate
    /// registration payloads. `None` if the counter is unknown.
    fn latest_end_time(&self, counter: &str) -> Option<u64>;
}
