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

//! In-memory `DataManager`, keyed per counter and sharded by dimension
//! bucket key under a `parking_lot::RwLock`. No persistence, no
//! compaction — a test double and a reference node for deployments that
//! haven't wired a durable backend.

use crate::data_manager::DataManager;
use async_trait::async_trait;
use countermesh_core::{CounterInfo, DataSample, DimensionSpec, QueryResult};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Default)]
struct CounterState {
    samples: RwLock<Vec<DataSample>>,
}

#[derive(Default)]
pub struct InMemoryDataManager {
    counters: DashMap<String, CounterState>,
}

impl InMemoryDataManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataManager for InMemoryDataManager {
    async fn query(
        &self,
        counter: &str,
        dimensions: &DimensionSpec,
        start: u64,
        end: u64,
    ) -> QueryResult<Vec<DataSample>> {
        let Some(state) = self.counters.get(counter) else {
            return Ok(Vec::new());
        };
        let key = dimensions.bucket_key();
        Ok(state
            .samples
            .read()
            .iter()
            .filter(|s| s.dimensions.bucket_key() == key && s.start < end && s.end > start)
            .cloned()
            .collect())
    }

    async fn info(&self, counter: &str) -> QueryResult<Option<CounterInfo>> {
        let Some(state) = self.counters.get(counter) else {
            return Ok(None);
        };
        let samples = state.samples.read();
        if samples.is_empty() {
            return Ok(None);
        }

        let mut dimensions = BTreeSet::new();
        let mut dimension_values: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut start_time = u64::MAX;
        let mut end_time = 0u64;
        for sample in samples.iter() {
            for (name, value) in sample.dimensions.iter() {
                dimensions.insert(name.to_ascii_lowercase());
                dimension_values
                    .entry(name.to_ascii_lowercase())
                    .or_default()
                    .insert(value.to_ascii_lowercase());
            }
            start_time = start_time.min(sample.start);
            end_time = end_time.max(sample.end);
        }

        Ok(Some(CounterInfo {
            counter: counter.to_string(),
            dimensions,
            dimension_values,
            start_time,
            end_time,
        }))
    }

    async fn write(&self, counter: &str, samples: Vec<DataSample>) -> QueryResult<()> {
        let state = self.counters.entry(counter.to_string()).or_default();
        state.samples.write().extend(samples);
        Ok(())
    }

    async fn transfer(
        &self,
        counter: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> QueryResult<Vec<DataSample>> {
        let Some(state) = self.counters.get(counter) else {
            return Ok(Vec::new());
        };
        let start = start.unwrap_or(0);
        let end = end.unwrap_or(u64::MAX);
        Ok(state
            .samples
            .read()
            .iter()
            .filter(|s| s.start < end && s.end > start)
            .cloned()
            .collect())
    }

    fn known_counters(&self) -> Vec<String> {
        self.counters.iter().map(|e| e.key().clone()).collect()
    }

    fn latest_end_time(&self, counter: &str) -> Option<u64> {
        self.counters
            .get(counter)
            .and_then(|state| state.samples.read().iter().map(|s| s.end).max())
    }
}
