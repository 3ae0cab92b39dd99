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

//! `CounterInfoCombiner`: merges per-machine `/counters/<name>/info`
//! responses into one schema-level summary.

use countermesh_core::{CounterInfo, CounterInfoResponse, RequestDetails};

/// Whether diagnostic rows from the per-machine responses survive into
/// the combined response. `/info` is a lighter-weight, higher-fanout
/// endpoint than `/query`, so callers that don't need per-source failure
/// detail can ask for it to be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticsMode {
    Aggregate,
    Drop,
}

pub struct CounterInfoCombiner {
    mode: DiagnosticsMode,
}

impl CounterInfoCombiner {
    pub fn new(mode: DiagnosticsMode) -> Self {
        Self { mode }
    }

    /// Merge `dimensions` (name union), `dimension_values` (per-dimension
    /// value union, case normalized once) and the `[start_time, end_time]`
    /// envelope across every machine's response. Responses with no `info`
    /// (e.g. a 404 from a machine that has never seen the counter) only
    /// contribute their diagnostic rows.
    pub fn combine(&self, responses: &[CounterInfoResponse]) -> CounterInfoResponse {
        let mut counter = String::new();
        let mut dimensions = std::collections::BTreeSet::new();
        let mut dimension_values: std::collections::BTreeMap<String, std::collections::BTreeSet<String>> =
            std::collections::BTreeMap::new();
        let mut start_time = u64::MAX;
        let mut end_time = 0u64;
        let mut saw_info = false;
        let mut details: Vec<RequestDetails> = Vec::new();

        for resp in responses {
            if self.mode == DiagnosticsMode::Aggregate {
                details.extend(resp.details.iter().cloned());
            }
            let Some(info) = &resp.info else { continue };
            saw_info = true;
            if counter.is_empty() {
                counter = info.counter.clone();
            }
            for dim in &info.dimensions {
                dimensions.insert(dim.to_ascii_lowercase());
            }
            for (dim, values) in &info.dimension_values {
                let entry = dimension_values.entry(dim.to_ascii_lowercase()).or_default();
                for value in values {
                    entry.insert(value.to_ascii_lowercase());
                }
            }
            start_time = start_time.min(info.start_time);
            end_time = end_time.max(info.end_time);
        }

        if !saw_info {
            return CounterInfoResponse {
                http_code: 404,
                error: None,
                info: None,
                details,
            };
        }

        CounterInfoResponse {
            http_code: 200,
            error: None,
            info: Some(CounterInfo {
                counter,
                dimensions,
                dimension_values,
                start_time: if start_time == u64::MAX { 0 } else { start_time },
                end_time,
            }),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn info(counter: &str, dims: &[&str], start: u64, end: u64) -> CounterInfoResponse {
        CounterInfoResponse {
            http_code: 200,
            error: None,
            info: Some(CounterInfo {
                counter: counter.to_string(),
                dimensions: dims.iter().map(|d| d.to_string()).collect(),
                dimension_values: BTreeMap::new(),
                start_time: start,
                end_time: end,
            }),
            details: vec![],
        }
    }

    #[test]
    fn dimension_names_union_across_machines() {
        let combiner = CounterInfoCombiner::new(DiagnosticsMode::Drop);
        let responses = vec![
            info("requests", &["Region"], 0, 100),
            info("requests", &["region", "Env"], 50, 150),
        ];
        let combined = combiner.combine(&responses);
        let info = combined.info.unwrap();
        assert_eq!(
            info.dimensions,
            BTreeSet::from(["region".to_string(), "env".to_string()])
        );
        assert_eq!(info.start_time, 0);
        assert_eq!(info.end_time, 150);
    }

    #[test]
    fn all_404_responses_combine_to_404() {
        let combiner = CounterInfoCombiner::new(DiagnosticsMode::Drop);
        let responses = vec![
            CounterInfoResponse {
                http_code: 404,
                error: None,
                info: None,
                details: vec![],
            },
            CounterInfoResponse {
                http_code: 404,
                error: None,
                info: None,
                details: vec![],
            },
        ];
        let combined = combiner.combine(&responses);
        assert_eq!(combined.http_code, 404);
        assert!(combined.info.is_none());
    }

    #[test]
    fn drop_mode_discards_diagnostics() {
        use countermesh_core::model::RequestStatus;
        use countermesh_core::ServerInfo;

        let mut resp = info("requests", &["region"], 0, 10);
        resp.details.push(RequestDetails::new(
            ServerInfo::new("h1", 80),
            RequestStatus::Success,
            200,
            "ok",
            false,
        ));
        let combiner = CounterInfoCombiner::new(DiagnosticsMode::Drop);
        let combined = combiner.combine(&[resp]);
        assert!(combined.details.is_empty());
    }
}
