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

//! Accumulates per-machine [`CounterQueryResponse`]s for a single counter.
//!
//! All mutation happens under one internal lock (spec §4.2/§5): callers
//! may invoke `add_machine_response` concurrently from many fanout
//! blocks, and `get_response` observes every call that happened-before
//! it.

use countermesh_core::merge::{percentile_from_histogram, PercentileSpec, SampleMerger};
use countermesh_core::{
    CounterQueryResponse, DataSample, DimensionSpec, QueryError, QueryResult, RequestDetails,
    SampleKind, SamplePayload,
};
use parking_lot::Mutex;
use std::collections::HashMap;

/// `(dimensions bucket key, start, end)` — the exact-match key used when
/// buckets are not being time-collapsed.
type BucketKey = (Vec<(String, String)>, u64, u64);

struct Inner {
    order: Vec<BucketKey>,
    buckets: HashMap<BucketKey, DataSample>,
    details: Vec<RequestDetails>,
    percentile_spec: Option<PercentileSpec>,
}

pub struct CounterAggregator {
    inner: Mutex<Inner>,
}

impl Default for CounterAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterAggregator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                order: Vec::new(),
                buckets: HashMap::new(),
                details: Vec::new(),
                percentile_spec: None,
            }),
        }
    }

    /// Fold one machine's response into the accumulator. Rejects any
    /// per-machine `Percentile` sample outright (spec invariant: those
    /// are only ever produced post-aggregation).
    pub fn add_machine_response(&self, resp: &CounterQueryResponse) -> QueryResult<()> {
        if resp
            .samples
            .iter()
            .any(|s| s.kind == SampleKind::Percentile)
        {
            return Err(QueryError::PercentileOnPerMachineSample);
        }

        let mut inner = self.inner.lock();
        for sample in &resp.samples {
            let key = sample.time_bucket_key();
            match inner.buckets.get(&key) {
                Some(existing) => {
                    let merged = SampleMerger::merge(existing, sample)?;
                    inner.buckets.insert(key, merged);
                }
                None => {
                    inner.order.push(key.clone());
                    inner.buckets.insert(key, sample.clone());
                }
            }
        }
        inner.details.extend(resp.details.iter().cloned());
        Ok(())
    }

    /// Append a synthetic diagnostic row without any samples — how the
    /// `FanoutEngine` reports a timed-out or failed leader into the
    /// aggregator it otherwise feeds decoded responses into.
    pub fn add_request_details(&self, details: RequestDetails) {
        self.inner.lock().details.push(details);
    }

    /// Detect and consume the reserved `percentile` dimension. Returns the
    /// request dimensions with `percentile` stripped so a narrowed
    /// downstream request asks peers for raw histograms, not pre-filtered
    /// percentiles. Per spec: absent or unrecognized -> empty map; an
    /// explicit but malformed value is a hard error so the caller can
    /// reject the request instead of silently dropping it.
    pub fn apply_percentile_calculation_aggregation(
        &self,
        dims: Option<&DimensionSpec>,
    ) -> QueryResult<DimensionSpec> {
        let Some(dims) = dims else {
            return Ok(DimensionSpec::new());
        };
        let mut stripped = dims.clone();
        match stripped.take("percentile") {
            Some(raw) => {
                let spec = PercentileSpec::parse(&raw)?;
                self.inner.lock().percentile_spec = Some(spec);
                Ok(stripped)
            }
            None => Ok(DimensionSpec::new()),
        }
    }

    fn merged_by_dimensions_only(&self, inner: &Inner) -> QueryResult<Vec<DataSample>> {
        // Group by dimension bucket key (ignoring start/end), preserving
        // first-seen order across groups.
        let mut group_order: Vec<Vec<(String, String)>> = Vec::new();
        let mut groups: HashMap<Vec<(String, String)>, Vec<&DataSample>> = HashMap::new();
        for key in &inner.order {
            let sample = &inner.buckets[key];
            let dim_key = key.0.clone();
            groups.entry(dim_key.clone()).or_insert_with(|| {
                group_order.push(dim_key.clone());
                Vec::new()
            });
            groups.get_mut(&dim_key).unwrap().push(sample);
        }

        group_order
            .into_iter()
            .map(|dim_key| SampleMerger::merge_all(groups[&dim_key].iter().copied()))
            .collect()
    }

    /// Emit the merged `CounterQueryResponse`. When `collapse_time_buckets`
    /// is set, every bucket sharing a `DimensionSpec` is merged into one
    /// regardless of time range; percentile conversion (if configured via
    /// [`Self::apply_percentile_calculation_aggregation`]) runs last.
    pub fn get_response(&self, collapse_time_buckets: bool) -> QueryResult<CounterQueryResponse> {
        let inner = self.inner.lock();

        let mut samples: Vec<DataSample> = if collapse_time_buckets {
            self.merged_by_dimensions_only(&inner)?
        } else {
            inner
                .order
                .iter()
                .map(|k| inner.buckets[k].clone())
                .collect()
        };

        if let Some(spec) = inner.percentile_spec {
            for sample in samples.iter_mut() {
                if let SamplePayload::Histogram { buckets, count } = &sample.payload {
                    let value = percentile_from_histogram(buckets, *count, spec);
                    sample.kind = SampleKind::Percentile;
                    sample.payload = SamplePayload::Percentile {
                        percentile: spec.nominal_value(),
                        value,
                    };
                }
            }
        }

        let http_code = if samples.is_empty() { 404 } else { 200 };
        Ok(CounterQueryResponse {
            http_code,
            error: None,
            user_context: None,
            samples,
            details: inner.details.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use countermesh_core::model::RequestStatus;
    use countermesh_core::ServerInfo;

    fn hit_response(start: u64, end: u64, hits: u64) -> CounterQueryResponse {
        let sample = DataSample::new(
            SampleKind::HitCount,
            DimensionSpec::new(),
            start,
            end,
            SamplePayload::HitCount { hits },
            1,
        )
        .unwrap();
        CounterQueryResponse {
            http_code: 200,
            error: None,
            user_context: None,
            samples: vec![sample],
            details: vec![],
        }
    }

    #[test]
    fn smash_together_collapses_ten_one_minute_buckets() {
        let agg = CounterAggregator::new();
        for i in 0..10u64 {
            let start = i * 60_000;
            let end = start + 60_000;
            agg.add_machine_response(&hit_response(start, end, 1)).unwrap();
        }
        let resp = agg.get_response(true).unwrap();
        assert_eq!(resp.samples.len(), 1);
        assert!(matches!(resp.samples[0].payload, SamplePayload::HitCount { hits: 10 }));
        assert_eq!(resp.samples[0].start, 0);
        assert_eq!(resp.samples[0].end, 600_000);
    }

    #[test]
    fn fifteen_copies_count_fifteen_machines() {
        let agg = CounterAggregator::new();
        for _ in 0..15 {
            agg.add_machine_response(&hit_response(0, 60_000, 1)).unwrap();
        }
        let resp = agg.get_response(false).unwrap();
        assert_eq!(resp.samples.len(), 1);
        assert_eq!(resp.samples[0].machine_count, 15);
        assert!(matches!(resp.samples[0].payload, SamplePayload::HitCount { hits: 15 }));
    }

    #[test]
    fn disjoint_time_ranges_stay_separate_without_collapse() {
        let agg = CounterAggregator::new();
        for i in 0..5u64 {
            agg.add_machine_response(&hit_response(i * 60_000, i * 60_000 + 60_000, 1))
                .unwrap();
        }
        for i in 0..5u64 {
            let base = 86_400_000 + i * 60_000;
            agg.add_machine_response(&hit_response(base, base + 60_000, 1))
                .unwrap();
        }
        let resp = agg.get_response(false).unwrap();
        assert_eq!(resp.samples.len(), 10);
    }

    #[test]
    fn post_aggregation_percentile_on_uniform_histogram() {
        let agg = CounterAggregator::new();
        let mut buckets = std::collections::BTreeMap::new();
        for i in 1..=10i64 {
            buckets.insert(i, 1u64);
        }
        let sample = DataSample::new(
            SampleKind::Histogram,
            DimensionSpec::new(),
            0,
            60_000,
            SamplePayload::Histogram { buckets, count: 10 },
            1,
        )
        .unwrap();
        let resp = CounterQueryResponse {
            http_code: 200,
            error: None,
            user_context: None,
            samples: vec![sample],
            details: vec![],
        };

        let mut dims = DimensionSpec::new();
        dims.insert("percentile", "99.999");
        agg.apply_percentile_calculation_aggregation(Some(&dims)).unwrap();
        agg.add_machine_response(&resp).unwrap();

        let out = agg.get_response(false).unwrap();
        assert_eq!(out.samples.len(), 1);
        assert_eq!(out.samples[0].kind, SampleKind::Percentile);
        assert!(matches!(
            out.samples[0].payload,
            SamplePayload::Percentile { value, .. } if value == 10.0
        ));
    }

    #[test]
    fn idempotence_of_percentile_intent() {
        let agg = CounterAggregator::new();
        let mut dims = DimensionSpec::new();
        dims.insert("percentile", "50");
        let first = agg.apply_percentile_calculation_aggregation(Some(&dims)).unwrap();
        let second = agg.apply_percentile_calculation_aggregation(Some(&dims)).unwrap();
        assert_eq!(first.get("percentile"), None);
        assert_eq!(second.get("percentile"), None);
    }

    #[test]
    fn percentile_sample_rejected_in_add_machine_response() {
        let agg = CounterAggregator::new();
        let sample = DataSample::new(
            SampleKind::Percentile,
            DimensionSpec::new(),
            0,
            1,
            SamplePayload::Percentile {
                percentile: 50.0,
                value: 1.0,
            },
            1,
        )
        .unwrap();
        let resp = CounterQueryResponse {
            http_code: 200,
            error: None,
            user_context: None,
            samples: vec![sample],
            details: vec![],
        };
        let err = agg.add_machine_response(&resp).unwrap_err();
        assert_eq!(err, QueryError::PercentileOnPerMachineSample);
    }

    #[test]
    fn diagnostics_are_additive_and_never_mutated() {
        let agg = CounterAggregator::new();
        agg.add_request_details(RequestDetails::new(
            ServerInfo::new("a", 80),
            RequestStatus::TimedOut,
            0,
            "timeout",
            true,
        ));
        agg.add_request_details(RequestDetails::new(
            ServerInfo::new("b", 80),
            RequestStatus::FederationError,
            0,
            "sibling of timed-out leader",
            false,
        ));
        let resp = agg.get_response(false).unwrap();
        assert_eq!(resp.details.len(), 2);
    }
}
