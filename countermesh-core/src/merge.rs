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

//! Arithmetic for combining two same-kind, same-dimension samples.
//!
//! `SampleMerger::merge` is pure and does not suspend; it is safe to call
//! from any thread without coordination beyond whatever lock guards the
//! accumulator it's folding into (see `countermesh-query::aggregation`).

use crate::error::{QueryError, QueryResult};
use crate::model::{DataSample, SampleKind, SamplePayload};
use std::collections::BTreeMap;

pub struct SampleMerger;

impl SampleMerger {
    /// Merge two samples of the same kind and dimensions. Percentile
    /// samples are never accepted here — they are produced only by
    /// post-aggregation conversion (see [`percentile_from_histogram`]).
    pub fn merge(a: &DataSample, b: &DataSample) -> QueryResult<DataSample> {
        if a.kind == SampleKind::Percentile || b.kind == SampleKind::Percentile {
            return Err(QueryError::PercentileOnPerMachineSample);
        }
        if a.kind != b.kind || a.dimensions != b.dimensions {
            return Err(QueryError::IncompatibleSamples);
        }

        let start = a.start.min(b.start);
        let end = a.end.max(b.end);
        let machine_count = merge_machine_count(a.machine_count, b.machine_count);

        let payload = match (&a.payload, &b.payload) {
            (SamplePayload::HitCount { hits: ha }, SamplePayload::HitCount { hits: hb }) => {
                SamplePayload::HitCount {
                    hits: ha.checked_add(*hb).ok_or(QueryError::Overflow)?,
                }
            }
            (
                SamplePayload::Histogram {
                    buckets: ba,
                    count: ca,
                },
                SamplePayload::Histogram {
                    buckets: bb,
                    count: cb,
                },
            ) => SamplePayload::Histogram {
                buckets: merge_histograms(ba, bb)?,
                count: ca.checked_add(*cb).ok_or(QueryError::Overflow)?,
            },
            (
                SamplePayload::Average { avg: aa, n: na },
                SamplePayload::Average { avg: ab, n: nb },
            ) => {
                let n = na.checked_add(*nb).ok_or(QueryError::Overflow)?;
                let avg = if n == 0 {
                    0.0
                } else {
                    (*na as f64 / n as f64) * aa + (*nb as f64 / n as f64) * ab
                };
                SamplePayload::Average { avg, n }
            }
            (
                SamplePayload::Extremum {
                    value: va,
                    count: ca,
                },
                SamplePayload::Extremum {
                    value: vb,
                    count: cb,
                },
            ) => {
                let value = match a.kind {
                    SampleKind::Min => va.min(*vb),
                    SampleKind::Max => va.max(*vb),
                    _ => return Err(QueryError::IncompatibleSamples),
                };
                SamplePayload::Extremum {
                    value,
                    count: ca.checked_add(*cb).ok_or(QueryError::Overflow)?,
                }
            }
            _ => return Err(QueryError::IncompatibleSamples),
        };

        DataSample::new(a.kind, a.dimensions.clone(), start, end, payload, machine_count)
    }

    /// Fold an iterator of same-kind, same-dimension samples into one,
    /// in order. Empty input is an error; callers that might see an empty
    /// bucket should handle that case before calling.
    pub fn merge_all<'a, I: IntoIterator<Item = &'a DataSample>>(
        samples: I,
    ) -> QueryResult<DataSample> {
        let mut iter = samples.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| QueryError::Internal("merge_all called with no samples".into()))?;
        iter.try_fold(first.clone(), |acc, next| Self::merge(&acc, next))
    }
}

fn merge_machine_count(a: u64, b: u64) -> u64 {
    if a == 0 && b == 0 {
        1
    } else {
        a.saturating_add(b)
    }
}

fn merge_histograms(
    a: &BTreeMap<i64, u64>,
    b: &BTreeMap<i64, u64>,
) -> QueryResult<BTreeMap<i64, u64>> {
    let mut out = a.clone();
    for (bucket, count) in b {
        let entry = out.entry(*bucket).or_insert(0);
        *entry = entry.checked_add(*count).ok_or(QueryError::Overflow)?;
    }
    Ok(out)
}

/// The reserved `percentile` dimension resolves to one of these; see
/// spec §4.2 / §6.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PercentileSpec {
    Value(f64),
    Average,
    Minimum,
    Maximum,
}

impl PercentileSpec {
    pub fn parse(raw: &str) -> QueryResult<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "average" => Ok(Self::Average),
            "minimum" => Ok(Self::Minimum),
            "maximum" => Ok(Self::Maximum),
            other => {
                let value: f64 = other
                    .parse()
                    .map_err(|_| QueryError::InvalidPercentile(raw.to_string()))?;
                if !(0.0..=100.0).contains(&value) {
                    return Err(QueryError::InvalidPercentile(raw.to_string()));
                }
                Ok(Self::Value(value))
            }
        }
    }

    /// The numeric percentile this spec is equivalent to, used only for
    /// labelling the resulting `Percentile` sample.
    pub fn nominal_value(&self) -> f64 {
        match self {
            Self::Value(v) => *v,
            Self::Average => f64::NAN, // not meaningful; avg doesn't have a rank
            Self::Minimum => 0.0,
            Self::Maximum => 100.0,
        }
    }
}

/// Convert a merged Histogram sample into a Percentile sample per the
/// requested spec. `buckets` maps a bucket boundary to an observation
/// count; percentiles use nearest-rank on the cumulative distribution.
pub fn percentile_from_histogram(
    buckets: &BTreeMap<i64, u64>,
    count: u64,
    spec: PercentileSpec,
) -> f64 {
    if count == 0 || buckets.is_empty() {
        return 0.0;
    }
    match spec {
        PercentileSpec::Minimum => *buckets.keys().next().unwrap() as f64,
        PercentileSpec::Maximum => *buckets.keys().next_back().unwrap() as f64,
        PercentileSpec::Average => {
            let total: f64 = buckets
                .iter()
                .map(|(bucket, c)| *bucket as f64 * *c as f64)
                .sum();
            total / count as f64
        }
        PercentileSpec::Value(p) => {
            let target = ((p / 100.0) * count as f64).ceil() as u64;
            let target = target.max(1);
            let mut cumulative = 0u64;
            for (bucket, c) in buckets {
                cumulative += c;
                if cumulative >= target {
                    return *bucket as f64;
                }
            }
            *buckets.keys().next_back().unwrap() as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataSample, DimensionSpec, SampleKind, SamplePayload};

    fn hit(start: u64, end: u64, hits: u64) -> DataSample {
        DataSample::new(
            SampleKind::HitCount,
            DimensionSpec::new(),
            start,
            end,
            SamplePayload::HitCount { hits },
            0,
        )
        .unwrap()
    }

    #[test]
    fn hitcount_merge_is_commutative() {
        let a = hit(0, 60_000, 3);
        let b = hit(60_000, 120_000, 4);
        let ab = SampleMerger::merge(&a, &b).unwrap();
        let ba = SampleMerger::merge(&b, &a).unwrap();
        assert_eq!(
            matches!(ab.payload, SamplePayload::HitCount { hits } if hits == 7),
            true
        );
        assert_eq!(ab.payload, ba.payload);
        assert_eq!(ab.start, ba.start);
        assert_eq!(ab.end, ba.end);
    }

    #[test]
    fn hitcount_merge_is_associative_in_any_order() {
        let a = hit(0, 1, 1);
        let b = hit(1, 2, 1);
        let c = hit(2, 3, 1);

        let left = SampleMerger::merge(&SampleMerger::merge(&a, &b).unwrap(), &c).unwrap();
        let right = SampleMerger::merge(&a, &SampleMerger::merge(&b, &c).unwrap()).unwrap();
        assert_eq!(left.payload, right.payload);
    }

    #[test]
    fn machine_count_sums_across_disjoint_machines() {
        let samples: Vec<DataSample> = (0..15).map(|_| hit(0, 60_000, 1)).collect();
        let merged = SampleMerger::merge_all(&samples).unwrap();
        assert_eq!(merged.machine_count, 15);
        assert!(matches!(merged.payload, SamplePayload::HitCount { hits: 15 }));
    }

    #[test]
    fn percentile_sample_cannot_be_merged() {
        let p = DataSample::new(
            SampleKind::Percentile,
            DimensionSpec::new(),
            0,
            1,
            SamplePayload::Percentile {
                percentile: 99.0,
                value: 10.0,
            },
            1,
        )
        .unwrap();
        let other = p.clone();
        let err = SampleMerger::merge(&p, &other).unwrap_err();
        assert_eq!(err, QueryError::PercentileOnPerMachineSample);
    }

    #[test]
    fn disjoint_time_ranges_union_to_widest_span() {
        let a = hit(0, 300_000, 5);
        let b = hit(86_400_000, 86_700_000, 5);
        let merged = SampleMerger::merge(&a, &b).unwrap();
        assert_eq!(merged.start, 0);
        assert_eq!(merged.end, 86_700_000);
    }

    #[test]
    fn percentile_99_999_over_uniform_histogram_is_max_bucket() {
        let mut buckets = BTreeMap::new();
        for i in 1..=10 {
            buckets.insert(i, 1u64);
        }
        let value = percentile_from_histogram(&buckets, 10, PercentileSpec::parse("99.999").unwrap());
        assert_eq!(value, 10.0);
    }

    #[test]
    fn average_merge_matches_weighted_mean() {
        let a = DataSample::new(
            SampleKind::Average,
            DimensionSpec::new(),
            0,
            1,
            SamplePayload::Average { avg: 10.0, n: 3 },
            1,
        )
        .unwrap();
        let b = DataSample::new(
            SampleKind::Average,
            DimensionSpec::new(),
            0,
            1,
            SamplePayload::Average { avg: 20.0, n: 1 },
            1,
        )
        .unwrap();
        let merged = SampleMerger::merge(&a, &b).unwrap();
        if let SamplePayload::Average { avg, n } = merged.payload {
            assert_eq!(n, 4);
            assert!((avg - 12.5).abs() < 1e-9);
        } else {
            panic!("wrong payload kind");
        }
    }
}
