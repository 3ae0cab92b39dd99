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

//! `BatchAggregator`: one [`CounterAggregator`] per sub-query, keyed by
//! `user_context`. A `/batchQuery` response is the union of each
//! sub-aggregator's own `get_response`.

use crate::aggregation::CounterAggregator;
use countermesh_core::{
    BatchQueryResponse, CounterQueryResponse, QueryError, QueryResult, RequestDetails, SubQuery,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

struct Entry {
    aggregator: CounterAggregator,
    collapse_time_buckets: bool,
}

pub struct BatchAggregator {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
    details: Mutex<Vec<RequestDetails>>,
}

impl BatchAggregator {
    /// Builds one aggregator per sub-query. `user_context` is assigned a
    /// fresh id when the caller left it blank; duplicate explicit contexts
    /// are rejected so a later merge can't silently clobber an earlier
    /// sub-query's results.
    pub fn new(queries: &[SubQuery]) -> QueryResult<Self> {
        let mut order = Vec::with_capacity(queries.len());
        let mut entries = HashMap::with_capacity(queries.len());

        for query in queries {
            let user_context = if query.user_context.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                query.user_context.clone()
            };

            if entries.contains_key(&user_context) {
                return Err(QueryError::DuplicateUserContext(user_context));
            }

            let aggregator = CounterAggregator::new();
            let collapse_time_buckets = query
                .dimensions
                .get("aggregate")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);
            aggregator.apply_percentile_calculation_aggregation(Some(&query.dimensions))?;

            order.push(user_context.clone());
            entries.insert(
                user_context,
                Entry {
                    aggregator,
                    collapse_time_buckets,
                },
            );
        }

        Ok(Self {
            order,
            entries,
            details: Mutex::new(Vec::new()),
        })
    }

    /// Route each contained response to the aggregator registered for its
    /// `user_context`. A response naming a context this batch never
    /// declared is logged and dropped — it cannot belong to any sub-query.
    pub fn add_response(&self, resp: &BatchQueryResponse) -> QueryResult<()> {
        for sub_resp in &resp.responses {
            let Some(ctx) = sub_resp.user_context.as_deref() else {
                tracing::warn!("batch sub-response missing user_context, dropping");
                continue;
            };
            match self.entries.get(ctx) {
                Some(entry) => entry.aggregator.add_machine_response(sub_resp)?,
                None => tracing::warn!(user_context = ctx, "unknown batch user_context, dropping"),
            }
        }
        self.details.lock().extend(resp.details.iter().cloned());
        Ok(())
    }

    /// Emit one `CounterQueryResponse` per declared sub-query, in the
    /// order the sub-queries were supplied to [`Self::new`].
    pub fn get_response(&self) -> QueryResult<BatchQueryResponse> {
        let mut responses = Vec::with_capacity(self.order.len());
        for user_context in &self.order {
            let entry = &self.entries[user_context];
            let mut resp: CounterQueryResponse =
                entry.aggregator.get_response(entry.collapse_time_buckets)?;
            resp.user_context = Some(user_context.clone());
            responses.push(resp);
        }
        Ok(BatchQueryResponse {
            responses,
            details: self.details.lock().clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use countermesh_core::{DataSample, DimensionSpec, SampleKind, SamplePayload};

    fn sub_query(user_context: &str) -> SubQuery {
        SubQuery {
            user_context: user_context.to_string(),
            counter: "requests".to_string(),
            dimensions: DimensionSpec::new(),
        }
    }

    fn hit_response(ctx: &str, hits: u64) -> CounterQueryResponse {
        let sample = DataSample::new(
            SampleKind::HitCount,
            DimensionSpec::new(),
            0,
            60_000,
            SamplePayload::HitCount { hits },
            1,
        )
        .unwrap();
        CounterQueryResponse {
            http_code: 200,
            error: None,
            user_context: Some(ctx.to_string()),
            samples: vec![sample],
            details: vec![],
        }
    }

    #[test]
    fn duplicate_user_context_is_rejected() {
        let queries = vec![sub_query("a"), sub_query("a")];
        let err = BatchAggregator::new(&queries).unwrap_err();
        assert_eq!(err, QueryError::DuplicateUserContext("a".to_string()));
    }

    #[test]
    fn blank_user_context_gets_a_generated_one() {
        let queries = vec![sub_query(""), sub_query("")];
        let batch = BatchAggregator::new(&queries).unwrap();
        assert_eq!(batch.order.len(), 2);
        assert_ne!(batch.order[0], batch.order[1]);
    }

    #[test]
    fn responses_route_to_the_matching_sub_query() {
        let queries = vec![sub_query("alpha"), sub_query("beta")];
        let batch = BatchAggregator::new(&queries).unwrap();

        batch
            .add_response(&BatchQueryResponse {
                responses: vec![hit_response("alpha", 3), hit_response("beta", 5)],
                details: vec![],
            })
            .unwrap();
        batch
            .add_response(&BatchQueryResponse {
                responses: vec![hit_response("alpha", 1)],
                details: vec![],
            })
            .unwrap();

        let out = batch.get_response().unwrap();
        assert_eq!(out.responses.len(), 2);
        assert_eq!(out.responses[0].user_context.as_deref(), Some("alpha"));
        assert!(matches!(
            out.responses[0].samples[0].payload,
            SamplePayload::HitCount { hits: 4 }
        ));
        assert_eq!(out.responses[1].user_context.as_deref(), Some("beta"));
        assert!(matches!(
            out.responses[1].samples[0].payload,
            SamplePayload::HitCount { hits: 5 }
        ));
    }

    #[test]
    fn unknown_user_context_is_dropped_not_errored() {
        let queries = vec![sub_query("alpha")];
        let batch = BatchAggregator::new(&queries).unwrap();
        batch
            .add_response(&BatchQueryResponse {
                responses: vec![hit_response("ghost", 9)],
                details: vec![],
            })
            .unwrap();
        let out = batch.get_response().unwrap();
        assert_eq!(out.responses[0].http_code, 404);
    }
}
