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

//! Background pre-aggregation (spec §4.8). Independent of query-time
//! fanout: on a fixed tick, every counter this node holds data for is
//! checked against the Registry for peers with newer samples, pulled via
//! the same `FanoutEngine` the query path uses, and folded back into the
//! local store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use countermesh_core::{CounterQueryResponse, DimensionSpec, EventId, QueryResult, ServerInfo, SharedTracer, TieredRequest};
use countermesh_query::CounterAggregator;
use countermesh_storage::DataManager;
use parking_lot::Mutex;

use crate::config::PollerConfig;
use crate::fanout::FanoutEngine;
use crate::registry::Registry;
use crate::transport::Transport;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// Spec §4.8's fixed ladder, keyed by how many sources this round fans
/// out to.
fn timeout_for_source_count(source_count: usize, max_fanout: u32) -> Duration {
    let f = max_fanout.max(1) as u64;
    let n = source_count as u64;
    let secs = if n <= f {
        5
    } else if n <= f.saturating_mul(f) {
        12
    } else if n <= f.saturating_mul(f).saturating_mul(f) {
        20
    } else {
        30
    };
    Duration::from_secs(secs)
}

/// Periodically drives a tiered fanout per locally-known counter, per
/// spec §4.8. A worker set bounded by the counter count avoids one slow
/// counter blocking the rest; an "active" set caps outstanding polls per
/// counter at one.
pub struct AggregationPoller<T: Transport> {
    data_manager: Arc<dyn DataManager>,
    fanout: Arc<FanoutEngine<T>>,
    registry: Arc<Registry>,
    local_server: ServerInfo,
    config: PollerConfig,
    active: Mutex<HashSet<String>>,
    tracer: SharedTracer,
}

impl<T: Transport + 'static> AggregationPoller<T> {
    pub fn new(
        data_manager: Arc<dyn DataManager>,
        fanout: Arc<FanoutEngine<T>>,
        registry: Arc<Registry>,
        local_server: ServerInfo,
        config: PollerConfig,
        tracer: SharedTracer,
    ) -> Arc<Self> {
        Arc::new(Self {
            data_manager,
            fanout,
            registry,
            local_server,
            config,
            active: Mutex::new(HashSet::new()),
            tracer,
        })
    }

    /// Spawn the periodic scheduler. The returned handle lets the caller
    /// fold shutdown into the rest of the node's task set; dropping it
    /// does not stop the loop (matches `RegistrationClient`'s explicit
    /// shutdown convention elsewhere in this crate).
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let poller = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(poller.config.poll_interval_secs));
            loop {
                interval.tick().await;
                poller.tick();
            }
        })
    }

    /// Claim every idle counter and spawn one poll task per counter.
    fn tick(self: &Arc<Self>) {
        let counters = self.data_manager.known_counters();
        self.tracer.event(EventId::PollCycleStarted, &[("counters", counters.len().into())]);
        for counter in &counters {
            if !self.claim(counter) {
                tracing::debug!(counter, "skipping poll: previous round still in flight");
                self.tracer.event(EventId::PollCounterSkipped, &[("counter", counter.as_str().into())]);
                continue;
            }

            let poller = self.clone();
            let task_counter = counter.clone();
            tokio::spawn(async move {
                if let Err(e) = poller.poll_counter(&task_counter).await {
                    tracing::warn!(counter = %task_counter, error = %e, "aggregation poll failed");
                }
                poller.active.lock().remove(&task_counter);
            });
        }
        self.tracer.event(EventId::PollCycleCompleted, &[("counters", counters.len().into())]);
    }

    fn claim(&self, counter: &str) -> bool {
        let mut active = self.active.lock();
        if active.contains(counter) {
            false
        } else {
            active.insert(counter.to_string());
            true
        }
    }

    async fn poll_counter(&self, counter: &str) -> QueryResult<()> {
        let since = self.data_manager.latest_end_time(counter).unwrap_or(0);
        let sources = self.registry.peers_with_newer_data(counter, since);
        if sources.is_empty() {
            return Ok(());
        }

        let timeout = timeout_for_source_count(sources.len(), self.config.max_fanout);

        let mut dimensions = DimensionSpec::new();
        dimensions.insert("start", since.to_string());
        dimensions.insert("end", now_ms().to_string());
        dimensions.insert("aggregate", "true");

        let mut request = TieredRequest::new(dimensions, self.config.max_fanout, timeout.as_millis() as u64);
        request.sources = sources;

        let aggregator = Arc::new(CounterAggregator::new());
        let sink_aggregator = aggregator.clone();
        let path_counter = counter.to_string();
        self.fanout
            .run::<TieredRequest, CounterQueryResponse>(
                &request,
                move |_server| format!("/counters/{}/query", path_counter),
                move |resp| {
                    if let Err(e) = sink_aggregator.add_machine_response(&resp) {
                        tracing::warn!(error = %e, "failed to merge aggregation-poll response");
                    }
                },
            )
            .await;

        let merged = aggregator.get_response(true)?;
        if merged.samples.is_empty() {
            tracing::debug!(counter, since, "poll round found nothing newer");
            return Ok(());
        }

        let new_end = merged.samples.iter().map(|s| s.end).max().unwrap_or(since);
        let sample_count = merged.samples.len();
        self.data_manager.write(counter, merged.samples).await?;
        tracing::info!(
            counter,
            since,
            new_end,
            sample_count,
            server = %self.local_server,
            "committed pre-aggregated range"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BondCompactCodec, Encoder};
    use crate::transport::{Accept, MockTransport, TransportError, TransportResponse};
    use countermesh_core::{DataSample, SampleKind, SamplePayload, ServerRegistration};
    use countermesh_storage::InMemoryDataManager;
    use std::collections::BTreeMap;

    fn config(max_fanout: u32) -> PollerConfig {
        PollerConfig {
            poll_interval_secs: 60,
            max_fanout,
        }
    }

    fn register_peer(registry: &Registry, hostname: &str, counter: &str, end_time: u64) {
        registry.insert_or_update(ServerRegistration {
            server: ServerInfo::new(hostname, 7100),
            counters: BTreeMap::from([(counter.to_string(), end_time)]),
        });
    }

    #[test]
    fn timeout_ladder_thresholds() {
        assert_eq!(timeout_for_source_count(1, 20), Duration::from_secs(5));
        assert_eq!(timeout_for_source_count(20, 20), Duration::from_secs(5));
        assert_eq!(timeout_for_source_count(21, 20), Duration::from_secs(12));
        assert_eq!(timeout_for_source_count(400, 20), Duration::from_secs(12));
        assert_eq!(timeout_for_source_count(401, 20), Duration::from_secs(20));
        assert_eq!(timeout_for_source_count(8000, 20), Duration::from_secs(20));
        assert_eq!(timeout_for_source_count(8001, 20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn no_peers_with_newer_data_is_a_noop() {
        let data_manager: Arc<dyn DataManager> = Arc::new(InMemoryDataManager::new());
        let registry = Arc::new(Registry::new(600_000, countermesh_core::null_tracer()));
        let fanout = Arc::new(FanoutEngine::new(
            Arc::new(MockTransport::always_ok()),
            countermesh_core::null_tracer(),
            0.9,
        ));
        let poller = AggregationPoller::new(
            data_manager.clone(),
            fanout,
            registry,
            ServerInfo::new("self", 7100),
            config(20),
            countermesh_core::null_tracer(),
        );

        poller.poll_counter("requests").await.unwrap();
        assert!(data_manager.known_counters().is_empty());
    }

    #[tokio::test]
    async fn merges_remote_samples_and_advances_local_store() {
        let data_manager: Arc<dyn DataManager> = Arc::new(InMemoryDataManager::new());
        let registry = Arc::new(Registry::new(600_000, countermesh_core::null_tracer()));
        register_peer(&registry, "peer-a", "requests", 60_000);

        let remote_sample = DataSample::new(
            SampleKind::HitCount,
            DimensionSpec::new(),
            0,
            60_000,
            SamplePayload::HitCount { hits: 7 },
            1,
        )
        .unwrap();
        let remote_response = CounterQueryResponse {
            http_code: 200,
            error: None,
            user_context: None,
            samples: vec![remote_sample],
            details: vec![],
        };
        let body = BondCompactCodec.encode(&remote_response).unwrap();
        let transport = MockTransport::new(vec![Ok(TransportResponse {
            status: 200,
            body,
            content_type: Some(Accept::BondCompactBinary.content_type().to_string()),
        })]);
        let fanout = Arc::new(FanoutEngine::new(Arc::new(transport), countermesh_core::null_tracer(), 0.9));
        let poller = AggregationPoller::new(
            data_manager.clone(),
            fanout,
            registry,
            ServerInfo::new("self", 7100),
            config(20),
            countermesh_core::null_tracer(),
        );

        poller.poll_counter("requests").await.unwrap();

        assert_eq!(data_manager.latest_end_time("requests"), Some(60_000));
        let stored = data_manager
            .query("requests", &DimensionSpec::new(), 0, u64::MAX)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert!(matches!(stored[0].payload, SamplePayload::HitCount { hits: 7 }));
    }

    #[tokio::test]
    async fn timed_out_leader_leaves_the_local_store_untouched() {
        let data_manager: Arc<dyn DataManager> = Arc::new(InMemoryDataManager::new());
        let registry = Arc::new(Registry::new(600_000, countermesh_core::null_tracer()));
        register_peer(&registry, "peer-a", "requests", 60_000);

        let fanout = Arc::new(FanoutEngine::new(
            MockTransport::always_timeout(),
            countermesh_core::null_tracer(),
            0.9,
        ));
        let poller = AggregationPoller::new(
            data_manager.clone(),
            fanout,
            registry,
            ServerInfo::new("self", 7100),
            config(20),
            countermesh_core::null_tracer(),
        );

        poller.poll_counter("requests").await.unwrap();
        assert_eq!(data_manager.latest_end_time("requests"), None);
    }

    #[tokio::test]
    async fn tick_skips_a_counter_already_being_polled() {
        let data_manager: Arc<dyn DataManager> = Arc::new(InMemoryDataManager::new());
        let registry = Arc::new(Registry::new(600_000, countermesh_core::null_tracer()));
        let fanout = Arc::new(FanoutEngine::new(
            Arc::new(MockTransport::always_ok()),
            countermesh_core::null_tracer(),
            0.9,
        ));
        let poller = AggregationPoller::new(data_manager, fanout, registry, ServerInfo::new("self", 7100), config(20), countermesh_core::null_tracer());

        assert!(poller.claim("requests"));
        assert!(!poller.claim("requests"));
        poller.active.lock().remove("requests");
        assert!(poller.claim("requests"));
    }
}
