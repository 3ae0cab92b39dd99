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

//! Peer discovery table. Sources push their identity and per-counter
//! progress via `/register`; the registry tracks liveness with an
//! expiry sweep. No disk persistence — on restart peers simply
//! re-register on their next tick.

use countermesh_core::{EventId, PeerRecord, ServerInfo, ServerRegistration, SharedTracer};
use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

pub struct Registry {
    peers: DashMap<String, PeerRecord>,
    expiration_ms: u64,
    tracer: SharedTracer,
}

impl Registry {
    pub fn new(expiration_ms: u64, tracer: SharedTracer) -> Self {
        Self {
            peers: DashMap::new(),
            expiration_ms,
            tracer,
        }
    }

    /// Create or refresh a peer record. Per-counter end-times only ever
    /// advance; a stale (non-monotonic) timestamp is logged and ignored
    /// rather than rolling the record backwards.
    pub fn insert_or_update(&self, reg: ServerRegistration) {
        let key = reg.server.registry_key();
        let now = now_ms();
        let hostname = reg.server.hostname.clone();

        self.peers
            .entry(key)
            .and_modify(|record| {
                record.server = reg.server.clone();
                record.last_update_ms = now;
                for (counter, end_time) in &reg.counters {
                    match record.counter_end_times.get(counter) {
                        Some(existing) if *existing > *end_time => {
                            tracing::warn!(
                                counter,
                                existing,
                                reported = end_time,
                                "ignoring non-monotonic counter end-time from registration"
                            );
                            self.tracer.event(
                                EventId::RegistrationStale,
                                &[
                                    ("server", hostname.as_str().into()),
                                    ("counter", counter.as_str().into()),
                                    ("existing", (*existing).into()),
                                    ("reported", (*end_time).into()),
                                ],
                            );
                        }
                        _ => {
                            record
                                .counter_end_times
                                .insert(counter.clone(), *end_time);
                            self.tracer.event(
                                EventId::RegistrationReceived,
                                &[
                                    ("server", hostname.as_str().into()),
                                    ("counter", counter.as_str().into()),
                                    ("end_time", (*end_time).into()),
                                ],
                            );
                        }
                    }
                }
            })
            .or_insert_with(|| {
                tracing::info!(server = %reg.server, "new peer registered");
                for (counter, end_time) in &reg.counters {
                    self.tracer.event(
                        EventId::RegistrationReceived,
                        &[
                            ("server", hostname.as_str().into()),
                            ("counter", counter.as_str().into()),
                            ("end_time", (*end_time).into()),
                        ],
                    );
                }
                PeerRecord {
                    server: reg.server,
                    last_update_ms: now,
                    counter_end_times: reg.counters,
                }
            });
    }

    pub fn get(&self, hostname: &str) -> Option<PeerRecord> {
        self.peers
            .get(&hostname.to_ascii_lowercase())
            .map(|r| r.clone())
    }

    /// Snapshot of all currently-live peers (expiry sweep removes stale
    /// ones out-of-band; callers never see partial updates since DashMap
    /// shards are each internally consistent).
    pub fn list(&self) -> Vec<ServerInfo> {
        self.peers.iter().map(|r| r.server.clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.iter().map(|r| r.clone()).collect()
    }

    /// Peers whose recorded end-time for `counter` is later than `since`,
    /// used by the AggregationPoller to pick pre-aggregation sources.
    pub fn peers_with_newer_data(&self, counter: &str, since: u64) -> Vec<ServerInfo> {
        self.peers
            .iter()
            .filter(|r| {
                r.counter_end_times
                    .get(counter)
                    .is_some_and(|end| *end > since)
            })
            .map(|r| r.server.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Remove records whose last update is older than `expiration_ms`.
    /// Returns the number of peers evicted.
    pub fn sweep_expired(&self) -> usize {
        let now = now_ms();
        let cutoff = self.expiration_ms;
        let expired: Vec<String> = self
            .peers
            .iter()
            .filter(|r| now.saturating_sub(r.last_update_ms) > cutoff)
            .map(|r| r.key().clone())
            .collect();

        for key in &expired {
            self.peers.remove(key);
            tracing::info!(hostname = %key, "peer expired and removed from registry");
            self.tracer.event(EventId::PeerExpired, &[("hostname", key.as_str().into())]);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn reg(hostname: &str, counters: &[(&str, u64)]) -> ServerRegistration {
        ServerRegistration {
            server: ServerInfo::new(hostname, 7100),
            counters: counters
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn insert_then_get_is_case_insensitive() {
        let registry = Registry::new(600_000, countermesh_core::null_tracer());
        registry.insert_or_update(reg("Host-A", &[("requests", 100)]));
        assert!(registry.get("host-a").is_some());
        assert!(registry.get("HOST-A").is_some());
    }

    #[test]
    fn non_monotonic_end_time_is_ignored() {
        let registry = Registry::new(600_000, countermesh_core::null_tracer());
        registry.insert_or_update(reg("host-a", &[("requests", 100)]));
        registry.insert_or_update(reg("host-a", &[("requests", 50)]));
        let record = registry.get("host-a").unwrap();
        assert_eq!(record.counter_end_times["requests"], 100);
    }

    #[test]
    fn peers_with_newer_data_filters_by_counter() {
        let registry = Registry::new(600_000, countermesh_core::null_tracer());
        registry.insert_or_update(reg("host-a", &[("requests", 100)]));
        registry.insert_or_update(reg("host-b", &[("requests", 50)]));
        let peers = registry.peers_with_newer_data("requests", 75);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].hostname, "host-a");
    }

    #[test]
    fn sweep_expired_removes_stale_peers() {
        let registry = Registry::new(0, countermesh_core::null_tracer());
        registry.insert_or_update(reg("host-a", &[]));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(registry.sweep_expired(), 1);
        assert!(registry.is_empty());
    }
}
