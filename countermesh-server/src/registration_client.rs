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

//! Timer-driven actor that periodically pushes this node's identity and
//! per-counter progress to a configured destination's `/register`
//! endpoint. Unlike the original source, this client exposes an
//! explicit `shutdown` that cancels the interval and waits out any
//! in-flight POST (spec §9, resolved open question).

use countermesh_core::ServerRegistration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::transport::{Accept, Transport};

pub struct RegistrationClient {
    handle: JoinHandle<()>,
    shutdown: Arc<ShutdownFlag>,
}

struct ShutdownFlag {
    stopped: AtomicBool,
    notify: Notify,
}

impl RegistrationClient {
    /// Spawn the background task. `registration_fn` is called once per
    /// tick to build the current `ServerRegistration` body (it captures
    /// the local `DataManager`/counter list).
    pub fn spawn<T, F>(
        transport: Arc<T>,
        destination: countermesh_core::ServerInfo,
        interval: Duration,
        registration_fn: F,
    ) -> Self
    where
        T: Transport + 'static,
        F: Fn() -> ServerRegistration + Send + Sync + 'static,
    {
        let shutdown = Arc::new(ShutdownFlag {
            stopped: AtomicBool::new(false),
            notify: Notify::new(),
        });
        let task_shutdown = shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if task_shutdown.stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        let registration = registration_fn();
                        let body = match serde_json::to_vec(&registration) {
                            Ok(b) => b,
                            Err(e) => {
                                tracing::error!(error = %e, "failed to encode registration body");
                                continue;
                            }
                        };
                        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
                        match transport
                            .post(&destination, "/register", body.into(), Accept::Json, deadline)
                            .await
                        {
                            Ok(resp) if resp.status < 300 => {
                                tracing::debug!(destination = %destination, "registration sent");
                            }
                            Ok(resp) => {
                                tracing::warn!(destination = %destination, status = resp.status, "registration rejected, retrying next tick");
                            }
                            Err(e) => {
                                tracing::warn!(destination = %destination, error = %e, "registration failed, retrying next tick");
                            }
                        }
                    }
                    _ = task_shutdown.notify.notified() => {
                        break;
                    }
                }
            }
        });

        Self { handle, shutdown }
    }

    /// Cancel the timer and wait for the task (including any in-flight
    /// POST) to finish.
    pub async fn shutdown(self) {
        self.shutdown.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify.notify_one();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use countermesh_core::ServerInfo;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn shutdown_stops_the_loop_cleanly() {
        let transport = Arc::new(MockTransport::always_ok());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let client = RegistrationClient::spawn(
            transport,
            ServerInfo::new("aggregator", 7100),
            Duration::from_millis(5),
            move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                ServerRegistration {
                    server: ServerInfo::new("self", 7100),
                    counters: BTreeMap::new(),
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        client.shutdown().await;
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
