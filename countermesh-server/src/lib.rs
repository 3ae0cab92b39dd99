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

pub mod api;
pub mod auth;
pub mod buffer_pool;
pub mod codec;
pub mod config;
pub mod fanout;
pub mod middleware;
pub mod poller;
pub mod query_handler;
pub mod registration_client;
pub mod registry;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use countermesh_core::{ServerInfo, ServerRegistration};
use countermesh_observability::LoggingTracer;
use countermesh_storage::{DataManager, InMemoryDataManager};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use api::AppState;
use auth::{Authenticator, BearerTokenAuth, NoAuth};
use buffer_pool::BufferPool;
use config::NodeConfig;
use fanout::FanoutEngine;
use middleware::compression::compression_layer;
use poller::AggregationPoller;
use query_handler::QueryHandler;
use registration_client::RegistrationClient;
use registry::Registry;
use transport::ReqwestTransport;

/// Brings up one node: local store, registry, fanout engine, background
/// poller, and the HTTP surface, and serves until the process is killed.
pub async fn run_node(config: NodeConfig) -> Result<()> {
    tracing::info!("starting countermesh node");
    tracing::info!(?config, "resolved configuration");
    config.validate()?;

    let addr = config.socket_addr()?;
    let local_server = ServerInfo::new(addr.ip().to_string(), addr.port());
    tracing::info!(server = %local_server, "node identity");

    let data_manager: Arc<dyn DataManager> = Arc::new(InMemoryDataManager::new());
    let tracer = Arc::new(LoggingTracer) as countermesh_core::SharedTracer;
    let registry = Arc::new(Registry::new(config.registry.expiration_secs * 1000, tracer.clone()));
    let transport = Arc::new(ReqwestTransport::new());
    let fanout = Arc::new(FanoutEngine::new(transport.clone(), tracer.clone(), config.fanout.timeout_scale_factor));

    let query_handler = Arc::new(QueryHandler::new(
        data_manager.clone(),
        fanout.clone(),
        registry.clone(),
        local_server.clone(),
        config.fanout.query_aggregator,
    ));

    let poller = AggregationPoller::new(
        data_manager.clone(),
        fanout.clone(),
        registry.clone(),
        local_server.clone(),
        config.poller.clone(),
        tracer.clone(),
    );
    let _poller_handle = poller.spawn();

    let seeds = parse_seeds(&config.registry.seeds);
    let _registration_clients = spawn_registration_clients(
        transport,
        seeds,
        local_server.clone(),
        data_manager.clone(),
        Duration::from_secs(config.registry.registration_interval_secs.max(1)),
    );

    let sweep_registry = registry.clone();
    let sweep_interval = Duration::from_secs(config.registry.sweep_interval_secs.max(1));
    let _sweep_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            let evicted = sweep_registry.sweep_expired();
            if evicted > 0 {
                tracing::info!(evicted, "swept expired peers from registry");
            }
        }
    });

    let authenticator: Arc<dyn Authenticator> = if config.auth.enabled {
        let token = config
            .auth
            .bearer_token
            .clone()
            .context("auth.enabled is true but no bearer_token configured")?;
        Arc::new(BearerTokenAuth::new(token))
    } else {
        Arc::new(NoAuth)
    };

    let state = AppState {
        query_handler,
        data_manager,
        registry,
        authenticator,
        local_server,
        buffer_pool: BufferPool::new(),
    };

    let mut router = api::build_router(state);
    if config.server.enable_cors {
        router = router.layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));
    }
    router = router
        .layer(TraceLayer::new_for_http())
        .layer(compression_layer(config.server.compression_min_bytes));

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Parse `host:port` seed strings from config, logging and skipping any
/// that don't split cleanly rather than failing node startup over a typo.
fn parse_seeds(seeds: &[String]) -> Vec<ServerInfo> {
    seeds
        .iter()
        .filter_map(|seed| match seed.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => Some(ServerInfo::new(host, port)),
                Err(_) => {
                    tracing::warn!(seed, "ignoring seed with non-numeric port");
                    None
                }
            },
            None => {
                tracing::warn!(seed, "ignoring seed missing a ':port' suffix");
                None
            }
        })
        .collect()
}

/// Build the `ServerRegistration` this node reports to an upstream peer:
/// its own identity plus the latest end-time per locally-held counter.
pub fn build_registration(local_server: &ServerInfo, data_manager: &dyn DataManager) -> ServerRegistration {
    let counters = data_manager
        .known_counters()
        .into_iter()
        .filter_map(|name| {
            let end = data_manager.latest_end_time(&name)?;
            Some((name, end))
        })
        .collect();
    ServerRegistration {
        server: local_server.clone(),
        counters,
    }
}

/// Spawn a `RegistrationClient` against every configured seed peer, each
/// pushing this node's current registration once per `interval`.
pub fn spawn_registration_clients(
    transport: Arc<ReqwestTransport>,
    seeds: Vec<ServerInfo>,
    local_server: ServerInfo,
    data_manager: Arc<dyn DataManager>,
    interval: Duration,
) -> Vec<RegistrationClient> {
    seeds
        .into_iter()
        .map(|destination| {
            let local_server = local_server.clone();
            let data_manager = data_manager.clone();
            RegistrationClient::spawn(transport.clone(), destination, interval, move || {
                build_registration(&local_server, data_manager.as_ref())
            })
        })
        .collect()
}
