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

//! End-to-end HTTP surface tests: build a real `Router` over an
//! in-memory store and drive it with `tower::ServiceExt::oneshot`
//! rather than a bound socket.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use countermesh_core::{
    BatchQueryRequest, CounterWriteRequest, DataSample, DimensionSpec, SampleKind, SamplePayload,
    ServerInfo, ServerRegistration, SubQuery, TieredRequest,
};
use countermesh_server::api::{self, AppState};
use countermesh_server::auth::{BearerTokenAuth, NoAuth};
use countermesh_server::buffer_pool::BufferPool;
use countermesh_server::fanout::FanoutEngine;
use countermesh_server::query_handler::QueryHandler;
use countermesh_server::registry::Registry;
use countermesh_server::transport::MockTransport;
use countermesh_storage::{DataManager, InMemoryDataManager};
use tower::ServiceExt;

fn test_router() -> (Router, Arc<dyn DataManager>) {
    let data_manager: Arc<dyn DataManager> = Arc::new(InMemoryDataManager::new());
    let registry = Arc::new(Registry::new(600_000, countermesh_core::null_tracer()));
    let fanout = Arc::new(FanoutEngine::new(
        Arc::new(MockTransport::always_ok()),
        countermesh_core::null_tracer(),
        0.9,
    ));
    let local_server = ServerInfo::new("self", 7100);
    let query_handler = Arc::new(QueryHandler::new(
        data_manager.clone(),
        fanout,
        registry.clone(),
        local_server.clone(),
        true,
    ));
    let state = AppState {
        query_handler,
        data_manager: data_manager.clone(),
        registry,
        authenticator: Arc::new(NoAuth),
        local_server,
        buffer_pool: BufferPool::new(),
    };
    (api::build_router(state), data_manager)
}

async fn send(router: &Router, method: &str, uri: &str, content_type: &str, body: Vec<u8>) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", content_type)
        .header("accept", "application/json")
        .body(Body::from(body))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn ping_is_never_gated_and_returns_the_liveness_string() {
    let (router, _) = test_router();
    let request = Request::builder().uri("/ping").body(Body::empty()).unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"Service is available.");
}

#[tokio::test]
async fn write_then_query_round_trips_through_http() {
    let (router, _) = test_router();

    let write_body = serde_json::to_vec(&CounterWriteRequest {
        samples: vec![DataSample::new(
            SampleKind::HitCount,
            DimensionSpec::new(),
            0,
            60_000,
            SamplePayload::HitCount { hits: 9 },
            1,
        )
        .unwrap()],
    })
    .unwrap();
    let (status, _) = send(&router, "POST", "/write/requests", "application/json", write_body).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut dims = DimensionSpec::new();
    dims.insert("start", "0");
    dims.insert("end", "60000");
    let query_body = serde_json::to_vec(&TieredRequest::new(dims, 16, 5_000)).unwrap();
    let (status, body) = send(&router, "POST", "/counters/requests/query", "application/json", query_body).await;
    assert_eq!(status, StatusCode::OK);

    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["samples"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn querying_an_unknown_counter_yields_404() {
    let (router, _) = test_router();
    let query_body = serde_json::to_vec(&TieredRequest::new(DimensionSpec::new(), 16, 5_000)).unwrap();
    let (status, _) = send(&router, "POST", "/counters/unknown/query", "application/json", query_body).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn batch_query_reports_per_subquery_status() {
    let (router, data_manager) = test_router();
    data_manager
        .write(
            "requests",
            vec![DataSample::new(
                SampleKind::HitCount,
                DimensionSpec::new(),
                0,
                60_000,
                SamplePayload::HitCount { hits: 3 },
                1,
            )
            .unwrap()],
        )
        .await
        .unwrap();

    let batch_request = BatchQueryRequest {
        queries: vec![
            SubQuery { user_context: String::new(), counter: "requests".to_string(), dimensions: DimensionSpec::new() },
            SubQuery { user_context: String::new(), counter: "unknown".to_string(), dimensions: DimensionSpec::new() },
        ],
        sources: Vec::new(),
        max_fanout: 16,
        fanout_timeout_ms: 5_000,
        include_request_diagnostics: false,
    };
    let (status, body) = send(&router, "POST", "/batchQuery", "application/json", serde_json::to_vec(&batch_request).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let responses = parsed["responses"].as_array().unwrap();
    assert_eq!(responses.len(), 2);
}

#[tokio::test]
async fn register_then_list_servers_round_trips() {
    let (router, _) = test_router();
    let registration = ServerRegistration {
        server: ServerInfo::new("peer-a", 7100),
        counters: Default::default(),
    };
    let (status, _) = send(&router, "POST", "/register", "application/json", serde_json::to_vec(&registration).unwrap()).await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .method("GET")
        .uri("/listServers")
        .header("accept", "application/json")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["servers"].as_array().unwrap().len(), 1);
}

fn test_router_with_auth() -> Router {
    let data_manager: Arc<dyn DataManager> = Arc::new(InMemoryDataManager::new());
    let registry = Arc::new(Registry::new(600_000, countermesh_core::null_tracer()));
    let fanout = Arc::new(FanoutEngine::new(
        Arc::new(MockTransport::always_ok()),
        countermesh_core::null_tracer(),
        0.9,
    ));
    let local_server = ServerInfo::new("self", 7100);
    let query_handler = Arc::new(QueryHandler::new(
        data_manager.clone(),
        fanout,
        registry.clone(),
        local_server.clone(),
        true,
    ));
    let state = AppState {
        query_handler,
        data_manager,
        registry,
        authenticator: Arc::new(BearerTokenAuth::new("secret-token".to_string())),
        local_server,
        buffer_pool: BufferPool::new(),
    };
    api::build_router(state)
}

#[tokio::test]
async fn ping_bypasses_auth_but_protected_routes_reject_missing_token() {
    let router = test_router_with_auth();

    let ping = Request::builder().uri("/ping").body(Body::empty()).unwrap();
    assert_eq!(router.clone().oneshot(ping).await.unwrap().status(), StatusCode::OK);

    let query_body = serde_json::to_vec(&TieredRequest::new(DimensionSpec::new(), 16, 5_000)).unwrap();
    let unauthorized = Request::builder()
        .method("POST")
        .uri("/counters/requests/query")
        .header("content-type", "application/json")
        .body(Body::from(query_body.clone()))
        .unwrap();
    assert_eq!(router.clone().oneshot(unauthorized).await.unwrap().status(), StatusCode::UNAUTHORIZED);

    let authorized = Request::builder()
        .method("POST")
        .uri("/counters/requests/query")
        .header("content-type", "application/json")
        .header("authorization", "Bearer secret-token")
        .body(Body::from(query_body))
        .unwrap();
    let response = router.oneshot(authorized).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
