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

//! HTTP surface: one module per endpoint group (spec §6's table), shared
//! `AppState`/`ApiError` here.

pub mod batch;
pub mod counters;
pub mod health;
pub mod registration;
pub mod write;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware as axum_middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use countermesh_core::{QueryError, ServerInfo};
use countermesh_storage::DataManager;
use serde::Serialize;
use thiserror::Error;

use crate::auth::Authenticator;
use crate::buffer_pool::BufferPool;
use crate::codec::{negotiate_request_codec, CodecError};
use crate::fanout::FanoutEngine;
use crate::query_handler::QueryHandler;
use crate::registry::Registry;
use crate::transport::Transport;

/// Everything a handler needs, cloned per request (every field is an
/// `Arc`, so cloning is cheap regardless of `T`).
pub struct AppState<T: Transport> {
    pub query_handler: Arc<QueryHandler<T>>,
    pub data_manager: Arc<dyn DataManager>,
    pub registry: Arc<Registry>,
    pub authenticator: Arc<dyn Authenticator>,
    pub local_server: ServerInfo,
    pub buffer_pool: Arc<BufferPool>,
}

impl<T: Transport> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            query_handler: self.query_handler.clone(),
            data_manager: self.data_manager.clone(),
            registry: self.registry.clone(),
            authenticator: self.authenticator.clone(),
            local_server: self.local_server.clone(),
            buffer_pool: self.buffer_pool.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("failed to decode request body: {0}")]
    Codec(#[from] CodecError),
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] crate::auth::AuthError),
    #[error("bad request: {0}")]
    BadRequest(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Query(e) => query_error_status(e),
            ApiError::Codec(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// Mirrors `query_handler::map_query_error`'s local-failure mapping
/// (spec §7) for errors that escape all the way to the HTTP boundary.
fn query_error_status(err: &QueryError) -> StatusCode {
    match err {
        QueryError::InvalidDimension(_)
        | QueryError::DuplicateUserContext(_)
        | QueryError::InvalidPercentile(_) => StatusCode::BAD_REQUEST,
        QueryError::CounterNotFound(_) => StatusCode::NOT_FOUND,
        QueryError::PercentileOnPerMachineSample
        | QueryError::IncompatibleSamples
        | QueryError::Overflow
        | QueryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Decode a request body using the codec named by its `Content-Type`
/// (defaulting to the compact binary codec, per spec §6).
pub(crate) fn decode_body<T: serde::de::DeserializeOwned>(headers: &HeaderMap, body: &Bytes) -> Result<T, ApiError> {
    let content_type = headers.get(axum::http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let codec = negotiate_request_codec(content_type);
    Ok(codec.decode(body)?)
}

/// Encode a response using the codec named by its `Accept` header. The
/// body is serialized directly into a pooled buffer (spec §5's
/// "Shared-resource policy") rather than a fresh allocation per request.
pub(crate) fn encode_response<T: serde::Serialize>(
    headers: &HeaderMap,
    status: StatusCode,
    pool: &Arc<BufferPool>,
    value: &T,
) -> Result<Response, ApiError> {
    let accept = headers.get(axum::http::header::ACCEPT).and_then(|v| v.to_str().ok());
    let codec = negotiate_request_codec(accept);
    let mut buf = pool.checkout(4 * 1024);
    codec.encode_into(&mut buf, value)?;
    let body = Bytes::from(buf.into_vec());
    Ok((status, [(axum::http::header::CONTENT_TYPE, codec.content_type())], body).into_response())
}

async fn auth_middleware<T: Transport + 'static>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: axum_middleware::Next,
) -> Result<Response, ApiError> {
    state.authenticator.authenticate(&headers)?;
    Ok(next.run(request).await)
}

/// Assemble the full router: `/ping` stays outside the auth layer (spec
/// §6: it is a liveness probe, never gated).
pub fn build_router<T: Transport + 'static>(state: AppState<T>) -> Router {
    let protected = Router::<AppState<T>>::new()
        .route("/counters/:name/query", post(counters::query_counter::<T>))
        .route("/counters/:name/info", post(counters::info_counter::<T>))
        .route("/batchQuery", post(batch::batch_query::<T>))
        .route("/write/:name", post(write::write_counter::<T>))
        .route("/transfer/:name", post(write::transfer_counter::<T>).get(write::transfer_counter::<T>))
        .route("/register", post(registration::register::<T>))
        .route("/listServers", get(registration::list_servers::<T>))
        .layer(axum_middleware::from_fn_with_state(state.clone(), auth_middleware::<T>));

    let public = Router::<AppState<T>>::new().route("/ping", get(health::ping));

    public.merge(protected).with_state(state)
}
