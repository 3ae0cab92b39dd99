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

//! `POST /counters/<name>/query` and `/counters/<name>/info`.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use countermesh_core::TieredRequest;

use super::{decode_body, encode_response, ApiError, AppState};
use crate::transport::Transport;

pub async fn query_counter<T: Transport + 'static>(
    State(state): State<AppState<T>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: TieredRequest = decode_body(&headers, &body)?;
    let response = state.query_handler.handle_counter_query(&name, request).await?;
    let status = StatusCode::from_u16(response.http_code).unwrap_or(StatusCode::OK);
    encode_response(&headers, status, &state.buffer_pool, &response)
}

pub async fn info_counter<T: Transport + 'static>(
    State(state): State<AppState<T>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: TieredRequest = decode_body(&headers, &body)?;
    let response = state.query_handler.handle_counter_info(&name, request).await?;
    let status = StatusCode::from_u16(response.http_code).unwrap_or(StatusCode::OK);
    encode_response(&headers, status, &state.buffer_pool, &response)
}
