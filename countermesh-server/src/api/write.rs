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

//! `POST /write/<name>` and `/transfer/<name>`: the only endpoints that
//! touch the local `DataManager` directly rather than going through the
//! query/fanout layer.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use countermesh_core::CounterWriteRequest;
use serde::Deserialize;

use super::{decode_body, encode_response, ApiError, AppState};
use crate::transport::Transport;

pub async fn write_counter<T: Transport + 'static>(
    State(state): State<AppState<T>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: CounterWriteRequest = decode_body(&headers, &body)?;
    state.data_manager.write(&name, request.samples).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}

#[derive(Debug, Deserialize, Default)]
pub struct TransferParams {
    start: Option<u64>,
    end: Option<u64>,
}

pub async fn transfer_counter<T: Transport + 'static>(
    State(state): State<AppState<T>>,
    Path(name): Path<String>,
    Query(params): Query<TransferParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let samples = state.data_manager.transfer(&name, params.start, params.end).await?;
    encode_response(&headers, StatusCode::OK, &state.buffer_pool, &samples)
}
