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

//! `POST /batchQuery`: many sub-queries, one round trip.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use countermesh_core::BatchQueryRequest;

use super::{decode_body, encode_response, ApiError, AppState};
use crate::transport::Transport;

pub async fn batch_query<T: Transport + 'static>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: BatchQueryRequest = decode_body(&headers, &body)?;
    let response = state.query_handler.handle_batch_query(request).await?;
    encode_response(&headers, StatusCode::OK, &state.buffer_pool, &response)
}
