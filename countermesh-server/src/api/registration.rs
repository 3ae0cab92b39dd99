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

//! `POST /register` and `GET /listServers`: the gossip surface peers use
//! to discover each other (spec §5).

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use countermesh_core::{ListServerResponse, ServerRegistration};

use super::{decode_body, encode_response, ApiError, AppState};
use crate::transport::Transport;

pub async fn register<T: Transport + 'static>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let registration: ServerRegistration = decode_body(&headers, &body)?;
    state.registry.insert_or_update(registration);
    Ok(StatusCode::OK.into_response())
}

pub async fn list_servers<T: Transport + 'static>(
    State(state): State<AppState<T>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let response = ListServerResponse { servers: state.registry.list() };
    encode_response(&headers, StatusCode::OK, &state.buffer_pool, &response)
}
