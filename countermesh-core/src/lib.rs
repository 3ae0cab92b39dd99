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

//! Data model, sample-merge arithmetic, error types and the structured
//! eventing trait shared by every crate in the workspace.

pub mod error;
pub mod merge;
pub mod model;
pub mod tracer;
pub mod util;

pub use error::{QueryError, QueryResult};
pub use model::{
    BatchQueryRequest, BatchQueryResponse, CounterInfo, CounterInfoResponse, CounterQueryResponse,
    CounterWriteRequest, DataSample, DimensionSpec, FanoutEnvelope, ListServerResponse,
    PeerRecord, RequestDetails, RequestStatus, SampleKind, SamplePayload, ServerInfo,
    ServerRegistration, SubQuery, TieredRequest, TransferRequest,
};
pub use tracer::{EventId, FieldValue, NullTracer, SharedTracer, Tracer};
