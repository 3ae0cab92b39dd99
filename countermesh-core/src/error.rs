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

//! Typed errors shared by every crate in the workspace.
//!
//! `QueryError` is the programmatic error surfaced by aggregators and the
//! local `DataManager`; the HTTP layer (`countermesh-server`) maps it to a
//! status code rather than inspecting a string.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryError {
    #[error("invalid dimension: {0}")]
    InvalidDimension(String),

    #[error("counter not found: {0}")]
    CounterNotFound(String),

    #[error("attempted to merge a per-machine percentile sample")]
    PercentileOnPerMachineSample,

    #[error("samples do not share dimensions or kind and cannot be merged")]
    IncompatibleSamples,

    #[error("duplicate user_context in batch request: {0}")]
    DuplicateUserContext(String),

    #[error("machine_count or sample arithmetic overflowed")]
    Overflow,

    #[error("unknown percentile specifier: {0}")]
    InvalidPercentile(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type QueryResult<T> = Result<T, QueryError>;
