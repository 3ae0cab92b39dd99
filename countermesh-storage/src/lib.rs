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

//! The local counter store boundary: the `DataManager` trait plus an
//! in-memory implementation. The store's internals (compaction,
//! persistence, on-disk layout) are out of scope for this workspace.

pub mod data_manager;
pub mod memory;

pub use data_manager::DataManager;
pub use memory::InMemoryDataManager;
