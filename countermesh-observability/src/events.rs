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

//! `LoggingTracer`: the default `countermesh_core::Tracer` implementation.
//! Emits each event as a `tracing` event at `debug` level with the event
//! name and fields attached — no global exporter, no background flush
//! task, just ordinary log lines a node's existing `tracing-subscriber`
//! pipeline already captures.

use countermesh_core::{EventId, FieldValue, Tracer};

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTracer;

impl Tracer for LoggingTracer {
    fn event(&self, id: EventId, fields: &[(&str, FieldValue)]) {
        tracing::debug!(
            event = id.name(),
            fields = ?fields.iter().map(|(k, v)| (*k, format!("{v:?}"))).collect::<Vec<_>>(),
            "countermesh event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_without_panicking() {
        let tracer = LoggingTracer;
        tracer.event(
            EventId::FanoutCompleted,
            &[("sources", 3i64.into()), ("ok", true.into())],
        );
    }
}
