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

//! Structured eventing abstraction injected into the fanout engine,
//! query handler and poller (see design note 1: "no global static
//! required"). This is deliberately smaller than a full tracing SDK —
//! `countermesh-observability` provides a `tracing`-backed implementation;
//! production code can swap in an OTel-backed one without touching this
//! trait.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventId {
    FanoutBlockDispatched,
    FanoutLeaderTimedOut,
    FanoutLeaderFailed,
    FanoutCompleted,
    RegistrationReceived,
    RegistrationStale,
    PeerExpired,
    PollCycleStarted,
    PollCycleCompleted,
    PollCounterSkipped,
}

impl EventId {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FanoutBlockDispatched => "fanout.block_dispatched",
            Self::FanoutLeaderTimedOut => "fanout.leader_timed_out",
            Self::FanoutLeaderFailed => "fanout.leader_failed",
            Self::FanoutCompleted => "fanout.completed",
            Self::RegistrationReceived => "registry.registration_received",
            Self::RegistrationStale => "registry.registration_stale",
            Self::PeerExpired => "registry.peer_expired",
            Self::PollCycleStarted => "poller.cycle_started",
            Self::PollCycleCompleted => "poller.cycle_completed",
            Self::PollCounterSkipped => "poller.counter_skipped",
        }
    }
}

#[derive(Debug, Clone)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}
impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}
impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}
impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::Int(v as i64)
    }
}
impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        Self::Int(v as i64)
    }
}
impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}
impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// A handle passed into `FanoutEngine`/`QueryHandler`/`AggregationPoller`.
/// Implementations must be cheap to clone (they're usually an `Arc`
/// around a sink) and must not block the caller.
pub trait Tracer: Send + Sync {
    fn event(&self, id: EventId, fields: &[(&str, FieldValue)]);
}

/// Default: drops every event. Zero overhead, used in tests and any node
/// that hasn't wired a real sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTracer;

impl Tracer for NullTracer {
    fn event(&self, _id: EventId, _fields: &[(&str, FieldValue)]) {}
}

pub type SharedTracer = Arc<dyn Tracer>;

pub fn null_tracer() -> SharedTracer {
    Arc::new(NullTracer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_tracer_is_a_harmless_default() {
        let tracer = null_tracer();
        tracer.event(EventId::FanoutCompleted, &[("sources", 3i64.into())]);
    }
}
