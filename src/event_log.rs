//! Structured event log for the debugger/log sink
//!
//! Append-only record of everything the engine does: run-state transitions,
//! flow-state lifecycle, component executions, output values, traversed
//! connection lines, breakpoint hits and routed errors. A debugger UI reads
//! this; tests assert against it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::debug::RunState;

/// Single event in the execution log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since runtime creation (ms)
    pub timestamp_ms: u64,
    /// Event type and data
    pub kind: EventKind,
}

/// All event types, tagged for persistence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // RUNTIME LEVEL
    // ═══════════════════════════════════════════
    RuntimeStarted {
        flow_count: usize,
    },
    RuntimeStopped {
        error: Option<String>,
    },
    StateTransition {
        from: RunState,
        to: RunState,
    },

    // ═══════════════════════════════════════════
    // FLOW-STATE LEVEL
    // ═══════════════════════════════════════════
    FlowStateCreated {
        flow_state: usize,
        flow: String,
        parent: Option<usize>,
    },
    FlowStateFinished {
        flow_state: usize,
    },

    // ═══════════════════════════════════════════
    // COMPONENT LEVEL
    // ═══════════════════════════════════════════
    ComponentExecuted {
        flow_state: usize,
        component: String,
    },
    ComponentError {
        flow_state: usize,
        component: String,
        message: String,
    },
    OutputValue {
        flow_state: usize,
        component: String,
        output: String,
        value: Value,
    },
    ConnectionTraversed {
        flow_state: usize,
        source: String,
        output: String,
        target: String,
        input: String,
    },
    BreakpointHit {
        flow_state: usize,
        component: String,
    },
    LogInfo {
        flow_state: usize,
        component: String,
        message: String,
    },
}

impl EventKind {
    /// Extract the component id if the event is component-related
    pub fn component_id(&self) -> Option<&str> {
        match self {
            Self::ComponentExecuted { component, .. }
            | Self::ComponentError { component, .. }
            | Self::OutputValue { component, .. }
            | Self::BreakpointHit { component, .. }
            | Self::LogInfo { component, .. } => Some(component),
            _ => None,
        }
    }

    /// Extract the flow-state index if the event carries one
    pub fn flow_state(&self) -> Option<usize> {
        match self {
            Self::FlowStateCreated { flow_state, .. }
            | Self::FlowStateFinished { flow_state }
            | Self::ComponentExecuted { flow_state, .. }
            | Self::ComponentError { flow_state, .. }
            | Self::OutputValue { flow_state, .. }
            | Self::ConnectionTraversed { flow_state, .. }
            | Self::BreakpointHit { flow_state, .. }
            | Self::LogInfo { flow_state, .. } => Some(*flow_state),
            Self::RuntimeStarted { .. }
            | Self::RuntimeStopped { .. }
            | Self::StateTransition { .. } => None,
        }
    }

    /// Check if this is a runtime-level event
    pub fn is_runtime_event(&self) -> bool {
        matches!(
            self,
            Self::RuntimeStarted { .. }
                | Self::RuntimeStopped { .. }
                | Self::StateTransition { .. }
        )
    }
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event, returns its ID
    pub fn emit(&self, kind: EventKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        };
        self.events.write().push(event);
        id
    }

    /// Get all events (cloned)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Filter events by component id
    pub fn filter_component(&self, component: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.component_id() == Some(component))
            .collect()
    }

    /// Filter events by flow-state index
    pub fn filter_flow_state(&self, flow_state: usize) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.flow_state() == Some(flow_state))
            .collect()
    }

    /// Runtime-level events only
    pub fn runtime_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.is_runtime_event())
            .collect()
    }

    /// Serialize to JSON for persistence/debugging
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.events()).unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eventkind_component_id_extraction() {
        let executed = EventKind::ComponentExecuted {
            flow_state: 0,
            component: "log1".into(),
        };
        assert_eq!(executed.component_id(), Some("log1"));

        let started = EventKind::RuntimeStarted { flow_count: 2 };
        assert_eq!(started.component_id(), None);
        assert!(started.is_runtime_event());
    }

    #[test]
    fn eventkind_serializes_with_type_tag() {
        let kind = EventKind::OutputValue {
            flow_state: 1,
            component: "calc".into(),
            output: "value".into(),
            value: json!(42),
        };

        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "output_value");
        assert_eq!(json["component"], "calc");
        assert_eq!(json["value"], 42);
    }

    #[test]
    fn eventkind_deserializes_from_tagged_json() {
        let json = json!({
            "type": "component_error",
            "flow_state": 0,
            "component": "fetch",
            "message": "timeout"
        });

        let kind: EventKind = serde_json::from_value(json).unwrap();
        assert_eq!(
            kind,
            EventKind::ComponentError {
                flow_state: 0,
                component: "fetch".into(),
                message: "timeout".into(),
            }
        );
    }

    #[test]
    fn eventlog_emit_returns_monotonic_ids() {
        let log = EventLog::new();
        let id1 = log.emit(EventKind::RuntimeStarted { flow_count: 1 });
        let id2 = log.emit(EventKind::ComponentExecuted {
            flow_state: 0,
            component: "a".into(),
        });
        assert_eq!(id1, 0);
        assert_eq!(id2, 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn eventlog_filter_component_returns_only_matching() {
        let log = EventLog::new();
        log.emit(EventKind::ComponentExecuted {
            flow_state: 0,
            component: "a".into(),
        });
        log.emit(EventKind::ComponentExecuted {
            flow_state: 0,
            component: "b".into(),
        });
        log.emit(EventKind::LogInfo {
            flow_state: 0,
            component: "a".into(),
            message: "hi".into(),
        });

        assert_eq!(log.filter_component("a").len(), 2);
        assert_eq!(log.filter_component("b").len(), 1);
    }

    #[test]
    fn eventlog_filter_flow_state() {
        let log = EventLog::new();
        log.emit(EventKind::FlowStateCreated {
            flow_state: 0,
            flow: "main".into(),
            parent: None,
        });
        log.emit(EventKind::FlowStateCreated {
            flow_state: 1,
            flow: "save".into(),
            parent: Some(0),
        });
        log.emit(EventKind::FlowStateFinished { flow_state: 1 });

        assert_eq!(log.filter_flow_state(1).len(), 2);
        assert_eq!(log.filter_flow_state(0).len(), 1);
    }

    #[test]
    fn eventlog_clone_shares_underlying_log() {
        let log = EventLog::new();
        log.emit(EventKind::RuntimeStarted { flow_count: 1 });

        let cloned = log.clone();
        assert_eq!(cloned.len(), 1);

        log.emit(EventKind::RuntimeStopped { error: None });
        assert_eq!(cloned.len(), 2);
    }

    #[test]
    fn eventlog_to_json() {
        let log = EventLog::new();
        log.emit(EventKind::BreakpointHit {
            flow_state: 0,
            component: "act1".into(),
        });

        let json = log.to_json();
        assert!(json.is_array());
        assert_eq!(json[0]["kind"]["type"], "breakpoint_hit");
    }
}
