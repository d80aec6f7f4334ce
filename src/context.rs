//! Execution context handed to component handlers
//!
//! The context is the whole contract a concrete node kind sees: property
//! evaluation, buffered input access, value propagation, variable
//! assignment, async completion handles and structured logging. Handlers
//! never touch the runtime directly.

use serde_json::Value;

use crate::component::ComponentError;
use crate::event_log::EventKind;
use crate::flow::SEQ_OUT;
use crate::runtime::Runtime;
use crate::state::FlowStateId;

/// Identifies a suspended execution so an external callback can complete it
/// later via `Runtime::propagate_value` / `Runtime::end_async_execution`.
#[derive(Debug, Clone, Copy)]
pub struct AsyncHandle {
    pub flow_state: FlowStateId,
    pub component: usize,
}

pub struct ExecuteContext<'a> {
    runtime: &'a mut Runtime,
    flow_state: FlowStateId,
    component: usize,
}

impl<'a> ExecuteContext<'a> {
    pub(crate) fn new(runtime: &'a mut Runtime, flow_state: FlowStateId, component: usize) -> Self {
        Self {
            runtime,
            flow_state,
            component,
        }
    }

    pub fn flow_state(&self) -> FlowStateId {
        self.flow_state
    }

    /// Evaluate a component property. String properties starting with `$`
    /// are variable references resolved through the data context; anything
    /// else is a literal.
    pub fn evaluate_property(&self, name: &str) -> Option<Value> {
        let state = self.runtime.arena.get(self.flow_state)?;
        let raw = state.flow.components[self.component].properties.get(name)?;
        match raw {
            Value::String(s) if s.starts_with('$') => self.get_variable(&s[1..]),
            other => Some(other.clone()),
        }
    }

    /// Last buffered value of a named input, if it has fired
    pub fn input(&self, name: &str) -> Option<Value> {
        self.runtime
            .arena
            .get(self.flow_state)
            .and_then(|s| s.component_states[self.component].inputs.get(name).cloned())
    }

    pub fn clear_input(&mut self, name: &str) {
        if let Some(state) = self.runtime.arena.get_mut(self.flow_state) {
            state.component_states[self.component].inputs.remove(name);
        }
    }

    /// Deliver a value through every connection line leaving the named output
    pub fn propagate(&mut self, output: &str, value: Value) {
        self.runtime
            .propagate_value(self.flow_state, self.component, output, value);
    }

    /// Pulse the default sequence output
    pub fn propagate_through_seq(&mut self) {
        self.propagate(SEQ_OUT, Value::Null);
    }

    /// Resolve a variable through the data context chain, then globals
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.runtime.get_variable(self.flow_state, name)
    }

    /// Assign into the data context; writes to the frame that defines the
    /// name, falling back to globals, else the local frame.
    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.runtime.set_variable(self.flow_state, name, value);
    }

    /// Assign through a `$variable` property reference
    pub fn assign(&mut self, property: &str, value: Value) -> Result<(), ComponentError> {
        let state = self
            .runtime
            .arena
            .get(self.flow_state)
            .ok_or_else(|| ComponentError::from("flow state gone"))?;
        let raw = state.flow.components[self.component]
            .properties
            .get(property)
            .cloned()
            .ok_or_else(|| ComponentError(format!("missing property '{}'", property)))?;
        match raw {
            Value::String(s) if s.starts_with('$') => {
                let name = s[1..].to_string();
                self.set_variable(&name, value);
                Ok(())
            }
            _ => Err(ComponentError(format!(
                "property '{}' is not a $variable reference",
                property
            ))),
        }
    }

    /// Handle for completing this execution after a suspension
    pub fn async_handle(&self) -> AsyncHandle {
        AsyncHandle {
            flow_state: self.flow_state,
            component: self.component,
        }
    }

    /// Emit an informational entry to the debugger/log sink
    pub fn log_info(&self, message: impl Into<String>) {
        let component = self
            .runtime
            .arena
            .get(self.flow_state)
            .map(|s| s.flow.components[self.component].id.to_string())
            .unwrap_or_default();
        self.runtime.events.emit(EventKind::LogInfo {
            flow_state: self.flow_state.index(),
            component,
            message: message.into(),
        });
    }
}
