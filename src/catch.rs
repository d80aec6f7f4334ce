//! Error routing
//!
//! A failed execute leaves through exactly one of three doors, in order of
//! precedence: a connection line wired to the component's own `@error`
//! output, the nearest catch-error component walking the flow state itself
//! first and then its ancestors, or a fatal runtime stop. When an ancestor
//! catches, the failing invocation chain below it is abandoned: its queued
//! tasks are purged, suspended executions are disposed, and its action
//! invocations are finished without pulsing their call sites.

use std::sync::Arc;

use serde_json::Value;
use tracing::error;

use crate::event_log::EventKind;
use crate::flow::{ComponentKind, FlowRole, CATCH_MESSAGE_INPUT, ERROR_OUTPUT};
use crate::runtime::Runtime;
use crate::state::FlowStateId;

impl Runtime {
    pub(crate) fn route_error(
        &mut self,
        flow_state: FlowStateId,
        component: usize,
        message: String,
    ) {
        let flow = match self.arena.get(flow_state) {
            Some(state) => Arc::clone(&state.flow),
            None => return,
        };
        let component_id = flow.components[component].id.to_string();
        error!(flow = %flow.name, component = %component_id, %message, "component failed");
        self.error = Some(message.clone());
        if let Some(state) = self.arena.get_mut(flow_state) {
            state.error = Some(message.clone());
        }
        self.events.emit(EventKind::ComponentError {
            flow_state: flow_state.index(),
            component: component_id.clone(),
            message: message.clone(),
        });

        // A failing catch component must not re-enter catch routing
        if matches!(flow.components[component].kind, ComponentKind::CatchError) {
            self.events.emit(EventKind::LogInfo {
                flow_state: flow_state.index(),
                component: component_id,
                message: format!("catch component failed: {}", message),
            });
            return;
        }

        let has_error_edge = flow
            .outgoing(component)
            .iter()
            .any(|&ci| flow.connections[ci].output.as_ref() == ERROR_OUTPUT);
        if has_error_edge {
            self.propagate_value(flow_state, component, ERROR_OUTPUT, Value::String(message));
            return;
        }

        let holder = self.find_catch_holder(flow_state);
        match holder {
            Some((holder_id, catch)) => {
                if holder_id == flow_state {
                    // the failing flow handles its own error and continues
                    // into the catch; its child invocations are abandoned
                    self.purge_tasks_of(flow_state, false);
                    let children: Vec<FlowStateId> = self
                        .arena
                        .get(flow_state)
                        .map(|state| state.children.clone())
                        .unwrap_or_default();
                    for child in children {
                        self.abandon_subtree(child);
                    }
                } else {
                    // topmost abandoned state: the chain member directly
                    // below the catch holder
                    let mut top = flow_state;
                    while let Some(parent) = self.arena.get(top).and_then(|s| s.parent) {
                        if parent == holder_id {
                            break;
                        }
                        top = parent;
                    }
                    self.purge_tasks_of(top, true);
                    self.abandon_subtree(top);
                }
                self.deliver(
                    holder_id,
                    catch,
                    CATCH_MESSAGE_INPUT,
                    Value::String(message),
                    None,
                );
            }
            None => self.stop_with_error(message),
        }
    }

    /// Nearest flow state owning a catch-error component, self first
    fn find_catch_holder(&self, flow_state: FlowStateId) -> Option<(FlowStateId, usize)> {
        let mut cursor = Some(flow_state);
        while let Some(id) = cursor {
            let state = self.arena.get(id)?;
            if let Some(catch) = state.flow.catch_component() {
                return Some((id, catch));
            }
            cursor = state.parent;
        }
        None
    }

    /// Finish every action invocation in the subtree without pulsing call
    /// sites, disposing suspended executions along the way.
    fn abandon_subtree(&mut self, root: FlowStateId) {
        for id in self.arena.ids() {
            if !self.arena.is_same_or_descendant(id, root) {
                continue;
            }
            let disposers: Vec<_> = match self.arena.get_mut(id) {
                Some(state) => state
                    .component_states
                    .iter_mut()
                    .filter_map(|cs| {
                        cs.is_running = false;
                        cs.disposer.take()
                    })
                    .collect(),
                None => continue,
            };
            for d in disposers {
                d.dispose();
            }
            let newly = self
                .arena
                .get_mut(id)
                .map(|state| state.flow.role == FlowRole::Action && state.mark_finished())
                .unwrap_or(false);
            if newly {
                self.events
                    .emit(EventKind::FlowStateFinished { flow_state: id.index() });
            }
        }
    }
}
