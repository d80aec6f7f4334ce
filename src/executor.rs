//! Component execution: readiness, delivery, propagation, finish accounting
//!
//! Everything here is driven by the pump (`scheduler`). A run either
//! completes, suspends (async launch) or fails; failures leave through
//! `route_error` in `catch`. Sequence pulses fired before a run are cleared
//! when it ends; a pulse that arrives during the run carries a fresh marker
//! and survives, which is what keeps feedback cycles alive.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::component::ExecOutcome;
use crate::context::ExecuteContext;
use crate::event_log::EventKind;
use crate::flow::{ComponentKind, FlowRole, PortRole, CATCH_MESSAGE_INPUT, SEQ_OUT};
use crate::runtime::{QueueTask, Runtime};
use crate::state::{Caller, FlowStateId};

impl Runtime {
    /// Whether a component could run right now, per its kind:
    /// decorations never run, widgets run once touched, catch components
    /// need a buffered message, start markers are seeded explicitly.
    /// Everything else needs a fired sequence pulse (when any sequence
    /// input is wired) plus every mandatory data input buffered.
    pub fn is_ready_to_run(&self, flow_state: FlowStateId, component: usize) -> bool {
        let Some(state) = self.arena.get(flow_state) else {
            return false;
        };
        let comp = &state.flow.components[component];
        let cs = &state.component_states[component];
        match comp.kind {
            ComponentKind::Decoration => false,
            ComponentKind::Widget => cs.touched,
            ComponentKind::CatchError => cs.inputs.contains_key(CATCH_MESSAGE_INPUT),
            ComponentKind::Start => true,
            _ => {
                if comp.has_connected_seq_input {
                    let pulsed = cs
                        .inputs
                        .keys()
                        .any(|name| comp.input_role(name) == PortRole::Sequence);
                    if !pulsed {
                        return false;
                    }
                }
                comp.mandatory_inputs
                    .iter()
                    .all(|name| cs.inputs.contains_key(name))
            }
        }
    }

    fn queued(&self, flow_state: FlowStateId, component: usize) -> bool {
        self.queue
            .iter()
            .any(|t| t.flow_state == flow_state && t.component == component)
    }

    /// External input injection (UI widgets, host callbacks)
    pub fn set_input_value(
        &mut self,
        flow_state: FlowStateId,
        component: usize,
        input: &str,
        value: Value,
    ) {
        self.deliver(flow_state, component, input, value, None);
    }

    /// Buffer a value on a component input, then enqueue the target when it
    /// is ready and not already queued. Sequence inputs store a fresh pulse
    /// marker instead of the carried value.
    pub(crate) fn deliver(
        &mut self,
        flow_state: FlowStateId,
        component: usize,
        input: &str,
        value: Value,
        connection: Option<usize>,
    ) {
        let role = match self.arena.get(flow_state) {
            Some(state) => state.flow.components[component].input_role(input),
            None => return,
        };
        let stored = if role == PortRole::Sequence {
            self.pulse_serial += 1;
            Value::from(self.pulse_serial)
        } else {
            value
        };
        if let Some(state) = self.arena.get_mut(flow_state) {
            let cs = &mut state.component_states[component];
            cs.inputs.insert(input.to_string(), stored);
            cs.touched = true;
        }
        if self.is_ready_to_run(flow_state, component) && !self.queued(flow_state, component) {
            self.push_task(flow_state, component, connection);
        }
    }

    /// Deliver a value through every connection line leaving the named
    /// output, in declaration order.
    pub fn propagate_value(
        &mut self,
        flow_state: FlowStateId,
        component: usize,
        output: &str,
        value: Value,
    ) {
        let flow = match self.arena.get(flow_state) {
            Some(state) => Arc::clone(&state.flow),
            None => return,
        };
        self.events.emit(EventKind::OutputValue {
            flow_state: flow_state.index(),
            component: flow.components[component].id.to_string(),
            output: output.to_string(),
            value: value.clone(),
        });
        for &ci in flow.outgoing(component) {
            let conn = &flow.connections[ci];
            if conn.output.as_ref() == output {
                self.deliver(flow_state, conn.target, &conn.input, value.clone(), Some(ci));
            }
        }
    }

    /// Run a component outside the queue (widget seeding at startup)
    pub(crate) fn run_now(&mut self, flow_state: FlowStateId, component: usize) {
        if let Some(state) = self.arena.get_mut(flow_state) {
            state.num_active_components += 1;
        }
        self.run_task(QueueTask {
            flow_state,
            component,
            connection: None,
        });
    }

    /// Execute one task: dispatch on the component kind, then settle the
    /// outcome (completion pulse, suspension, or error routing).
    pub(crate) fn run_task(&mut self, task: QueueTask) {
        let fs_id = task.flow_state;
        let ci = task.component;
        let (flow, finished) = match self.arena.get(fs_id) {
            Some(state) => (Arc::clone(&state.flow), state.is_finished),
            None => return,
        };
        if finished {
            if let Some(state) = self.arena.get_mut(fs_id) {
                state.num_active_components -= 1;
            }
            return;
        }

        let component_id = flow.components[ci].id.to_string();

        // Snapshot the pulses that triggered this run; exactly these are
        // cleared when the run ends.
        let fired: Vec<(String, Value)> = {
            let state = match self.arena.get_mut(fs_id) {
                Some(s) => s,
                None => return,
            };
            let cs = &mut state.component_states[ci];
            cs.is_running = true;
            cs.touched = true;
            let comp = &flow.components[ci];
            cs.inputs
                .iter()
                .filter(|(name, _)| comp.input_role(name) == PortRole::Sequence)
                .map(|(name, marker)| (name.clone(), marker.clone()))
                .collect()
        };

        debug!(flow = %flow.name, component = %component_id, "executing component");
        self.events.emit(EventKind::ComponentExecuted {
            flow_state: fs_id.index(),
            component: component_id,
        });

        let result = match &flow.components[ci].kind {
            ComponentKind::Decoration | ComponentKind::Widget | ComponentKind::End => {
                Ok(ExecOutcome::suppressed())
            }
            ComponentKind::Start => Ok(ExecOutcome::completed()),
            ComponentKind::CatchError => {
                let message = self
                    .arena
                    .get(fs_id)
                    .and_then(|s| s.component_states[ci].inputs.get(CATCH_MESSAGE_INPUT).cloned())
                    .unwrap_or(Value::Null);
                self.propagate_value(fs_id, ci, CATCH_MESSAGE_INPUT, message);
                Ok(ExecOutcome::completed())
            }
            ComponentKind::CallAction { action } => {
                let action = action.to_string();
                let caller = Caller {
                    flow_state: fs_id,
                    component: ci,
                };
                match self.invoke_action(Some(caller), &action) {
                    // the caller's sequence output pulses when the child
                    // finishes, never at launch
                    Ok(_) => Ok(ExecOutcome::suppressed()),
                    Err(e) => {
                        self.stop_with_error(e.to_string());
                        Ok(ExecOutcome::suppressed())
                    }
                }
            }
            ComponentKind::Action { handler, .. } => {
                let handler = Arc::clone(handler);
                handler.execute(&mut ExecuteContext::new(self, fs_id, ci))
            }
        };

        match result {
            Ok(ExecOutcome::Completed { propagate }) => {
                self.finish_run(fs_id, ci, &fired);
                if propagate {
                    self.propagate_value(fs_id, ci, SEQ_OUT, Value::Null);
                }
                self.maybe_finish(fs_id);
            }
            Ok(ExecOutcome::Suspended(disposer)) => {
                // stays running and active; the fired pulses are consumed
                // now so a fresh pulse can re-trigger after completion
                if let Some(state) = self.arena.get_mut(fs_id) {
                    let cs = &mut state.component_states[ci];
                    cs.disposer = Some(disposer);
                    for (name, marker) in &fired {
                        if cs.inputs.get(name) == Some(marker) {
                            cs.inputs.remove(name);
                        }
                    }
                }
                self.propagate_value(fs_id, ci, SEQ_OUT, Value::Null);
            }
            Err(err) => {
                self.finish_run(fs_id, ci, &fired);
                self.route_error(fs_id, ci, err.0);
                self.maybe_finish(fs_id);
            }
        }
    }

    /// End a run: release the active slot and consume the pulses that
    /// triggered it. A pulse re-delivered during the run has a different
    /// marker and is kept.
    fn finish_run(&mut self, flow_state: FlowStateId, component: usize, fired: &[(String, Value)]) {
        if let Some(state) = self.arena.get_mut(flow_state) {
            state.num_active_components -= 1;
            let cs = &mut state.component_states[component];
            cs.is_running = false;
            for (name, marker) in fired {
                if cs.inputs.get(name) == Some(marker) {
                    cs.inputs.remove(name);
                }
            }
        }
    }

    /// Complete a previously suspended execution. The sequence output was
    /// already pulsed at launch; this only releases the active slot.
    pub fn end_async_execution(&mut self, flow_state: FlowStateId, component: usize) {
        let Some(state) = self.arena.get_mut(flow_state) else {
            return;
        };
        let cs = &mut state.component_states[component];
        if !cs.is_running {
            warn!(flow_state = %flow_state, component, "end of async signalled on an idle component");
            return;
        }
        cs.is_running = false;
        cs.disposer = None;
        state.num_active_components -= 1;
        self.maybe_finish(flow_state);
    }

    /// Finish an action invocation once nothing is active in it and every
    /// child invocation has finished, then pulse the call site's sequence
    /// output. Page flow states stay alive for the runtime's lifetime.
    pub(crate) fn maybe_finish(&mut self, flow_state: FlowStateId) {
        let (finish, caller, parent) = {
            let Some(state) = self.arena.get(flow_state) else {
                return;
            };
            let children_done = state
                .children
                .iter()
                .all(|&c| self.arena.get(c).map_or(true, |child| child.is_finished));
            let finish = !state.is_finished
                && state.flow.role == FlowRole::Action
                && state.num_active_components == 0
                && children_done;
            (finish, state.caller, state.parent)
        };
        if !finish {
            return;
        }
        if let Some(state) = self.arena.get_mut(flow_state) {
            state.mark_finished();
        }
        self.events.emit(EventKind::FlowStateFinished {
            flow_state: flow_state.index(),
        });
        info!(flow_state = %flow_state, "action invocation finished");
        if let Some(caller) = caller {
            self.propagate_value(caller.flow_state, caller.component, SEQ_OUT, Value::Null);
            self.maybe_finish(caller.flow_state);
        } else if let Some(parent) = parent {
            self.maybe_finish(parent);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::component::{
        ComponentError, ComponentHandler, Disposer, ExecOutcome, HandlerRegistry,
    };
    use crate::context::{AsyncHandle, ExecuteContext};
    use crate::flow::ProjectDef;
    use crate::runtime::Runtime;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct Probe(Arc<Mutex<Vec<String>>>);

    impl ComponentHandler for Probe {
        fn execute(&self, ctx: &mut ExecuteContext<'_>) -> Result<ExecOutcome, ComponentError> {
            let label = ctx
                .evaluate_property("label")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            self.0.lock().push(label);
            Ok(ExecOutcome::completed())
        }
    }

    struct Suspend(Arc<Mutex<Option<AsyncHandle>>>);

    impl ComponentHandler for Suspend {
        fn execute(&self, ctx: &mut ExecuteContext<'_>) -> Result<ExecOutcome, ComponentError> {
            *self.0.lock() = Some(ctx.async_handle());
            Ok(ExecOutcome::Suspended(Disposer::noop()))
        }
    }

    fn runtime(yaml: &str, registry: HandlerRegistry) -> Runtime {
        let project: ProjectDef = serde_yaml::from_str(yaml).unwrap();
        Runtime::new(project, &registry).unwrap()
    }

    #[test]
    fn mandatory_inputs_gate_readiness_and_enqueue_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register("probe", Probe(Arc::clone(&seen)));

        let mut rt = runtime(
            r#"
schema: flowrt/project@0.1
flows:
  - name: main
    components:
      - id: calc
        kind: action
        handler: probe
        properties: { label: calc }
        inputs:
          - { name: in1 }
          - { name: in2 }
"#,
            registry,
        );
        rt.start();
        rt.run_until_idle(8);

        let (fs, ci) = rt.find_component("main", "calc").unwrap();
        assert!(!rt.is_ready_to_run(fs, ci));

        rt.set_input_value(fs, ci, "in1", json!(1));
        assert!(!rt.is_ready_to_run(fs, ci));
        assert_eq!(rt.pending_tasks(), 0);

        rt.set_input_value(fs, ci, "in2", json!(2));
        assert!(rt.is_ready_to_run(fs, ci));
        assert_eq!(rt.pending_tasks(), 1);

        // further deliveries coalesce with the queued task
        rt.set_input_value(fs, ci, "in1", json!(3));
        assert_eq!(rt.pending_tasks(), 1);

        rt.run_until_idle(8);
        assert_eq!(seen.lock().as_slice(), ["calc"]);
    }

    #[test]
    fn sequence_pulse_is_consumed_per_run() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register("probe", Probe(Arc::clone(&seen)));

        let mut rt = runtime(
            r#"
schema: flowrt/project@0.1
flows:
  - name: main
    components:
      - { id: start, kind: start }
      - { id: a, kind: action, handler: probe, properties: { label: a } }
    connections:
      - { source: start, target: a }
"#,
            registry,
        );
        rt.start();
        rt.run_until_idle(8);
        assert_eq!(seen.lock().len(), 1);

        // pulse consumed; the component is not ready again on its own
        let (fs, ci) = rt.find_component("main", "a").unwrap();
        assert!(!rt.is_ready_to_run(fs, ci));
        rt.run_until_idle(8);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn fan_out_delivers_in_declaration_order_and_skips_unready() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register("probe", Probe(Arc::clone(&seen)));

        // b needs a second mandatory input that never arrives; c runs
        let mut rt = runtime(
            r#"
schema: flowrt/project@0.1
flows:
  - name: main
    components:
      - { id: start, kind: start }
      - id: b
        kind: action
        handler: probe
        properties: { label: b }
        inputs:
          - { name: go, role: sequence }
          - { name: extra }
      - id: c
        kind: action
        handler: probe
        properties: { label: c }
        inputs:
          - { name: go, role: sequence }
    connections:
      - { source: start, target: b, input: go }
      - { source: start, target: c, input: go }
"#,
            registry,
        );
        rt.start();
        rt.run_until_idle(8);
        assert_eq!(seen.lock().as_slice(), ["c"]);
    }

    #[test]
    fn suspended_component_completes_through_end_async() {
        let handle = Arc::new(Mutex::new(None));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register("launch", Suspend(Arc::clone(&handle)));
        registry.register("probe", Probe(Arc::clone(&seen)));

        let mut rt = runtime(
            r#"
schema: flowrt/project@0.1
flows:
  - name: main
    components:
      - { id: go, kind: widget }
  - name: job
    role: action
    components:
      - { id: start, kind: start }
      - { id: fetch, kind: action, handler: launch }
      - { id: after, kind: action, handler: probe, properties: { label: after } }
    connections:
      - { source: start, target: fetch }
      - { source: fetch, target: after }
"#,
            registry,
        );
        rt.start();
        rt.trigger_action("job").unwrap();
        rt.run_until_idle(8);

        // launch pulsed its sequence output already; downstream ran
        assert_eq!(seen.lock().as_slice(), ["after"]);
        let h = handle.lock().unwrap();
        let state = rt.flow_state(h.flow_state).unwrap();
        assert!(state.component_states[h.component].is_running);
        assert!(!state.is_finished);

        rt.end_async_execution(h.flow_state, h.component);
        let state = rt.flow_state(h.flow_state).unwrap();
        assert!(!state.component_states[h.component].is_running);
        assert!(state.component_states[h.component].disposer.is_none());
        assert!(state.is_finished);
    }

    #[test]
    fn finished_child_pulses_callers_sequence_output() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register("probe", Probe(Arc::clone(&seen)));

        let mut rt = runtime(
            r#"
schema: flowrt/project@0.1
flows:
  - name: main
    components:
      - { id: start, kind: start }
      - { id: call, kind: call-action, action: child }
      - { id: done, kind: action, handler: probe, properties: { label: done } }
    connections:
      - { source: start, target: call }
      - { source: call, target: done }
  - name: child
    role: action
    components:
      - { id: start, kind: start }
      - { id: inner, kind: action, handler: probe, properties: { label: inner } }
    connections:
      - { source: start, target: inner }
"#,
            registry,
        );
        rt.start();
        rt.run_until_idle(16);

        assert_eq!(seen.lock().as_slice(), ["inner", "done"]);
        let finished: Vec<bool> = rt.flow_states().map(|s| s.is_finished).collect();
        // the child invocation finished; the page stays alive
        assert_eq!(finished.iter().filter(|f| **f).count(), 1);
    }

    #[test]
    fn external_input_reaches_variables_through_handlers() {
        struct Store;
        impl ComponentHandler for Store {
            fn execute(
                &self,
                ctx: &mut ExecuteContext<'_>,
            ) -> Result<ExecOutcome, ComponentError> {
                let v = ctx.input("payload").unwrap_or(Value::Null);
                ctx.set_variable("stored", v);
                Ok(ExecOutcome::completed())
            }
        }
        let mut registry = HandlerRegistry::new();
        registry.register("store", Store);

        let mut rt = runtime(
            r#"
schema: flowrt/project@0.1
globals:
  - { name: stored, value: null }
flows:
  - name: main
    components:
      - id: sink
        kind: action
        handler: store
        inputs:
          - { name: payload }
"#,
            registry,
        );
        rt.start();
        rt.run_until_idle(8);

        let (fs, ci) = rt.find_component("main", "sink").unwrap();
        rt.set_input_value(fs, ci, "payload", json!({ "n": 7 }));
        rt.run_until_idle(8);
        assert_eq!(rt.global("stored"), Some(&json!({ "n": 7 })));
    }
}
