//! Flow runtime: lifecycle, queue ownership and the data context
//!
//! The runtime owns the compiled flows, the FlowState arena, the FIFO task
//! queue, the run-state machine and the event log. Execution itself lives in
//! `scheduler` (pump loop), `executor` (run/propagate/readiness) and `catch`
//! (error routing), all as impl blocks on `Runtime`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{info, warn};

use crate::component::HandlerRegistry;
use crate::debug::{Breakpoints, RunState, RunStateMachine};
use crate::error::EngineError;
use crate::event_log::{EventKind, EventLog};
use crate::flow::{Flow, FlowRole, ProjectDef, VariableDef, PROJECT_SCHEMA};
use crate::state::{Caller, FlowState, FlowStateArena, FlowStateId};

/// Host process notifications (idle-suspend suppression, user notices).
/// Out of scope for the engine beyond these two signals.
pub trait RuntimeHost {
    fn on_start(&self) {}
    fn on_stop(&self) {}
}

/// External backing for global variables: constructors and destructors for
/// resource-bearing (object-typed) variables plus persistence at shutdown.
pub trait VariableHooks {
    fn construct(&self, name: &str) -> Option<Value> {
        let _ = name;
        None
    }
    fn destroy(&self, name: &str, value: &Value) {
        let _ = (name, value);
    }
    fn persist(&self, name: &str, value: &Value) {
        let _ = (name, value);
    }
}

/// A scheduling unit: one component of one flow state, optionally the
/// connection line whose delivery enqueued it.
#[derive(Debug, Clone, Copy)]
pub struct QueueTask {
    pub flow_state: FlowStateId,
    pub component: usize,
    pub connection: Option<usize>,
}

pub struct Runtime {
    pub(crate) flows: HashMap<String, Arc<Flow>>,
    pub(crate) arena: FlowStateArena,
    pub(crate) queue: VecDeque<QueueTask>,
    pub(crate) machine: RunStateMachine,
    pub(crate) breakpoints: Breakpoints,
    pub(crate) globals: HashMap<String, Value>,
    pub(crate) global_defs: Vec<VariableDef>,
    pub(crate) events: EventLog,
    pub(crate) error: Option<String>,
    pub(crate) host: Option<Box<dyn RuntimeHost>>,
    pub(crate) hooks: Option<Box<dyn VariableHooks>>,
    /// Monotonic marker stored as the value of fired sequence inputs, so a
    /// pulse that arrives while its target is running is not lost when the
    /// run's own fired pulses are cleared.
    pub(crate) pulse_serial: u64,
}

impl Runtime {
    /// Compile a project against the registry. Configuration problems
    /// (duplicate names, unknown handlers, dangling connections) fail here.
    pub fn new(project: ProjectDef, registry: &HandlerRegistry) -> Result<Self, EngineError> {
        if project.schema != PROJECT_SCHEMA {
            return Err(EngineError::BadSchema {
                schema: project.schema,
                expected: PROJECT_SCHEMA,
            });
        }

        let mut flows: HashMap<String, Arc<Flow>> = HashMap::with_capacity(project.flows.len());
        for def in project.flows {
            let name = def.name.clone();
            let flow = Flow::compile(def, registry)?;
            if flows.insert(name.clone(), Arc::new(flow)).is_some() {
                return Err(EngineError::DuplicateFlow { flow: name });
            }
        }

        let globals = project
            .globals
            .iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect();

        let events = EventLog::new();
        Ok(Self {
            flows,
            arena: FlowStateArena::default(),
            queue: VecDeque::new(),
            machine: RunStateMachine::new(events.clone()),
            breakpoints: Breakpoints::default(),
            globals,
            global_defs: project.globals,
            events,
            error: None,
            host: None,
            hooks: None,
            pulse_serial: 0,
        })
    }

    pub fn with_host(mut self, host: impl RuntimeHost + 'static) -> Self {
        self.host = Some(Box::new(host));
        self
    }

    pub fn with_variable_hooks(mut self, hooks: impl VariableHooks + 'static) -> Self {
        self.hooks = Some(Box::new(hooks));
        self
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start all page flows: construct object globals, create a FlowState
    /// per page, run widgets immediately, queue every structurally-ready
    /// component and begin accepting pump calls.
    pub fn start(&mut self) {
        if !self.machine.transition(RunState::Running) {
            return; // already running; logged and ignored
        }

        if let Some(hooks) = &self.hooks {
            for def in &self.global_defs {
                if def.object {
                    if let Some(v) = hooks.construct(&def.name) {
                        self.globals.insert(def.name.clone(), v);
                    }
                }
            }
        }

        let pages: Vec<Arc<Flow>> = self
            .flows
            .values()
            .filter(|f| f.role == FlowRole::Page)
            .cloned()
            .collect();

        self.events.emit(EventKind::RuntimeStarted {
            flow_count: pages.len(),
        });

        for flow in pages {
            let fs_id = self.create_flow_state(Arc::clone(&flow), None, None);
            for ci in 0..flow.components.len() {
                use crate::flow::ComponentKind::*;
                match flow.components[ci].kind {
                    Widget => {
                        if let Some(state) = self.arena.get_mut(fs_id) {
                            state.component_states[ci].touched = true;
                        }
                        self.run_now(fs_id, ci);
                    }
                    Decoration => {}
                    _ => {
                        if self.is_ready_to_run(fs_id, ci) {
                            self.push_task(fs_id, ci, None);
                        }
                    }
                }
            }
        }

        if let Some(host) = &self.host {
            host.on_start();
        }
        info!(flows = self.flows.len(), "flow runtime started");
    }

    /// Stop the runtime: pump until everything finishes naturally or the
    /// timeout passes (best effort, in-flight async components are not
    /// killed), then force-finish stragglers, fire retained disposers and
    /// run the variable hooks.
    pub fn stop(&mut self, timeout: Duration) {
        if self.machine.state() == RunState::Stopped {
            warn!("stop called on a stopped runtime");
            return;
        }
        if matches!(
            self.machine.state(),
            RunState::Paused | RunState::SingleStep
        ) {
            self.machine.transition(RunState::Running);
        }

        let deadline = Instant::now() + timeout;
        while !self.drained() && Instant::now() < deadline {
            if self.queue.is_empty() {
                // only external async callbacks could make progress now
                break;
            }
            self.pump();
        }
        if !self.drained() {
            warn!("shutdown timeout; force-finishing remaining flow states");
        }

        for id in self.arena.ids() {
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
                .map(|s| s.mark_finished())
                .unwrap_or(false);
            if newly {
                self.events
                    .emit(EventKind::FlowStateFinished { flow_state: id.index() });
            }
        }
        self.queue.clear();

        if let Some(hooks) = &self.hooks {
            for def in &self.global_defs {
                if let Some(value) = self.globals.get(&def.name) {
                    if def.object {
                        hooks.destroy(&def.name, value);
                    }
                    hooks.persist(&def.name, value);
                }
            }
        }

        self.machine.transition(RunState::Stopped);
        if let Some(host) = &self.host {
            host.on_stop();
        }
        self.events.emit(EventKind::RuntimeStopped {
            error: self.error.clone(),
        });
        info!("flow runtime stopped");
    }

    /// Stop everything because of an unrecoverable error
    pub(crate) fn stop_with_error(&mut self, message: String) {
        self.error = Some(message.clone());
        self.queue.clear();
        self.machine.transition(RunState::Stopped);
        if let Some(host) = &self.host {
            host.on_stop();
        }
        self.events.emit(EventKind::RuntimeStopped {
            error: Some(message),
        });
    }

    /// Invoke a named action from host/UI context (parentless invocation).
    /// A missing action or start marker is fatal and stops the runtime.
    pub fn trigger_action(&mut self, name: &str) -> Result<FlowStateId, EngineError> {
        match self.invoke_action(None, name) {
            Ok(id) => Ok(id),
            Err(e) => {
                self.stop_with_error(e.to_string());
                Err(e)
            }
        }
    }

    /// Create a child FlowState for an action invocation and seed its start
    /// marker onto the queue.
    pub(crate) fn invoke_action(
        &mut self,
        caller: Option<Caller>,
        name: &str,
    ) -> Result<FlowStateId, EngineError> {
        let flow = self
            .flows
            .get(name)
            .filter(|f| f.role == FlowRole::Action)
            .cloned()
            .ok_or_else(|| EngineError::UnknownAction {
                action: name.to_string(),
            })?;
        let start = flow
            .start_component()
            .ok_or_else(|| EngineError::MissingStart {
                action: name.to_string(),
            })?;

        let parent = caller.map(|c| c.flow_state);
        let fs_id = self.create_flow_state(flow, parent, caller);
        self.push_task(fs_id, start, None);
        Ok(fs_id)
    }

    pub(crate) fn create_flow_state(
        &mut self,
        flow: Arc<Flow>,
        parent: Option<FlowStateId>,
        caller: Option<Caller>,
    ) -> FlowStateId {
        let flow_name = flow.name.to_string();
        let id = self.arena.alloc(flow, parent, caller);
        self.events.emit(EventKind::FlowStateCreated {
            flow_state: id.index(),
            flow: flow_name,
            parent: parent.map(FlowStateId::index),
        });
        id
    }

    /// All action invocations finished, queue empty, nothing in flight
    pub fn drained(&self) -> bool {
        self.queue.is_empty()
            && self.arena.iter().all(|fs| {
                (fs.flow.role != FlowRole::Action || fs.is_finished)
                    && fs.component_states.iter().all(|cs| !cs.is_running)
            })
    }

    /// Pump until the queue drains, the runtime leaves RUNNING, or the pass
    /// budget runs out. Returns the number of passes.
    pub fn run_until_idle(&mut self, max_passes: usize) -> usize {
        let mut passes = 0;
        while passes < max_passes
            && self.machine.state() == RunState::Running
            && !self.queue.is_empty()
        {
            self.pump();
            passes += 1;
        }
        passes
    }

    // ------------------------------------------------------------------
    // Data context
    // ------------------------------------------------------------------

    /// Resolve a variable: local frame chain first, then globals
    pub fn get_variable(&self, flow_state: FlowStateId, name: &str) -> Option<Value> {
        self.arena
            .lookup(flow_state, name)
            .or_else(|| self.globals.get(name))
            .cloned()
    }

    /// Write a variable to the frame that defines it (child shadows
    /// parent), falling back to globals, else the local frame.
    pub fn set_variable(&mut self, flow_state: FlowStateId, name: &str, value: Value) {
        if let Some(frame) = self.arena.frame_defining(flow_state, name) {
            if let Some(state) = self.arena.get_mut(frame) {
                state.locals.insert(name.to_string(), value);
            }
            return;
        }
        if self.globals.contains_key(name) {
            self.globals.insert(name.to_string(), value);
            return;
        }
        if let Some(state) = self.arena.get_mut(flow_state) {
            state.locals.insert(name.to_string(), value);
        }
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    // ------------------------------------------------------------------
    // Debugger surface
    // ------------------------------------------------------------------

    pub fn add_breakpoint(&mut self, flow: &str, component: &str) {
        self.breakpoints.add(flow, component);
    }

    pub fn remove_breakpoint(&mut self, flow: &str, component: &str) {
        self.breakpoints.remove(flow, component);
    }

    pub fn run_state(&self) -> RunState {
        self.machine.state()
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Terminal/last recorded error
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn flow_state(&self, id: FlowStateId) -> Option<&FlowState> {
        self.arena.get(id)
    }

    pub fn flow_states(&self) -> impl Iterator<Item = &FlowState> {
        self.arena.iter()
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    /// Compiled flows; iteration order is unspecified
    pub fn flow_definitions(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values().map(Arc::as_ref)
    }

    /// Locate a component instance by flow name and component id.
    /// Scans live flow states; first match wins.
    pub fn find_component(&self, flow: &str, component: &str) -> Option<(FlowStateId, usize)> {
        self.arena.iter().find_map(|fs| {
            if fs.flow.name.as_ref() != flow {
                return None;
            }
            fs.flow.component_index(component).map(|ci| (fs.id, ci))
        })
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("flows", &self.flows.len())
            .field("flow_states", &self.arena.len())
            .field("queued", &self.queue.len())
            .field("state", &self.machine.state())
            .finish()
    }
}
