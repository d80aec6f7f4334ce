//! Cooperative pump loop
//!
//! The pump is invoked repeatedly by the host (timer-driven, never
//! recursive). Each pass snapshots the queue length and processes at most
//! that many tasks, so a self-requeuing component cannot starve the rest of
//! the graph. Still-running components are deferred to the tail with their
//! relative order preserved. The pump never fails; component errors are
//! routed through catch semantics inside `run_task`.

use tracing::warn;

use crate::debug::RunState;
use crate::event_log::EventKind;
use crate::runtime::{QueueTask, Runtime};
use crate::state::FlowStateId;

impl Runtime {
    pub(crate) fn push_task(
        &mut self,
        flow_state: FlowStateId,
        component: usize,
        connection: Option<usize>,
    ) {
        if let Some(state) = self.arena.get_mut(flow_state) {
            state.num_active_components += 1;
        }
        self.queue.push_back(QueueTask {
            flow_state,
            component,
            connection,
        });
    }

    /// One cooperative pass over the task queue
    pub fn pump(&mut self) {
        match self.machine.state() {
            RunState::Paused | RunState::Stopped => return,
            RunState::Running | RunState::SingleStep => {}
        }

        let single_step = self.machine.state() == RunState::SingleStep;
        let mut budget = self.queue.len();
        if single_step {
            budget = budget.min(1);
        }
        let mut engaged_single_step = single_step;
        let mut deferred: Vec<QueueTask> = Vec::new();

        while budget > 0 {
            budget -= 1;
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            let Some(state) = self.arena.get(task.flow_state) else {
                continue;
            };

            if state.component_states[task.component].is_running {
                deferred.push(task);
                continue;
            }

            let flow_name = state.flow.name.clone();
            let component = &state.flow.components[task.component];
            let component_id = component.id.clone();

            // A breakpoint arms single-step for this task; the task itself
            // runs on the next explicit step.
            if !single_step && self.breakpoints.is_armed(&flow_name, &component_id) {
                self.events.emit(EventKind::BreakpointHit {
                    flow_state: task.flow_state.index(),
                    component: component_id.to_string(),
                });
                self.machine.transition(RunState::SingleStep);
                engaged_single_step = true;
                self.queue.push_front(task);
                break;
            }

            if let Some(ci) = task.connection {
                let conn = &state.flow.connections[ci];
                self.events.emit(EventKind::ConnectionTraversed {
                    flow_state: task.flow_state.index(),
                    source: state.flow.components[conn.source].id.to_string(),
                    output: conn.output.to_string(),
                    target: state.flow.components[conn.target].id.to_string(),
                    input: conn.input.to_string(),
                });
            }

            self.run_task(task);

            if self.machine.state() == RunState::Stopped {
                // a fatal error cleared the queue mid-pass
                return;
            }
        }

        for task in deferred {
            self.queue.push_back(task);
        }

        if engaged_single_step {
            self.machine.transition(RunState::Paused);
        }
    }

    pub fn pause(&mut self) {
        self.machine.transition(RunState::Paused);
    }

    pub fn resume(&mut self) {
        self.machine.transition(RunState::Running);
    }

    /// Execute exactly one task, then pause again
    pub fn step(&mut self) {
        if self.machine.transition(RunState::SingleStep) {
            self.pump();
        }
    }

    /// Drop every queued task belonging to `root` (and, when `include_root`,
    /// the root itself) or any of its descendant flow states. Used by catch
    /// handling to abandon a failing invocation subtree.
    pub(crate) fn purge_tasks_of(&mut self, root: FlowStateId, include_root: bool) -> usize {
        let old = std::mem::take(&mut self.queue);
        let mut removed = 0;
        for task in old {
            let in_subtree = self.arena.is_same_or_descendant(task.flow_state, root)
                && (include_root || task.flow_state != root);
            if in_subtree {
                if let Some(state) = self.arena.get_mut(task.flow_state) {
                    state.num_active_components -= 1;
                }
                removed += 1;
            } else {
                self.queue.push_back(task);
            }
        }
        if removed > 0 {
            warn!(flow_state = %root, removed, "purged queued tasks");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use crate::component::{ComponentError, ComponentHandler, ExecOutcome, HandlerRegistry};
    use crate::context::ExecuteContext;
    use crate::debug::RunState;
    use crate::flow::ProjectDef;
    use crate::runtime::Runtime;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Count(Arc<AtomicUsize>);

    impl ComponentHandler for Count {
        fn execute(&self, _ctx: &mut ExecuteContext<'_>) -> Result<ExecOutcome, ComponentError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ExecOutcome::completed())
        }
    }

    /// Pulses its own sequence input again on every run
    struct Requeue(Arc<AtomicUsize>);

    impl ComponentHandler for Requeue {
        fn execute(&self, ctx: &mut ExecuteContext<'_>) -> Result<ExecOutcome, ComponentError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            ctx.propagate("again", Value::Null);
            Ok(ExecOutcome::suppressed())
        }
    }

    fn runtime(yaml: &str, registry: HandlerRegistry) -> Runtime {
        let project: ProjectDef = serde_yaml::from_str(yaml).unwrap();
        Runtime::new(project, &registry).unwrap()
    }

    #[test]
    fn self_requeuing_task_runs_once_per_pass() {
        let loops = Arc::new(AtomicUsize::new(0));
        let others = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register("looper", Requeue(Arc::clone(&loops)));
        registry.register("other", Count(Arc::clone(&others)));

        let mut rt = runtime(
            r#"
schema: flowrt/project@0.1
flows:
  - name: main
    components:
      - { id: start, kind: start }
      - { id: a, kind: action, handler: looper }
      - { id: b, kind: action, handler: other }
    connections:
      - { source: start, target: a }
      - { source: start, target: b }
      - { source: a, output: again, target: a }
"#,
            registry,
        );
        rt.start();

        // pass 1: start runs, a+b enqueued
        rt.pump();
        assert_eq!(loops.load(Ordering::SeqCst), 0);
        // pass 2: a runs (requeues itself), b runs exactly once
        rt.pump();
        assert_eq!(loops.load(Ordering::SeqCst), 1);
        assert_eq!(others.load(Ordering::SeqCst), 1);
        // each further pass runs a exactly once, no starvation
        rt.pump();
        rt.pump();
        assert_eq!(loops.load(Ordering::SeqCst), 3);
        assert_eq!(others.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn paused_pump_retains_queue() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register("count", Count(Arc::clone(&runs)));

        let mut rt = runtime(
            r#"
schema: flowrt/project@0.1
flows:
  - name: main
    components:
      - { id: start, kind: start }
      - { id: a, kind: action, handler: count }
    connections:
      - { source: start, target: a }
"#,
            registry,
        );
        rt.start();
        rt.pause();
        let queued = rt.pending_tasks();
        rt.pump();
        assert_eq!(rt.pending_tasks(), queued);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        rt.resume();
        rt.run_until_idle(16);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn breakpoint_pauses_before_component_and_step_runs_it() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry.register("count", Count(Arc::clone(&runs)));

        let mut rt = runtime(
            r#"
schema: flowrt/project@0.1
flows:
  - name: main
    components:
      - { id: start, kind: start }
      - { id: a, kind: action, handler: count }
    connections:
      - { source: start, target: a }
"#,
            registry,
        );
        rt.add_breakpoint("main", "a");
        rt.start();

        rt.pump(); // start runs, a queued
        rt.pump(); // breakpoint on a: engage single-step, end pass paused
        assert_eq!(rt.run_state(), RunState::Paused);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(rt.pending_tasks(), 1);

        rt.step(); // runs a, pauses again
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(rt.run_state(), RunState::Paused);

        rt.resume();
        assert_eq!(rt.run_state(), RunState::Running);
    }
}
