//! Flow and component execution state
//!
//! FlowStates live in an arena indexed by `FlowStateId`; the parent link is
//! an index, never an owning reference, so nested invocations cannot form
//! ownership cycles. ComponentStates are per-(FlowState, component)
//! bookkeeping: buffered inputs, running flag, retained async-cleanup handle.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::component::Disposer;
use crate::flow::Flow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowStateId(usize);

impl FlowStateId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for FlowStateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Call site of an action invocation
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub flow_state: FlowStateId,
    pub component: usize,
}

/// Per-(FlowState, component) execution record.
/// Input presence means "has fired"; sequence inputs are consumed per run,
/// data inputs keep last-value semantics.
#[derive(Debug, Default)]
pub struct ComponentState {
    pub inputs: HashMap<String, Value>,
    pub is_running: bool,
    pub disposer: Option<Disposer>,
    /// Set on first delivery or explicit start; widget readiness keys off it
    pub touched: bool,
}

/// One live instance of a flow's execution (root page or nested invocation)
#[derive(Debug)]
pub struct FlowState {
    pub id: FlowStateId,
    pub flow: Arc<Flow>,
    pub parent: Option<FlowStateId>,
    pub caller: Option<Caller>,
    pub children: Vec<FlowStateId>,
    /// Local variable frame; lookups fall through to ancestors then globals
    pub locals: HashMap<String, Value>,
    pub component_states: Vec<ComponentState>,
    pub is_finished: bool,
    pub num_active_components: i64,
    pub error: Option<String>,
}

impl FlowState {
    fn new(
        id: FlowStateId,
        flow: Arc<Flow>,
        parent: Option<FlowStateId>,
        caller: Option<Caller>,
    ) -> Self {
        let locals = flow
            .variables
            .iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect();
        let component_states = (0..flow.components.len())
            .map(|_| ComponentState::default())
            .collect();
        Self {
            id,
            flow,
            parent,
            caller,
            children: Vec::new(),
            locals,
            component_states,
            is_finished: false,
            num_active_components: 0,
            error: None,
        }
    }

    /// Flip to finished. Returns false when already finished (no-op).
    pub fn mark_finished(&mut self) -> bool {
        if self.is_finished {
            return false;
        }
        self.is_finished = true;
        true
    }
}

/// Arena of FlowStates, retained for the life of the runtime so finished
/// invocations stay inspectable.
#[derive(Debug, Default)]
pub struct FlowStateArena {
    states: Vec<FlowState>,
}

impl FlowStateArena {
    pub fn alloc(
        &mut self,
        flow: Arc<Flow>,
        parent: Option<FlowStateId>,
        caller: Option<Caller>,
    ) -> FlowStateId {
        let id = FlowStateId(self.states.len());
        self.states.push(FlowState::new(id, flow, parent, caller));
        if let Some(p) = parent {
            if let Some(parent_state) = self.get_mut(p) {
                parent_state.children.push(id);
            }
        }
        id
    }

    pub fn get(&self, id: FlowStateId) -> Option<&FlowState> {
        self.states.get(id.0)
    }

    pub fn get_mut(&mut self, id: FlowStateId) -> Option<&mut FlowState> {
        self.states.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowState> {
        self.states.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FlowState> {
        self.states.iter_mut()
    }

    pub fn ids(&self) -> Vec<FlowStateId> {
        (0..self.states.len()).map(FlowStateId).collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// True when `id` is `ancestor` or lies below it in the parent chain
    pub fn is_same_or_descendant(&self, id: FlowStateId, ancestor: FlowStateId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.get(current).and_then(|s| s.parent);
        }
        false
    }

    /// Resolve a variable by walking the local frame chain (child shadows
    /// parent). Globals are layered on top of this by the runtime.
    pub fn lookup(&self, id: FlowStateId, name: &str) -> Option<&Value> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let state = self.get(current)?;
            if let Some(v) = state.locals.get(name) {
                return Some(v);
            }
            cursor = state.parent;
        }
        None
    }

    /// Frame that already defines `name`, walking outward from `id`
    pub fn frame_defining(&self, id: FlowStateId, name: &str) -> Option<FlowStateId> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let state = self.get(current)?;
            if state.locals.contains_key(name) {
                return Some(current);
            }
            cursor = state.parent;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::HandlerRegistry;
    use crate::flow::FlowDef;
    use serde_json::json;

    fn flow(yaml: &str) -> Arc<Flow> {
        let def: FlowDef = serde_yaml::from_str(yaml).unwrap();
        Arc::new(Flow::compile(def, &HandlerRegistry::builtin()).unwrap())
    }

    fn two_var_flow() -> Arc<Flow> {
        flow(
            r#"
name: f
components:
  - { id: s, kind: start }
variables:
  - { name: x, value: 1 }
  - { name: y, value: "a" }
"#,
        )
    }

    #[test]
    fn alloc_registers_child_under_parent() {
        let mut arena = FlowStateArena::default();
        let f = two_var_flow();
        let root = arena.alloc(Arc::clone(&f), None, None);
        let child = arena.alloc(f, Some(root), None);

        assert_eq!(arena.get(root).unwrap().children, vec![child]);
        assert_eq!(arena.get(child).unwrap().parent, Some(root));
        assert!(arena.is_same_or_descendant(child, root));
        assert!(!arena.is_same_or_descendant(root, child));
    }

    #[test]
    fn locals_are_seeded_from_flow_variables() {
        let mut arena = FlowStateArena::default();
        let id = arena.alloc(two_var_flow(), None, None);
        assert_eq!(arena.lookup(id, "x"), Some(&json!(1)));
        assert_eq!(arena.lookup(id, "y"), Some(&json!("a")));
        assert_eq!(arena.lookup(id, "z"), None);
    }

    #[test]
    fn child_frame_shadows_parent() {
        let mut arena = FlowStateArena::default();
        let f = two_var_flow();
        let root = arena.alloc(Arc::clone(&f), None, None);
        let child = arena.alloc(f, Some(root), None);

        arena
            .get_mut(child)
            .unwrap()
            .locals
            .insert("x".into(), json!(99));
        assert_eq!(arena.lookup(child, "x"), Some(&json!(99)));
        assert_eq!(arena.lookup(root, "x"), Some(&json!(1)));
        assert_eq!(arena.frame_defining(child, "x"), Some(child));
        assert_eq!(arena.frame_defining(child, "y"), Some(child));
    }

    #[test]
    fn mark_finished_is_exactly_once() {
        let mut arena = FlowStateArena::default();
        let id = arena.alloc(two_var_flow(), None, None);
        let state = arena.get_mut(id).unwrap();
        assert!(state.mark_finished());
        assert!(!state.mark_finished());
        assert!(state.is_finished);
    }
}
