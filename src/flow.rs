//! Flow definitions and graph compilation
//!
//! A project file declares flows; each flow declares components, connection
//! lines and variables. Definitions are immutable once compiled: component
//! ids are resolved to indices, handler names are resolved against the
//! registry, and per-component connection lists are pre-computed in
//! declaration order so the runtime never searches at execution time.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::component::{ComponentHandler, HandlerRegistry};
use crate::error::EngineError;

/// Implicit control-pulse input every component owns
pub const SEQ_IN: &str = "@seq_in";
/// Implicit default sequence output
pub const SEQ_OUT: &str = "@seq_out";
/// Implicit error output; wiring it catches the component's own failures
pub const ERROR_OUTPUT: &str = "@error";
/// Designated input of catch-error components
pub const CATCH_MESSAGE_INPUT: &str = "message";

/// Expected `schema:` value of project files
pub const PROJECT_SCHEMA: &str = "flowrt/project@0.1";

/// Role of an input port: sequence ports carry control pulses and are
/// consumed per run, data ports keep their last value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    Sequence,
    Data,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputDef {
    pub name: String,
    #[serde(default = "data_role")]
    pub role: PortRole,
    #[serde(default)]
    pub optional: bool,
}

fn data_role() -> PortRole {
    PortRole::Data
}

/// Component kinds form a closed set, resolved once at load time.
/// `action` is the plug-in point for the external node catalogue.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ComponentKindDef {
    Start,
    End,
    CallAction { action: String },
    CatchError,
    Widget,
    Decoration,
    Action { handler: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComponentDef {
    pub id: String,
    #[serde(flatten)]
    pub kind: ComponentKindDef,
    #[serde(default)]
    pub inputs: Vec<InputDef>,
    #[serde(default)]
    pub properties: serde_json::Map<String, Value>,
}

/// Directed edge from a named output to a named input. Omitted port names
/// default to the sequence ports, so plain control wiring stays terse.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionDef {
    pub source: String,
    #[serde(default = "seq_out_port")]
    pub output: String,
    pub target: String,
    #[serde(default = "seq_in_port")]
    pub input: String,
}

fn seq_out_port() -> String {
    SEQ_OUT.to_string()
}

fn seq_in_port() -> String {
    SEQ_IN.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariableDef {
    pub name: String,
    #[serde(default)]
    pub value: Value,
    /// Resource-bearing variables constructed/destroyed via VariableHooks
    #[serde(default)]
    pub object: bool,
}

/// Page flows start with the runtime; action flows run when invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowRole {
    Page,
    Action,
}

#[derive(Debug, Deserialize)]
pub struct FlowDef {
    pub name: String,
    #[serde(default = "page_role")]
    pub role: FlowRole,
    pub components: Vec<ComponentDef>,
    #[serde(default)]
    pub connections: Vec<ConnectionDef>,
    #[serde(default)]
    pub variables: Vec<VariableDef>,
}

fn page_role() -> FlowRole {
    FlowRole::Page
}

#[derive(Debug, Deserialize)]
pub struct ProjectDef {
    pub schema: String,
    #[serde(default)]
    pub globals: Vec<VariableDef>,
    pub flows: Vec<FlowDef>,
}

// ============================================================================
// COMPILED GRAPH
// ============================================================================

/// Compiled component kind: handler names resolved to trait objects
pub enum ComponentKind {
    Start,
    End,
    CallAction { action: Arc<str> },
    CatchError,
    Widget,
    Decoration,
    Action {
        name: Arc<str>,
        handler: Arc<dyn ComponentHandler>,
    },
}

impl ComponentKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::CallAction { .. } => "call-action",
            Self::CatchError => "catch-error",
            Self::Widget => "widget",
            Self::Decoration => "decoration",
            Self::Action { .. } => "action",
        }
    }
}

impl std::fmt::Debug for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Action { name, .. } => write!(f, "Action({})", name),
            other => write!(f, "{}", other.label()),
        }
    }
}

#[derive(Debug)]
pub struct Component {
    pub id: Arc<str>,
    pub kind: ComponentKind,
    pub inputs: Vec<InputDef>,
    pub properties: serde_json::Map<String, Value>,
    /// True when any connection line targets one of this component's
    /// sequence inputs; readiness then requires a fired pulse.
    pub has_connected_seq_input: bool,
    /// Data inputs that must hold a buffered value before the component runs
    pub mandatory_inputs: Vec<String>,
}

impl Component {
    /// Role of a named input. `@seq_in` is always a sequence port;
    /// undeclared inputs are treated as data ports.
    pub fn input_role(&self, name: &str) -> PortRole {
        if name == SEQ_IN {
            return PortRole::Sequence;
        }
        self.inputs
            .iter()
            .find(|i| i.name == name)
            .map(|i| i.role)
            .unwrap_or(PortRole::Data)
    }
}

/// Resolved connection line, endpoints as component indices
#[derive(Debug, Clone)]
pub struct Connection {
    pub source: usize,
    pub output: Arc<str>,
    pub target: usize,
    pub input: Arc<str>,
}

/// Immutable compiled flow graph
pub struct Flow {
    pub name: Arc<str>,
    pub role: FlowRole,
    pub components: Vec<Component>,
    /// Declaration order preserved; fan-out deliveries follow it
    pub connections: Vec<Connection>,
    pub variables: Vec<VariableDef>,
    /// Per source component: connection indices in declaration order
    outgoing: Vec<Vec<usize>>,
    index: HashMap<String, usize>,
    start_component: Option<usize>,
    catch_component: Option<usize>,
}

impl Flow {
    pub fn compile(def: FlowDef, registry: &HandlerRegistry) -> Result<Self, EngineError> {
        let flow_name = def.name.clone();

        let mut index: HashMap<String, usize> = HashMap::with_capacity(def.components.len());
        for (i, c) in def.components.iter().enumerate() {
            if index.insert(c.id.clone(), i).is_some() {
                return Err(EngineError::DuplicateComponent {
                    flow: flow_name,
                    component: c.id.clone(),
                });
            }
        }

        let mut components = Vec::with_capacity(def.components.len());
        for c in def.components {
            let kind = match c.kind {
                ComponentKindDef::Start => ComponentKind::Start,
                ComponentKindDef::End => ComponentKind::End,
                ComponentKindDef::CallAction { action } => ComponentKind::CallAction {
                    action: action.into(),
                },
                ComponentKindDef::CatchError => ComponentKind::CatchError,
                ComponentKindDef::Widget => ComponentKind::Widget,
                ComponentKindDef::Decoration => ComponentKind::Decoration,
                ComponentKindDef::Action { handler } => {
                    let resolved = registry.get(&handler).ok_or_else(|| {
                        EngineError::UnknownHandler {
                            flow: flow_name.clone(),
                            component: c.id.clone(),
                            handler: handler.clone(),
                        }
                    })?;
                    ComponentKind::Action {
                        name: handler.into(),
                        handler: resolved,
                    }
                }
            };
            let mandatory_inputs = c
                .inputs
                .iter()
                .filter(|i| i.role == PortRole::Data && !i.optional)
                .map(|i| i.name.clone())
                .collect();
            components.push(Component {
                id: c.id.into(),
                kind,
                inputs: c.inputs,
                properties: c.properties,
                has_connected_seq_input: false,
                mandatory_inputs,
            });
        }

        let mut connections = Vec::with_capacity(def.connections.len());
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); components.len()];
        for conn in def.connections {
            let source = *index.get(&conn.source).ok_or_else(|| {
                EngineError::UnknownEndpoint {
                    flow: flow_name.clone(),
                    component: conn.source.clone(),
                }
            })?;
            let target = *index.get(&conn.target).ok_or_else(|| {
                EngineError::UnknownEndpoint {
                    flow: flow_name.clone(),
                    component: conn.target.clone(),
                }
            })?;
            if components[target].input_role(&conn.input) == PortRole::Sequence {
                components[target].has_connected_seq_input = true;
            }
            outgoing[source].push(connections.len());
            connections.push(Connection {
                source,
                output: conn.output.into(),
                target,
                input: conn.input.into(),
            });
        }

        let start_component = components
            .iter()
            .position(|c| matches!(c.kind, ComponentKind::Start));
        let catch_component = components
            .iter()
            .position(|c| matches!(c.kind, ComponentKind::CatchError));

        Ok(Self {
            name: flow_name.into(),
            role: def.role,
            components,
            connections,
            variables: def.variables,
            outgoing,
            index,
            start_component,
            catch_component,
        })
    }

    pub fn component_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Outgoing connection indices of a component, declaration order
    #[inline]
    pub fn outgoing(&self, component: usize) -> &[usize] {
        &self.outgoing[component]
    }

    pub fn start_component(&self) -> Option<usize> {
        self.start_component
    }

    pub fn catch_component(&self) -> Option<usize> {
        self.catch_component
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("components", &self.components.len())
            .field("connections", &self.connections.len())
            .finish()
    }
}
