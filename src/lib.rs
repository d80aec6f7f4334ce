//! flowrt — runtime for visual, node-based flow programs
//!
//! A project file declares flows: directed graphs of components joined by
//! connection lines carrying either control pulses (sequence ports) or data
//! values. The runtime compiles the graphs once, then executes them with a
//! cooperative single-threaded pump: a FIFO task queue, per-instance
//! FlowStates in an arena, last-value input buffering, readiness rules per
//! component kind, nested action invocations, catch-based error routing and
//! a debugger-grade run-state machine with breakpoints and single-stepping.
//!
//! ```no_run
//! use std::time::Duration;
//! use flowrt::{HandlerRegistry, ProjectDef, Runtime};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let project: ProjectDef = serde_yaml::from_str(std::fs::read_to_string("app.yaml")?.as_str())?;
//! let mut runtime = Runtime::new(project, &HandlerRegistry::builtin())?;
//! runtime.start();
//! runtime.run_until_idle(1024);
//! runtime.stop(Duration::from_secs(1));
//! # Ok(())
//! # }
//! ```

pub mod component;
pub mod context;
pub mod debug;
pub mod error;
pub mod event_log;
pub mod flow;
pub mod runtime;
pub mod state;

mod catch;
mod executor;
mod scheduler;

pub use component::{
    ComponentError, ComponentHandler, Disposer, ExecOutcome, HandlerRegistry,
};
pub use context::{AsyncHandle, ExecuteContext};
pub use debug::{Breakpoints, RunState};
pub use error::{EngineError, FixSuggestion};
pub use event_log::{Event, EventKind, EventLog};
pub use flow::{
    ComponentDef, ConnectionDef, Flow, FlowDef, FlowRole, InputDef, PortRole, ProjectDef,
    VariableDef, CATCH_MESSAGE_INPUT, ERROR_OUTPUT, PROJECT_SCHEMA, SEQ_IN, SEQ_OUT,
};
pub use runtime::{QueueTask, Runtime, RuntimeHost, VariableHooks};
pub use state::{Caller, ComponentState, FlowState, FlowStateId};
