//! Component execute contract
//!
//! `ComponentHandler` is the sole plug-in point for concrete node kinds.
//! A handler either completes (optionally suppressing the default sequence
//! pulse) or suspends, handing the engine an opaque cleanup handle and
//! signalling true completion later through `Runtime::end_async_execution`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::context::ExecuteContext;

/// Failure raised by a component's execute; routed through catch semantics
#[derive(Error, Debug)]
#[error("{0}")]
pub struct ComponentError(pub String);

impl From<&str> for ComponentError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ComponentError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque async-cleanup handle retained while a component is suspended.
/// Fired only when the runtime force-finishes the owning flow state.
pub struct Disposer(Option<Box<dyn FnOnce()>>);

impl Disposer {
    pub fn new(cleanup: impl FnOnce() + 'static) -> Self {
        Self(Some(Box::new(cleanup)))
    }

    pub fn noop() -> Self {
        Self(None)
    }

    /// Run the cleanup. Consumes the handle; at most once by construction.
    pub fn dispose(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Disposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Disposer({})", if self.0.is_some() { "armed" } else { "noop" })
    }
}

/// Tri-state result of a component execution
#[derive(Debug)]
pub enum ExecOutcome {
    /// Finished now; `propagate` pulses the default sequence output
    Completed { propagate: bool },
    /// Launched; still running until end-of-async is signalled.
    /// The default sequence output is still pulsed at launch.
    Suspended(Disposer),
}

impl ExecOutcome {
    /// Completed, default sequence output pulses
    pub fn completed() -> Self {
        Self::Completed { propagate: true }
    }

    /// Completed, no automatic pulse
    pub fn suppressed() -> Self {
        Self::Completed { propagate: false }
    }
}

/// Plug-in contract for concrete node kinds
pub trait ComponentHandler {
    fn execute(&self, ctx: &mut ExecuteContext<'_>) -> Result<ExecOutcome, ComponentError>;
}

/// Named handlers, resolved once at graph-load time
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ComponentHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in utility handlers (`log`, `const`)
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register("log", LogHandler);
        reg.register("const", ConstHandler);
        reg
    }

    pub fn register<H: ComponentHandler + 'static>(&mut self, name: &str, handler: H) {
        self.handlers.insert(name.to_string(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ComponentHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Logs its `message` property (or `message` input) to the event log
pub struct LogHandler;

impl ComponentHandler for LogHandler {
    fn execute(&self, ctx: &mut ExecuteContext<'_>) -> Result<ExecOutcome, ComponentError> {
        let message = ctx
            .evaluate_property("message")
            .or_else(|| ctx.input("message"))
            .unwrap_or(Value::Null);
        let text = match message {
            Value::String(s) => s,
            other => other.to_string(),
        };
        ctx.log_info(text);
        Ok(ExecOutcome::completed())
    }
}

/// Emits its `value` property on the `value` output
pub struct ConstHandler;

impl ComponentHandler for ConstHandler {
    fn execute(&self, ctx: &mut ExecuteContext<'_>) -> Result<ExecOutcome, ComponentError> {
        let value = ctx.evaluate_property("value").unwrap_or(Value::Null);
        ctx.propagate("value", value);
        Ok(ExecOutcome::completed())
    }
}
