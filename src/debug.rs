//! Global run-state machine and breakpoints
//!
//! The run state is an explicit FSM with guarded transitions so a debugger
//! front-end can inspect and drive it deterministically. Invalid transitions
//! (racy external calls) are logged and ignored; every accepted transition
//! is also emitted as a structured event.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event_log::{EventKind, EventLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Paused,
    SingleStep,
    Stopped,
}

pub struct RunStateMachine {
    state: RunState,
    events: EventLog,
}

impl RunStateMachine {
    pub fn new(events: EventLog) -> Self {
        Self {
            state: RunState::Stopped,
            events,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn allowed(from: RunState, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (from, to),
            (Stopped, Running)
                | (Running, Paused)
                | (Running, SingleStep)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, SingleStep)
                | (Paused, Stopped)
                | (SingleStep, Paused)
                | (SingleStep, Running)
                | (SingleStep, Stopped)
        )
    }

    /// Attempt a transition. Rejected transitions are a no-op: logged,
    /// not raised, tolerating calls that arrive mid-transition.
    pub fn transition(&mut self, to: RunState) -> bool {
        let from = self.state;
        if !Self::allowed(from, to) {
            warn!(?from, ?to, "ignoring invalid run-state transition");
            return false;
        }
        debug!(?from, ?to, "run-state transition");
        self.events.emit(EventKind::StateTransition { from, to });
        self.state = to;
        true
    }
}

impl std::fmt::Debug for RunStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStateMachine")
            .field("state", &self.state)
            .finish()
    }
}

/// Armed breakpoints, keyed by (flow name, component id)
#[derive(Debug, Default)]
pub struct Breakpoints {
    armed: HashSet<(String, String)>,
}

impl Breakpoints {
    pub fn add(&mut self, flow: &str, component: &str) {
        self.armed.insert((flow.to_string(), component.to_string()));
    }

    pub fn remove(&mut self, flow: &str, component: &str) {
        self.armed.remove(&(flow.to_string(), component.to_string()));
    }

    pub fn is_armed(&self, flow: &str, component: &str) -> bool {
        self.armed
            .contains(&(flow.to_string(), component.to_string()))
    }

    pub fn clear(&mut self) {
        self.armed.clear();
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}
