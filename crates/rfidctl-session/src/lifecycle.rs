//! Session lifecycle, driven by a small state machine.
//!
//! ```text
//! created --Open--> active.opening --Opened--> active.running
//!                        |                          |
//!                        +--Close / Exited----------+--> closed
//!                        +--Exited [failed]---------+--> failed
//! ```

use std::fmt;
use std::sync::Arc;

use rfidctl_core::Result;
use rfidctl_fsm::{Fsm, StateGraph, StateId, Transition};
use serde::Serialize;
use tracing::info;

/// Externally visible lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Built, never opened.
    Created,

    /// `open` is waiting for the channel.
    Opening,

    /// Channel open, run loop processing messages.
    Running,

    /// Closed without a failure.
    Closed,

    /// Ended by a failure (open failed, or the run loop captured a cause).
    Failed,
}

impl SessionState {
    /// Whether the session can no longer be used.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Opening => write!(f, "opening"),
            Self::Running => write!(f, "running"),
            Self::Closed => write!(f, "closed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifecycleEvent {
    Open,
    Opened,
    Close,
    Exited,
}

/// Data the lifecycle actions and guards work on.
#[derive(Debug)]
pub(crate) struct LifecycleContext {
    address: String,
    failed: bool,
}

struct States {
    created: StateId,
    opening: StateId,
    running: StateId,
    closed: StateId,
    failed: StateId,
}

pub(crate) struct Lifecycle {
    fsm: Fsm<LifecycleEvent, LifecycleContext>,
    context: LifecycleContext,
    states: States,
}

impl Lifecycle {
    pub(crate) fn new(address: &str) -> Result<Self> {
        let mut graph: StateGraph<LifecycleEvent, LifecycleContext> = StateGraph::new();
        let created = graph.add_state("created");
        let active = graph.add_state("active");
        let opening = graph.add_substate("opening", active)?;
        let running = graph.add_substate("running", active)?;
        let closed = graph.add_state("closed");
        let failed = graph.add_state("failed");

        for state in [opening, running, closed, failed] {
            let name = graph.path(state);
            graph.on_entry(state, move |ctx| {
                info!(address = %ctx.context.address, state = %name, "Session state changed");
                Ok(())
            })?;
        }

        let open = Arc::new(Transition::new("open"));
        let opened = Arc::new(Transition::new("opened"));
        let close = Arc::new(Transition::new("close"));
        let fail = Arc::new(
            Transition::<LifecycleEvent, LifecycleContext>::new("fail")
                .with_guard(|ctx| Ok(ctx.context.failed)),
        );
        let exit = Arc::new(Transition::new("exit"));

        graph.connect(created, LifecycleEvent::Open, &open, opening)?;
        graph.connect(opening, LifecycleEvent::Opened, &opened, running)?;
        for active_state in [opening, running] {
            graph.connect(active_state, LifecycleEvent::Close, &close, closed)?;
            graph.connect(active_state, LifecycleEvent::Exited, &fail, failed)?;
            graph.connect(active_state, LifecycleEvent::Exited, &exit, closed)?;
        }

        let mut context = LifecycleContext {
            address: address.to_string(),
            failed: false,
        };
        let fsm = Fsm::new("session", Arc::new(graph), created, 8, &mut context)?;

        Ok(Self {
            fsm,
            context,
            states: States {
                created,
                opening,
                running,
                closed,
                failed,
            },
        })
    }

    pub(crate) fn fire(&mut self, event: LifecycleEvent) -> Result<SessionState> {
        self.fsm.fire(event, &mut self.context)?;
        Ok(self.state())
    }

    /// Report that the session ended, with or without a failure.
    pub(crate) fn exit(&mut self, failed: bool) -> Result<SessionState> {
        self.context.failed = failed;
        self.fire(LifecycleEvent::Exited)
    }

    pub(crate) fn state(&self) -> SessionState {
        let current = self.fsm.current_state_id();
        if current == self.states.created {
            SessionState::Created
        } else if current == self.states.opening {
            SessionState::Opening
        } else if current == self.states.running {
            SessionState::Running
        } else if current == self.states.closed {
            SessionState::Closed
        } else {
            debug_assert_eq!(current, self.states.failed);
            SessionState::Failed
        }
    }

    /// Dotted name of the current state, e.g. `active.running`.
    pub(crate) fn path(&self) -> String {
        self.fsm.graph().path(self.fsm.current_state_id())
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.path())
            .field("transitions", &self.fsm.history().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_open_then_close() {
        let mut lifecycle = Lifecycle::new("reader:5084").unwrap();
        assert_eq!(lifecycle.state(), SessionState::Created);

        assert_eq!(lifecycle.fire(LifecycleEvent::Open).unwrap(), SessionState::Opening);
        assert_eq!(lifecycle.path(), "active.opening");
        assert_eq!(lifecycle.fire(LifecycleEvent::Opened).unwrap(), SessionState::Running);
        assert_eq!(lifecycle.path(), "active.running");
        assert_eq!(lifecycle.fire(LifecycleEvent::Close).unwrap(), SessionState::Closed);
    }

    #[test]
    fn test_close_before_open_is_dropped() {
        let mut lifecycle = Lifecycle::new("reader").unwrap();

        assert_eq!(lifecycle.fire(LifecycleEvent::Close).unwrap(), SessionState::Created);
        assert_eq!(lifecycle.fire(LifecycleEvent::Open).unwrap(), SessionState::Opening);
    }

    #[rstest]
    #[case(false, SessionState::Closed)]
    #[case(true, SessionState::Failed)]
    fn test_exit_from_running(#[case] failed: bool, #[case] expected: SessionState) {
        let mut lifecycle = Lifecycle::new("reader").unwrap();
        lifecycle.fire(LifecycleEvent::Open).unwrap();
        lifecycle.fire(LifecycleEvent::Opened).unwrap();

        assert_eq!(lifecycle.exit(failed).unwrap(), expected);
        assert!(lifecycle.state().is_terminal());
    }

    #[test]
    fn test_terminal_states_ignore_everything() {
        let mut lifecycle = Lifecycle::new("reader").unwrap();
        lifecycle.fire(LifecycleEvent::Open).unwrap();
        lifecycle.exit(true).unwrap();

        for event in [
            LifecycleEvent::Open,
            LifecycleEvent::Opened,
            LifecycleEvent::Close,
            LifecycleEvent::Exited,
        ] {
            assert_eq!(lifecycle.fire(event).unwrap(), SessionState::Failed);
        }
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Running).unwrap();
        assert_eq!(json, "\"running\"");
        assert_eq!(SessionState::Failed.to_string(), "failed");
    }
}
