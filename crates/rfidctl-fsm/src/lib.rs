//! Table-driven hierarchical state machine engine.
//!
//! Protocol behavior is described as data: states, the events that leave
//! them, and the guards and actions attached to each edge. The engine only
//! knows how to walk that table.
//!
//! # Building a machine
//!
//! ```
//! use std::sync::Arc;
//! use rfidctl_fsm::{Fsm, StateGraph, Transition};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! enum Event {
//!     Connect,
//!     Disconnect,
//! }
//!
//! #[derive(Default)]
//! struct Counters {
//!     connects: u32,
//! }
//!
//! # fn main() -> rfidctl_core::Result<()> {
//! let mut graph = StateGraph::new();
//! let idle = graph.add_state("idle");
//! let connected = graph.add_state("connected");
//!
//! let connect = Arc::new(Transition::<Event, Counters>::new("connect").with_action(|ctx| {
//!     ctx.context.connects += 1;
//!     Ok(())
//! }));
//! graph.connect(idle, Event::Connect, &connect, connected)?;
//! graph.connect(connected, Event::Disconnect, &Arc::new(Transition::new("disconnect")), idle)?;
//!
//! let mut counters = Counters::default();
//! let mut fsm = Fsm::new("reader", Arc::new(graph), idle, 10, &mut counters)?;
//!
//! fsm.fire(Event::Connect, &mut counters)?;
//! assert_eq!(fsm.current_state().name(), "connected");
//! assert_eq!(counters.connects, 1);
//! assert_eq!(fsm.history().len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Firing order
//!
//! For a matching connection the engine runs the source's exit actions, the
//! transition's actions, commits the new current state and history, then
//! runs the destination's entry actions. A failing entry action therefore
//! leaves the transition committed.
//!
//! # Threading
//!
//! An [`Fsm`] is driven by one caller at a time (`fire` takes `&mut self`).
//! Actions that need to fire follow-up events use
//! [`ActionContext::raise`]; those events are processed by the `fire` call
//! already in progress, in FIFO order.

mod machine;
mod state;
mod transition;

pub use machine::Fsm;
pub use state::{State, StateGraph, StateId};
pub use transition::{Action, ActionContext, Guard, GuardContext, StateConnection, Transition};
