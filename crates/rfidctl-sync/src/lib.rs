//! Rendezvous and queueing primitives used by the protocol handlers.
//!
//! # Components
//!
//! - [`EventLock`]: the mutex a group of pipes shares.
//! - [`EventPipe`]: a mailbox for one event type; `await_events` drains it.
//! - [`EventPipes`]: pipes created per event type on demand, all under one lock.
//! - [`EventQueue`]: priority queue of domain events with per-kind listeners.
//!
//! The pipes turn callback-driven notifications into awaitable calls:
//!
//! ```
//! use rfidctl_sync::{EventLock, EventPipe};
//!
//! # async fn example() -> rfidctl_core::Result<()> {
//! let lock = EventLock::new();
//! let pipe = EventPipe::new(&lock);
//!
//! pipe.fire("opened");
//! let events = pipe.await_events(0).await?;
//! assert_eq!(events, vec!["opened"]);
//! # Ok(())
//! # }
//! ```
//!
//! # Timeouts
//!
//! All timeouts are milliseconds. Pipes read `0` as "return immediately",
//! the queue reads `0` as "block forever". See [`rfidctl_core::Wait`].

mod event_pipe;
mod event_pipes;
mod event_queue;
mod lock;

pub use event_pipe::EventPipe;
pub use event_pipes::EventPipes;
pub use event_queue::{EventQueue, EventQueueListener, QueueEvent};
pub use lock::EventLock;
