//! Registry of event pipes keyed by event type.

use rfidctl_core::Result;
use tracing::trace;

use crate::lock::EventLock;

/// Per-type event pipes sharing one lock.
///
/// A pipe for type `T` is created the first time an event of that type is
/// fired (or awaited) and is removed again once
/// [`await_events`](EventPipes::await_events) hands its events over. A type
/// that is fired but never awaited keeps accumulating, so every fired type
/// should have a consumer.
///
/// # Examples
///
/// ```
/// use rfidctl_sync::EventPipes;
///
/// #[derive(Debug, PartialEq)]
/// struct Opened(u64);
/// #[derive(Debug, PartialEq)]
/// struct Closed;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> rfidctl_core::Result<()> {
/// let pipes = EventPipes::new();
/// pipes.fire(Opened(3));
/// pipes.fire(Closed);
///
/// assert_eq!(pipes.await_events::<Opened>(0).await?, vec![Opened(3)]);
/// assert_eq!(pipes.await_events::<Closed>(0).await?, vec![Closed]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct EventPipes {
    lock: EventLock,
}

impl EventPipes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry whose pipes use an existing lock.
    pub fn with_lock(lock: EventLock) -> Self {
        Self { lock }
    }

    /// Route an event to the pipe for its type.
    pub fn fire<T: Send + 'static>(&self, event: T) {
        {
            let mut slots = self.lock.slots();
            let slot = slots.slot_for_type::<T>();
            if let Some(buffer) = slots.buffer::<T>(slot) {
                buffer.push(event);
            }
        }
        trace!(event_type = std::any::type_name::<T>(), "Event fired");
        self.lock.wake();
    }

    /// Take every buffered event of type `T`, then drop the pipe for `T`.
    ///
    /// Timeout semantics are those of
    /// [`EventPipe::await_events`](crate::EventPipe::await_events).
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if a bounded wait sees no event of type `T`.
    pub async fn await_events<T: Send + 'static>(&self, timeout_ms: i64) -> Result<Vec<T>> {
        let result = self
            .lock
            .wait(timeout_ms, |slots| {
                let events = slots
                    .typed_slot::<T>()
                    .map(|slot| slots.drain::<T>(slot))
                    .unwrap_or_default();
                if !events.is_empty() {
                    slots.forget_type::<T>();
                }
                events
            })
            .await;

        // An empty immediate drain still resets the pipe, unless a fire raced in.
        let mut slots = self.lock.slots();
        if let Some(slot) = slots.typed_slot::<T>()
            && slots.buffer::<T>(slot).is_none_or(|buffer| buffer.is_empty())
        {
            slots.forget_type::<T>();
        }

        result
    }

    /// Whether a pipe currently exists for type `T`.
    pub fn has_pipe<T: 'static>(&self) -> bool {
        self.lock.slots().typed_slot::<T>().is_some()
    }

    /// Lock shared by every pipe in this registry.
    pub fn lock(&self) -> &EventLock {
        &self.lock
    }
}
