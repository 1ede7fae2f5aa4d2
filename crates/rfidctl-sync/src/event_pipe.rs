//! Single-type rendezvous mailbox.

use std::fmt;
use std::marker::PhantomData;

use rfidctl_core::Result;
use tracing::trace;

use crate::lock::{EventLock, SlotId};

/// Mailbox for events of one type.
///
/// Fired events are buffered until a consumer calls
/// [`await_events`](EventPipe::await_events), which takes the entire buffer
/// at once. All operations run under the [`EventLock`] given at construction,
/// so a pipe can share a critical section with other pipes on that lock.
///
/// # Examples
///
/// ```
/// use rfidctl_sync::{EventLock, EventPipe};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> rfidctl_core::Result<()> {
/// let pipe = EventPipe::new(&EventLock::new());
/// pipe.fire(1);
/// pipe.fire(2);
///
/// assert_eq!(pipe.await_events(0).await?, vec![1, 2]);
/// assert!(pipe.await_events(0).await?.is_empty());
/// # Ok(())
/// # }
/// ```
pub struct EventPipe<T> {
    lock: EventLock,
    slot: SlotId,
    _events: PhantomData<fn(T) -> T>,
}

impl<T: Send + 'static> EventPipe<T> {
    /// Create a pipe guarded by `lock`.
    pub fn new(lock: &EventLock) -> Self {
        let slot = lock.slots().allocate::<T>();
        Self {
            lock: lock.clone(),
            slot,
            _events: PhantomData,
        }
    }

    /// Buffer an event and wake waiting consumers.
    pub fn fire(&self, event: T) {
        {
            let mut slots = self.lock.slots();
            if let Some(buffer) = slots.buffer::<T>(self.slot) {
                buffer.push(event);
            }
        }
        trace!(slot = self.slot, "Event fired");
        self.lock.wake();
    }

    /// Take every buffered event.
    ///
    /// - `timeout_ms < 0`: wait until at least one event is present.
    /// - `timeout_ms == 0`: return the buffer as it is, possibly empty.
    /// - `timeout_ms > 0`: wait up to that long.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` carrying `timeout_ms` if a bounded wait
    /// sees no event.
    pub async fn await_events(&self, timeout_ms: i64) -> Result<Vec<T>> {
        let slot = self.slot;
        self.lock
            .wait(timeout_ms, |slots| slots.drain::<T>(slot))
            .await
    }

    /// Number of events waiting to be consumed.
    pub fn len(&self) -> usize {
        self.lock
            .slots()
            .buffer::<T>(self.slot)
            .map_or(0, |buffer| buffer.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock guarding this pipe.
    pub fn lock(&self) -> &EventLock {
        &self.lock
    }
}

impl<T> Drop for EventPipe<T> {
    fn drop(&mut self) {
        self.lock.slots().release(self.slot);
    }
}

impl<T> fmt::Debug for EventPipe<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPipe").field("slot", &self.slot).finish()
    }
}
