//! Shared lock behind event pipes.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rfidctl_core::{Error, Result, Wait};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Identifier of one buffer inside an [`EventLock`].
pub(crate) type SlotId = u64;

/// Buffers guarded by an [`EventLock`].
///
/// Each slot holds a type-erased `Vec<T>` of not-yet-consumed events.
#[derive(Default)]
pub(crate) struct Slots {
    buffers: HashMap<SlotId, Box<dyn Any + Send>>,
    by_type: HashMap<TypeId, SlotId>,
    next_id: SlotId,
}

impl Slots {
    pub(crate) fn allocate<T: Send + 'static>(&mut self) -> SlotId {
        let id = self.next_id;
        self.next_id += 1;
        self.buffers.insert(id, Box::new(Vec::<T>::new()));
        id
    }

    pub(crate) fn release(&mut self, id: SlotId) {
        self.buffers.remove(&id);
    }

    pub(crate) fn buffer<T: Send + 'static>(&mut self, id: SlotId) -> Option<&mut Vec<T>> {
        self.buffers.get_mut(&id)?.downcast_mut::<Vec<T>>()
    }

    /// Slot registered for `T`, allocating it on first use.
    pub(crate) fn slot_for_type<T: Send + 'static>(&mut self) -> SlotId {
        if let Some(id) = self.by_type.get(&TypeId::of::<T>()) {
            return *id;
        }
        let id = self.allocate::<T>();
        self.by_type.insert(TypeId::of::<T>(), id);
        id
    }

    pub(crate) fn typed_slot<T: 'static>(&self) -> Option<SlotId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    pub(crate) fn forget_type<T: 'static>(&mut self) {
        if let Some(id) = self.by_type.remove(&TypeId::of::<T>()) {
            self.buffers.remove(&id);
        }
    }

    pub(crate) fn drain<T: Send + 'static>(&mut self, id: SlotId) -> Vec<T> {
        self.buffer::<T>(id).map(std::mem::take).unwrap_or_default()
    }
}

#[derive(Default)]
struct Shared {
    slots: Mutex<Slots>,
    notify: Notify,
}

/// Mutex shared by one or more event pipes.
///
/// Cloning an `EventLock` yields another handle to the same lock, so pipes
/// created from clones are mutually exclusive with each other.
///
/// # Example
///
/// ```
/// use rfidctl_sync::{EventLock, EventPipe, EventPipes};
///
/// let lock = EventLock::new();
/// let gate: EventPipe<bool> = EventPipe::new(&lock);
/// let pipes = EventPipes::with_lock(lock.clone());
/// # let _ = (gate, pipes);
/// ```
#[derive(Clone, Default)]
pub struct EventLock {
    shared: Arc<Shared>,
}

impl EventLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn slots(&self) -> MutexGuard<'_, Slots> {
        self.shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake every waiter so it re-checks its buffer.
    pub(crate) fn wake(&self) {
        self.shared.notify.notify_waiters();
    }

    /// Wait until `drain` yields at least one event, honoring the pipe
    /// timeout convention.
    ///
    /// `drain` runs under the lock; whatever it returns is handed back as is.
    pub(crate) async fn wait<T>(
        &self,
        timeout_ms: i64,
        mut drain: impl FnMut(&mut Slots) -> Vec<T>,
    ) -> Result<Vec<T>> {
        let wait = Wait::for_pipe(timeout_ms);
        let deadline = wait.limit().map(|limit| Instant::now() + limit);

        loop {
            let mut notified = pin!(self.shared.notify.notified());
            notified.as_mut().enable();

            let events = drain(&mut *self.slots());
            if !events.is_empty() || wait == Wait::Immediate {
                return Ok(events);
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(Error::timeout(timeout_ms));
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for EventLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLock")
            .field("slots", &self.slots().buffers.len())
            .finish()
    }
}
