//! Priority event queue with per-kind listeners.
//!
//! # Architecture
//!
//! ```text
//! producers ──put──►┌──────────────────────┐──take──► consumers
//!                   │ priority → FIFO      │
//!                   │ (main lock + notify) │
//!                   └──────────┬───────────┘
//!                              │ outside the lock
//!                              ▼
//!                   listener snapshot (arc-swap)
//!                   kind → [listener, ...]
//! ```
//!
//! The listener registry is an immutable map swapped atomically on every
//! change, so callbacks never run under the queue's lock and a slow listener
//! cannot stall producers or consumers.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use rfidctl_core::constants::DEFAULT_PRIORITY;
use rfidctl_core::{Error, Result, Wait};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Event that can travel through an [`EventQueue`].
pub trait QueueEvent: Clone + Send + Sync + 'static {
    /// Key used to select listeners.
    type Kind: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Kind of this event.
    fn kind(&self) -> Self::Kind;
}

/// Observer of queue activity for one event kind.
pub trait EventQueueListener<E: QueueEvent>: Send + Sync {
    /// Called once `event` has been appended by `put`.
    fn added(&self, queue: &EventQueue<E>, event: &E);

    /// Called once `event` has been removed by `take`.
    fn removed(&self, queue: &EventQueue<E>, event: &E);
}

type Listeners<E> = Arc<[Arc<dyn EventQueueListener<E>>]>;
type ListenerMap<E> = HashMap<<E as QueueEvent>::Kind, Listeners<E>>;

/// Tracks the `added` fan-out of one queued event.
///
/// `take` does not pop an event until its announcement is complete.
#[derive(Default)]
struct Announcement {
    done: AtomicBool,
    notify: Notify,
}

impl Announcement {
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Completes the announcement when dropped, even if a listener panics.
struct Announcing(Arc<Announcement>);

impl Drop for Announcing {
    fn drop(&mut self) {
        self.0.done.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }
}

struct Queued<E> {
    event: E,
    announcement: Option<Arc<Announcement>>,
}

enum Head<E> {
    Ready(E),
    Announcing(Arc<Announcement>),
    Empty,
}

struct Buckets<E> {
    queues: HashMap<i32, VecDeque<Queued<E>>>,
    max_priority: Option<i32>,
    len: usize,
}

impl<E> Default for Buckets<E> {
    fn default() -> Self {
        Self {
            queues: HashMap::new(),
            max_priority: None,
            len: 0,
        }
    }
}

impl<E> Buckets<E> {
    fn push(&mut self, event: E, priority: i32, announcement: Option<Arc<Announcement>>) {
        self.queues.entry(priority).or_default().push_back(Queued {
            event,
            announcement,
        });
        if self.max_priority.is_none_or(|max| priority > max) {
            self.max_priority = Some(priority);
        }
        self.len += 1;
    }

    /// Pop the head of the highest bucket unless its `added` fan-out is still running.
    fn pop(&mut self) -> Head<E> {
        let Some(priority) = self.max_priority else {
            return Head::Empty;
        };
        let Some(queue) = self.queues.get_mut(&priority) else {
            return Head::Empty;
        };

        if let Some(announcement) = queue.front().and_then(|head| head.announcement.as_ref())
            && !announcement.is_done()
        {
            return Head::Announcing(Arc::clone(announcement));
        }
        let Some(queued) = queue.pop_front() else {
            return Head::Empty;
        };

        if queue.is_empty() {
            self.queues.remove(&priority);
            self.max_priority = self.queues.keys().copied().max();
        }
        self.len -= 1;
        Head::Ready(queued.event)
    }
}

/// Priority-ordered queue of domain events.
///
/// Higher priorities drain first; within one priority the order is FIFO.
///
/// # Timeouts
///
/// [`take`](EventQueue::take) treats `0` as "block forever", unlike
/// [`EventPipe::await_events`](crate::EventPipe::await_events) where `0`
/// means "do not block". Existing callers rely on both readings.
///
/// # Examples
///
/// ```
/// use rfidctl_sync::{EventQueue, QueueEvent};
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct Tag(&'static str);
///
/// impl QueueEvent for Tag {
///     type Kind = ();
///     fn kind(&self) {}
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> rfidctl_core::Result<()> {
/// let queue = EventQueue::new();
/// queue.put_with_priority(Tag("a"), 0);
/// queue.put_with_priority(Tag("b"), 1);
///
/// assert_eq!(queue.take(-1).await?, Tag("b"));
/// assert_eq!(queue.take(-1).await?, Tag("a"));
/// # Ok(())
/// # }
/// ```
pub struct EventQueue<E: QueueEvent> {
    buckets: Mutex<Buckets<E>>,
    notify: Notify,
    listeners: ArcSwap<ListenerMap<E>>,
}

impl<E: QueueEvent> Default for EventQueue<E> {
    fn default() -> Self {
        Self {
            buckets: Mutex::new(Buckets::default()),
            notify: Notify::new(),
            listeners: ArcSwap::from_pointee(HashMap::new()),
        }
    }
}

impl<E: QueueEvent> EventQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn buckets(&self) -> MutexGuard<'_, Buckets<E>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event with the default priority.
    pub fn put(&self, event: E) {
        self.put_with_priority(event, DEFAULT_PRIORITY);
    }

    /// Append an event to its priority's FIFO and notify `added` listeners.
    ///
    /// No `take` returns the event before every `added` callback has run.
    pub fn put_with_priority(&self, event: E, priority: i32) {
        let Some(listeners) = self.listeners_for(&event.kind()) else {
            self.buckets().push(event, priority, None);
            self.notify.notify_waiters();
            trace!(priority, "Event queued");
            return;
        };

        let announcing = Announcing(Arc::new(Announcement::default()));
        let notified = event.clone();
        self.buckets()
            .push(event, priority, Some(Arc::clone(&announcing.0)));
        self.notify.notify_waiters();
        trace!(priority, "Event queued");

        for listener in listeners.iter() {
            listener.added(self, &notified);
        }
        drop(announcing);
    }

    /// Remove the head of the highest-priority bucket.
    ///
    /// - `timeout_ms <= 0`: wait until an event is available.
    /// - `timeout_ms > 0`: wait up to that long.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if a bounded wait sees no event.
    pub async fn take(&self, timeout_ms: i64) -> Result<E> {
        let deadline = Wait::for_queue(timeout_ms)
            .limit()
            .map(|limit| Instant::now() + limit);

        let event = loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            let popped = self.buckets().pop();
            let announcement = match popped {
                Head::Ready(event) => break event,
                Head::Announcing(announcement) => announcement,
                Head::Empty => {
                    match deadline {
                        None => notified.await,
                        Some(deadline) => {
                            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                                return Err(Error::timeout(timeout_ms));
                            }
                        }
                    }
                    continue;
                }
            };

            let mut announced = pin!(announcement.notify.notified());
            announced.as_mut().enable();
            if announcement.is_done() {
                continue;
            }
            match deadline {
                None => announced.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, announced).await.is_err() {
                        return Err(Error::timeout(timeout_ms));
                    }
                }
            }
        };

        if let Some(listeners) = self.listeners_for(&event.kind()) {
            for listener in listeners.iter() {
                listener.removed(self, &event);
            }
        }
        Ok(event)
    }

    /// Drop every queued event without notifying listeners.
    pub fn clear(&self) {
        *self.buckets() = Buckets::default();
    }

    pub fn len(&self) -> usize {
        self.buckets().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a listener for events of `kind`.
    pub fn add_listener(&self, kind: E::Kind, listener: Arc<dyn EventQueueListener<E>>) {
        self.listeners.rcu(|current| {
            let mut next = HashMap::clone(current);
            let mut registered: Vec<_> = next
                .get(&kind)
                .map(|listeners| listeners.to_vec())
                .unwrap_or_default();
            registered.push(Arc::clone(&listener));
            next.insert(kind.clone(), registered.into());
            next
        });
    }

    /// Unregister a listener previously added for `kind`.
    ///
    /// Listeners are compared by identity.
    pub fn remove_listener(&self, kind: &E::Kind, listener: &Arc<dyn EventQueueListener<E>>) {
        self.listeners.rcu(|current| {
            let mut next = HashMap::clone(current);
            if let Some(listeners) = next.get(kind) {
                let remaining: Vec<_> = listeners
                    .iter()
                    .filter(|registered| !Arc::ptr_eq(registered, listener))
                    .cloned()
                    .collect();
                if remaining.is_empty() {
                    next.remove(kind);
                } else {
                    next.insert(kind.clone(), remaining.into());
                }
            }
            next
        });
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: &E::Kind) -> usize {
        self.listeners
            .load()
            .get(kind)
            .map_or(0, |listeners| listeners.len())
    }

    fn listeners_for(&self, kind: &E::Kind) -> Option<Listeners<E>> {
        self.listeners.load().get(kind).cloned()
    }
}

impl<E: QueueEvent> fmt::Debug for EventQueue<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let buckets = self.buckets();
        f.debug_struct("EventQueue")
            .field("len", &buckets.len)
            .field("max_priority", &buckets.max_priority)
            .finish()
    }
}
