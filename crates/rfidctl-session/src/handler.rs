//! Generic session handler: one channel, one run loop, one request in flight.
//!
//! A [`SessionHandler`] owns the lifecycle of a device connection. Callers
//! queue requests and get a correlation id back immediately; responses and
//! unsolicited device events come back through the shared [`EventQueue`].
//! What a request looks like on the channel, and how a response is checked
//! against its request, is left to a [`SessionProtocol`].
//!
//! # Run loop
//!
//! `open` spawns a task that waits on a gate until the channel is ready,
//! then receives messages until the channel goes away or something fails:
//!
//! ```text
//! open() ──> spawn run loop ──> request channel ──> await opened ──> gate: Opened(channel)
//!                 │
//!                 └─ gate ─> opened() ─> receive ─> correlate ─> dispatch next ─┐
//!                                           ▲                                  │
//!                                           └──────────────────────────────────┘
//! ```
//!
//! A receive failing with `TransportError::UnknownChannel` is a close. If the
//! close was not requested through [`SessionHandler::close`], its cause is
//! taken from the transport's channel-closed notification. Any other failure
//! ends the session with that failure as the cause, including a send that
//! failed on a caller's task and was handed to the loop. Either way the
//! listeners' `closed` callback gets the requests that never completed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rfidctl_core::constants::{DEFAULT_PRIORITY, MIN_JOIN_TIMEOUT_MS, NO_TIMEOUT};
use rfidctl_core::{ChannelHandle, Error, Result, SessionConfig, TransportError};
use rfidctl_sync::{EventLock, EventPipe, EventPipes, EventQueue, QueueEvent};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::channel_events::{ChannelEvents, ChannelOpened};
use crate::info::SessionInfo;
use crate::lifecycle::{Lifecycle, LifecycleEvent, SessionState};
use crate::transport::{ChannelCallback, Transport};

/// Correlation id handed out by `request` and echoed by responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// A request together with its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest<R> {
    pub id: RequestId,
    pub request: R,
}

/// How an inbound message relates to the request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Answer to the request with this id.
    Response(RequestId),

    /// Device-initiated message, not tied to any request.
    Unsolicited,
}

/// Protocol-specific half of a session.
///
/// Every method runs under the handler's lock and must not block.
pub trait SessionProtocol: Send + Sync + 'static {
    /// Request payload queued by callers.
    type Request: Clone + fmt::Debug + Send + Sync + 'static;

    /// Message exchanged with the transport.
    type Message: Send + 'static;

    /// Event published to the session's queue.
    type Event: QueueEvent;

    /// Build the outbound message for a request about to be dispatched.
    fn request_message(&self, pending: &PendingRequest<Self::Request>) -> Self::Message;

    /// Decide whether `message` answers a request.
    fn classify(&self, message: &Self::Message) -> Inbound;

    /// Check a response against its request and turn it into an event.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionProtocol` when the response cannot belong to
    /// the request; this ends the session.
    fn process_response(
        &self,
        pending: &PendingRequest<Self::Request>,
        message: Self::Message,
    ) -> Result<Option<Self::Event>>;

    /// Turn an unsolicited message into an event, if it is worth publishing.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionProtocol` for a malformed message; this ends
    /// the session.
    fn process_unsolicited(&self, message: Self::Message) -> Result<Option<Self::Event>>;

    /// Queue priority of a published event.
    fn priority(&self, _event: &Self::Event) -> i32 {
        DEFAULT_PRIORITY
    }
}

/// Observer of session start and end.
///
/// Both callbacks run on the session's run loop.
pub trait SessionListener<R>: Send + Sync {
    /// The run loop passed its gate and is receiving.
    fn opened(&self);

    /// The run loop ended.
    ///
    /// `abandoned` lists the requests that never completed, the one in
    /// flight first. `cause` is `None` for a clean close.
    fn closed(&self, abandoned: &[PendingRequest<R>], cause: Option<&Error>);
}

/// Startup signal of the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Opened(ChannelHandle),
    Closed,
}

/// How the receive loop ended.
struct Exit {
    cause: Option<Error>,

    /// The transport already dropped the channel.
    channel_gone: bool,
}

/// State guarded by the handler lock.
struct Shared<R> {
    pending: VecDeque<PendingRequest<R>>,
    executing: Option<PendingRequest<R>>,
    channel: Option<ChannelHandle>,
    opened_at: Option<DateTime<Utc>>,
    closing: bool,
    lifecycle: Lifecycle,
}

impl<R> Shared<R> {
    /// Take every unfinished request, the one in flight first.
    fn drain_requests(&mut self) -> Vec<PendingRequest<R>> {
        self.executing
            .take()
            .into_iter()
            .chain(self.pending.drain(..))
            .collect()
    }
}

struct Inner<P: SessionProtocol, T> {
    config: SessionConfig,
    protocol: P,
    transport: Arc<T>,
    events: Arc<EventQueue<P::Event>>,
    channel_events: ChannelEvents,
    gate: EventPipe<Gate>,

    /// Send failures of requests dispatched outside the run loop.
    send_failures: EventPipe<TransportError>,
    shared: Mutex<Shared<P::Request>>,
    listeners: Mutex<Vec<Arc<dyn SessionListener<P::Request>>>>,
    run_loop: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

/// Session over one transport channel.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use rfidctl_core::SessionConfig;
/// use rfidctl_session::gpio::{GpioProtocol, PinScope};
/// use rfidctl_session::mock::MemoryTransport;
/// use rfidctl_session::SessionHandler;
/// use rfidctl_sync::EventQueue;
///
/// # #[tokio::main]
/// # async fn main() -> rfidctl_core::Result<()> {
/// let (transport, _device) = MemoryTransport::new();
/// let events = Arc::new(EventQueue::new());
/// let session = SessionHandler::new(
///     SessionConfig::new("gpio-board:5084", 500),
///     GpioProtocol,
///     Arc::new(transport),
///     events,
/// )?;
///
/// session.open(&tokio::runtime::Handle::current()).await?;
/// let id = session.request_pin_state(PinScope::All, PinScope::None)?;
/// assert_eq!(session.executing_request().map(|pending| pending.id), Some(id));
/// session.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionHandler<P: SessionProtocol, T> {
    inner: Arc<Inner<P, T>>,
}

impl<P, T> SessionHandler<P, T>
where
    P: SessionProtocol,
    T: Transport<Message = P::Message>,
{
    /// Create a session; nothing is opened until [`open`](Self::open).
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `config` is invalid.
    pub fn new(
        config: SessionConfig,
        protocol: P,
        transport: Arc<T>,
        events: Arc<EventQueue<P::Event>>,
    ) -> Result<Self> {
        config.validate()?;

        let lock = EventLock::new();
        let gate = EventPipe::new(&lock);
        let send_failures = EventPipe::new(&lock);
        let channel_events = ChannelEvents::with_pipes(EventPipes::with_lock(lock));
        let lifecycle = Lifecycle::new(&config.address)?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                protocol,
                transport,
                events,
                channel_events,
                gate,
                send_failures,
                shared: Mutex::new(Shared {
                    pending: VecDeque::new(),
                    executing: None,
                    channel: None,
                    opened_at: None,
                    closing: false,
                    lifecycle,
                }),
                listeners: Mutex::new(Vec::new()),
                run_loop: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        })
    }

    /// Open the channel and start the run loop on `runtime`.
    ///
    /// Waits at most the configured timeout for the transport to report the
    /// channel open. On failure the run loop is stopped and the session ends
    /// in [`SessionState::Failed`].
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the session was already opened or
    /// closed, `Error::Timeout` if the channel did not open in time, or
    /// `Error::Transport` if the transport refused the request.
    pub async fn open(&self, runtime: &Handle) -> Result<()> {
        let inner = &self.inner;
        {
            let mut shared = inner.shared();
            let state = shared.lifecycle.state();
            if state != SessionState::Created {
                return Err(Error::invalid_state(format!(
                    "cannot open a session that is {state}"
                )));
            }
            shared.lifecycle.fire(LifecycleEvent::Open)?;
            shared.closing = false;
        }

        let deadline = Instant::now() + inner.config.timeout();
        inner.channel_events.discard_pending().await;
        *inner.run_loop() = Some(runtime.spawn(Arc::clone(inner).run()));

        let opened = match inner.open_channel().await {
            Ok(opened) => opened,
            Err(err) => {
                inner.abort_open(&err, deadline).await;
                return Err(err);
            }
        };

        let state = {
            let mut shared = inner.shared();
            shared.channel = Some(opened.handle);
            shared.opened_at = Some(Utc::now());
            let state = shared.lifecycle.fire(LifecycleEvent::Opened)?;
            if state == SessionState::Running {
                inner.dispatch_or_report(&mut shared);
            }
            state
        };

        if state != SessionState::Running {
            // Closed while the channel was opening.
            inner.shared().channel = None;
            if let Err(err) = inner.transport.request_closing_channel(opened.handle) {
                debug!(channel = %opened.handle, error = %err, "Closing late channel failed");
            }
            inner.gate.fire(Gate::Closed);
            return Err(Error::invalid_state("session closed while opening"));
        }

        inner.gate.fire(Gate::Opened(opened.handle));
        info!(address = %inner.config.address, channel = %opened.handle, "Session opened");
        Ok(())
    }

    /// Close the channel and stop the run loop.
    ///
    /// The whole call, including joining the run loop, is bounded by roughly
    /// one configured timeout. Closing a session that never opened only
    /// drops its queued requests.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if the transport did not confirm the close or
    /// the run loop did not stop in time, or `Error::Transport` if the close
    /// request failed.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.config.timeout();

        let channel = {
            let mut shared = inner.shared();
            shared.closing = true;
            if shared.lifecycle.state() == SessionState::Created {
                let dropped = shared.drain_requests().len();
                debug!(address = %inner.config.address, dropped, "Closing a session that never opened");
            }
            shared.lifecycle.fire(LifecycleEvent::Close)?;
            shared.channel.take()
        };

        let running = inner
            .run_loop()
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if running {
            inner.gate.fire(Gate::Closed);
        }

        let closed = match channel {
            Some(channel) => inner.close_channel(channel).await,
            None => Ok(()),
        };
        let joined = inner.join_run_loop(deadline).await;

        info!(address = %inner.config.address, "Session closed");
        closed.and(joined)
    }

    /// Queue a request and dispatch it if nothing is in flight.
    ///
    /// The result of the request arrives on the event queue. A failed send
    /// ends the session: listeners get `closed` with the request abandoned
    /// and the transport error as the cause.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the session is closed or failed.
    pub fn request(&self, request: P::Request) -> Result<RequestId> {
        let inner = &self.inner;
        let mut shared = inner.shared();

        let state = shared.lifecycle.state();
        if state.is_terminal() {
            return Err(Error::invalid_state(format!(
                "cannot send requests on a session that is {state}"
            )));
        }

        let id = RequestId::new(inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        debug!(address = %inner.config.address, request = %id, "Request queued");
        shared.pending.push_back(PendingRequest { id, request });

        inner.dispatch_or_report(&mut shared);
        Ok(id)
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener<P::Request>>) {
        self.inner.listeners().push(listener);
    }

    /// Unregister a listener; returns whether it was registered.
    pub fn remove_listener(&self, listener: &Arc<dyn SessionListener<P::Request>>) -> bool {
        let mut listeners = self.inner.listeners();
        let before = listeners.len();
        listeners.retain(|registered| !Arc::ptr_eq(registered, listener));
        listeners.len() != before
    }

    pub fn state(&self) -> SessionState {
        self.inner.shared().lifecycle.state()
    }

    /// Snapshot of the session for monitoring.
    pub fn info(&self) -> SessionInfo {
        let shared = self.inner.shared();
        SessionInfo {
            address: self.inner.config.address.clone(),
            state: shared.lifecycle.state(),
            channel: shared.channel,
            opened_at: shared.opened_at,
            pending: shared.pending.len(),
            executing: shared.executing.as_ref().map(|pending| pending.id),
        }
    }

    /// Requests waiting behind the one in flight, oldest first.
    pub fn pending_requests(&self) -> Vec<PendingRequest<P::Request>> {
        self.inner.shared().pending.iter().cloned().collect()
    }

    pub fn executing_request(&self) -> Option<PendingRequest<P::Request>> {
        self.inner.shared().executing.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn protocol(&self) -> &P {
        &self.inner.protocol
    }

    /// Queue the session publishes responses and device events to.
    pub fn events(&self) -> &Arc<EventQueue<P::Event>> {
        &self.inner.events
    }
}

impl<P, T> Inner<P, T>
where
    P: SessionProtocol,
    T: Transport<Message = P::Message>,
{
    fn shared(&self) -> MutexGuard<'_, Shared<P::Request>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Arc<dyn SessionListener<P::Request>>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_loop(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.run_loop.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open_channel(&self) -> Result<ChannelOpened> {
        let callback: Arc<dyn ChannelCallback> = Arc::new(self.channel_events.clone());
        self.transport
            .request_opening_channel(&self.config.address, callback)?;
        self.channel_events
            .await_channel_opened(self.config.timeout_millis())
            .await
    }

    async fn abort_open(&self, cause: &Error, deadline: Instant) {
        warn!(address = %self.config.address, error = %cause, "Session failed to open");
        {
            let mut shared = self.shared();
            shared.closing = true;
            if let Err(err) = shared.lifecycle.exit(true) {
                warn!(address = %self.config.address, error = %err, "Lifecycle update failed");
            }
        }
        self.gate.fire(Gate::Closed);
        if let Err(err) = self.join_run_loop(deadline).await {
            warn!(address = %self.config.address, error = %err, "Run loop did not stop after failed open");
        }
    }

    async fn close_channel(&self, channel: ChannelHandle) -> Result<()> {
        match self.transport.request_closing_channel(channel) {
            Ok(()) => {
                let closed = self
                    .channel_events
                    .await_channel_closed(self.config.timeout_millis())
                    .await?;
                debug!(channel = %closed.handle, cause = ?closed.cause, "Channel close confirmed");
                Ok(())
            }
            Err(TransportError::UnknownChannel(_)) => {
                debug!(channel = %channel, "Channel already gone");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Join the run loop with whatever is left until `deadline`.
    async fn join_run_loop(&self, deadline: Instant) -> Result<()> {
        let Some(mut task) = self.run_loop().take() else {
            return Ok(());
        };

        let floor = Duration::from_millis(MIN_JOIN_TIMEOUT_MS);
        let budget = deadline.saturating_duration_since(Instant::now()).max(floor);
        match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.report_join_error(&err);
                Ok(())
            }
            Err(_) => {
                warn!(address = %self.config.address, "Run loop did not stop in time");
                Err(Error::timeout(self.config.timeout_millis()))
            }
        }
    }

    fn report_join_error(&self, err: &JoinError) {
        if err.is_panic() {
            error!(address = %self.config.address, "Session run loop panicked");
        } else {
            debug!(address = %self.config.address, "Session run loop cancelled");
        }
    }

    /// Send the next queued request unless one is already in flight.
    fn dispatch(&self, shared: &mut Shared<P::Request>) -> std::result::Result<(), TransportError> {
        if shared.executing.is_some() || shared.closing {
            return Ok(());
        }
        let Some(channel) = shared.channel else {
            return Ok(());
        };
        let Some(next) = shared.pending.pop_front() else {
            return Ok(());
        };

        let message = self.protocol.request_message(&next);
        debug!(channel = %channel, request = %next.id, "Dispatching request");
        shared.executing = Some(next);
        self.transport.request_sending_data(channel, message)
    }

    /// Dispatch from a caller's thread; a send failure is handed to the run loop.
    fn dispatch_or_report(&self, shared: &mut Shared<P::Request>) {
        if let Err(err) = self.dispatch(shared) {
            warn!(address = %self.config.address, error = %err, "Request dispatch failed");
            self.send_failures.fire(err);
        }
    }

    async fn run(self: Arc<Self>) {
        let gate = self
            .gate
            .await_events(NO_TIMEOUT)
            .await
            .ok()
            .and_then(|events| events.first().copied());

        let Some(Gate::Opened(channel)) = gate else {
            self.finish_unopened();
            return;
        };

        for listener in self.listener_snapshot() {
            listener.opened();
        }

        let exit = self.receive(channel).await;
        self.finish(channel, exit);
    }

    async fn receive(&self, channel: ChannelHandle) -> Exit {
        loop {
            let received = tokio::select! {
                biased;
                failures = self.send_failures.await_events(NO_TIMEOUT) => {
                    match failures.ok().and_then(|failures| failures.into_iter().next()) {
                        Some(err) => {
                            return Exit {
                                cause: Some(err.into()),
                                channel_gone: false,
                            };
                        }
                        None => continue,
                    }
                }
                received = self.transport.await_received_data(channel, NO_TIMEOUT) => received,
            };

            match received {
                Ok(message) => {
                    if let Err(err) = self.handle_message(message) {
                        return Exit {
                            cause: Some(err),
                            channel_gone: false,
                        };
                    }
                }
                Err(TransportError::UnknownChannel(_)) => {
                    return Exit {
                        cause: self.remote_close_cause().await,
                        channel_gone: true,
                    };
                }
                Err(err) => {
                    return Exit {
                        cause: Some(err.into()),
                        channel_gone: false,
                    };
                }
            }
        }
    }

    /// Cause of a close nobody asked for, from the channel-closed notification.
    async fn remote_close_cause(&self) -> Option<Error> {
        let closing = self.shared().closing;
        if closing {
            return None;
        }

        match self
            .channel_events
            .await_channel_closed(self.config.timeout_millis())
            .await
        {
            Ok(closed) => closed.cause.map(Error::from),
            Err(err) => {
                warn!(address = %self.config.address, "Channel vanished without a close notification");
                Some(err)
            }
        }
    }

    /// Correlate one inbound message, publish what it yields, dispatch the next request.
    fn handle_message(&self, message: P::Message) -> Result<()> {
        let (event, dispatched) = {
            let mut shared = self.shared();
            let event = match self.protocol.classify(&message) {
                Inbound::Response(id) => {
                    let pending = match shared.executing.take() {
                        Some(pending) if pending.id == id => pending,
                        other => {
                            let err = match &other {
                                Some(pending) => Error::protocol(format!(
                                    "response to {id} while {} is in flight",
                                    pending.id
                                )),
                                None => Error::protocol(format!(
                                    "response to {id} with no request in flight"
                                )),
                            };
                            shared.executing = other;
                            return Err(err);
                        }
                    };
                    match self.protocol.process_response(&pending, message) {
                        Ok(event) => event,
                        Err(err) => {
                            shared.executing = Some(pending);
                            return Err(err);
                        }
                    }
                }
                Inbound::Unsolicited => self.protocol.process_unsolicited(message)?,
            };
            (event, self.dispatch(&mut shared))
        };

        if let Some(event) = event {
            let priority = self.protocol.priority(&event);
            self.events.put_with_priority(event, priority);
        }
        dispatched.map_err(Error::from)
    }

    fn finish(&self, channel: ChannelHandle, exit: Exit) {
        let Exit {
            cause,
            channel_gone,
        } = exit;

        let (abandoned, close_channel) = {
            let mut shared = self.shared();
            let abandoned = shared.drain_requests();
            let owns_close = !shared.closing;
            if owns_close {
                shared.channel = None;
            }
            if let Err(err) = shared.lifecycle.exit(cause.is_some()) {
                warn!(address = %self.config.address, error = %err, "Lifecycle update failed");
            }
            (abandoned, owns_close && !channel_gone)
        };

        if close_channel && let Err(err) = self.transport.request_closing_channel(channel) {
            debug!(channel = %channel, error = %err, "Closing channel after run loop exit failed");
        }

        self.notify_closed(&abandoned, cause.as_ref());
    }

    fn finish_unopened(&self) {
        let mut shared = self.shared();
        let dropped = shared.drain_requests().len();
        if let Err(err) = shared.lifecycle.exit(false) {
            warn!(address = %self.config.address, error = %err, "Lifecycle update failed");
        }
        debug!(address = %self.config.address, dropped, "Session closed before it opened");
    }

    fn notify_closed(&self, abandoned: &[PendingRequest<P::Request>], cause: Option<&Error>) {
        let listeners = self.listener_snapshot();

        match cause {
            Some(err) if listeners.is_empty() => error!(
                address = %self.config.address,
                error = %err,
                abandoned = abandoned.len(),
                "Session failed with no listener to report to"
            ),
            Some(err) => warn!(address = %self.config.address, error = %err, "Session run loop failed"),
            None => debug!(address = %self.config.address, abandoned = abandoned.len(), "Session run loop finished"),
        }

        for listener in &listeners {
            listener.closed(abandoned, cause);
        }
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn SessionListener<P::Request>>> {
        self.listeners().clone()
    }
}

impl<P: SessionProtocol, T> fmt::Debug for SessionHandler<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("SessionHandler")
            .field("address", &self.inner.config.address)
            .field("lifecycle", &shared.lifecycle)
            .field("pending", &shared.pending.len())
            .finish()
    }
}
