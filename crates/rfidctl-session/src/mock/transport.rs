//! Mock transport that keeps its channels in memory.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rfidctl_core::{ChannelHandle, TransportError, Wait};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::transport::{ChannelCallback, Transport};

type Inbound<M> = Result<M, TransportError>;

struct Channel<M> {
    inbound_tx: mpsc::UnboundedSender<Inbound<M>>,
    inbound_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Inbound<M>>>>,
    callback: Arc<dyn ChannelCallback>,
}

struct State<M> {
    channels: HashMap<ChannelHandle, Channel<M>>,
    next_handle: u64,
    responsive: bool,
    refusing: bool,
}

struct Shared<M> {
    state: Mutex<State<M>>,
    sent_tx: mpsc::UnboundedSender<M>,
}

impl<M> Shared<M> {
    fn state(&self) -> MutexGuard<'_, State<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Most recently opened channel.
    fn latest(&self) -> Option<ChannelHandle> {
        self.state().channels.keys().max().copied()
    }

    /// Drop a channel; pending receives complete with `UnknownChannel`.
    fn remove(&self, handle: ChannelHandle, cause: Option<TransportError>) -> Result<(), TransportError> {
        let channel = self
            .state()
            .channels
            .remove(&handle)
            .ok_or(TransportError::UnknownChannel(handle))?;
        drop(channel.inbound_tx);
        channel.callback.channel_closed(handle, cause);
        Ok(())
    }
}

/// Transport whose channels live in memory.
///
/// Opening succeeds immediately (unless the transport is made unresponsive
/// or refusing through its handle). Every message a session sends can be
/// read back with [`MemoryTransportHandle::next_sent`], and the handle plays
/// the device: it delivers inbound messages, injects receive failures and
/// closes channels remotely.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use rfidctl_core::ChannelHandle;
/// use rfidctl_session::mock::MemoryTransport;
/// use rfidctl_session::{ChannelEvents, Transport};
///
/// # #[tokio::main]
/// # async fn main() -> rfidctl_core::Result<()> {
/// let (transport, device) = MemoryTransport::<String>::new();
/// let events = ChannelEvents::new();
///
/// transport.request_opening_channel("reader:5084", Arc::new(events.clone()))?;
/// let opened = events.await_channel_opened(100).await?;
///
/// device.deliver("hello".to_string())?;
/// let message = transport.await_received_data(opened.handle, 100).await?;
/// assert_eq!(message, "hello");
/// # Ok(())
/// # }
/// ```
pub struct MemoryTransport<M> {
    shared: Arc<Shared<M>>,
}

impl<M: Send + 'static> MemoryTransport<M> {
    /// Create a transport and the handle that drives it.
    pub fn new() -> (Self, MemoryTransportHandle<M>) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                channels: HashMap::new(),
                next_handle: 0,
                responsive: true,
                refusing: false,
            }),
            sent_tx,
        });

        let handle = MemoryTransportHandle {
            shared: Arc::clone(&shared),
            sent_rx: Arc::new(AsyncMutex::new(sent_rx)),
        };

        (Self { shared }, handle)
    }
}

impl<M: Send + 'static> Transport for MemoryTransport<M> {
    type Message = M;

    fn request_opening_channel(
        &self,
        address: &str,
        callback: Arc<dyn ChannelCallback>,
    ) -> Result<(), TransportError> {
        let handle = {
            let mut state = self.shared.state();
            if state.refusing {
                return Err(TransportError::ConnectionRefused {
                    address: address.to_string(),
                });
            }
            if !state.responsive {
                // Accepted, never confirmed.
                return Ok(());
            }

            state.next_handle += 1;
            let handle = ChannelHandle::new(state.next_handle);
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            state.channels.insert(
                handle,
                Channel {
                    inbound_tx,
                    inbound_rx: Arc::new(AsyncMutex::new(inbound_rx)),
                    callback: Arc::clone(&callback),
                },
            );
            handle
        };

        callback.channel_opened(handle);
        Ok(())
    }

    fn request_closing_channel(&self, handle: ChannelHandle) -> Result<(), TransportError> {
        self.shared.remove(handle, None)
    }

    fn request_sending_data(&self, handle: ChannelHandle, message: M) -> Result<(), TransportError> {
        let callback = self
            .shared
            .state()
            .channels
            .get(&handle)
            .map(|channel| Arc::clone(&channel.callback))
            .ok_or(TransportError::UnknownChannel(handle))?;

        self.shared
            .sent_tx
            .send(message)
            .map_err(|_| TransportError::ConnectionLost("device handle dropped".to_string()))?;
        callback.data_sent(handle);
        Ok(())
    }

    fn await_received_data(
        &self,
        handle: ChannelHandle,
        timeout_ms: i64,
    ) -> impl Future<Output = Result<M, TransportError>> + Send {
        let receiver = self
            .shared
            .state()
            .channels
            .get(&handle)
            .map(|channel| Arc::clone(&channel.inbound_rx));

        async move {
            let receiver = receiver.ok_or(TransportError::UnknownChannel(handle))?;
            let mut receiver = receiver.lock().await;

            let next = match Wait::for_pipe(timeout_ms) {
                Wait::Immediate => match receiver.try_recv() {
                    Ok(inbound) => Some(inbound),
                    Err(TryRecvError::Empty) => return Err(TransportError::Timeout(timeout_ms)),
                    Err(TryRecvError::Disconnected) => None,
                },
                Wait::Forever => receiver.recv().await,
                Wait::Within(limit) => tokio::time::timeout(limit, receiver.recv())
                    .await
                    .map_err(|_| TransportError::Timeout(timeout_ms))?,
            };

            next.unwrap_or(Err(TransportError::UnknownChannel(handle)))
        }
    }
}

impl<M> std::fmt::Debug for MemoryTransport<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("channels", &self.shared.state().channels.len())
            .finish()
    }
}

/// Device side of a [`MemoryTransport`].
///
/// Operations without an explicit channel act on the most recently opened one.
#[derive(Clone)]
pub struct MemoryTransportHandle<M> {
    shared: Arc<Shared<M>>,
    sent_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<M>>>,
}

impl<M: Send + 'static> MemoryTransportHandle<M> {
    /// Next message a session sent, waiting at most `timeout`.
    pub async fn next_sent(&self, timeout: Duration) -> Option<M> {
        let mut sent = self.sent_rx.lock().await;
        tokio::time::timeout(timeout, sent.recv()).await.ok().flatten()
    }

    /// Deliver `message` on the latest channel.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnknownChannel` if no channel is open.
    pub fn deliver(&self, message: M) -> Result<(), TransportError> {
        self.push(Ok(message))
    }

    /// Make the pending (or next) receive on the latest channel fail.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnknownChannel` if no channel is open.
    pub fn fail(&self, error: TransportError) -> Result<(), TransportError> {
        self.push(Err(error))
    }

    fn push(&self, inbound: Inbound<M>) -> Result<(), TransportError> {
        let handle = self
            .shared
            .latest()
            .ok_or(TransportError::UnknownChannel(ChannelHandle::new(0)))?;
        let callback = {
            let state = self.shared.state();
            let channel = state
                .channels
                .get(&handle)
                .ok_or(TransportError::UnknownChannel(handle))?;
            channel
                .inbound_tx
                .send(inbound)
                .map_err(|_| TransportError::UnknownChannel(handle))?;
            Arc::clone(&channel.callback)
        };
        callback.data_received(handle);
        Ok(())
    }

    /// Close the latest channel from the device side.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnknownChannel` if no channel is open.
    pub fn close_remotely(&self, cause: Option<TransportError>) -> Result<(), TransportError> {
        let handle = self
            .shared
            .latest()
            .ok_or(TransportError::UnknownChannel(ChannelHandle::new(0)))?;
        self.shared.remove(handle, cause)
    }

    /// While unresponsive, opening requests are accepted but never confirmed.
    pub fn set_responsive(&self, responsive: bool) {
        self.shared.state().responsive = responsive;
    }

    /// While refusing, opening requests fail with `ConnectionRefused`.
    pub fn set_refusing(&self, refusing: bool) {
        self.shared.state().refusing = refusing;
    }

    pub fn open_channels(&self) -> usize {
        self.shared.state().channels.len()
    }
}

impl<M> std::fmt::Debug for MemoryTransportHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransportHandle")
            .field("channels", &self.shared.state().channels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_events::ChannelEvents;

    async fn open(transport: &MemoryTransport<u32>, events: &ChannelEvents) -> ChannelHandle {
        transport
            .request_opening_channel("reader", Arc::new(events.clone()))
            .unwrap();
        events.await_channel_opened(100).await.unwrap().handle
    }

    #[tokio::test]
    async fn test_sent_messages_reach_the_handle() {
        let (transport, device) = MemoryTransport::new();
        let events = ChannelEvents::new();
        let channel = open(&transport, &events).await;

        transport.request_sending_data(channel, 1).unwrap();
        transport.request_sending_data(channel, 2).unwrap();

        assert_eq!(device.next_sent(Duration::from_millis(100)).await, Some(1));
        assert_eq!(device.next_sent(Duration::from_millis(100)).await, Some(2));
    }

    #[tokio::test]
    async fn test_close_fails_pending_receive_with_unknown_channel() {
        let (transport, device) = MemoryTransport::<u32>::new();
        let transport = Arc::new(transport);
        let events = ChannelEvents::new();
        let channel = open(&transport, &events).await;

        let receiver = Arc::clone(&transport);
        let pending =
            tokio::spawn(async move { receiver.await_received_data(channel, -1).await });
        tokio::task::yield_now().await;

        device.close_remotely(Some(TransportError::ConnectionLost("cable".into()))).unwrap();

        assert_eq!(
            pending.await.unwrap(),
            Err(TransportError::UnknownChannel(channel))
        );
        let closed = events.await_channel_closed(100).await.unwrap();
        assert_eq!(closed.cause, Some(TransportError::ConnectionLost("cable".into())));
        assert_eq!(device.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure_is_received() {
        let (transport, device) = MemoryTransport::<u32>::new();
        let events = ChannelEvents::new();
        let channel = open(&transport, &events).await;

        device.fail(TransportError::Codec("bad frame".into())).unwrap();

        assert_eq!(
            transport.await_received_data(channel, 0).await,
            Err(TransportError::Codec("bad frame".into()))
        );
        assert_eq!(
            transport.await_received_data(channel, 0).await,
            Err(TransportError::Timeout(0))
        );
    }

    #[tokio::test]
    async fn test_refusing_and_unresponsive() {
        let (transport, device) = MemoryTransport::<u32>::new();
        let events = ChannelEvents::new();

        device.set_refusing(true);
        assert!(matches!(
            transport.request_opening_channel("reader", Arc::new(events.clone())),
            Err(TransportError::ConnectionRefused { .. })
        ));

        device.set_refusing(false);
        device.set_responsive(false);
        transport
            .request_opening_channel("reader", Arc::new(events.clone()))
            .unwrap();
        assert!(events.await_channel_opened(0).await.is_err());
        assert_eq!(device.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_rejected() {
        let (transport, _device) = MemoryTransport::<u32>::new();
        let ghost = ChannelHandle::new(42);

        assert_eq!(
            transport.request_sending_data(ghost, 1),
            Err(TransportError::UnknownChannel(ghost))
        );
        assert_eq!(
            transport.request_closing_channel(ghost),
            Err(TransportError::UnknownChannel(ghost))
        );
        assert_eq!(
            transport.await_received_data(ghost, -1).await,
            Err(TransportError::UnknownChannel(ghost))
        );
    }
}
