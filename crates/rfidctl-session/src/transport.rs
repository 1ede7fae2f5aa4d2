//! Contract between a session handler and the transport layer beneath it.
//!
//! The transport owns the actual connection (socket, serial line, ...) and
//! its wire format. A session only ever sees opaque channel handles and
//! already-decoded messages.

use std::future::Future;
use std::sync::Arc;

use rfidctl_core::{ChannelHandle, TransportError};

/// Channel lifecycle notifications delivered by a transport.
///
/// Implementations are called from whatever task the transport runs on and
/// must not block.
pub trait ChannelCallback: Send + Sync {
    /// A channel requested through `request_opening_channel` is ready.
    fn channel_opened(&self, handle: ChannelHandle);

    /// A channel went away. `cause` is `None` for a requested close.
    fn channel_closed(&self, handle: ChannelHandle, cause: Option<TransportError>);

    /// A message was written to the channel.
    fn data_sent(&self, handle: ChannelHandle);

    /// A message was read from the channel and is ready to be received.
    fn data_received(&self, handle: ChannelHandle);
}

/// Transport collaborator of a session handler.
///
/// Opening and closing are requests: their completion is reported through
/// the [`ChannelCallback`] passed when opening.
pub trait Transport: Send + Sync + 'static {
    /// Decoded message exchanged over a channel.
    type Message: Send + 'static;

    /// Ask for a channel to `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot even be issued, e.g.
    /// `TransportError::ConnectionRefused`.
    fn request_opening_channel(
        &self,
        address: &str,
        callback: Arc<dyn ChannelCallback>,
    ) -> Result<(), TransportError>;

    /// Ask for `handle` to be closed.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnknownChannel` if the channel is already gone.
    fn request_closing_channel(&self, handle: ChannelHandle) -> Result<(), TransportError>;

    /// Queue `message` for sending on `handle`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::UnknownChannel` if the channel is gone.
    fn request_sending_data(
        &self,
        handle: ChannelHandle,
        message: Self::Message,
    ) -> Result<(), TransportError>;

    /// Receive the next message on `handle`.
    ///
    /// `timeout_ms` follows the pipe convention: negative waits forever,
    /// zero only returns an already buffered message.
    ///
    /// A channel that closes while a receive is pending completes it with
    /// `TransportError::UnknownChannel`.
    fn await_received_data(
        &self,
        handle: ChannelHandle,
        timeout_ms: i64,
    ) -> impl Future<Output = Result<Self::Message, TransportError>> + Send;
}
