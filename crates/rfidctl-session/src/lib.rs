//! Device sessions for the RFID reader controller.
//!
//! A session owns one transport channel to a device (GPIO board, RF
//! controller), serializes requests to it and republishes responses and
//! device events on an [`EventQueue`](rfidctl_sync::EventQueue).
//!
//! * [`transport`] - what a session needs from the layer below
//! * [`SessionHandler`] - generic request/response session
//! * [`gpio`], [`rfc`] - concrete protocols
//! * [`mock`] - in-memory transport (feature `mock`)

pub mod channel_events;
pub mod gpio;
pub mod handler;
pub mod info;
pub mod lifecycle;
#[cfg(feature = "mock")]
pub mod mock;
pub mod rfc;
pub mod transport;

pub use channel_events::{ChannelClosed, ChannelEvents, ChannelOpened};
pub use handler::{
    Inbound, PendingRequest, RequestId, SessionHandler, SessionListener, SessionProtocol,
};
pub use info::SessionInfo;
pub use lifecycle::SessionState;
pub use transport::{ChannelCallback, Transport};
