//! In-memory transport for testing and development.
//!
//! This module provides a transport that can be driven programmatically,
//! playing the device side of a session without any real connection.

pub mod transport;

pub use transport::{MemoryTransport, MemoryTransportHandle};
