//! Monitoring snapshot of a session.

use chrono::{DateTime, Utc};
use rfidctl_core::ChannelHandle;
use serde::Serialize;

use crate::handler::RequestId;
use crate::lifecycle::SessionState;

/// Session information snapshot
///
/// Provides read-only access to session metadata for monitoring
/// and debugging purposes.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Address the channel was opened to
    pub address: String,

    /// Lifecycle state when the snapshot was taken
    pub state: SessionState,

    /// Open channel, if any
    pub channel: Option<ChannelHandle>,

    /// When the channel was opened
    pub opened_at: Option<DateTime<Utc>>,

    /// Requests waiting behind the one in flight
    pub pending: usize,

    /// Request currently in flight
    pub executing: Option<RequestId>,
}

impl SessionInfo {
    /// How long the channel has been open; `None` if it never opened.
    pub fn uptime(&self) -> Option<chrono::Duration> {
        self.opened_at.map(|opened_at| Utc::now() - opened_at)
    }
}
