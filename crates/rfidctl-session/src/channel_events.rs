//! Bridges transport callbacks into awaitable channel notifications.

use rfidctl_core::{ChannelHandle, Error, Result, TransportError};
use rfidctl_sync::EventPipes;
use tracing::{debug, trace};

use crate::transport::ChannelCallback;

/// A channel became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpened {
    pub handle: ChannelHandle,
}

/// A channel went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelClosed {
    pub handle: ChannelHandle,

    /// `None` when the close was requested.
    pub cause: Option<TransportError>,
}

/// [`ChannelCallback`] that fires opened/closed notifications into
/// [`EventPipes`], one pipe per notification type.
///
/// Data notifications are only traced; they are not buffered.
#[derive(Debug, Clone, Default)]
pub struct ChannelEvents {
    pipes: EventPipes,
}

impl ChannelEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `pipes`, typically sharing a lock with other session pipes.
    pub fn with_pipes(pipes: EventPipes) -> Self {
        Self { pipes }
    }

    /// Wait for the next opened notification.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if none arrives within `timeout_ms`.
    pub async fn await_channel_opened(&self, timeout_ms: i64) -> Result<ChannelOpened> {
        let events = self.pipes.await_events::<ChannelOpened>(timeout_ms).await?;
        events
            .into_iter()
            .next()
            .ok_or_else(|| Error::timeout(timeout_ms))
    }

    /// Wait for the next closed notification.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if none arrives within `timeout_ms`.
    pub async fn await_channel_closed(&self, timeout_ms: i64) -> Result<ChannelClosed> {
        let events = self.pipes.await_events::<ChannelClosed>(timeout_ms).await?;
        events
            .into_iter()
            .next()
            .ok_or_else(|| Error::timeout(timeout_ms))
    }

    /// Drop notifications left over from an earlier channel.
    pub async fn discard_pending(&self) {
        let opened = self
            .pipes
            .await_events::<ChannelOpened>(0)
            .await
            .unwrap_or_default();
        let closed = self
            .pipes
            .await_events::<ChannelClosed>(0)
            .await
            .unwrap_or_default();
        if !opened.is_empty() || !closed.is_empty() {
            debug!(
                opened = opened.len(),
                closed = closed.len(),
                "Discarded stale channel notifications"
            );
        }
    }
}

impl ChannelCallback for ChannelEvents {
    fn channel_opened(&self, handle: ChannelHandle) {
        debug!(channel = %handle, "Channel opened");
        self.pipes.fire(ChannelOpened { handle });
    }

    fn channel_closed(&self, handle: ChannelHandle, cause: Option<TransportError>) {
        debug!(channel = %handle, cause = ?cause, "Channel closed");
        self.pipes.fire(ChannelClosed { handle, cause });
    }

    fn data_sent(&self, handle: ChannelHandle) {
        trace!(channel = %handle, "Data sent");
    }

    fn data_received(&self, handle: ChannelHandle) {
        trace!(channel = %handle, "Data received");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_opened_notification_is_awaitable() {
        let events = ChannelEvents::new();
        events.channel_opened(ChannelHandle::new(7));

        let opened = events.await_channel_opened(100).await.unwrap();
        assert_eq!(opened.handle, ChannelHandle::new(7));
    }

    #[tokio::test]
    async fn test_closed_notification_carries_cause() {
        let events = ChannelEvents::new();
        let cause = TransportError::ConnectionLost("reset by peer".to_string());
        events.channel_closed(ChannelHandle::new(1), Some(cause.clone()));

        let closed = events.await_channel_closed(100).await.unwrap();
        assert_eq!(closed.cause, Some(cause));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_notification_times_out() {
        let events = ChannelEvents::new();

        let err = events.await_channel_opened(50).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("50"));
    }

    #[tokio::test]
    async fn test_discard_pending_drops_stale_notifications() {
        let events = ChannelEvents::new();
        events.channel_opened(ChannelHandle::new(1));
        events.channel_closed(ChannelHandle::new(1), None);
        events.data_sent(ChannelHandle::new(1));

        events.discard_pending().await;

        assert!(events.await_channel_opened(0).await.is_err());
        assert!(events.await_channel_closed(0).await.is_err());
    }
}
