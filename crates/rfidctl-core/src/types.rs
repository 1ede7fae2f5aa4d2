//! Channel handles and timeout interpretation shared across crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifier of a transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelHandle(u64);

impl ChannelHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How long a blocking operation may wait.
///
/// The controller inherits two conventions for a zero timeout. Event pipes
/// and transports read `0` as "do not block"; the event queue reads it as
/// "block forever". Callers of either API depend on the difference, so each
/// API converts its raw millisecond value through its own constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Block until something arrives.
    Forever,

    /// Return at once with whatever is available.
    Immediate,

    /// Block for at most the given duration.
    Within(Duration),
}

impl Wait {
    /// Convention used by event pipes and transports: negative waits
    /// forever, zero returns immediately, positive is a deadline.
    ///
    /// # Examples
    ///
    /// ```
    /// use rfidctl_core::Wait;
    /// use std::time::Duration;
    ///
    /// assert_eq!(Wait::for_pipe(0), Wait::Immediate);
    /// assert_eq!(Wait::for_pipe(15), Wait::Within(Duration::from_millis(15)));
    /// ```
    pub fn for_pipe(timeout_ms: i64) -> Self {
        match timeout_ms {
            ms if ms < 0 => Self::Forever,
            0 => Self::Immediate,
            ms => Self::Within(Duration::from_millis(ms.unsigned_abs())),
        }
    }

    /// Convention used by the event queue: zero or negative waits forever.
    ///
    /// # Examples
    ///
    /// ```
    /// use rfidctl_core::Wait;
    ///
    /// assert_eq!(Wait::for_queue(0), Wait::Forever);
    /// ```
    pub fn for_queue(timeout_ms: i64) -> Self {
        match timeout_ms {
            ms if ms <= 0 => Self::Forever,
            ms => Self::Within(Duration::from_millis(ms.unsigned_abs())),
        }
    }

    /// Deadline duration, if bounded.
    pub fn limit(&self) -> Option<Duration> {
        match self {
            Self::Within(duration) => Some(*duration),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(-1, Wait::Forever)]
    #[case(-500, Wait::Forever)]
    #[case(0, Wait::Immediate)]
    #[case(20, Wait::Within(Duration::from_millis(20)))]
    fn test_pipe_convention(#[case] timeout_ms: i64, #[case] expected: Wait) {
        assert_eq!(Wait::for_pipe(timeout_ms), expected);
    }

    #[rstest]
    #[case(-1, Wait::Forever)]
    #[case(0, Wait::Forever)]
    #[case(20, Wait::Within(Duration::from_millis(20)))]
    fn test_queue_convention(#[case] timeout_ms: i64, #[case] expected: Wait) {
        assert_eq!(Wait::for_queue(timeout_ms), expected);
    }

    #[test]
    fn test_limit() {
        assert_eq!(Wait::Forever.limit(), None);
        assert_eq!(Wait::Immediate.limit(), None);
        assert_eq!(
            Wait::Within(Duration::from_millis(3)).limit(),
            Some(Duration::from_millis(3))
        );
    }

    #[test]
    fn test_channel_handle_display() {
        assert_eq!(ChannelHandle::new(42).to_string(), "#42");
        assert_eq!(ChannelHandle::new(42).as_u64(), 42);
    }
}
