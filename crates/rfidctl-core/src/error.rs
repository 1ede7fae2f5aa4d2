//! Error taxonomy shared by the synchronization primitives, the state machine
//! engine and the session handlers.

use std::fmt;

use thiserror::Error;

use crate::types::ChannelHandle;

/// Boxed error raised by user-supplied guards and actions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Phase of a transition in which an action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionPhase {
    /// Entry action of the destination state.
    Entry,

    /// Exit action of the source state.
    Exit,

    /// Action attached to the transition itself.
    Transition,
}

impl fmt::Display for ActionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entry => write!(f, "entry"),
            Self::Exit => write!(f, "exit"),
            Self::Transition => write!(f, "transition"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// A bounded wait exceeded its deadline.
    #[error("Operation timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: i64 },

    /// A transition guard raised instead of returning a verdict.
    #[error("Guard evaluation failed for transition {transition}: {source}")]
    GuardEvaluation {
        transition: String,
        #[source]
        source: BoxError,
    },

    /// An entry, exit or transition action raised after the guards passed.
    #[error("Action execution failed in {phase} action of {subject}: {source}")]
    ActionExecution {
        phase: ActionPhase,
        subject: String,
        #[source]
        source: BoxError,
    },

    /// A state machine could not be built.
    #[error("Construction failed: {0}")]
    Construction(String),

    /// A response could not be correlated with the request in flight.
    #[error("Session protocol violation: {0}")]
    SessionProtocol(String),

    /// Failure reported by the transport collaborator.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Operation not allowed in the current lifecycle state.
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new timeout error.
    pub fn timeout(timeout_ms: i64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a new session protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::SessionProtocol(message.into())
    }

    /// Create a new construction error.
    pub fn construction(message: impl Into<String>) -> Self {
        Self::Construction(message.into())
    }

    /// Create a new invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Check whether this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors surfaced by a transport collaborator.
///
/// The core treats these as opaque, except for [`TransportError::UnknownChannel`],
/// which the session run loop reads as an implicit close.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel handle is not (or no longer) known to the transport.
    #[error("Unknown channel: {0}")]
    UnknownChannel(ChannelHandle),

    /// The remote end refused the connection.
    #[error("Connection refused: {address}")]
    ConnectionRefused { address: String },

    /// A bounded receive exceeded its deadline.
    #[error("Receive timeout after {0}ms")]
    Timeout(i64),

    /// Connection was lost during operation.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Message could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),
}
