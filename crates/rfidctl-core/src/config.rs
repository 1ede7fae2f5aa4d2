//! Configuration consumed by the controller.
//!
//! The controller does not own a file format. These structs derive serde so
//! the embedding application can load them from whatever source it uses.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{DEFAULT_MAX_HISTORY_SIZE, DEFAULT_SESSION_TIMEOUT_MS};
use crate::error::{Error, Result};

/// Configuration for one device session.
///
/// # Example
///
/// ```
/// use rfidctl_core::SessionConfig;
/// use std::time::Duration;
///
/// let config = SessionConfig {
///     address: "192.168.0.20:5010".to_string(),
///     timeout_ms: 5000,
/// };
/// assert_eq!(config.timeout(), Duration::from_millis(5000));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Address handed to the transport when opening the channel.
    pub address: String,

    /// Bound for `open()` and for `close()`, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:5010".to_string(),
            timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
        }
    }
}

impl SessionConfig {
    pub fn new(address: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            address: address.into(),
            timeout_ms,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Timeout in the signed form used by the rendezvous primitives.
    pub fn timeout_millis(&self) -> i64 {
        i64::try_from(self.timeout_ms).unwrap_or(i64::MAX)
    }

    /// # Errors
    ///
    /// Returns `Error::Config` if the address is blank or the timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::Config("session address must not be empty".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config(
                "session timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration shared by state machine instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsmConfig {
    /// Maximum number of traversed connections to keep; 0 disables history.
    pub max_history_size: usize,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self {
            max_history_size: DEFAULT_MAX_HISTORY_SIZE,
        }
    }
}

/// Top-level controller configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// GPIO controller session.
    pub gpio: SessionConfig,

    /// RF front-end controller session.
    pub rfc: SessionConfig,

    /// State machine defaults.
    pub fsm: FsmConfig,
}

impl ControllerConfig {
    /// Validate every session section.
    pub fn validate(&self) -> Result<()> {
        self.gpio.validate()?;
        self.rfc.validate()?;
        Ok(())
    }
}
