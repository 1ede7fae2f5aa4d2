//! Shared building blocks for the RFID reader controller.
//!
//! Every other crate in the workspace depends on this one for the error
//! taxonomy, the timeout conventions and the configuration structs.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use config::{ControllerConfig, FsmConfig, SessionConfig};
pub use error::{ActionPhase, BoxError, Error, Result, TransportError};
pub use types::{ChannelHandle, Wait};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
