//! GPIO session: pin configuration and pin state of a reader's I/O board.
//!
//! Pins are either inputs (GPI) or outputs (GPO). Queries name a
//! [`PinScope`] per direction, and responses are trimmed to that scope
//! before they are published:
//!
//! * a pin of a requested direction outside that direction's scope is
//!   dropped;
//! * a pin of a direction that was not requested at all is dropped, unless
//!   its id is explicitly listed for the other direction. That means the
//!   board mixed the two pin banks up, and the session ends with a protocol
//!   violation.

use std::collections::BTreeSet;
use std::fmt;

use rfidctl_core::constants::DEFAULT_PRIORITY;
use rfidctl_core::{Error, Result};
use rfidctl_sync::QueueEvent;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::handler::{Inbound, PendingRequest, RequestId, SessionHandler, SessionProtocol};
use crate::transport::Transport;

/// Priority of pin state changes; above responses.
pub const STATE_CHANGE_PRIORITY: i32 = DEFAULT_PRIORITY + 1;

/// Pin number on the I/O board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PinId(pub u16);

impl From<u16> for PinId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pin {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinDirection {
    /// General purpose input (GPI).
    Input,
    /// General purpose output (GPO).
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinLevel {
    Low,
    High,
}

/// Pins of one direction a query asks about.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinScope {
    /// Direction not queried.
    #[default]
    None,
    /// Every pin of the direction.
    All,
    /// Only the listed pins.
    Only(BTreeSet<PinId>),
}

impl PinScope {
    pub fn only(ids: impl IntoIterator<Item = impl Into<PinId>>) -> Self {
        Self::Only(ids.into_iter().map(Into::into).collect())
    }

    pub fn is_requested(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn contains(&self, id: PinId) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Only(ids) => ids.contains(&id),
        }
    }

    /// Whether `id` is named explicitly (not just covered by `All`).
    pub fn lists(&self, id: PinId) -> bool {
        matches!(self, Self::Only(ids) if ids.contains(&id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinConfiguration {
    pub id: PinId,
    pub direction: PinDirection,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinState {
    pub id: PinId,
    pub direction: PinDirection,
    pub level: PinLevel,
}

trait DirectedPin {
    fn id(&self) -> PinId;
    fn direction(&self) -> PinDirection;
}

impl DirectedPin for PinConfiguration {
    fn id(&self) -> PinId {
        self.id
    }

    fn direction(&self) -> PinDirection {
        self.direction
    }
}

impl DirectedPin for PinState {
    fn id(&self) -> PinId {
        self.id
    }

    fn direction(&self) -> PinDirection {
        self.direction
    }
}

/// Keep the pins a `gpi`/`gpo` query asked for.
fn filter_pins<P: DirectedPin>(pins: Vec<P>, gpi: &PinScope, gpo: &PinScope) -> Result<Vec<P>> {
    let mut kept = Vec::with_capacity(pins.len());
    for pin in pins {
        let (own, other) = match pin.direction() {
            PinDirection::Input => (gpi, gpo),
            PinDirection::Output => (gpo, gpi),
        };

        if own.is_requested() {
            if own.contains(pin.id()) {
                kept.push(pin);
            } else {
                trace!(pin = %pin.id(), "Dropping pin outside the requested scope");
            }
        } else if other.lists(pin.id()) {
            return Err(Error::protocol(format!(
                "{} reported as {:?}, but only requested as the other direction",
                pin.id(),
                pin.direction()
            )));
        } else {
            trace!(pin = %pin.id(), "Dropping pin of an unrequested direction");
        }
    }
    Ok(kept)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpioRequest {
    GetConfiguration { gpi: PinScope, gpo: PinScope },
    SetConfiguration(Vec<PinConfiguration>),
    ResetConfiguration,
    GetState { gpi: PinScope, gpo: PinScope },
    SetState(Vec<PinState>),
}

impl GpioRequest {
    fn name(&self) -> &'static str {
        match self {
            Self::GetConfiguration { .. } => "get configuration",
            Self::SetConfiguration(_) => "set configuration",
            Self::ResetConfiguration => "reset configuration",
            Self::GetState { .. } => "get state",
            Self::SetState(_) => "set state",
        }
    }
}

/// Decoded message on a GPIO channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpioMessage {
    /// Outbound request.
    Request { id: RequestId, request: GpioRequest },
    Configuration { id: RequestId, pins: Vec<PinConfiguration> },
    State { id: RequestId, pins: Vec<PinState> },
    Acknowledged { id: RequestId },
    Rejected { id: RequestId, reason: String },
    /// A pin changed level on its own.
    StateChanged(PinState),
    KeepAlive,
}

/// What a GPIO session publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpioEvent {
    Configuration { request: RequestId, pins: Vec<PinConfiguration> },
    State { request: RequestId, pins: Vec<PinState> },
    Acknowledged { request: RequestId },
    Rejected { request: RequestId, reason: String },
    StateChanged(PinState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpioEventKind {
    Configuration,
    State,
    Acknowledged,
    Rejected,
    StateChanged,
}

impl QueueEvent for GpioEvent {
    type Kind = GpioEventKind;

    fn kind(&self) -> GpioEventKind {
        match self {
            Self::Configuration { .. } => GpioEventKind::Configuration,
            Self::State { .. } => GpioEventKind::State,
            Self::Acknowledged { .. } => GpioEventKind::Acknowledged,
            Self::Rejected { .. } => GpioEventKind::Rejected,
            Self::StateChanged(_) => GpioEventKind::StateChanged,
        }
    }
}

/// Correlation and filtering rules of the GPIO session.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpioProtocol;

impl SessionProtocol for GpioProtocol {
    type Request = GpioRequest;
    type Message = GpioMessage;
    type Event = GpioEvent;

    fn request_message(&self, pending: &PendingRequest<GpioRequest>) -> GpioMessage {
        GpioMessage::Request {
            id: pending.id,
            request: pending.request.clone(),
        }
    }

    fn classify(&self, message: &GpioMessage) -> Inbound {
        match message {
            GpioMessage::Configuration { id, .. }
            | GpioMessage::State { id, .. }
            | GpioMessage::Acknowledged { id }
            | GpioMessage::Rejected { id, .. } => Inbound::Response(*id),
            GpioMessage::Request { .. } | GpioMessage::StateChanged(_) | GpioMessage::KeepAlive => {
                Inbound::Unsolicited
            }
        }
    }

    fn process_response(
        &self,
        pending: &PendingRequest<GpioRequest>,
        message: GpioMessage,
    ) -> Result<Option<GpioEvent>> {
        let request = pending.id;
        let event = match (&pending.request, message) {
            (GpioRequest::GetConfiguration { gpi, gpo }, GpioMessage::Configuration { pins, .. }) => {
                GpioEvent::Configuration {
                    request,
                    pins: filter_pins(pins, gpi, gpo)?,
                }
            }
            (GpioRequest::GetState { gpi, gpo }, GpioMessage::State { pins, .. }) => GpioEvent::State {
                request,
                pins: filter_pins(pins, gpi, gpo)?,
            },
            (
                GpioRequest::SetConfiguration(_)
                | GpioRequest::ResetConfiguration
                | GpioRequest::SetState(_),
                GpioMessage::Acknowledged { .. },
            ) => GpioEvent::Acknowledged { request },
            (_, GpioMessage::Rejected { reason, .. }) => GpioEvent::Rejected { request, reason },
            (request, message) => {
                return Err(Error::protocol(format!(
                    "{message:?} does not answer a {} request",
                    request.name()
                )));
            }
        };
        Ok(Some(event))
    }

    fn process_unsolicited(&self, message: GpioMessage) -> Result<Option<GpioEvent>> {
        match message {
            GpioMessage::StateChanged(state) => Ok(Some(GpioEvent::StateChanged(state))),
            GpioMessage::KeepAlive => Ok(None),
            other => Err(Error::protocol(format!("unexpected message from device: {other:?}"))),
        }
    }

    fn priority(&self, event: &GpioEvent) -> i32 {
        match event {
            GpioEvent::StateChanged(_) => STATE_CHANGE_PRIORITY,
            _ => DEFAULT_PRIORITY,
        }
    }
}

/// Session with a GPIO board.
pub type GpioSession<T> = SessionHandler<GpioProtocol, T>;

impl<T> SessionHandler<GpioProtocol, T>
where
    T: Transport<Message = GpioMessage>,
{
    /// Ask for the configuration of the pins in `gpi` and `gpo`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the session is closed or failed.
    pub fn request_pin_configuration(&self, gpi: PinScope, gpo: PinScope) -> Result<RequestId> {
        self.request(GpioRequest::GetConfiguration { gpi, gpo })
    }

    /// Reconfigure the listed pins.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the session is closed or failed.
    pub fn request_set_pin_configuration(&self, pins: Vec<PinConfiguration>) -> Result<RequestId> {
        self.request(GpioRequest::SetConfiguration(pins))
    }

    /// Restore the board's factory pin configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the session is closed or failed.
    pub fn request_reset_pin_configuration(&self) -> Result<RequestId> {
        self.request(GpioRequest::ResetConfiguration)
    }

    /// Ask for the level of the pins in `gpi` and `gpo`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the session is closed or failed.
    pub fn request_pin_state(&self, gpi: PinScope, gpo: PinScope) -> Result<RequestId> {
        self.request(GpioRequest::GetState { gpi, gpo })
    }

    /// Drive the listed output pins.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the session is closed or failed.
    pub fn request_set_pin_state(&self, pins: Vec<PinState>) -> Result<RequestId> {
        self.request(GpioRequest::SetState(pins))
    }
}
