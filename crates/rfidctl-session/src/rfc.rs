//! RF controller session: capabilities and antenna configuration.

use std::fmt;

use rfidctl_core::constants::DEFAULT_PRIORITY;
use rfidctl_core::{Error, Result};
use rfidctl_sync::QueueEvent;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::handler::{Inbound, PendingRequest, RequestId, SessionHandler, SessionProtocol};
use crate::transport::Transport;

/// Priority of antenna connection changes; above responses.
pub const CONNECTION_CHANGE_PRIORITY: i32 = DEFAULT_PRIORITY + 1;

/// Antenna port. Id 0 addresses every antenna and never appears in a
/// configuration reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AntennaId(pub u16);

impl AntennaId {
    pub const ALL: Self = Self(0);

    pub fn is_all(&self) -> bool {
        *self == Self::ALL
    }
}

impl fmt::Display for AntennaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all() {
            write!(f, "all antennas")
        } else {
            write!(f, "antenna {}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityType {
    General,
    Regulatory,
    Antenna,
    AirProtocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub kind: CapabilityType,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntennaConfiguration {
    pub antenna: AntennaId,
    /// Transmit power in hundredths of a dBm.
    pub transmit_power: u16,
    pub channel_index: u16,
    pub receive_sensitivity: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RfcRequest {
    /// Empty list means every type.
    GetCapabilities(Vec<CapabilityType>),
    GetAntennaConfiguration(AntennaId),
    SetAntennaConfiguration(AntennaConfiguration),
    ResetConfiguration,
}

/// Decoded message on an RF controller channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RfcMessage {
    Request {
        id: RequestId,
        request: RfcRequest,
    },
    Capabilities {
        id: RequestId,
        capabilities: Vec<Capability>,
    },
    AntennaConfigurations {
        id: RequestId,
        configurations: Vec<AntennaConfiguration>,
    },
    Acknowledged {
        id: RequestId,
    },
    Rejected {
        id: RequestId,
        reason: String,
    },
    AntennaConnection {
        antenna: AntennaId,
        connected: bool,
    },
    KeepAlive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RfcEvent {
    Capabilities {
        request: RequestId,
        capabilities: Vec<Capability>,
    },
    AntennaConfigurations {
        request: RequestId,
        configurations: Vec<AntennaConfiguration>,
    },
    Acknowledged {
        request: RequestId,
    },
    Rejected {
        request: RequestId,
        reason: String,
    },
    AntennaConnection {
        antenna: AntennaId,
        connected: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RfcEventKind {
    Capabilities,
    AntennaConfigurations,
    Acknowledged,
    Rejected,
    AntennaConnection,
}

impl QueueEvent for RfcEvent {
    type Kind = RfcEventKind;

    fn kind(&self) -> RfcEventKind {
        match self {
            Self::Capabilities { .. } => RfcEventKind::Capabilities,
            Self::AntennaConfigurations { .. } => RfcEventKind::AntennaConfigurations,
            Self::Acknowledged { .. } => RfcEventKind::Acknowledged,
            Self::Rejected { .. } => RfcEventKind::Rejected,
            Self::AntennaConnection { .. } => RfcEventKind::AntennaConnection,
        }
    }
}

fn filter_capabilities(capabilities: Vec<Capability>, requested: &[CapabilityType]) -> Vec<Capability> {
    if requested.is_empty() {
        return capabilities;
    }
    capabilities
        .into_iter()
        .filter(|capability| {
            let keep = requested.contains(&capability.kind);
            if !keep {
                trace!(capability = %capability.name, "Dropping unrequested capability");
            }
            keep
        })
        .collect()
}

fn filter_configurations(
    configurations: Vec<AntennaConfiguration>,
    requested: AntennaId,
) -> Result<Vec<AntennaConfiguration>> {
    let mut kept = Vec::with_capacity(configurations.len());
    for configuration in configurations {
        if configuration.antenna.is_all() {
            return Err(Error::protocol(
                "antenna configuration reported for reserved antenna id 0",
            ));
        }
        if requested.is_all() || configuration.antenna == requested {
            kept.push(configuration);
        } else {
            trace!(antenna = %configuration.antenna, "Dropping configuration of another antenna");
        }
    }
    Ok(kept)
}

/// Correlation and filtering rules of the RF controller session.
#[derive(Debug, Clone, Copy, Default)]
pub struct RfcProtocol;

impl SessionProtocol for RfcProtocol {
    type Request = RfcRequest;
    type Message = RfcMessage;
    type Event = RfcEvent;

    fn request_message(&self, pending: &PendingRequest<RfcRequest>) -> RfcMessage {
        RfcMessage::Request {
            id: pending.id,
            request: pending.request.clone(),
        }
    }

    fn classify(&self, message: &RfcMessage) -> Inbound {
        match message {
            RfcMessage::Capabilities { id, .. }
            | RfcMessage::AntennaConfigurations { id, .. }
            | RfcMessage::Acknowledged { id }
            | RfcMessage::Rejected { id, .. } => Inbound::Response(*id),
            RfcMessage::Request { .. } | RfcMessage::AntennaConnection { .. } | RfcMessage::KeepAlive => {
                Inbound::Unsolicited
            }
        }
    }

    fn process_response(
        &self,
        pending: &PendingRequest<RfcRequest>,
        message: RfcMessage,
    ) -> Result<Option<RfcEvent>> {
        let request = pending.id;
        let event = match (&pending.request, message) {
            (RfcRequest::GetCapabilities(types), RfcMessage::Capabilities { capabilities, .. }) => {
                RfcEvent::Capabilities {
                    request,
                    capabilities: filter_capabilities(capabilities, types),
                }
            }
            (
                RfcRequest::GetAntennaConfiguration(antenna),
                RfcMessage::AntennaConfigurations { configurations, .. },
            ) => RfcEvent::AntennaConfigurations {
                request,
                configurations: filter_configurations(configurations, *antenna)?,
            },
            (
                RfcRequest::SetAntennaConfiguration(_) | RfcRequest::ResetConfiguration,
                RfcMessage::Acknowledged { .. },
            ) => RfcEvent::Acknowledged { request },
            (_, RfcMessage::Rejected { reason, .. }) => RfcEvent::Rejected { request, reason },
            (request, message) => {
                return Err(Error::protocol(format!(
                    "{message:?} does not answer {request:?}"
                )));
            }
        };
        Ok(Some(event))
    }

    fn process_unsolicited(&self, message: RfcMessage) -> Result<Option<RfcEvent>> {
        match message {
            RfcMessage::AntennaConnection { antenna, connected } => {
                Ok(Some(RfcEvent::AntennaConnection { antenna, connected }))
            }
            RfcMessage::KeepAlive => Ok(None),
            other => Err(Error::protocol(format!("unexpected message from device: {other:?}"))),
        }
    }

    fn priority(&self, event: &RfcEvent) -> i32 {
        match event {
            RfcEvent::AntennaConnection { .. } => CONNECTION_CHANGE_PRIORITY,
            _ => DEFAULT_PRIORITY,
        }
    }
}

/// Session with an RF controller.
pub type RfcSession<T> = SessionHandler<RfcProtocol, T>;

impl<T> SessionHandler<RfcProtocol, T>
where
    T: Transport<Message = RfcMessage>,
{
    /// Ask for the capabilities of the given types (all when empty).
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the session is closed or failed.
    pub fn request_capabilities(&self, types: Vec<CapabilityType>) -> Result<RequestId> {
        self.request(RfcRequest::GetCapabilities(types))
    }

    /// Ask for the configuration of one antenna, or of all with [`AntennaId::ALL`].
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the session is closed or failed.
    pub fn request_antenna_configuration(&self, antenna: AntennaId) -> Result<RequestId> {
        self.request(RfcRequest::GetAntennaConfiguration(antenna))
    }

    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the session is closed or failed.
    pub fn request_set_antenna_configuration(
        &self,
        configuration: AntennaConfiguration,
    ) -> Result<RequestId> {
        self.request(RfcRequest::SetAntennaConfiguration(configuration))
    }

    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the session is closed or failed.
    pub fn request_reset_configuration(&self) -> Result<RequestId> {
        self.request(RfcRequest::ResetConfiguration)
    }
}
