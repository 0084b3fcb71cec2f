//! Shared value objects used across the relay engine

use super::error::RelayError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Allocation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationId(Uuid);

impl AllocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AllocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport protocol of a control connection or a relayed transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    /// IANA protocol number carried in REQUESTED-TRANSPORT
    pub fn protocol_number(self) -> u8 {
        match self {
            TransportProtocol::Udp => 17,
            TransportProtocol::Tcp => 6,
        }
    }

    pub fn from_protocol_number(value: u8) -> Option<Self> {
        match value {
            17 => Some(TransportProtocol::Udp),
            6 => Some(TransportProtocol::Tcp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-facing 5-tuple: client address, server address and protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub protocol: TransportProtocol,
}

impl FiveTuple {
    pub fn new(client: SocketAddr, server: SocketAddr, protocol: TransportProtocol) -> Self {
        Self {
            client,
            server,
            protocol,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.protocol, self.client, self.server)
    }
}

/// Channel number in the range reserved for channel bindings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelNumber(u16);

impl ChannelNumber {
    pub const MIN: u16 = 0x4000;
    pub const MAX: u16 = 0x7FFF;

    pub fn new(value: u16) -> Result<Self, RelayError> {
        if Self::is_valid(value) {
            Ok(Self(value))
        } else {
            Err(RelayError::BadRequest(format!(
                "channel number {:#06x} outside {:#06x}-{:#06x}",
                value,
                Self::MIN,
                Self::MAX
            )))
        }
    }

    pub fn is_valid(value: u16) -> bool {
        (Self::MIN..=Self::MAX).contains(&value)
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Identifier of a pending relayed TCP connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u32);

impl ConnectionId {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
