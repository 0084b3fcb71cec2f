//! Decoded TURN requests and the outcomes the handler produces for them

use super::transport::ClientSink;
use crate::domain::shared::{AllocationId, ChannelNumber, ConnectionId, FiveTuple};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;

/// A request, indication or ChannelData frame, after decoding and authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnRequest {
    Binding,
    Allocate {
        /// IANA protocol number from REQUESTED-TRANSPORT
        requested_transport: u8,
        lifetime: Option<Duration>,
    },
    Refresh {
        lifetime: Option<Duration>,
    },
    CreatePermission {
        peers: Vec<SocketAddr>,
    },
    ChannelBind {
        channel: ChannelNumber,
        peer: SocketAddr,
    },
    Send {
        peer: SocketAddr,
        data: Bytes,
    },
    ChannelData {
        channel: ChannelNumber,
        data: Bytes,
    },
    Connect {
        peer: SocketAddr,
    },
    ConnectionBind {
        connection_id: ConnectionId,
    },
}

impl TurnRequest {
    pub fn name(&self) -> &'static str {
        match self {
            TurnRequest::Binding => "Binding",
            TurnRequest::Allocate { .. } => "Allocate",
            TurnRequest::Refresh { .. } => "Refresh",
            TurnRequest::CreatePermission { .. } => "CreatePermission",
            TurnRequest::ChannelBind { .. } => "ChannelBind",
            TurnRequest::Send { .. } => "Send",
            TurnRequest::ChannelData { .. } => "ChannelData",
            TurnRequest::Connect { .. } => "Connect",
            TurnRequest::ConnectionBind { .. } => "ConnectionBind",
        }
    }

    /// Indications and ChannelData never get a reply
    pub fn expects_reply(&self) -> bool {
        !matches!(self, TurnRequest::Send { .. } | TurnRequest::ChannelData { .. })
    }
}

/// A client data connection spliced to a relayed peer connection
#[derive(Debug)]
pub struct DataConnection {
    pub allocation: AllocationId,
    pub peer: SocketAddr,
    pub stream: TcpStream,
    /// Flips to `true` when the owning allocation is released
    pub closed: watch::Receiver<bool>,
}

/// Successful outcome of a request
#[derive(Debug)]
pub enum TurnResponse {
    Bound {
        mapped_addr: SocketAddr,
    },
    Allocated {
        relayed_addr: SocketAddr,
        mapped_addr: SocketAddr,
        lifetime: Duration,
    },
    /// Zero lifetime means the allocation was deleted
    Refreshed {
        lifetime: Duration,
    },
    PermissionCreated,
    ChannelBound,
    Connected {
        connection_id: ConnectionId,
    },
    ConnectionBound(DataConnection),
    /// Data forwarded toward a peer
    Relayed,
    /// Data discarded without telling the sender
    Dropped,
}

/// Everything the handler knows about where a message came from
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub five_tuple: FiveTuple,
    pub sink: ClientSink,
    /// Only the first message of a fresh TCP connection may be ConnectionBind
    pub allow_connection_bind: bool,
}

impl RequestContext {
    pub fn new(five_tuple: FiveTuple, sink: ClientSink) -> Self {
        Self {
            five_tuple,
            sink,
            allow_connection_bind: false,
        }
    }

    pub fn first_on_stream(mut self) -> Self {
        self.allow_connection_bind = true;
        self
    }
}
