/// Conversion between STUN wire messages and decoded TURN requests (RFC 5766, RFC 6062)
use super::channel_data::ChannelData;
use super::request::{TurnRequest, TurnResponse};
use crate::domain::shared::{ChannelNumber, ConnectionId, RelayError, Result};
use crate::infrastructure::protocols::stun::{Attribute, MessageClass, Method, StunMessage};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;

/// Credentials challenge attached to 401 and 438 responses
#[derive(Debug, Clone)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
}

/// Turn a decoded STUN message into a request
pub fn decode_request(message: &StunMessage) -> Result<TurnRequest> {
    let lifetime = || message.get_lifetime().map(|secs| Duration::from_secs(u64::from(secs)));
    let peer = || {
        message
            .get_xor_peer_address()
            .ok_or_else(|| missing("XOR-PEER-ADDRESS"))
    };

    match (message.method(), message.class()) {
        (Method::Binding, MessageClass::Request) => Ok(TurnRequest::Binding),
        (Method::Allocate, MessageClass::Request) => Ok(TurnRequest::Allocate {
            requested_transport: message
                .get_requested_transport()
                .ok_or_else(|| missing("REQUESTED-TRANSPORT"))?,
            lifetime: lifetime(),
        }),
        (Method::Refresh, MessageClass::Request) => Ok(TurnRequest::Refresh {
            lifetime: lifetime(),
        }),
        (Method::CreatePermission, MessageClass::Request) => {
            let peers = message.get_xor_peer_addresses();
            if peers.is_empty() {
                return Err(missing("XOR-PEER-ADDRESS"));
            }
            Ok(TurnRequest::CreatePermission { peers })
        }
        (Method::ChannelBind, MessageClass::Request) => Ok(TurnRequest::ChannelBind {
            channel: ChannelNumber::new(
                message
                    .get_channel_number()
                    .ok_or_else(|| missing("CHANNEL-NUMBER"))?,
            )?,
            peer: peer()?,
        }),
        (Method::Send, MessageClass::Indication) => Ok(TurnRequest::Send {
            peer: peer()?,
            data: message.get_data().cloned().ok_or_else(|| missing("DATA"))?,
        }),
        (Method::Connect, MessageClass::Request) => Ok(TurnRequest::Connect { peer: peer()? }),
        (Method::ConnectionBind, MessageClass::Request) => Ok(TurnRequest::ConnectionBind {
            connection_id: ConnectionId::new(
                message
                    .get_connection_id()
                    .ok_or_else(|| missing("CONNECTION-ID"))?,
            ),
        }),
        (method, class) => Err(RelayError::BadRequest(format!(
            "unexpected {} {}",
            method.as_str(),
            class.as_str()
        ))),
    }
}

/// Turn a ChannelData frame into a request
pub fn decode_channel_data(data: &[u8]) -> Result<TurnRequest> {
    let frame = ChannelData::decode(data)?;
    Ok(TurnRequest::ChannelData {
        channel: frame.channel,
        data: frame.data,
    })
}

/// Success response for `response`; `None` for outcomes that get no reply
pub fn encode_success(
    request: &StunMessage,
    response: &TurnResponse,
    key: Option<&[u8]>,
    software: Option<&str>,
) -> Result<Option<Bytes>> {
    let mut reply = request.success_response();
    match response {
        TurnResponse::Bound { mapped_addr } => {
            reply.add(Attribute::XorMappedAddress(*mapped_addr));
        }
        TurnResponse::Allocated {
            relayed_addr,
            mapped_addr,
            lifetime,
        } => {
            reply.add(Attribute::XorRelayedAddress(*relayed_addr));
            reply.add(Attribute::XorMappedAddress(*mapped_addr));
            reply.add(Attribute::Lifetime(lifetime_secs(*lifetime)));
        }
        TurnResponse::Refreshed { lifetime } => {
            reply.add(Attribute::Lifetime(lifetime_secs(*lifetime)));
        }
        TurnResponse::Connected { connection_id } => {
            reply.add(Attribute::ConnectionId(connection_id.value()));
        }
        TurnResponse::PermissionCreated
        | TurnResponse::ChannelBound
        | TurnResponse::ConnectionBound(_) => {}
        TurnResponse::Relayed | TurnResponse::Dropped => return Ok(None),
    }
    if let Some(software) = software {
        reply.add(Attribute::Software(software.to_string()));
    }
    Ok(Some(Bytes::from(reply.encode(key)?)))
}

/// Error response carrying the code and reason of `error`
pub fn encode_error(
    request: &StunMessage,
    error: &RelayError,
    challenge: Option<Challenge>,
    key: Option<&[u8]>,
    software: Option<&str>,
) -> Result<Bytes> {
    let mut reply = request.error_response(error.error_code(), error.reason());
    if let Some(challenge) = challenge {
        reply.add(Attribute::Realm(challenge.realm));
        reply.add(Attribute::Nonce(challenge.nonce));
    }
    if let Some(software) = software {
        reply.add(Attribute::Software(software.to_string()));
    }
    Ok(Bytes::from(reply.encode(key)?))
}

/// Data indication delivering peer data to the client
pub fn data_indication(peer: SocketAddr, data: Bytes) -> Result<Bytes> {
    let indication = StunMessage::new_indication(Method::Data)
        .with(Attribute::XorPeerAddress(peer))
        .with(Attribute::Data(data));
    Ok(Bytes::from(indication.encode(None)?))
}

/// Announcement of a peer-initiated TCP connection
pub fn connection_attempt(connection_id: ConnectionId, peer: SocketAddr) -> Result<Bytes> {
    let indication = StunMessage::new_indication(Method::ConnectionAttempt)
        .with(Attribute::ConnectionId(connection_id.value()))
        .with(Attribute::XorPeerAddress(peer));
    Ok(Bytes::from(indication.encode(None)?))
}

fn lifetime_secs(lifetime: Duration) -> u32 {
    u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX)
}

fn missing(attribute: &str) -> RelayError {
    RelayError::BadRequest(format!("missing {}", attribute))
}
