//! TURN request dispatcher
//!
//! Takes raw frames from the client-facing transport, authenticates and
//! decodes them, runs the matching operation against the allocation table
//! and encodes the reply.

use super::allocator::{AcquiredTransport, PortLease, RelayTransport, RelayTransportAllocator};
use super::auth::Authenticator;
use super::channel_data::ChannelData;
use super::message::{self, Challenge};
use super::relay::{RelayAllocation, RelayPath, RelayTable};
use super::request::{DataConnection, RequestContext, TurnRequest, TurnResponse};
use crate::domain::allocation::Refreshed;
use crate::domain::shared::{FiveTuple, RelayError, Result, TransportProtocol};
use crate::infrastructure::metrics;
use crate::infrastructure::protocols::stun::{MessageClass, Method, StunMessage};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What the transport should do after a frame was handled
#[derive(Debug, Default)]
pub struct HandlerOutput {
    pub reply: Option<Bytes>,
    /// Set when the connection became a data connection
    pub upgrade: Option<DataConnection>,
}

impl HandlerOutput {
    fn reply(reply: Option<Bytes>) -> Self {
        Self {
            reply,
            upgrade: None,
        }
    }
}

pub struct TurnHandler {
    table: Arc<RelayTable>,
    allocator: Arc<dyn RelayTransportAllocator>,
    relay: RelayPath,
    auth: Authenticator,
    software: Option<String>,
}

impl TurnHandler {
    pub fn new(
        allocator: Arc<dyn RelayTransportAllocator>,
        relay: RelayPath,
        auth: Authenticator,
        software: Option<String>,
    ) -> Self {
        Self {
            table: Arc::clone(relay.table()),
            allocator,
            relay,
            auth,
            software,
        }
    }

    pub fn table(&self) -> &Arc<RelayTable> {
        &self.table
    }

    pub fn relay(&self) -> &RelayPath {
        &self.relay
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    /// Handle one STUN message or ChannelData frame
    pub async fn handle_message(&self, data: &[u8], ctx: &RequestContext) -> HandlerOutput {
        if ChannelData::is_channel_data(data) {
            match message::decode_channel_data(data) {
                Ok(request) => {
                    if let Err(e) = self.handle_request(request, ctx, None).await {
                        debug!("ChannelData from {} dropped: {}", ctx.five_tuple.client, e);
                    }
                }
                Err(e) => debug!("Malformed ChannelData from {}: {}", ctx.five_tuple.client, e),
            }
            return HandlerOutput::default();
        }

        match StunMessage::from_bytes(data) {
            Ok(message) => {
                debug!("<- {} {}", ctx.five_tuple.client, message);
                self.handle_stun(&message, ctx).await
            }
            Err(e) => {
                debug!("Discarding {} bytes from {}: {}", data.len(), ctx.five_tuple.client, e);
                HandlerOutput::default()
            }
        }
    }

    async fn handle_stun(&self, message: &StunMessage, ctx: &RequestContext) -> HandlerOutput {
        let is_request = match message.class() {
            MessageClass::Request => true,
            MessageClass::Indication => false,
            _ => {
                debug!("Ignoring {} from {}", message.message_type, ctx.five_tuple.client);
                return HandlerOutput::default();
            }
        };

        let identity = if is_request && message.method() != Method::Binding {
            match self.auth.authenticate(message) {
                Ok(identity) => Some(identity),
                Err(e) => return HandlerOutput::reply(self.reject(message, &e, None, ctx)),
            }
        } else {
            None
        };
        let key = identity.as_ref().map(|identity| &identity.key[..]);

        let request = match message::decode_request(message) {
            Ok(request) => request,
            Err(e) if is_request => return HandlerOutput::reply(self.reject(message, &e, key, ctx)),
            Err(e) => {
                debug!("Dropped indication from {}: {}", ctx.five_tuple.client, e);
                return HandlerOutput::default();
            }
        };
        let name = request.name();
        let username = identity.as_ref().map(|identity| identity.username.as_str());

        match self.handle_request(request, ctx, username).await {
            Ok(response) => {
                if is_request {
                    metrics::record_request(name, None);
                }
                let reply = self.encode_reply(message, &response, key, ctx);
                let upgrade = match response {
                    TurnResponse::ConnectionBound(connection) => Some(connection),
                    _ => None,
                };
                HandlerOutput { reply, upgrade }
            }
            Err(e) if is_request => HandlerOutput::reply(self.reject(message, &e, key, ctx)),
            Err(e) => {
                debug!("Dropped {} from {}: {}", name, ctx.five_tuple.client, e);
                HandlerOutput::default()
            }
        }
    }

    fn encode_reply(
        &self,
        request: &StunMessage,
        response: &TurnResponse,
        key: Option<&[u8]>,
        ctx: &RequestContext,
    ) -> Option<Bytes> {
        match message::encode_success(request, response, key, self.software.as_deref()) {
            Ok(Some(reply)) => {
                debug!("-> {} {} success", ctx.five_tuple.client, request.message_type.method.as_str());
                Some(reply)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to encode {} response: {}", request.message_type, e);
                None
            }
        }
    }

    fn reject(
        &self,
        request: &StunMessage,
        error: &RelayError,
        key: Option<&[u8]>,
        ctx: &RequestContext,
    ) -> Option<Bytes> {
        let code = error.error_code();
        metrics::record_request(request.message_type.method.as_str(), Some(code));
        let challenge: Option<Challenge> = match error {
            RelayError::Unauthorized(_) | RelayError::StaleNonce => Some(self.auth.challenge()),
            _ => None,
        };
        if code == 401 {
            debug!("-> {} {} 401: {}", ctx.five_tuple.client, request.message_type.method.as_str(), error);
        } else {
            info!(
                "{} from {} rejected with {}: {}",
                request.message_type.method.as_str(),
                ctx.five_tuple.client,
                code,
                error
            );
        }

        match message::encode_error(request, error, challenge, key, self.software.as_deref()) {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!("Failed to encode error response: {}", e);
                None
            }
        }
    }

    /// Dispatch a decoded request; `username` is set for authenticated requests
    pub async fn handle_request(
        &self,
        request: TurnRequest,
        ctx: &RequestContext,
        username: Option<&str>,
    ) -> Result<TurnResponse> {
        match request {
            TurnRequest::Binding => Ok(TurnResponse::Bound {
                mapped_addr: ctx.five_tuple.client,
            }),
            TurnRequest::Allocate {
                requested_transport,
                lifetime,
            } => {
                self.allocate(ctx, authenticated(username)?, requested_transport, lifetime)
                    .await
            }
            TurnRequest::Refresh { lifetime } => {
                let allocation = self.owned_allocation(ctx, username)?;
                match self.table.refresh(allocation.id(), lifetime)? {
                    Refreshed::Extended { lifetime, .. } => Ok(TurnResponse::Refreshed { lifetime }),
                    Refreshed::Deleted => Ok(TurnResponse::Refreshed {
                        lifetime: Duration::ZERO,
                    }),
                }
            }
            TurnRequest::CreatePermission { peers } => {
                let allocation = self.owned_allocation(ctx, username)?;
                let permissions = self.table.permissions();
                for peer in peers {
                    permissions.authorize(allocation.id(), peer.ip(), permissions.lifetime());
                }
                Ok(TurnResponse::PermissionCreated)
            }
            TurnRequest::ChannelBind { channel, peer } => {
                let allocation = self.owned_allocation(ctx, username)?;
                if allocation.protocol() == TransportProtocol::Tcp {
                    return Err(RelayError::BadRequest("ChannelBind on a TCP allocation".to_string()));
                }
                self.table.channels().bind(allocation.id(), channel, peer)?;
                let permissions = self.table.permissions();
                permissions.authorize(allocation.id(), peer.ip(), permissions.lifetime());
                Ok(TurnResponse::ChannelBound)
            }
            TurnRequest::Send { peer, data } => match self.table.get_by_five_tuple(&ctx.five_tuple) {
                Some(allocation) => self.relay.send_to_peer(&allocation, peer, data).await,
                None => {
                    debug!("Send from {} without an allocation", ctx.five_tuple.client);
                    metrics::record_dropped("no_allocation");
                    Ok(TurnResponse::Dropped)
                }
            },
            TurnRequest::ChannelData { channel, data } => {
                let Some(allocation) = self.table.get_by_five_tuple(&ctx.five_tuple) else {
                    metrics::record_dropped("no_allocation");
                    return Ok(TurnResponse::Dropped);
                };
                match self.table.channels().use_channel(allocation.id(), channel) {
                    Ok(peer) => self.relay.send_to_peer(&allocation, peer, data).await,
                    Err(e) => {
                        debug!("ChannelData on {} dropped: {}", channel, e);
                        metrics::record_dropped("unbound_channel");
                        Ok(TurnResponse::Dropped)
                    }
                }
            }
            TurnRequest::Connect { peer } => {
                let allocation = self.owned_allocation(ctx, username)?;
                let connection_id = self.relay.connect_peer(&allocation, peer).await?;
                Ok(TurnResponse::Connected { connection_id })
            }
            TurnRequest::ConnectionBind { connection_id } => {
                if !ctx.allow_connection_bind || ctx.five_tuple.protocol != TransportProtocol::Tcp {
                    return Err(RelayError::BadRequest(
                        "ConnectionBind must open a fresh TCP connection".to_string(),
                    ));
                }
                let connection = self
                    .relay
                    .bind_connection(connection_id, authenticated(username)?)?;
                Ok(TurnResponse::ConnectionBound(connection))
            }
        }
    }

    async fn allocate(
        &self,
        ctx: &RequestContext,
        username: &str,
        requested_transport: u8,
        lifetime: Option<Duration>,
    ) -> Result<TurnResponse> {
        if let Some(existing) = self.table.get_by_five_tuple(&ctx.five_tuple) {
            return existing_allocation(&existing, username, ctx.five_tuple.client);
        }

        let protocol = TransportProtocol::from_protocol_number(requested_transport)
            .ok_or(RelayError::UnsupportedTransport(requested_transport))?;
        if protocol == TransportProtocol::Tcp && ctx.five_tuple.protocol != TransportProtocol::Tcp {
            return Err(RelayError::BadRequest(
                "TCP relay needs a TCP control connection".to_string(),
            ));
        }
        let lifetime = self.table.policy().effective(lifetime);
        if lifetime.is_zero() {
            return Err(RelayError::BadRequest("zero lifetime".to_string()));
        }

        let acquired = self.allocator.acquire(protocol).await?;
        let relayed_addr = acquired.relayed_addr();
        let (transport, driver) = match acquired {
            AcquiredTransport::Udp { socket, lease, .. } => {
                let socket = Arc::new(socket);
                (RelayTransport::Udp(Arc::clone(&socket)), Driver::Udp(socket, lease))
            }
            AcquiredTransport::Tcp { listener, lease, .. } => {
                let local_addr = listener.local_addr()?;
                (RelayTransport::Tcp { local_addr }, Driver::Tcp(listener, lease))
            }
        };

        let allocation = match self.table.create(
            username,
            ctx.five_tuple,
            protocol,
            Some(lifetime),
            relayed_addr,
            transport,
        ) {
            Ok(allocation) => allocation,
            Err(RelayError::DuplicateAllocation(id)) => {
                // A concurrent Allocate on the same five-tuple won
                let existing = self
                    .table
                    .get(id)
                    .ok_or_else(|| RelayError::AllocationMismatch(format!("allocation {} vanished", id)))?;
                return existing_allocation(&existing, username, ctx.five_tuple.client);
            }
            Err(e) => return Err(e),
        };

        match driver {
            Driver::Udp(socket, lease) => {
                self.relay
                    .spawn_udp(Arc::clone(&allocation), socket, lease, ctx.sink.clone())
            }
            Driver::Tcp(listener, lease) => {
                self.relay
                    .spawn_tcp_listener(Arc::clone(&allocation), listener, lease, ctx.sink.clone())
            }
        };
        metrics::record_allocation_created(self.table.len());

        Ok(TurnResponse::Allocated {
            relayed_addr,
            mapped_addr: ctx.five_tuple.client,
            lifetime,
        })
    }

    fn owned_allocation(&self, ctx: &RequestContext, username: Option<&str>) -> Result<Arc<RelayAllocation>> {
        let username = authenticated(username)?;
        let allocation = self
            .table
            .get_by_five_tuple(&ctx.five_tuple)
            .ok_or_else(|| RelayError::NotFound(format!("no allocation for {}", ctx.five_tuple)))?;
        if allocation.username() != username {
            return Err(RelayError::WrongCredentials(format!(
                "allocation belongs to {}",
                allocation.username()
            )));
        }
        Ok(allocation)
    }

    /// Tear down the allocation owned by a control connection that went away
    pub fn close_five_tuple(&self, five_tuple: &FiveTuple) -> bool {
        match self.table.get_by_five_tuple(five_tuple) {
            Some(allocation) => {
                info!("Control connection {} closed, releasing {}", five_tuple, allocation.id());
                self.table.remove(allocation.id()).is_some()
            }
            None => false,
        }
    }
}

/// What the relay task owns for the allocation's lifetime
enum Driver {
    Udp(Arc<tokio::net::UdpSocket>, PortLease),
    Tcp(tokio::net::TcpListener, PortLease),
}

fn authenticated(username: Option<&str>) -> Result<&str> {
    username.ok_or_else(|| RelayError::Unauthorized("request was not authenticated".to_string()))
}

/// A retransmitted Allocate gets the existing allocation back
fn existing_allocation(existing: &RelayAllocation, username: &str, mapped_addr: SocketAddr) -> Result<TurnResponse> {
    if existing.username() != username {
        return Err(RelayError::AllocationMismatch(
            "five-tuple already allocated to another user".to_string(),
        ));
    }
    Ok(TurnResponse::Allocated {
        relayed_addr: existing.relayed_addr(),
        mapped_addr,
        lifetime: existing.remaining_at(Instant::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::allocation::{AllocationTable, LifetimePolicy};
    use crate::domain::channel::ChannelBindingRegistry;
    use crate::domain::credential::{generate_auth_key, MockCredentialStore};
    use crate::domain::permission::PermissionRegistry;
    use crate::domain::shared::ChannelNumber;
    use crate::infrastructure::protocols::stun::Attribute;
    use crate::infrastructure::protocols::turn::allocator::{MockRelayTransportAllocator, PortRangeAllocator};
    use crate::infrastructure::protocols::turn::tcp_relay::PendingConnections;
    use crate::infrastructure::protocols::turn::transport::ClientSink;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::UdpSocket;

    const REALM: &str = "example.org";

    fn credentials() -> MockCredentialStore {
        let mut store = MockCredentialStore::new();
        store.expect_lookup().returning(|username, realm| match username {
            "alice" | "bob" => Some(generate_auth_key(username, realm, "secret")),
            _ => None,
        });
        store
    }

    fn handler_with(allocator: Arc<dyn RelayTransportAllocator>) -> TurnHandler {
        let table = Arc::new(AllocationTable::new(
            Arc::new(PermissionRegistry::new(Duration::from_secs(300))),
            Arc::new(ChannelBindingRegistry::new(Duration::from_secs(600))),
            LifetimePolicy {
                default_lifetime: Duration::from_secs(600),
                max_lifetime: Duration::from_secs(3600),
            },
            16,
        ));
        let relay = RelayPath::new(
            table,
            Arc::new(PendingConnections::new(Duration::from_secs(5))),
            Duration::from_secs(5),
        );
        let auth = Authenticator::new(REALM, Arc::new(credentials()), Duration::from_secs(3600));
        TurnHandler::new(allocator, relay, auth, Some("test".to_string()))
    }

    fn handler() -> TurnHandler {
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        handler_with(Arc::new(PortRangeAllocator::new(loopback, loopback, 0, 0)))
    }

    async fn context(client: &str) -> RequestContext {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server = socket.local_addr().unwrap();
        let client: SocketAddr = client.parse().unwrap();
        RequestContext::new(
            FiveTuple::new(client, server, TransportProtocol::Udp),
            ClientSink::Udp { socket, client },
        )
    }

    fn signed(handler: &TurnHandler, user: &str, message: StunMessage) -> Vec<u8> {
        let nonce = handler.authenticator().challenge().nonce;
        message
            .with(Attribute::Username(user.to_string()))
            .with(Attribute::Realm(REALM.to_string()))
            .with(Attribute::Nonce(nonce))
            .encode(Some(&generate_auth_key(user, REALM, "secret")))
            .unwrap()
    }

    fn allocate_request() -> StunMessage {
        StunMessage::new_request(Method::Allocate).with(Attribute::RequestedTransport(17))
    }

    fn decode(output: HandlerOutput) -> StunMessage {
        StunMessage::from_bytes(&output.reply.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_unauthenticated_allocate_gets_challenge() {
        let handler = handler();
        let ctx = context("127.0.0.1:50000").await;
        let bytes = allocate_request().encode(None).unwrap();

        let reply = decode(handler.handle_message(&bytes, &ctx).await);
        assert_eq!(reply.get_error_code().map(|(code, _)| code), Some(401));
        assert_eq!(reply.get_realm(), Some(REALM));
        assert!(reply.get_nonce().is_some());
        assert!(handler.table().is_empty());
    }

    #[tokio::test]
    async fn test_binding_needs_no_credentials() {
        let handler = handler();
        let ctx = context("127.0.0.1:50001").await;
        let bytes = StunMessage::new_request(Method::Binding).encode(None).unwrap();

        let reply = decode(handler.handle_message(&bytes, &ctx).await);
        assert_eq!(reply.class(), MessageClass::SuccessResponse);
        assert_eq!(reply.get_xor_mapped_address(), Some(ctx.five_tuple.client));
    }

    #[tokio::test]
    async fn test_allocate_is_idempotent_per_five_tuple() {
        let handler = handler();
        let ctx = context("127.0.0.1:50002").await;

        let first = decode(handler.handle_message(&signed(&handler, "alice", allocate_request()), &ctx).await);
        assert_eq!(first.class(), MessageClass::SuccessResponse);
        assert!(first.verify_integrity(&generate_auth_key("alice", REALM, "secret")));
        let relayed = first.get_xor_relayed_address().unwrap();

        let second = decode(handler.handle_message(&signed(&handler, "alice", allocate_request()), &ctx).await);
        assert_eq!(second.get_xor_relayed_address(), Some(relayed));
        assert_eq!(handler.table().len(), 1);

        let other_user = decode(handler.handle_message(&signed(&handler, "bob", allocate_request()), &ctx).await);
        assert_eq!(other_user.get_error_code().map(|(code, _)| code), Some(437));
    }

    #[tokio::test]
    async fn test_concurrent_allocates_share_one_allocation() {
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let allocator = PortRangeAllocator::new(loopback, loopback, 0, 0);
        let handler = handler_with(Arc::new(allocator.clone()));
        let ctx = context("127.0.0.1:50010").await;
        let first_request = signed(&handler, "alice", allocate_request());
        let second_request = signed(&handler, "alice", allocate_request());

        let (first, second) = tokio::join!(
            handler.handle_message(&first_request, &ctx),
            handler.handle_message(&second_request, &ctx),
        );
        let (first, second) = (decode(first), decode(second));
        assert_eq!(first.class(), MessageClass::SuccessResponse);
        assert_eq!(second.class(), MessageClass::SuccessResponse);
        assert_eq!(first.get_xor_relayed_address(), second.get_xor_relayed_address());
        assert_eq!(handler.table().len(), 1);
        // The losing request gives its port back
        assert_eq!(allocator.in_use(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_transport() {
        let handler = handler();
        let ctx = context("127.0.0.1:50003").await;
        let request = StunMessage::new_request(Method::Allocate).with(Attribute::RequestedTransport(99));

        let reply = decode(handler.handle_message(&signed(&handler, "alice", request), &ctx).await);
        assert_eq!(reply.get_error_code().map(|(code, _)| code), Some(442));
    }

    #[tokio::test]
    async fn test_exhausted_allocator_rejects_allocate() {
        let mut allocator = MockRelayTransportAllocator::new();
        allocator
            .expect_acquire()
            .times(1)
            .returning(|_| Err(RelayError::ResourceExhausted("no ports".to_string())));
        let handler = handler_with(Arc::new(allocator));
        let ctx = context("127.0.0.1:50004").await;

        let reply = decode(handler.handle_message(&signed(&handler, "alice", allocate_request()), &ctx).await);
        assert_eq!(reply.get_error_code().map(|(code, _)| code), Some(508));
        assert!(handler.table().is_empty());
    }

    #[tokio::test]
    async fn test_requests_need_allocation_and_owner() {
        let handler = handler();
        let ctx = context("127.0.0.1:50005").await;
        let permission = || {
            StunMessage::new_request(Method::CreatePermission)
                .with(Attribute::XorPeerAddress("192.0.2.1:1000".parse().unwrap()))
        };

        let reply = decode(handler.handle_message(&signed(&handler, "alice", permission()), &ctx).await);
        assert_eq!(reply.get_error_code().map(|(code, _)| code), Some(437));

        handler.handle_message(&signed(&handler, "alice", allocate_request()), &ctx).await;
        let reply = decode(handler.handle_message(&signed(&handler, "bob", permission()), &ctx).await);
        assert_eq!(reply.get_error_code().map(|(code, _)| code), Some(441));

        let reply = decode(handler.handle_message(&signed(&handler, "alice", permission()), &ctx).await);
        assert_eq!(reply.class(), MessageClass::SuccessResponse);
    }

    #[tokio::test]
    async fn test_refresh_zero_deletes() {
        let handler = handler();
        let ctx = context("127.0.0.1:50006").await;
        handler.handle_message(&signed(&handler, "alice", allocate_request()), &ctx).await;
        let refresh = || StunMessage::new_request(Method::Refresh).with(Attribute::Lifetime(0));

        let reply = decode(handler.handle_message(&signed(&handler, "alice", refresh()), &ctx).await);
        assert_eq!(reply.get_lifetime(), Some(0));
        assert!(handler.table().is_empty());

        let reply = decode(handler.handle_message(&signed(&handler, "alice", refresh()), &ctx).await);
        assert_eq!(reply.get_error_code().map(|(code, _)| code), Some(437));
    }

    #[tokio::test]
    async fn test_channel_bind_conflict() {
        let handler = handler();
        let ctx = context("127.0.0.1:50007").await;
        handler.handle_message(&signed(&handler, "alice", allocate_request()), &ctx).await;
        let bind = |channel: u16, peer: &str| {
            StunMessage::new_request(Method::ChannelBind)
                .with(Attribute::ChannelNumber(channel))
                .with(Attribute::XorPeerAddress(peer.parse().unwrap()))
        };

        let reply = decode(handler.handle_message(&signed(&handler, "alice", bind(0x4000, "192.0.2.1:1000")), &ctx).await);
        assert_eq!(reply.class(), MessageClass::SuccessResponse);
        let reply = decode(handler.handle_message(&signed(&handler, "alice", bind(0x4000, "192.0.2.1:1000")), &ctx).await);
        assert_eq!(reply.class(), MessageClass::SuccessResponse);
        let reply = decode(handler.handle_message(&signed(&handler, "alice", bind(0x4000, "192.0.2.2:1000")), &ctx).await);
        assert_eq!(reply.get_error_code().map(|(code, _)| code), Some(400));

        let allocation = handler.table().get_by_five_tuple(&ctx.five_tuple).unwrap();
        assert!(handler
            .table()
            .permissions()
            .is_authorized(allocation.id(), "192.0.2.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_indications_never_answered() {
        let handler = handler();
        let ctx = context("127.0.0.1:50008").await;
        let send = StunMessage::new_indication(Method::Send)
            .with(Attribute::XorPeerAddress("192.0.2.1:1000".parse().unwrap()))
            .with(Attribute::Data(Bytes::from_static(b"x")))
            .encode(None)
            .unwrap();
        let output = handler.handle_message(&send, &ctx).await;
        assert!(output.reply.is_none());

        let channel_data = [0x40, 0x00, 0x00, 0x01, 0xff];
        let output = handler.handle_message(&channel_data, &ctx).await;
        assert!(output.reply.is_none());
    }

    #[tokio::test]
    async fn test_unbound_channel_data_dropped_on_live_allocation() {
        let handler = handler();
        let ctx = context("127.0.0.1:50011").await;
        handler.handle_message(&signed(&handler, "alice", allocate_request()), &ctx).await;

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let permission = StunMessage::new_request(Method::CreatePermission).with(Attribute::XorPeerAddress(peer_addr));
        let reply = decode(handler.handle_message(&signed(&handler, "alice", permission), &ctx).await);
        assert_eq!(reply.class(), MessageClass::SuccessResponse);

        let channel_data = ChannelData::new(ChannelNumber::new(0x4000).unwrap(), Bytes::from_static(b"lost"))
            .encode(false)
            .unwrap();
        let output = handler.handle_message(&channel_data, &ctx).await;
        assert!(output.reply.is_none());
        assert!(output.upgrade.is_none());

        let mut buf = [0u8; 16];
        assert!(tokio::time::timeout(Duration::from_millis(300), peer.recv_from(&mut buf))
            .await
            .is_err());
        assert_eq!(handler.table().len(), 1);
    }

    #[tokio::test]
    async fn test_tcp_relay_over_udp_rejected() {
        let handler = handler();
        let ctx = context("127.0.0.1:50009").await;
        let request = StunMessage::new_request(Method::Allocate).with(Attribute::RequestedTransport(6));

        let reply = decode(handler.handle_message(&signed(&handler, "alice", request), &ctx).await);
        assert_eq!(reply.get_error_code().map(|(code, _)| code), Some(400));
    }
}
