//! TURN relay (RFC 5766) with TCP allocations (RFC 6062)
//!
//! The server side is [`TurnServer`] driving a [`TurnHandler`]; the client
//! side is a [`TurnClient`] session yielding a [`RelaySocket`] or a
//! [`TcpAllocation`].

pub mod allocator;
pub mod auth;
pub mod channel_data;
pub mod client;
pub mod handler;
pub mod message;
pub mod relay;
pub mod relay_conn;
pub mod request;
pub mod server;
pub mod tcp_alloc;
pub mod tcp_relay;
pub mod transport;

pub use allocator::{PortRangeAllocator, RelayTransport, RelayTransportAllocator};
pub use auth::{Authenticator, NonceManager};
pub use channel_data::ChannelData;
pub use client::{ClientConfig, SessionState, TurnClient};
pub use handler::{HandlerOutput, TurnHandler};
pub use relay::{RelayAllocation, RelayPath, RelayTable};
pub use relay_conn::RelaySocket;
pub use request::{RequestContext, TurnRequest, TurnResponse};
pub use server::TurnServer;
pub use tcp_alloc::TcpAllocation;
