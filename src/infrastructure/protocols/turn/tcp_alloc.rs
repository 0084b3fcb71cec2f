//! TCP allocation handle: dial peers through the relay and accept their connections

use super::client::TurnClient;
use super::relay_conn::{spawn_refresher, InstalledState};
use crate::domain::shared::{ConnectionId, RelayError, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct TcpAllocation {
    client: TurnClient,
    relayed_addr: SocketAddr,
    installed: Arc<InstalledState>,
    attempts_rx: Mutex<mpsc::Receiver<(ConnectionId, SocketAddr)>>,
    refresher: JoinHandle<()>,
}

impl TcpAllocation {
    pub(super) fn new(
        client: TurnClient,
        relayed_addr: SocketAddr,
        lifetime: Duration,
        attempts_rx: mpsc::Receiver<(ConnectionId, SocketAddr)>,
    ) -> Self {
        let installed = Arc::new(InstalledState::new());
        let refresher = spawn_refresher(client.clone(), lifetime, Arc::clone(&installed));
        Self {
            client,
            relayed_addr,
            installed,
            attempts_rx: Mutex::new(attempts_rx),
            refresher,
        }
    }

    /// The relayed address peers connect to
    pub fn local_addr(&self) -> SocketAddr {
        self.relayed_addr
    }

    pub fn client(&self) -> &TurnClient {
        &self.client
    }

    /// Permit a peer to connect in, or to be dialed
    pub async fn create_permission(&self, peer: SocketAddr) -> Result<()> {
        self.client.create_permission(&[peer]).await?;
        self.installed.record_permission(peer.ip());
        Ok(())
    }

    /// Open a relayed connection to a peer
    ///
    /// The peer must already have a permission; none is installed implicitly.
    pub async fn dial_peer(&self, peer: SocketAddr) -> Result<TcpStream> {
        let connection_id = self.client.connect_peer(peer).await?;
        debug!("Server connected to {} as connection {}", peer, connection_id);
        self.client.connection_bind(connection_id).await
    }

    /// Wait for a permitted peer to connect to the relayed address
    pub async fn accept_peer(&self) -> Result<(TcpStream, SocketAddr)> {
        let (connection_id, peer) = {
            let mut attempts_rx = self.attempts_rx.lock().await;
            attempts_rx.recv().await.ok_or(RelayError::SessionClosed)?
        };
        debug!("Connection attempt {} from {}", connection_id, peer);
        let stream = self.client.connection_bind(connection_id).await?;
        Ok((stream, peer))
    }

    pub async fn refresh(&self, lifetime: Option<Duration>) -> Result<Duration> {
        self.client.refresh(lifetime).await
    }

    /// Delete the allocation on the server and close the session
    pub async fn close(&self) {
        self.refresher.abort();
        if let Err(e) = self.client.refresh(Some(Duration::ZERO)).await {
            debug!("Deleting allocation {} failed: {}", self.relayed_addr, e);
        }
        self.client.close();
        info!("TCP relay {} closed", self.relayed_addr);
    }
}

impl fmt::Debug for TcpAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpAllocation")
            .field("relayed_addr", &self.relayed_addr)
            .field("client", &self.client.local_addr())
            .finish()
    }
}

impl Drop for TcpAllocation {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}
