//! Datagram-style handle to a UDP allocation

use super::client::TurnClient;
use crate::domain::shared::{ChannelNumber, RelayError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Permissions last five minutes on the server
const PERMISSION_REFRESH_INTERVAL: Duration = Duration::from_secs(240);

/// Channel bindings last ten minutes on the server
const CHANNEL_REFRESH_INTERVAL: Duration = Duration::from_secs(540);

/// Permissions and channels a client installed on its allocation
#[derive(Default)]
pub(super) struct InstalledState {
    permissions: DashMap<IpAddr, ()>,
    channels: DashMap<SocketAddr, ChannelNumber>,
    next_channel: AtomicU16,
}

impl InstalledState {
    pub(super) fn new() -> Self {
        Self {
            next_channel: AtomicU16::new(ChannelNumber::MIN),
            ..Self::default()
        }
    }

    pub(super) fn has_permission(&self, ip: IpAddr) -> bool {
        self.permissions.contains_key(&ip)
    }

    pub(super) fn record_permission(&self, ip: IpAddr) {
        self.permissions.insert(ip, ());
    }

    fn channel(&self, peer: SocketAddr) -> Option<ChannelNumber> {
        self.channels.get(&peer).map(|channel| *channel)
    }

    /// Next unused channel number, `None` once the range is spent
    fn next_channel(&self) -> Option<ChannelNumber> {
        let value = self.next_channel.fetch_add(1, Ordering::Relaxed);
        ChannelNumber::new(value).ok()
    }

    fn permission_peers(&self) -> Vec<SocketAddr> {
        self.permissions
            .iter()
            .map(|entry| SocketAddr::new(*entry.key(), 0))
            .collect()
    }

    fn channel_bindings(&self) -> Vec<(ChannelNumber, SocketAddr)> {
        self.channels
            .iter()
            .map(|entry| (*entry.value(), *entry.key()))
            .collect()
    }
}

/// Keep the allocation, its permissions and its channels alive
///
/// Exits once the session is closed.
pub(super) fn spawn_refresher(client: TurnClient, lifetime: Duration, installed: Arc<InstalledState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut allocation_due = tokio::time::Instant::now() + refresh_interval(lifetime);
        let mut permissions = tokio::time::interval(PERMISSION_REFRESH_INTERVAL);
        let mut channels = tokio::time::interval(CHANNEL_REFRESH_INTERVAL);
        permissions.reset();
        channels.reset();

        loop {
            let outcome = tokio::select! {
                _ = tokio::time::sleep_until(allocation_due) => {
                    match client.refresh(client.config().lifetime).await {
                        Ok(granted) => {
                            debug!("Allocation refreshed for {}s", granted.as_secs());
                            allocation_due = tokio::time::Instant::now() + refresh_interval(granted);
                            Ok(())
                        }
                        Err(e) => {
                            allocation_due = tokio::time::Instant::now() + Duration::from_secs(5);
                            Err(e)
                        }
                    }
                }
                _ = permissions.tick() => {
                    let peers = installed.permission_peers();
                    if peers.is_empty() {
                        Ok(())
                    } else {
                        client.create_permission(&peers).await
                    }
                }
                _ = channels.tick() => {
                    let mut result = Ok(());
                    for (channel, peer) in installed.channel_bindings() {
                        if let Err(e) = client.channel_bind(channel, peer).await {
                            result = Err(e);
                            break;
                        }
                    }
                    result
                }
            };

            match outcome {
                Ok(()) => {}
                Err(RelayError::SessionClosed) => break,
                Err(e) => warn!("Background refresh failed: {}", e),
            }
        }
        debug!("Refresher for {} stopped", client.local_addr());
    })
}

/// Refresh a minute before expiry, or halfway through short lifetimes
fn refresh_interval(lifetime: Duration) -> Duration {
    lifetime
        .saturating_sub(Duration::from_secs(60))
        .max(lifetime / 2)
        .max(Duration::from_secs(1))
}

/// A relayed UDP address usable like a socket
///
/// Sending to a new peer installs its permission first. With channel mode on,
/// each peer also gets a channel and data goes out as ChannelData.
pub struct RelaySocket {
    client: TurnClient,
    relayed_addr: SocketAddr,
    installed: Arc<InstalledState>,
    data_rx: Mutex<mpsc::Receiver<(SocketAddr, Bytes)>>,
    /// Held while a new peer gets its channel, so it gets exactly one
    binding: Mutex<()>,
    refresher: JoinHandle<()>,
}

impl RelaySocket {
    pub(super) fn new(
        client: TurnClient,
        relayed_addr: SocketAddr,
        lifetime: Duration,
        data_rx: mpsc::Receiver<(SocketAddr, Bytes)>,
    ) -> Self {
        let installed = Arc::new(InstalledState::new());
        let refresher = spawn_refresher(client.clone(), lifetime, Arc::clone(&installed));
        Self {
            client,
            relayed_addr,
            installed,
            data_rx: Mutex::new(data_rx),
            binding: Mutex::new(()),
            refresher,
        }
    }

    /// The relayed transport address peers send to
    pub fn local_addr(&self) -> SocketAddr {
        self.relayed_addr
    }

    pub fn client(&self) -> &TurnClient {
        &self.client
    }

    pub async fn send_to(&self, data: impl Into<Bytes>, peer: SocketAddr) -> Result<usize> {
        let data = data.into();
        let len = data.len();

        if !self.installed.has_permission(peer.ip()) {
            self.client.create_permission(&[peer]).await?;
            self.installed.record_permission(peer.ip());
        }

        if self.client.config().channel_mode {
            if let Some(channel) = self.channel_for(peer).await? {
                self.client.send_channel_data(channel, data).await?;
                return Ok(len);
            }
        }

        self.client.send_indication(peer, data).await?;
        Ok(len)
    }

    /// Wait for the next datagram from any permitted peer
    pub async fn recv_from(&self) -> Result<(Bytes, SocketAddr)> {
        let mut data_rx = self.data_rx.lock().await;
        match data_rx.recv().await {
            Some((peer, data)) => Ok((data, peer)),
            None => Err(RelayError::SessionClosed),
        }
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
        info!("Relay {} closed", self.relayed_addr);
    }

    async fn channel_for(&self, peer: SocketAddr) -> Result<Option<ChannelNumber>> {
        if let Some(channel) = self.installed.channel(peer) {
            return Ok(Some(channel));
        }
        let _binding = self.binding.lock().await;
        if let Some(channel) = self.installed.channel(peer) {
            return Ok(Some(channel));
        }
        let Some(channel) = self.installed.next_channel() else {
            return Ok(None);
        };
        self.client.channel_bind(channel, peer).await?;
        self.installed.channels.insert(peer, channel);
        Ok(Some(channel))
    }
}

impl fmt::Debug for RelaySocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelaySocket")
            .field("relayed_addr", &self.relayed_addr)
            .field("client", &self.client.local_addr())
            .field("permissions", &self.installed.permissions.len())
            .field("channels", &self.installed.channels.len())
            .finish()
    }
}

impl Drop for RelaySocket {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}
