//! Client-facing transport plumbing shared by the server and the client

use super::channel_data::{ChannelData, CHANNEL_DATA_HEADER_LEN};
use crate::domain::shared::{RelayError, Result};
use crate::infrastructure::protocols::stun::StunMessage;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Largest datagram accepted on any socket
pub const MAX_DATAGRAM_SIZE: usize = 65_536;

/// Queue depth of a stream connection's writer
pub const STREAM_QUEUE_DEPTH: usize = 256;

/// Where messages for one client go
#[derive(Debug, Clone)]
pub enum ClientSink {
    /// Datagrams sent from the listening socket
    Udp {
        socket: Arc<UdpSocket>,
        client: SocketAddr,
    },
    /// Frames queued for the connection's writer task
    Stream(mpsc::Sender<Bytes>),
}

impl ClientSink {
    /// Stream transports need ChannelData padded to 4 bytes
    pub fn is_stream(&self) -> bool {
        matches!(self, ClientSink::Stream(_))
    }

    pub async fn send(&self, data: Bytes) -> Result<()> {
        match self {
            ClientSink::Udp { socket, client } => {
                socket.send_to(&data, *client).await?;
                Ok(())
            }
            ClientSink::Stream(tx) => tx.send(data).await.map_err(|_| RelayError::SessionClosed),
        }
    }
}

/// Resolves once a shutdown or release flag turns true
///
/// Usable as a `select!` branch in spawned tasks: no `watch::Ref` outlives it.
pub async fn raised(flag: &mut watch::Receiver<bool>) {
    let _ = flag.wait_for(|raised| *raised).await;
}

/// Read exactly one STUN message or ChannelData frame from a stream
///
/// Returns `None` on a clean end of stream. Never reads past the frame, so
/// the stream can carry raw bytes right after it.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; CHANNEL_DATA_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let total = if header[0] & 0xC0 == 0 {
        StunMessage::total_length(&header)
    } else if ChannelData::is_channel_data(&header) {
        ChannelData::total_length(&header, true)
    } else {
        None
    }
    .ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unrecognised frame header {}", hex::encode(header)),
        )
    })?;

    let mut frame = vec![0u8; total];
    frame[..CHANNEL_DATA_HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[CHANNEL_DATA_HEADER_LEN..]).await?;

    debug!("Read {} byte frame from stream", frame.len());
    Ok(Some(Bytes::from(frame)))
}

/// Drain a queue into a stream writer until either side closes
pub async fn write_queue<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            debug!("Stream writer stopped: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::stun::Method;
    use crate::domain::shared::ChannelNumber;

    #[tokio::test]
    async fn test_read_frame_stops_at_boundary() {
        let stun = StunMessage::new_request(Method::Binding).encode(None).unwrap();
        let channel = ChannelData::new(ChannelNumber::new(0x4000).unwrap(), Bytes::from_static(b"xyz"))
            .encode(true)
            .unwrap();

        let mut input = Vec::new();
        input.extend_from_slice(&stun);
        input.extend_from_slice(&channel);
        input.extend_from_slice(b"raw tail");

        let mut reader = &input[..];
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap().as_ref(), &stun[..]);
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), channel);
        assert_eq!(reader, b"raw tail");
    }

    #[tokio::test]
    async fn test_read_frame_across_partial_reads() {
        let stun = StunMessage::new_request(Method::Refresh).encode(None).unwrap();
        let mut reader = tokio_test::io::Builder::new()
            .read(&stun[..2])
            .read(&stun[2..9])
            .read(&stun[9..])
            .build();

        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap().as_ref(), &stun[..]);
    }

    #[tokio::test]
    async fn test_read_frame_eof_and_garbage() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty).await.unwrap().is_none());

        let mut garbage: &[u8] = &[0xff, 0xff, 0x00, 0x00];
        assert!(read_frame(&mut garbage).await.is_err());
    }

    #[tokio::test]
    async fn test_raised_ends_select_in_spawned_task() {
        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = raised(&mut rx) => true,
                _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => false,
            }
        });

        tx.send_replace(true);
        assert!(task.await.unwrap());
    }

    #[tokio::test]
    async fn test_raised_when_sender_gone() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        raised(&mut rx).await;
    }

    #[tokio::test]
    async fn test_stream_sink_and_writer() {
        let (tx, rx) = mpsc::channel(4);
        let sink = ClientSink::Stream(tx);
        assert!(sink.is_stream());

        let (client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(write_queue(client, rx));
        sink.send(Bytes::from_static(b"hello")).await.unwrap();
        drop(sink);
        writer.await.unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");
    }
}
