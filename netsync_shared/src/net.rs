//! Transport boundary and the TCP transport.
//!
//! Goals:
//! - Keep the coordinators independent from concrete sockets.
//! - Deliver connect/disconnect/data events only from `poll()`, so no
//!   callback ever runs concurrently with application code.
//! - Never block on send; failures are reported to the caller.
//!
//! The TCP transport frames every message with a big-endian `u32` length.
//! Socket I/O happens on background tokio tasks that feed an event queue.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Frames above this size are treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Identifies one end of a transport connection.
///
/// `ConnectionId::AUTHORITY` (0) is the host as seen from a peer. A host
/// hands out nonzero ids to its peers and never reuses one while it is
/// connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub const AUTHORITY: Self = ConnectionId(0);

    pub fn is_authority(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Replicated entity identifier, identical on the authority and every peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Placeholder used on the wire for "no parent".
    pub const NONE: Self = EntityId(0);
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport send failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid connection id {0}")]
    InvalidConnectionId(ConnectionId),
    #[error("message not sent to {0}")]
    MessageNotSent(ConnectionId),
    #[error("transport is not active")]
    Inactive,
}

/// Event produced by `Transport::poll`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connect(ConnectionId),
    Disconnect(ConnectionId),
    Data(ConnectionId, Bytes),
}

/// Peer-addressed byte channel.
pub trait Transport: Send {
    /// Drains the events that arrived since the previous poll.
    fn poll(&mut self) -> Vec<TransportEvent>;

    /// Queues `data` for `id`. Never blocks.
    fn send(&mut self, data: Bytes, id: ConnectionId) -> Result<(), TransportError>;

    fn is_active(&self) -> bool;
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(w: &mut W, payload: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    w.write_all(&buf).await.context("tcp write")?;
    Ok(())
}

/// Reads one length-prefixed frame.
pub async fn read_frame<R>(r: &mut R) -> anyhow::Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.context("tcp read len")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds limit");
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    Ok(Bytes::from(payload))
}

enum Wire {
    Opened(ConnectionId, mpsc::UnboundedSender<Bytes>),
    Closed(ConnectionId),
    Frame(ConnectionId, Bytes),
}

/// Spawns the reader and writer halves of one connection.
fn spawn_io(
    stream: TcpStream,
    id: ConnectionId,
    events: mpsc::UnboundedSender<Wire>,
) -> mpsc::UnboundedSender<Bytes> {
    let (mut rd, mut wr) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut wr, &frame).await {
                debug!(conn = %id, error = %e, "Writer stopped");
                break;
            }
        }
    });

    tokio::spawn(async move {
        loop {
            match read_frame(&mut rd).await {
                Ok(frame) => {
                    if events.send(Wire::Frame(id, frame)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(conn = %id, error = %e, "Reader stopped");
                    let _ = events.send(Wire::Closed(id));
                    break;
                }
            }
        }
    });

    out_tx
}

/// Host side of the TCP transport.
pub struct TcpServerTransport {
    local_addr: SocketAddr,
    events: mpsc::UnboundedReceiver<Wire>,
    writers: HashMap<ConnectionId, mpsc::UnboundedSender<Bytes>>,
    accept_task: JoinHandle<()>,
    active: Arc<AtomicBool>,
}

impl TcpServerTransport {
    /// Binds the listener and starts accepting peers.
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        let local_addr = listener.local_addr().context("tcp local addr")?;
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        let next_id = AtomicU64::new(1);

        let accept_active = active.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let id = ConnectionId(next_id.fetch_add(1, Ordering::Relaxed));
                        info!(conn = %id, %peer, "Peer accepted");
                        let writer = spawn_io(stream, id, tx.clone());
                        if tx.send(Wire::Opened(id, writer)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        break;
                    }
                }
            }
            accept_active.store(false, Ordering::Relaxed);
        });

        info!(addr = %local_addr, "TCP transport listening");
        Ok(Self {
            local_addr,
            events: rx,
            writers: HashMap::new(),
            accept_task,
            active,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and drops every connection.
    pub fn shutdown(&mut self) {
        self.accept_task.abort();
        self.writers.clear();
        self.active.store(false, Ordering::Relaxed);
    }
}

impl Drop for TcpServerTransport {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl Transport for TcpServerTransport {
    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            match ev {
                Wire::Opened(id, writer) => {
                    self.writers.insert(id, writer);
                    out.push(TransportEvent::Connect(id));
                }
                Wire::Closed(id) => {
                    if self.writers.remove(&id).is_some() {
                        out.push(TransportEvent::Disconnect(id));
                    }
                }
                Wire::Frame(id, frame) => {
                    if self.writers.contains_key(&id) {
                        out.push(TransportEvent::Data(id, frame));
                    }
                }
            }
        }
        out
    }

    fn send(&mut self, data: Bytes, id: ConnectionId) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::Inactive);
        }
        let writer = self
            .writers
            .get(&id)
            .ok_or(TransportError::InvalidConnectionId(id))?;
        writer
            .send(data)
            .map_err(|_| TransportError::MessageNotSent(id))
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}

/// Peer side of the TCP transport. The host is always `ConnectionId::AUTHORITY`.
pub struct TcpClientTransport {
    events: mpsc::UnboundedReceiver<Wire>,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    announced: bool,
}

impl TcpClientTransport {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        let _ = stream.set_nodelay(true);
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = spawn_io(stream, ConnectionId::AUTHORITY, tx);
        info!(%addr, "Connected to host");
        Ok(Self {
            events: rx,
            writer: Some(writer),
            announced: false,
        })
    }
}

impl Transport for TcpClientTransport {
    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        if !self.announced {
            self.announced = true;
            out.push(TransportEvent::Connect(ConnectionId::AUTHORITY));
        }
        while let Ok(ev) = self.events.try_recv() {
            match ev {
                Wire::Frame(id, frame) if self.writer.is_some() => {
                    out.push(TransportEvent::Data(id, frame));
                }
                Wire::Closed(id) => {
                    if self.writer.take().is_some() {
                        out.push(TransportEvent::Disconnect(id));
                    }
                }
                _ => {}
            }
        }
        out
    }

    fn send(&mut self, data: Bytes, id: ConnectionId) -> Result<(), TransportError> {
        if !id.is_authority() {
            return Err(TransportError::InvalidConnectionId(id));
        }
        let writer = self.writer.as_ref().ok_or(TransportError::Inactive)?;
        writer
            .send(data)
            .map_err(|_| TransportError::MessageNotSent(id))
    }

    fn is_active(&self) -> bool {
        self.writer.is_some()
    }
}
