//! TCP realization of the transport contract: a length-prefixed bincode
//! frame per message over one `TcpStream` per peer pair, grounded in the
//! teacher's connection-handling loop (bounded frame size, one task per
//! connection, explicit size-limited decode before touching the payload).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::clock::ProcId;
use crate::error::{DsmError, Result};

use super::{Transport, WireMessage};

/// Matches the teacher's `MAX_REQUEST_SIZE` bound: reject any frame claiming
/// to be larger than this before allocating a buffer for it.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub struct TcpTransport {
    my_id: ProcId,
    peers: RwLock<HashMap<ProcId, Arc<AsyncMutex<OwnedWriteHalf>>>>,
    inbox_tx: mpsc::UnboundedSender<(ProcId, WireMessage)>,
    inbox_rx: AsyncMutex<mpsc::UnboundedReceiver<(ProcId, WireMessage)>>,
}

impl TcpTransport {
    pub fn new(my_id: ProcId) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            my_id,
            peers: RwLock::new(HashMap::new()),
            inbox_tx,
            inbox_rx: AsyncMutex::new(inbox_rx),
        })
    }

    /// Accept inbound connections forever. Each connection's first frame
    /// must be a `Join { from }` handshake identifying the peer.
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "dsm transport listening");
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer_addr)) => {
                        tracing::info!(%peer_addr, "accepted dsm peer connection");
                        let this = this.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.accept_connection(socket).await {
                                tracing::error!(error = %e, "dsm peer connection failed");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    async fn accept_connection(self: Arc<Self>, socket: TcpStream) -> Result<()> {
        let (read_half, write_half) = socket.into_split();
        let mut read_half = read_half;
        let first = read_frame(&mut read_half).await?;
        let peer_id = match first {
            WireMessage::Join { from } => from,
            other => {
                return Err(DsmError::Protocol(format!(
                    "expected Join handshake, got {other:?}"
                )))
            }
        };
        self.peers
            .write()
            .insert(peer_id, Arc::new(AsyncMutex::new(write_half)));
        self.spawn_reader(peer_id, read_half);
        Ok(())
    }

    /// Connect out to a peer and perform the Join handshake.
    pub async fn connect(self: &Arc<Self>, peer_id: ProcId, addr: &str) -> Result<()> {
        let socket = TcpStream::connect(addr).await?;
        let (read_half, mut write_half) = socket.into_split();
        write_frame(&mut write_half, &WireMessage::Join { from: self.my_id }).await?;
        self.peers
            .write()
            .insert(peer_id, Arc::new(AsyncMutex::new(write_half)));
        self.spawn_reader(peer_id, read_half);
        Ok(())
    }

    fn spawn_reader(self: &Arc<Self>, peer_id: ProcId, mut read_half: tokio::net::tcp::OwnedReadHalf) {
        let inbox_tx = self.inbox_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(msg) => {
                        if inbox_tx.send((peer_id, msg)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(peer = peer_id, error = %e, "dsm peer connection closed");
                        break;
                    }
                }
            }
        });
    }
}

async fn read_frame(stream: &mut (impl AsyncReadExt + Unpin)) -> Result<WireMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(DsmError::Protocol(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    let (msg, _) = bincode::decode_from_slice(&body, bincode::config::standard())
        .map_err(|_| DsmError::Protocol("malformed frame".to_string()))?;
    Ok(msg)
}

async fn write_frame(stream: &mut (impl AsyncWriteExt + Unpin), msg: &WireMessage) -> Result<()> {
    let body = bincode::encode_to_vec(msg, bincode::config::standard())
        .map_err(|_| DsmError::Protocol("failed to encode frame".to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(DsmError::Protocol(format!(
            "outgoing frame too large: {} bytes",
            body.len()
        )));
    }
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, to: ProcId, msg: WireMessage) -> Result<()> {
        let writer = {
            let peers = self.peers.read();
            peers
                .get(&to)
                .cloned()
                .ok_or_else(|| DsmError::UnknownEndpoint(format!("process {to}")))?
        };
        let mut guard = writer.lock().await;
        write_frame(&mut *guard, &msg).await
    }

    async fn recv(&self) -> Result<(ProcId, WireMessage)> {
        self.inbox_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| DsmError::TransportClosed("local inbox closed".to_string()))
    }

    fn my_id(&self) -> ProcId {
        self.my_id
    }
}
