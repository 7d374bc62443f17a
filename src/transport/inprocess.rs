//! Loopback transport: a shared registry of channels keyed by process id.
//! Used by every test in this crate and suitable for simulating a whole
//! run inside a single OS process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::clock::ProcId;
use crate::error::{DsmError, Result};

use super::{Transport, WireMessage};

pub struct InProcessHub {
    senders: RwLock<HashMap<ProcId, mpsc::UnboundedSender<(ProcId, WireMessage)>>>,
}

impl InProcessHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            senders: RwLock::new(HashMap::new()),
        })
    }

    /// Register `proc` with the hub and return its endpoint. Registering the
    /// same id twice replaces the previous endpoint's inbox.
    pub fn register(self: &Arc<Self>, proc: ProcId) -> InProcessTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.write().insert(proc, tx);
        InProcessTransport {
            hub: self.clone(),
            my_id: proc,
            rx: AsyncMutex::new(rx),
        }
    }
}

pub struct InProcessTransport {
    hub: Arc<InProcessHub>,
    my_id: ProcId,
    rx: AsyncMutex<mpsc::UnboundedReceiver<(ProcId, WireMessage)>>,
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn send(&self, to: ProcId, msg: WireMessage) -> Result<()> {
        let tx = self
            .hub
            .senders
            .read()
            .get(&to)
            .cloned()
            .ok_or_else(|| DsmError::UnknownEndpoint(format!("process {to}")))?;
        tx.send((self.my_id, msg))
            .map_err(|_| DsmError::TransportClosed(format!("process {to} inbox closed")))
    }

    async fn recv(&self) -> Result<(ProcId, WireMessage)> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| DsmError::TransportClosed(format!("process {} inbox closed", self.my_id)))
    }

    fn my_id(&self) -> ProcId {
        self.my_id
    }
}
