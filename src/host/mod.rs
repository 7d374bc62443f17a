//! Host protocol loop: component H. One loop per process dispatches
//! incoming wire messages, either completing a blocking call this process
//! is waiting on, routing a request to the co-located arbiter (process 1
//! only), or answering a copy/diff request against the local engine.
//! The application-facing read/write/acquire/release/barrier/malloc/free
//! API lives here too.

use std::sync::Arc;

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::arbiter::LockBarrierArbiter;
use crate::clock::ProcId;
use crate::engine::{ConsistencyEngine, Shared};
use crate::error::{DsmError, Result};
use crate::memory::VirtualMemory;
use crate::transport::{LockId, Transport, WireInterval, WireMessage};
use crate::Config;

/// Process 1 is always the arbiter host, by convention fixed at startup.
pub const ARBITER_ID: ProcId = 1;

pub struct Host {
    shared: Arc<Shared>,
    engine: Arc<ConsistencyEngine>,
    vm: Arc<VirtualMemory>,
    arbiter: Option<LockBarrierArbiter>,
    held_locks: Mutex<HashMap<LockId, bool>>,
    my_id: ProcId,
}

impl Host {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Arc<Self> {
        let my_id = transport.my_id();
        let vm = Arc::new(VirtualMemory::new(config.memory_size, config.page_size));
        let shared = Shared::new(transport, config.num_procs as usize);
        let engine = ConsistencyEngine::new(vm.clone(), shared.clone(), config.num_procs as usize);
        vm.add_fault_listener(engine.clone());

        let arbiter = if my_id == ARBITER_ID {
            Some(LockBarrierArbiter::new(
                config.num_procs as usize,
                config.memory_size as u64,
                config.page_size as u64,
            ))
        } else {
            None
        };

        Arc::new(Self {
            shared,
            engine,
            vm,
            arbiter,
            held_locks: Mutex::new(HashMap::new()),
            my_id,
        })
    }

    pub fn my_id(&self) -> ProcId {
        self.my_id
    }

    pub fn memory(&self) -> &Arc<VirtualMemory> {
        &self.vm
    }

    /// Spawn the message dispatch loop. Runs until the transport closes.
    pub fn spawn_dispatch_loop(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match this.shared.transport.recv().await {
                    Ok((from, msg)) => {
                        if let Err(e) = this.clone().handle_incoming(from, msg).await {
                            tracing::error!(error = %e, "dsm host failed to handle message");
                        }
                    }
                    Err(e) => {
                        tracing::info!(error = %e, "dsm transport closed, dispatch loop exiting");
                        break;
                    }
                }
            }
        });
    }

    async fn handle_incoming(self: Arc<Self>, from: ProcId, msg: WireMessage) -> Result<()> {
        if self.shared.complete(&msg) {
            return Ok(());
        }

        match msg {
            WireMessage::Join { from } => {
                tracing::info!(peer = from, "peer joined");
                Ok(())
            }
            WireMessage::Welcome { assigned_id, .. } => {
                tracing::info!(assigned_id, "received welcome");
                Ok(())
            }
            WireMessage::LockAcquireRequest { lock_id, vc, requester, event_id } => {
                self.dispatch_from_arbiter(|a| a.acquire(lock_id, requester, vc, event_id)).await
            }
            WireMessage::LockRelease { lock_id, releaser } => {
                self.dispatch_from_arbiter(|a| a.release(lock_id, releaser)).await
            }
            WireMessage::LockHandoff { lock_id: _, requester, requester_vc, event_id } => {
                let intervals = self.engine.unseen_intervals_for_wire(&requester_vc);
                let mut response_vc = requester_vc;
                response_vc.merge(&self.engine.vc());
                self.shared
                    .transport
                    .send(requester, WireMessage::LockAcquireResponse { vc: response_vc, intervals, event_id })
                    .await
            }
            WireMessage::BarrierRequest { barrier_id, from, vc, intervals, event_id } => {
                self.dispatch_from_arbiter(|a| a.barrier(barrier_id, from, vc, intervals.clone(), event_id))
                    .await
            }
            WireMessage::CopyRequest { page, from, event_id } => {
                let data = self.engine.handle_copy_request(page);
                self.shared.transport.send(from, WireMessage::CopyResponse { page, data, event_id }).await
            }
            WireMessage::DiffRequest { page, from, since_vc, event_id } => {
                let diffs = self.engine.handle_diff_request(page, &since_vc);
                self.shared.transport.send(from, WireMessage::DiffResponse { page, diffs, event_id }).await
            }
            WireMessage::MallocRequest { from, size, event_id } => {
                self.dispatch_from_arbiter(|a| vec![a.malloc(from, size, event_id)]).await
            }
            WireMessage::FreeRequest { from, addr, size, event_id } => {
                self.dispatch_from_arbiter(|a| vec![a.free(from, addr, size, event_id)]).await
            }
            unmatched @ (WireMessage::LockAcquireResponse { .. }
            | WireMessage::BarrierResponse { .. }
            | WireMessage::CopyResponse { .. }
            | WireMessage::DiffResponse { .. }
            | WireMessage::MallocResponse { .. }
            | WireMessage::FreeResponse { .. }) => {
                tracing::warn!(?unmatched, from, "dropped response with no matching waiter");
                Ok(())
            }
        }
    }

    async fn dispatch_from_arbiter(
        &self,
        f: impl FnOnce(&LockBarrierArbiter) -> Vec<(ProcId, WireMessage)>,
    ) -> Result<()> {
        let Some(arbiter) = &self.arbiter else {
            return Err(DsmError::Protocol(
                "received arbiter-only request on a non-arbiter host".to_string(),
            ));
        };
        for (to, msg) in f(arbiter) {
            self.shared.transport.send(to, msg).await?;
        }
        Ok(())
    }

    pub async fn startup(&self) -> Result<()> {
        tracing::info!(my_id = self.my_id, "dsm host starting up");
        Ok(())
    }

    pub async fn join(&self) -> Result<()> {
        self.shared
            .transport
            .send(ARBITER_ID, WireMessage::Join { from: self.my_id })
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(my_id = self.my_id, "dsm host shutting down");
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.shutdown().await
    }

    pub async fn read(&self, addr: usize) -> Result<u8> {
        self.vm.read(addr).await
    }

    pub async fn write(&self, addr: usize, value: u8) -> Result<()> {
        self.vm.write(addr, value).await
    }

    pub async fn read_bytes(&self, addr: usize, len: usize) -> Result<Vec<u8>> {
        self.vm.read_bytes(addr, len).await
    }

    pub async fn write_bytes(&self, addr: usize, bytes: &[u8]) -> Result<()> {
        self.vm.write_bytes(addr, bytes).await
    }

    pub async fn acquire(&self, lock_id: LockId) -> Result<()> {
        if *self.held_locks.lock().get(&lock_id).unwrap_or(&false) {
            return Ok(());
        }
        let event_id = self.shared.new_event_id();
        let vc = self.engine.vc();
        let resp = self
            .shared
            .call(
                ARBITER_ID,
                event_id,
                WireMessage::LockAcquireRequest { lock_id, vc, requester: self.my_id, event_id },
            )
            .await?;
        match resp {
            WireMessage::LockAcquireResponse { vc, intervals, .. } => {
                self.engine.incorporate_received(&intervals, &vc);
                self.held_locks.lock().insert(lock_id, true);
                Ok(())
            }
            other => Err(DsmError::Protocol(format!("expected LockAcquireResponse, got {other:?}"))),
        }
    }

    pub async fn release(&self, lock_id: LockId) -> Result<()> {
        if !*self.held_locks.lock().get(&lock_id).unwrap_or(&false) {
            return Err(DsmError::LockNotHeld(lock_id));
        }
        self.held_locks.lock().insert(lock_id, false);
        // Flush any twins taken while holding this lock into write notices
        // now, so that a future hand-off to whoever acquires next finds
        // them already recorded in our process array.
        self.engine.flush_all_twins_and_bump();
        self.shared
            .transport
            .send(ARBITER_ID, WireMessage::LockRelease { lock_id, releaser: self.my_id })
            .await
    }

    pub async fn barrier(&self, barrier_id: crate::transport::BarrierId) -> Result<()> {
        let (new_vc, pages) = self.engine.flush_all_twins_and_bump();
        let intervals = if pages.is_empty() {
            Vec::new()
        } else {
            vec![WireInterval { proc: self.my_id, vc: new_vc.clone(), write_notices: pages }]
        };
        let event_id = self.shared.new_event_id();
        let resp = self
            .shared
            .call(
                ARBITER_ID,
                event_id,
                WireMessage::BarrierRequest {
                    barrier_id,
                    from: self.my_id,
                    vc: new_vc,
                    intervals,
                    event_id,
                },
            )
            .await?;
        match resp {
            WireMessage::BarrierResponse { vc, intervals, .. } => {
                self.engine.incorporate_received(&intervals, &vc);
                Ok(())
            }
            other => Err(DsmError::Protocol(format!("expected BarrierResponse, got {other:?}"))),
        }
    }

    pub async fn malloc(&self, size: u64) -> Result<u64> {
        let event_id = self.shared.new_event_id();
        let resp = self
            .shared
            .call(ARBITER_ID, event_id, WireMessage::MallocRequest { from: self.my_id, size, event_id })
            .await?;
        match resp {
            WireMessage::MallocResponse { addr: Some(addr), .. } => Ok(addr),
            WireMessage::MallocResponse { addr: None, .. } => {
                Err(DsmError::OutOfMemory { requested: size as usize, available: 0 })
            }
            other => Err(DsmError::Protocol(format!("expected MallocResponse, got {other:?}"))),
        }
    }

    pub async fn free(&self, addr: u64, size: u64) -> Result<()> {
        let event_id = self.shared.new_event_id();
        let resp = self
            .shared
            .call(ARBITER_ID, event_id, WireMessage::FreeRequest { from: self.my_id, addr, size, event_id })
            .await?;
        match resp {
            WireMessage::FreeResponse { ok: true, .. } => Ok(()),
            WireMessage::FreeResponse { ok: false, .. } => Err(DsmError::UnknownRegion(addr as usize)),
            other => Err(DsmError::Protocol(format!("expected FreeResponse, got {other:?}"))),
        }
    }
}
