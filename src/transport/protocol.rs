//! Wire types exchanged between hosts. Delivery is assumed reliable and
//! FIFO between any ordered pair of endpoints; a transport failure is
//! treated as fatal, never retried at this layer.

use serde::{Deserialize, Serialize};

use crate::clock::{ProcId, VectorClock};
use crate::diff::Diff;
use crate::memory::PageNr;

pub type EventId = u64;
pub type LockId = u32;
pub type BarrierId = u32;

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct WireInterval {
    pub proc: ProcId,
    pub vc: VectorClock,
    pub write_notices: Vec<PageNr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum WireMessage {
    Welcome {
        assigned_id: ProcId,
        num_procs: u32,
    },
    Join {
        from: ProcId,
    },

    LockAcquireRequest {
        lock_id: LockId,
        vc: VectorClock,
        requester: ProcId,
        event_id: EventId,
    },
    LockAcquireResponse {
        vc: VectorClock,
        intervals: Vec<WireInterval>,
        event_id: EventId,
    },
    LockRelease {
        lock_id: LockId,
        releaser: ProcId,
    },
    /// Arbiter -> last owner: a typed hand-off carrying the requester's
    /// identity and VC, since a network boundary can't re-address an
    /// in-memory request the way a single-process implementation would.
    LockHandoff {
        lock_id: LockId,
        requester: ProcId,
        requester_vc: VectorClock,
        event_id: EventId,
    },

    BarrierRequest {
        barrier_id: BarrierId,
        from: ProcId,
        vc: VectorClock,
        intervals: Vec<WireInterval>,
        event_id: EventId,
    },
    BarrierResponse {
        vc: VectorClock,
        intervals: Vec<WireInterval>,
        event_id: EventId,
    },

    CopyRequest {
        page: PageNr,
        from: ProcId,
        event_id: EventId,
    },
    CopyResponse {
        page: PageNr,
        data: Vec<u8>,
        event_id: EventId,
    },

    DiffRequest {
        page: PageNr,
        from: ProcId,
        since_vc: VectorClock,
        event_id: EventId,
    },
    DiffResponse {
        page: PageNr,
        diffs: Vec<Diff>,
        event_id: EventId,
    },

    MallocRequest {
        from: ProcId,
        size: u64,
        event_id: EventId,
    },
    MallocResponse {
        addr: Option<u64>,
        event_id: EventId,
    },
    FreeRequest {
        from: ProcId,
        addr: u64,
        size: u64,
        event_id: EventId,
    },
    FreeResponse {
        ok: bool,
        event_id: EventId,
    },
}

impl WireMessage {
    /// The correlation id a blocking `Shared::call` waiter is listening for,
    /// present only on reply-shaped variants. Request-shaped variants
    /// (`LockAcquireRequest`, `BarrierRequest`, `CopyRequest`, `DiffRequest`,
    /// `MallocRequest`, `FreeRequest`, `LockHandoff`) carry an `event_id` of
    /// their own too, but it identifies the call they will eventually
    /// *complete*, not one they complete themselves — a self-addressed
    /// arbiter request (process 1 calling itself) must fall through to
    /// request handling rather than being mistaken for its own reply.
    pub fn reply_event_id(&self) -> Option<EventId> {
        use WireMessage::*;
        match self {
            LockAcquireResponse { event_id, .. }
            | BarrierResponse { event_id, .. }
            | CopyResponse { event_id, .. }
            | DiffResponse { event_id, .. }
            | MallocResponse { event_id, .. }
            | FreeResponse { event_id, .. } => Some(*event_id),
            LockAcquireRequest { .. }
            | LockHandoff { .. }
            | BarrierRequest { .. }
            | CopyRequest { .. }
            | DiffRequest { .. }
            | MallocRequest { .. }
            | FreeRequest { .. }
            | Welcome { .. }
            | Join { .. }
            | LockRelease { .. } => None,
        }
    }
}
