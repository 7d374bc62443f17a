//! Centralized lock/barrier arbiter: component G. Runs co-located with
//! process 1; a single point of failure by design (see Non-goals).
//!
//! Arbiter methods are deliberately synchronous and transport-free: they
//! take a request and return the list of outgoing messages the host's
//! dispatch loop should send. Keeping the network boundary out of this
//! type makes the hand-off and barrier-rendezvous logic trivial to test in
//! isolation.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::clock::{ProcId, VectorClock};
use crate::transport::{BarrierId, EventId, LockId, WireInterval, WireMessage};

struct LockState {
    holder: Option<ProcId>,
    /// 0 means never held.
    last_owner: ProcId,
    waiters: VecDeque<Waiter>,
}

struct Waiter {
    requester: ProcId,
    vc: VectorClock,
    event_id: EventId,
}

impl Default for LockState {
    fn default() -> Self {
        Self {
            holder: None,
            last_owner: 0,
            waiters: VecDeque::new(),
        }
    }
}

#[derive(Default)]
struct BarrierState {
    arrived: Vec<(ProcId, VectorClock, Vec<WireInterval>, EventId)>,
}

struct Allocator {
    cursor: u64,
    capacity: u64,
    page_size: u64,
    free_list: Vec<(u64, u64)>,
}

pub struct LockBarrierArbiter {
    num_procs: usize,
    locks: Mutex<HashMap<LockId, LockState>>,
    barriers: Mutex<HashMap<BarrierId, BarrierState>>,
    allocator: Mutex<Allocator>,
}

impl LockBarrierArbiter {
    pub fn new(num_procs: usize, memory_size: u64, page_size: u64) -> Self {
        Self {
            num_procs,
            locks: Mutex::new(HashMap::new()),
            barriers: Mutex::new(HashMap::new()),
            allocator: Mutex::new(Allocator {
                cursor: 0,
                capacity: memory_size,
                page_size,
                free_list: Vec::new(),
            }),
        }
    }

    /// `LockAcquireRequest` arrives at the arbiter. Returns the messages to
    /// send: either a direct empty-interval grant (lock never held before)
    /// or a hand-off to the last owner, who replies to the requester itself.
    pub fn acquire(
        &self,
        lock_id: LockId,
        requester: ProcId,
        vc: VectorClock,
        event_id: EventId,
    ) -> Vec<(ProcId, WireMessage)> {
        let mut locks = self.locks.lock();
        let state = locks.entry(lock_id).or_default();

        if state.holder.is_some() {
            state.waiters.push_back(Waiter { requester, vc, event_id });
            return Vec::new();
        }

        state.holder = Some(requester);
        if state.last_owner == 0 {
            vec![(
                requester,
                WireMessage::LockAcquireResponse {
                    vc,
                    intervals: Vec::new(),
                    event_id,
                },
            )]
        } else {
            vec![(
                state.last_owner,
                WireMessage::LockHandoff {
                    lock_id,
                    requester,
                    requester_vc: vc,
                    event_id,
                },
            )]
        }
    }

    /// `LockRelease` arrives at the arbiter: record the releaser as the new
    /// last owner and grant the next waiter, if any.
    pub fn release(&self, lock_id: LockId, releaser: ProcId) -> Vec<(ProcId, WireMessage)> {
        let mut locks = self.locks.lock();
        let state = locks.entry(lock_id).or_default();

        if state.holder != Some(releaser) {
            return Vec::new();
        }
        state.holder = None;
        state.last_owner = releaser;

        if let Some(waiter) = state.waiters.pop_front() {
            state.holder = Some(waiter.requester);
            vec![(
                state.last_owner,
                WireMessage::LockHandoff {
                    lock_id,
                    requester: waiter.requester,
                    requester_vc: waiter.vc,
                    event_id: waiter.event_id,
                },
            )]
        } else {
            Vec::new()
        }
    }

    /// `BarrierRequest` arrives at the arbiter; once every process has
    /// checked in, broadcast the union of vector clocks and intervals to
    /// all of them and reset this barrier for its next round.
    pub fn barrier(
        &self,
        barrier_id: BarrierId,
        from: ProcId,
        vc: VectorClock,
        intervals: Vec<WireInterval>,
        event_id: EventId,
    ) -> Vec<(ProcId, WireMessage)> {
        let mut barriers = self.barriers.lock();
        let state = barriers.entry(barrier_id).or_default();
        state.arrived.push((from, vc, intervals, event_id));

        if state.arrived.len() < self.num_procs {
            return Vec::new();
        }

        let state = barriers.remove(&barrier_id).unwrap();
        let mut union_vc = VectorClock::zero(self.num_procs);
        let mut union_intervals = Vec::new();
        for (_, vc, intervals, _) in &state.arrived {
            union_vc.merge(vc);
            union_intervals.extend(intervals.iter().cloned());
        }

        state
            .arrived
            .into_iter()
            .map(|(proc, _, _, event_id)| {
                (
                    proc,
                    WireMessage::BarrierResponse {
                        vc: union_vc.clone(),
                        intervals: union_intervals.clone(),
                        event_id,
                    },
                )
            })
            .collect()
    }

    pub fn malloc(&self, from: ProcId, size: u64, event_id: EventId) -> (ProcId, WireMessage) {
        let mut alloc = self.allocator.lock();
        let aligned = size.div_ceil(alloc.page_size) * alloc.page_size;
        let addr = if alloc.cursor + aligned <= alloc.capacity {
            let base = alloc.cursor;
            alloc.cursor += aligned;
            Some(base)
        } else {
            None
        };
        (from, WireMessage::MallocResponse { addr, event_id })
    }

    pub fn free(&self, from: ProcId, addr: u64, size: u64, event_id: EventId) -> (ProcId, WireMessage) {
        self.allocator.lock().free_list.push((addr, size));
        (from, WireMessage::FreeResponse { ok: true, event_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vc(num_procs: usize) -> VectorClock {
        VectorClock::zero(num_procs)
    }

    #[test]
    fn first_acquire_on_a_fresh_lock_grants_immediately() {
        let arbiter = LockBarrierArbiter::new(2, 1024, 8);
        let msgs = arbiter.acquire(0, 1, vc(2), 100);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0].1, WireMessage::LockAcquireResponse { .. }));
        assert_eq!(msgs[0].0, 1);
    }

    #[test]
    fn second_acquire_forwards_as_handoff_to_last_owner() {
        let arbiter = LockBarrierArbiter::new(3, 1024, 8);
        arbiter.acquire(0, 1, vc(3), 1);
        arbiter.release(0, 1);
        let msgs = arbiter.acquire(0, 2, vc(3), 2);
        assert_eq!(msgs.len(), 1);
        match &msgs[0].1 {
            WireMessage::LockHandoff { requester, .. } => assert_eq!(*requester, 2),
            other => panic!("expected handoff, got {other:?}"),
        }
        assert_eq!(msgs[0].0, 1); // sent to last owner, process 1
    }

    #[test]
    fn waiter_is_queued_while_lock_is_held() {
        let arbiter = LockBarrierArbiter::new(3, 1024, 8);
        arbiter.acquire(0, 1, vc(3), 1);
        let msgs = arbiter.acquire(0, 2, vc(3), 2);
        assert!(msgs.is_empty());

        let release_msgs = arbiter.release(0, 1);
        assert_eq!(release_msgs.len(), 1);
        match &release_msgs[0].1 {
            WireMessage::LockHandoff { requester, .. } => assert_eq!(*requester, 2),
            other => panic!("expected handoff, got {other:?}"),
        }
    }

    #[test]
    fn barrier_broadcasts_only_once_everyone_has_arrived() {
        let arbiter = LockBarrierArbiter::new(2, 1024, 8);
        let mut vc1 = vc(2);
        vc1.increment(1);
        assert!(arbiter.barrier(0, 1, vc1.clone(), vec![], 10).is_empty());

        let mut vc2 = vc(2);
        vc2.increment(2);
        let msgs = arbiter.barrier(0, 2, vc2, vec![], 20);
        assert_eq!(msgs.len(), 2);
        for (_, msg) in &msgs {
            match msg {
                WireMessage::BarrierResponse { vc, .. } => {
                    assert_eq!(vc.get(1), 1);
                    assert_eq!(vc.get(2), 1);
                }
                other => panic!("expected barrier response, got {other:?}"),
            }
        }
    }

    #[test]
    fn malloc_returns_page_aligned_bump_allocations() {
        let arbiter = LockBarrierArbiter::new(1, 64, 8);
        let (_, msg) = arbiter.malloc(1, 3, 1);
        assert!(matches!(msg, WireMessage::MallocResponse { addr: Some(0), .. }));
        let (_, msg2) = arbiter.malloc(1, 8, 2);
        assert!(matches!(msg2, WireMessage::MallocResponse { addr: Some(8), .. }));
    }

    #[test]
    fn malloc_past_capacity_fails() {
        let arbiter = LockBarrierArbiter::new(1, 16, 8);
        let (_, msg) = arbiter.malloc(1, 100, 1);
        assert!(matches!(msg, WireMessage::MallocResponse { addr: None, .. }));
    }
}
