//! The lazy consistency engine: component F. Answers access-rights faults,
//! manages twins, and runs the diff-fetch protocol that brings a stale or
//! missing page back up to date.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::clock::{ProcId, VectorClock};
use crate::diff::{self, Diff};
use crate::error::{DsmError, Result};
use crate::memory::{AccessRights, FaultKind, FaultListener, PageNr, VirtualMemory};
use crate::page_array::{PageArray, WriteNoticeRecord};
use crate::process_array::{IntervalRecord, ProcessArray};
use crate::transport::{Transport, WireInterval, WireMessage};

/// Everything the engine needs to talk to the network and correlate
/// blocking calls, shared with the host so neither holds a back-reference
/// to the other.
pub struct Shared {
    pub transport: Arc<dyn Transport>,
    pub my_id: ProcId,
    pub num_procs: usize,
    next_event_id: std::sync::atomic::AtomicU64,
    pending: Mutex<HashMap<u64, tokio::sync::oneshot::Sender<WireMessage>>>,
}

impl Shared {
    pub fn new(transport: Arc<dyn Transport>, num_procs: usize) -> Arc<Self> {
        let my_id = transport.my_id();
        Arc::new(Self {
            transport,
            my_id,
            num_procs,
            next_event_id: std::sync::atomic::AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn new_event_id(&self) -> u64 {
        self.next_event_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    /// Send `msg` to `to` and block until a message bearing `event_id`
    /// arrives back, or the call times out.
    pub async fn call(&self, to: ProcId, event_id: u64, msg: WireMessage) -> Result<WireMessage> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending.lock().insert(event_id, tx);
        if let Err(e) = self.transport.send(to, msg).await {
            self.pending.lock().remove(&event_id);
            return Err(e);
        }
        match tokio::time::timeout(std::time::Duration::from_secs(30), rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(DsmError::TransportClosed(format!(
                "call to process {to} dropped before reply"
            ))),
            Err(_) => {
                self.pending.lock().remove(&event_id);
                Err(DsmError::Timeout(format!("call to process {to}")))
            }
        }
    }

    /// Complete a pending call if `msg` is a reply bearing a matching event
    /// id; returns `true` if it did. Request-shaped variants never match
    /// here even when self-addressed, so a process calling its own arbiter
    /// falls through to request handling instead of being handed its own
    /// outbound request back as if it were the answer.
    pub fn complete(&self, msg: &WireMessage) -> bool {
        if let Some(event_id) = msg.reply_event_id() {
            if let Some(tx) = self.pending.lock().remove(&event_id) {
                let _ = tx.send(msg.clone());
                return true;
            }
        }
        false
    }
}

pub struct ConsistencyEngine {
    vm: Arc<VirtualMemory>,
    page_array: PageArray,
    process_array: ProcessArray,
    twins: Mutex<HashMap<PageNr, Vec<u8>>>,
    my_vc: Mutex<VectorClock>,
    my_id: ProcId,
    num_procs: usize,
    shared: Arc<Shared>,
}

impl ConsistencyEngine {
    pub fn new(vm: Arc<VirtualMemory>, shared: Arc<Shared>, num_procs: usize) -> Arc<Self> {
        Arc::new(Self {
            vm,
            page_array: PageArray::new(num_procs),
            process_array: ProcessArray::new(num_procs),
            twins: Mutex::new(HashMap::new()),
            my_vc: Mutex::new(VectorClock::zero(num_procs)),
            my_id: shared.my_id,
            num_procs,
            shared,
        })
    }

    pub fn vc(&self) -> VectorClock {
        self.my_vc.lock().clone()
    }

    pub fn merge_vc(&self, other: &VectorClock) {
        self.my_vc.lock().merge(other);
    }

    /// Flush every live twin into a diff and a new interval, incrementing
    /// this process's own clock slot exactly once. Used at barrier exit.
    pub fn flush_all_twins_and_bump(&self) -> (VectorClock, Vec<PageNr>) {
        let mut twins = self.twins.lock();
        if twins.is_empty() {
            return (self.vc(), Vec::new());
        }
        let new_vc = {
            let mut vc = self.my_vc.lock();
            vc.increment(self.my_id);
            vc.clone()
        };
        let pages: Vec<PageNr> = twins.keys().copied().collect();
        for &page in &pages {
            self.materialize_diff(&mut twins, page, &new_vc);
        }
        self.process_array.prepend_interval(
            self.my_id,
            IntervalRecord {
                vc: new_vc.clone(),
                write_notices: pages.clone(),
            },
        );
        (new_vc, pages)
    }

    /// Force a single page's twin to become a diff, bumping the clock by
    /// one. Used when answering a diff request for a page we still hold
    /// dirty: the requester cannot be handed a diff that does not exist yet.
    fn force_flush_page(&self, page: PageNr) {
        let mut twins = self.twins.lock();
        if !twins.contains_key(&page) {
            return;
        }
        let new_vc = {
            let mut vc = self.my_vc.lock();
            vc.increment(self.my_id);
            vc.clone()
        };
        self.materialize_diff(&mut twins, page, &new_vc);
        self.process_array.prepend_interval(
            self.my_id,
            IntervalRecord {
                vc: new_vc,
                write_notices: vec![page],
            },
        );
    }

    fn materialize_diff(&self, twins: &mut HashMap<PageNr, Vec<u8>>, page: PageNr, vc: &VectorClock) {
        let Some(twin) = twins.remove(&page) else { return };
        let page_size = self.vm.page_size();
        let addr = page as usize * page_size;
        let current = self.vm.privileged_read(addr, page_size).expect("page in bounds");
        let runs = diff::compute(&twin, &current);
        let entry = self.page_array.get_or_create(page);
        entry.lock().prepend_write_notice(
            self.my_id,
            WriteNoticeRecord {
                interval_vc: vc.clone(),
                producer: self.my_id,
                diff: Some(Diff {
                    interval_vc: vc.clone(),
                    producer: self.my_id,
                    runs,
                }),
            },
        );
        // The interval that produced this diff is now closed. Drop back to
        // read-only so the next write re-faults and opens a fresh twin for
        // the next interval, instead of silently mutating this one's bytes
        // with no diff ever recorded for it.
        self.vm.set_rights(page, AccessRights::ReadOnly);
    }

    /// Apply every write notice in a newly-received interval. Intervals
    /// must be incorporated oldest-first so that later, newer intervals end
    /// up at the head of each per-page list.
    pub fn incorporate_interval(&self, producer: ProcId, record: &IntervalRecord) {
        self.process_array.prepend_interval(producer, record.clone());
        for &page in &record.write_notices {
            // If we are mid-write on this page ourselves, our twin's diff
            // must be produced now against the old notice order, before the
            // new remote notice is recorded ahead of it.
            self.force_flush_page(page);

            let entry = self.page_array.get_or_create(page);
            entry.lock().prepend_write_notice(
                producer,
                WriteNoticeRecord {
                    interval_vc: record.vc.clone(),
                    producer,
                    diff: None,
                },
            );
            self.vm.set_rights(page, AccessRights::NoAccess);
        }
    }

    /// Incorporate every interval carried by a lock/barrier response, oldest
    /// first, then merge the response's composite clock into our own.
    /// Intervals this process authored itself are skipped: a barrier or
    /// hand-off response echoes every participant's intervals back,
    /// including the caller's own, which `flush_all_twins_and_bump` has
    /// already recorded locally with its diff materialized.
    pub fn incorporate_received(&self, intervals: &[WireInterval], response_vc: &VectorClock) {
        for wi in intervals.iter().rev() {
            if wi.proc == self.my_id {
                continue;
            }
            self.incorporate_interval(
                wi.proc,
                &IntervalRecord {
                    vc: wi.vc.clone(),
                    write_notices: wi.write_notices.clone(),
                },
            );
        }
        self.merge_vc(response_vc);
    }

    /// Every interval this process has produced that `since` has not seen
    /// yet, formatted for the wire.
    pub fn unseen_intervals_for_wire(&self, since: &VectorClock) -> Vec<WireInterval> {
        self.process_array
            .all_unseen_intervals(since)
            .into_iter()
            .map(|(proc, record)| WireInterval {
                proc,
                vc: record.vc,
                write_notices: record.write_notices,
            })
            .collect()
    }

    pub fn handle_copy_request(&self, page: PageNr) -> Vec<u8> {
        let page_size = self.vm.page_size();
        self.vm
            .privileged_read(page as usize * page_size, page_size)
            .unwrap_or_else(|_| vec![0u8; page_size])
    }

    pub fn handle_diff_request(&self, page: PageNr, since_vc: &VectorClock) -> Vec<Diff> {
        self.force_flush_page(page);
        let entry = self.page_array.get_or_create(page);
        let guard = entry.lock();
        guard
            .write_notices_of(self.my_id)
            .iter()
            .filter(|record| since_vc.happens_before(&record.interval_vc))
            .filter_map(|record| record.diff.clone())
            .collect()
    }

    /// Record diffs returned by a `DiffResponse` against their matching
    /// write-notice placeholders left by interval incorporation, then
    /// replay every known diff for the page in canonical order onto the
    /// current local bytes.
    fn apply_fetched_diffs(&self, page: PageNr, fetched: Vec<Diff>) -> Result<()> {
        let entry = self.page_array.get_or_create(page);
        {
            let mut guard = entry.lock();
            for diff in fetched {
                let producer = diff.producer;
                let interval_vc = diff.interval_vc.clone();
                guard.fill_diff(producer, &interval_vc, diff);
            }
        }

        let page_size = self.vm.page_size();
        let addr = page as usize * page_size;
        let mut bytes = self.vm.privileged_read(addr, page_size)?;
        let diffs = entry.lock().all_write_notices().into_iter().filter_map(|r| r.diff).collect();
        for diff in diff::order_diffs(diffs) {
            diff::apply(&mut bytes, &diff.runs);
        }
        self.vm.privileged_write(addr, &bytes)?;
        Ok(())
    }

    async fn reconstruct_page(&self, page: PageNr) -> Result<()> {
        // Ask every producer with a missing diff for the run of diffs we
        // are missing from them.
        let targets: Vec<(ProcId, VectorClock)> = {
            let entry = self.page_array.get_or_create(page);
            let guard = entry.lock();
            (1..=self.num_procs as ProcId)
                .filter_map(|producer| {
                    let list = guard.write_notices_of(producer);
                    let missing: Vec<_> = list.iter().take_while(|r| r.diff.is_none()).collect();
                    if missing.is_empty() {
                        None
                    } else {
                        let boundary_idx = missing.len();
                        let since_vc = list
                            .get(boundary_idx)
                            .map(|r| r.interval_vc.clone())
                            .unwrap_or_else(|| VectorClock::zero(self.num_procs));
                        Some((producer, since_vc))
                    }
                })
                .collect()
        };

        for (producer, since_vc) in targets {
            if producer == self.my_id {
                continue;
            }
            let event_id = self.shared.new_event_id();
            let resp = self
                .shared
                .call(
                    producer,
                    event_id,
                    WireMessage::DiffRequest {
                        page,
                        from: self.my_id,
                        since_vc,
                        event_id,
                    },
                )
                .await?;
            match resp {
                WireMessage::DiffResponse { diffs, .. } => self.apply_fetched_diffs(page, diffs)?,
                other => return Err(DsmError::Protocol(format!("expected DiffResponse, got {other:?}"))),
            }
        }
        Ok(())
    }

    /// Prefer a process known to already hold a copy; failing that, ask
    /// whoever has produced a write notice for the page (they hold the
    /// authoritative current bytes, having written it directly); failing
    /// that, the page has never been touched by anyone but process 1.
    fn copy_source(&self, page: PageNr) -> ProcId {
        let entry = self.page_array.get_or_create(page);
        let guard = entry.lock();
        if let Some(&p) = guard.copyset.iter().next() {
            return p;
        }
        guard
            .all_write_notices()
            .into_iter()
            .map(|r| r.producer)
            .next()
            .unwrap_or(1)
    }
}

#[async_trait]
impl FaultListener for ConsistencyEngine {
    async fn on_fault(
        &self,
        vm: &VirtualMemory,
        page: PageNr,
        kind: FaultKind,
        _addr: usize,
        _len: usize,
    ) -> Result<()> {
        let entry = self.page_array.get_or_create(page);
        let (has_copy, distinct_producers) = {
            let guard = entry.lock();
            let producers: std::collections::HashSet<ProcId> =
                guard.all_write_notices().iter().map(|r| r.producer).collect();
            (guard.has_copy, producers)
        };

        if !has_copy {
            if self.my_id == 1 && distinct_producers.is_empty() {
                // Process 1 is the implicit initial owner of a page nobody
                // has ever written: all local memories start zero-
                // initialized identically, so there is nothing to fetch.
                // Once any process has produced a write notice for this
                // page, even process 1 must go through one of the paths
                // below to pick up that data.
                entry.lock().has_copy = true;
                entry.lock().copyset.insert(1);
            } else if distinct_producers.len() <= 1 {
                // Exactly one process has ever written this page (or none,
                // and a copyset member already holds the zero-initial
                // state): its own current bytes are the authoritative whole
                // page, so a single full-page fetch is correct and cheaper
                // than per-producer diff reconstruction.
                let target = self.copy_source(page);
                let event_id = self.shared.new_event_id();
                let resp = self
                    .shared
                    .call(
                        target,
                        event_id,
                        WireMessage::CopyRequest {
                            page,
                            from: self.my_id,
                            event_id,
                        },
                    )
                    .await?;
                match resp {
                    WireMessage::CopyResponse { data, .. } => {
                        let addr = page as usize * vm.page_size();
                        vm.privileged_write(addr, &data)?;
                        let mut guard = entry.lock();
                        guard.has_copy = true;
                        guard.copyset.insert(self.my_id);
                    }
                    other => {
                        return Err(DsmError::Protocol(format!(
                            "expected CopyResponse, got {other:?}"
                        )))
                    }
                }
            } else {
                // Two or more processes have written this page, possibly
                // concurrently with each other: no single process's local
                // copy is guaranteed to be the merge of every diff we
                // already know about. Reconstruct from the zero-initial
                // state by fetching every producer's diffs from scratch.
                {
                    let mut guard = entry.lock();
                    guard.has_copy = true;
                    guard.copyset.insert(self.my_id);
                }
                self.reconstruct_page(page).await?;
            }
        } else if vm.rights(page) == AccessRights::NoAccess {
            self.reconstruct_page(page).await?;
        }

        match kind {
            FaultKind::Read => vm.set_rights(page, AccessRights::ReadOnly),
            FaultKind::Write => {
                if vm.rights(page) != AccessRights::ReadWrite {
                    let mut twins = self.twins.lock();
                    if !twins.contains_key(&page) {
                        let addr = page as usize * vm.page_size();
                        let snapshot = vm.privileged_read(addr, vm.page_size())?;
                        twins.insert(page, snapshot);
                    }
                }
                vm.set_rights(page, AccessRights::ReadWrite);
            }
        }
        Ok(())
    }
}
