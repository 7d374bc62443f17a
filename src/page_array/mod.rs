//! Per-page coherence state: component D. Keyed by page number; the whole
//! map is guarded only for growth, each entry serializes its own mutation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::clock::{ProcId, VectorClock};
use crate::diff::Diff;
use crate::memory::PageNr;

#[derive(Debug, Clone)]
pub struct WriteNoticeRecord {
    /// Denormalized copy of the owning interval's VC: sufficient for the
    /// ordering decisions this record is ever consulted for, and avoids a
    /// self-referential back-pointer into the process array.
    pub interval_vc: VectorClock,
    pub producer: ProcId,
    pub diff: Option<Diff>,
}

#[derive(Default)]
pub struct PageArrayEntry {
    pub copyset: HashSet<ProcId>,
    pub has_copy: bool,
    // index 0 unused, matches 1-based ProcId
    write_notices: Vec<Vec<WriteNoticeRecord>>,
}

impl PageArrayEntry {
    fn new(num_procs: usize) -> Self {
        Self {
            copyset: HashSet::new(),
            has_copy: false,
            write_notices: vec![Vec::new(); num_procs + 1],
        }
    }

    /// Newest-first write notices authored by `producer` on this page.
    pub fn write_notices_of(&self, producer: ProcId) -> &[WriteNoticeRecord] {
        &self.write_notices[producer as usize]
    }

    pub fn prepend_write_notice(&mut self, producer: ProcId, record: WriteNoticeRecord) {
        self.write_notices[producer as usize].insert(0, record);
    }

    /// Fill in the `diff` of the existing placeholder record for
    /// `(producer, interval_vc)` left by interval incorporation. Returns
    /// `false` if no such placeholder exists, in which case the caller has
    /// nothing to do: a list can never hold two records for the same
    /// interval VC without breaking the strict descending order invariant,
    /// so a missing placeholder means the diff is stale or already applied.
    pub fn fill_diff(&mut self, producer: ProcId, interval_vc: &VectorClock, diff: Diff) -> bool {
        self.write_notices[producer as usize]
            .iter_mut()
            .find(|record| &record.interval_vc == interval_vc && record.diff.is_none())
            .map(|record| record.diff = Some(diff))
            .is_some()
    }

    /// All write-notice records across every producer, most recent per
    /// producer first, producers in ascending id order.
    pub fn all_write_notices(&self) -> Vec<WriteNoticeRecord> {
        self.write_notices
            .iter()
            .flat_map(|list| list.iter().cloned())
            .collect()
    }

    pub fn has_missing_diff(&self) -> bool {
        self.write_notices
            .iter()
            .flatten()
            .any(|record| record.diff.is_none())
    }
}

pub struct PageArray {
    entries: RwLock<HashMap<PageNr, Arc<Mutex<PageArrayEntry>>>>,
    num_procs: usize,
}

impl PageArray {
    pub fn new(num_procs: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            num_procs,
        }
    }

    pub fn get_or_create(&self, page: PageNr) -> Arc<Mutex<PageArrayEntry>> {
        if let Some(entry) = self.entries.read().get(&page) {
            return entry.clone();
        }
        self.entries
            .write()
            .entry(page)
            .or_insert_with(|| Arc::new(Mutex::new(PageArrayEntry::new(self.num_procs))))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_notice_head_has_highest_vc_of_producers_list() {
        let pa = PageArray::new(2);
        let entry = pa.get_or_create(0);
        let mut vc1 = VectorClock::zero(2);
        vc1.increment(1);
        let mut vc2 = vc1.clone();
        vc2.increment(1);

        let mut guard = entry.lock();
        guard.prepend_write_notice(1, WriteNoticeRecord { interval_vc: vc1.clone(), producer: 1, diff: None });
        guard.prepend_write_notice(1, WriteNoticeRecord { interval_vc: vc2.clone(), producer: 1, diff: None });

        let list = guard.write_notices_of(1);
        assert_eq!(list[0].interval_vc, vc2);
        assert!(vc1.happens_before(&list[0].interval_vc));
    }

    #[test]
    fn fresh_entry_has_no_missing_diff() {
        let pa = PageArray::new(2);
        let entry = pa.get_or_create(5);
        assert!(!entry.lock().has_missing_diff());
    }

    #[test]
    fn get_or_create_returns_same_entry_on_repeated_calls() {
        let pa = PageArray::new(2);
        let a = pa.get_or_create(1);
        let b = pa.get_or_create(1);
        a.lock().has_copy = true;
        assert!(b.lock().has_copy);
    }
}
