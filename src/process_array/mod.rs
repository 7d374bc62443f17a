//! Per-process interval history: component E. Each process's intervals are
//! kept newest-first; queries answer "what has process P done that I, at
//! vector clock `ts`, have not yet seen".

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::clock::{ProcId, VectorClock};
use crate::memory::PageNr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalRecord {
    pub vc: VectorClock,
    pub write_notices: Vec<PageNr>,
}

pub struct ProcessArray {
    // index 0 unused, matches 1-based ProcId
    histories: RwLock<Vec<Vec<IntervalRecord>>>,
}

impl ProcessArray {
    pub fn new(num_procs: usize) -> Self {
        Self {
            histories: RwLock::new(vec![Vec::new(); num_procs + 1]),
        }
    }

    pub fn prepend_interval(&self, proc: ProcId, record: IntervalRecord) {
        self.histories.write()[proc as usize].insert(0, record);
    }

    /// Every interval of `proc` strictly newer than `ts`, newest-first.
    pub fn unseen_intervals_at(&self, proc: ProcId, ts: &VectorClock) -> Vec<IntervalRecord> {
        let histories = self.histories.read();
        let mut out = Vec::new();
        for record in &histories[proc as usize] {
            if record.vc.happens_before_or_eq(ts) {
                break;
            }
            out.push(record.clone());
        }
        out
    }

    /// Concatenation of `unseen_intervals_at` across every process.
    pub fn all_unseen_intervals(&self, ts: &VectorClock) -> Vec<(ProcId, IntervalRecord)> {
        let num_procs = self.histories.read().len() - 1;
        let mut out = Vec::new();
        for proc in 1..=num_procs as ProcId {
            for record in self.unseen_intervals_at(proc, ts) {
                out.push((proc, record));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vc_with(num_procs: usize, bumps: &[ProcId]) -> VectorClock {
        let mut vc = VectorClock::zero(num_procs);
        for &p in bumps {
            vc.increment(p);
        }
        vc
    }

    #[test]
    fn unseen_intervals_stop_at_first_already_seen_record() {
        let pa = ProcessArray::new(2);
        let old = vc_with(2, &[1]);
        let mid = vc_with(2, &[1, 1]);
        let new = vc_with(2, &[1, 1, 1]);

        pa.prepend_interval(1, IntervalRecord { vc: old.clone(), write_notices: vec![0] });
        pa.prepend_interval(1, IntervalRecord { vc: mid.clone(), write_notices: vec![1] });
        pa.prepend_interval(1, IntervalRecord { vc: new.clone(), write_notices: vec![2] });

        let unseen = pa.unseen_intervals_at(1, &old);
        assert_eq!(unseen.len(), 2);
        assert_eq!(unseen[0].vc, new);
        assert_eq!(unseen[1].vc, mid);
    }

    #[test]
    fn no_history_yields_no_unseen_intervals() {
        let pa = ProcessArray::new(2);
        let ts = VectorClock::zero(2);
        assert!(pa.unseen_intervals_at(1, &ts).is_empty());
    }
}
