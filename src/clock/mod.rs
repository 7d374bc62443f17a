//! Vector clocks: the partial order that every consistency decision in this
//! crate is ultimately reduced to. No wall-clock time is ever consulted.

use serde::{Deserialize, Serialize};

/// A process identifier. 1-based to match the wire protocol's process
/// numbering (process 1 is always the arbiter host).
pub type ProcId = u32;

/// One slot per process, 1-indexed. Slot 0 is unused but kept so a
/// `ProcId` indexes directly without a subtraction at every call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct VectorClock {
    slots: Vec<u64>,
}

impl VectorClock {
    /// A zeroed clock sized for `num_procs` processes (plus the unused slot 0).
    pub fn zero(num_procs: usize) -> Self {
        Self {
            slots: vec![0; num_procs + 1],
        }
    }

    pub fn num_procs(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn get(&self, proc: ProcId) -> u64 {
        self.slots[proc as usize]
    }

    /// Bump this process's own slot and return the new value.
    pub fn increment(&mut self, proc: ProcId) -> u64 {
        let slot = &mut self.slots[proc as usize];
        *slot += 1;
        *slot
    }

    /// Element-wise max, in place.
    pub fn merge(&mut self, other: &VectorClock) {
        debug_assert_eq!(self.slots.len(), other.slots.len());
        for (a, b) in self.slots.iter_mut().zip(other.slots.iter()) {
            if *b > *a {
                *a = *b;
            }
        }
    }

    /// `self <= other`: every slot of self is no greater than other's.
    pub fn happens_before_or_eq(&self, other: &VectorClock) -> bool {
        self.slots.iter().zip(other.slots.iter()).all(|(a, b)| a <= b)
    }

    /// Strict happens-before: `self <= other` and `self != other`.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        self.happens_before_or_eq(other) && self != other
    }

    /// Neither clock strictly precedes the other.
    pub fn concurrent_with(&self, other: &VectorClock) -> bool {
        !self.happens_before_or_eq(other) && !other.happens_before_or_eq(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_clock_is_equal_and_not_before_itself() {
        let a = VectorClock::zero(3);
        let b = VectorClock::zero(3);
        assert_eq!(a, b);
        assert!(!a.happens_before(&b));
        assert!(a.happens_before_or_eq(&b));
    }

    #[test]
    fn increment_advances_only_own_slot() {
        let mut a = VectorClock::zero(3);
        a.increment(1);
        assert_eq!(a.get(1), 1);
        assert_eq!(a.get(2), 0);
    }

    #[test]
    fn merge_takes_elementwise_max() {
        let mut a = VectorClock::zero(2);
        a.increment(1);
        let mut b = VectorClock::zero(2);
        b.increment(2);
        b.increment(2);
        a.merge(&b);
        assert_eq!(a.get(1), 1);
        assert_eq!(a.get(2), 2);
    }

    #[test]
    fn concurrent_clocks_are_neither_before_the_other() {
        let mut a = VectorClock::zero(2);
        a.increment(1);
        let mut b = VectorClock::zero(2);
        b.increment(2);
        assert!(a.concurrent_with(&b));
        assert!(!a.happens_before(&b));
        assert!(!b.happens_before(&a));
    }

    #[test]
    fn strict_happens_before_excludes_equality() {
        let mut a = VectorClock::zero(2);
        a.increment(1);
        let mut b = a.clone();
        assert!(!a.happens_before(&b));
        b.increment(1);
        assert!(a.happens_before(&b));
    }
}
