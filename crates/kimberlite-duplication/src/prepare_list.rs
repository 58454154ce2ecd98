//! Bounded, decree-ordered reassembly window backing [`crate::batch::MutationBatch`].
//!
//! Mirrors the `prepare_list` used by `mutation_batch`/`mutation_duplicator`
//! in the source system: a sliding window of at most `capacity` outstanding
//! decrees that admits mutations out of order and exposes the dense
//! committed prefix once it forms.

use std::collections::BTreeMap;

use crate::error::{DuplicationError, Result};
use crate::types::{Decree, Mutation};

/// A sliding window over decrees `[start_decree, start_decree + capacity)`.
///
/// Not thread-safe — owned exclusively by one [`crate::batch::MutationBatch`].
#[derive(Debug)]
pub struct PrepareList {
    capacity: usize,
    start_decree: Decree,
    window: BTreeMap<Decree, Mutation>,
}

impl PrepareList {
    /// Creates a new window starting at `start_decree` with the given
    /// capacity (200 per the design doc's `PREPARE_LIST_CAPACITY`).
    pub fn new(start_decree: Decree, capacity: usize) -> Self {
        Self {
            capacity,
            start_decree,
            window: BTreeMap::new(),
        }
    }

    /// The next decree this window expects to commit.
    pub fn start_decree(&self) -> Decree {
        self.start_decree
    }

    /// Number of mutations currently buffered (not yet part of a committed
    /// prefix).
    pub fn count(&self) -> usize {
        self.window.len()
    }

    /// Admits `mu` into its decree slot.
    ///
    /// # Errors
    ///
    /// Returns [`DuplicationError::InvalidData`] if `mu`'s decree is stale
    /// (already committed out from under this window) or already occupied
    /// by another mutation (a duplicate decree).
    ///
    /// # Panics
    ///
    /// Panics if the window is at capacity and `mu`'s decree would need a
    /// new slot beyond it — this is flow-control violation by the upstream
    /// producer and is fatal by design (see design doc's invariants).
    pub fn prepare(&mut self, mu: Mutation) -> Result<()> {
        if mu.decree < self.start_decree {
            return Err(DuplicationError::InvalidData(format!(
                "decree {} is stale, window already advanced past it to {}",
                mu.decree, self.start_decree
            )));
        }

        if self.window.contains_key(&mu.decree) {
            return Err(DuplicationError::InvalidData(format!(
                "duplicate decree {} already present in prepare-list window",
                mu.decree
            )));
        }

        let offset = (mu.decree.get() - self.start_decree.get()) as usize;
        assert!(
            offset < self.capacity || self.window.len() < self.capacity,
            "prepare-list has reached capacity {} at decree {}: upstream producer violated flow control",
            self.capacity,
            mu.decree
        );

        self.window.insert(mu.decree, mu);
        Ok(())
    }

    /// Removes and returns the dense committed prefix starting at
    /// `start_decree`, advancing the window past it. Mutations are returned
    /// in strictly increasing decree order with no gaps.
    pub fn drain_committed_prefix(&mut self) -> Vec<Mutation> {
        let mut committed = Vec::new();
        while let Some(mu) = self.window.remove(&self.start_decree) {
            self.start_decree = self.start_decree.next();
            committed.push(mu);
        }
        committed
    }
}


#[cfg(test)]
mod properties {
    use super::*;
    use crate::types::Ballot;
    use proptest::prelude::*;

    fn mutation(decree: i64) -> Mutation {
        Mutation::new(Decree::from(decree), Ballot::new(1), Vec::new())
    }

    /// Reorders `1..=keys.len()` by sorting against arbitrary sort keys —
    /// a permutation generator without pulling in a shuffle dependency.
    fn permutation_of(keys: Vec<u32>) -> Vec<i64> {
        let mut indexed: Vec<(u32, i64)> = keys.into_iter().zip(1i64..).collect();
        indexed.sort_by_key(|(key, _)| *key);
        indexed.into_iter().map(|(_, decree)| decree).collect()
    }

    proptest! {
        /// However a dense run of decrees arrives, the window only ever
        /// exposes it back as a strictly increasing, gap-free prefix —
        /// the invariant `prepare_list.h`'s `mutation_batch` relies on to
        /// turn an out-of-order log replay into an ordered ship stream.
        #[test]
        fn admits_any_ordering_and_drains_gap_free(keys in prop::collection::vec(any::<u32>(), 1..64)) {
            let n = keys.len() as i64;
            let order = permutation_of(keys);

            let mut list = PrepareList::new(Decree::from(1), 200);
            let mut committed = Vec::new();
            for decree in order {
                list.prepare(mutation(decree)).unwrap();
                committed.extend(list.drain_committed_prefix());
            }

            let decrees: Vec<i64> = committed.iter().map(|m| m.decree.get()).collect();
            prop_assert_eq!(decrees, (1..=n).collect::<Vec<_>>());
            prop_assert_eq!(list.start_decree(), Decree::from(n + 1));
            prop_assert_eq!(list.count(), 0);
        }

        /// A decree once drained can never reappear: re-presenting it is
        /// rejected as stale rather than silently re-committed.
        #[test]
        fn drained_decrees_are_never_re_admitted(keys in prop::collection::vec(any::<u32>(), 1..32)) {
            let order = permutation_of(keys);
            let mut list = PrepareList::new(Decree::from(1), 200);
            for decree in &order {
                list.prepare(mutation(*decree)).unwrap();
                list.drain_committed_prefix();
            }
            for decree in &order {
                prop_assert!(list.prepare(mutation(*decree)).is_err());
            }
        }
    }
}
