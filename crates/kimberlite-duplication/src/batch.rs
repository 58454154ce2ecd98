//! Bounded, decree-ordered staging buffer for outgoing duplication traffic.
//!
//! Turns a possibly out-of-order mutation stream (as read off the private
//! log) into a committed-prefix stream of wire [`Message`]s, ready to ship.
//! Replaces the source system's commit-callback closure (which held a
//! pointer back into the batch, forming a reference cycle) with an
//! explicit drain step — no callback is stored anywhere.

use crate::error::Result;
use crate::prepare_list::PrepareList;
use crate::types::{Decree, Message, Mutation};

/// A sorted, bounded staging structure that admits prepared mutations out
/// of order, detects a dense committed prefix, and emits wire messages in
/// strictly increasing decree order.
///
/// Not thread-safe — owned exclusively by one [`crate::duplicator::Duplicator`].
#[derive(Debug)]
pub struct MutationBatch {
    window: PrepareList,
    messages: Vec<Message>,
    last_decree: Decree,
}

impl MutationBatch {
    /// Creates an empty batch expecting to commit starting at `start_decree`
    /// (typically `entry.confirmed_decree.next()`), with a window of
    /// `capacity` outstanding entries.
    pub fn new(start_decree: Decree, capacity: usize) -> Self {
        Self {
            window: PrepareList::new(start_decree, capacity),
            messages: Vec::new(),
            // `last_decree` starts one behind `start_decree`; it only ever
            // moves forward as committed mutations are flattened in.
            last_decree: Decree::from(start_decree.get() - 1),
        }
    }

    /// Admits `mu`, flattening any newly-dense committed prefix into the
    /// output message vector.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::DuplicationError::InvalidData`] if the
    /// underlying prepare-list rejects the entry (duplicate or stale
    /// decree).
    ///
    /// # Panics
    ///
    /// Panics if admitting `mu` would overflow the prepare-list's capacity
    /// — this is fatal because it implies the upstream producer violated
    /// flow control (see design doc invariants).
    pub fn add(&mut self, mu: Mutation) -> Result<()> {
        self.window.prepare(mu)?;

        for committed in self.window.drain_committed_prefix() {
            self.last_decree = self.last_decree.max(committed.decree);
            self.messages
                .extend(committed.updates.into_iter().map(Message::from));
        }

        Ok(())
    }

    /// Moves the accumulated ordered messages out, leaving the batch empty.
    /// `last_decree()` keeps reporting the largest decree drained so far.
    pub fn drain(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.messages)
    }

    /// Puts a previously drained message vector back, ahead of anything
    /// admitted since — used when a ship attempt fails and must be
    /// retried with the exact same vector.
    pub fn requeue(&mut self, mut messages: Vec<Message>) {
        messages.append(&mut self.messages);
        self.messages = messages;
    }

    /// The largest decree whose updates have been flattened into a
    /// (drained or not-yet-drained) message vector.
    pub fn last_decree(&self) -> Decree {
        self.last_decree
    }

    /// True if there is nothing to ship yet.
    pub fn empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Ballot, MutationUpdate};
    use bytes::Bytes;

    fn mutation(decree: i64) -> Mutation {
        Mutation::new(
            Decree::from(decree),
            Ballot::new(1),
            vec![MutationUpdate {
                opcode: 1,
                serialization_tag: 0,
                payload: Bytes::from(decree.to_le_bytes().to_vec()),
            }],
        )
    }

    #[test]
    fn drains_in_strictly_increasing_decree_order() {
        let mut batch = MutationBatch::new(Decree::from(1), 200);
        batch.add(mutation(2)).unwrap();
        batch.add(mutation(1)).unwrap();
        batch.add(mutation(3)).unwrap();

        assert_eq!(batch.last_decree(), Decree::from(3));
        let messages = batch.drain();
        assert_eq!(messages.len(), 3);
        assert!(batch.empty());
    }

    #[test]
    fn gap_holds_back_the_whole_prefix() {
        let mut batch = MutationBatch::new(Decree::from(1), 200);
        batch.add(mutation(1)).unwrap();
        batch.add(mutation(3)).unwrap(); // gap at 2
        assert!(!batch.empty()); // decree 1 already committed
        assert_eq!(batch.last_decree(), Decree::from(1));

        batch.add(mutation(2)).unwrap();
        assert_eq!(batch.last_decree(), Decree::from(3));
    }

    #[test]
    fn invalid_decree_is_reported_not_panicked() {
        let mut batch = MutationBatch::new(Decree::from(5), 200);
        let err = batch.add(mutation(3)).unwrap_err();
        assert!(matches!(err, crate::error::DuplicationError::InvalidData(_)));
    }
}

#[cfg(test)]
mod properties {
    use super::*;
    use crate::types::{Ballot, MutationUpdate};
    use bytes::Bytes;
    use proptest::prelude::*;

    fn mutation(decree: i64) -> Mutation {
        Mutation::new(
            Decree::from(decree),
            Ballot::new(1),
            vec![MutationUpdate {
                opcode: 1,
                serialization_tag: 0,
                payload: Bytes::from(decree.to_le_bytes().to_vec()),
            }],
        )
    }

    fn decree_of(message: &Message) -> i64 {
        i64::from_le_bytes(message.payload.as_ref().try_into().unwrap())
    }

    fn permutation_of(keys: Vec<u32>) -> Vec<i64> {
        let mut indexed: Vec<(u32, i64)> = keys.into_iter().zip(1i64..).collect();
        indexed.sort_by_key(|(key, _)| *key);
        indexed.into_iter().map(|(_, decree)| decree).collect()
    }

    proptest! {
        /// *Commit monotonicity* (design doc §8): for any two successive
        /// batches drained by the same duplicator, every decree in the
        /// second strictly exceeds every decree in the first — splitting
        /// one arbitrary permutation of `1..=n` across two admit/drain
        /// rounds must never produce an overlapping or descending pair.
        #[test]
        fn commit_monotonicity_across_successive_drains(
            keys in prop::collection::vec(any::<u32>(), 2..80),
        ) {
            let n = keys.len();
            let mid = n / 2;
            let order = permutation_of(keys);
            let (first_half, second_half) = order.split_at(mid);

            let mut batch = MutationBatch::new(Decree::from(1), 200);
            for decree in first_half {
                batch.add(mutation(*decree)).unwrap();
            }
            let b1 = batch.drain();
            let max_b1 = b1.iter().map(decree_of).max();

            for decree in second_half {
                batch.add(mutation(*decree)).unwrap();
            }
            let b2 = batch.drain();
            let min_b2 = b2.iter().map(decree_of).min();

            if let (Some(max1), Some(min2)) = (max_b1, min_b2) {
                prop_assert!(min2 > max1);
            }
        }

        /// *Idempotent ship* (design doc §8): requeuing a failed vector
        /// after a transient backlog error must replay it byte-for-byte
        /// ahead of anything admitted in the meantime, so a retry looks
        /// identical to the remote as the original attempt plus new data.
        #[test]
        fn requeue_replays_the_failed_vector_ahead_of_new_admissions(
            failed_tags in prop::collection::vec(any::<u8>(), 0..20),
            extra_keys in prop::collection::vec(any::<u32>(), 0..20),
        ) {
            let failed: Vec<Message> = failed_tags
                .into_iter()
                .map(|tag| Message { opcode: 1, serialization_tag: tag, payload: Bytes::new() })
                .collect();

            let mut batch = MutationBatch::new(Decree::from(1), 200);
            batch.requeue(failed.clone());

            let order = permutation_of(extra_keys);
            for decree in order {
                batch.add(mutation(decree)).unwrap();
            }

            let drained = batch.drain();
            prop_assert_eq!(&drained[..failed.len()], &failed[..]);
        }
    }
}
