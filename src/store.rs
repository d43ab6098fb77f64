//! Bounded block-versioned snapshot history.

use std::collections::VecDeque;

use crate::types::StateInstant;

pub const DEFAULT_CAPACITY: usize = 16;

/// Ring of `(instant, snapshot)` pairs in strictly increasing block order.
///
/// Kept small: readers only ever need the snapshot at `block - 1` for log
/// application plus a short tail for reorg rollback. Once capacity is
/// reached the oldest entry is dropped on insert.
#[derive(Clone, Debug)]
pub struct StateStore<T> {
    entries: VecDeque<(StateInstant, T)>,
    capacity: usize,
}

impl<T> Default for StateStore<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T> StateStore<T> {
    pub fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::with_capacity(capacity.max(1)), capacity: capacity.max(1) }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Block number of the newest snapshot.
    pub fn head_block(&self) -> Option<u64> {
        self.entries.back().map(|(instant, _)| instant.block_number())
    }

    /// Records a snapshot for `instant`.
    ///
    /// Same-block insert replaces the existing entry; an insert below the
    /// head first drops every newer entry, which makes the store tolerant
    /// of callers that re-sync after a shallow reorg without an explicit
    /// `rollback`.
    pub fn set_state(&mut self, instant: StateInstant, state: T) {
        while let Some((head, _)) = self.entries.back() {
            if head.block_number() < instant.block_number() {
                break;
            }
            self.entries.pop_back();
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((instant, state));
    }

    /// Snapshot at the greatest recorded block `<= block_number`, or `None`
    /// when the store is cold or the requested block predates retained
    /// history.
    pub fn get_state(&self, block_number: u64) -> Option<(&StateInstant, &T)> {
        self.entries
            .iter()
            .rev()
            .find(|(instant, _)| instant.block_number() <= block_number)
            .map(|(instant, state)| (instant, state))
    }

    pub fn latest(&self) -> Option<(&StateInstant, &T)> {
        self.entries.back().map(|(instant, state)| (instant, state))
    }

    /// Drops every snapshot above `to_block`. Returns `false` when nothing
    /// survives; the owner must then treat itself as cold and re-fetch.
    pub fn rollback(&mut self, to_block: u64) -> bool {
        while let Some((instant, _)) = self.entries.back() {
            if instant.block_number() <= to_block {
                break;
            }
            self.entries.pop_back();
        }
        !self.entries.is_empty()
    }
}
