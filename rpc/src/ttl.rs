// Copyright 2019-2025 SignalWire, Inc
// This file is licensed under the MIT license.
// See LICENSE for license details.

//! Bounded min-heap of command reply deadlines.
//!
//! The heap holds `(expiry, command id)` pairs only; the pending map owns
//! the commands. Entries whose command was already completed are discarded
//! lazily when they surface at the root.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::time::Instant;
use uuid::Uuid;

// 13107 commands per second over a 5 second average TTL.
pub(crate) const TTL_HEAP_MAX_SIZE: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TtlEntry {
    pub expiry: Instant,
    pub id: Uuid,
}

impl Ord for TtlEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.expiry
            .cmp(&other.expiry)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for TtlEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct TtlHeap {
    heap: BinaryHeap<Reverse<TtlEntry>>,
}

impl TtlHeap {
    pub fn new() -> TtlHeap {
        TtlHeap::default()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Insert a deadline. Returns whether the new entry became the earliest
    /// deadline, in which case the tracker needs a wake-up. Fails when the
    /// heap is at capacity, leaving it untouched.
    pub fn insert(&mut self, expiry: Instant, id: Uuid) -> Result<bool, ()> {
        if self.heap.len() >= TTL_HEAP_MAX_SIZE {
            return Err(());
        }
        let earliest = match self.heap.peek() {
            Some(Reverse(top)) => expiry < top.expiry,
            None => true,
        };
        self.heap.push(Reverse(TtlEntry { expiry, id }));
        Ok(earliest)
    }

    /// The earliest tracked deadline, if any.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(top)| top.expiry)
    }

    /// Pop the root entry if its deadline has passed.
    pub fn pop_expired(&mut self, now: Instant) -> Option<Uuid> {
        match self.heap.peek() {
            Some(Reverse(top)) if top.expiry <= now => self.heap.pop().map(|Reverse(e)| e.id),
            _ => None,
        }
    }
}
