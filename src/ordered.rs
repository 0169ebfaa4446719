// Copyright © 2019-2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! TSC-ordered logging: per-core loggers of timestamped operations, and
//! the flush policy that merges and applies them in global timestamp
//! order.
//!
//! Because the counter is synchronized across cores, sorting all cores'
//! entries by stamp yields the order in which the operations actually
//! happened. Gathered loggers accumulate in a pending set; the epoch's
//! final flush k-way merges them and runs every operation.

use alloc::collections::BinaryHeap;
use alloc::vec::Vec;
use core::cmp::Reverse;
use core::mem;

use crate::object::LoggedObject;
use crate::tsc;
use crate::{Flush, LogOp, TimestampedOp};

/// One deferred operation and the timestamp that orders it.
#[derive(Debug)]
struct Entry<O> {
    tsc: u64,
    op: O,
}

/// A per-core, per-object buffer of timestamped operations.
///
/// Not thread-safe on its own; users reach it through
/// [`crate::LockedLogger`], which holds the owning way's lock.
pub struct TscLogger<O> {
    ops: Vec<Entry<O>>,
}

impl<O> Default for TscLogger<O> {
    fn default() -> Self {
        TscLogger { ops: Vec::new() }
    }
}

impl<O: LogOp> TscLogger<O> {
    /// Logs `op`, stamped with the current time-stamp counter.
    ///
    /// The stamp is read while the way lock is held. `rdtscp` retires all
    /// older instructions first, so the stamp postdates the lock
    /// acquisition; storing it into the entry and then releasing the lock
    /// (both memory writes) keeps the release from overtaking the read.
    pub fn push(&mut self, op: O) {
        let tsc = tsc::read();
        self.ops.push(Entry { tsc, op });
    }

    /// Logs `op` under the linearization timestamp it already carries,
    /// read off at the operation's linearization point by whoever built
    /// it.
    pub fn push_with_tsc(&mut self, op: O)
    where
        O: TimestampedOp,
    {
        let tsc = op.tsc();
        self.ops.push(Entry { tsc, op });
    }

    /// Number of operations currently buffered.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drops all buffered operations without applying them.
    pub fn reset(&mut self) {
        self.ops.clear();
    }

    /// Dumps the buffered operations through the logging facade.
    pub fn print_ops(&self) {
        for e in &self.ops {
            trace!("deferred op @ {}: {:?}", e.tsc, e.op);
        }
    }

    /// Stable-sorts the buffered operations by timestamp; entries pushed
    /// with equal stamps keep their push order.
    fn sort_ops(&mut self) {
        self.ops.sort_by_key(|e| e.tsc);
    }

    /// Index of the first operation stamped at or past `max_tsc`;
    /// everything before it is strictly older. Call after `sort_ops`.
    fn ops_before(&self, max_tsc: u64) -> usize {
        self.ops.partition_point(|e| e.tsc < max_tsc)
    }
}

/// Flush policy that applies operations in global timestamp order.
///
/// Ordered entries can't be applied piecemeal: a logger flushed early
/// (say, by an eviction) may hold operations that belong *between*
/// operations still buffered on other cores. Gathered loggers therefore
/// pile up in a pending set and only the epoch's final flush merges and
/// runs them.
pub struct TscOrdered<O> {
    pending: Vec<TscLogger<O>>,
}

impl<O> Default for TscOrdered<O> {
    fn default() -> Self {
        TscOrdered {
            pending: Vec::new(),
        }
    }
}

impl<O: LogOp> TscOrdered<O> {
    /// Number of loggers gathered so far in this epoch.
    pub fn pending_loggers(&self) -> usize {
        self.pending.len()
    }

    /// Dumps every pending logger's operations.
    pub fn print_pending(&self) {
        for logger in &self.pending {
            logger.print_ops();
        }
    }

    /// Merges and applies the pending operations stamped strictly before
    /// `max_tsc`. Newer operations stay in their pending loggers for a
    /// later epoch; loggers drained empty are dropped from the set.
    pub(crate) fn flush_finish_max_timestamp(&mut self, max_tsc: u64) {
        if self.pending.is_empty() {
            return;
        }
        let mut runs = Vec::new();
        for logger in self.pending.iter_mut() {
            logger.sort_ops();
            let cut = logger.ops_before(max_tsc);
            if cut == 0 {
                continue;
            }
            let rest = logger.ops.split_off(cut);
            runs.push(mem::replace(&mut logger.ops, rest));
        }
        merge_and_run(runs);
        self.pending.retain(|logger| !logger.is_empty());
    }
}

impl<O: LogOp> Flush for TscOrdered<O> {
    type Logger = TscLogger<O>;

    /// Moves the way's logger into the pending set and hands the way a
    /// fresh one.
    fn flush_logger(&mut self, logger: &mut TscLogger<O>) {
        self.pending.push(mem::take(logger));
    }

    fn flush_finish(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let mut runs = Vec::new();
        for mut logger in self.pending.drain(..) {
            if logger.is_empty() {
                continue;
            }
            logger.sort_ops();
            runs.push(logger.ops);
        }
        merge_and_run(runs);
    }
}

/// K-way merges the sorted runs by `(timestamp, run index)` and runs each
/// operation in merged order. The index tie-break makes the total order
/// deterministic when stamps collide across runs.
fn merge_and_run<O: LogOp>(runs: Vec<Vec<Entry<O>>>) {
    if runs.is_empty() {
        return;
    }

    let mut cursors: Vec<_> = runs
        .into_iter()
        .map(|run| run.into_iter().peekable())
        .collect();

    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (idx, cursor) in cursors.iter_mut().enumerate() {
        if let Some(head) = cursor.peek() {
            heap.push(Reverse((head.tsc, idx)));
        }
    }

    let mut merged = Vec::new();
    while let Some(Reverse((_, idx))) = heap.pop() {
        let entry = cursors[idx]
            .next()
            .expect("drained cursor left on the merge heap");
        merged.push(entry);
        if let Some(head) = cursors[idx].peek() {
            heap.push(Reverse((head.tsc, idx)));
        }
    }

    debug_assert!(
        merged.windows(2).all(|w| w[0].tsc <= w[1].tsc),
        "merged operations out of timestamp order"
    );

    for mut entry in merged {
        entry.op.run();
    }
}

/// A logged object whose deferred operations are applied in global TSC
/// order when a reader synchronizes.
pub type TscLoggedObject<O> = LoggedObject<TscOrdered<O>>;

/// The way cache shared by TSC-ordered objects over operation type `O`.
pub type TscLogCache<O> = crate::cache::LogCache<TscOrdered<O>>;
