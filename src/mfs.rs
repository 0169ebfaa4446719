// Copyright © 2019-2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Wait-synchronize: reconciliation bounded by a timestamp.
//!
//! A metadata operation on another core linearizes at some stamp between
//! its published start and end times, but its log entry only lands once
//! the operation finishes. A reader that wants every operation older
//! than a bound applied must therefore wait out any core whose published
//! window says an operation that might predate the bound is still in
//! flight. Each core advertises that window through a pair of
//! sequence-counter-protected stamps.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::hint::spin_loop;

use crossbeam_utils::CachePadded;

use crate::cache::{CoreToken, LogCache};
use crate::object::{LockedLogger, LoggedObject, SyncGuard};
use crate::ordered::TscOrdered;
use crate::seqlock::SeqValue;
use crate::spinlock::WARN_THRESHOLD;
use crate::LogOp;

/// A TSC-ordered logged object that can also reconcile *up to* a caller-
/// supplied timestamp, waiting for in-flight operations on other cores
/// whose linearization point may precede it.
///
/// Cores publish the start stamp of their latest metadata operation with
/// [`MfsLoggedObject::update_start_tsc`] before logging anything, and its
/// end stamp with [`MfsLoggedObject::update_end_tsc`] as the operation's
/// last act, after the log entry has been pushed.
pub struct MfsLoggedObject<O: LogOp> {
    object: LoggedObject<TscOrdered<O>>,

    /// When the latest metadata operation on each core began.
    start_tsc: Box<[CachePadded<SeqValue>]>,

    /// When it finished; older than the matching start while one is in
    /// flight.
    end_tsc: Box<[CachePadded<SeqValue>]>,
}

impl<O: LogOp> MfsLoggedObject<O> {
    pub fn new(cache: Arc<LogCache<TscOrdered<O>>>) -> Self {
        let cores = cache.cores();
        let stamps = || {
            (0..cores)
                .map(|_| CachePadded::new(SeqValue::new(0)))
                .collect::<Vec<_>>()
                .into_boxed_slice()
        };
        MfsLoggedObject {
            object: LoggedObject::new(cache),
            start_tsc: stamps(),
            end_tsc: stamps(),
        }
    }

    /// See [`LoggedObject::get_logger`].
    pub fn get_logger(&self, tkn: CoreToken) -> LockedLogger<'_, TscOrdered<O>> {
        self.object.get_logger(tkn)
    }

    /// See [`LoggedObject::synchronize`].
    pub fn synchronize(&self) -> SyncGuard<'_, TscOrdered<O>> {
        self.object.synchronize()
    }

    /// Publishes the start stamp of `cpu`'s latest metadata operation.
    pub fn update_start_tsc(&self, cpu: usize, start_tsc: u64) {
        self.start_tsc[cpu].write(start_tsc);
    }

    /// Publishes the end stamp of `cpu`'s latest metadata operation. The
    /// operation's log entry must already be pushed when this runs.
    pub fn update_end_tsc(&self, cpu: usize, end_tsc: u64) {
        self.end_tsc[cpu].write(end_tsc);
    }

    /// Applies every logged operation stamped strictly before `wait_tsc`
    /// and returns the held sync lock; younger operations stay deferred.
    ///
    /// Before gathering, waits for each core whose published window says
    /// an operation that began before `wait_tsc` has not ended yet: its
    /// entry may still be unlogged, and reconciling without it would lose
    /// an operation the bound promises to cover. A new end stamp is the
    /// last thing an operation publishes, so once the end counter moves
    /// the entry is in place.
    pub fn wait_synchronize(&self, wait_tsc: u64) -> SyncGuard<'_, TscOrdered<O>> {
        let mut guard = self.object.lock_sync();

        for cpu in 0..self.start_tsc.len() {
            let (start_tsc, _) = self.start_tsc[cpu].read();
            let (end_tsc, end_seq) = self.end_tsc[cpu].read();

            if end_tsc < start_tsc && start_tsc < wait_tsc {
                let mut iteration = 0;
                while !self.end_tsc[cpu].advanced(end_seq) {
                    iteration += 1;
                    if iteration % WARN_THRESHOLD == 0 {
                        warn!(
                            "wait_synchronize: still waiting on core {} (start_tsc = {})",
                            cpu, start_tsc
                        );
                    }
                    spin_loop();
                }
            }
        }

        self.object.gather(&mut guard);
        guard.flush_finish_max_timestamp(wait_tsc);
        guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ordered::TscLogCache;
    use crate::TimestampedOp;
    use core::num::NonZeroUsize;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc as StdArc, Mutex};
    use std::thread;
    use std::time::Duration;
    use std::vec;
    use std::vec::Vec;

    #[derive(Debug)]
    struct Rec {
        tsc: u64,
        tag: u32,
        order: StdArc<Mutex<Vec<u32>>>,
    }

    impl Rec {
        fn new(tsc: u64, tag: u32, order: &StdArc<Mutex<Vec<u32>>>) -> Rec {
            Rec {
                tsc,
                tag,
                order: StdArc::clone(order),
            }
        }
    }

    impl LogOp for Rec {
        fn run(&mut self) {
            self.order.lock().unwrap().push(self.tag);
        }
    }

    impl TimestampedOp for Rec {
        fn tsc(&self) -> u64 {
            self.tsc
        }
    }

    fn harness(cores: usize) -> (Arc<TscLogCache<Rec>>, StdArc<Mutex<Vec<u32>>>) {
        let cache =
            Arc::new(TscLogCache::with_slots(NonZeroUsize::new(cores).unwrap(), 16).unwrap());
        (cache, StdArc::new(Mutex::new(Vec::new())))
    }

    fn applied(order: &StdArc<Mutex<Vec<u32>>>) -> Vec<u32> {
        order.lock().unwrap().clone()
    }

    #[test]
    fn test_stamp_updates_readable() {
        let (cache, _) = harness(2);
        let o = MfsLoggedObject::<Rec>::new(Arc::clone(&cache));
        o.update_start_tsc(1, 77);
        o.update_end_tsc(1, 99);
        assert_eq!(o.start_tsc[1].read().0, 77);
        assert_eq!(o.end_tsc[1].read().0, 99);
    }

    /// Operations at or past the bound stay deferred; a later synchronize
    /// applies them.
    #[test]
    fn test_wait_synchronize_bounds_the_flush() {
        let (cache, order) = harness(2);
        let o = MfsLoggedObject::<Rec>::new(Arc::clone(&cache));
        let t0 = cache.register(0).unwrap();
        let t1 = cache.register(1).unwrap();

        o.get_logger(t0).push_with_tsc(Rec::new(100, 1, &order));
        o.get_logger(t1).push_with_tsc(Rec::new(200, 2, &order));

        let sync = o.wait_synchronize(150);
        assert_eq!(applied(&order), vec![1]);
        assert_eq!(sync.pending_loggers(), 1);
        assert!(!o.object.core.cpus.is_set(0));
        assert!(!o.object.core.cpus.is_set(1));
        drop(sync);

        drop(o.synchronize());
        assert_eq!(applied(&order), vec![1, 2]);
    }

    /// The bound is exclusive: an operation stamped exactly at the bound
    /// is not applied.
    #[test]
    fn test_wait_synchronize_bound_is_exclusive() {
        let (cache, order) = harness(1);
        let o = MfsLoggedObject::<Rec>::new(Arc::clone(&cache));
        let t0 = cache.register(0).unwrap();

        {
            let mut log = o.get_logger(t0);
            log.push_with_tsc(Rec::new(149, 1, &order));
            log.push_with_tsc(Rec::new(150, 2, &order));
        }

        drop(o.wait_synchronize(150));
        assert_eq!(applied(&order), vec![1]);
        drop(o.synchronize());
        assert_eq!(applied(&order), vec![1, 2]);
    }

    /// With no in-flight window published, wait_synchronize behaves like
    /// a bounded synchronize and does not block.
    #[test]
    fn test_wait_synchronize_without_inflight() {
        let (cache, order) = harness(2);
        let o = MfsLoggedObject::<Rec>::new(Arc::clone(&cache));
        let t0 = cache.register(0).unwrap();

        o.get_logger(t0).push_with_tsc(Rec::new(10, 1, &order));
        drop(o.wait_synchronize(100));
        assert_eq!(applied(&order), vec![1]);
    }

    /// A core advertising an unfinished operation that began before the
    /// bound stalls the reconciliation until it publishes its end stamp,
    /// by which point its entry is logged and gets applied.
    #[test]
    fn test_wait_synchronize_waits_for_publisher() {
        let (cache, order) = harness(2);
        let o = StdArc::new(MfsLoggedObject::<Rec>::new(Arc::clone(&cache)));
        let t1 = cache.register(1).unwrap();

        // Core 1 is inside an operation that started at 100; its last
        // finished one ended at 50.
        o.update_end_tsc(1, 50);
        o.update_start_tsc(1, 100);

        let published = StdArc::new(AtomicBool::new(false));
        let publisher = {
            let o = StdArc::clone(&o);
            let order = StdArc::clone(&order);
            let published = StdArc::clone(&published);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                {
                    let mut log = o.get_logger(t1);
                    log.push_with_tsc(Rec::new(120, 1, &order));
                    log.push_with_tsc(Rec::new(160, 2, &order));
                }
                published.store(true, Ordering::SeqCst);
                o.update_end_tsc(1, 121);
            })
        };

        let sync = o.wait_synchronize(150);
        assert!(published.load(Ordering::SeqCst));
        assert_eq!(applied(&order), vec![1]);
        assert_eq!(sync.pending_loggers(), 1);
        drop(sync);

        publisher.join().expect("Publisher didn't finish successfully.");

        drop(o.synchronize());
        assert_eq!(applied(&order), vec![1, 2]);
    }
}
