// Copyright © 2019-2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The logged-object core: core-local logger acquisition, eviction of
//! colliding tenants, and global synchronization.
//!
//! Methods that modify an object's state call
//! [`LoggedObject::get_logger`] and log the operation; methods that read
//! it call [`LoggedObject::synchronize`] first, which drains every core's
//! cached logger through the object's [`Flush`] policy and returns the
//! held sync lock.

use alloc::sync::Arc;
use core::fmt;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{fence, Ordering};

use crate::cache::{CoreToken, LogCache, WaySlot};
use crate::cpuset::CpuSet;
use crate::spinlock::{SpinGuard, Spinlock};
use crate::Flush;

/// The shared identity of a logged object: the cores that may cache a
/// logger for it, and the lock that serializes its flush epochs.
///
/// Way tags hold strong references to this, so an identity outlives its
/// [`LoggedObject`] handle until every tag referencing it has been
/// replaced by an eviction. A tag therefore never dangles.
pub(crate) struct ObjectCore<F: Flush> {
    /// Cores that may hold unflushed entries for this object. Any core
    /// sets its bit without a lock; a bit is cleared only under `sync`
    /// plus the corresponding way's lock.
    pub(crate) cpus: CpuSet,

    /// Serializes flushes, protects clearing `cpus`, and owns the flush
    /// policy's state.
    pub(crate) sync: Spinlock<F>,
}

/// An object whose modification operations are deferred into per-core
/// logs and reconciled only when a reader needs to observe its state.
///
/// `F` decides what happens to gathered loggers; see [`Flush`]. Objects
/// with the same policy type share one [`LogCache`].
pub struct LoggedObject<F: Flush> {
    pub(crate) core: Arc<ObjectCore<F>>,
    pub(crate) cache: Arc<LogCache<F>>,
}

impl<F: Flush + Default> LoggedObject<F> {
    /// Creates a logged object with a default-constructed flush policy.
    pub fn new(cache: Arc<LogCache<F>>) -> Self {
        Self::with_flush(cache, F::default())
    }
}

impl<F: Flush> LoggedObject<F> {
    /// Creates a logged object around a caller-supplied flush policy.
    pub fn with_flush(cache: Arc<LogCache<F>>, flush: F) -> Self {
        let cores = cache.cores();
        LoggedObject {
            core: Arc::new(ObjectCore {
                cpus: CpuSet::new(cores),
                sync: Spinlock::new(flush),
            }),
            cache,
        }
    }

    /// The identity ways are tagged with: the address of the shared core,
    /// which is stable for the core's whole lifetime.
    fn ident(&self) -> usize {
        Arc::as_ptr(&self.core) as usize
    }

    /// Returns the calling core's logger for this object, locked.
    ///
    /// The logger is core-local, so writers on different cores log in
    /// parallel without communicating. If the way currently caches
    /// another object's logger, that logger is evicted first: its entries
    /// are flushed to their owner under the owner's sync lock. The sync
    /// lock is only tried: a concurrent [`LoggedObject::synchronize`] on
    /// the owner already holds it and must be able to reach this way to
    /// clear the tag, so the eviction backs out and retries instead of
    /// deadlocking.
    pub fn get_logger(&self, tkn: CoreToken) -> LockedLogger<'_, F> {
        let way = self.cache.way(tkn.0, self.ident());
        loop {
            let mut slot = way.lock();
            let hit = match &slot.tag {
                Some(cur) => Arc::ptr_eq(cur, &self.core),
                None => false,
            };
            if !hit {
                if let Some(other) = slot.tag.clone() {
                    let mut owner = match other.sync.try_lock() {
                        Some(guard) => guard,
                        None => {
                            // Would deadlock with a synchronize on the
                            // owner; back out so it can reach this way.
                            drop(slot);
                            spin_loop();
                            continue;
                        }
                    };
                    owner.flush_logger(&mut slot.logger);
                    other.cpus.clear(tkn.0);
                }
                slot.tag = Some(Arc::clone(&self.core));
            }
            if !self.core.cpus.is_set(tkn.0) {
                self.core.cpus.set(tkn.0);
            }
            return LockedLogger { slot };
        }
    }

    /// Applies all outstanding logged operations and returns the held
    /// sync lock.
    ///
    /// The caller may keep the guard live for as long as it needs the
    /// synchronized state to stay put. Writers keep logging on other
    /// cores meanwhile (the guard only excludes other sync epochs), so
    /// what the caller observes is a snapshot as of the end of the flush.
    pub fn synchronize(&self) -> SyncGuard<'_, F> {
        let mut guard = self.lock_sync();
        self.gather(&mut guard);
        guard.flush.flush_finish();
        guard
    }

    pub(crate) fn lock_sync(&self) -> SyncGuard<'_, F> {
        SyncGuard {
            flush: self.core.sync.lock(),
        }
    }

    /// Repeatedly drains every core's cached logger until a full scan of
    /// the CPU set comes up empty.
    ///
    /// The set can't be read atomically, but that's okay: only the
    /// sync-lock holder clears bits, so a scan that observes all-zero
    /// proves there were no unflushed entries as of the scan's start,
    /// even if writers set bits again right behind it.
    pub(crate) fn gather(&self, guard: &mut SyncGuard<'_, F>) {
        loop {
            let mut any = false;
            for cpu in self.core.cpus.iter() {
                let mut slot = self.cache.way(cpu, self.ident()).lock();
                {
                    let tag = slot.tag.as_ref().expect("core marked but way untagged");
                    assert!(
                        Arc::ptr_eq(tag, &self.core),
                        "core marked but way tagged by another object"
                    );
                }
                guard.flush.flush_logger(&mut slot.logger);
                self.core.cpus.clear(cpu);
                any = true;
            }
            if !any {
                break;
            }
            // Pick up bits set while the scan was in flight.
            fence(Ordering::SeqCst);
        }
    }
}

impl<F: Flush> Drop for LoggedObject<F> {
    /// Discards the object's buffered entries without applying them.
    ///
    /// Ways still tagged for this object keep their tags; the shared core
    /// stays alive behind them until a later eviction replaces it, so no
    /// way is ever left pointing at freed identity.
    fn drop(&mut self) {
        let _guard = self.core.sync.lock();
        loop {
            let mut any = false;
            for cpu in self.core.cpus.iter() {
                let mut slot = self.cache.way(cpu, self.ident()).lock();
                {
                    let tag = slot.tag.as_ref().expect("core marked but way untagged");
                    assert!(
                        Arc::ptr_eq(tag, &self.core),
                        "core marked but way tagged by another object"
                    );
                }
                slot.logger = Default::default();
                self.core.cpus.clear(cpu);
                any = true;
            }
            if !any {
                break;
            }
            fence(Ordering::SeqCst);
        }
    }
}

impl<F: Flush> fmt::Debug for LoggedObject<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LoggedObject")
    }
}

/// A core-local logger protected by its way's lock.
///
/// Dereferences to the plugged-in logger type. The way lock is released
/// when this handle drops; the borrow keeps the logger from being
/// stashed past that point.
pub struct LockedLogger<'a, F: Flush> {
    slot: SpinGuard<'a, WaySlot<F>>,
}

impl<F: Flush> Deref for LockedLogger<'_, F> {
    type Target = F::Logger;

    fn deref(&self) -> &F::Logger {
        &self.slot.logger
    }
}

impl<F: Flush> DerefMut for LockedLogger<'_, F> {
    fn deref_mut(&mut self) -> &mut F::Logger {
        &mut self.slot.logger
    }
}

/// Holds an object's sync lock after a synchronize.
///
/// While live, no other sync epoch can run for the object, so the
/// reconciled state the epoch produced stays put. Dereferences to the
/// object's flush policy for post-flush inspection.
pub struct SyncGuard<'a, F: Flush> {
    pub(crate) flush: SpinGuard<'a, F>,
}

impl<F: Flush> Deref for SyncGuard<'_, F> {
    type Target = F;

    fn deref(&self) -> &F {
        &self.flush
    }
}

impl<F: Flush> DerefMut for SyncGuard<'_, F> {
    fn deref_mut(&mut self) -> &mut F {
        &mut self.flush
    }
}
