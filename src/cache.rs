// Copyright © 2019-2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The per-CPU cache of ways that holds in-flight loggers.
//!
//! Rather than keeping a per-CPU log alive for every object, each core
//! owns a fixed table of *ways*. A way pairs the identity of the object
//! it currently logs for with an embedded logger; an object's way on a
//! core is a pure function of the object's identity, so a collision
//! evicts the previous tenant instead of chaining.

use alloc::boxed::Box;
use alloc::collections::TryReserveError;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::num::NonZeroUsize;

use crate::object::ObjectCore;
use crate::spinlock::Spinlock;
use crate::Flush;

/// Number of ways in each core's logger cache.
///
/// An object's logger lives in exactly one way per core; two objects
/// hashing to the same way evict each other. Must be a power of two so
/// the way index is a mask instead of a division.
pub const CACHE_SLOTS: usize = 4096;
const_assert!(CACHE_SLOTS.is_power_of_two());

/// The maximum number of cores a [`LogCache`] can be built for.
///
/// Can't make this arbitrarily high: a way table is allocated for every
/// core up front.
pub const MAX_CORES: usize = 256;

/// A core identifier handed out by [`LogCache::register`]. Writers pass
/// it to [`crate::LoggedObject::get_logger`] to reach their core-local
/// logger.
///
/// # Note
/// Ideally this would be an affine type so a token can't leak onto a
/// different core, but that would hurt API ergonomics a lot; the embedder
/// is trusted to present the token only from the core it names.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CoreToken(pub(crate) usize);

impl CoreToken {
    /// Creates a token without going through registration.
    ///
    /// # Safety
    /// `cpu` must be in range for every cache the token is used with.
    /// This only exists for harnesses that fake out cores.
    #[doc(hidden)]
    pub unsafe fn new(cpu: usize) -> Self {
        CoreToken(cpu)
    }

    /// The core this token stands for.
    pub fn cpu(&self) -> usize {
        self.0
    }
}

/// One slot in a core's way table: the identity of the object the
/// embedded logger currently belongs to, and the logger itself. Both are
/// protected by the way's lock.
pub(crate) struct WaySlot<F: Flush> {
    pub(crate) tag: Option<Arc<ObjectCore<F>>>,
    pub(crate) logger: F::Logger,
}

impl<F: Flush> Default for WaySlot<F> {
    fn default() -> Self {
        WaySlot {
            tag: None,
            logger: Default::default(),
        }
    }
}

/// The per-core way tables backing a family of logged objects.
///
/// One cache is shared by every [`crate::LoggedObject`] with the same
/// flush policy; objects find their way by hashing their identity. All
/// tables are allocated when the cache is constructed, so the write path
/// never allocates way storage.
pub struct LogCache<F: Flush> {
    /// `cores * slots` ways, laid out table-after-table.
    ways: Box<[Spinlock<WaySlot<F>>]>,
    cores: usize,
    slots: usize,
}

impl<F: Flush> LogCache<F> {
    /// Constructs a cache with [`CACHE_SLOTS`] ways per core.
    pub fn new(cores: NonZeroUsize) -> Result<Self, TryReserveError> {
        Self::with_slots(cores, CACHE_SLOTS)
    }

    /// Constructs a cache with `slots` ways per core. `slots` must be a
    /// power of two; small values make every object collide, which is
    /// occasionally what a test wants.
    pub fn with_slots(cores: NonZeroUsize, slots: usize) -> Result<Self, TryReserveError> {
        assert!(
            cores.get() <= MAX_CORES,
            "LogCache supports at most {} cores",
            MAX_CORES
        );
        assert!(slots.is_power_of_two(), "way count must be a power of two");

        let n = cores.get() * slots;
        let mut ways = Vec::new();
        ways.try_reserve_exact(n)?;
        for _ in 0..n {
            ways.push(Spinlock::new(WaySlot::default()));
        }

        Ok(LogCache {
            ways: ways.into_boxed_slice(),
            cores: cores.get(),
            slots,
        })
    }

    /// Registers core `cpu` with this cache. Returns a [`CoreToken`]
    /// inside an `Option` if `cpu` is in range, `None` otherwise.
    pub fn register(&self, cpu: usize) -> Option<CoreToken> {
        if cpu < self.cores {
            Some(CoreToken(cpu))
        } else {
            None
        }
    }

    /// The number of cores this cache was built for.
    pub fn cores(&self) -> usize {
        self.cores
    }

    /// The way that caches `ident`'s logger on `cpu`. Pure in
    /// `(cpu, ident)`: every writer on a core reaches the same way for
    /// the same object.
    pub(crate) fn way(&self, cpu: usize, ident: usize) -> &Spinlock<WaySlot<F>> {
        debug_assert!(cpu < self.cores);
        &self.ways[cpu * self.slots + self.way_index(ident)]
    }

    /// Scramble hash (Java HashMap's re-hash) so pointer-aligned
    /// identities spread over the table instead of piling into a few
    /// ways.
    fn way_index(&self, ident: usize) -> usize {
        let mut w = ident as u64;
        w ^= (w >> 32) ^ (w >> 20) ^ (w >> 12);
        w ^= (w >> 7) ^ (w >> 4);
        (w as usize) & (self.slots - 1)
    }
}
