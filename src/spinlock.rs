// Copyright © 2019-2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A blocking test-and-set spinlock with a scoped guard.
//!
//! Every way in the per-CPU logger cache carries one of these, as does
//! each logged object's sync state. The lock word is cache-padded so a
//! contended way doesn't drag its neighbours' lines around with it.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::CachePadded;

/// Threshold after how many iterations we report a busy spinning loop as
/// possibly stuck.
///
/// Should be a power of two to avoid divisions.
pub(crate) const WARN_THRESHOLD: usize = 1 << 20;
const_assert!(WARN_THRESHOLD.is_power_of_two());

/// A spinlock protecting an instance of `T`.
///
/// Supports both blocking acquisition ([`Spinlock::lock`]) and a
/// non-blocking attempt ([`Spinlock::try_lock`]) for lock-order
/// inversions that have to back out instead of waiting.
pub struct Spinlock<T> {
    /// The lock word. `true` while some guard is live.
    state: CachePadded<AtomicBool>,

    /// The protected data.
    data: UnsafeCell<T>,
}

/// RAII guard returned by [`Spinlock::lock`] and [`Spinlock::try_lock`].
/// The lock is released when the guard goes out of scope.
pub struct SpinGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

/// The lock word serializes all access to `data`, so sharing a
/// `Spinlock` only requires the protected value to be sendable.
unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Creates a new, unlocked spinlock around `data`.
    pub const fn new(data: T) -> Spinlock<T> {
        Spinlock {
            state: CachePadded::new(AtomicBool::new(false)),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, spinning until it is available.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let mut iteration = 0;
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            // Spin on a plain load until the lock looks free; retrying
            // the CAS while the holder still owns the line just slows
            // the holder down.
            while self.state.load(Ordering::Relaxed) {
                iteration += 1;
                if iteration % WARN_THRESHOLD == 0 {
                    warn!("Spinlock::lock() is spinning for a long time, is the holder stuck?");
                }
                spin_loop();
            }
        }
    }

    /// Tries to acquire the lock once; returns `None` if it is held.
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self
            .state
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(false, Ordering::Release);
    }
}
