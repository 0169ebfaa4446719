// Copyright © 2019-2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! OpLog is a library for scaling objects that are modified often from
//! many cores but observed rarely. Applying every modification to shared
//! state as it happens makes the cache lines holding that state bounce
//! between cores; OpLog instead logs modification operations into
//! per-CPU logs and only applies them when a reader needs to observe the
//! object's state.
//!
//! # How does it work
//! An object plugs a logger type and a flush policy into
//! [`LoggedObject`]. Methods that modify the object call
//! [`LoggedObject::get_logger`] and log the operation into a core-local
//! buffer; methods that read it call [`LoggedObject::synchronize`],
//! which drains every core's buffered operations through the policy and
//! returns a lock under which the state can be observed.
//!
//! Keeping a log per core per object would be wasteful, so each core
//! owns a fixed-size cache of loggers keyed by object identity; only
//! recently modified objects are likely to still have logs, and
//! collisions evict.
//!
//! The crate ships one ready-made policy: [`TscLoggedObject`] stamps
//! each operation with the time-stamp counter and applies all cores'
//! operations in global stamp order. [`MfsLoggedObject`] extends it with
//! reconciliation bounded by a timestamp. The following counts events
//! without making the writers share a cache line:
//!
//! ```
//! use core::num::NonZeroUsize;
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//!
//! use oplog::{LogCache, LogOp, LoggedObject, TscLoggedObject};
//!
//! /// Counts how often something happened, off the write path.
//! #[derive(Debug)]
//! struct Add {
//!     counter: Arc<AtomicU64>,
//!     amount: u64,
//! }
//!
//! impl LogOp for Add {
//!     fn run(&mut self) {
//!         self.counter.fetch_add(self.amount, Ordering::Relaxed);
//!     }
//! }
//!
//! let cache = Arc::new(LogCache::new(NonZeroUsize::new(2).unwrap()).unwrap());
//! let counter = Arc::new(AtomicU64::new(0));
//! let hits: TscLoggedObject<Add> = LoggedObject::new(Arc::clone(&cache));
//!
//! // Writers log on their own core without touching shared cache lines.
//! let core = cache.register(0).unwrap();
//! let mut log = hits.get_logger(core);
//! log.push(Add { counter: Arc::clone(&counter), amount: 5 });
//! drop(log);
//!
//! // A reader reconciles before it looks.
//! let sync = hits.synchronize();
//! assert_eq!(counter.load(Ordering::Relaxed), 5);
//! drop(sync);
//! ```

#![no_std]

#[cfg(test)]
extern crate std;

extern crate alloc;

extern crate crossbeam_utils;

#[macro_use]
extern crate logging;

#[macro_use]
extern crate static_assertions;

use core::fmt::Debug;

pub mod cache;
mod cpuset;
pub mod mfs;
pub mod object;
pub mod ordered;
pub mod seqlock;
pub mod spinlock;
pub mod tsc;

pub use crate::cache::{CoreToken, LogCache, CACHE_SLOTS, MAX_CORES};
pub use crate::mfs::MfsLoggedObject;
pub use crate::object::{LockedLogger, LoggedObject, SyncGuard};
pub use crate::ordered::{TscLogCache, TscLogger, TscLoggedObject, TscOrdered};

/// An operation deferred into a per-core log.
///
/// Operations are owned by the logger they were pushed into and run at
/// most once, when the flush that gathered them reaches their place in
/// the merged order. The `Debug` bound feeds the log-dump paths.
pub trait LogOp: Send + Debug {
    /// Applies the operation's effects.
    fn run(&mut self);
}

/// An operation that carries its own linearization timestamp, read off
/// at the operation's linearization point by whoever built it.
pub trait TimestampedOp: LogOp {
    /// The timestamp that orders this operation globally.
    fn tsc(&self) -> u64;
}

/// What a logged object does with gathered loggers.
///
/// [`LoggedObject`] handles the mechanics of core-local logger caching,
/// eviction, and synchronization; an implementation of this trait
/// decides how flushed entries reach the object's state. There may be
/// many logger instances per object; fresh ones are default-constructed
/// when a way is (re)claimed.
pub trait Flush: Send {
    /// The per-core log type handed out by [`LoggedObject::get_logger`].
    type Logger: Default + Send;

    /// Consumes or re-homes one logger's entries, leaving the logger in
    /// its initial state.
    ///
    /// Called with the object's sync lock and the logger's way lock
    /// held, so it never runs concurrently with itself or with
    /// [`Flush::flush_finish`] for the same object. Updating object
    /// state here is allowed but not required; ordered policies have to
    /// sit on the entries until the epoch's final flush.
    fn flush_logger(&mut self, logger: &mut Self::Logger);

    /// Final reconciliation, called once per synchronize after a
    /// consistent snapshot of the object's loggers has been gathered.
    fn flush_finish(&mut self);
}
