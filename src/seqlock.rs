// Copyright © 2019-2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A sequence-counter-protected 64-bit value.
//!
//! One core publishes; any core reads without taking a lock. Readers
//! retry until they observe the counter even and unchanged around the
//! value load. The counter snapshot a read returns also lets a waiter
//! detect a later publication ([`SeqValue::advanced`]), which is what
//! `wait_synchronize` spins on.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A 64-bit value published under a sequence counter. The counter is odd
/// while a write is in progress and even once the value is stable.
///
/// Writes must come from a single core at a time; this is not enforced.
pub struct SeqValue {
    seq: AtomicU32,
    value: AtomicU64,
}

impl SeqValue {
    /// Creates a published value with an even (stable) counter.
    pub const fn new(value: u64) -> SeqValue {
        SeqValue {
            seq: AtomicU32::new(0),
            value: AtomicU64::new(value),
        }
    }

    /// Publishes a new value.
    pub fn write(&self, value: u64) {
        let s = self.seq.load(Ordering::Relaxed);
        self.seq.store(s.wrapping_add(1), Ordering::Release);
        self.value.store(value, Ordering::Relaxed);
        self.seq.store(s.wrapping_add(2), Ordering::Release);
    }

    /// Returns a stable snapshot of the value together with the (even)
    /// counter observed around it.
    pub fn read(&self) -> (u64, u32) {
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 & 1 == 1 {
                spin_loop();
                continue;
            }
            let value = self.value.load(Ordering::Relaxed);
            let s2 = self.seq.load(Ordering::Acquire);
            if s1 == s2 {
                return (value, s2);
            }
            spin_loop();
        }
    }

    /// Whether the counter has moved past the snapshot `since`, i.e. a
    /// write has started or completed after the read that produced it.
    pub fn advanced(&self, since: u32) -> bool {
        self.seq.load(Ordering::Acquire) != since
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_read_initial() {
        let v = SeqValue::new(7);
        let (value, seq) = v.read();
        assert_eq!(value, 7);
        assert_eq!(seq & 1, 0);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let v = SeqValue::new(0);
        v.write(41);
        v.write(42);
        assert_eq!(v.read().0, 42);
    }

    /// A write advances the counter past any snapshot taken before it.
    #[test]
    fn test_advanced_after_write() {
        let v = SeqValue::new(0);
        let (_, seq) = v.read();
        assert!(!v.advanced(seq));
        v.write(1);
        assert!(v.advanced(seq));
    }

    /// Readers racing a writer only ever observe values the writer
    /// actually published.
    #[test]
    fn test_concurrent_reader_sees_published_values() {
        let v = Arc::new(SeqValue::new(0));
        let n = 10_000u64;

        let writer = {
            let v = v.clone();
            thread::spawn(move || {
                for i in 1..=n {
                    v.write(i * 2);
                }
            })
        };

        let reader = {
            let v = v.clone();
            thread::spawn(move || {
                let mut last = 0;
                for _ in 0..n {
                    let (value, _) = v.read();
                    assert_eq!(value % 2, 0);
                    assert!(value >= last);
                    last = value;
                }
            })
        };

        writer.join().expect("Writer didn't finish successfully.");
        reader.join().expect("Reader didn't finish successfully.");
    }
}
