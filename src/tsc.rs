// Copyright © 2019-2022 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reads the time-stamp counter that orders logged operations.
//!
//! The counter is assumed to be synchronized across cores (invariant
//! TSC on anything recent). What matters for the log is that a stamp
//! taken while holding a way lock is ordered after the lock acquisition;
//! `rdtscp` gives us that directly, and the fallbacks serialize by hand.

/// Returns the current value of the time-stamp counter.
///
/// Uses `rdtscp` when CPUID advertises it: all older instructions retire
/// before `rdtscp` samples the counter. Otherwise falls back to
/// `lfence; rdtsc`, which serializes the sampling the slow way.
#[cfg(target_arch = "x86_64")]
pub fn read() -> u64 {
    use core::arch::x86_64::{__rdtscp, _mm_lfence, _rdtsc};
    use core::sync::atomic::{AtomicU8, Ordering};

    const UNPROBED: u8 = 0;
    const PRESENT: u8 = 1;
    const ABSENT: u8 = 2;

    static HAS_RDTSCP: AtomicU8 = AtomicU8::new(UNPROBED);

    let mut has = HAS_RDTSCP.load(Ordering::Relaxed);
    if has == UNPROBED {
        has = if probe_rdtscp() { PRESENT } else { ABSENT };
        HAS_RDTSCP.store(has, Ordering::Relaxed);
    }

    unsafe {
        if has == PRESENT {
            let mut aux = 0u32;
            __rdtscp(&mut aux)
        } else {
            _mm_lfence();
            _rdtsc()
        }
    }
}

/// RDTSCP support is CPUID.80000001H:EDX[27].
#[cfg(target_arch = "x86_64")]
fn probe_rdtscp() -> bool {
    use core::arch::x86_64::__cpuid;

    let max_extended = unsafe { __cpuid(0x8000_0000) }.eax;
    if max_extended < 0x8000_0001 {
        return false;
    }
    unsafe { __cpuid(0x8000_0001) }.edx & (1 << 27) != 0
}

/// Returns the current value of the generic counter.
///
/// `cntvct_el0` is constant-frequency and synchronized across cores; the
/// `isb` keeps the read from issuing ahead of older instructions.
#[cfg(target_arch = "aarch64")]
pub fn read() -> u64 {
    let ticks: u64;
    unsafe {
        core::arch::asm!(
            "isb",
            "mrs {t}, cntvct_el0",
            t = out(reg) ticks,
            options(nomem, nostack)
        );
    }
    ticks
}

/// No hardware counter we can trust here; a global tick keeps stamps
/// unique and monotonic, which is all the merge needs.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn read() -> u64 {
    use core::sync::atomic::{AtomicU64, Ordering};

    static TICKS: AtomicU64 = AtomicU64::new(0);
    TICKS.fetch_add(1, Ordering::SeqCst)
}
