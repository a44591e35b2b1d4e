// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Monotonic clock reads and elapsed-time arithmetic.
//!
//! All scheduling in the tool runs off CLOCK_MONOTONIC so that wall-clock
//! steps (NTP, DST) never distort rates or ETAs.  Times are carried around
//! as `Duration`s since an arbitrary epoch.

use std::time::Duration;

/// Read the monotonic clock.
pub fn monotonic() -> Duration {
    // SAFETY: the struct is zero-initialised and clock_gettime only writes
    // within it; the return value is checked.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if ret != 0 {
        // CLOCK_MONOTONIC is required by POSIX; nothing sensible can be
        // done if it fails, so fall back to zero rather than aborting a
        // transfer part-way through.
        return Duration::ZERO;
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// The elapsed transfer time in seconds: current time minus the start
/// time, less the total time the process spent stopped.
pub fn elapsed_transfer_seconds(start: Duration, now: Duration, stoppage: Duration) -> f64 {
    let effective_start = start + stoppage;
    now.saturating_sub(effective_start).as_secs_f64()
}

/// Convert a fractional seconds value into a `Duration`, clamping negative
/// inputs to zero.
pub fn duration_from_secs(seconds: f64) -> Duration {
    if seconds <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_advances() {
        let a = monotonic();
        let b = monotonic();
        assert!(b >= a);
    }

    #[test]
    fn elapsed_subtracts_stoppage() {
        let start = Duration::from_secs(100);
        let now = Duration::from_secs(110);
        let stopped = Duration::from_secs(4);
        assert!((elapsed_transfer_seconds(start, now, stopped) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn elapsed_never_negative() {
        let start = Duration::from_secs(100);
        let now = Duration::from_secs(101);
        let stopped = Duration::from_secs(10);
        assert_eq!(elapsed_transfer_seconds(start, now, stopped), 0.0);
    }

    #[test]
    fn duration_from_secs_clamps() {
        assert_eq!(duration_from_secs(-1.0), Duration::ZERO);
        assert_eq!(duration_from_secs(0.5), Duration::from_millis(500));
    }
}
