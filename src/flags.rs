// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Process-wide flags shared between signal handlers and the main loop.
//!
//! Signal handlers may run at any suspension point of the single worker
//! thread, so everything they touch lives in this fixed set of atomics.
//! Handlers only ever store into these fields; the loops read them at
//! defined polling points.  No handler dereferences program state.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// All transient flags, one instance per process.
pub struct SignalFlags {
    /// The format string must be re-parsed before the next render.
    pub reparse_display: AtomicBool,
    /// The terminal was resized (SIGWINCH, or SIGCONT after a stop).
    pub terminal_resized: AtomicBool,
    /// A termination signal arrived; loops must wind down.
    pub trigger_exit: AtomicBool,
    /// We set TOSTOP on the terminal and must clear it on exit.
    pub clear_tostop_on_exit: AtomicBool,
    /// Writes to stderr are suspended (we are backgrounded).
    pub suspend_stderr: AtomicBool,
    /// How many following SIGCONTs to ignore (raised by the TTOU handler).
    /// Decrements saturate at zero.
    pub skip_next_sigcont: AtomicU32,
    /// The output pipe was closed by the reader (EPIPE observed).
    pub pipe_closed: AtomicBool,
    /// A SIGUSR1 (query channel) arrived; sender pid recorded alongside.
    pub rx_usr1: AtomicBool,
    pub usr1_sender: AtomicI32,
    /// A SIGUSR2 (remote-control channel) arrived; sender pid alongside.
    pub rx_usr2: AtomicBool,
    pub usr2_sender: AtomicI32,
    /// Monotonic nanoseconds at which SIGTSTP arrived, 0 when not stopped.
    pub tstp_arrived_ns: AtomicU64,
    /// Cumulative nanoseconds spent stopped (SIGTSTP..SIGCONT).
    pub stoppage_ns: AtomicU64,
}

impl SignalFlags {
    const fn new() -> Self {
        SignalFlags {
            reparse_display: AtomicBool::new(true),
            terminal_resized: AtomicBool::new(false),
            trigger_exit: AtomicBool::new(false),
            clear_tostop_on_exit: AtomicBool::new(false),
            suspend_stderr: AtomicBool::new(false),
            skip_next_sigcont: AtomicU32::new(0),
            pipe_closed: AtomicBool::new(false),
            rx_usr1: AtomicBool::new(false),
            usr1_sender: AtomicI32::new(0),
            rx_usr2: AtomicBool::new(false),
            usr2_sender: AtomicI32::new(0),
            tstp_arrived_ns: AtomicU64::new(0),
            stoppage_ns: AtomicU64::new(0),
        }
    }

    /// Total time spent stopped so far.
    pub fn total_stoppage(&self) -> Duration {
        Duration::from_nanos(self.stoppage_ns.load(Ordering::SeqCst))
    }

    /// Clear the stoppage counters, used when `--wait` restarts the clock
    /// once the first byte moves.
    pub fn reset_stoppage(&self) {
        self.stoppage_ns.store(0, Ordering::SeqCst);
        self.tstp_arrived_ns.store(0, Ordering::SeqCst);
    }

    /// Consume a pending SIGUSR2, returning the sender pid if one arrived
    /// since the last call.
    pub fn take_usr2(&self) -> Option<libc::pid_t> {
        if self.rx_usr2.swap(false, Ordering::SeqCst) {
            Some(self.usr2_sender.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    /// Consume a pending SIGUSR1, returning the sender pid if one arrived
    /// since the last call.
    pub fn take_usr1(&self) -> Option<libc::pid_t> {
        if self.rx_usr1.swap(false, Ordering::SeqCst) {
            Some(self.usr1_sender.load(Ordering::SeqCst))
        } else {
            None
        }
    }

    /// True once a termination signal has been seen.
    pub fn exit_requested(&self) -> bool {
        self.trigger_exit.load(Ordering::SeqCst)
    }
}

static FLAGS: SignalFlags = SignalFlags::new();

/// The process-wide flag set.
pub fn flags() -> &'static SignalFlags {
    &FLAGS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usr_flags_are_consumed() {
        let f = flags();
        f.usr2_sender.store(42, Ordering::SeqCst);
        f.rx_usr2.store(true, Ordering::SeqCst);
        assert_eq!(f.take_usr2(), Some(42));
        assert_eq!(f.take_usr2(), None);
    }

    #[test]
    fn stoppage_roundtrip() {
        let f = flags();
        f.stoppage_ns.store(1_500_000_000, Ordering::SeqCst);
        assert_eq!(f.total_stoppage(), Duration::from_millis(1500));
        f.reset_stoppage();
        assert_eq!(f.total_stoppage(), Duration::ZERO);
    }
}
