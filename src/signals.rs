// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Signal handling.
//!
//! Handlers store only into the atomic `SignalFlags`; the loops pick the
//! flags up at their polling points.  SIGALRM gets a do-nothing handler
//! (not SIG_IGN) purely so that a pending alarm interrupts a blocking
//! write with EINTR.

use std::io;
use std::mem;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::debug;

use crate::clock;
use crate::flags;
use crate::terminal;

extern "C" fn handle_term(_signo: libc::c_int) {
    flags::flags().trigger_exit.store(true, Ordering::SeqCst);
}

extern "C" fn handle_winch(_signo: libc::c_int) {
    flags::flags().terminal_resized.store(true, Ordering::SeqCst);
}

extern "C" fn handle_alrm(_signo: libc::c_int) {
    // Nothing: the signal exists so write() returns EINTR.
}

/// SIGTTOU: we tried to write to the terminal from the background.
/// Suspend stderr, and kick the rest of the process group back awake with
/// SIGCONT, since backgrounding one member of a pipeline stops all of it.
extern "C" fn handle_ttou(_signo: libc::c_int) {
    let f = flags::flags();
    if !f.suspend_stderr.swap(true, Ordering::SeqCst) {
        // Tell our own SIGCONT handler to ignore the CONT we now raise.
        f.skip_next_sigcont.fetch_add(1, Ordering::SeqCst);
        // SAFETY: killpg with our own process group; failure is ignorable.
        unsafe {
            libc::killpg(libc::getpgrp(), libc::SIGCONT);
        }
    }
}

/// SIGTSTP: remember when we stopped, then actually stop.
extern "C" fn handle_tstp(_signo: libc::c_int) {
    let now = clock::monotonic();
    flags::flags()
        .tstp_arrived_ns
        .store(now.as_nanos() as u64, Ordering::SeqCst);
    // SAFETY: raising a signal on ourselves.
    unsafe {
        libc::raise(libc::SIGSTOP);
    }
}

/// SIGCONT: account the stopped time, treat it like a resize, and try to
/// resume terminal output if we are foreground again.
extern "C" fn handle_cont(_signo: libc::c_int) {
    let f = flags::flags();

    // A CONT we raised ourselves from the TTOU handler must not be
    // treated as a resume.  The counter saturates at zero.
    let skip = f.skip_next_sigcont.load(Ordering::SeqCst);
    if skip > 0 {
        f.skip_next_sigcont.store(skip - 1, Ordering::SeqCst);
        return;
    }

    f.terminal_resized.store(true, Ordering::SeqCst);

    let stopped_at = f.tstp_arrived_ns.swap(0, Ordering::SeqCst);
    if stopped_at != 0 {
        let now = clock::monotonic().as_nanos() as u64;
        let stopped_for = now.saturating_sub(stopped_at);
        f.stoppage_ns.fetch_add(stopped_for, Ordering::SeqCst);
    }

    if f.suspend_stderr.load(Ordering::SeqCst) && terminal::in_foreground() {
        f.suspend_stderr.store(false, Ordering::SeqCst);
    }

    if !f.suspend_stderr.load(Ordering::SeqCst) {
        ensure_tty_tostop();
    }
}

extern "C" fn handle_usr1(
    _signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    if info.is_null() {
        return;
    }
    let f = flags::flags();
    f.usr1_sender
        .store(crate::sys::siginfo_pid(info), Ordering::SeqCst);
    f.rx_usr1.store(true, Ordering::SeqCst);
}

extern "C" fn handle_usr2(
    _signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    if info.is_null() {
        return;
    }
    let f = flags::flags();
    f.usr2_sender
        .store(crate::sys::siginfo_pid(info), Ordering::SeqCst);
    f.rx_usr2.store(true, Ordering::SeqCst);
}

/// Ensure the terminal's TOSTOP attribute is set, so writing from the
/// background raises SIGTTOU.  Remember when we were the one to set it.
fn ensure_tty_tostop() {
    let f = flags::flags();
    if f.suspend_stderr.load(Ordering::SeqCst) {
        return;
    }

    // SAFETY: tcgetattr/tcsetattr only touch the termios we hand them.
    unsafe {
        let mut attrs: libc::termios = mem::zeroed();
        if libc::tcgetattr(libc::STDERR_FILENO, &mut attrs) != 0 {
            return;
        }
        if f.suspend_stderr.load(Ordering::SeqCst) {
            return;
        }
        if attrs.c_lflag & libc::TOSTOP == 0 {
            attrs.c_lflag |= libc::TOSTOP;
            if libc::tcsetattr(libc::STDERR_FILENO, libc::TCSANOW, &attrs) == 0 {
                f.clear_tostop_on_exit.store(true, Ordering::SeqCst);
            }
        }
    }
}

/// Clear the TOSTOP attribute if we were the one to set it and we are in
/// the foreground to do so.
fn clear_tty_tostop() {
    let f = flags::flags();
    if !f.clear_tostop_on_exit.load(Ordering::SeqCst) {
        return;
    }
    if !terminal::in_foreground() {
        return;
    }
    // SAFETY: as in ensure_tty_tostop.
    unsafe {
        let mut attrs: libc::termios = mem::zeroed();
        if libc::tcgetattr(libc::STDERR_FILENO, &mut attrs) != 0 {
            return;
        }
        if attrs.c_lflag & libc::TOSTOP != 0 {
            attrs.c_lflag &= !libc::TOSTOP;
            let _ = libc::tcsetattr(libc::STDERR_FILENO, libc::TCSANOW, &attrs);
        }
    }
    f.clear_tostop_on_exit.store(false, Ordering::SeqCst);
}

/// Installed signal dispositions, restored on drop.
pub struct SignalGuard {
    saved: Vec<(libc::c_int, libc::sigaction)>,
}

type Handler = extern "C" fn(libc::c_int);
type InfoHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

fn install(
    signo: libc::c_int,
    handler: usize,
    siginfo: bool,
) -> io::Result<(libc::c_int, libc::sigaction)> {
    // SAFETY: the sigaction structs are fully initialised before use and
    // the handler addresses point at extern "C" functions with the
    // correct signatures for the chosen sa_flags.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        let mut old: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = if siginfo { libc::SA_SIGINFO } else { 0 };
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signo, &action, &mut old) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((signo, old))
    }
}

impl SignalGuard {
    /// Install all handlers and set up terminal stop behaviour.
    pub fn install() -> io::Result<SignalGuard> {
        let mut saved = Vec::new();

        // Ignore SIGPIPE; EPIPE at the write site is the orderly path.
        saved.push(install(libc::SIGPIPE, libc::SIG_IGN, false)?);
        saved.push(install(libc::SIGTTOU, handle_ttou as Handler as usize, false)?);
        saved.push(install(libc::SIGTSTP, handle_tstp as Handler as usize, false)?);
        saved.push(install(libc::SIGCONT, handle_cont as Handler as usize, false)?);
        saved.push(install(libc::SIGWINCH, handle_winch as Handler as usize, false)?);
        saved.push(install(libc::SIGINT, handle_term as Handler as usize, false)?);
        saved.push(install(libc::SIGHUP, handle_term as Handler as usize, false)?);
        saved.push(install(libc::SIGTERM, handle_term as Handler as usize, false)?);
        saved.push(install(libc::SIGUSR1, handle_usr1 as InfoHandler as usize, true)?);
        saved.push(install(libc::SIGUSR2, handle_usr2 as InfoHandler as usize, true)?);
        saved.push(install(libc::SIGALRM, handle_alrm as Handler as usize, false)?);

        ensure_tty_tostop();

        Ok(SignalGuard { saved })
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        for (signo, old) in self.saved.drain(..) {
            // SAFETY: restoring a disposition previously returned by
            // sigaction for the same signal.
            unsafe {
                libc::sigaction(signo, &old, std::ptr::null_mut());
            }
        }
        clear_tty_tostop();
    }
}

/// Block SIGTSTP and SIGCONT while the caller adjusts the stoppage-time
/// counters, so a pause cannot interleave with the reset.
pub fn block_pause() {
    // SAFETY: the sets are initialised by sigemptyset before use.
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGTSTP);
        libc::sigaddset(&mut set, libc::SIGCONT);
        if libc::sigprocmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
            debug!("sigprocmask block failed: {}", io::Error::last_os_error());
        }
    }
}

/// Start reacting to SIGTSTP and SIGCONT again.
pub fn allow_pause() {
    // SAFETY: as in block_pause.
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGTSTP);
        libc::sigaddset(&mut set, libc::SIGCONT);
        if libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut()) != 0 {
            debug!("sigprocmask unblock failed: {}", io::Error::last_os_error());
        }
    }
}

/// If stderr was suspended, check about once a second whether we are
/// foreground again, and resume output if so.
pub fn check_background() {
    static NEXT_CHECK_NS: AtomicU64 = AtomicU64::new(0);

    let now = clock::monotonic();
    if (now.as_nanos() as u64) < NEXT_CHECK_NS.load(Ordering::SeqCst) {
        return;
    }
    NEXT_CHECK_NS.store(
        (now + Duration::from_secs(1)).as_nanos() as u64,
        Ordering::SeqCst,
    );

    let f = flags::flags();
    if !f.suspend_stderr.load(Ordering::SeqCst) {
        return;
    }
    if !terminal::in_foreground() {
        return;
    }
    debug!("foreground again - resuming stderr");
    f.suspend_stderr.store(false, Ordering::SeqCst);
    ensure_tty_tostop();
}

/// Arm a one-shot interval timer so that a blocking write is interrupted
/// by SIGALRM after roughly `seconds`.  The timer repeats at the same
/// period in case the first expiry lands before the write starts.
pub fn arm_write_alarm(seconds: f64) {
    let seconds = seconds.max(0.000_001);
    // SAFETY: the itimerval is fully initialised; setitimer reads it only.
    unsafe {
        let mut timer: libc::itimerval = mem::zeroed();
        timer.it_value.tv_sec = seconds as libc::time_t;
        timer.it_value.tv_usec = ((seconds * 1_000_000.0) as libc::suseconds_t) % 1_000_000;
        timer.it_interval = timer.it_value;
        if libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) != 0 {
            terminal::error_msg(&format!(
                "failed to set interval timer: {}",
                io::Error::last_os_error()
            ));
        }
    }
}

/// Disarm the write-interruption timer.
pub fn clear_write_alarm() {
    // SAFETY: zeroed itimerval disarms the timer.
    unsafe {
        let timer: libc::itimerval = mem::zeroed();
        if libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) != 0 {
            terminal::error_msg(&format!(
                "failed to clear interval timer: {}",
                io::Error::last_os_error()
            ));
        }
    }
}
