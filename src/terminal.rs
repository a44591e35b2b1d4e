// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Terminal plumbing: size detection, foreground checks, suspended-aware
//! writes, error reporting, and the one-time colour capability probe.

use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use once_cell::sync::OnceCell;

use crate::flags::SignalFlags;

static ERROR_PREFIX: OnceCell<String> = OnceCell::new();
static OUTPUT_PRODUCED: AtomicBool = AtomicBool::new(false);

/// Set the prefix (program name) used for error messages.
pub fn set_error_prefix(prefix: &str) {
    let _ = ERROR_PREFIX.set(prefix.to_string());
}

/// Record that a progress line has been written, so that subsequent error
/// messages are preceded by a newline and do not clobber it.
pub fn note_output_produced() {
    OUTPUT_PRODUCED.store(true, Ordering::SeqCst);
}

/// Emit a user-facing error line on stderr, prefixed with the program
/// name.
pub fn error_msg(message: &str) {
    let newline = if OUTPUT_PRODUCED.load(Ordering::SeqCst) {
        "\n"
    } else {
        ""
    };
    match ERROR_PREFIX.get() {
        Some(prefix) => eprintln!("{}{}: {}", newline, prefix, message),
        None => eprintln!("{}{}", newline, message),
    }
}

/// Fill in the current terminal size from stderr, if it is a terminal.
pub fn screen_size() -> Option<(u16, u16)> {
    // SAFETY: isatty takes no pointers; TIOCGWINSZ only writes into the
    // zeroed winsize and the return value is checked.
    unsafe {
        if libc::isatty(libc::STDERR_FILENO) == 0 {
            return None;
        }
        let mut wsz: libc::winsize = std::mem::zeroed();
        if libc::ioctl(libc::STDERR_FILENO, libc::TIOCGWINSZ, &mut wsz) != 0 {
            return None;
        }
        Some((wsz.ws_col, wsz.ws_row))
    }
}

/// Return true if we are the foreground process on the terminal, or if
/// stderr is not a terminal at all.
pub fn in_foreground() -> bool {
    // SAFETY: these calls take no pointers and return plain values.
    unsafe {
        if libc::isatty(libc::STDERR_FILENO) == 0 {
            return true;
        }
        let ours = libc::getpgrp();
        let ttys = libc::tcgetpgrp(libc::STDERR_FILENO);
        if ttys == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ENOTTY) {
            return true;
        }
        ours == ttys
    }
}

/// Write the whole buffer to the given fd, retrying on EINTR/EAGAIN and
/// giving up silently on any other error.
pub fn write_retry(fd: libc::c_int, mut buf: &[u8]) {
    while !buf.is_empty() {
        // SAFETY: the pointer/length pair comes from a live slice and the
        // return value is checked before use.
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) || err.raw_os_error() == Some(libc::EAGAIN)
            {
                continue;
            }
            return;
        }
        if n < 1 {
            return;
        }
        buf = &buf[n as usize..];
    }
}

/// Write to the terminal (stderr) unless stderr writes are suspended
/// because we were backgrounded.
pub fn tty_write(flags: &SignalFlags, buf: &[u8]) {
    if flags.suspend_stderr.load(Ordering::SeqCst) {
        return;
    }
    write_retry(libc::STDERR_FILENO, buf);
}

/// Probe whether the terminal supports colour.  With `force`, colour is
/// assumed.  Otherwise the probe consults `TERM` and asks `tput colors`;
/// if the probe cannot run, support is assumed, matching the behaviour of
/// builds without a terminfo library.
pub fn colour_support(force: bool) -> bool {
    if force {
        return true;
    }
    let term = match std::env::var("TERM") {
        Ok(t) if !t.is_empty() => t,
        _ => return false,
    };
    match Command::new("tput").arg("colors").env("TERM", term).output() {
        Ok(output) => {
            let text = String::from_utf8_lossy(&output.stdout);
            match text.trim().parse::<i32>() {
                Ok(colours) => colours > 1,
                Err(_) => false,
            }
        }
        // No tput available - assume colour rather than degrade the
        // display on capable terminals.
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_retry_to_devnull() {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open("/dev/null")
            .unwrap();
        use std::os::unix::io::AsRawFd;
        write_retry(file.as_raw_fd(), b"hello");
    }

    #[test]
    fn foreground_without_tty_is_true() {
        // Test harnesses normally run without a controlling terminal on
        // stderr, in which case the answer must be true.
        // SAFETY: isatty takes no pointers.
        if unsafe { libc::isatty(libc::STDERR_FILENO) } == 0 {
            assert!(in_foreground());
        }
    }
}
