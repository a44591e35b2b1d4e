// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cursor-positioned output (`--cursor`): each refresh rewrites the same
//! terminal row with an absolute cursor move instead of `\r`.
//!
//! A per-tty lock file serialises the row probe between racing starters.
//! Coordinating a shared row across several concurrent instances is a
//! host-environment concern and is not attempted here.

use std::ffi::CStr;
use std::io;
use std::mem;
use std::path::PathBuf;

use log::debug;

use crate::config::Config;
use crate::flags;
use crate::terminal;

/// Cursor positioning state for one display.
#[derive(Debug, Default)]
pub struct CursorState {
    lock_file: Option<PathBuf>,
    lock_fd: libc::c_int,
    /// Terminal row (1-based) this display owns.
    y_start: u16,
    disabled: bool,
}

/// `$TMPDIR`, `$TMP`, or `/tmp`.
pub fn temp_dir() -> PathBuf {
    for variable in ["TMPDIR", "TMP"] {
        if let Ok(value) = std::env::var(variable) {
            if !value.is_empty() {
                return PathBuf::from(value);
            }
        }
    }
    PathBuf::from("/tmp")
}

/// Ask the terminal where the cursor is (CPR), reading the reply from
/// the terminal fd with canonical mode and echo briefly disabled.
fn read_cursor_row(fd: libc::c_int) -> Option<u16> {
    // SAFETY: termios structs are zeroed and only written by tcgetattr;
    // the original attributes are restored before returning.
    unsafe {
        let mut saved: libc::termios = mem::zeroed();
        if libc::tcgetattr(fd, &mut saved) != 0 {
            return None;
        }
        let mut raw = saved;
        raw.c_lflag &= !(libc::ICANON | libc::ECHO);
        raw.c_cc[libc::VMIN] = 0;
        raw.c_cc[libc::VTIME] = 5;
        if libc::tcsetattr(fd, libc::TCSANOW, &raw) != 0 {
            return None;
        }

        terminal::write_retry(fd, b"\x1b[6n");

        // Expected reply: ESC [ row ; col R
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = libc::read(fd, byte.as_mut_ptr() as *mut libc::c_void, 1);
            if n != 1 {
                break;
            }
            reply.push(byte[0]);
            if byte[0] == b'R' || reply.len() > 16 {
                break;
            }
        }

        libc::tcsetattr(fd, libc::TCSANOW, &saved);

        let text = String::from_utf8_lossy(&reply);
        let digits: String = text
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse::<u16>().ok()
    }
}

impl CursorState {
    /// Prepare cursor positioning: take the per-tty lock, learn our row,
    /// and release the lock.
    pub fn init(&mut self, control: &Config) {
        if !control.cursor {
            return;
        }
        self.lock_fd = -1;

        // SAFETY: ttyname returns a static buffer or null.
        let tty = unsafe {
            let name = libc::ttyname(libc::STDERR_FILENO);
            if name.is_null() {
                None
            } else {
                Some(CStr::from_ptr(name).to_string_lossy().into_owned())
            }
        };
        let Some(tty) = tty else {
            if !control.force {
                terminal::error_msg("failed to get terminal name");
            }
            self.disabled = true;
            return;
        };

        let tty_base = tty.rsplit('/').next().unwrap_or("tty").to_string();
        // SAFETY: geteuid takes no arguments.
        let euid = unsafe { libc::geteuid() };
        let lock_path = temp_dir().join(format!("pipemeter-{}-{}.lock", tty_base, euid));

        let c_path = match std::ffi::CString::new(lock_path.to_string_lossy().as_bytes()) {
            Ok(p) => p,
            Err(_) => {
                self.disabled = true;
                return;
            }
        };
        // SAFETY: open takes a valid C string; the result is checked.
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_NOFOLLOW,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 {
            terminal::error_msg(&format!(
                "{}: failed to open lock file: {}",
                lock_path.display(),
                io::Error::last_os_error()
            ));
            self.disabled = true;
            return;
        }
        self.lock_fd = fd;
        self.lock_file = Some(lock_path);

        // Exclusive lock while we probe the cursor row.
        // SAFETY: the flock struct is fully initialised.
        unsafe {
            let mut lock: libc::flock = mem::zeroed();
            lock.l_type = libc::F_WRLCK as libc::c_short;
            lock.l_whence = libc::SEEK_SET as libc::c_short;
            if libc::fcntl(fd, libc::F_SETLKW, &lock) != 0 {
                debug!("lock failed: {}", io::Error::last_os_error());
            }
        }

        self.y_start = read_cursor_row(libc::STDERR_FILENO).unwrap_or(1);

        // SAFETY: as above, releasing the lock.
        unsafe {
            let mut lock: libc::flock = mem::zeroed();
            lock.l_type = libc::F_UNLCK as libc::c_short;
            lock.l_whence = libc::SEEK_SET as libc::c_short;
            libc::fcntl(fd, libc::F_SETLK, &lock);
        }
    }

    /// Rewrite our terminal row with the new display line.
    pub fn update(&mut self, _control: &Config, line: &str) {
        if self.disabled {
            return;
        }
        let signal_flags = flags::flags();
        let position = format!("\x1b[{};1H", self.y_start.max(1));
        terminal::tty_write(signal_flags, position.as_bytes());
        terminal::tty_write(signal_flags, line.as_bytes());
    }

    /// Leave the cursor on the line after ours and clean up the lock
    /// file.
    pub fn fini(&mut self, control: &Config) {
        if self.disabled || !control.cursor {
            return;
        }
        let signal_flags = flags::flags();
        let position = format!("\x1b[{};1H\n", self.y_start.max(1));
        terminal::tty_write(signal_flags, position.as_bytes());

        if self.lock_fd >= 0 {
            // SAFETY: closing an fd we own.
            unsafe {
                libc::close(self.lock_fd);
            }
            self.lock_fd = -1;
        }
        if let Some(path) = self.lock_file.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_dir_honours_environment() {
        let dir = temp_dir();
        assert!(!dir.as_os_str().is_empty());
    }

    #[test]
    fn init_without_cursor_mode_is_inert() {
        let mut cursor = CursorState::default();
        let control = Config::default();
        cursor.init(&control);
        assert!(!cursor.disabled);
        assert!(cursor.lock_file.is_none());
    }
}
