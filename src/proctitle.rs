// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Best-effort process title updates for the `proc` extra display.
//!
//! On Linux the kernel-visible task name (comm) is set with
//! `prctl(PR_SET_NAME)`, which `ps` shows with `-o comm` and top uses by
//! default.  The title is truncated to the 15 bytes the kernel keeps.
//! The environment is never touched.

use std::sync::Mutex;

use once_cell::sync::Lazy;

/// The most recently applied title, kept so tests and diagnostics can
/// observe what was set.
static CURRENT_TITLE: Lazy<Mutex<String>> = Lazy::new(|| Mutex::new(String::new()));

/// Apply a new process title.
pub fn set_title(title: &str) {
    if let Ok(mut current) = CURRENT_TITLE.lock() {
        if *current == title {
            return;
        }
        *current = title.to_string();
    }

    #[cfg(target_os = "linux")]
    {
        let mut comm = [0u8; 16];
        let bytes = title.as_bytes();
        let len = bytes.len().min(15);
        comm[..len].copy_from_slice(&bytes[..len]);
        // SAFETY: PR_SET_NAME reads a NUL-terminated buffer of at most
        // 16 bytes, which comm is.
        unsafe {
            libc::prctl(libc::PR_SET_NAME, comm.as_ptr() as libc::c_ulong, 0, 0, 0);
        }
    }
}

/// The title most recently set via [`set_title`].
pub fn current_title() -> String {
    CURRENT_TITLE
        .lock()
        .map(|current| current.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_recorded() {
        set_title("pipemeter -- test");
        assert_eq!(current_title(), "pipemeter -- test");
    }
}
