// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Program status: the accumulated exit code and per-run terminal facts.

/// Exit-code bits; any combination may be OR'd together over a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitStatus(pub i32);

impl ExitStatus {
    /// Generic transfer error (read/write/select failure).
    pub const TRANSFER: ExitStatus = ExitStatus(1);
    /// Memory or resource allocation problem.
    pub const MEMORY: ExitStatus = ExitStatus(2);
    /// Access or permission problem with a named file or pid.
    pub const ACCESS: ExitStatus = ExitStatus(4);
    /// Remote control, query, or pid-file failure.
    pub const REMOTE_OR_PID: ExitStatus = ExitStatus(8);
    /// Store-and-forward staging failure.
    pub const STORE_AND_FORWARD: ExitStatus = ExitStatus(16);
    /// Terminated by a signal.
    pub const SIGNAL: ExitStatus = ExitStatus(32);

    pub fn add(&mut self, bit: ExitStatus) {
        self.0 |= bit.0;
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    pub fn code(self) -> i32 {
        self.0
    }
}

/// Facts established once per run and read everywhere.
#[derive(Debug, Clone, Default)]
pub struct ProgramStatus {
    pub exit: ExitStatus,
    /// Index of the input currently being read, if any.
    pub current_input: Option<usize>,
    /// Current working directory, used to shorten watch-fd paths.
    pub cwd: String,
    pub terminal_supports_utf8: bool,
    pub terminal_supports_colour: bool,
    pub checked_colour_support: bool,
}

impl ProgramStatus {
    pub fn new(terminal_supports_utf8: bool) -> Self {
        // The cwd is only a prefix-stripping aid; if it cannot be read, or
        // is the root directory, full paths are shown instead.
        let cwd = std::env::current_dir()
            .ok()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| p.len() > 1)
            .unwrap_or_default();
        ProgramStatus {
            cwd,
            terminal_supports_utf8,
            ..Default::default()
        }
    }
}
