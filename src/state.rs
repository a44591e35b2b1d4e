// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The aggregate run state owned by the control loop.

use crate::calc::CalcState;
use crate::config::Config;
use crate::cursor::CursorState;
use crate::display::DisplayState;
use crate::status::ProgramStatus;
use crate::transfer::TransferState;

/// Everything a run owns: settings, counters, and display state.
pub struct State {
    pub status: ProgramStatus,
    pub control: Config,
    /// Ordered input list; `-` stands for stdin.
    pub files: Vec<String>,
    pub transfer: TransferState,
    pub calc: CalcState,
    pub display: DisplayState,
    pub extra_display: DisplayState,
    pub cursor: CursorState,
}

impl State {
    pub fn new(control: Config, files: Vec<String>, terminal_supports_utf8: bool) -> State {
        let mut calc = CalcState::default();
        calc.set_history_length(control.history_length());
        State {
            status: ProgramStatus::new(terminal_supports_utf8),
            control,
            files,
            transfer: TransferState::default(),
            calc,
            display: DisplayState::default(),
            extra_display: DisplayState::default(),
            cursor: CursorState::default(),
        }
    }

    /// Clear the calculated state between store-and-forward passes.
    pub fn reset(&mut self) {
        self.status.current_input = None;
        self.transfer.reset();
        self.calc.reset();
        self.display.reset();
        self.extra_display.reset();
        crate::flags::flags()
            .reparse_display
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}
