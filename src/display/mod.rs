// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The display formatter: a parsed segment array is laid out in two
//! passes (fixed widths first, then the remaining screen space divided
//! among the elastic segments) and concatenated into one refresh line.

pub mod bar;
pub mod formatters;
pub mod parse;
pub mod sgr;

use std::sync::atomic::Ordering;

use unicode_width::UnicodeWidthStr;

use crate::calc::CalcState;
use crate::config::Config;
use crate::config::EXTRA_DISPLAY_PROCESS_TITLE;
use crate::config::EXTRA_DISPLAY_WINDOW_TITLE;
use crate::cursor::CursorState;
use crate::flags;
use crate::proctitle;
use crate::signals;
use crate::status::ProgramStatus;
use crate::terminal;
use crate::transfer::TransferState;
use crate::units::TransferCount;
use bar::BarStyle;

/// Upper bound on parsed segments per format string.
pub const MAX_FORMAT_SEGMENTS: usize = 100;
/// At most this many distinct bar styles per display.
pub const MAX_BAR_STYLES: usize = 4;
/// Most trailing spaces appended when the rendered line shrinks.
const MAX_SHRINK_PADDING: usize = 15;

/// The formatter a segment renders with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatterKind {
    Progress,
    ProgressAmountOnly,
    BarDefault,
    BarPlain,
    BarBlock,
    BarGranular,
    BarShaded,
    Timer,
    Eta,
    FinEta,
    Rate,
    AverageRate,
    Bytes,
    BufferPercent,
    LastWritten,
    PreviousLine,
    Name,
    Sgr,
}

impl FormatterKind {
    /// Whether the segment's width scales with the remaining terminal
    /// space when no explicit width was chosen.
    pub fn elastic(self) -> bool {
        matches!(
            self,
            FormatterKind::Progress
                | FormatterKind::BarDefault
                | FormatterKind::BarPlain
                | FormatterKind::BarBlock
                | FormatterKind::BarGranular
                | FormatterKind::BarShaded
                | FormatterKind::PreviousLine
        )
    }
}

#[derive(Debug, Clone)]
pub enum SegmentKind {
    /// Verbatim text from the format string.
    Literal(String),
    Formatter(FormatterKind),
}

/// One parsed piece of the format string.
#[derive(Debug, Clone)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Fixed width from a numeric prefix such as `%16A`; 0 = none.
    pub chosen_size: usize,
    /// Bar style index + 1; 0 = not yet assigned.
    pub parameter: u8,
    /// The argument after the colon in `%{sgr:...}`.
    pub arg: Option<String>,
}

/// Everything the formatters read while rendering.
pub struct FormatterArgs<'a> {
    pub status: &'a ProgramStatus,
    pub control: &'a Config,
    pub transfer: &'a TransferState,
    pub calc: &'a CalcState,
}

/// Per-display state: the parsed segments, bar styles in use, and the
/// assembled output line.
#[derive(Debug, Clone)]
pub struct DisplayState {
    pub segments: Vec<Segment>,
    pub barstyles: Vec<BarStyle>,
    /// The assembled refresh line.
    pub buffer: String,
    /// Offset already transferred when the display began (watch mode).
    pub initial_offset: i64,
    pub count_type: TransferCount,
    prev_screen_width: usize,
    display_string_width: usize,
    /// Largest last-written window any `%A` segment has asked for.
    pub lastwritten_bytes: usize,
    pub showing_timer: bool,
    pub showing_bytes: bool,
    pub showing_rate: bool,
    pub showing_last_written: bool,
    pub showing_previous_line: bool,
    pub format_uses_colour: bool,
    pub colour_permitted: bool,
    pub sgr_code_active: bool,
    pub final_update: bool,
    pub output_produced: bool,
}

impl Default for DisplayState {
    fn default() -> Self {
        DisplayState {
            segments: Vec::new(),
            barstyles: Vec::new(),
            buffer: String::new(),
            initial_offset: 0,
            count_type: TransferCount::Bytes,
            prev_screen_width: 0,
            display_string_width: 0,
            lastwritten_bytes: 0,
            showing_timer: false,
            showing_bytes: false,
            showing_rate: false,
            showing_last_written: false,
            showing_previous_line: false,
            format_uses_colour: false,
            colour_permitted: true,
            sgr_code_active: false,
            final_update: false,
            output_produced: false,
        }
    }
}

impl DisplayState {
    /// Reset the per-run parts, keeping parsed structure.
    pub fn reset(&mut self) {
        self.initial_offset = 0;
        self.output_produced = false;
    }
}

/// Displayed width of a string: ECMA-48 CSI sequences are skipped, then
/// the remainder is measured in terminal columns.
pub fn display_width(text: &str) -> usize {
    if !text.contains('\x1b') {
        return text.width();
    }
    let bytes = text.as_bytes();
    let mut stripped = Vec::with_capacity(bytes.len());
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] == 0x1b && pos + 1 < bytes.len() && bytes[pos + 1] == b'[' {
            pos += 2;
            while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b';') {
                pos += 1;
            }
            // The final command byte of the sequence.
            if pos < bytes.len() {
                pos += 1;
            }
            continue;
        }
        stripped.push(bytes[pos]);
        pos += 1;
    }
    String::from_utf8_lossy(&stripped).width()
}

/// Rebuild the display buffer from the current state.  With
/// `reinitialise`, the format string is reparsed first.  Returns false
/// if there is nothing to render.
#[allow(clippy::too_many_arguments)]
pub fn format(
    display: &mut DisplayState,
    status: &mut ProgramStatus,
    control: &Config,
    transfer: &TransferState,
    calc: &CalcState,
    format_supplied: Option<&str>,
    reinitialise: bool,
    final_update: bool,
) -> bool {
    display.final_update = final_update;

    if reinitialise {
        parse::parse_format(display, status, control, transfer, calc, format_supplied);
    }

    if display.segments.is_empty() {
        return false;
    }

    display.count_type = control.count_type();
    display.sgr_code_active = false;

    let width_budget = usize::from(control.width);

    // First pass: literals and fixed-width formatters, accumulating the
    // width they consume.
    let mut rendered: Vec<Option<String>> = vec![None; display.segments.len()];
    let mut widths: Vec<usize> = vec![0; display.segments.len()];
    let mut static_portion_width = 0usize;
    let mut elastic_count = 0usize;

    let args = FormatterArgs {
        status: &*status,
        control,
        transfer,
        calc,
    };

    for idx in 0..display.segments.len() {
        match display.segments[idx].kind.clone() {
            SegmentKind::Literal(text) => {
                let width = display_width(&text);
                widths[idx] = width;
                static_portion_width += width;
                rendered[idx] = Some(text);
            }
            SegmentKind::Formatter(kind) => {
                let chosen = display.segments[idx].chosen_size;
                if kind.elastic() && chosen == 0 {
                    elastic_count += 1;
                    continue;
                }
                let text =
                    formatters::render_segment(display, idx, kind, chosen, &args, false);
                let width = display_width(&text);
                widths[idx] = width;
                static_portion_width += width;
                rendered[idx] = Some(text);
            }
        }
    }

    // Second pass: the remaining columns are divided equally among the
    // elastic segments.
    let mut elastic_width = width_budget.saturating_sub(static_portion_width);
    if elastic_count > 1 {
        elastic_width /= elastic_count;
    }

    for idx in 0..display.segments.len() {
        if rendered[idx].is_some() {
            continue;
        }
        if let SegmentKind::Formatter(kind) = display.segments[idx].kind.clone() {
            let text =
                formatters::render_segment(display, idx, kind, elastic_width, &args, false);
            widths[idx] = display_width(&text);
            rendered[idx] = Some(text);
        }
    }

    let mut line = String::new();
    let mut new_width = 0usize;
    for (idx, piece) in rendered.into_iter().enumerate() {
        if let Some(piece) = piece {
            line.push_str(&piece);
            new_width += widths[idx];
        }
    }

    // Never leave an SGR attribute running off the end of the line.
    if display.sgr_code_active {
        line.push_str("\x1b[m");
        display.sgr_code_active = false;
    }

    // When the rendered line shrinks, trailing spaces erase the residue
    // of the previous one.
    if new_width < display.display_string_width && width_budget >= display.prev_screen_width {
        let spaces = (display.display_string_width - new_width).min(MAX_SHRINK_PADDING);
        line.extend(std::iter::repeat(' ').take(spaces));
        new_width += spaces;
    }

    display.display_string_width = new_width;
    display.prev_screen_width = width_budget;
    display.buffer = line;

    true
}

/// Produce one refresh: recalculate rates, reformat, and write the line
/// (and any extra displays) to the terminal.
#[allow(clippy::too_many_arguments)]
pub fn show(
    display: &mut DisplayState,
    mut extra_display: Option<&mut DisplayState>,
    status: &mut ProgramStatus,
    control: &Config,
    transfer: &TransferState,
    calc: &mut CalcState,
    cursor: &mut CursorState,
    final_update: bool,
) {
    signals::check_background();

    calc.update(transfer, control, display.initial_offset, final_update);

    // Colour never goes to the window or process title.
    display.colour_permitted = true;
    if let Some(extra) = extra_display.as_deref_mut() {
        extra.colour_permitted = false;
    }

    let reinitialise = flags::flags().reparse_display.swap(false, Ordering::SeqCst);

    if !format(
        display,
        status,
        control,
        transfer,
        calc,
        control.format_string.as_deref(),
        reinitialise,
        final_update,
    ) {
        return;
    }

    if let Some(extra) = extra_display.as_deref_mut() {
        if control.extra_displays != 0
            && !format(
                extra,
                status,
                control,
                transfer,
                calc,
                control.extra_format_string.as_deref(),
                reinitialise,
                final_update,
            )
        {
            return;
        }
    }

    let signal_flags = flags::flags();

    if control.numeric {
        terminal::tty_write(signal_flags, display.buffer.as_bytes());
        terminal::tty_write(signal_flags, b"\n");
        display.output_produced = true;
        terminal::note_output_produced();
    } else if control.cursor {
        if control.force || terminal::in_foreground() {
            cursor.update(control, &display.buffer);
            display.output_produced = true;
            terminal::note_output_produced();
        }
    } else if control.force || terminal::in_foreground() {
        terminal::tty_write(signal_flags, display.buffer.as_bytes());
        terminal::tty_write(signal_flags, b"\r");
        display.output_produced = true;
        terminal::note_output_produced();
    }

    if let Some(extra) = extra_display.as_deref_mut() {
        if control.extra_displays & EXTRA_DISPLAY_WINDOW_TITLE != 0
            && (control.force || terminal::in_foreground())
        {
            terminal::tty_write(signal_flags, b"\x1b]2;");
            terminal::tty_write(signal_flags, extra.buffer.as_bytes());
            terminal::tty_write(signal_flags, b"\x1b\\");
            extra.output_produced = true;
        }

        if control.extra_displays & EXTRA_DISPLAY_PROCESS_TITLE != 0 {
            proctitle::set_title(&format!("pipemeter -- {}", extra.buffer));
            extra.output_produced = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (DisplayState, ProgramStatus, Config, TransferState, CalcState) {
        let mut status = ProgramStatus::new(true);
        status.checked_colour_support = true;
        status.terminal_supports_colour = true;
        let control = Config {
            width: 80,
            format_string: Some("%b %t %r".to_string()),
            ..Default::default()
        };
        let display = DisplayState::default();
        let transfer = TransferState::default();
        let mut calc = CalcState::default();
        calc.set_history_length(4);
        (display, status, control, transfer, calc)
    }

    #[test]
    fn format_produces_a_line() {
        let (mut display, mut status, control, transfer, calc) = fixture();
        let ok = format(
            &mut display,
            &mut status,
            &control,
            &transfer,
            &calc,
            control.format_string.as_deref(),
            true,
            false,
        );
        assert!(ok);
        assert!(!display.buffer.is_empty());
        assert!(display.showing_bytes);
        assert!(display.showing_timer);
        assert!(display.showing_rate);
    }

    #[test]
    fn elastic_bar_fills_terminal_width() {
        let (mut display, mut status, mut control, transfer, calc) = fixture();
        control.format_string = Some("%p".to_string());
        control.size = 100;
        let ok = format(
            &mut display,
            &mut status,
            &control,
            &transfer,
            &calc,
            control.format_string.as_deref(),
            true,
            false,
        );
        assert!(ok);
        let width = display_width(&display.buffer);
        assert!(width <= 80, "width {} exceeds terminal", width);
        assert!(width >= 70, "bar unexpectedly narrow: {}", width);
    }

    #[test]
    fn shrinking_line_gets_padded() {
        let (mut display, mut status, mut control, mut transfer, calc) = fixture();
        control.format_string = Some("%A".to_string());
        control.size = 0;
        // First render with a long tail, then a shorter one.
        display.lastwritten_bytes = 0;
        transfer.tracking.lastwritten_bytes = 16;
        for (idx, byte) in b"0123456789abcdef".iter().enumerate() {
            transfer.lastwritten[idx] = *byte;
        }
        let mut segments_control = control.clone();
        segments_control.format_string = Some("%16A".to_string());
        assert!(format(
            &mut display,
            &mut status,
            &segments_control,
            &transfer,
            &calc,
            segments_control.format_string.as_deref(),
            true,
            false,
        ));
        let long_width = display_width(&display.buffer);
        segments_control.format_string = Some("%8A".to_string());
        assert!(format(
            &mut display,
            &mut status,
            &segments_control,
            &transfer,
            &calc,
            segments_control.format_string.as_deref(),
            true,
            false,
        ));
        let short_width = display_width(&display.buffer);
        // The shorter render is padded towards the longer one.
        assert!(short_width > 8, "no padding applied: {}", short_width);
        assert!(short_width <= long_width);
    }

    #[test]
    fn display_width_skips_csi() {
        assert_eq!(display_width("abc"), 3);
        assert_eq!(display_width("\x1b[1;31mabc\x1b[m"), 3);
        assert_eq!(display_width("█"), 1);
    }
}
