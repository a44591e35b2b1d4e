// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! ECMA-48 SGR sequences from `%{sgr:...}` arguments.
//!
//! The argument is a comma or semicolon separated list of attribute
//! keywords and raw numeric parameters.  Nothing is emitted unless the
//! terminal is known to support colour.

use super::DisplayState;
use super::FormatterArgs;

/// At most this many parameters per emitted CSI sequence.
const MAX_CODES_PER_SEQUENCE: usize = 16;

const KEYWORDS: &[(&str, u8)] = &[
    ("reset", 0),
    ("none", 0),
    ("bold", 1),
    ("dim", 2),
    ("italic", 3),
    ("underscore", 4),
    ("underline", 4),
    ("blink", 5),
    ("reverse", 7),
    ("no-bold", 22),
    ("no-dim", 22),
    ("no-italic", 23),
    ("no-underscore", 24),
    ("no-underline", 24),
    ("no-blink", 25),
    ("no-reverse", 27),
    ("black", 30),
    ("red", 31),
    ("green", 32),
    ("brown", 33),
    ("yellow", 33),
    ("blue", 34),
    ("magenta", 35),
    ("cyan", 36),
    ("white", 37),
    ("fg-black", 30),
    ("fg-red", 31),
    ("fg-green", 32),
    ("fg-brown", 33),
    ("fg-yellow", 33),
    ("fg-blue", 34),
    ("fg-magenta", 35),
    ("fg-cyan", 36),
    ("fg-white", 37),
    ("fg-default", 39),
    ("bg-black", 40),
    ("bg-red", 41),
    ("bg-green", 42),
    ("bg-brown", 43),
    ("bg-yellow", 43),
    ("bg-blue", 44),
    ("bg-magenta", 45),
    ("bg-cyan", 46),
    ("bg-white", 47),
    ("bg-default", 49),
];

fn lookup(word: &str) -> Option<i32> {
    // Raw numeric SGR parameters are passed straight through.
    if let Ok(value) = word.parse::<i32>() {
        if (0..255).contains(&value) {
            return Some(value);
        }
        return None;
    }
    KEYWORDS
        .iter()
        .find(|(keyword, _)| *keyword == word)
        .map(|(_, code)| i32::from(*code))
}

/// Render the SGR segment.  As side effects, marks the display as using
/// colour and tracks whether an attribute is left active.
pub fn render(display: &mut DisplayState, seg_idx: usize, args: &FormatterArgs) -> String {
    if !display.colour_permitted {
        return String::new();
    }

    display.format_uses_colour = true;

    if !args.status.terminal_supports_colour {
        return String::new();
    }

    let argument = match &display.segments[seg_idx].arg {
        Some(argument) if !argument.is_empty() => argument.clone(),
        _ => return String::new(),
    };

    let mut out = String::new();
    let mut codes_in_sequence = 0;
    let mut most_recent_code = -1;

    for word in argument.split([',', ';']) {
        let Some(code) = lookup(word) else { continue };

        if codes_in_sequence >= MAX_CODES_PER_SEQUENCE {
            out.push('m');
            codes_in_sequence = 0;
        }
        if codes_in_sequence == 0 {
            out.push_str("\x1b[");
        } else {
            out.push(';');
        }
        out.push_str(&code.to_string());
        codes_in_sequence += 1;
        most_recent_code = code;
    }

    if codes_in_sequence > 0 {
        out.push('m');
    }

    if most_recent_code > 0 {
        display.sgr_code_active = true;
    } else if most_recent_code == 0 {
        display.sgr_code_active = false;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::CalcState;
    use crate::config::Config;
    use crate::status::ProgramStatus;
    use crate::transfer::TransferState;

    fn render_arg(argument: &str, colour: bool) -> (String, bool) {
        let mut display = DisplayState::default();
        let mut status = ProgramStatus::new(true);
        status.checked_colour_support = true;
        status.terminal_supports_colour = colour;
        let control = Config::default();
        let transfer = TransferState::default();
        let calc = CalcState::default();
        super::super::parse::parse_format(
            &mut display,
            &mut status,
            &control,
            &transfer,
            &calc,
            Some(&format!("%{{sgr:{}}}", argument)),
        );
        let args = FormatterArgs {
            status: &status,
            control: &control,
            transfer: &transfer,
            calc: &calc,
        };
        let out = render(&mut display, 0, &args);
        (out, display.sgr_code_active)
    }

    #[test]
    fn keywords_emit_codes() {
        let (out, active) = render_arg("bold,red", true);
        assert_eq!(out, "\x1b[1;31m");
        assert!(active);
    }

    #[test]
    fn reset_clears_active_state() {
        let (out, active) = render_arg("bold,reset", true);
        assert_eq!(out, "\x1b[1;0m");
        assert!(!active);
    }

    #[test]
    fn raw_numbers_pass_through() {
        let (out, active) = render_arg("38;5;1", true);
        assert_eq!(out, "\x1b[38;5;1m");
        assert!(active);
    }

    #[test]
    fn unknown_words_are_ignored() {
        let (out, _) = render_arg("sparkly,green", true);
        assert_eq!(out, "\x1b[32m");
    }

    #[test]
    fn nothing_without_colour_support() {
        let (out, active) = render_arg("bold,red", false);
        assert!(out.is_empty());
        assert!(!active);
    }
}
