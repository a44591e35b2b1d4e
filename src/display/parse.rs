// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Format template parsing.
//!
//! ```text
//! template  := ( literal | '%' [digits] code )*
//! code      := single-letter | '{' name [':' arg] '}' | '%'
//! ```
//!
//! Unknown `%{...}` sequences pass through verbatim; `%%` collapses to a
//! single percent sign.  Parsing also runs each recognised formatter in
//! probe mode so its side-effect flags (such as `showing_rate`) are
//! known before the first real render.

use crate::calc::CalcState;
use crate::config::Config;
use crate::status::ProgramStatus;
use crate::terminal;
use crate::transfer::TransferState;

use super::formatters;
use super::DisplayState;
use super::FormatterArgs;
use super::FormatterKind;
use super::Segment;
use super::SegmentKind;
use super::MAX_FORMAT_SEGMENTS;

/// Sequences following a `%`, and the formatter each one selects.
const COMPONENTS: &[(&str, FormatterKind)] = &[
    ("p", FormatterKind::Progress),
    ("{progress}", FormatterKind::Progress),
    ("{progress-amount-only}", FormatterKind::ProgressAmountOnly),
    ("{progress-bar-only}", FormatterKind::BarDefault),
    ("{bar-plain}", FormatterKind::BarPlain),
    ("{bar-block}", FormatterKind::BarBlock),
    ("{bar-granular}", FormatterKind::BarGranular),
    ("{bar-shaded}", FormatterKind::BarShaded),
    ("t", FormatterKind::Timer),
    ("{timer}", FormatterKind::Timer),
    ("e", FormatterKind::Eta),
    ("{eta}", FormatterKind::Eta),
    ("I", FormatterKind::FinEta),
    ("{fineta}", FormatterKind::FinEta),
    ("r", FormatterKind::Rate),
    ("{rate}", FormatterKind::Rate),
    ("a", FormatterKind::AverageRate),
    ("{average-rate}", FormatterKind::AverageRate),
    ("b", FormatterKind::Bytes),
    ("{bytes}", FormatterKind::Bytes),
    ("{transferred}", FormatterKind::Bytes),
    ("T", FormatterKind::BufferPercent),
    ("{buffer-percent}", FormatterKind::BufferPercent),
    ("A", FormatterKind::LastWritten),
    ("{last-written}", FormatterKind::LastWritten),
    ("L", FormatterKind::PreviousLine),
    ("{previous-line}", FormatterKind::PreviousLine),
    ("N", FormatterKind::Name),
    ("{name}", FormatterKind::Name),
];

fn push_literal(segments: &mut Vec<Segment>, text: &str) {
    if text.is_empty() {
        return;
    }
    segments.push(Segment {
        kind: SegmentKind::Literal(text.to_string()),
        chosen_size: 0,
        parameter: 0,
        arg: None,
    });
}

/// Parse the format string into `display.segments` and refresh the
/// side-effect flags.  May set the colour-support facts in `status` the
/// first time a colour-using format is seen.
pub fn parse_format(
    display: &mut DisplayState,
    status: &mut ProgramStatus,
    control: &Config,
    transfer: &TransferState,
    calc: &CalcState,
    format_supplied: Option<&str>,
) {
    let format: String = format_supplied
        .unwrap_or(&control.default_format)
        .to_string();

    display.segments.clear();
    display.showing_timer = false;
    display.showing_bytes = false;
    display.showing_rate = false;
    display.showing_last_written = false;
    display.showing_previous_line = false;
    display.format_uses_colour = false;

    let bytes = format.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() && display.segments.len() < MAX_FORMAT_SEGMENTS {
        if bytes[pos] != b'%' {
            // A literal run up to the next percent sign.
            let start = pos;
            while pos < bytes.len() && bytes[pos] != b'%' {
                pos += 1;
            }
            push_literal(&mut display.segments, &format[start..pos]);
            continue;
        }

        let percent = pos;
        pos += 1;

        // Optional numeric width prefix, as in "%16A".
        let digits_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        let chosen_size: usize = format[digits_start..pos].parse().unwrap_or(0);

        // The sequence: one character, or a braced name.
        let seq_start = pos;
        if pos < bytes.len() && bytes[pos] == b'{' {
            pos += 1;
            while pos < bytes.len() && bytes[pos] != b'}' && bytes[pos] != b'%' {
                pos += 1;
            }
            if pos < bytes.len() && bytes[pos] == b'}' {
                pos += 1;
            }
        } else if pos < bytes.len() {
            pos += 1;
        }
        let sequence = &format[seq_start..pos];

        // Exact matches first, then the parameterised "{sgr:...}" form.
        let mut matched: Option<(FormatterKind, Option<String>)> = None;
        for (pattern, kind) in COMPONENTS {
            if *pattern == sequence {
                matched = Some((*kind, None));
                break;
            }
        }
        if matched.is_none() && sequence.starts_with("{sgr:") && sequence.ends_with('}') {
            let arg = &sequence["{sgr:".len()..sequence.len() - 1];
            matched = Some((FormatterKind::Sgr, Some(arg.to_string())));
        }

        match matched {
            Some((kind, arg)) => {
                display.segments.push(Segment {
                    kind: SegmentKind::Formatter(kind),
                    chosen_size,
                    parameter: 0,
                    arg,
                });
            }
            None => {
                if sequence == "%" {
                    // "%%" is a literal percent sign.
                    push_literal(&mut display.segments, "%");
                } else {
                    // Unknown sequence, a brace run stopped short by the
                    // next "%", or a trailing bare "%": verbatim.  A "%"
                    // that stopped the scan is left for the next round.
                    push_literal(&mut display.segments, &format[percent..pos]);
                }
            }
        }
    }

    // Probe pass: run the formatters with no width so their side-effect
    // flags are set before the first real render.
    let args = FormatterArgs {
        status: &*status,
        control,
        transfer,
        calc,
    };
    for idx in 0..display.segments.len() {
        if let SegmentKind::Formatter(kind) = display.segments[idx].kind.clone() {
            let _ = formatters::render_segment(display, idx, kind, 0, &args, true);
        }
    }

    // One-time colour capability check, only once a format asks for it.
    if display.format_uses_colour && !status.checked_colour_support {
        status.checked_colour_support = true;
        status.terminal_supports_colour = terminal::colour_support(control.force);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(format: &str) -> DisplayState {
        let mut display = DisplayState::default();
        let mut status = ProgramStatus::new(true);
        status.checked_colour_support = true;
        status.terminal_supports_colour = true;
        let control = Config::default();
        let transfer = TransferState::default();
        let calc = CalcState::default();
        parse_format(
            &mut display,
            &mut status,
            &control,
            &transfer,
            &calc,
            Some(format),
        );
        display
    }

    fn kinds(display: &DisplayState) -> Vec<&SegmentKind> {
        display.segments.iter().map(|s| &s.kind).collect()
    }

    #[test]
    fn plain_codes_parse() {
        let display = parse("%b %t %r");
        assert_eq!(display.segments.len(), 5);
        assert!(matches!(
            display.segments[0].kind,
            SegmentKind::Formatter(FormatterKind::Bytes)
        ));
        assert!(matches!(
            display.segments[2].kind,
            SegmentKind::Formatter(FormatterKind::Timer)
        ));
        assert!(matches!(
            display.segments[4].kind,
            SegmentKind::Formatter(FormatterKind::Rate)
        ));
    }

    #[test]
    fn braced_names_parse() {
        let display = parse("%{progress} %{average-rate} %{transferred}");
        assert!(matches!(
            display.segments[0].kind,
            SegmentKind::Formatter(FormatterKind::Progress)
        ));
        assert!(matches!(
            display.segments[2].kind,
            SegmentKind::Formatter(FormatterKind::AverageRate)
        ));
        assert!(matches!(
            display.segments[4].kind,
            SegmentKind::Formatter(FormatterKind::Bytes)
        ));
    }

    #[test]
    fn numeric_prefix_sets_chosen_size() {
        let display = parse("%16A %30N");
        assert_eq!(display.segments[0].chosen_size, 16);
        assert!(matches!(
            display.segments[0].kind,
            SegmentKind::Formatter(FormatterKind::LastWritten)
        ));
        assert_eq!(display.segments[2].chosen_size, 30);
    }

    #[test]
    fn double_percent_is_literal() {
        let display = parse("100%% done");
        let all: String = display
            .segments
            .iter()
            .filter_map(|s| match &s.kind {
                SegmentKind::Literal(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(all, "100% done");
    }

    #[test]
    fn unknown_sequence_passes_through() {
        let display = parse("%{nonsense}");
        assert_eq!(display.segments.len(), 1);
        match &display.segments[0].kind {
            SegmentKind::Literal(text) => assert_eq!(text, "%{nonsense}"),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn unterminated_brace_backs_off_before_next_code() {
        let display = parse("%{foo%p");
        assert_eq!(display.segments.len(), 2);
        match &display.segments[0].kind {
            SegmentKind::Literal(text) => assert_eq!(text, "%{foo"),
            other => panic!("unexpected kind: {:?}", other),
        }
        assert!(matches!(
            display.segments[1].kind,
            SegmentKind::Formatter(FormatterKind::Progress)
        ));
    }

    #[test]
    fn trailing_percent_is_literal() {
        let display = parse("abc%");
        assert_eq!(display.segments.len(), 2);
        match &display.segments[1].kind {
            SegmentKind::Literal(text) => assert_eq!(text, "%"),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn sgr_argument_is_captured() {
        let display = parse("%{sgr:bold,red}");
        assert_eq!(display.segments.len(), 1);
        assert!(matches!(
            display.segments[0].kind,
            SegmentKind::Formatter(FormatterKind::Sgr)
        ));
        assert_eq!(display.segments[0].arg.as_deref(), Some("bold,red"));
        assert!(display.format_uses_colour);
    }

    #[test]
    fn probe_sets_side_effect_flags() {
        let display = parse("%t %b %r %L");
        assert!(display.showing_timer);
        assert!(display.showing_bytes);
        assert!(display.showing_rate);
        assert!(display.showing_previous_line);
        assert!(!display.showing_last_written);
        let _ = kinds(&display);
    }

    #[test]
    fn segment_cap_is_enforced() {
        let format = "%t".repeat(200);
        let display = parse(&format);
        assert_eq!(display.segments.len(), MAX_FORMAT_SEGMENTS);
    }
}
