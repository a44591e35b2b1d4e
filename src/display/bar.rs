// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Progress bar styles and rendering.
//!
//! A style is an indicator (the part that sweeps back and forth when the
//! size is unknown), an optional tip, and an ordered set of filler
//! strings from empty to full.  Styles with more than two fillers render
//! partial cells; a two-filler style with a tip draws the tip at the
//! leading edge instead.

use crate::units;

use super::DisplayState;
use super::FormatterArgs;
use super::MAX_BAR_STYLES;

/// A short bar component whose display width may differ from its byte
/// length.
#[derive(Debug, Clone, Copy)]
pub struct BarString {
    pub text: &'static str,
    pub width: usize,
}

/// One progress bar style.  `id` is only compared for equality; id 0 is
/// reserved for "unset".
#[derive(Debug, Clone)]
pub struct BarStyle {
    pub id: u8,
    pub indicator: BarString,
    pub tip: BarString,
    pub fillers: &'static [BarString],
}

const PLAIN_FILLERS: &[BarString] = &[
    BarString { text: " ", width: 1 },
    BarString { text: "=", width: 1 },
];

const BLOCK_FILLERS: &[BarString] = &[
    BarString { text: " ", width: 1 },
    BarString { text: "█", width: 1 },
];

const GRANULAR_FILLERS: &[BarString] = &[
    BarString { text: " ", width: 1 },
    BarString { text: "▏", width: 1 },
    BarString { text: "▎", width: 1 },
    BarString { text: "▍", width: 1 },
    BarString { text: "▌", width: 1 },
    BarString { text: "▋", width: 1 },
    BarString { text: "▊", width: 1 },
    BarString { text: "▉", width: 1 },
    BarString { text: "█", width: 1 },
];

const SHADED_FILLERS: &[BarString] = &[
    BarString { text: "░", width: 1 },
    BarString { text: "▒", width: 1 },
    BarString { text: "▓", width: 1 },
    BarString { text: "█", width: 1 },
];

/// Look a style up by name.  Unknown names, and the UTF-8 styles on a
/// non-UTF-8 terminal, fall back to plain.
fn style_by_name(name: &str, utf8: bool) -> BarStyle {
    match name {
        "block" if utf8 => BarStyle {
            id: 2,
            indicator: BarString { text: "◀▶", width: 2 },
            tip: BarString { text: "", width: 0 },
            fillers: BLOCK_FILLERS,
        },
        "granular" if utf8 => BarStyle {
            id: 3,
            indicator: BarString { text: "◀▶", width: 2 },
            tip: BarString { text: "", width: 0 },
            fillers: GRANULAR_FILLERS,
        },
        "shaded" if utf8 => BarStyle {
            id: 4,
            indicator: BarString { text: "▒▓▒", width: 3 },
            tip: BarString { text: "", width: 0 },
            fillers: SHADED_FILLERS,
        },
        _ => BarStyle {
            id: 1,
            indicator: BarString { text: "<=>", width: 3 },
            tip: BarString { text: ">", width: 1 },
            fillers: PLAIN_FILLERS,
        },
    }
}

/// Index of the named style in the display's style table, adding it on
/// first use.  A full table reuses slot 0.
pub fn style_index(display: &mut DisplayState, utf8: bool, name: &str) -> u8 {
    let style = style_by_name(name, utf8);
    for (index, existing) in display.barstyles.iter().enumerate() {
        if existing.id == style.id {
            return index as u8;
        }
    }
    if display.barstyles.len() >= MAX_BAR_STYLES {
        return 0;
    }
    display.barstyles.push(style);
    (display.barstyles.len() - 1) as u8
}

/// Assign the segment's bar style if it has none yet, and return the
/// style to render with.
pub fn segment_style<'d>(
    display: &'d mut DisplayState,
    seg_idx: usize,
    args: &FormatterArgs,
    forced_name: Option<&str>,
) -> &'d BarStyle {
    if display.segments[seg_idx].parameter == 0 {
        let fallback = args
            .control
            .default_bar_style
            .as_deref()
            .unwrap_or("plain");
        let name = forced_name.unwrap_or(fallback);
        let index = style_index(display, args.status.terminal_supports_utf8, name);
        display.segments[seg_idx].parameter = index + 1;
    }
    let index = usize::from(display.segments[seg_idx].parameter - 1);
    &display.barstyles[index.min(display.barstyles.len().saturating_sub(1))]
}

fn append(out: &mut String, used: &mut usize, part: BarString) {
    out.push_str(part.text);
    // Zero-width parts still consume a cell so the loop terminates.
    *used += part.width.max(1);
}

/// The text after the bar: " NN%" when the size is known, "/<peak rate>"
/// in rate-gauge mode.
fn after_bar(args: &FormatterArgs) -> String {
    if args.control.size > 0 {
        format!(" {:3}%", args.calc.percentage as i64)
    } else if args.control.bits && !args.control.linemode {
        units::describe_amount(
            "/{}",
            8.0 * args.calc.rate_max,
            "",
            "b/s",
            args.control.count_type(),
        )
    } else {
        units::describe_amount(
            "/{}",
            args.calc.rate_max,
            "/s",
            "B/s",
            args.control.count_type(),
        )
    }
}

/// Render a known-size (or rate-gauge) bar: fill proportional to the
/// percentage, followed by the amount.
pub fn render_known_size(
    display: &mut DisplayState,
    seg_idx: usize,
    width: usize,
    args: &FormatterArgs,
    bar_sides: bool,
    include_bar: bool,
    include_amount: bool,
) -> String {
    let style = segment_style(display, seg_idx, args, None).clone();

    let bar_percentage = if args.control.size > 0 {
        args.calc.percentage
    } else if args.calc.rate_max > 0.0 {
        100.0 * args.calc.transfer_rate / args.calc.rate_max
    } else {
        0.0
    };

    let amount = if include_amount {
        after_bar(args)
    } else {
        String::new()
    };
    let amount_width = super::display_width(&amount);

    if !include_bar {
        // Just the number, without the leading space.
        return amount.trim_start().to_string();
    }

    let overhead = if bar_sides { amount_width + 2 } else { amount_width };
    if width < overhead {
        return String::new();
    }
    let bar_area_width = width - overhead;

    let full = style.fillers.len().saturating_sub(1);
    let has_tip = full == 1 && style.tip.width > 0;

    let mut filled_width = (bar_area_width as f64 * bar_percentage / 100.0) as usize;
    if has_tip && filled_width > 0 {
        filled_width = filled_width.saturating_sub(style.tip.width);
    }

    let mut out = String::new();
    if bar_sides {
        out.push('[');
    }

    let mut used = 0;
    while used < filled_width && used < bar_area_width {
        append(&mut out, &mut used, style.fillers[full]);
    }

    if has_tip && used < bar_area_width {
        out.push_str(style.tip.text);
        used += style.tip.width;
    }

    // A partial cell between the filled and empty regions, for styles
    // with intermediate fillers.
    if used < bar_area_width && full > 1 && !has_tip {
        let exact = bar_area_width as f64 * bar_percentage / 100.0;
        let cell_portion = exact - filled_width as f64;
        let cell_index = ((full as f64 * cell_portion) as usize).min(full);
        append(&mut out, &mut used, style.fillers[cell_index]);
    }

    while used < bar_area_width {
        append(&mut out, &mut used, style.fillers[0]);
    }

    if bar_sides {
        out.push(']');
    }
    out.push_str(&amount);
    out
}

/// Render an unknown-size bar: an indicator whose position follows the
/// 0..200 saw-tooth percentage, folded so it sweeps back and forth.
pub fn render_unknown_size(
    display: &mut DisplayState,
    seg_idx: usize,
    width: usize,
    args: &FormatterArgs,
    bar_sides: bool,
) -> String {
    let style = segment_style(display, seg_idx, args, None).clone();

    let overhead = if bar_sides {
        style.indicator.width + 3
    } else {
        style.indicator.width + 2
    };
    if width < overhead {
        return String::new();
    }
    let bar_area_width = if bar_sides {
        width - (style.indicator.width + 2)
    } else {
        width - style.indicator.width
    };

    let mut position = args.calc.percentage;
    if position > 200.0 {
        position %= 200.0;
    }
    if position > 100.0 {
        position = 200.0 - position;
    }
    if position < 0.0 {
        position = 0.0;
    }

    let mut out = String::new();
    if bar_sides {
        out.push('[');
    }

    let padding = (bar_area_width as f64 * position / 100.0) as usize;
    let mut used = 0;
    while used < bar_area_width && used < padding {
        append(&mut out, &mut used, style.fillers[0]);
    }

    out.push_str(style.indicator.text);

    while used < bar_area_width {
        append(&mut out, &mut used, style.fillers[0]);
    }

    if bar_sides {
        out.push(']');
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

    struct Fixture {
        display: DisplayState,
        status: ProgramStatus,
        control: Config,
        transfer: TransferState,
        calc: CalcState,
    }

    fn fixture(format: &str, size: i64, percentage: f64) -> Fixture {
        let mut status = ProgramStatus::new(true);
        status.checked_colour_support = true;
        let control = Config {
            size,
            width: 40,
            format_string: Some(format.to_string()),
            ..Default::default()
        };
        let mut display = DisplayState::default();
        let transfer = TransferState::default();
        let mut calc = CalcState::default();
        calc.set_history_length(4);
        calc.percentage = percentage;
        super::super::parse::parse_format(
            &mut display,
            &mut status,
            &control,
            &transfer,
            &calc,
            Some(format),
        );
        Fixture {
            display,
            status,
            control,
            transfer,
            calc,
        }
    }

    #[test]
    fn plain_bar_half_full() {
        let mut fx = fixture("%p", 100, 50.0);
        let args = FormatterArgs {
            status: &fx.status,
            control: &fx.control,
            transfer: &fx.transfer,
            calc: &fx.calc,
        };
        let out = render_known_size(&mut fx.display, 0, 30, &args, true, true, true);
        assert!(out.starts_with('['), "got {:?}", out);
        assert!(out.contains('>'), "got {:?}", out);
        assert!(out.ends_with(" 50%"), "got {:?}", out);
        assert_eq!(super::super::display_width(&out), 30);
    }

    #[test]
    fn full_bar_has_no_tip() {
        let mut fx = fixture("%p", 100, 100.0);
        let args = FormatterArgs {
            status: &fx.status,
            control: &fx.control,
            transfer: &fx.transfer,
            calc: &fx.calc,
        };
        let out = render_known_size(&mut fx.display, 0, 24, &args, true, true, true);
        assert!(out.contains(">]"), "got {:?}", out);
        assert!(out.ends_with("100%"), "got {:?}", out);
    }

    #[test]
    fn unknown_size_indicator_folds() {
        for (percentage, expect_left) in [(0.0, true), (150.0, false)] {
            let mut fx = fixture("%p", 0, percentage);
            let args = FormatterArgs {
                status: &fx.status,
                control: &fx.control,
                transfer: &fx.transfer,
                calc: &fx.calc,
            };
            let out = render_unknown_size(&mut fx.display, 0, 20, &args, true);
            assert_eq!(super::super::display_width(&out), 20);
            let indicator_at = out.find("<=>").unwrap();
            if expect_left {
                assert_eq!(indicator_at, 1, "got {:?}", out);
            } else {
                assert!(indicator_at > 1, "got {:?}", out);
            }
        }
    }

    #[test]
    fn style_table_is_capped() {
        let mut fx = fixture("%p", 100, 0.0);
        assert_eq!(style_index(&mut fx.display, true, "plain"), 0);
        assert_eq!(style_index(&mut fx.display, true, "block"), 1);
        assert_eq!(style_index(&mut fx.display, true, "granular"), 2);
        assert_eq!(style_index(&mut fx.display, true, "shaded"), 3);
        // Table full: a fifth distinct style reuses slot 0; known styles
        // keep their slots.
        assert_eq!(style_index(&mut fx.display, true, "block"), 1);
    }

    #[test]
    fn utf8_styles_degrade_without_utf8() {
        let mut fx = fixture("%p", 100, 0.0);
        let index = style_index(&mut fx.display, false, "block");
        assert_eq!(fx.display.barstyles[usize::from(index)].id, 1);
    }

    #[test]
    fn granular_bar_renders_partial_cell() {
        let mut fx = fixture("%{bar-granular}", 100, 50.0);
        let args = FormatterArgs {
            status: &fx.status,
            control: &fx.control,
            transfer: &fx.transfer,
            calc: &fx.calc,
        };
        let out = render_known_size(&mut fx.display, 0, 21, &args, false, true, false);
        // Half of the bar filled with full blocks, no tip characters.
        assert!(out.starts_with('█'), "got {:?}", out);
        assert!(!out.contains('>'));
    }
}
