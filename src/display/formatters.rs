// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The scalar display formatters, and the dispatch point that maps a
//! parsed segment to its renderer.
//!
//! Every formatter can run in probe mode (no width, no output) purely
//! for its side effects, so the engine knows what to track before the
//! first real render.

use crate::transfer::LASTWRITTEN_BUFFER_SIZE;
use crate::transfer::PREVLINE_BUFFER_SIZE;
use crate::units;

use super::bar;
use super::sgr;
use super::DisplayState;
use super::FormatterArgs;
use super::FormatterKind;

/// Timer and ETA displays stop at 100 000 hours.
const MAX_DISPLAY_SECONDS: f64 = 360_000_000.0;

fn printable(byte: u8, replacement: char) -> char {
    if (32..=126).contains(&byte) {
        byte as char
    } else {
        replacement
    }
}

/// Elapsed time as `H:MM:SS`, with a day count once past 24 hours.
fn timer(display: &mut DisplayState, args: &FormatterArgs, probe: bool) -> String {
    display.showing_timer = true;
    if probe {
        return String::new();
    }

    let elapsed = args.transfer.elapsed_seconds.clamp(0.0, MAX_DISPLAY_SECONDS);

    if args.control.numeric {
        return format!("{:.4}", elapsed);
    }

    let whole = elapsed as i64;
    if elapsed > 86_400.0 {
        format!(
            "{}:{:02}:{:02}:{:02}",
            whole / 86_400,
            (whole / 3_600) % 24,
            (whole / 60) % 60,
            whole % 60
        )
    } else {
        format!("{}:{:02}:{:02}", whole / 3_600, (whole / 60) % 60, whole % 60)
    }
}

fn eta_seconds(args: &FormatterArgs, display: &DisplayState) -> i64 {
    let eta = units::seconds_remaining(
        args.transfer.transferred - display.initial_offset,
        args.control.size - display.initial_offset,
        args.calc.current_avg_rate,
    );
    units::bound(eta, 0, MAX_DISPLAY_SECONDS as i64)
}

/// Estimated time until completion; blanked out on the final update.
fn eta(display: &mut DisplayState, args: &FormatterArgs, probe: bool) -> String {
    if args.control.size < 1 || probe {
        return String::new();
    }

    let eta = eta_seconds(args, display);
    let rendered = if eta > 86_400 {
        format!(
            "ETA {}:{:02}:{:02}:{:02}",
            eta / 86_400,
            (eta / 3_600) % 24,
            (eta / 60) % 60,
            eta % 60
        )
    } else {
        format!("ETA {}:{:02}:{:02}", eta / 3_600, (eta / 60) % 60, eta % 60)
    };

    if display.final_update {
        " ".repeat(rendered.len())
    } else {
        rendered
    }
}

/// Wall-clock time of expected completion; includes the date once the
/// ETA exceeds six hours.
fn fineta(display: &mut DisplayState, args: &FormatterArgs, probe: bool) -> String {
    if args.control.size < 1 || probe {
        return String::new();
    }

    let eta = eta_seconds(args, display);
    // SAFETY: time with a null argument only returns the current time.
    let now = unsafe { libc::time(std::ptr::null_mut()) };
    let then: libc::time_t = now + eta as libc::time_t;

    // SAFETY: localtime_r writes only into the tm we own and returns
    // null on failure, which is checked.
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    let ok = !unsafe { libc::localtime_r(&then, &mut tm) }.is_null();
    if !ok {
        // Completion clock time hidden by a failed local time lookup.
        return " ".repeat(12);
    }

    if eta > 6 * 3_600 {
        format!(
            "FIN {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            tm.tm_year + 1900,
            tm.tm_mon + 1,
            tm.tm_mday,
            tm.tm_hour,
            tm.tm_min,
            tm.tm_sec
        )
    } else {
        format!("FIN {:02}:{:02}:{:02}", tm.tm_hour, tm.tm_min, tm.tm_sec)
    }
}

fn rate(display: &mut DisplayState, args: &FormatterArgs, probe: bool) -> String {
    display.showing_rate = true;
    if probe {
        return String::new();
    }

    if args.control.numeric {
        let factor = if args.control.bits { 8.0 } else { 1.0 };
        format!("{:.4}", factor * args.calc.transfer_rate)
    } else if args.control.bits && !args.control.linemode {
        units::describe_amount(
            "[{}]",
            8.0 * args.calc.transfer_rate,
            "",
            "b/s",
            display.count_type,
        )
    } else {
        units::describe_amount(
            "[{}]",
            args.calc.transfer_rate,
            "/s",
            "B/s",
            display.count_type,
        )
    }
}

fn average_rate(display: &mut DisplayState, args: &FormatterArgs, probe: bool) -> String {
    if probe {
        return String::new();
    }

    if args.control.numeric {
        let factor = if args.control.bits { 8.0 } else { 1.0 };
        format!("{:.4}", factor * args.calc.average_rate)
    } else if args.control.bits && !args.control.linemode {
        units::describe_amount(
            "({})",
            8.0 * args.calc.average_rate,
            "",
            "b/s",
            display.count_type,
        )
    } else {
        units::describe_amount(
            "({})",
            args.calc.average_rate,
            "/s",
            "B/s",
            display.count_type,
        )
    }
}

fn bytes(display: &mut DisplayState, args: &FormatterArgs, probe: bool) -> String {
    display.showing_bytes = true;
    if probe {
        return String::new();
    }

    if args.control.numeric {
        let factor: i64 = if args.control.bits { 8 } else { 1 };
        format!("{}", factor * args.transfer.transferred)
    } else if args.control.bits && !args.control.linemode {
        units::describe_amount(
            "{}",
            (args.transfer.transferred * 8) as f64,
            "",
            "b",
            display.count_type,
        )
    } else {
        units::describe_amount(
            "{}",
            args.transfer.transferred as f64,
            "",
            "B",
            display.count_type,
        )
    }
}

/// Transfer buffer utilisation, or `{----}` while splice bypasses the
/// buffer entirely.
fn buffer_percent(args: &FormatterArgs, probe: bool) -> String {
    if probe {
        return String::new();
    }
    if args.transfer.splice_used {
        return "{----}".to_string();
    }
    match args.transfer.buffer_percentage() {
        Some(percentage) => format!("{{{:3.0}%}}", percentage),
        None => String::new(),
    }
}

/// The last few bytes written, unprintables shown as dots.
fn last_written(
    display: &mut DisplayState,
    seg_idx: usize,
    width: usize,
    args: &FormatterArgs,
    probe: bool,
) -> String {
    display.showing_last_written = true;

    let mut bytes_to_show = display.segments[seg_idx].chosen_size;
    if bytes_to_show == 0 {
        bytes_to_show = width;
    }
    if bytes_to_show == 0 {
        return String::new();
    }
    bytes_to_show = bytes_to_show.min(LASTWRITTEN_BUFFER_SIZE);

    // Widening the segment widens the window the engine maintains.
    if bytes_to_show > display.lastwritten_bytes {
        display.lastwritten_bytes = bytes_to_show;
    }

    if probe {
        return String::new();
    }

    let window = display.lastwritten_bytes.min(args.transfer.lastwritten.len());
    let tail = &args.transfer.lastwritten[..window];
    tail[window.saturating_sub(bytes_to_show)..]
        .iter()
        .map(|&byte| printable(byte, '.'))
        .collect()
}

/// The most recent complete line written, padded or truncated to the
/// segment width.
fn previous_line(
    display: &mut DisplayState,
    seg_idx: usize,
    width: usize,
    args: &FormatterArgs,
    probe: bool,
) -> String {
    display.showing_previous_line = true;
    if probe {
        return String::new();
    }

    let mut bytes_to_show = display.segments[seg_idx].chosen_size;
    if bytes_to_show == 0 {
        bytes_to_show = width;
    }
    if bytes_to_show == 0 {
        return String::new();
    }
    bytes_to_show = bytes_to_show.min(PREVLINE_BUFFER_SIZE);

    (0..bytes_to_show)
        .map(|idx| match args.transfer.previous_line.get(idx) {
            Some(&byte) => printable(byte, ' '),
            None => ' ',
        })
        .collect()
}

/// The display name, right-aligned in its field with a colon suffix.
fn name(display: &DisplayState, seg_idx: usize, args: &FormatterArgs, probe: bool) -> String {
    if probe {
        return String::new();
    }

    let mut field_width = display.segments[seg_idx].chosen_size;
    if field_width < 1 {
        field_width = 9;
    }
    field_width = field_width.min(500);

    match &args.control.name {
        Some(name) => {
            let mut name = name.clone();
            name.truncate(500);
            format!("{:>width$}:", name, width = field_width)
        }
        None => String::new(),
    }
}

/// Render one formatter segment at the given width.  With `probe`, only
/// the side effects happen and the result is empty.
pub fn render_segment(
    display: &mut DisplayState,
    seg_idx: usize,
    kind: FormatterKind,
    width: usize,
    args: &FormatterArgs,
    probe: bool,
) -> String {
    match kind {
        FormatterKind::Progress => {
            let _ = bar::segment_style(display, seg_idx, args, None);
            if probe {
                return String::new();
            }
            if args.control.size > 0 || args.control.rate_gauge {
                bar::render_known_size(display, seg_idx, width, args, true, true, true)
            } else {
                bar::render_unknown_size(display, seg_idx, width, args, true)
            }
        }
        FormatterKind::ProgressAmountOnly => {
            if probe {
                return String::new();
            }
            if args.control.numeric {
                format!("{:.0}", args.calc.percentage)
            } else if args.control.size > 0 || args.control.rate_gauge {
                bar::render_known_size(display, seg_idx, width, args, false, false, true)
            } else {
                String::new()
            }
        }
        FormatterKind::BarDefault
        | FormatterKind::BarPlain
        | FormatterKind::BarBlock
        | FormatterKind::BarGranular
        | FormatterKind::BarShaded => {
            let forced = match kind {
                FormatterKind::BarPlain => Some("plain"),
                FormatterKind::BarBlock => Some("block"),
                FormatterKind::BarGranular => Some("granular"),
                FormatterKind::BarShaded => Some("shaded"),
                _ => None,
            };
            let _ = bar::segment_style(display, seg_idx, args, forced);
            if probe {
                return String::new();
            }
            if args.control.size > 0 || args.control.rate_gauge {
                bar::render_known_size(display, seg_idx, width, args, false, true, false)
            } else {
                bar::render_unknown_size(display, seg_idx, width, args, false)
            }
        }
        FormatterKind::Timer => timer(display, args, probe),
        FormatterKind::Eta => eta(display, args, probe),
        FormatterKind::FinEta => fineta(display, args, probe),
        FormatterKind::Rate => rate(display, args, probe),
        FormatterKind::AverageRate => average_rate(display, args, probe),
        FormatterKind::Bytes => bytes(display, args, probe),
        FormatterKind::BufferPercent => buffer_percent(args, probe),
        FormatterKind::LastWritten => last_written(display, seg_idx, width, args, probe),
        FormatterKind::PreviousLine => previous_line(display, seg_idx, width, args, probe),
        FormatterKind::Name => name(display, seg_idx, args, probe),
        FormatterKind::Sgr => sgr::render(display, seg_idx, args),
    }
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

    fn fixture(format: &str) -> Fixture {
        let mut status = ProgramStatus::new(true);
        status.checked_colour_support = true;
        let control = Config {
            width: 80,
            ..Default::default()
        };
        let mut display = DisplayState::default();
        let transfer = TransferState::default();
        let mut calc = CalcState::default();
        calc.set_history_length(4);
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

    fn render(fx: &mut Fixture, idx: usize, kind: FormatterKind, width: usize) -> String {
        let args = FormatterArgs {
            status: &fx.status,
            control: &fx.control,
            transfer: &fx.transfer,
            calc: &fx.calc,
        };
        render_segment(&mut fx.display, idx, kind, width, &args, false)
    }

    #[test]
    fn timer_formats_hours_and_days() {
        let mut fx = fixture("%t");
        fx.transfer.elapsed_seconds = 3_725.0;
        assert_eq!(render(&mut fx, 0, FormatterKind::Timer, 0), "1:02:05");

        fx.transfer.elapsed_seconds = 90_000.0;
        assert_eq!(render(&mut fx, 0, FormatterKind::Timer, 0), "1:01:00:00");
    }

    #[test]
    fn timer_numeric_is_seconds() {
        let mut fx = fixture("%t");
        fx.control.numeric = true;
        fx.transfer.elapsed_seconds = 2.5;
        assert_eq!(render(&mut fx, 0, FormatterKind::Timer, 0), "2.5000");
    }

    #[test]
    fn eta_appears_only_with_size() {
        let mut fx = fixture("%e");
        assert_eq!(render(&mut fx, 0, FormatterKind::Eta, 0), "");

        fx.control.size = 1000;
        fx.transfer.transferred = 500;
        fx.calc.current_avg_rate = 100.0;
        assert_eq!(render(&mut fx, 0, FormatterKind::Eta, 0), "ETA 0:00:05");
    }

    #[test]
    fn eta_blanks_on_final_update() {
        let mut fx = fixture("%e");
        fx.control.size = 1000;
        fx.transfer.transferred = 500;
        fx.calc.current_avg_rate = 100.0;
        fx.display.final_update = true;
        let out = render(&mut fx, 0, FormatterKind::Eta, 0);
        assert!(!out.is_empty());
        assert!(out.chars().all(|c| c == ' '));
    }

    #[test]
    fn eta_clamps_to_hundred_thousand_hours() {
        let mut fx = fixture("%e");
        fx.control.size = i64::MAX;
        fx.transfer.transferred = 1;
        fx.calc.current_avg_rate = 0.001;
        // Unmeasurably slow: seconds_remaining refuses rates this low.
        assert_eq!(render(&mut fx, 0, FormatterKind::Eta, 0), "ETA 0:00:00");

        fx.calc.current_avg_rate = 0.01;
        let out = render(&mut fx, 0, FormatterKind::Eta, 0);
        assert_eq!(out, "ETA 4166:16:00:00");
    }

    #[test]
    fn fineta_has_clock_shape() {
        let mut fx = fixture("%I");
        fx.control.size = 1000;
        fx.transfer.transferred = 900;
        fx.calc.current_avg_rate = 100.0;
        let out = render(&mut fx, 0, FormatterKind::FinEta, 0);
        assert!(out.starts_with("FIN "), "got {:?}", out);
        assert_eq!(out.len(), "FIN HH:MM:SS".len());
    }

    #[test]
    fn rate_and_average_rate_render() {
        let mut fx = fixture("%r %a");
        fx.calc.transfer_rate = 2048.0;
        fx.calc.average_rate = 1024.0;
        let rate_out = render(&mut fx, 0, FormatterKind::Rate, 0);
        assert!(rate_out.starts_with('['), "got {:?}", rate_out);
        assert!(rate_out.contains("KiB/s"), "got {:?}", rate_out);
        let avg_out = render(&mut fx, 2, FormatterKind::AverageRate, 0);
        assert!(avg_out.starts_with('('), "got {:?}", avg_out);
    }

    #[test]
    fn bytes_respects_bits_mode() {
        let mut fx = fixture("%b");
        fx.transfer.transferred = 1024;
        let out = render(&mut fx, 0, FormatterKind::Bytes, 0);
        assert!(out.contains("KiB"), "got {:?}", out);

        fx.control.bits = true;
        let out = render(&mut fx, 0, FormatterKind::Bytes, 0);
        assert!(out.contains('b'), "got {:?}", out);
    }

    #[test]
    fn numeric_bytes_is_plain_digits() {
        let mut fx = fixture("%b");
        fx.control.numeric = true;
        fx.transfer.transferred = 1234;
        assert_eq!(render(&mut fx, 0, FormatterKind::Bytes, 0), "1234");
    }

    #[test]
    fn last_written_shows_tail_with_dots() {
        let mut fx = fixture("%8A");
        fx.display.lastwritten_bytes = 8;
        let tail = b"ab\ncd\x01ef";
        fx.transfer.lastwritten[..8].copy_from_slice(tail);
        let out = render(&mut fx, 0, FormatterKind::LastWritten, 8);
        assert_eq!(out, "ab.cd.ef");
    }

    #[test]
    fn previous_line_pads_to_width() {
        let mut fx = fixture("%L");
        fx.transfer.previous_line = b"hello".to_vec();
        let out = render(&mut fx, 0, FormatterKind::PreviousLine, 10);
        assert_eq!(out, "hello     ");
    }

    #[test]
    fn name_is_right_aligned_with_colon() {
        let mut fx = fixture("%N");
        fx.control.name = Some("data".to_string());
        assert_eq!(render(&mut fx, 0, FormatterKind::Name, 0), "     data:");

        fx.control.name = None;
        assert_eq!(render(&mut fx, 0, FormatterKind::Name, 0), "");
    }

    #[test]
    fn buffer_percent_shows_splice_marker() {
        let mut fx = fixture("%T");
        fx.transfer.splice_used = true;
        assert_eq!(render(&mut fx, 0, FormatterKind::BufferPercent, 0), "{----}");
    }

    #[test]
    fn numeric_percentage_is_integer() {
        let mut fx = fixture("%{progress-amount-only}");
        fx.control.numeric = true;
        fx.calc.percentage = 42.4;
        assert_eq!(
            render(&mut fx, 0, FormatterKind::ProgressAmountOnly, 0),
            "42"
        );
    }
}
