// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Control settings for a run.
//!
//! These are set once at startup from the command line and mutated only by
//! the remote-control channel, which re-applies the same clamps as the
//! command line parser.

use std::os::unix::io::RawFd;

use crate::units::TransferCount;

/// Default transfer buffer size when the input's block size is unusable.
pub const DEFAULT_BUFFER_SIZE: usize = 409_600;
/// Upper bound for the automatically chosen buffer size.
pub const MAX_AUTO_BUFFER_SIZE: usize = 524_288;

/// Largest accepted terminal dimension.
pub const MAX_DIMENSION: u32 = 999_999;

/// Extra display destinations, OR-able.
pub const EXTRA_DISPLAY_WINDOW_TITLE: u8 = 1;
pub const EXTRA_DISPLAY_PROCESS_TITLE: u8 = 2;

/// The old-style boolean format toggles, kept so the remote-control
/// channel can replay them.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    pub progress: bool,
    pub timer: bool,
    pub eta: bool,
    pub fineta: bool,
    pub rate: bool,
    pub average_rate: bool,
    pub bytes: bool,
    pub bufpercent: bool,
    pub lastwritten: usize,
}

/// Control settings: set once at startup, mutable only through the
/// remote-control channel.
#[derive(Debug, Clone)]
pub struct Config {
    /// Total expected size; zero or negative means unknown.
    pub size: i64,
    /// Seconds between display updates.
    pub interval: f64,
    /// Seconds before the first display.
    pub delay_start: f64,
    /// Requested transfer buffer size; 0 picks one automatically.
    pub target_buffer_size: usize,
    /// Rate limit in bytes (or lines) per second; 0 is unlimited.
    pub rate_limit: u64,
    /// 0 = fail on read errors, 1 = skip silently, >=2 = skip and trace.
    pub skip_errors: u32,
    /// Fixed skip-block size for error skipping; 0 = adaptive schedule.
    pub error_skip_block: u64,
    pub linemode: bool,
    pub null_terminated_lines: bool,
    pub bits: bool,
    pub decimal_units: bool,
    pub sparse_output: bool,
    pub discard_input: bool,
    pub sync_after_write: bool,
    pub direct_io: bool,
    pub direct_io_changed: bool,
    pub stop_at_size: bool,
    pub wait: bool,
    pub numeric: bool,
    pub cursor: bool,
    pub force: bool,
    pub no_display: bool,
    pub no_splice: bool,
    pub rate_gauge: bool,
    pub show_stats: bool,
    /// Sliding window for the average rate, in seconds.
    pub average_rate_window: u32,
    /// Seconds between rate-history entries, derived from the window.
    pub history_interval: u32,
    pub width: u16,
    pub height: u32,
    pub width_set_manually: bool,
    pub height_set_manually: bool,
    pub name: Option<String>,
    pub format_string: Option<String>,
    /// Format assembled from the boolean toggles when no explicit format
    /// string is given.
    pub default_format: String,
    pub default_bar_style: Option<String>,
    /// OR of EXTRA_DISPLAY_* bits.
    pub extra_displays: u8,
    pub extra_display_spec: Option<String>,
    pub extra_format_string: Option<String>,
    pub format_option: FormatOptions,
    pub output_fd: RawFd,
    pub output_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            size: 0,
            interval: 1.0,
            delay_start: 0.0,
            target_buffer_size: 0,
            rate_limit: 0,
            skip_errors: 0,
            error_skip_block: 0,
            linemode: false,
            null_terminated_lines: false,
            bits: false,
            decimal_units: false,
            sparse_output: false,
            discard_input: false,
            sync_after_write: false,
            direct_io: false,
            direct_io_changed: false,
            stop_at_size: false,
            wait: false,
            numeric: false,
            cursor: false,
            force: false,
            no_display: false,
            no_splice: false,
            rate_gauge: false,
            show_stats: false,
            average_rate_window: 30,
            history_interval: 1,
            width: 80,
            height: 25,
            width_set_manually: false,
            height_set_manually: false,
            name: None,
            format_string: None,
            default_format: String::new(),
            default_bar_style: None,
            extra_displays: 0,
            extra_display_spec: None,
            extra_format_string: None,
            format_option: FormatOptions::default(),
            output_fd: libc::STDOUT_FILENO,
            output_name: "(stdout)".to_string(),
        }
    }
}

impl Config {
    /// The kind of quantity being counted for transfer, rate, etc.
    pub fn count_type(&self) -> TransferCount {
        if self.linemode {
            TransferCount::Lines
        } else if self.decimal_units {
            TransferCount::DecimalBytes
        } else {
            TransferCount::Bytes
        }
    }

    /// Clamp the display interval to its legal range.
    pub fn set_interval(&mut self, seconds: f64) {
        self.interval = seconds.clamp(0.1, 600.0);
    }

    /// Set the display width; 0 leaves the detected value in place.
    pub fn set_width(&mut self, width: u32, manually: bool) {
        let clamped = width.clamp(1, MAX_DIMENSION).min(u32::from(u16::MAX));
        self.width = clamped as u16;
        self.width_set_manually = manually;
    }

    /// Set the display height; 0 leaves the detected value in place.
    pub fn set_height(&mut self, height: u32, manually: bool) {
        self.height = height.clamp(1, MAX_DIMENSION);
        self.height_set_manually = manually;
    }

    /// Set the average-rate window and derive the history interval and
    /// length from it (windows of 20 s and up sample every 5 s).
    pub fn set_average_rate_window(&mut self, window: u32) {
        let window = window.max(1);
        self.average_rate_window = window;
        self.history_interval = if window >= 20 { 5 } else { 1 };
    }

    /// Number of history entries implied by the current window.
    pub fn history_length(&self) -> usize {
        if self.average_rate_window >= 20 {
            (self.average_rate_window / 5 + 1) as usize
        } else {
            (self.average_rate_window + 1) as usize
        }
    }

    /// Rebuild `default_format` from the old-style boolean toggles, in the
    /// standard order.  In numeric mode the selection and order differ.
    pub fn set_format(&mut self, options: FormatOptions, name: Option<&str>) {
        self.format_option = options;
        let mut parts: Vec<String> = Vec::new();

        if !self.numeric {
            if name.is_some() {
                parts.push("%N".to_string());
            }
            if options.bytes {
                parts.push("%b".to_string());
            }
            if options.bufpercent {
                parts.push("%T".to_string());
            }
            if options.timer {
                parts.push("%t".to_string());
            }
            if options.rate {
                parts.push("%r".to_string());
            }
            if options.average_rate {
                parts.push("%a".to_string());
            }
            if options.progress {
                parts.push("%p".to_string());
            }
            if options.eta {
                parts.push("%e".to_string());
            }
            if options.fineta {
                parts.push("%I".to_string());
            }
            if options.lastwritten > 0 {
                parts.push(format!("%{}A", options.lastwritten));
            }
        } else {
            if options.timer {
                parts.push("%t".to_string());
            }
            if options.bytes {
                parts.push("%b".to_string());
            }
            if options.rate {
                parts.push("%r".to_string());
            }
            if !(options.bytes || options.rate) {
                parts.push("%{progress-amount-only}".to_string());
            }
        }

        self.default_format = parts.join(" ");
        self.name = name.map(|n| n.to_string());
        crate::flags::flags()
            .reparse_display
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Parse an extra-display spec of the form
    /// `proc|window[,proc|window][:format]` into the destination bits and
    /// the optional dedicated format string.
    pub fn set_extra_display_spec(&mut self, spec: Option<&str>) {
        self.extra_displays = 0;
        self.extra_display_spec = spec.map(|s| s.to_string());
        self.extra_format_string = None;

        let Some(spec) = spec else { return };

        let (destinations, format) = match spec.split_once(':') {
            Some((d, f)) => (d, Some(f)),
            None => (spec, None),
        };

        for word in destinations.split(',') {
            match word {
                "window" | "windowtitle" => self.extra_displays |= EXTRA_DISPLAY_WINDOW_TITLE,
                "proc" | "process" | "proctitle" | "processtitle" => {
                    self.extra_displays |= EXTRA_DISPLAY_PROCESS_TITLE
                }
                _ => {}
            }
        }

        if let Some(format) = format {
            self.extra_format_string = Some(format.to_string());
        }
    }

    /// The effective main format string.
    pub fn effective_format(&self) -> &str {
        self.format_string.as_deref().unwrap_or(&self.default_format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_clamps() {
        let mut cfg = Config::default();
        cfg.set_interval(0.01);
        assert!((cfg.interval - 0.1).abs() < 1e-9);
        cfg.set_interval(999.0);
        assert!((cfg.interval - 600.0).abs() < 1e-9);
    }

    #[test]
    fn width_clamps() {
        let mut cfg = Config::default();
        cfg.set_width(2_000_000, true);
        assert_eq!(u32::from(cfg.width), u32::from(u16::MAX));
        cfg.set_height(2_000_000, true);
        assert_eq!(cfg.height, MAX_DIMENSION);
    }

    #[test]
    fn default_format_order() {
        let mut cfg = Config::default();
        cfg.set_format(
            FormatOptions {
                progress: true,
                timer: true,
                eta: true,
                rate: true,
                bytes: true,
                ..Default::default()
            },
            Some("data"),
        );
        assert_eq!(cfg.default_format, "%N %b %t %r %p %e");
        assert_eq!(cfg.name.as_deref(), Some("data"));
    }

    #[test]
    fn numeric_format_order() {
        let mut cfg = Config {
            numeric: true,
            ..Default::default()
        };
        cfg.set_format(
            FormatOptions {
                timer: true,
                bytes: true,
                rate: true,
                ..Default::default()
            },
            None,
        );
        assert_eq!(cfg.default_format, "%t %b %r");

        cfg.set_format(FormatOptions::default(), None);
        assert_eq!(cfg.default_format, "%{progress-amount-only}");
    }

    #[test]
    fn lastwritten_format_suffix() {
        let mut cfg = Config::default();
        cfg.set_format(
            FormatOptions {
                lastwritten: 16,
                ..Default::default()
            },
            None,
        );
        assert_eq!(cfg.default_format, "%16A");
    }

    #[test]
    fn extra_display_spec_parses() {
        let mut cfg = Config::default();
        cfg.set_extra_display_spec(Some("window,proc:%p %r"));
        assert_eq!(
            cfg.extra_displays,
            EXTRA_DISPLAY_WINDOW_TITLE | EXTRA_DISPLAY_PROCESS_TITLE
        );
        assert_eq!(cfg.extra_format_string.as_deref(), Some("%p %r"));

        cfg.set_extra_display_spec(Some("windowtitle"));
        assert_eq!(cfg.extra_displays, EXTRA_DISPLAY_WINDOW_TITLE);
        assert!(cfg.extra_format_string.is_none());

        cfg.set_extra_display_spec(None);
        assert_eq!(cfg.extra_displays, 0);
    }

    #[test]
    fn history_length_tracks_window() {
        let mut cfg = Config::default();
        cfg.set_average_rate_window(30);
        assert_eq!(cfg.history_interval, 5);
        assert_eq!(cfg.history_length(), 7);
        cfg.set_average_rate_window(10);
        assert_eq!(cfg.history_interval, 1);
        assert_eq!(cfg.history_length(), 11);
    }
}
