// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command line definitions and argv preprocessing.

use argh::FromArgs;

use crate::watchfd::WatchTarget;

/// Monitor the progress of data through a pipe.
///
/// With no FILE, or when FILE is -, standard input is copied to standard
/// output with a progress display on standard error.
#[derive(FromArgs, Debug, Default)]
pub struct Options {
    /// input files; '-' means standard input
    #[argh(positional)]
    pub files: Vec<String>,

    /// write output to FILE instead of standard output
    #[argh(option, short = 'o')]
    pub output: Option<String>,

    /// expected total data size, with optional K/M/G/T suffix
    #[argh(option, short = 's')]
    pub size: Option<String>,

    /// count lines instead of bytes
    #[argh(switch, short = 'l')]
    pub line_mode: bool,

    /// lines are terminated with NUL instead of newline
    #[argh(switch, short = '0')]
    pub null: bool,

    /// show the progress bar
    #[argh(switch, short = 'p')]
    pub progress: bool,

    /// show the elapsed time
    #[argh(switch, short = 't')]
    pub timer: bool,

    /// show the estimated time until completion
    #[argh(switch, short = 'e')]
    pub eta: bool,

    /// show the wall-clock time of expected completion
    #[argh(switch, short = 'I')]
    pub fineta: bool,

    /// show the current transfer rate
    #[argh(switch, short = 'r')]
    pub rate: bool,

    /// show the average transfer rate
    #[argh(switch, short = 'a')]
    pub average_rate: bool,

    /// show the number of bytes (or lines) transferred
    #[argh(switch, short = 'b')]
    pub bytes: bool,

    /// show the transfer buffer utilisation
    #[argh(switch, short = 'T')]
    pub buffer_percent: bool,

    /// show the last N bytes written
    #[argh(option, short = 'A')]
    pub last_written: Option<usize>,

    /// prefix the display with this name
    #[argh(option, short = 'N')]
    pub name: Option<String>,

    /// use this format string for the display
    #[argh(option, short = 'F')]
    pub format: Option<String>,

    /// default progress bar style (plain, block, granular, shaded)
    #[argh(option)]
    pub bar_style: Option<String>,

    /// extra display spec: proc|window[,proc][:FORMAT]
    #[argh(option)]
    pub extra_display: Option<String>,

    /// output numbers only, one update per line
    #[argh(switch, short = 'n')]
    pub numeric: bool,

    /// no display; transfer data silently
    #[argh(switch, short = 'q')]
    pub quiet: bool,

    /// display nothing until the first byte has been transferred
    #[argh(switch, short = 'W')]
    pub wait: bool,

    /// wait this many seconds before showing the display
    #[argh(option, short = 'D')]
    pub delay_start: Option<String>,

    /// when the size is unknown, gauge current rate against peak rate
    #[argh(switch, short = 'g')]
    pub gauge: bool,

    /// seconds between display updates (0.1 to 600)
    #[argh(option, short = 'i')]
    pub interval: Option<String>,

    /// display width, instead of auto-detection
    #[argh(option, short = 'w')]
    pub width: Option<u32>,

    /// display height, instead of auto-detection
    #[argh(option, short = 'H')]
    pub height: Option<u32>,

    /// show the display even if standard error is not a terminal
    #[argh(switch, short = 'f')]
    pub force: bool,

    /// use cursor positioning instead of carriage returns
    #[argh(switch, short = 'c')]
    pub cursor: bool,

    /// limit the transfer to this many bytes (or lines) per second
    #[argh(option, short = 'L')]
    pub rate_limit: Option<String>,

    /// use a transfer buffer of this size
    #[argh(option, short = 'B')]
    pub buffer_size: Option<String>,

    /// never use the zero-copy fast path
    #[argh(switch, short = 'C')]
    pub no_splice: bool,

    /// skip unreadable input: 1 skips quietly, 2 also traces each skip
    #[argh(option, short = 'E', default = "0")]
    pub skip_errors: u32,

    /// skip this many bytes at a time past read errors (default:
    /// adaptive)
    #[argh(option, short = 'Z')]
    pub error_skip_block: Option<String>,

    /// stop transferring once --size bytes have been written
    #[argh(switch, short = 'S')]
    pub stop_at_size: bool,

    /// flush the output to disk after every write
    #[argh(switch, short = 'Y')]
    pub sync: bool,

    /// use direct I/O, bypassing the page cache
    #[argh(switch, short = 'K')]
    pub direct_io: bool,

    /// seek past output zero-runs instead of writing them
    #[argh(switch)]
    pub sparse: bool,

    /// read the input but write nothing
    #[argh(switch, short = 'X')]
    pub discard: bool,

    /// report sizes in bits instead of bytes
    #[argh(switch, short = '8')]
    pub bits: bool,

    /// use SI units (powers of 1000) for sizes and suffixes
    #[argh(switch, short = 'k')]
    pub si: bool,

    /// window in seconds for the average rate (default 30)
    #[argh(option, short = 'm', default = "30")]
    pub average_rate_window: u32,

    /// show rate statistics (min/avg/max/mdev) at the end
    #[argh(switch, short = 'v')]
    pub stats: bool,

    /// watch the file descriptors of PID (or one with PID:FD); repeatable
    #[argh(option, short = 'd')]
    pub watchfd: Vec<String>,

    /// change the settings of the running instance with this pid
    #[argh(option, short = 'R')]
    pub remote: Option<i32>,

    /// display the progress of the running instance with this pid
    #[argh(option, short = 'Q')]
    pub query: Option<i32>,

    /// buffer the whole input through FILE ('-' for a temporary file),
    /// then copy it out, so the second pass has a known size
    #[argh(option, short = 'U')]
    pub store_and_forward: Option<String>,

    /// write our process ID to FILE
    #[argh(option, short = 'P')]
    pub pidfile: Option<String>,

    /// print the version and exit
    #[argh(switch, short = 'V')]
    pub version: bool,
}

// Returns true if the argument is a flag (e.g. `-s` or `--long`).
//
// As a special case, `-` is not treated as a flag, since it represents
// stdin/stdout.
fn is_flag(arg: &str) -> bool {
    arg.len() > 1 && arg.starts_with('-')
}

/// Transform raw argv into arguments suitable for parsing by `argh`:
/// `--arg=val` splits into `--arg val`, and `-h` becomes `--help`.
pub fn prepare_args<I: IntoIterator<Item = String>>(args_iter: I) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    for arg in args_iter {
        match arg.as_str() {
            "-h" => args.push("--help".to_string()),
            arg if is_flag(arg) => {
                if let Some((key, value)) = arg.split_once('=') {
                    args.push(key.to_string());
                    args.push(value.to_string());
                } else {
                    args.push(arg.to_string());
                }
            }
            arg => args.push(arg.to_string()),
        }
    }
    args
}

/// Parse a `PID` or `PID:FD` watch item.
pub fn parse_watch_target(spec: &str) -> Result<WatchTarget, String> {
    let (pid_part, fd_part) = match spec.split_once(':') {
        Some((pid, fd)) => (pid, Some(fd)),
        None => (spec, None),
    };
    let pid: libc::pid_t = pid_part
        .parse()
        .map_err(|_| format!("{}: invalid process ID", spec))?;
    if pid < 1 {
        return Err(format!("{}: invalid process ID", spec));
    }
    let fd: libc::c_int = match fd_part {
        Some(fd) => fd
            .parse()
            .map_err(|_| format!("{}: invalid file descriptor", spec))?,
        None => -1,
    };
    Ok(WatchTarget { pid, fd })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        let prepared = prepare_args(args.iter().map(|s| s.to_string()));
        let refs: Vec<&str> = prepared.iter().map(|s| s.as_str()).collect();
        Options::from_args(&["pipemeter"], &refs).expect("parse failed")
    }

    #[test]
    fn basic_toggles() {
        let opts = parse(&["-p", "-t", "-e", "-r", "-b", "file1", "file2"]);
        assert!(opts.progress && opts.timer && opts.eta && opts.rate && opts.bytes);
        assert_eq!(opts.files, vec!["file1", "file2"]);
    }

    #[test]
    fn equals_form_is_split() {
        let opts = parse(&["--size=100M", "--interval=0,5"]);
        assert_eq!(opts.size.as_deref(), Some("100M"));
        assert_eq!(opts.interval.as_deref(), Some("0,5"));
    }

    #[test]
    fn dash_positional_is_stdin() {
        let opts = parse(&["-"]);
        assert_eq!(opts.files, vec!["-"]);
    }

    #[test]
    fn watch_targets_parse() {
        assert_eq!(
            parse_watch_target("1234").unwrap(),
            WatchTarget { pid: 1234, fd: -1 }
        );
        assert_eq!(
            parse_watch_target("1234:5").unwrap(),
            WatchTarget { pid: 1234, fd: 5 }
        );
        assert!(parse_watch_target("abc").is_err());
        assert!(parse_watch_target("0").is_err());
        assert!(parse_watch_target("12:x").is_err());
    }

    #[test]
    fn skip_errors_takes_a_level() {
        let opts = parse(&["-E", "2"]);
        assert_eq!(opts.skip_errors, 2);
        let opts = parse(&[]);
        assert_eq!(opts.skip_errors, 0);
    }
}
