// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Entry point: parse the command line, build the run configuration,
//! and dispatch to the requested mode.

use std::ffi::CString;
use std::io::Write;

use anyhow::Context;
use anyhow::Result;
use argh::FromArgs;
use log::debug;

use pipemeter::cmdline;
use pipemeter::cmdline::Options;
use pipemeter::config::Config;
use pipemeter::config::FormatOptions;
use pipemeter::cursor::temp_dir;
use pipemeter::input;
use pipemeter::mainloop;
use pipemeter::remote;
use pipemeter::signals::SignalGuard;
use pipemeter::state::State;
use pipemeter::status::ExitStatus;
use pipemeter::terminal;
use pipemeter::units;
use pipemeter::watchfd;

enum Action {
    Transfer,
    StoreAndForward(String),
    Watch(Vec<watchfd::WatchTarget>),
    RemoteControl(libc::pid_t),
    Query(libc::pid_t),
}

fn stderr_is_tty() -> bool {
    // SAFETY: isatty takes no pointers.
    unsafe { libc::isatty(libc::STDERR_FILENO) != 0 }
}

/// UTF-8 capable terminal, judged from the locale environment.
fn terminal_supports_utf8() -> bool {
    for variable in ["LC_ALL", "LC_CTYPE", "LANG"] {
        if let Ok(value) = std::env::var(variable) {
            if !value.is_empty() {
                return value.to_uppercase().contains("UTF-8")
                    || value.to_uppercase().contains("UTF8");
            }
        }
    }
    false
}

fn format_options(opts: &Options) -> FormatOptions {
    let mut options = FormatOptions {
        progress: opts.progress,
        timer: opts.timer,
        eta: opts.eta,
        fineta: opts.fineta,
        rate: opts.rate,
        average_rate: opts.average_rate,
        bytes: opts.bytes,
        bufpercent: opts.buffer_percent,
        lastwritten: opts.last_written.unwrap_or(0),
    };
    // With no toggles at all, the traditional full display is shown.
    if !(options.progress
        || options.timer
        || options.eta
        || options.fineta
        || options.rate
        || options.average_rate
        || options.bytes
        || options.bufpercent
        || options.lastwritten > 0
        || opts.format.is_some())
    {
        options.progress = true;
        options.timer = true;
        options.eta = true;
        options.rate = true;
        options.bytes = true;
    }
    options
}

fn build_config(opts: &Options) -> Config {
    let mut control = Config {
        linemode: opts.line_mode,
        null_terminated_lines: opts.null,
        bits: opts.bits,
        decimal_units: opts.si,
        sparse_output: opts.sparse,
        discard_input: opts.discard,
        sync_after_write: opts.sync,
        stop_at_size: opts.stop_at_size,
        wait: opts.wait,
        numeric: opts.numeric,
        cursor: opts.cursor,
        force: opts.force,
        no_splice: opts.no_splice,
        rate_gauge: opts.gauge,
        show_stats: opts.stats,
        skip_errors: opts.skip_errors,
        name: opts.name.clone(),
        format_string: opts.format.clone(),
        default_bar_style: opts.bar_style.clone(),
        ..Default::default()
    };

    if opts.direct_io {
        control.direct_io = true;
        control.direct_io_changed = true;
    }

    control.set_interval(
        opts.interval
            .as_deref()
            .map(units::parse_interval)
            .unwrap_or(1.0),
    );
    control.delay_start = opts
        .delay_start
        .as_deref()
        .map(units::parse_interval)
        .unwrap_or(0.0);

    if let Some(size) = &opts.size {
        control.size = units::parse_size(size, control.decimal_units) as i64;
    }
    if let Some(limit) = &opts.rate_limit {
        control.rate_limit = units::parse_size(limit, control.decimal_units);
    }
    if let Some(buffer) = &opts.buffer_size {
        control.target_buffer_size = units::parse_size(buffer, control.decimal_units) as usize;
    }
    if let Some(block) = &opts.error_skip_block {
        control.error_skip_block = units::parse_size(block, control.decimal_units);
    }

    control.set_average_rate_window(opts.average_rate_window);

    // Auto-detect the terminal size where it was not given; an explicit
    // zero also means auto-detect.
    let detected = terminal::screen_size();
    match opts.width {
        Some(width) if width > 0 => control.set_width(width, true),
        _ => control.set_width(u32::from(detected.map_or(80, |(w, _)| w).max(1)), false),
    }
    match opts.height {
        Some(height) if height > 0 => control.set_height(height, true),
        _ => control.set_height(u32::from(detected.map_or(25, |(_, h)| h).max(1)), false),
    }

    // Nothing to show when stderr is not a terminal, unless forced or
    // numeric.
    if opts.quiet || (!stderr_is_tty() && !opts.force && !opts.numeric) {
        control.no_display = true;
    }

    control.set_extra_display_spec(opts.extra_display.as_deref());

    control
}

/// Write the PID file atomically: a temporary sibling is written first
/// and renamed over the target.
fn write_pidfile(path: &str) -> Result<()> {
    let tmp_template = format!("{}.XXXXXX", path);
    let c_template = CString::new(tmp_template).context("pidfile path contains NUL")?;
    let mut raw = c_template.into_bytes_with_nul();
    // SAFETY: mkstemp rewrites the template in place; the buffer stays
    // alive until after the call.
    let fd = unsafe { libc::mkstemp(raw.as_mut_ptr() as *mut libc::c_char) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("mkstemp failed");
    }
    let tmp_path = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();

    // SAFETY: we own the fd returned by mkstemp.
    let mut file = unsafe {
        use std::os::unix::io::FromRawFd;
        std::fs::File::from_raw_fd(fd)
    };
    // SAFETY: fchmod takes no pointers.
    unsafe {
        libc::fchmod(fd, 0o644);
    }

    // SAFETY: getpid takes no arguments.
    let pid = unsafe { libc::getpid() };
    let result = writeln!(file, "{}", pid)
        .map_err(anyhow::Error::from)
        .and_then(|_| std::fs::rename(&tmp_path, path).map_err(anyhow::Error::from));
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

/// Create a temporary staging file for store-and-forward.
fn make_staging_file() -> Result<String> {
    let template = temp_dir().join("pipemeter.XXXXXX");
    let c_template =
        CString::new(template.to_string_lossy().as_bytes()).context("bad temp dir")?;
    let mut raw = c_template.into_bytes_with_nul();
    // SAFETY: as in write_pidfile.
    let fd = unsafe { libc::mkstemp(raw.as_mut_ptr() as *mut libc::c_char) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("mkstemp failed");
    }
    // SAFETY: closing the fd we just received.
    unsafe {
        libc::close(fd);
    }
    Ok(String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned())
}

/// Store-and-forward: pass one drains the input into the staging file,
/// pass two replays the staging file to the real output with a known
/// size (and therefore a meaningful ETA).
fn store_and_forward(
    state: &mut State,
    opts: &Options,
    store_file: &str,
    can_have_eta: bool,
) -> ExitStatus {
    let use_temporary = store_file == "-";
    let staging = if use_temporary {
        match make_staging_file() {
            Ok(path) => path,
            Err(err) => {
                terminal::error_msg(&err.to_string());
                state.status.exit.add(ExitStatus::STORE_AND_FORWARD);
                return state.status.exit;
            }
        }
    } else {
        store_file.to_string()
    };

    let cleanup = |status: &mut State| {
        if use_temporary {
            let _ = std::fs::remove_file(&staging);
        }
        status.status.exit
    };

    debug!("store-and-forward: staging in {}", staging);

    // Pass one: real inputs into the staging file; an ETA only makes
    // sense here if the overall size was known up front.
    if input::set_output(&mut state.control, &state.transfer, Some(&staging)).is_err() {
        state.status.exit.add(ExitStatus::STORE_AND_FORWARD);
        return cleanup(state);
    }
    let mut receive_options = format_options(opts);
    receive_options.eta &= can_have_eta;
    receive_options.fineta &= can_have_eta;
    state.control.set_format(receive_options, Some("(input)"));

    let first_pass = mainloop::main_loop(state);
    if !first_pass.is_success() {
        return cleanup(state);
    }

    // Pass two: the staging file to the real output, size now known.
    if input::set_output(&mut state.control, &state.transfer, opts.output.as_deref()).is_err() {
        state.status.exit.add(ExitStatus::STORE_AND_FORWARD);
        return cleanup(state);
    }
    state.files = vec![staging.clone()];
    state.control.size = input::calc_total_size(&state.control, &state.files);

    // The staging size is now known, so the ETA toggles apply as given.
    state
        .control
        .set_format(format_options(opts), opts.name.as_deref());

    state.reset();
    mainloop::main_loop(state);

    cleanup(state)
}

fn run() -> i32 {
    let args = cmdline::prepare_args(std::env::args());
    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    let program = arg_refs.first().copied().unwrap_or("pipemeter");
    let program_name = program.rsplit('/').next().unwrap_or("pipemeter");

    let opts = match Options::from_args(&arg_refs[..1], &arg_refs[1..]) {
        Ok(opts) => opts,
        Err(exit) => {
            println!("{}", exit.output);
            return if exit.status.is_ok() { 0 } else { 1 };
        }
    };

    if opts.version {
        println!("{} {}", program_name, env!("CARGO_PKG_VERSION"));
        return 0;
    }

    terminal::set_error_prefix(program_name);

    let mut control = build_config(&opts);

    let action = if let Some(pid) = opts.remote {
        Action::RemoteControl(pid)
    } else if let Some(pid) = opts.query {
        Action::Query(pid)
    } else if !opts.watchfd.is_empty() {
        let mut targets = Vec::new();
        for spec in &opts.watchfd {
            match cmdline::parse_watch_target(spec) {
                Ok(target) => targets.push(target),
                Err(message) => {
                    terminal::error_msg(&message);
                    return ExitStatus::REMOTE_OR_PID.code();
                }
            }
        }
        Action::Watch(targets)
    } else if let Some(path) = &opts.store_and_forward {
        Action::StoreAndForward(path.clone())
    } else {
        Action::Transfer
    };

    let mut files = opts.files.clone();
    if files.is_empty() {
        debug!("no files given - using stdin");
        files.push("-".to_string());
    }

    // The output must be set before the size calculation, which may fall
    // back to measuring a block-device output.
    let transfer_placeholder = pipemeter::transfer::TransferState::default();
    if matches!(action, Action::Transfer | Action::StoreAndForward(_)) {
        if input::set_output(&mut control, &transfer_placeholder, opts.output.as_deref())
            .is_err()
        {
            return ExitStatus::ACCESS.code();
        }
    }

    let mut can_have_eta = true;
    if matches!(action, Action::Transfer) && control.size == 0 {
        control.size = input::calc_total_size(&control, &files);
        debug!("calculated total size: {}", control.size);
    }
    if control.size < 1 {
        can_have_eta = false;
    }

    let mut options = format_options(&opts);
    options.eta &= can_have_eta;
    options.fineta &= can_have_eta;
    control.set_format(options, opts.name.as_deref());

    let mut state = State::new(control, files, terminal_supports_utf8());

    if let Some(pidfile) = &opts.pidfile {
        if let Err(err) = write_pidfile(pidfile) {
            terminal::error_msg(&format!("{}: {:#}", pidfile, err));
            return ExitStatus::REMOTE_OR_PID.code();
        }
    }

    let signal_guard = match SignalGuard::install() {
        Ok(guard) => guard,
        Err(err) => {
            terminal::error_msg(&format!("failed to install signal handlers: {}", err));
            return ExitStatus::TRANSFER.code();
        }
    };

    let exit = match action {
        Action::Transfer => mainloop::main_loop(&mut state),
        Action::StoreAndForward(path) => store_and_forward(&mut state, &opts, &path, can_have_eta),
        Action::Watch(targets) => watchfd::watch_loop(&mut state, &targets),
        Action::RemoteControl(pid) => match remote::send_settings(&state, pid) {
            Ok(()) => state.status.exit,
            Err(bit) => {
                state.status.exit.add(bit);
                state.status.exit
            }
        },
        Action::Query(pid) => {
            // Learn the remote size first so the format can include an
            // ETA when it is known.
            match remote::fetch_transfer_state(&mut state, pid, false) {
                Ok(()) => {
                    let mut options = format_options(&opts);
                    let known = state.control.size > 0;
                    options.eta &= known;
                    options.fineta &= known;
                    state.control.set_format(options, opts.name.as_deref());
                    mainloop::query_loop(&mut state, pid)
                }
                Err(bit) => {
                    state.status.exit.add(bit);
                    state.status.exit
                }
            }
        }
    };

    input::close_output(&mut state.control, &state.transfer);

    if let Some(pidfile) = &opts.pidfile {
        if let Err(err) = std::fs::remove_file(pidfile) {
            terminal::error_msg(&format!("{}: {}", pidfile, err));
        }
    }

    drop(signal_guard);

    debug!("exiting with status {}", exit.code());
    exit.code()
}

fn main() {
    env_logger::init();
    std::process::exit(run());
}
