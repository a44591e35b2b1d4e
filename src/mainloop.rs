// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The main control loop: schedules transfer ticks against the display
//! interval, feeds the leaky-bucket rate limiter, walks the input list,
//! and reconciles pipe consumption before every refresh.

use std::mem;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::debug;

use crate::clock;
use crate::config::Config;
use crate::display;
use crate::flags;
use crate::input;
use crate::remote;
use crate::state::State;
use crate::status::ExitStatus;
use crate::sys;
use crate::terminal;
use crate::transfer::Tracking;

/// Nanoseconds between leaky-bucket refills.
const RATE_GRANULARITY: Duration = Duration::from_millis(100);
/// The bucket holds at most this many seconds' worth of rate.
const RATE_BURST_WINDOW: u64 = 5;
/// How often the remote-control channel is polled.
pub const REMOTE_CHECK_INTERVAL: Duration = Duration::from_millis(100);
/// Pause when there is nothing to do but wait for the consumer.
const IDLE_PAUSE: Duration = Duration::from_millis(50);

/// Handle a pending terminal-resize flag: re-detect the size, keeping
/// any manually set dimension.  Returns true if the flag was set.
pub fn resize_on_signal(control: &mut Config) -> bool {
    if !flags::flags().terminal_resized.swap(false, Ordering::SeqCst) {
        return false;
    }
    if let Some((width, height)) = terminal::screen_size() {
        if !control.width_set_manually {
            control.set_width(u32::from(width), false);
        }
        if !control.height_set_manually {
            control.set_height(u32::from(height), false);
        }
    }
    true
}

/// Copy the display's tracking requirements into the engine.
fn sync_tracking(state: &mut State) {
    state.transfer.tracking = Tracking {
        previous_line: state.display.showing_previous_line,
        lastwritten_bytes: state.display.lastwritten_bytes,
    };
}

/// Emit the end-of-run `rate min/avg/max/mdev` line if requested.
fn show_stats(state: &State) {
    if !state.control.show_stats {
        return;
    }
    let unit = if state.control.bits { "b/s" } else { "B/s" };
    let line = match state.calc.rate_stats() {
        Some((min, mean, max, deviation)) => format!(
            "rate min/avg/max/mdev = {:.3}/{:.3}/{:.3}/{:.3} {}\n",
            min, mean, max, deviation, unit
        ),
        None => "rate not measured\n".to_string(),
    };
    terminal::tty_write(flags::flags(), line.as_bytes());
}

fn output_is_pipe(fd: libc::c_int) -> bool {
    // SAFETY: fstat writes only into the zeroed stat struct.
    unsafe {
        let mut sb: libc::stat = mem::zeroed();
        libc::fstat(fd, &mut sb) == 0 && sb.st_mode & libc::S_IFMT == libc::S_IFIFO
    }
}

/// Refresh `written_but_not_consumed` from the kernel's pipe buffer
/// occupancy, then derive `transferred` from it.
fn reconcile_pipe(state: &mut State, is_pipe: bool) {
    let transfer = &mut state.transfer;

    if is_pipe {
        if flags::flags().pipe_closed.load(Ordering::SeqCst) {
            transfer.written_but_not_consumed = 0;
        } else {
            match sys::pipe_unread_bytes(state.control.output_fd) {
                Ok(unread) => transfer.written_but_not_consumed = unread,
                Err(err) => {
                    debug!("FIONREAD failed: {}", err);
                    transfer.written_but_not_consumed = 0;
                }
            }
        }
    }

    transfer.transferred = transfer.total_written;
    if is_pipe && !state.control.linemode {
        transfer.transferred -= transfer.written_but_not_consumed as i64;
    } else if is_pipe && state.control.linemode && transfer.written_but_not_consumed > 0 {
        // Walk the separator positions backwards to translate unread
        // bytes into unread lines.
        let last_consumed_position =
            transfer.last_output_position - transfer.written_but_not_consumed as i64;
        let lines_not_consumed = transfer.line_positions.lines_beyond(last_consumed_position);
        transfer.transferred -= lines_not_consumed as i64;
    }
}

/// Pipe data from the input list to the output, updating the display at
/// each interval.  Returns the accumulated exit status.
pub fn main_loop(state: &mut State) -> ExitStatus {
    let output_fd = state.control.output_fd;
    let is_pipe = output_is_pipe(output_fd);
    if is_pipe {
        debug!("output is a pipe");
    }

    state.cursor.init(&state.control);

    let mut eof_in = false;
    let mut eof_out = false;
    let mut final_update = false;
    state.transfer.total_written = 0;
    state.transfer.written_but_not_consumed = 0;
    state.display.initial_offset = 0;

    let mut start_time = clock::monotonic();
    let mut cur_time = start_time;
    let mut next_ratecheck = cur_time;
    let mut next_remotecheck = cur_time;
    let mut next_update = cur_time
        + if state.control.delay_start > state.control.interval {
            clock::duration_from_secs(state.control.delay_start)
        } else {
            clock::duration_from_secs(state.control.interval)
        };

    let mut bucket: f64 = 0.0;
    let mut file_idx = 0usize;

    // Open the first readable input; give up early if there is none.
    let mut input_fd = -1;
    while input_fd < 0 && file_idx < state.files.len() {
        match input::next_file(&mut state.status, &state.files, file_idx, -1) {
            Some(fd) => input_fd = fd,
            None => file_idx += 1,
        }
    }
    if input_fd < 0 {
        state.cursor.fini(&state.control);
        return state.status.exit;
    }

    input::advise_sequential(input_fd);

    if state.control.target_buffer_size == 0 {
        state.control.target_buffer_size = input::auto_buffer_size(input_fd);
    }

    // Parse the format up front so the engine knows what to track from
    // the very first tick.
    display::parse::parse_format(
        &mut state.display,
        &mut state.status,
        &state.control,
        &state.transfer,
        &state.calc,
        state.control.format_string.clone().as_deref(),
    );
    sync_tracking(state);

    let mut last_lines: u64 = 0;
    let mut last_written: u64 = 0;

    while !(eof_in && eof_out) || !final_update {
        let mut cansend: u64 = 0;

        // Poll the remote-control channel every short while.
        if cur_time > next_remotecheck {
            remote::check(state);
            sync_tracking(state);
            next_remotecheck += REMOTE_CHECK_INTERVAL;
        }

        if flags::flags().exit_requested() {
            break;
        }

        if state.control.rate_limit > 0 {
            cur_time = clock::monotonic();
            if cur_time > next_ratecheck {
                bucket += state.control.rate_limit as f64
                    / (1_000_000_000.0 / RATE_GRANULARITY.as_nanos() as f64);
                let burst_max = (state.control.rate_limit * RATE_BURST_WINDOW) as f64;
                if bucket > burst_max {
                    bucket = burst_max;
                }
                next_ratecheck += RATE_GRANULARITY;
            }
            cansend = bucket as u64;
        }

        // Never write more than the remaining size with --stop-at-size.
        if state.control.size > 0 && state.control.stop_at_size {
            let written_plus_budget = state.transfer.total_written + cansend as i64;
            if state.control.size < written_plus_budget
                || (cansend == 0 && state.control.rate_limit == 0)
            {
                let remaining = state.control.size - state.transfer.total_written;
                if remaining <= 0 {
                    debug!("write limit reached - setting EOF flags");
                    cansend = 0;
                    eof_in = true;
                    eof_out = true;
                } else {
                    cansend = remaining as u64;
                }
            }
        }

        let skip_tick = state.control.size > 0
            && state.control.stop_at_size
            && cansend == 0
            && eof_in
            && eof_out;
        if skip_tick {
            last_written = 0;
            last_lines = 0;
        } else {
            let input_label = input::input_name(&state.files, file_idx).to_string();
            match state.transfer.tick(
                &mut state.control,
                &mut state.status.exit,
                &input_label,
                input_fd,
                &mut eof_in,
                &mut eof_out,
                cansend,
            ) {
                Ok(outcome) => {
                    last_written = outcome.written;
                    last_lines = outcome.lines;
                }
                Err(err) => {
                    debug!("transfer failed: {}", err);
                    state.cursor.fini(&state.control);
                    return state.status.exit;
                }
            }
        }

        if state.control.linemode {
            state.transfer.total_written += last_lines as i64;
            if state.control.rate_limit > 0 {
                bucket -= last_lines as f64;
            }
        } else {
            state.transfer.total_written += last_written as i64;
            if state.control.rate_limit > 0 {
                bucket -= last_written as f64;
            }
        }
        if bucket < 0.0 {
            bucket = 0.0;
        }

        reconcile_pipe(state, is_pipe);

        // At EOF with files remaining, move on to the next input.
        while eof_in && eof_out && file_idx + 1 < state.files.len() {
            file_idx += 1;
            match input::next_file(&mut state.status, &state.files, file_idx, input_fd) {
                Some(fd) => {
                    input_fd = fd;
                    eof_in = false;
                    eof_out = false;
                    input::advise_sequential(input_fd);
                }
                None => input_fd = -1,
            }
        }

        cur_time = clock::monotonic();

        if eof_in && eof_out && state.transfer.written_but_not_consumed == 0 {
            final_update = true;
            if state.display.output_produced || state.control.delay_start < 0.001 {
                next_update = cur_time;
            }
        }

        // Everything is written but the consumer is lagging; do not spin.
        if eof_in && eof_out && state.transfer.written_but_not_consumed > 0 {
            std::thread::sleep(IDLE_PAUSE);
        }

        // With --wait, displaying (and timing) starts with the first
        // byte or line.
        if state.control.wait {
            let moved = if state.control.linemode {
                last_lines >= 1
            } else {
                last_written >= 1
            };
            if !moved {
                continue;
            }
            state.control.wait = false;

            // Restart the clocks as though the transfer began now; block
            // the stop signals so a pause cannot interleave with this.
            crate::signals::block_pause();
            start_time = clock::monotonic();
            flags::flags().reset_stoppage();
            crate::signals::allow_pause();

            next_update = start_time + clock::duration_from_secs(state.control.interval);
        }

        state.transfer.elapsed_seconds = clock::elapsed_transfer_seconds(
            start_time,
            cur_time,
            flags::flags().total_stoppage(),
        );

        if state.control.no_display && !state.control.show_stats {
            continue;
        }

        if cur_time < next_update {
            continue;
        }
        next_update += clock::duration_from_secs(state.control.interval);
        if next_update < cur_time {
            next_update = cur_time;
        }

        resize_on_signal(&mut state.control);

        if state.control.no_display {
            // Keep the statistics fresh even without a display.
            state.calc.update(
                &state.transfer,
                &state.control,
                state.display.initial_offset,
                final_update,
            );
        } else {
            display::show(
                &mut state.display,
                Some(&mut state.extra_display),
                &mut state.status,
                &state.control,
                &state.transfer,
                &mut state.calc,
                &mut state.cursor,
                final_update,
            );
            sync_tracking(state);
        }
    }

    debug!("loop ended: eof_in={}, eof_out={}", eof_in, eof_out);

    if state.control.cursor {
        state.cursor.fini(&state.control);
    } else if !state.control.numeric
        && !state.control.no_display
        && state.display.output_produced
    {
        terminal::tty_write(flags::flags(), b"\n");
    }

    if flags::flags().exit_requested() {
        state.status.exit.add(ExitStatus::SIGNAL);
    }

    if input_fd >= 0 && input_fd != libc::STDIN_FILENO {
        // SAFETY: closing an fd we own.
        unsafe {
            libc::close(input_fd);
        }
    }

    show_stats(state);

    state.status.exit
}

/// Watch the progress of another instance (`--query PID`): poll its
/// transfer state over the query channel and render it locally until
/// that process exits.
pub fn query_loop(state: &mut State, query_pid: libc::pid_t) -> ExitStatus {
    state.cursor.init(&state.control);
    state.display.initial_offset = 0;

    let mut cur_time = clock::monotonic();
    let mut next_remotecheck = cur_time;
    let mut next_update = cur_time
        + if state.control.delay_start > state.control.interval {
            clock::duration_from_secs(state.control.delay_start)
        } else {
            clock::duration_from_secs(state.control.interval)
        };

    while sys::pid_exists(query_pid) {
        if cur_time > next_remotecheck {
            if remote::fetch_transfer_state(state, query_pid, true).is_err() {
                break;
            }
            remote::check(state);
            next_remotecheck += REMOTE_CHECK_INTERVAL;
            if next_update < cur_time {
                next_update = cur_time;
                next_remotecheck += REMOTE_CHECK_INTERVAL;
            }
        }

        if flags::flags().exit_requested() {
            break;
        }

        cur_time = clock::monotonic();

        if state.control.no_display && !state.control.show_stats {
            std::thread::sleep(IDLE_PAUSE);
            continue;
        }

        if state.control.wait {
            if state.transfer.transferred < 1 {
                std::thread::sleep(IDLE_PAUSE);
                continue;
            }
            state.control.wait = false;
            next_update = cur_time + clock::duration_from_secs(state.control.interval);
        }

        if cur_time < next_update {
            std::thread::sleep(IDLE_PAUSE);
            continue;
        }
        next_update += clock::duration_from_secs(state.control.interval);
        if next_update < cur_time {
            next_update = cur_time;
        }

        resize_on_signal(&mut state.control);

        if state.control.no_display {
            state.calc.update(
                &state.transfer,
                &state.control,
                state.display.initial_offset,
                false,
            );
        } else {
            display::show(
                &mut state.display,
                Some(&mut state.extra_display),
                &mut state.status,
                &state.control,
                &state.transfer,
                &mut state.calc,
                &mut state.cursor,
                false,
            );
        }
    }

    if state.control.cursor {
        state.cursor.fini(&state.control);
    } else if !state.control.numeric
        && !state.control.no_display
        && state.display.output_produced
    {
        terminal::tty_write(flags::flags(), b"\n");
    }

    if flags::flags().exit_requested() {
        state.status.exit.add(ExitStatus::SIGNAL);
    }

    show_stats(state);

    state.status.exit
}
