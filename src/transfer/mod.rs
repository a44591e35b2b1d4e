// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The transfer engine: moves data from the current input fd to the
//! output fd, one bounded step per call, with rate capping, a zero-copy
//! fast path, read-error skipping, sparse-output elision, and line
//! accounting.
//!
//! Scheduling is cooperative and single-threaded.  The only suspensions
//! are the 90 ms readiness select and the 10 ms pause after a transient
//! error; signal handlers interact with this module purely through the
//! atomic flag set.

pub mod buffer;
pub mod ring;

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;

use log::debug;
use remain::sorted;
use thiserror::Error;

use crate::clock;
use crate::config::Config;
use crate::config::DEFAULT_BUFFER_SIZE;
use crate::flags;
use crate::status::ExitStatus;
use crate::sys;
use crate::terminal;
use buffer::TransferBuffer;
use ring::PositionRing;

/// Largest single read() request.
const MAX_READ_AT_ONCE: usize = 524_288;
/// Largest single write() request.
const MAX_WRITE_AT_ONCE: usize = 524_288;
/// Wall-clock budget for one read retry loop, seconds.
const READ_RETRY_BUDGET: f64 = 0.09;
/// Wall-clock budget for one write retry loop, seconds.
const WRITE_RETRY_BUDGET: f64 = 0.9;
/// Readiness poll timeout, microseconds.
const SELECT_TIMEOUT_USEC: i64 = 90_000;
/// Pause after a transient error, microseconds.
const TRANSIENT_PAUSE_USEC: i64 = 10_000;

/// Capacity of the last-written tail kept for the `%A` display.
pub const LASTWRITTEN_BUFFER_SIZE: usize = 256;
/// Capacity of the previous-line buffers kept for the `%L` display
/// (content is capped one byte short of this).
pub const PREVLINE_BUFFER_SIZE: usize = 1024;

#[sorted]
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("select call failed: {0}")]
    Select(io::Error),
    #[error("write failed: {0}")]
    Write(io::Error),
}

/// What the display layer needs the engine to observe about the data it
/// writes; refreshed whenever the format string is reparsed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tracking {
    /// Maintain the previous-line buffer for `%L`.
    pub previous_line: bool,
    /// How many trailing output bytes to keep for `%A`; 0 disables.
    pub lastwritten_bytes: usize,
}

/// One engine step's result.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickOutcome {
    /// Bytes moved to the output this call (via write or splice).
    pub written: u64,
    /// Line separators written this call; only meaningful in line mode.
    pub lines: u64,
}

enum Step {
    Continue,
    Transient,
}

/// Mutable transfer state, shared with the formatters read-only.
pub struct TransferState {
    /// Elapsed transfer seconds, maintained by the control loop.
    pub elapsed_seconds: f64,
    pub buffer: Option<TransferBuffer>,
    /// Upper bound of bytes to write this call.
    pub to_write: usize,
    /// Bytes in the output pipe not yet read by the consumer.
    pub written_but_not_consumed: usize,
    /// All bytes read from inputs, including spliced ones.
    pub total_bytes_read: u64,
    /// Total bytes (or lines, in line mode) written since the start.
    pub total_written: i64,
    /// What the downstream consumer has actually received.
    pub transferred: i64,
    pub line_positions: PositionRing,
    /// Output offset one past the last byte scanned for separators.
    pub last_output_position: i64,
    pub read_errors_in_a_row: u64,
    pub last_read_fd: RawFd,
    pub read_error_warning_shown: bool,
    /// Input fd splice was seen to fail on; never retried for that fd.
    pub splice_failed_fd: RawFd,
    /// Whether the last step moved data with splice.
    pub splice_used: bool,
    pub output_not_seekable: bool,
    pub tracking: Tracking,
    /// Sliding window of the last bytes written, for `%A`.
    pub lastwritten: Vec<u8>,
    /// The most recent complete output line, for `%L`.
    pub previous_line: Vec<u8>,
    next_line: Vec<u8>,
    written_this_call: u64,
}

impl Default for TransferState {
    fn default() -> Self {
        TransferState {
            elapsed_seconds: 0.0,
            buffer: None,
            to_write: 0,
            written_but_not_consumed: 0,
            total_bytes_read: 0,
            total_written: 0,
            transferred: 0,
            line_positions: PositionRing::default(),
            last_output_position: 0,
            read_errors_in_a_row: 0,
            last_read_fd: -1,
            read_error_warning_shown: false,
            splice_failed_fd: -1,
            splice_used: false,
            output_not_seekable: false,
            tracking: Tracking::default(),
            lastwritten: vec![0; LASTWRITTEN_BUFFER_SIZE],
            previous_line: Vec::with_capacity(PREVLINE_BUFFER_SIZE),
            next_line: Vec::with_capacity(PREVLINE_BUFFER_SIZE),
            written_this_call: 0,
        }
    }
}

impl TransferState {
    /// Reset the per-run counters, keeping allocations.
    pub fn reset(&mut self) {
        self.elapsed_seconds = 0.0;
        self.to_write = 0;
        self.written_but_not_consumed = 0;
        self.total_bytes_read = 0;
        self.total_written = 0;
        self.transferred = 0;
        self.line_positions.clear();
        self.last_output_position = 0;
        self.read_errors_in_a_row = 0;
        self.last_read_fd = -1;
        self.read_error_warning_shown = false;
        self.splice_failed_fd = -1;
        self.splice_used = false;
        self.output_not_seekable = false;
        self.previous_line.clear();
        self.next_line.clear();
    }

    /// Buffer fill, as a percentage of its capacity.
    pub fn buffer_percentage(&self) -> Option<f64> {
        self.buffer.as_ref().map(|b| b.fill_percentage())
    }

    /// Move some data from `fd` to the output, timing out after 9/100 of
    /// a second.  If the rate limit is active or `allowed` is nonzero,
    /// at most `allowed` bytes are written.  `eof_in`/`eof_out` flag the
    /// end of reading and writing respectively.
    pub fn tick(
        &mut self,
        control: &mut Config,
        exit: &mut ExitStatus,
        input_name: &str,
        fd: RawFd,
        eof_in: &mut bool,
        eof_out: &mut bool,
        allowed: u64,
    ) -> Result<TickOutcome, TransferError> {
        // Apply a direct-io change to both descriptors.
        if control.direct_io_changed {
            if !*eof_in {
                set_direct_io(fd, control.direct_io);
            }
            if !*eof_out {
                set_direct_io(control.output_fd, control.direct_io);
            }
            control.direct_io_changed = false;
        }

        // Each input file gets a fresh error-skipping state.
        if fd != self.last_read_fd {
            self.last_read_fd = fd;
            self.read_errors_in_a_row = 0;
            self.read_error_warning_shown = false;
        }

        let target = if control.target_buffer_size > 0 {
            control.target_buffer_size
        } else {
            DEFAULT_BUFFER_SIZE
        };
        match &mut self.buffer {
            None => self.buffer = Some(TransferBuffer::allocate(control.output_fd, fd, target)),
            Some(buffer) if buffer.capacity() < target => {
                buffer.grow(control.output_fd, fd, target)
            }
            Some(_) => {}
        }

        let mut lines_written: u64 = 0;

        if *eof_in && *eof_out {
            return Ok(TickOutcome::default());
        }

        let (space_remaining, pending_len) = match &self.buffer {
            Some(buffer) => (buffer.space_remaining(), buffer.pending_len()),
            None => return Ok(TickOutcome::default()),
        };

        let check_read_fd = if !*eof_in && space_remaining > 0 { fd } else { -1 };

        // The write budget comes from what is already buffered; the rate
        // limiter and the caller's allowance cap it further.
        self.to_write = pending_len;
        if (control.rate_limit > 0 || allowed > 0) && self.to_write as u64 > allowed {
            self.to_write = allowed as usize;
        }

        let check_write_fd = if !*eof_out && self.to_write > 0 {
            control.output_fd
        } else {
            -1
        };

        let (ready_to_read, ready_to_write) =
            match is_data_ready(check_read_fd, check_write_fd, SELECT_TIMEOUT_USEC) {
                Ok(ready) => ready,
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => {
                    return Ok(TickOutcome::default())
                }
                Err(err) => {
                    terminal::error_msg(&format!("{}: select call failed: {}", input_name, err));
                    exit.add(ExitStatus::TRANSFER);
                    return Err(TransferError::Select(err));
                }
            };

        self.written_this_call = 0;
        self.splice_used = false;

        if ready_to_read {
            match self.read_step(control, exit, input_name, fd, eof_in, eof_out, allowed)? {
                Step::Continue => {}
                Step::Transient => return Ok(TickOutcome::default()),
            }
        }

        // In line mode, only write up to and including the last separator
        // so output moves line-by-line.
        if self.to_write > 0 && control.linemode && !control.null_terminated_lines {
            if let Some(buffer) = &self.buffer {
                let pending = buffer.pending();
                let window = &pending[..self.to_write.min(pending.len())];
                if let Some(pos) = window.iter().rposition(|&b| b == b'\n') {
                    self.to_write = pos + 1;
                }
            }
        }

        let pending_len = self.buffer.as_ref().map_or(0, |b| b.pending_len());
        if ready_to_write && !self.splice_used && pending_len > 0 && self.to_write > 0 {
            match self.write_step(control, exit, eof_in, eof_out, &mut lines_written)? {
                Step::Continue => {}
                Step::Transient => return Ok(TickOutcome::default()),
            }
        }

        if let Some(buffer) = &mut self.buffer {
            buffer.compact();
        }

        Ok(TickOutcome {
            written: self.written_this_call,
            lines: lines_written,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn read_step(
        &mut self,
        control: &Config,
        exit: &mut ExitStatus,
        input_name: &str,
        fd: RawFd,
        eof_in: &mut bool,
        eof_out: &mut bool,
        allowed: u64,
    ) -> Result<Step, TransferError> {
        let mut forbid_skip = control.skip_errors == 0;

        let mut bytes_can_read = self.buffer.as_ref().map_or(0, |b| b.space_remaining());

        // Never read past the configured size with --stop-at-size; this
        // is not workable in line mode.
        if control.stop_at_size && !control.linemode && control.size > 0 {
            let remaining = (control.size - self.total_bytes_read as i64).max(0) as usize;
            if bytes_can_read > remaining {
                bytes_can_read = remaining;
            }
        }

        // Zero-copy fast path: only when the buffer is empty, and never
        // again on an fd it has failed on.
        let mut read_error: Option<io::Error> = None;
        let mut spliced = false;
        if !control.linemode
            && !control.no_splice
            && fd != self.splice_failed_fd
            && self.buffer.as_ref().map_or(0, |b| b.pending_len()) == 0
        {
            let bytes_to_splice = if control.rate_limit > 0 || allowed > 0 {
                allowed as usize
            } else {
                bytes_can_read
            };
            match sys::splice(fd, control.output_fd, bytes_to_splice) {
                Ok(0) => {
                    // EOF from splice is not reliable; fall back to read.
                }
                Ok(n) => {
                    spliced = true;
                    self.splice_used = true;
                    self.written_this_call = n as u64;
                    self.total_bytes_read += n as u64;
                    if control.sync_after_write {
                        if let Err(err) = sync_data(control.output_fd) {
                            // A sync failure is a write-side problem, so
                            // error skipping must not try to absorb it.
                            read_error = Some(err);
                            forbid_skip = true;
                            spliced = false;
                            self.splice_used = false;
                        }
                    }
                }
                Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
                    debug!("fd {}: splice failed with EINVAL - disabling", fd);
                    self.splice_failed_fd = fd;
                }
                Err(err) if err.raw_os_error() == Some(libc::EAGAIN) => {
                    // Nothing to move yet; treat as transient below.
                    self.splice_used = true;
                    read_error = Some(err);
                }
                Err(err) => {
                    read_error = Some(err);
                }
            }
        }

        if spliced {
            self.read_errors_in_a_row = 0;
            return Ok(Step::Continue);
        }

        if read_error.is_none() {
            let buffer = match &mut self.buffer {
                Some(buffer) => buffer,
                None => return Ok(Step::Continue),
            };
            match read_repeated(fd, &mut buffer.read_target()[..bytes_can_read]) {
                Ok(0) => {
                    *eof_in = true;
                    if buffer.pending_len() == 0 {
                        *eof_out = true;
                    }
                    return Ok(Step::Continue);
                }
                Ok(n) => {
                    self.read_errors_in_a_row = 0;
                    buffer.commit_read(n);
                    self.total_bytes_read += n as u64;
                    return Ok(Step::Continue);
                }
                Err(err) => read_error = Some(err),
            }
        }

        let err = match read_error {
            Some(err) => err,
            None => return Ok(Step::Continue),
        };

        // Transient errors just pause briefly.
        if matches!(err.raw_os_error(), Some(libc::EINTR) | Some(libc::EAGAIN)) {
            let _ = is_data_ready(-1, -1, TRANSIENT_PAUSE_USEC);
            return Ok(Step::Transient);
        }

        // The error is real: record it in the exit status whether or not
        // we go on to skip past it.
        exit.add(ExitStatus::TRANSFER);
        self.read_errors_in_a_row += 1;

        if forbid_skip {
            terminal::error_msg(&format!("{}: read failed: {}", input_name, err));
            *eof_in = true;
            if self.buffer.as_ref().map_or(0, |b| b.pending_len()) == 0 {
                *eof_out = true;
            }
            return Ok(Step::Continue);
        }

        self.skip_past_read_error(control, input_name, fd, &err, bytes_can_read, eof_in, eof_out);
        Ok(Step::Continue)
    }

    /// The error-skip protocol: seek the input past the unreadable
    /// region, zero-fill its image in the buffer so output positioning
    /// is preserved, and warn once per input.
    #[allow(clippy::too_many_arguments)]
    fn skip_past_read_error(
        &mut self,
        control: &Config,
        input_name: &str,
        fd: RawFd,
        err: &io::Error,
        bytes_can_read: usize,
        eof_in: &mut bool,
        eof_out: &mut bool,
    ) {
        if !self.read_error_warning_shown {
            terminal::error_msg(&format!(
                "{}: warning: read errors detected: {}",
                input_name, err
            ));
            self.read_error_warning_shown = true;
        }

        // SAFETY: lseek takes no pointers; the result is checked.
        let orig_offset = unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) };
        if orig_offset < 0 {
            terminal::error_msg(&format!(
                "{}: file is not seekable: {}",
                input_name,
                io::Error::last_os_error()
            ));
            *eof_in = true;
            if self.buffer.as_ref().map_or(0, |b| b.pending_len()) == 0 {
                *eof_out = true;
            }
            return;
        }

        let mut amount_to_skip = if control.error_skip_block > 0 {
            control.error_skip_block as i64
        } else {
            adaptive_skip_amount(self.read_errors_in_a_row)
        };

        // Round down to a block boundary of the skip size, so repeated
        // errors scan block-aligned offsets.
        if amount_to_skip > 1 {
            let mut skip_offset = orig_offset + amount_to_skip;
            skip_offset -= skip_offset % amount_to_skip;
            if skip_offset > orig_offset {
                amount_to_skip = skip_offset - orig_offset;
            }
        }

        if amount_to_skip > bytes_can_read as i64 {
            amount_to_skip = bytes_can_read as i64;
        }

        // SAFETY: as above.
        let mut skip_offset =
            unsafe { libc::lseek(fd, orig_offset + amount_to_skip, libc::SEEK_SET) };
        if skip_offset < 0 {
            // Possibly past the end of the input; try a single byte.
            amount_to_skip = 1;
            // SAFETY: as above.
            skip_offset = unsafe { libc::lseek(fd, orig_offset + amount_to_skip, libc::SEEK_SET) };
        }

        if skip_offset < 0 {
            *eof_in = true;
            let seek_err = io::Error::last_os_error();
            // EINVAL means we tried to seek past the end, i.e. the input
            // has simply ended.
            if seek_err.raw_os_error() != Some(libc::EINVAL) {
                terminal::error_msg(&format!(
                    "{}: failed to seek past error: {}",
                    input_name, seek_err
                ));
            }
            return;
        }

        let amount_skipped = skip_offset - orig_offset;
        if amount_skipped > 0 {
            if let Some(buffer) = &mut self.buffer {
                buffer.zero_fill(amount_skipped as usize);
            }
            if control.skip_errors >= 2 {
                terminal::error_msg(&format!(
                    "{}: skipped past read error: {} - {} ({} B)",
                    input_name, orig_offset, skip_offset, amount_skipped
                ));
            }
        } else {
            *eof_in = true;
            if self.buffer.as_ref().map_or(0, |b| b.pending_len()) == 0 {
                *eof_out = true;
            }
        }
    }

    fn write_step(
        &mut self,
        control: &Config,
        exit: &mut ExitStatus,
        eof_in: &mut bool,
        eof_out: &mut bool,
        lines_written: &mut u64,
    ) -> Result<Step, TransferError> {
        let to_write = self.to_write;
        let mut nwritten: usize = 0;
        let mut wrote_without_io = false;
        let mut write_error: Option<io::Error> = None;

        if control.discard_input {
            nwritten = to_write;
            wrote_without_io = true;
        } else if to_write > 0 {
            // Sparse elision: a pending slice of pure zeroes becomes a
            // forward seek instead of a write.
            if control.sparse_output && !self.output_not_seekable {
                let all_nulls = self.buffer.as_ref().map_or(false, |buffer| {
                    buffer.pending()[..to_write].iter().all(|&byte| byte == 0)
                });
                if all_nulls {
                    // SAFETY: lseek takes no pointers; result checked.
                    let offset = unsafe {
                        libc::lseek(control.output_fd, to_write as libc::off_t, libc::SEEK_CUR)
                    };
                    if offset < 0 {
                        debug!("output lseek failed: {}", io::Error::last_os_error());
                        self.output_not_seekable = true;
                    } else {
                        nwritten = to_write;
                        wrote_without_io = true;
                    }
                }
            }

            if !wrote_without_io {
                // A long write must not stall the display: arm a repeating
                // alarm so it is interrupted with EINTR at each interval.
                crate::signals::arm_write_alarm(control.interval);
                let result = {
                    let buffer = match &self.buffer {
                        Some(buffer) => buffer,
                        None => return Ok(Step::Continue),
                    };
                    write_repeated(
                        control.output_fd,
                        &buffer.pending()[..to_write],
                        control.sync_after_write,
                    )
                };
                crate::signals::clear_write_alarm();
                match result {
                    Ok(n) => nwritten = n,
                    Err(err) => write_error = Some(err),
                }
            }
        }

        if let Some(err) = write_error {
            if err.raw_os_error() == Some(libc::EPIPE) {
                // The reader went away; this ends the transfer cleanly.
                *eof_in = true;
                *eof_out = true;
                flags::flags().pipe_closed.store(true, Ordering::SeqCst);
                debug!("EPIPE on write - output pipe closed");
                return Ok(Step::Transient);
            }
            terminal::error_msg(&format!("write failed: {}", err));
            exit.add(ExitStatus::TRANSFER);
            *eof_out = true;
            return Err(TransferError::Write(err));
        }

        if nwritten == 0 {
            // The write blocked before anything went out; wait briefly.
            let _ = is_data_ready(-1, -1, TRANSIENT_PAUSE_USEC);
            return Ok(Step::Transient);
        }

        // Data went out (or was elided); account for it, scanning for
        // line separators when counting lines or showing the last line.
        let tracking_lines = control.linemode || self.tracking.previous_line;
        if tracking_lines {
            let separator = if control.null_terminated_lines { 0u8 } else { b'\n' };
            let track_previous = self.tracking.previous_line;
            let track_positions = control.linemode;
            if let Some(buffer) = &self.buffer {
                for &byte in &buffer.pending()[..nwritten] {
                    if byte != separator {
                        if track_previous && self.next_line.len() < PREVLINE_BUFFER_SIZE - 1 {
                            self.next_line.push(byte);
                        }
                    } else {
                        *lines_written += 1;
                        if track_previous {
                            mem::swap(&mut self.previous_line, &mut self.next_line);
                            self.next_line.clear();
                        }
                        if track_positions {
                            self.line_positions.push(self.last_output_position);
                        }
                    }
                    self.last_output_position += 1;
                }
            }
        }

        // Keep the rolling tail of the output for the %A display.
        if self.tracking.lastwritten_bytes > 0 {
            let window = self.tracking.lastwritten_bytes.min(LASTWRITTEN_BUFFER_SIZE);
            if let Some(buffer) = &self.buffer {
                push_tail(
                    &mut self.lastwritten[..window],
                    &buffer.pending()[..nwritten],
                );
            }
        }

        self.written_this_call += nwritten as u64;

        let drained = match &mut self.buffer {
            Some(buffer) => buffer.advance_write(nwritten),
            None => true,
        };
        if drained && *eof_in {
            *eof_out = true;
        }

        Ok(Step::Continue)
    }
}

/// The adaptive error-skip schedule: 1 byte for the first few errors in a
/// row, then 2, then doubling, capped at 512 bytes.
fn adaptive_skip_amount(errors_in_a_row: u64) -> i64 {
    if errors_in_a_row < 10 {
        if errors_in_a_row < 5 {
            1
        } else {
            2
        }
    } else if errors_in_a_row < 20 {
        1i64 << (errors_in_a_row - 10)
    } else {
        512
    }
}

/// Slide `chunk` into the end of the fixed window `tail`.
fn push_tail(tail: &mut [u8], chunk: &[u8]) {
    if tail.is_empty() {
        return;
    }
    let new_portion = chunk.len().min(tail.len());
    let old_portion = tail.len() - new_portion;
    tail.copy_within(new_portion.., 0);
    tail[old_portion..].copy_from_slice(&chunk[chunk.len() - new_portion..]);
}

/// Wait up to `usec` microseconds for `fd_in` to become readable and
/// `fd_out` writable; either may be -1 to ignore that side.
fn is_data_ready(fd_in: RawFd, fd_out: RawFd, usec: i64) -> io::Result<(bool, bool)> {
    // SAFETY: the fd_sets and timeval are initialised before use; select
    // only reads the sets it is given and the fds are live or -1.
    unsafe {
        let mut readfds: libc::fd_set = mem::zeroed();
        let mut writefds: libc::fd_set = mem::zeroed();
        let mut exceptfds: libc::fd_set = mem::zeroed();
        libc::FD_ZERO(&mut readfds);
        libc::FD_ZERO(&mut writefds);
        libc::FD_ZERO(&mut exceptfds);

        let mut max_fd = -1;
        if fd_in >= 0 {
            libc::FD_SET(fd_in, &mut readfds);
            max_fd = max_fd.max(fd_in);
        }
        if fd_out >= 0 {
            libc::FD_SET(fd_out, &mut writefds);
            max_fd = max_fd.max(fd_out);
        }

        let mut tv = libc::timeval {
            tv_sec: (usec / 1_000_000) as libc::time_t,
            tv_usec: (usec % 1_000_000) as libc::suseconds_t,
        };

        let result = libc::select(
            max_fd + 1,
            &mut readfds,
            &mut writefds,
            &mut exceptfds,
            &mut tv,
        );
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        if result == 0 {
            return Ok((false, false));
        }
        let in_ready = fd_in >= 0 && libc::FD_ISSET(fd_in, &mut readfds);
        let out_ready = fd_out >= 0 && libc::FD_ISSET(fd_out, &mut writefds);
        Ok((in_ready, out_ready))
    }
}

/// Keep reading until the buffer is full, the input dries up, or the
/// retry budget is spent; like read() but fills as much as it can.
fn read_repeated(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let start = clock::monotonic();
    let mut total = 0;

    while total < buf.len() {
        let want = (buf.len() - total).min(MAX_READ_AT_ONCE);
        // SAFETY: the pointer/length pair addresses within the slice and
        // the return value is checked.
        let n = unsafe {
            libc::read(
                fd,
                buf[total..].as_mut_ptr() as *mut libc::c_void,
                want,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            return Ok(total);
        }
        total += n as usize;

        if (clock::monotonic() - start).as_secs_f64() > READ_RETRY_BUDGET {
            debug!("fd {}: stopping read - retry budget spent", fd);
            break;
        }

        if total < buf.len() {
            match is_data_ready(fd, -1, 0) {
                Ok((true, _)) => {}
                _ => break,
            }
        }
    }

    Ok(total)
}

/// Keep writing until the slice is flushed, the output blocks, or the
/// retry budget is spent.  EINTR/EAGAIN return what was written so far;
/// with `sync_after_write`, only an EIO from the sync is fatal.
fn write_repeated(fd: RawFd, buf: &[u8], sync_after_write: bool) -> io::Result<usize> {
    let start = clock::monotonic();
    let mut total = 0;

    while total < buf.len() {
        let want = (buf.len() - total).min(MAX_WRITE_AT_ONCE);
        // SAFETY: the pointer/length pair addresses within the slice and
        // the return value is checked.
        let n = unsafe {
            libc::write(
                fd,
                buf[total..].as_ptr() as *const libc::c_void,
                want,
            )
        };

        if sync_after_write && n >= 0 {
            sync_data(fd)?;
        }

        if n < 0 {
            let err = io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(libc::EINTR) | Some(libc::EAGAIN)) {
                // Interrupted, probably by our own alarm; hand back what
                // has been written so far.
                return Ok(total);
            }
            return Err(err);
        }

        total += n as usize;
        if n == 0 {
            return Ok(total);
        }

        if (clock::monotonic() - start).as_secs_f64() > WRITE_RETRY_BUDGET {
            debug!("fd {}: stopping write - retry budget spent", fd);
            break;
        }
    }

    Ok(total)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn sync_syscall(fd: RawFd) -> libc::c_int {
    // SAFETY: fdatasync takes no pointers.
    unsafe { libc::fdatasync(fd) }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn sync_syscall(fd: RawFd) -> libc::c_int {
    // SAFETY: fsync takes no pointers.
    unsafe { libc::fsync(fd) }
}

/// fdatasync where available, fsync elsewhere; only EIO is treated as a
/// real failure since pipes and ttys legitimately reject syncing.
fn sync_data(fd: RawFd) -> io::Result<()> {
    if sync_syscall(fd) < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EIO) {
            return Err(err);
        }
    }
    Ok(())
}

fn set_direct_io(fd: RawFd, enable: bool) {
    #[cfg(target_os = "linux")]
    // SAFETY: fcntl with F_GETFL/F_SETFL takes and returns plain flags.
    unsafe {
        let current = libc::fcntl(fd, libc::F_GETFL);
        if current < 0 {
            return;
        }
        let wanted = if enable {
            current | libc::O_DIRECT
        } else {
            current & !libc::O_DIRECT
        };
        if libc::fcntl(fd, libc::F_SETFL, wanted) != 0 {
            debug!(
                "fd {}: failed to change O_DIRECT: {}",
                fd,
                io::Error::last_os_error()
            );
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (fd, enable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_skip_schedule() {
        for errors in 1..5 {
            assert_eq!(adaptive_skip_amount(errors), 1);
        }
        for errors in 5..10 {
            assert_eq!(adaptive_skip_amount(errors), 2);
        }
        assert_eq!(adaptive_skip_amount(10), 1);
        assert_eq!(adaptive_skip_amount(15), 32);
        assert_eq!(adaptive_skip_amount(19), 512);
        assert_eq!(adaptive_skip_amount(20), 512);
        assert_eq!(adaptive_skip_amount(1000), 512);
    }

    #[test]
    fn tail_window_slides() {
        let mut tail = vec![0u8; 8];
        push_tail(&mut tail, b"abc");
        assert_eq!(&tail, b"\0\0\0\0\0abc");
        push_tail(&mut tail, b"defgh");
        assert_eq!(&tail, b"abcdefgh");
        push_tail(&mut tail, b"0123456789");
        assert_eq!(&tail, b"23456789");
    }

    #[test]
    fn readiness_on_a_pipe() {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: pipe writes two fds into the array.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_end, write_end) = (fds[0], fds[1]);

        // Empty pipe: writable, not readable.
        let (r, w) = is_data_ready(read_end, write_end, 1000).unwrap();
        assert!(!r);
        assert!(w);

        // SAFETY: writing a byte from a live buffer.
        unsafe {
            libc::write(write_end, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let (r, _) = is_data_ready(read_end, -1, 1000).unwrap();
        assert!(r);

        // SAFETY: closing fds we own.
        unsafe {
            libc::close(read_end);
            libc::close(write_end);
        }
    }

    #[test]
    fn read_and_write_repeated_roundtrip() {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: pipe writes two fds into the array.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_end, write_end) = (fds[0], fds[1]);

        let written = write_repeated(write_end, b"hello world", false).unwrap();
        assert_eq!(written, 11);

        let mut buf = [0u8; 11];
        let got = read_repeated(read_end, &mut buf).unwrap();
        assert_eq!(got, 11);
        assert_eq!(&buf, b"hello world");

        // SAFETY: closing fds we own.
        unsafe {
            libc::close(read_end);
            libc::close(write_end);
        }
    }
}
