// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Remote control and query between running instances.
//!
//! The sender writes a fixed-layout record to a control file named after
//! its own pid in `$TMPDIR`, then raises SIGUSR2 (settings overlay) or
//! SIGUSR1 (state query).  The receiver identifies the sender from the
//! signal's siginfo payload, reads the matching file, and signals back.
//! Senders wait up to 1.1 seconds for that acknowledgement.

use std::fs;
use std::io;
use std::io::Read;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::time::Duration;

use log::debug;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::clock;
use crate::config::FormatOptions;
use crate::cursor::temp_dir;
use crate::flags;
use crate::state::State;
use crate::status::ExitStatus;
use crate::sys;
use crate::terminal;

/// How long a sender waits for the receiver's acknowledgement.
const ACK_TIMEOUT: Duration = Duration::from_millis(1100);
/// Granularity of the acknowledgement wait.
const ACK_POLL: Duration = Duration::from_millis(10);

/// String fields are truncated to this many bytes plus a NUL.
const STRING_FIELD_MAX: usize = 255;

const FLAG_PROGRESS: u32 = 1 << 0;
const FLAG_TIMER: u32 = 1 << 1;
const FLAG_ETA: u32 = 1 << 2;
const FLAG_FINETA: u32 = 1 << 3;
const FLAG_RATE: u32 = 1 << 4;
const FLAG_AVERAGE_RATE: u32 = 1 << 5;
const FLAG_BYTES: u32 = 1 << 6;
const FLAG_BUFPERCENT: u32 = 1 << 7;
const FLAG_WIDTH_MANUAL: u32 = 1 << 8;
const FLAG_HEIGHT_MANUAL: u32 = 1 << 9;

/// The settings overlay a `--remote` sender transfers.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RemoteRecord {
    rate_limit: u64,
    buffer_size: u64,
    size: i64,
    interval: f64,
    lastwritten: u32,
    width: u32,
    height: u32,
    flags: u32,
    name: [u8; 256],
    format: [u8; 256],
    extra_display: [u8; 256],
}

/// The state snapshot exchanged by `--query`.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct QueryRecord {
    elapsed_seconds: f64,
    transferred: i64,
    size: i64,
    response: u8,
    _reserved: [u8; 7],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Remote,
    Query,
}

impl Purpose {
    fn as_str(self) -> &'static str {
        match self {
            Purpose::Remote => "remote",
            Purpose::Query => "query",
        }
    }
}

/// The control file a given sender uses for a given purpose.
fn control_file_path(pid: libc::pid_t, purpose: Purpose) -> PathBuf {
    temp_dir().join(format!("pipemeter.{}.{}", purpose.as_str(), pid))
}

fn pack_string(field: &mut [u8; 256], value: Option<&str>) {
    if let Some(value) = value {
        let bytes = value.as_bytes();
        let len = bytes.len().min(STRING_FIELD_MAX);
        field[..len].copy_from_slice(&bytes[..len]);
    }
}

fn unpack_string(field: &[u8; 256]) -> Option<String> {
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    if len == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&field[..len]).into_owned())
}

/// Create a sender-side control file with exclusive semantics (a stale
/// leftover from a dead process with our pid is replaced).
fn create_control_file(path: &PathBuf) -> io::Result<fs::File> {
    let _ = fs::remove_file(path);
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

fn our_pid() -> libc::pid_t {
    // SAFETY: getpid takes no arguments.
    unsafe { libc::getpid() }
}

fn signal_pid(pid: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill takes no pointers.
    if unsafe { libc::kill(pid, signal) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn build_remote_record(state: &State) -> RemoteRecord {
    let control = &state.control;
    let options = &control.format_option;

    let mut flags_word = 0u32;
    for (set, bit) in [
        (options.progress, FLAG_PROGRESS),
        (options.timer, FLAG_TIMER),
        (options.eta, FLAG_ETA),
        (options.fineta, FLAG_FINETA),
        (options.rate, FLAG_RATE),
        (options.average_rate, FLAG_AVERAGE_RATE),
        (options.bytes, FLAG_BYTES),
        (options.bufpercent, FLAG_BUFPERCENT),
        (control.width_set_manually, FLAG_WIDTH_MANUAL),
        (control.height_set_manually, FLAG_HEIGHT_MANUAL),
    ] {
        if set {
            flags_word |= bit;
        }
    }

    let mut record = RemoteRecord {
        rate_limit: control.rate_limit,
        buffer_size: control.target_buffer_size as u64,
        size: control.size,
        interval: control.interval,
        lastwritten: options.lastwritten as u32,
        width: u32::from(control.width).clamp(1, 999_999),
        height: control.height.clamp(1, 999_999),
        flags: flags_word,
        name: [0; 256],
        format: [0; 256],
        extra_display: [0; 256],
    };

    // Keep the transferred values inside the receiver's accepted range.
    if record.interval > 0.0 && record.interval < 0.1 {
        record.interval = 0.1;
    }
    if record.interval > 600.0 {
        record.interval = 600.0;
    }

    pack_string(&mut record.name, control.name.as_deref());
    pack_string(&mut record.format, control.format_string.as_deref());
    pack_string(&mut record.extra_display, control.extra_display_spec.as_deref());

    record
}

/// Apply a received settings overlay, clamping on ingest.  Zero values
/// mean "leave unchanged".
fn apply_remote_record(state: &mut State, record: &RemoteRecord) {
    let options = FormatOptions {
        progress: record.flags & FLAG_PROGRESS != 0,
        timer: record.flags & FLAG_TIMER != 0,
        eta: record.flags & FLAG_ETA != 0,
        fineta: record.flags & FLAG_FINETA != 0,
        rate: record.flags & FLAG_RATE != 0,
        average_rate: record.flags & FLAG_AVERAGE_RATE != 0,
        bytes: record.flags & FLAG_BYTES != 0,
        bufpercent: record.flags & FLAG_BUFPERCENT != 0,
        lastwritten: record.lastwritten as usize,
    };

    state.control.format_string = None;
    state.control.set_extra_display_spec(None);

    let name = unpack_string(&record.name);
    state.control.set_format(options, name.as_deref());

    if record.rate_limit > 0 {
        state.control.rate_limit = record.rate_limit;
    }
    if record.buffer_size > 0 {
        state.control.target_buffer_size = (record.buffer_size as usize).max(1);
    }
    if record.size > 0 {
        state.control.size = record.size;
    }
    if record.interval > 0.0 {
        state.control.set_interval(record.interval);
    }
    if record.width > 0 && record.flags & FLAG_WIDTH_MANUAL != 0 {
        state.control.set_width(record.width.min(999_999), true);
    }
    if record.height > 0 && record.flags & FLAG_HEIGHT_MANUAL != 0 {
        state.control.set_height(record.height.min(999_999), true);
    }
    if let Some(format) = unpack_string(&record.format) {
        state.control.format_string = Some(format);
    }
    if let Some(spec) = unpack_string(&record.extra_display) {
        state.control.set_extra_display_spec(Some(&spec));
    }
}

fn read_record<T: FromBytes + Sized>(path: &PathBuf) -> io::Result<T> {
    let mut file = fs::File::open(path)?;
    let mut buf = vec![0u8; std::mem::size_of::<T>()];
    file.read_exact(&mut buf)?;
    T::read_from_bytes(&buf).map_err(|_| io::Error::from(io::ErrorKind::InvalidData))
}

fn write_record(path: &PathBuf, bytes: &[u8]) -> io::Result<()> {
    let mut file = create_control_file(path)?;
    file.write_all(bytes)
}

/// Push our display settings onto the instance with pid `remote`
/// (`--remote PID`).  Waits for the acknowledgement signal.
pub fn send_settings(state: &State, remote: libc::pid_t) -> Result<(), ExitStatus> {
    if !sys::pid_exists(remote) {
        terminal::error_msg(&format!("{}: {}", remote, io::Error::last_os_error()));
        return Err(ExitStatus::REMOTE_OR_PID);
    }

    let record = build_remote_record(state);
    let path = control_file_path(our_pid(), Purpose::Remote);

    if let Err(err) = write_record(&path, record.as_bytes()) {
        terminal::error_msg(&err.to_string());
        return Err(ExitStatus::REMOTE_OR_PID);
    }

    // Clear any stale acknowledgement before signalling.
    let _ = flags::flags().take_usr2();
    if let Err(err) = signal_pid(remote, libc::SIGUSR2) {
        terminal::error_msg(&format!("{}: {}", remote, err));
        let _ = fs::remove_file(&path);
        return Err(ExitStatus::REMOTE_OR_PID);
    }

    debug!("settings message sent to {}", remote);

    let deadline = clock::monotonic() + ACK_TIMEOUT;
    let mut received = false;
    while clock::monotonic() < deadline && !received {
        std::thread::sleep(ACK_POLL);
        if let Some(sender) = flags::flags().take_usr2() {
            if sender == remote {
                received = true;
            }
        }
    }

    if let Err(err) = fs::remove_file(&path) {
        terminal::error_msg(&err.to_string());
    }

    if received {
        Ok(())
    } else {
        terminal::error_msg(&format!("{}: message not received", remote));
        Err(ExitStatus::REMOTE_OR_PID)
    }
}

/// Handle a pending settings overlay (SIGUSR2).  Returns true if one
/// arrived and was applied.
fn receive_settings(state: &mut State) -> bool {
    let Some(sender) = flags::flags().take_usr2() else {
        return false;
    };

    let path = control_file_path(sender, Purpose::Remote);
    let record: RemoteRecord = match read_record(&path) {
        Ok(record) => record,
        Err(err) => {
            terminal::error_msg(&format!("{}: {}", path.display(), err));
            return false;
        }
    };

    // Acknowledge receipt; the sender removes its own file.
    if let Err(err) = signal_pid(sender, libc::SIGUSR2) {
        debug!("{}: {}", sender, err);
    }

    debug!("received remote control message from {}", sender);
    apply_remote_record(state, &record);
    true
}

/// Handle a pending query-channel signal (SIGUSR1), as either side of
/// the exchange.  With a nonzero `match_sender`, signals from any other
/// pid are ignored.  Returns true if a signal was processed.
fn receive_query(state: &mut State, match_sender: libc::pid_t) -> bool {
    let Some(sender) = flags::flags().take_usr1() else {
        return false;
    };
    if match_sender != 0 && sender != match_sender {
        debug!("ignoring USR1 from {} (waiting on {})", sender, match_sender);
        return false;
    }

    // Failures here are logged quietly: a querying process dying must
    // not disturb a running display.
    let path = control_file_path(sender, Purpose::Query);
    let record: QueryRecord = match read_record(&path) {
        Ok(record) => record,
        Err(err) => {
            debug!("{}: {}", path.display(), err);
            return false;
        }
    };
    if let Err(err) = fs::remove_file(&path) {
        debug!("{}: {}", path.display(), err);
        return false;
    }

    if record.response != 0 {
        debug!(
            "query response from {}: {} / {} in {}s",
            sender, record.transferred, record.size, record.elapsed_seconds
        );
        state.transfer.elapsed_seconds = record.elapsed_seconds;
        state.transfer.transferred = record.transferred;
        state.control.size = record.size;
        return true;
    }

    // It was a query: send our state back.
    let reply = QueryRecord {
        elapsed_seconds: state.transfer.elapsed_seconds,
        transferred: state.transfer.transferred,
        size: state.control.size,
        response: 1,
        _reserved: [0; 7],
    };
    let reply_path = control_file_path(our_pid(), Purpose::Query);
    if let Err(err) = write_record(&reply_path, reply.as_bytes()) {
        debug!("{}: {}", reply_path.display(), err);
        return true;
    }
    if let Err(err) = signal_pid(sender, libc::SIGUSR1) {
        debug!("{}: {}", sender, err);
        let _ = fs::remove_file(&reply_path);
        return true;
    }

    debug!("query response sent to {}", sender);
    true
}

/// Poll both channels; returns true if a settings overlay arrived (the
/// caller may need to refresh anything derived from the format).
pub fn check(state: &mut State) -> bool {
    let received_settings = receive_settings(state);
    let _ = receive_query(state, 0);
    received_settings
}

/// Fetch the transfer state of the instance with pid `query` and merge
/// it into ours (`--query PID`).
pub fn fetch_transfer_state(
    state: &mut State,
    query: libc::pid_t,
    silent: bool,
) -> Result<(), ExitStatus> {
    let report = |message: String| {
        if !silent {
            terminal::error_msg(&message);
        }
    };

    if !sys::pid_exists(query) {
        report(format!("{}: {}", query, io::Error::last_os_error()));
        return Err(ExitStatus::REMOTE_OR_PID);
    }

    let request = QueryRecord {
        elapsed_seconds: 0.0,
        transferred: 0,
        size: 0,
        response: 0,
        _reserved: [0; 7],
    };
    let path = control_file_path(our_pid(), Purpose::Query);
    if let Err(err) = write_record(&path, request.as_bytes()) {
        report(err.to_string());
        return Err(ExitStatus::REMOTE_OR_PID);
    }

    let _ = flags::flags().take_usr1();
    if let Err(err) = signal_pid(query, libc::SIGUSR1) {
        report(format!("{}: {}", query, err));
        let _ = fs::remove_file(&path);
        return Err(ExitStatus::REMOTE_OR_PID);
    }

    debug!("query sent to {}", query);

    let deadline = clock::monotonic() + ACK_TIMEOUT;
    let mut received = false;
    while clock::monotonic() < deadline && !received && !flags::flags().exit_requested() {
        std::thread::sleep(ACK_POLL);
        if receive_query(state, query) {
            received = true;
        }
    }

    // The other side should have removed our file; clean up regardless.
    let _ = fs::remove_file(&path);

    if received {
        Ok(())
    } else {
        report(format!("{}: message not received", query));
        Err(ExitStatus::REMOTE_OR_PID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_state() -> State {
        State::new(Config::default(), Vec::new(), false)
    }

    #[test]
    fn record_sizes_are_stable() {
        assert_eq!(std::mem::size_of::<RemoteRecord>(), 816);
        assert_eq!(std::mem::size_of::<QueryRecord>(), 32);
    }

    #[test]
    fn remote_record_roundtrip() {
        let mut state = test_state();
        state.control.rate_limit = 123_456;
        state.control.set_interval(2.5);
        state.control.set_width(132, true);
        state.control.format_string = Some("%p %r".to_string());
        state.control.name = Some("sender".to_string());
        state.control.format_option.progress = true;
        state.control.format_option.rate = true;

        let record = build_remote_record(&state);
        let bytes = record.as_bytes().to_vec();
        let parsed = RemoteRecord::read_from_bytes(&bytes).unwrap();

        let mut receiver = test_state();
        apply_remote_record(&mut receiver, &parsed);
        assert_eq!(receiver.control.rate_limit, 123_456);
        assert!((receiver.control.interval - 2.5).abs() < 1e-9);
        assert_eq!(u32::from(receiver.control.width), 132);
        assert!(receiver.control.width_set_manually);
        assert_eq!(receiver.control.format_string.as_deref(), Some("%p %r"));
        assert_eq!(receiver.control.name.as_deref(), Some("sender"));
        assert!(receiver.control.format_option.progress);
    }

    #[test]
    fn ingest_clamps_interval() {
        let mut record = build_remote_record(&test_state());
        record.interval = 0.01;
        let mut receiver = test_state();
        apply_remote_record(&mut receiver, &record);
        assert!((receiver.control.interval - 0.1).abs() < 1e-9);

        record.interval = 999.0;
        apply_remote_record(&mut receiver, &record);
        assert!((receiver.control.interval - 600.0).abs() < 1e-9);
    }

    #[test]
    fn zero_values_leave_settings_alone() {
        let mut receiver = test_state();
        receiver.control.rate_limit = 777;
        receiver.control.size = 888;
        let record = RemoteRecord {
            rate_limit: 0,
            buffer_size: 0,
            size: 0,
            interval: 0.0,
            lastwritten: 0,
            width: 0,
            height: 0,
            flags: 0,
            name: [0; 256],
            format: [0; 256],
            extra_display: [0; 256],
        };
        apply_remote_record(&mut receiver, &record);
        assert_eq!(receiver.control.rate_limit, 777);
        assert_eq!(receiver.control.size, 888);
    }

    #[test]
    fn string_fields_truncate_at_255() {
        let mut field = [0u8; 256];
        let long = "x".repeat(400);
        pack_string(&mut field, Some(&long));
        assert_eq!(field[255], 0);
        let back = unpack_string(&field).unwrap();
        assert_eq!(back.len(), 255);
    }

    #[test]
    fn query_record_roundtrip() {
        let record = QueryRecord {
            elapsed_seconds: 12.5,
            transferred: 1024,
            size: 4096,
            response: 1,
            _reserved: [0; 7],
        };
        let bytes = record.as_bytes().to_vec();
        let parsed = QueryRecord::read_from_bytes(&bytes).unwrap();
        assert_eq!(parsed.transferred, 1024);
        assert_eq!(parsed.size, 4096);
        assert_eq!(parsed.response, 1);
        assert!((parsed.elapsed_seconds - 12.5).abs() < 1e-9);
    }

    #[test]
    fn control_file_paths_are_per_pid_and_purpose() {
        let a = control_file_path(100, Purpose::Remote);
        let b = control_file_path(100, Purpose::Query);
        let c = control_file_path(200, Purpose::Remote);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
