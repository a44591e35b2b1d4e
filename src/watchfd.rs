// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Watching another process's file descriptors: periodically discover
//! the fds a pid has open, track each one's position, and render a
//! multi-line dashboard, one line per live fd.

use std::time::Duration;

use log::debug;

use crate::calc::CalcState;
use crate::clock;
use crate::display;
use crate::display::DisplayState;
use crate::flags;
use crate::mainloop;
use crate::remote;
use crate::state::State;
use crate::status::ExitStatus;
use crate::sys;
use crate::sys::FdDescription;
use crate::terminal;
use crate::transfer::TransferState;

/// Pause between checks while waiting for the next display interval.
const WAIT_PAUSE: Duration = Duration::from_millis(50);

/// One watched `pid[:fd]` command-line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchTarget {
    pub pid: libc::pid_t,
    /// A specific fd, or -1 for all of the pid's fds.
    pub fd: libc::c_int,
}

/// Tracking state for one discovered file descriptor.
struct WatchedFd {
    pid: libc::pid_t,
    fd: libc::c_int,
    description: FdDescription,
    display_name: String,
    size: i64,
    position: i64,
    start_time: Duration,
    end_time: Duration,
    /// Global stoppage total when this fd was discovered; only stoppage
    /// beyond this counts against the fd's elapsed time.
    stoppage_base: Duration,
    closed: bool,
    displayable: bool,
    reparse: bool,
    transfer: TransferState,
    calc: CalcState,
    display: DisplayState,
}

struct WatchedItem {
    target: WatchTarget,
    fds: Vec<WatchedFd>,
    finished: bool,
}

/// True if the format string contains a `%N` or `%{name}` sequence.
fn format_contains_name(format: &str) -> bool {
    let bytes = format.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] != b'%' {
            pos += 1;
            continue;
        }
        pos += 1;
        if pos >= bytes.len() {
            return false;
        }
        if bytes[pos] == b'N' {
            return true;
        }
        if bytes[pos] == b'%' {
            pos += 1;
            continue;
        }
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos >= bytes.len() || bytes[pos] != b'{' {
            continue;
        }
        if format[pos..].starts_with("{name}") {
            return true;
        }
    }
    false
}

/// Make sure the format used for watching starts with `%N ` when more
/// than a single specific fd is on display.
fn update_format_string(state: &mut State, targets: &[WatchTarget]) {
    if targets.is_empty() {
        return;
    }

    let needs_name = targets.len() > 1 || targets[0].fd == -1;
    let current = state.control.effective_format().to_string();
    if current.is_empty() {
        return;
    }

    if needs_name && !format_contains_name(&current) {
        state.control.format_string = Some(format!("%N {}", current));
    } else if state.control.format_string.is_none() {
        state.control.format_string = Some(current);
    }
}

/// Determine the size of the file behind a descriptor: regular files
/// report it directly, block devices are measured by seeking to the end.
fn target_size(description: &FdDescription) -> i64 {
    if description.is_block_device() {
        let Ok(c_path) =
            std::ffi::CString::new(description.path.to_string_lossy().as_bytes())
        else {
            return 0;
        };
        // SAFETY: open takes a valid C string; lseek takes no pointers;
        // the fd is closed on every path.
        unsafe {
            let fd = libc::open(c_path.as_ptr(), libc::O_RDONLY);
            if fd < 0 {
                return 0;
            }
            // Re-check the type before seeking, in case the path moved.
            let mut sb: libc::stat = std::mem::zeroed();
            let mut size = 0;
            if libc::fstat(fd, &mut sb) == 0 && sb.st_mode & libc::S_IFMT == libc::S_IFBLK {
                size = libc::lseek(fd, 0, libc::SEEK_END).max(0);
            }
            libc::close(fd);
            size as i64
        }
    } else {
        description.size
    }
}

/// Compress a path to fit the watch display: the cwd prefix is dropped
/// and the middle elided with `...` to fit half the screen width.
fn set_display_name(entry: &mut WatchedFd, cwd: &str, width: u16, multiple_pids: bool) {
    let full_path = entry.description.path.to_string_lossy().into_owned();
    let mut path = full_path.as_str();
    if !cwd.is_empty() && path.len() > cwd.len() && path.starts_with(cwd) {
        path = &path[cwd.len() + 1..];
    }

    let mut max_length = (usize::from(width) / 2).saturating_sub(6) as i64;
    if multiple_pids {
        max_length -= 9;
    }

    let shown = if max_length >= path.len() as i64 {
        path.to_string()
    } else {
        let max_length = max_length.max(8) as usize;
        let prefix_length = max_length / 4;
        let suffix_length = max_length - prefix_length - 3;
        format!(
            "{}...{}",
            &path[..prefix_length],
            &path[path.len() - suffix_length..]
        )
    };

    entry.display_name = if multiple_pids {
        format!("{:8}:{:4}:{}", entry.pid, entry.fd, shown)
    } else {
        format!("{:4}:{}", entry.fd, shown)
    };
}

/// True once the descriptor points somewhere else than when discovered.
fn fd_changed(entry: &WatchedFd) -> bool {
    match sys::describe_fd(entry.pid, entry.fd) {
        Ok(now) => {
            now.dev != entry.description.dev
                || now.ino != entry.description.ino
                || now.entry_mode != entry.description.entry_mode
        }
        Err(_) => true,
    }
}

/// Current position of the descriptor, or None once it is gone.
fn fd_position(entry: &WatchedFd) -> Option<i64> {
    if fd_changed(entry) {
        return None;
    }
    sys::read_fd_position(entry.pid, entry.fd).ok()
}

/// Scan one watched item for file descriptors not yet tracked.
/// Returns false when the process can no longer be read.
fn scan_fds(state: &State, item: &mut WatchedItem) -> bool {
    let fds = if item.target.fd >= 0 {
        vec![item.target.fd]
    } else {
        match sys::list_pid_fds(item.target.pid) {
            Ok(fds) => fds,
            Err(_) => return false,
        }
    };

    for fd in fds {
        // Known fds stay; known-but-closed slots are reclaimed so the fd
        // number can be watched afresh.
        let mut already_known = false;
        item.fds.retain(|entry| {
            if entry.fd != fd {
                return true;
            }
            if entry.closed {
                false
            } else {
                already_known = true;
                true
            }
        });
        if already_known {
            continue;
        }

        let description = match sys::describe_fd(item.target.pid, fd) {
            Ok(description) => description,
            Err(err) => {
                debug!("pid {} fd {}: {}", item.target.pid, fd, err);
                continue;
            }
        };

        let displayable = description.is_regular() || description.is_block_device();

        let mut entry = WatchedFd {
            pid: item.target.pid,
            fd,
            size: target_size(&description),
            description,
            display_name: String::new(),
            position: 0,
            start_time: clock::monotonic(),
            end_time: Duration::ZERO,
            stoppage_base: flags::flags().total_stoppage(),
            closed: false,
            displayable,
            reparse: true,
            transfer: TransferState::default(),
            calc: CalcState::default(),
            display: DisplayState::default(),
        };
        entry.calc.set_history_length(state.control.history_length());

        if displayable {
            if let Some(position) = fd_position(&entry) {
                entry.display.initial_offset = position;
                entry.position = position;
            }
        }

        debug!("pid {}: tracking new fd {}", item.target.pid, fd);
        item.fds.push(entry);
    }

    item.fds.sort_by_key(|entry| entry.fd);
    true
}

/// Watch the progress of the given pid/fd items until all of them have
/// finished, rendering one line per live fd.
pub fn watch_loop(state: &mut State, targets: &[WatchTarget]) -> ExitStatus {
    if targets.is_empty() {
        return state.status.exit;
    }

    let multiple_pids = targets.windows(2).any(|pair| pair[0].pid != pair[1].pid);

    state.control.name = None;
    update_format_string(state, targets);

    let mut items: Vec<WatchedItem> = targets
        .iter()
        .map(|&target| WatchedItem {
            target,
            fds: Vec::new(),
            finished: false,
        })
        .collect();

    // Initial population; missing pids and unusable fds are errors.
    for item in &mut items {
        if !sys::pid_exists(item.target.pid) {
            terminal::error_msg(&format!(
                "pid {}: {}",
                item.target.pid,
                std::io::Error::last_os_error()
            ));
            state.status.exit.add(ExitStatus::ACCESS);
            item.finished = true;
            continue;
        }

        if !scan_fds(state, item) {
            terminal::error_msg(&format!(
                "pid {}: {}",
                item.target.pid,
                std::io::Error::last_os_error()
            ));
            state.status.exit.add(ExitStatus::ACCESS);
            item.finished = true;
            continue;
        }

        if item.target.fd >= 0 {
            match item.fds.first() {
                None => {
                    terminal::error_msg(&format!(
                        "pid {}: fd {}: not found",
                        item.target.pid, item.target.fd
                    ));
                    state.status.exit.add(ExitStatus::ACCESS);
                    item.finished = true;
                }
                Some(entry) if !entry.displayable => {
                    state.status.exit.add(ExitStatus::ACCESS);
                    item.finished = true;
                }
                Some(_) => {}
            }
        }
    }

    if items.iter().all(|item| item.finished) {
        return state.status.exit;
    }

    let mut cur_time = clock::monotonic();
    let mut next_remotecheck = cur_time;
    let mut next_update = cur_time + clock::duration_from_secs(state.control.interval);
    let mut prev_displayed_lines: usize = 0;

    loop {
        if cur_time > next_remotecheck {
            if remote::check(state) {
                // New settings: make sure %N survives, and reparse every
                // line's format.
                update_format_string(state, targets);
                for item in &mut items {
                    for entry in &mut item.fds {
                        entry.reparse = true;
                    }
                }
            }
            next_remotecheck += mainloop::REMOTE_CHECK_INTERVAL;
        }

        if flags::flags().exit_requested() {
            break;
        }

        cur_time = clock::monotonic();

        if cur_time < next_update {
            std::thread::sleep(WAIT_PAUSE);
            continue;
        }
        next_update += clock::duration_from_secs(state.control.interval);
        if next_update < cur_time {
            next_update = cur_time;
        }

        let terminal_resized = mainloop::resize_on_signal(&mut state.control);

        let mut displayed_lines: usize = 0;

        for item in &mut items {
            if item.finished {
                continue;
            }

            if item.target.fd == -1 {
                // A whole-pid watch rescans for new fds every tick.
                if !scan_fds(state, item) {
                    item.finished = true;
                }
            } else {
                let gone = item
                    .fds
                    .first()
                    .map_or(true, |entry| !entry.displayable);
                if gone {
                    item.finished = true;
                    continue;
                }
            }

            let interval = state.control.interval;
            let mut removals: Vec<libc::c_int> = Vec::new();

            for entry in &mut item.fds {
                if displayed_lines >= state.control.height as usize {
                    break;
                }

                if !entry.displayable {
                    // Not displayable: drop it once its target changes.
                    if fd_changed(entry) {
                        removals.push(entry.fd);
                    }
                    continue;
                }

                let mut position_now = None;
                if entry.closed {
                    // Keep closed entries on screen for one interval so
                    // the final state remains visible.
                    let since_closed = cur_time.saturating_sub(entry.end_time);
                    if since_closed.as_secs_f64() > interval {
                        removals.push(entry.fd);
                        continue;
                    }
                } else {
                    position_now = fd_position(entry);
                    if position_now.is_none() {
                        debug!("fd {}: marking as closed", entry.fd);
                        entry.end_time = cur_time;
                        entry.closed = true;
                    }
                }

                if let Some(position) = position_now {
                    entry.position = position;
                    let stoppage = flags::flags()
                        .total_stoppage()
                        .saturating_sub(entry.stoppage_base);
                    entry.transfer.elapsed_seconds =
                        clock::elapsed_transfer_seconds(entry.start_time, cur_time, stoppage);
                }

                if displayed_lines > 0 {
                    terminal::tty_write(flags::flags(), b"\n");
                }

                if terminal_resized || entry.display_name.is_empty() {
                    set_display_name(
                        entry,
                        &state.status.cwd,
                        state.control.width,
                        multiple_pids,
                    );
                    entry.reparse = true;
                }

                if entry.reparse {
                    flags::flags()
                        .reparse_display
                        .store(true, std::sync::atomic::Ordering::SeqCst);
                    entry.reparse = false;
                }

                entry.transfer.transferred = entry.position;
                entry.transfer.total_written = entry.position;

                // Borrow the shared control block with this entry's name
                // and size for the duration of the render.
                let saved_name = state.control.name.take();
                let saved_size = state.control.size;
                state.control.name = Some(entry.display_name.clone());
                state.control.size = entry.size;

                display::show(
                    &mut entry.display,
                    None,
                    &mut state.status,
                    &state.control,
                    &entry.transfer,
                    &mut entry.calc,
                    &mut state.cursor,
                    false,
                );

                state.control.name = saved_name;
                state.control.size = saved_size;

                displayed_lines += 1;
            }

            item.fds.retain(|entry| !removals.contains(&entry.fd));

            if item.target.fd >= 0 && item.fds.is_empty() {
                item.finished = true;
            }
        }

        // Blank out lines the previous tick used but this one does not.
        let mut blank_lines = prev_displayed_lines.saturating_sub(displayed_lines);
        prev_displayed_lines = displayed_lines;
        let mut cursor_lines = displayed_lines;
        while blank_lines > 0 {
            if cursor_lines > 0 {
                terminal::tty_write(flags::flags(), b"\n");
            }
            let spaces = vec![b' '; usize::from(state.control.width)];
            terminal::tty_write(flags::flags(), &spaces);
            terminal::tty_write(flags::flags(), b"\r");
            blank_lines -= 1;
            cursor_lines += 1;
        }

        // Move back up so the next tick overwrites in place.
        while cursor_lines > 1 {
            terminal::tty_write(flags::flags(), b"\x1b[A");
            cursor_lines -= 1;
        }

        if items.iter().all(|item| item.finished) {
            break;
        }
    }

    if !state.control.numeric {
        // Leave the last dashboard on screen rather than letting the
        // shell prompt overwrite it.
        for _ in 0..prev_displayed_lines {
            terminal::tty_write(flags::flags(), b"\n");
        }
    }

    if flags::flags().exit_requested() {
        state.status.exit.add(ExitStatus::SIGNAL);
    }

    state.status.exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn format_name_detection() {
        assert!(format_contains_name("%N %b"));
        assert!(format_contains_name("%{name} %b"));
        assert!(format_contains_name("%30{name}"));
        assert!(!format_contains_name("%b %t"));
        assert!(!format_contains_name("100%% %b"));
    }

    #[test]
    fn name_prefix_added_for_whole_pid_watch() {
        let mut state = State::new(
            Config {
                default_format: "%b %t".to_string(),
                ..Default::default()
            },
            Vec::new(),
            false,
        );
        update_format_string(&mut state, &[WatchTarget { pid: 1, fd: -1 }]);
        assert_eq!(state.control.format_string.as_deref(), Some("%N %b %t"));
    }

    #[test]
    fn name_prefix_not_duplicated() {
        let mut state = State::new(
            Config {
                format_string: Some("%N %b".to_string()),
                ..Default::default()
            },
            Vec::new(),
            false,
        );
        update_format_string(&mut state, &[WatchTarget { pid: 1, fd: -1 }]);
        assert_eq!(state.control.format_string.as_deref(), Some("%N %b"));
    }

    #[test]
    fn single_fd_watch_keeps_format() {
        let mut state = State::new(
            Config {
                default_format: "%b".to_string(),
                ..Default::default()
            },
            Vec::new(),
            false,
        );
        update_format_string(&mut state, &[WatchTarget { pid: 1, fd: 3 }]);
        assert_eq!(state.control.format_string.as_deref(), Some("%b"));
    }

    #[test]
    fn display_name_elides_long_paths() {
        let mut entry = WatchedFd {
            pid: 1234,
            fd: 3,
            description: FdDescription {
                path: std::path::PathBuf::from(
                    "/very/long/path/that/does/not/fit/into/half/the/screen/width/file.dat",
                ),
                ..Default::default()
            },
            display_name: String::new(),
            size: 0,
            position: 0,
            start_time: Duration::ZERO,
            end_time: Duration::ZERO,
            stoppage_base: Duration::ZERO,
            closed: false,
            displayable: true,
            reparse: false,
            transfer: TransferState::default(),
            calc: CalcState::default(),
            display: DisplayState::default(),
        };

        set_display_name(&mut entry, "", 60, false);
        assert!(entry.display_name.contains("..."), "{}", entry.display_name);
        assert!(entry.display_name.starts_with("   3:"));

        set_display_name(&mut entry, "", 400, true);
        assert!(!entry.display_name.contains("..."));
        assert!(entry.display_name.starts_with("    1234:   3:"));
    }

    #[test]
    fn display_name_strips_cwd() {
        let mut entry = WatchedFd {
            pid: 1,
            fd: 5,
            description: FdDescription {
                path: std::path::PathBuf::from("/home/user/work/file.dat"),
                ..Default::default()
            },
            display_name: String::new(),
            size: 0,
            position: 0,
            start_time: Duration::ZERO,
            end_time: Duration::ZERO,
            stoppage_base: Duration::ZERO,
            closed: false,
            displayable: true,
            reparse: false,
            transfer: TransferState::default(),
            calc: CalcState::default(),
            display: DisplayState::default(),
        };
        set_display_name(&mut entry, "/home/user/work", 200, false);
        assert_eq!(entry.display_name, "   5:file.dat");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn scan_finds_own_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watched");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();
        let file = std::fs::File::open(&path).unwrap();
        use std::os::unix::io::AsRawFd;

        let state = State::new(Config::default(), Vec::new(), false);
        // SAFETY: getpid takes no arguments.
        let pid = unsafe { libc::getpid() };
        let mut item = WatchedItem {
            target: WatchTarget {
                pid,
                fd: file.as_raw_fd(),
            },
            fds: Vec::new(),
            finished: false,
        };
        assert!(scan_fds(&state, &mut item));
        assert_eq!(item.fds.len(), 1);
        let entry = &item.fds[0];
        assert!(entry.displayable);
        assert_eq!(entry.size, 4096);
        assert_eq!(fd_position(entry), Some(0));
    }
}
