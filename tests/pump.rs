// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end pump tests through real file descriptors.

use std::io::Read;
use std::os::unix::io::FromRawFd;

use pipemeter::config::Config;
use pipemeter::display;
use pipemeter::input;
use pipemeter::mainloop;
use pipemeter::state::State;

fn make_pipe() -> (libc::c_int, libc::c_int) {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: pipe writes two fds into the array.
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

#[test]
fn file_to_pipe_copy_is_exact() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let payload: Vec<u8> = (0..1_048_576u32).map(|v| (v % 253) as u8).collect();
    std::fs::write(&src, &payload).unwrap();

    let (read_end, write_end) = make_pipe();

    // Consume the pipe on a second thread so the pump never deadlocks.
    let consumer = std::thread::spawn(move || {
        // SAFETY: the read end is owned by this thread from here on.
        let mut reader = unsafe { std::fs::File::from_raw_fd(read_end) };
        let mut collected = Vec::new();
        reader.read_to_end(&mut collected).unwrap();
        collected
    });

    let control = Config {
        no_display: true,
        size: payload.len() as i64,
        output_fd: write_end,
        output_name: "(pipe)".to_string(),
        ..Default::default()
    };
    let mut state = State::new(control, vec![src.to_string_lossy().into_owned()], false);
    let exit = mainloop::main_loop(&mut state);
    assert!(exit.is_success(), "exit {:?}", exit);

    // Close the write end so the consumer sees EOF.
    // SAFETY: closing the fd we own.
    unsafe {
        libc::close(write_end);
    }
    let collected = consumer.join().unwrap();
    assert_eq!(collected.len(), payload.len());
    assert_eq!(collected, payload);

    // Everything written, everything consumed.
    assert_eq!(state.transfer.total_written, payload.len() as i64);
    assert_eq!(state.transfer.transferred, payload.len() as i64);
}

#[test]
fn line_mode_through_pipe_counts_lines() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    std::fs::write(&src, "hello\n".repeat(10)).unwrap();

    let (read_end, write_end) = make_pipe();
    let consumer = std::thread::spawn(move || {
        // SAFETY: the read end is owned by this thread from here on.
        let mut reader = unsafe { std::fs::File::from_raw_fd(read_end) };
        let mut collected = Vec::new();
        reader.read_to_end(&mut collected).unwrap();
        collected
    });

    let control = Config {
        no_display: true,
        linemode: true,
        output_fd: write_end,
        output_name: "(pipe)".to_string(),
        ..Default::default()
    };
    let mut state = State::new(control, vec![src.to_string_lossy().into_owned()], false);
    let exit = mainloop::main_loop(&mut state);
    assert!(exit.is_success());

    // SAFETY: closing the fd we own.
    unsafe {
        libc::close(write_end);
    }
    let collected = consumer.join().unwrap();
    assert_eq!(collected.len(), 60);
    assert_eq!(state.transfer.total_written, 10);
    assert_eq!(state.transfer.transferred, 10);
}

#[test]
fn null_terminated_line_mode() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    std::fs::write(&src, b"one\0two\0three\0").unwrap();

    let mut control = Config {
        no_display: true,
        linemode: true,
        null_terminated_lines: true,
        ..Default::default()
    };
    let transfer = pipemeter::transfer::TransferState::default();
    input::set_output(&mut control, &transfer, Some(dst.to_string_lossy().as_ref())).unwrap();

    let mut state = State::new(control, vec![src.to_string_lossy().into_owned()], false);
    let exit = mainloop::main_loop(&mut state);
    assert!(exit.is_success());
    assert_eq!(state.transfer.total_written, 3);
    input::close_output(&mut state.control, &state.transfer);
    assert_eq!(std::fs::read(&dst).unwrap(), b"one\0two\0three\0");
}

#[test]
fn numeric_mode_emits_only_numeric_characters() {
    let mut control = Config {
        numeric: true,
        width: 80,
        size: 1000,
        ..Default::default()
    };
    control.set_format(
        pipemeter::config::FormatOptions {
            timer: true,
            bytes: true,
            rate: true,
            ..Default::default()
        },
        None,
    );

    let mut state = State::new(control, Vec::new(), false);
    state.status.checked_colour_support = true;
    state.transfer.elapsed_seconds = 1.25;
    state.transfer.transferred = 512;
    state.calc.transfer_rate = 409.6;

    let mut calc = state.calc.clone();
    let ok = display::format(
        &mut state.display,
        &mut state.status,
        &state.control,
        &state.transfer,
        &mut calc,
        Some(&state.control.default_format.clone()),
        true,
        false,
    );
    assert!(ok);

    // Order: timer, bytes, rate; content: digits, space, dot, sign only.
    let line = state.display.buffer.clone();
    let fields: Vec<&str> = line.split_whitespace().collect();
    assert_eq!(fields.len(), 3, "line {:?}", line);
    assert!(fields[0].starts_with("1.25"), "line {:?}", line);
    assert_eq!(fields[1], "512");
    assert!(
        line.chars()
            .all(|c| c.is_ascii_digit() || c == ' ' || c == '.' || c == '-'),
        "line {:?}",
        line
    );
}

#[test]
fn progress_line_matches_remote_format_shape() {
    // The shape a remote sender expects after switching a receiver to
    // "%p %r": percentage, bar in brackets, then the rate.
    let mut control = Config {
        width: 60,
        size: 100,
        format_string: Some("%p %r".to_string()),
        ..Default::default()
    };
    control.set_interval(0.1);

    let mut state = State::new(control, Vec::new(), false);
    state.status.checked_colour_support = true;
    state.transfer.transferred = 42;
    state.transfer.elapsed_seconds = 1.0;

    let mut calc = state.calc.clone();
    calc.percentage = 42.0;
    let ok = display::format(
        &mut state.display,
        &mut state.status,
        &state.control,
        &state.transfer,
        &mut calc,
        state.control.format_string.clone().as_deref(),
        true,
        false,
    );
    assert!(ok);
    let line = &state.display.buffer;
    assert!(line.contains('['), "line {:?}", line);
    assert!(line.contains(']'), "line {:?}", line);
    assert!(line.contains("42%"), "line {:?}", line);
}
