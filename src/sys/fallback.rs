// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stubs for platforms without a zero-copy path or fd discovery.

use std::io;

use super::FdDescription;

pub fn splice(_fd_in: libc::c_int, _fd_out: libc::c_int, _len: usize) -> io::Result<usize> {
    Err(io::Error::from_raw_os_error(libc::EINVAL))
}

pub fn pipe_unread_bytes(fd: libc::c_int) -> io::Result<usize> {
    let mut count: libc::c_int = 0;
    // SAFETY: FIONREAD writes a single int; the return value is checked.
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut count) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(count.max(0) as usize)
}

pub fn list_pid_fds(_pid: libc::pid_t) -> io::Result<Vec<libc::c_int>> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

pub fn describe_fd(_pid: libc::pid_t, _fd: libc::c_int) -> io::Result<FdDescription> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

pub fn read_fd_position(_pid: libc::pid_t, _fd: libc::c_int) -> io::Result<i64> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

pub fn siginfo_pid(_info: *const libc::siginfo_t) -> libc::pid_t {
    0
}
