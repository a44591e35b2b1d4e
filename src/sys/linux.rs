// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Linux implementations: splice(2), FIONREAD, and `/proc`-based file
//! descriptor discovery.

use std::fs;
use std::io;
use std::io::BufRead;
use std::mem;
use std::path::PathBuf;

use super::FdDescription;

pub fn splice(fd_in: libc::c_int, fd_out: libc::c_int, len: usize) -> io::Result<usize> {
    // SAFETY: null offset pointers mean both fds use their own file
    // positions; the return value is checked.
    let n = unsafe {
        libc::splice(
            fd_in,
            std::ptr::null_mut(),
            fd_out,
            std::ptr::null_mut(),
            len,
            libc::SPLICE_F_MORE,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
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

pub fn list_pid_fds(pid: libc::pid_t) -> io::Result<Vec<libc::c_int>> {
    let mut fds = Vec::new();
    for entry in fs::read_dir(format!("/proc/{}/fd", pid))? {
        let entry = entry?;
        if let Ok(fd) = entry.file_name().to_string_lossy().parse::<libc::c_int>() {
            if fd >= 0 {
                fds.push(fd);
            }
        }
    }
    Ok(fds)
}

pub fn describe_fd(pid: libc::pid_t, fd: libc::c_int) -> io::Result<FdDescription> {
    let fd_link = format!("/proc/{}/fd/{}", pid, fd);
    let path = PathBuf::from(fs::read_link(&fd_link)?);

    // stat() follows the symlink to the target; lstat() describes the
    // descriptor entry itself, whose owner-write bit tells us whether the
    // fd was opened for writing.
    let link_c = std::ffi::CString::new(fd_link).map_err(|_| io::ErrorKind::InvalidInput)?;
    // SAFETY: the stat structs are zeroed and only written by the calls,
    // whose return values are checked.
    let (target, entry) = unsafe {
        let mut target: libc::stat = mem::zeroed();
        if libc::stat(link_c.as_ptr(), &mut target) != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut entry: libc::stat = mem::zeroed();
        if libc::lstat(link_c.as_ptr(), &mut entry) != 0 {
            return Err(io::Error::last_os_error());
        }
        (target, entry)
    };

    let mut desc = FdDescription {
        path,
        dev: target.st_dev as u64,
        ino: target.st_ino as u64,
        mode: target.st_mode as u32,
        entry_mode: entry.st_mode as u32,
        size: 0,
    };
    if desc.is_regular() && desc.entry_mode & libc::S_IWUSR as u32 == 0 {
        desc.size = target.st_size as i64;
    }
    Ok(desc)
}

pub fn read_fd_position(pid: libc::pid_t, fd: libc::c_int) -> io::Result<i64> {
    let file = fs::File::open(format!("/proc/{}/fdinfo/{}", pid, fd))?;
    for line in io::BufReader::new(file).lines() {
        let line = line?;
        if let Some(value) = line.strip_prefix("pos:") {
            return value
                .trim()
                .parse::<i64>()
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidData));
        }
    }
    Err(io::Error::from(io::ErrorKind::NotFound))
}

pub fn siginfo_pid(info: *const libc::siginfo_t) -> libc::pid_t {
    if info.is_null() {
        return 0;
    }
    // SAFETY: the caller obtained the pointer from an SA_SIGINFO handler,
    // where the kernel guarantees a valid siginfo record.
    unsafe { (*info).si_pid() }
}
