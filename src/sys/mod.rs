// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Platform-specific plumbing: the zero-copy fast path, pipe occupancy
//! queries, and discovery of another process's open file descriptors.

use std::io;
use std::path::PathBuf;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod linux;
        use linux as platform;
    } else if #[cfg(any(target_os = "macos", target_os = "ios"))] {
        pub mod mach;
        use mach as platform;
    } else {
        pub mod fallback;
        use fallback as platform;
    }
}

/// What a watched file descriptor points at, as far as we can tell.
#[derive(Debug, Clone, Default)]
pub struct FdDescription {
    /// Path of the open file.
    pub path: PathBuf,
    /// Device and inode of the target, for change detection.
    pub dev: u64,
    pub ino: u64,
    /// File type and permission bits of the target.
    pub mode: u32,
    /// Mode bits of the descriptor entry itself (owner-write indicates
    /// the fd was opened for writing, making its size meaningless).
    pub entry_mode: u32,
    /// Size of the target, where determinable; st_size for regular files.
    pub size: i64,
}

impl FdDescription {
    /// True if the target is a regular file.
    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFREG as u32
    }

    /// True if the target is a block device.
    pub fn is_block_device(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFBLK as u32
    }
}

/// Move up to `len` bytes from `fd_in` straight to `fd_out` without
/// passing through userspace.  Unsupported platforms report EINVAL, which
/// callers treat as "disable the fast path for this fd".
pub fn splice(fd_in: libc::c_int, fd_out: libc::c_int, len: usize) -> io::Result<usize> {
    platform::splice(fd_in, fd_out, len)
}

/// How many bytes are sitting in the pipe's kernel buffer, written but
/// not yet read by the consumer.
pub fn pipe_unread_bytes(fd: libc::c_int) -> io::Result<usize> {
    platform::pipe_unread_bytes(fd)
}

/// List the numeric file descriptors currently open in another process.
pub fn list_pid_fds(pid: libc::pid_t) -> io::Result<Vec<libc::c_int>> {
    platform::list_pid_fds(pid)
}

/// Describe one file descriptor of another process.
pub fn describe_fd(pid: libc::pid_t, fd: libc::c_int) -> io::Result<FdDescription> {
    platform::describe_fd(pid, fd)
}

/// Read the current file position of another process's descriptor.
pub fn read_fd_position(pid: libc::pid_t, fd: libc::c_int) -> io::Result<i64> {
    platform::read_fd_position(pid, fd)
}

/// The pid recorded in a siginfo payload.
pub fn siginfo_pid(info: *const libc::siginfo_t) -> libc::pid_t {
    platform::siginfo_pid(info)
}

/// True if a process with the given pid exists and is signallable.
pub fn pid_exists(pid: libc::pid_t) -> bool {
    // SAFETY: signal 0 performs only the existence/permission check.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn own_pid_exists() {
        // SAFETY: getpid takes no arguments.
        let pid = unsafe { libc::getpid() };
        assert!(pid_exists(pid));
        assert!(!pid_exists(-1));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_fds_are_listed() {
        let file = std::fs::File::open("/proc/self/stat").unwrap();
        // SAFETY: getpid takes no arguments.
        let pid = unsafe { libc::getpid() };
        let fds = list_pid_fds(pid).unwrap();
        assert!(fds.contains(&file.as_raw_fd()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn describe_regular_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        tmp.write_all(&[0u8; 1000]).unwrap();
        tmp.flush().unwrap();
        let file = std::fs::File::open(tmp.path()).unwrap();
        // SAFETY: getpid takes no arguments.
        let pid = unsafe { libc::getpid() };
        let desc = describe_fd(pid, file.as_raw_fd()).unwrap();
        assert!(desc.is_regular());
        assert_eq!(desc.size, 1000);
        let pos = read_fd_position(pid, file.as_raw_fd()).unwrap();
        assert_eq!(pos, 0);
    }
}
