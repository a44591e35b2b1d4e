// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Input and output file handling: lazy opening of the input list,
//! output (re)targeting, and total-size calculation.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;

use log::debug;

use crate::config::Config;
use crate::config::DEFAULT_BUFFER_SIZE;
use crate::config::MAX_AUTO_BUFFER_SIZE;
use crate::status::ExitStatus;
use crate::status::ProgramStatus;
use crate::terminal;
use crate::transfer::TransferState;

/// The name to report for the input at `index`.
pub fn input_name(files: &[String], index: usize) -> &str {
    match files.get(index).map(|s| s.as_str()) {
        Some("-") | None => "(stdin)",
        Some(name) => name,
    }
}

fn stat_path(path: &str) -> io::Result<libc::stat> {
    let c_path = CString::new(path).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    // SAFETY: the stat struct is zeroed and only written by the call,
    // whose return value is checked.
    unsafe {
        let mut sb: libc::stat = std::mem::zeroed();
        if libc::stat(c_path.as_ptr(), &mut sb) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sb)
    }
}

/// Open the input at `index`, closing `previous_fd` first (stdin is
/// never closed).  Returns the new fd, or None after reporting an error
/// and recording the access bit.
pub fn next_file(
    status: &mut ProgramStatus,
    files: &[String],
    index: usize,
    previous_fd: RawFd,
) -> Option<RawFd> {
    if previous_fd >= 0 && previous_fd != libc::STDIN_FILENO {
        // SAFETY: closing an fd we own.
        unsafe {
            libc::close(previous_fd);
        }
    }

    let path = files.get(index)?;

    let fd = if path == "-" {
        libc::STDIN_FILENO
    } else {
        let c_path = match CString::new(path.as_str()) {
            Ok(p) => p,
            Err(_) => {
                terminal::error_msg(&format!("{}: invalid file name", path));
                status.exit.add(ExitStatus::ACCESS);
                return None;
            }
        };
        // SAFETY: open takes a valid C string; the result is checked.
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY) };
        if fd < 0 {
            terminal::error_msg(&format!(
                "{}: failed to open: {}",
                path,
                io::Error::last_os_error()
            ));
            status.exit.add(ExitStatus::ACCESS);
            return None;
        }
        // Reading a directory would only ever produce garbage.
        // SAFETY: fstat writes only into the zeroed stat struct.
        let is_dir = unsafe {
            let mut sb: libc::stat = std::mem::zeroed();
            libc::fstat(fd, &mut sb) == 0 && sb.st_mode & libc::S_IFMT == libc::S_IFDIR
        };
        if is_dir {
            terminal::error_msg(&format!("{}: is a directory", path));
            status.exit.add(ExitStatus::ACCESS);
            // SAFETY: closing the fd we just opened.
            unsafe {
                libc::close(fd);
            }
            return None;
        }
        fd
    };

    status.current_input = Some(index);
    Some(fd)
}

/// Advise the kernel that the input will be read sequentially.
pub fn advise_sequential(fd: RawFd) {
    #[cfg(target_os = "linux")]
    // SAFETY: posix_fadvise takes no pointers.
    unsafe {
        libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = fd;
}

/// Pick a transfer buffer size from the input's preferred block size,
/// bounded above; inputs with nothing useful get the default.
pub fn auto_buffer_size(fd: RawFd) -> usize {
    // SAFETY: fstat writes only into the zeroed stat struct.
    let block_size = unsafe {
        let mut sb: libc::stat = std::mem::zeroed();
        if libc::fstat(fd, &mut sb) == 0 {
            sb.st_blksize as usize
        } else {
            0
        }
    };
    if block_size == 0 {
        return DEFAULT_BUFFER_SIZE;
    }
    (block_size * 32).min(MAX_AUTO_BUFFER_SIZE)
}

/// Count line separators in the file at `path` by reading it through.
fn count_lines(path: &str, separator: u8) -> io::Result<i64> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; 65_536];
    let mut lines: i64 = 0;
    loop {
        let got = file.read(&mut buf)?;
        if got == 0 {
            break;
        }
        lines += buf[..got].iter().filter(|&&b| b == separator).count() as i64;
    }
    Ok(lines)
}

/// Calculate the total expected transfer size from the input list: the
/// sum of regular file sizes (or line counts in line mode), block
/// devices measured by seeking to their end.  Unknown contributions make
/// the whole total unknown (0); as a last resort, an output that is a
/// block device provides the total.
pub fn calc_total_size(control: &Config, files: &[String]) -> i64 {
    let mut total: i64 = 0;
    let mut any_unknown = files.is_empty();

    let separator = if control.null_terminated_lines { 0u8 } else { b'\n' };

    for path in files {
        if path == "-" {
            any_unknown = true;
            continue;
        }
        let sb = match stat_path(path) {
            Ok(sb) => sb,
            Err(_) => {
                any_unknown = true;
                continue;
            }
        };
        let file_type = sb.st_mode & libc::S_IFMT;
        if file_type == libc::S_IFREG {
            if control.linemode {
                match count_lines(path, separator) {
                    Ok(lines) => total += lines,
                    Err(_) => any_unknown = true,
                }
            } else {
                total += sb.st_size as i64;
            }
        } else if file_type == libc::S_IFBLK && !control.linemode {
            match device_size(path) {
                Some(size) => total += size,
                None => any_unknown = true,
            }
        } else {
            any_unknown = true;
        }
    }

    if any_unknown || total == 0 {
        // A block-device output determines the size when the inputs
        // cannot.
        if !control.linemode {
            if let Some(size) = output_device_size(control.output_fd) {
                debug!("total size taken from output device: {}", size);
                return size;
            }
        }
        if any_unknown {
            return 0;
        }
    }

    total
}

fn device_size(path: &str) -> Option<i64> {
    let c_path = CString::new(path).ok()?;
    // SAFETY: open takes a valid C string; lseek takes no pointers; the
    // fd is closed on every path.
    unsafe {
        let fd = libc::open(c_path.as_ptr(), libc::O_RDONLY);
        if fd < 0 {
            return None;
        }
        let size = libc::lseek(fd, 0, libc::SEEK_END);
        libc::close(fd);
        if size < 0 {
            None
        } else {
            Some(size as i64)
        }
    }
}

fn output_device_size(fd: RawFd) -> Option<i64> {
    // SAFETY: fstat writes only into the zeroed stat struct; lseek takes
    // no pointers and the original position is restored.
    unsafe {
        let mut sb: libc::stat = std::mem::zeroed();
        if libc::fstat(fd, &mut sb) != 0 {
            return None;
        }
        if sb.st_mode & libc::S_IFMT != libc::S_IFBLK {
            return None;
        }
        let here = libc::lseek(fd, 0, libc::SEEK_CUR);
        if here < 0 {
            return None;
        }
        let size = libc::lseek(fd, 0, libc::SEEK_END);
        libc::lseek(fd, here, libc::SEEK_SET);
        if size < 0 {
            None
        } else {
            Some(size as i64)
        }
    }
}

/// Point the output at `path` (None or "-" meaning stdout), closing and
/// truncating the previous output first where applicable.
pub fn set_output(
    control: &mut Config,
    transfer: &TransferState,
    path: Option<&str>,
) -> Result<(), ExitStatus> {
    close_output(control, transfer);

    let path = match path {
        None | Some("-") => {
            control.output_fd = libc::STDOUT_FILENO;
            control.output_name = "(stdout)".to_string();
            return Ok(());
        }
        Some(path) => path,
    };

    let c_path = CString::new(path).map_err(|_| ExitStatus::ACCESS)?;
    // SAFETY: open takes a valid C string; the result is checked.
    let fd = unsafe {
        libc::open(
            c_path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            0o600 as libc::c_uint,
        )
    };
    if fd < 0 {
        terminal::error_msg(&format!(
            "{}: failed to open output: {}",
            path,
            io::Error::last_os_error()
        ));
        return Err(ExitStatus::ACCESS);
    }

    control.output_fd = fd;
    control.output_name = path.to_string();

    // With sparse output to a file opened for append, the file offset is
    // not established until the first write; seek to the end now so
    // relative seeks over leading holes land where they should.
    // SAFETY: fcntl/lseek take no pointers here.
    unsafe {
        if control.sparse_output && libc::fcntl(fd, libc::F_GETFL) & libc::O_APPEND != 0 {
            libc::lseek(fd, 0, libc::SEEK_END);
        }
    }

    Ok(())
}

/// In sparse mode the output position may be ahead of the data actually
/// written; truncate to the current offset so elided trailing zeroes
/// still extend the file.
pub fn truncate_output(control: &Config, transfer: &TransferState) {
    if !control.sparse_output || transfer.output_not_seekable || control.output_fd < 0 {
        return;
    }
    // SAFETY: lseek/ftruncate take no pointers; failures are ignorable.
    unsafe {
        let offset = libc::lseek(control.output_fd, 0, libc::SEEK_CUR);
        if offset < 0 {
            return;
        }
        if libc::ftruncate(control.output_fd, offset) != 0 {
            debug!(
                "output ftruncate failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// Truncate (sparse mode) and close the current output, unless it is
/// stdout.
pub fn close_output(control: &mut Config, transfer: &TransferState) {
    if control.output_fd < 0 {
        return;
    }
    truncate_output(control, transfer);
    if control.output_fd != libc::STDOUT_FILENO {
        // SAFETY: closing an fd we own.
        let ret = unsafe { libc::close(control.output_fd) };
        if ret < 0 {
            terminal::error_msg(&format!(
                "{}: {}",
                control.output_name,
                io::Error::last_os_error()
            ));
        }
    }
    control.output_fd = -1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn input_names() {
        let files = vec!["-".to_string(), "data.bin".to_string()];
        assert_eq!(input_name(&files, 0), "(stdin)");
        assert_eq!(input_name(&files, 1), "data.bin");
        assert_eq!(input_name(&files, 5), "(stdin)");
    }

    #[test]
    fn total_size_of_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a");
        let path_b = dir.path().join("b");
        std::fs::write(&path_a, vec![0u8; 1000]).unwrap();
        std::fs::write(&path_b, vec![0u8; 234]).unwrap();

        let control = Config::default();
        let files = vec![
            path_a.to_string_lossy().into_owned(),
            path_b.to_string_lossy().into_owned(),
        ];
        assert_eq!(calc_total_size(&control, &files), 1234);
    }

    #[test]
    fn total_size_unknown_with_stdin() {
        let control = Config::default();
        let files = vec!["-".to_string()];
        assert_eq!(calc_total_size(&control, &files), 0);
    }

    #[test]
    fn total_size_counts_lines_in_line_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines");
        let mut file = std::fs::File::create(&path).unwrap();
        for _ in 0..10 {
            writeln!(file, "hello").unwrap();
        }
        drop(file);

        let control = Config {
            linemode: true,
            ..Default::default()
        };
        let files = vec![path.to_string_lossy().into_owned()];
        assert_eq!(calc_total_size(&control, &files), 10);
    }

    #[test]
    fn next_file_opens_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exists");
        std::fs::write(&path, b"x").unwrap();

        let mut status = ProgramStatus::new(false);
        let files = vec![
            path.to_string_lossy().into_owned(),
            "/nonexistent/definitely/not".to_string(),
        ];

        let fd = next_file(&mut status, &files, 0, -1).unwrap();
        assert!(fd >= 0);
        assert!(status.exit.is_success());

        assert!(next_file(&mut status, &files, 1, fd).is_none());
        assert_eq!(status.exit.code() & ExitStatus::ACCESS.code(), 4);
    }

    #[test]
    fn set_output_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let mut control = Config::default();
        let transfer = TransferState::default();
        set_output(
            &mut control,
            &transfer,
            Some(path.to_string_lossy().as_ref()),
        )
        .unwrap();
        assert!(control.output_fd >= 0);
        assert!(path.exists());
        close_output(&mut control, &transfer);
        assert_eq!(control.output_fd, -1);
    }
}
