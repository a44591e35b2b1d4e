// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mach (macOS/iOS) implementations.  There is no splice(2); file
//! descriptor discovery goes through the libproc pid-info syscalls.

use std::ffi::CStr;
use std::io;
use std::mem;
use std::path::PathBuf;

use super::FdDescription;

const PROC_PIDLISTFDS: libc::c_int = 1;
const PROC_PIDFDVNODEPATHINFO: libc::c_int = 2;
const PROX_FDTYPE_VNODE: u32 = 1;
const MAXPATHLEN: usize = 1024;

#[repr(C)]
#[derive(Clone, Copy)]
struct ProcFdInfo {
    proc_fd: i32,
    proc_fdtype: u32,
}

#[repr(C)]
struct VnodeInfo {
    vi_stat: libc::stat,
    vi_type: libc::c_int,
    vi_pad: libc::c_int,
    vi_fsid: [i32; 2],
}

#[repr(C)]
struct VnodeInfoPath {
    vip_vi: VnodeInfo,
    vip_path: [libc::c_char; MAXPATHLEN],
}

#[repr(C)]
struct ProcFileInfo {
    fi_openflags: u32,
    fi_status: u32,
    fi_offset: i64,
    fi_type: i32,
    fi_guardflags: u32,
}

#[repr(C)]
struct VnodeFdInfoWithPath {
    pfi: ProcFileInfo,
    pvip: VnodeInfoPath,
}

extern "C" {
    fn proc_pidinfo(
        pid: libc::c_int,
        flavor: libc::c_int,
        arg: u64,
        buffer: *mut libc::c_void,
        buffersize: libc::c_int,
    ) -> libc::c_int;
    fn proc_pidfdinfo(
        pid: libc::c_int,
        fd: libc::c_int,
        flavor: libc::c_int,
        buffer: *mut libc::c_void,
        buffersize: libc::c_int,
    ) -> libc::c_int;
}

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

fn fd_infos(pid: libc::pid_t) -> io::Result<Vec<ProcFdInfo>> {
    // SAFETY: a null buffer asks for the required size; the second call
    // writes at most that many bytes into the vector we allocated.
    unsafe {
        let needed = proc_pidinfo(pid, PROC_PIDLISTFDS, 0, std::ptr::null_mut(), 0);
        if needed <= 0 {
            return Err(io::Error::last_os_error());
        }
        let count = needed as usize / mem::size_of::<ProcFdInfo>();
        let mut infos: Vec<ProcFdInfo> = vec![ProcFdInfo { proc_fd: -1, proc_fdtype: 0 }; count];
        let got = proc_pidinfo(
            pid,
            PROC_PIDLISTFDS,
            0,
            infos.as_mut_ptr() as *mut libc::c_void,
            needed,
        );
        if got <= 0 {
            return Err(io::Error::last_os_error());
        }
        infos.truncate(got as usize / mem::size_of::<ProcFdInfo>());
        Ok(infos)
    }
}

pub fn list_pid_fds(pid: libc::pid_t) -> io::Result<Vec<libc::c_int>> {
    Ok(fd_infos(pid)?
        .into_iter()
        .filter(|info| info.proc_fdtype == PROX_FDTYPE_VNODE && info.proc_fd >= 0)
        .map(|info| info.proc_fd)
        .collect())
}

fn vnode_info(pid: libc::pid_t, fd: libc::c_int) -> io::Result<VnodeFdInfoWithPath> {
    // SAFETY: the buffer is sized for the struct the kernel fills in, and
    // the byte count returned is checked against it.
    unsafe {
        let mut info: VnodeFdInfoWithPath = mem::zeroed();
        let size = mem::size_of::<VnodeFdInfoWithPath>() as libc::c_int;
        let got = proc_pidfdinfo(
            pid,
            fd,
            PROC_PIDFDVNODEPATHINFO,
            &mut info as *mut _ as *mut libc::c_void,
            size,
        );
        if got != size {
            return Err(io::Error::last_os_error());
        }
        Ok(info)
    }
}

pub fn describe_fd(pid: libc::pid_t, fd: libc::c_int) -> io::Result<FdDescription> {
    let info = vnode_info(pid, fd)?;
    // SAFETY: the kernel NUL-terminates vip_path within MAXPATHLEN.
    let path = unsafe { CStr::from_ptr(info.pvip.vip_path.as_ptr()) };
    let stat = &info.pvip.vip_vi.vi_stat;
    let mut desc = FdDescription {
        path: PathBuf::from(path.to_string_lossy().into_owned()),
        dev: stat.st_dev as u64,
        ino: stat.st_ino as u64,
        mode: stat.st_mode as u32,
        entry_mode: stat.st_mode as u32,
        size: 0,
    };
    if desc.is_regular() {
        desc.size = stat.st_size as i64;
    }
    Ok(desc)
}

pub fn read_fd_position(pid: libc::pid_t, fd: libc::c_int) -> io::Result<i64> {
    Ok(vnode_info(pid, fd)?.pfi.fi_offset)
}

pub fn siginfo_pid(info: *const libc::siginfo_t) -> libc::pid_t {
    if info.is_null() {
        return 0;
    }
    // SAFETY: valid siginfo from an SA_SIGINFO handler.
    unsafe { (*info).si_pid }
}
