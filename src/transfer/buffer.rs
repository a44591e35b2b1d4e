// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The transfer buffer: one allocation with a read cursor (how far input
//! data has been filled in) and a write cursor (how much of that has been
//! flushed to the output).  The storage is aligned for O_DIRECT, so a
//! resize allocates fresh storage and copies the live window; an aligned
//! block can never be reallocated in place.

use aligned_vec::AVec;
use aligned_vec::RuntimeAlign;

/// Extra slack beyond the requested size, so short tail reads do not
/// force an early flush.
const SIZE_SLACK: usize = 32;

/// Alignment to fall back on when the page size cannot be determined.
const FALLBACK_ALIGNMENT: usize = 8192;

fn fpathconf_alignment(fd: libc::c_int) -> Option<usize> {
    if fd < 0 {
        return None;
    }
    // SAFETY: fpathconf takes no pointers; -1 covers both "error" and
    // "no limit", neither of which contributes an alignment.
    let value = unsafe { libc::fpathconf(fd, libc::_PC_REC_XFER_ALIGN) };
    if value > 0 {
        Some(value as usize)
    } else {
        None
    }
}

/// The alignment to allocate transfer storage with: the larger of the
/// page size and what either file descriptor reports for record transfer
/// alignment, rounded up to a power of two.
fn required_alignment(fd_out: libc::c_int, fd_in: libc::c_int) -> usize {
    // SAFETY: sysconf takes no pointers.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = if page > 0 {
        page as usize
    } else {
        FALLBACK_ALIGNMENT
    };

    let alignment = fpathconf_alignment(fd_in)
        .into_iter()
        .chain(fpathconf_alignment(fd_out))
        .chain(std::iter::once(page))
        .max()
        .unwrap_or(page);

    alignment.next_power_of_two()
}

pub struct TransferBuffer {
    storage: AVec<u8, RuntimeAlign>,
    read_cursor: usize,
    write_cursor: usize,
}

impl TransferBuffer {
    /// Allocate a zeroed buffer of `target_size` (plus slack), aligned
    /// for the given input and output descriptors.
    pub fn allocate(fd_out: libc::c_int, fd_in: libc::c_int, target_size: usize) -> TransferBuffer {
        let alignment = required_alignment(fd_out, fd_in);
        let total = target_size + SIZE_SLACK;
        let storage = AVec::from_iter(alignment, std::iter::repeat(0u8).take(total));
        TransferBuffer {
            storage,
            read_cursor: 0,
            write_cursor: 0,
        }
    }

    /// Replace the storage with a larger aligned allocation, preserving
    /// the live window and cursors.
    pub fn grow(&mut self, fd_out: libc::c_int, fd_in: libc::c_int, target_size: usize) {
        let mut new = TransferBuffer::allocate(fd_out, fd_in, target_size);
        new.storage[..self.read_cursor].copy_from_slice(&self.storage[..self.read_cursor]);
        new.read_cursor = self.read_cursor;
        new.write_cursor = self.write_cursor;
        *self = new;
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn read_cursor(&self) -> usize {
        self.read_cursor
    }

    pub fn write_cursor(&self) -> usize {
        self.write_cursor
    }

    /// Room left for new input data.
    pub fn space_remaining(&self) -> usize {
        self.storage.len() - self.read_cursor
    }

    /// The region a read may fill.
    pub fn read_target(&mut self) -> &mut [u8] {
        let start = self.read_cursor;
        &mut self.storage[start..]
    }

    /// Record that `n` bytes were read into the read target.
    pub fn commit_read(&mut self, n: usize) {
        self.read_cursor += n;
        debug_assert!(self.read_cursor <= self.storage.len());
    }

    /// Zero `n` bytes at the read cursor and account them as read; used
    /// to preserve output positioning when skipping unreadable input.
    pub fn zero_fill(&mut self, n: usize) {
        let start = self.read_cursor;
        let end = start + n;
        debug_assert!(end <= self.storage.len());
        self.storage[start..end].fill(0);
        self.read_cursor = end;
    }

    /// Data read but not yet written.
    pub fn pending(&self) -> &[u8] {
        &self.storage[self.write_cursor..self.read_cursor]
    }

    pub fn pending_len(&self) -> usize {
        self.read_cursor - self.write_cursor
    }

    /// Record that `n` pending bytes were written.  When the write cursor
    /// catches up with the read cursor, both reset to the start; returns
    /// true in that case.
    pub fn advance_write(&mut self, n: usize) -> bool {
        self.write_cursor += n;
        debug_assert!(self.write_cursor <= self.read_cursor);
        if self.write_cursor >= self.read_cursor {
            self.write_cursor = 0;
            self.read_cursor = 0;
            true
        } else {
            false
        }
    }

    /// Rotate written bytes out of the buffer so the next read can fill
    /// it completely.
    pub fn compact(&mut self) {
        if self.write_cursor == 0 {
            return;
        }
        if self.write_cursor < self.read_cursor {
            self.storage
                .copy_within(self.write_cursor..self.read_cursor, 0);
            self.read_cursor -= self.write_cursor;
            self.write_cursor = 0;
        } else {
            self.write_cursor = 0;
            self.read_cursor = 0;
        }
    }

    /// Fraction of the buffer holding unwritten data, as a percentage.
    pub fn fill_percentage(&self) -> f64 {
        if self.storage.is_empty() {
            return 0.0;
        }
        (self.pending_len() as f64) * 100.0 / (self.storage.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursors_track_reads_and_writes() {
        let mut buf = TransferBuffer::allocate(-1, -1, 1024);
        assert!(buf.capacity() >= 1024);
        assert_eq!(buf.pending_len(), 0);

        buf.read_target()[..4].copy_from_slice(b"abcd");
        buf.commit_read(4);
        assert_eq!(buf.pending(), b"abcd");

        assert!(!buf.advance_write(2));
        assert_eq!(buf.pending(), b"cd");

        // Writing the rest drains the buffer and resets both cursors.
        assert!(buf.advance_write(2));
        assert_eq!(buf.read_cursor(), 0);
        assert_eq!(buf.write_cursor(), 0);
    }

    #[test]
    fn compact_moves_pending_to_front() {
        let mut buf = TransferBuffer::allocate(-1, -1, 64);
        buf.read_target()[..6].copy_from_slice(b"abcdef");
        buf.commit_read(6);
        buf.advance_write(4);
        buf.compact();
        assert_eq!(buf.write_cursor(), 0);
        assert_eq!(buf.pending(), b"ef");
    }

    #[test]
    fn zero_fill_accounts_as_read() {
        let mut buf = TransferBuffer::allocate(-1, -1, 64);
        buf.read_target()[..3].copy_from_slice(b"xyz");
        buf.commit_read(3);
        buf.zero_fill(5);
        assert_eq!(buf.pending(), b"xyz\0\0\0\0\0");
    }

    #[test]
    fn grow_preserves_live_window() {
        let mut buf = TransferBuffer::allocate(-1, -1, 64);
        buf.read_target()[..6].copy_from_slice(b"abcdef");
        buf.commit_read(6);
        buf.advance_write(2);
        let old_pending = buf.pending().to_vec();
        buf.grow(-1, -1, 4096);
        assert!(buf.capacity() >= 4096);
        assert_eq!(buf.pending(), &old_pending[..]);
    }

    #[test]
    fn alignment_is_power_of_two() {
        let buf = TransferBuffer::allocate(-1, -1, 16);
        let addr = buf.storage.as_ptr() as usize;
        assert_eq!(addr % 4096, 0);
    }
}
