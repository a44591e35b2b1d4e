// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-capacity ring of line-separator output positions.
//!
//! When the output is a pipe, reconciling "lines written" with "lines the
//! consumer has actually read" means walking backwards from the newest
//! separator position until one falls at or before the consumer's
//! position.  The ring holds the most recent positions only; the oldest
//! are overwritten.

/// How many line positions to remember.
pub const MAX_LINE_POSITIONS: usize = 100_000;

#[derive(Debug, Clone)]
pub struct PositionRing {
    positions: Vec<i64>,
    capacity: usize,
    /// Index the next position will be stored at.
    head: usize,
    /// Number of valid entries, up to `capacity`.
    length: usize,
}

impl PositionRing {
    pub fn new(capacity: usize) -> PositionRing {
        PositionRing {
            positions: vec![0; capacity],
            capacity,
            head: 0,
            length: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.length = 0;
    }

    /// Record a separator position, overwriting the oldest when full.
    pub fn push(&mut self, position: i64) {
        self.positions[self.head] = position;
        self.head = (self.head + 1) % self.capacity;
        if self.length < self.capacity {
            self.length += 1;
        }
    }

    /// Walk entries newest-first.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = i64> + '_ {
        (0..self.length).map(move |back| {
            let index = (self.head + self.capacity - back - 1) % self.capacity;
            self.positions[index]
        })
    }

    /// Count separators that lie strictly beyond `consumed_position`,
    /// i.e. lines written but not yet consumed downstream.
    pub fn lines_beyond(&self, consumed_position: i64) -> usize {
        let mut count = 0;
        for position in self.iter_newest_first() {
            if position <= consumed_position {
                break;
            }
            count += 1;
        }
        count
    }
}

impl Default for PositionRing {
    fn default() -> Self {
        PositionRing::new(MAX_LINE_POSITIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_walk_backwards() {
        let mut ring = PositionRing::new(4);
        for position in [10, 20, 30] {
            ring.push(position);
        }
        let walked: Vec<i64> = ring.iter_newest_first().collect();
        assert_eq!(walked, vec![30, 20, 10]);
    }

    #[test]
    fn wraparound_overwrites_oldest() {
        let mut ring = PositionRing::new(3);
        for position in [1, 2, 3, 4, 5] {
            ring.push(position);
        }
        assert_eq!(ring.len(), 3);
        let walked: Vec<i64> = ring.iter_newest_first().collect();
        assert_eq!(walked, vec![5, 4, 3]);
    }

    #[test]
    fn lines_beyond_counts_unconsumed() {
        let mut ring = PositionRing::new(8);
        for position in [100, 200, 300, 400] {
            ring.push(position);
        }
        assert_eq!(ring.lines_beyond(250), 2);
        assert_eq!(ring.lines_beyond(400), 0);
        assert_eq!(ring.lines_beyond(0), 4);
    }

    #[test]
    fn lines_beyond_never_exceeds_length() {
        let mut ring = PositionRing::new(4);
        for position in 0..100 {
            ring.push(position);
        }
        assert_eq!(ring.lines_beyond(-1), 4);
    }
}
