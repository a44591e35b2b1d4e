// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Derived transfer state: instantaneous and average rates, the rate
//! history ring behind the ETA, and the completion percentage.

use crate::config::Config;
use crate::transfer::TransferState;
use crate::units;

#[derive(Debug, Clone, Copy, Default)]
struct HistoryEntry {
    elapsed_sec: f64,
    transferred: i64,
}

/// Calculated state, refreshed once per display tick.
#[derive(Debug, Clone, Default)]
pub struct CalcState {
    pub transfer_rate: f64,
    pub average_rate: f64,

    prev_elapsed_sec: f64,
    prev_rate: f64,
    prev_trans: f64,
    /// Average rate over the sliding history window.
    pub current_avg_rate: f64,

    pub rate_min: f64,
    pub rate_max: f64,
    pub rate_sum: f64,
    pub ratesquared_sum: f64,
    pub measurements_taken: u64,

    history: Vec<HistoryEntry>,
    history_first: usize,
    history_last: usize,

    prev_transferred: i64,

    /// Completion percentage; a 0..200 saw-tooth when the size is
    /// unknown.
    pub percentage: f64,
}

impl CalcState {
    /// Size the history ring for the given average-rate window.
    pub fn set_history_length(&mut self, entries: usize) {
        self.history = vec![HistoryEntry::default(); entries.max(2)];
        self.history_first = 0;
        self.history_last = 0;
    }

    /// Clear all derived values, keeping the history allocation.
    pub fn reset(&mut self) {
        let entries = self.history.len();
        *self = CalcState {
            history: vec![HistoryEntry::default(); entries],
            ..Default::default()
        };
    }

    /// Mean, maximum, minimum, and standard deviation of the measured
    /// rates, for the end-of-run statistics line.
    pub fn rate_stats(&self) -> Option<(f64, f64, f64, f64)> {
        if self.measurements_taken == 0 {
            return None;
        }
        let count = self.measurements_taken as f64;
        let mean = self.rate_sum / count;
        let variance = self.ratesquared_sum / count - mean * mean;
        let deviation = variance.max(0.0).sqrt();
        Some((self.rate_min, mean, self.rate_max, deviation))
    }

    /// Add a history entry if the interval has elapsed, then derive the
    /// current average rate from the span of the ring.  Before the first
    /// interval completes, the instantaneous rate stands in.
    fn update_average_rate_history(
        &mut self,
        transfer: &TransferState,
        history_interval: u32,
        rate: f64,
    ) {
        if self.history.is_empty() {
            return;
        }

        let last_elapsed = self.history[self.history_last].elapsed_sec;

        if last_elapsed > 0.0
            && transfer.elapsed_seconds < last_elapsed + f64::from(history_interval)
        {
            return;
        }

        if last_elapsed > 0.0 {
            let len = self.history.len();
            self.history_last = (self.history_last + 1) % len;
            if self.history_last == self.history_first {
                self.history_first = (self.history_first + 1) % len;
            }
        }

        self.history[self.history_last] = HistoryEntry {
            elapsed_sec: transfer.elapsed_seconds,
            transferred: transfer.transferred,
        };

        if self.history_first == self.history_last {
            self.current_avg_rate = rate;
        } else {
            let newest = self.history[self.history_last];
            let oldest = self.history[self.history_first];
            let amount = (newest.transferred - oldest.transferred) as f64;
            let mut seconds = newest.elapsed_sec - oldest.elapsed_sec;
            if seconds.abs() < 0.000_001 {
                seconds = 0.000_001;
            }
            self.current_avg_rate = amount / seconds;
        }
    }

    /// Refresh every derived value.  On the final update the rate and
    /// average collapse to the whole-transfer average.
    pub fn update(
        &mut self,
        transfer: &TransferState,
        control: &Config,
        initial_offset: i64,
        final_update: bool,
    ) {
        let mut amount_since_last = 0;
        if transfer.transferred >= 0 {
            amount_since_last = transfer.transferred - self.prev_transferred;
            self.prev_transferred = transfer.transferred;
        }

        // Very small gaps between updates would produce rate spikes (or
        // divide by zero), so transfers accumulate until enough time has
        // passed to measure.
        let time_since_last = transfer.elapsed_seconds - self.prev_elapsed_sec;
        let mut transfer_rate;
        if time_since_last <= 0.01 {
            transfer_rate = self.prev_rate;
            self.prev_trans += amount_since_last as f64;
        } else {
            transfer_rate = (amount_since_last as f64 + self.prev_trans) / time_since_last;
            let mut measured_rate = transfer_rate;

            self.prev_elapsed_sec = transfer.elapsed_seconds;
            self.prev_trans = 0.0;

            if control.bits {
                measured_rate *= 8.0;
            }

            if self.measurements_taken < 1 || measured_rate < self.rate_min {
                self.rate_min = measured_rate;
            }
            if measured_rate > self.rate_max {
                self.rate_max = measured_rate;
            }
            self.rate_sum += measured_rate;
            self.ratesquared_sum += measured_rate * measured_rate;
            self.measurements_taken += 1;
        }
        self.prev_rate = transfer_rate;

        self.update_average_rate_history(transfer, control.history_interval, transfer_rate);
        let mut average_rate = self.current_avg_rate;

        if final_update {
            let mut total_elapsed = transfer.elapsed_seconds;
            if total_elapsed < 0.000_001 {
                total_elapsed = 0.000_001;
            }
            average_rate = (transfer.transferred - initial_offset) as f64 / total_elapsed;
            transfer_rate = average_rate;
        }

        self.transfer_rate = transfer_rate;
        self.average_rate = average_rate;

        if control.size <= 0 {
            // Without a known size the percentage climbs to 200 and
            // resets, giving the display a back-and-forth sweep.
            if transfer_rate > 0.0 {
                self.percentage += 2.0;
            }
            if self.percentage > 199.0 {
                self.percentage = 0.0;
            }
        } else {
            self.percentage = units::percentage(transfer.transferred, control.size);
        }

        self.percentage = self.percentage.clamp(0.0, 100_000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer_at(elapsed: f64, transferred: i64) -> TransferState {
        let mut transfer = TransferState::default();
        transfer.elapsed_seconds = elapsed;
        transfer.transferred = transferred;
        transfer
    }

    #[test]
    fn percentage_known_size() {
        let mut calc = CalcState::default();
        calc.set_history_length(8);
        let control = Config {
            size: 1000,
            ..Default::default()
        };
        calc.update(&transfer_at(1.0, 250), &control, 0, false);
        assert!((calc.percentage - 25.0).abs() < 1e-9);
        calc.update(&transfer_at(2.0, 1000), &control, 0, false);
        assert!((calc.percentage - 100.0).abs() < 1e-9);
    }

    #[test]
    fn percentage_sawtooth_when_size_unknown() {
        let mut calc = CalcState::default();
        calc.set_history_length(8);
        let control = Config::default();
        let mut seen_zero_again = false;
        let mut previous = 0.0;
        for step in 1..300 {
            calc.update(&transfer_at(step as f64, step * 100), &control, 0, false);
            assert!(calc.percentage >= 0.0 && calc.percentage < 200.0);
            if calc.percentage < previous {
                seen_zero_again = true;
            }
            previous = calc.percentage;
        }
        assert!(seen_zero_again);
    }

    #[test]
    fn rates_are_measured() {
        let mut calc = CalcState::default();
        calc.set_history_length(8);
        let control = Config {
            size: 0,
            ..Default::default()
        };
        calc.update(&transfer_at(1.0, 1000), &control, 0, false);
        calc.update(&transfer_at(2.0, 2000), &control, 0, false);
        assert!(calc.measurements_taken >= 1);
        assert!(calc.transfer_rate > 0.0);
        let (min, mean, max, dev) = calc.rate_stats().unwrap();
        assert!(min <= mean && mean <= max);
        assert!(dev >= 0.0);
    }

    #[test]
    fn final_update_uses_whole_transfer_average() {
        let mut calc = CalcState::default();
        calc.set_history_length(8);
        let control = Config {
            size: 4000,
            ..Default::default()
        };
        calc.update(&transfer_at(1.0, 1000), &control, 0, false);
        calc.update(&transfer_at(4.0, 4000), &control, 0, true);
        assert!((calc.average_rate - 1000.0).abs() < 1.0);
        assert!((calc.transfer_rate - 1000.0).abs() < 1.0);
    }

    #[test]
    fn first_history_entry_uses_instantaneous_rate() {
        let mut calc = CalcState::default();
        calc.set_history_length(4);
        let control = Config::default();
        calc.update(&transfer_at(1.0, 500), &control, 0, false);
        assert!((calc.current_avg_rate - calc.transfer_rate).abs() < 1e-9);
    }
}
