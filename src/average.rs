//! Running sum-of-bins accumulator with the dual flush rule.
//!
//! A flush happens when the incoming sweep's start frequency (or bin count)
//! differs from what is being accumulated, or when the configured number of
//! sweeps has been folded in. The first condition guarantees no record ever
//! mixes data across a retune; the second bounds memory and latency even when
//! retunes are rare.

use crate::{unix_timestamp, SpectrumRecord};

#[derive(Debug, Default)]
pub struct RunningAccumulator {
    start_freq: f64,
    bin_size: f64,
    sum: Vec<f64>,
    count: u32,
}

impl RunningAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Fold one sweep in, flushing first if it belongs to a different tuning
    /// and flushing after if `target` sweeps have accumulated. Returns the
    /// zero, one, or (when `target == 1` right after a retune) two records
    /// this sweep caused to flush.
    pub fn absorb(
        &mut self,
        start_freq: f64,
        bin_size: f64,
        bins: &[f64],
        target: u32,
    ) -> Vec<SpectrumRecord> {
        let mut flushed = Vec::new();
        // The instrument reports the tuned start frequency exactly, so exact
        // comparison is the right discontinuity test here.
        if self.count > 0 && (start_freq != self.start_freq || bins.len() != self.sum.len()) {
            flushed.extend(self.flush());
        }
        if self.count == 0 {
            self.start_freq = start_freq;
            self.bin_size = bin_size;
            self.sum.clear();
            self.sum.extend_from_slice(bins);
        } else {
            for (acc, bin) in self.sum.iter_mut().zip(bins) {
                *acc += bin;
            }
        }
        self.count += 1;
        if self.count >= target {
            flushed.extend(self.flush());
        }
        flushed
    }

    /// Finalize the accumulated sweeps into one record and reset
    pub fn flush(&mut self) -> Option<SpectrumRecord> {
        if self.count == 0 {
            return None;
        }
        let count = self.count;
        let bins = self.sum.iter().map(|s| s / count as f64).collect();
        self.sum.clear();
        self.count = 0;
        Some(SpectrumRecord {
            timestamp: unix_timestamp(),
            start_freq: self.start_freq,
            bin_size: self.bin_size,
            count,
            bins,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushes_on_frequency_change_and_on_target() {
        let mut acc = RunningAccumulator::new();
        let mut records = Vec::new();
        for f in [100.0, 100.0, 100.0, 200.0, 200.0] {
            records.extend(acc.absorb(f, 1.0, &[1.0, 2.0], 10));
        }
        records.extend(acc.flush());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].start_freq, 100.0);
        assert_eq!(records[0].count, 3);
        assert_eq!(records[1].start_freq, 200.0);
        assert_eq!(records[1].count, 2);
    }

    #[test]
    fn average_of_constant_sweeps_is_idempotent() {
        let mut acc = RunningAccumulator::new();
        let c = [0.5, -3.25, 7.0, 0.0];
        let mut records = Vec::new();
        for _ in 0..8 {
            records.extend(acc.absorb(10.0, 2.0, &c, 8));
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bins, c);
        assert_eq!(records[0].count, 8);
        assert!(acc.is_empty());
    }

    #[test]
    fn target_reached_flushes_exactly() {
        let mut acc = RunningAccumulator::new();
        let mut records = Vec::new();
        for i in 0..6 {
            records.extend(acc.absorb(100.0, 1.0, &[i as f64], 3));
        }
        assert_eq!(records.len(), 2);
        // [0,1,2] and [3,4,5]
        assert_eq!(records[0].bins, [1.0]);
        assert_eq!(records[1].bins, [4.0]);
    }

    #[test]
    fn bin_count_change_also_flushes() {
        let mut acc = RunningAccumulator::new();
        let mut records = Vec::new();
        records.extend(acc.absorb(100.0, 1.0, &[1.0, 1.0], 10));
        records.extend(acc.absorb(100.0, 1.0, &[2.0, 2.0, 2.0], 10));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bins, [1.0, 1.0]);
        assert_eq!(acc.count(), 1);
    }

    #[test]
    fn flush_of_empty_accumulator_is_none() {
        let mut acc = RunningAccumulator::new();
        assert!(acc.flush().is_none());
    }
}
