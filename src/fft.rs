//! Transform stage: workers drain raw sample blocks from the ring, cut them
//! into overlapped windows, and turn each window into one spectrum record.
//!
//! Windows overlap because the window function attenuates samples near its
//! edges; advancing by `window_len / overlap` recovers that energy across the
//! block.

use std::{sync::Arc, thread, time::Duration};

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::{debug, info, warn};

use crate::{
    flags::ControlFlags,
    ring::{RingBuffer, RingError},
    unix_timestamp, SampleBlock, SpectrumRecord,
};

#[derive(Clone, Debug)]
pub struct TransformParams {
    pub window_len: usize,
    /// Overlap divisor `v`: consecutive window starts are `window_len / v`
    /// samples apart
    pub overlap: usize,
    /// Frequency of the first output bin
    pub start_freq: f64,
    /// Frequency step between output bins
    pub bin_size: f64,
    pub poll: Duration,
}

/// Windowed overlapped real-to-complex DFT of fixed-length windows
pub struct Channelizer {
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    hop: usize,
    scratch: Vec<Complex<f64>>,
}

fn hamming(len: usize) -> Vec<f64> {
    (0..len)
        .map(|n| 0.54 - 0.46 * (2.0 * std::f64::consts::PI * n as f64 / (len - 1) as f64).cos())
        .collect()
}

impl Channelizer {
    pub fn new(window_len: usize, overlap: usize) -> Self {
        assert!(window_len > 1, "window must hold more than one sample");
        assert!(
            overlap >= 1 && overlap <= window_len,
            "overlap divisor out of range"
        );
        Self {
            fft: FftPlanner::new().plan_fft_forward(window_len),
            window: hamming(window_len),
            hop: (window_len / overlap).max(1),
            scratch: vec![Complex::default(); window_len],
        }
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Magnitude bins (`window_len / 2 + 1` of them, the real-input half) for
    /// every overlapped window that fits in `samples`
    pub fn channelize(&mut self, samples: &[f64]) -> Vec<Vec<f64>> {
        let w = self.window.len();
        let mut out = Vec::new();
        if samples.len() < w {
            return out;
        }
        let mut start = 0;
        while start + w <= samples.len() {
            for (i, (s, coeff)) in samples[start..start + w].iter().zip(&self.window).enumerate() {
                self.scratch[i] = Complex::new(s * coeff, 0.0);
            }
            self.fft.process(&mut self.scratch);
            out.push(self.scratch[..w / 2 + 1].iter().map(|c| c.norm()).collect());
            start += self.hop;
        }
        out
    }
}

/// One pool worker. Runs until the capture stage has declared itself done and
/// the raw ring is drained. A malformed block is logged and dropped; only an
/// output-ring overrun (a capacity bug, by contract) ends the worker early.
pub fn transform_worker(
    id: usize,
    params: TransformParams,
    raw: Arc<RingBuffer<SampleBlock>>,
    out: Arc<RingBuffer<SpectrumRecord>>,
    flags: Arc<ControlFlags>,
) -> Result<(), RingError> {
    let mut chan = Channelizer::new(params.window_len, params.overlap);
    let mut samples = Vec::with_capacity(params.window_len);
    info!(worker = id, "FFT worker starting up");
    loop {
        let seq = match raw.acquire_read() {
            Some(block) => {
                // Copy out so the slot lock is held for a memcpy, not an FFT
                samples.clear();
                samples.extend_from_slice(&block.samples);
                block.seq
            }
            None => {
                if !flags.capture_active() && raw.pending() == 0 {
                    break;
                }
                thread::sleep(params.poll);
                continue;
            }
        };
        if samples.len() < chan.window_len() {
            warn!(
                worker = id,
                seq,
                len = samples.len(),
                "dropping undersized sample block"
            );
            continue;
        }
        let timestamp = unix_timestamp();
        for bins in chan.channelize(&samples) {
            let mut slot = match out.acquire_write() {
                Ok(slot) => slot,
                Err(e) => {
                    tracing::error!(worker = id, seq, %e, "transformed ring overran");
                    return Err(e);
                }
            };
            slot.timestamp = timestamp;
            slot.start_freq = params.start_freq;
            slot.bin_size = params.bin_size;
            slot.count = 1;
            slot.bins.clear();
            slot.bins.extend_from_slice(&bins);
        }
    }
    debug!(worker = id, "FFT worker exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hamming_is_symmetric_with_low_edges() {
        let w = hamming(64);
        for i in 0..32 {
            assert!((w[i] - w[63 - i]).abs() < 1e-12);
        }
        assert!((w[0] - 0.08).abs() < 1e-9);
        assert!(w[31] > 0.9);
    }

    #[test]
    fn window_count_and_bin_count() {
        let mut chan = Channelizer::new(4, 2);
        // Starts at 0, 2, 4 for an 8-sample block
        let spectra = chan.channelize(&[0.0; 8]);
        assert_eq!(spectra.len(), 3);
        assert_eq!(spectra[0].len(), 3);
    }

    #[test]
    fn undersized_input_yields_nothing() {
        let mut chan = Channelizer::new(16, 2);
        assert!(chan.channelize(&[1.0; 8]).is_empty());
    }

    #[test]
    fn constant_input_concentrates_at_dc() {
        let mut chan = Channelizer::new(64, 1);
        let spectra = chan.channelize(&[1.0; 64]);
        assert_eq!(spectra.len(), 1);
        let bins = &spectra[0];
        let coherent_gain: f64 = hamming(64).iter().sum();
        assert!((bins[0] - coherent_gain).abs() < 1e-9);
        // Everything away from the main lobe is far below DC
        for bin in &bins[4..] {
            assert!(*bin < bins[0] / 100.0);
        }
    }

    #[test]
    fn tone_lands_in_its_bin() {
        let n = 128;
        let k0 = 9;
        let tone: Vec<f64> = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * k0 as f64 * i as f64 / n as f64).cos())
            .collect();
        let mut chan = Channelizer::new(n, 1);
        let spectra = chan.channelize(&tone);
        let bins = &spectra[0];
        let peak = bins
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, k0);
    }

    #[test]
    fn worker_drains_ring_then_exits() {
        let raw = Arc::new(RingBuffer::new(32, || SampleBlock::zeroed(64)));
        let out = Arc::new(RingBuffer::new(64, SpectrumRecord::default));
        let flags = Arc::new(ControlFlags::new());

        for seq in 0..4u64 {
            let mut slot = raw.acquire_write().unwrap();
            slot.seq = seq;
            slot.samples.fill(1.0);
        }
        flags.capture_done();

        let params = TransformParams {
            window_len: 32,
            overlap: 2,
            start_freq: 100.0,
            bin_size: 10.0,
            poll: Duration::from_millis(1),
        };
        transform_worker(0, params, Arc::clone(&raw), Arc::clone(&out), flags).unwrap();

        // 64-sample blocks, 32-sample windows, hop 16: 3 windows per block
        let mut n = 0;
        while let Some(rec) = out.acquire_read() {
            assert_eq!(rec.count, 1);
            assert_eq!(rec.start_freq, 100.0);
            assert_eq!(rec.bins.len(), 17);
            n += 1;
        }
        assert_eq!(n, 12);
        assert_eq!(raw.pending(), 0);
    }
}
