//! Real-time spectrum logging pipeline: acquire sweeps from a spectrum
//! analyzer, average them, persist durable records, and push a decimated live
//! feed to a TCP viewer.

use serde::{Deserialize, Serialize};

pub mod args;
pub mod average;
pub mod broadcast;
pub mod capture;
pub mod exfil;
pub mod fft;
pub mod flags;
pub mod instrument;
pub mod ring;

/// Native acquisition bandwidth of the frontend, in Hz. Requested spans wider
/// than this put the capture stage into band-sweep mode.
pub const IF_BANDWIDTH: f64 = 20e6;

/// Raw time-domain samples per instrument acquisition cycle
pub const BLOCK_LEN: usize = 16384;

/// Seconds since the unix epoch, fractional
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// One cycle of raw time-domain samples out of the instrument, tagged with a
/// monotonic sequence number. Lives in a ring buffer slot; the sample storage
/// is allocated once at ring construction and written in place.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleBlock {
    pub seq: u64,
    pub samples: Vec<f64>,
}

impl SampleBlock {
    pub fn zeroed(len: usize) -> Self {
        Self {
            seq: 0,
            samples: vec![0.0; len],
        }
    }
}

/// One averaged (or single-shot) frequency-domain measurement. `count` is the
/// number of source sweeps folded into `bins`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectrumRecord {
    pub timestamp: f64,
    pub start_freq: f64,
    pub bin_size: f64,
    pub count: u32,
    pub bins: Vec<f64>,
}

/// Out-of-band event, persisted to the side log and never averaged
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusEvent {
    /// Snapshot of the acquisition settings, published after every (re)configure
    Settings {
        config: instrument::AcqConfig,
        bin_count: u32,
        bin_size: f64,
        start_freq: f64,
        averaging_interval: u32,
    },
    /// Periodic hardware diagnostics readout
    Diagnostics(instrument::Diagnostics),
    /// Something went wrong upstream
    Error { message: String },
}

/// What flows from the capture/transform stages down to persistence
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Spectrum(SpectrumRecord),
    Status { timestamp: f64, event: StatusEvent },
}

impl Message {
    pub fn status(event: StatusEvent) -> Self {
        Self::Status {
            timestamp: unix_timestamp(),
            event,
        }
    }
}
