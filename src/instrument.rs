//! Contract the capture stage consumes from the spectrum-analyzer driver,
//! plus a simulated device so the pipeline runs (and is testable) without
//! hardware on the bench.
//!
//! Every call can fail with a [`DeviceFault`]. Faults are transient by
//! contract: the capture stage reacts by tearing the handle down and building
//! a fresh one through its factory, never by exiting.

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("device fault: {0}")]
pub struct DeviceFault(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum WindowKind {
    Nutall,
    Blackman,
    Hamming,
    FlatTop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Units {
    Log,
    Voltage,
    Power,
    Bypass,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
    None,
    RisingEdge,
    FallingEdge,
}

/// Acquisition mode handed to `initiate`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcqKind {
    /// Continuous frequency-domain sweeps of the configured window
    RealTime,
    /// Raw time-domain sample blocks for the in-process FFT
    RawPipe,
}

/// Full configuration surface of the frontend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcqConfig {
    pub center_freq: f64,
    pub span: f64,
    pub ref_level_db: f64,
    pub attenuation_db: f64,
    pub gain: i32,
    pub rbw: f64,
    pub vbw: f64,
    pub sweep_time: f64,
    pub window: WindowKind,
    pub units: Units,
    pub trigger: TriggerKind,
}

/// Geometry of the traces the current configuration will produce
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceInfo {
    pub bin_count: u32,
    pub bin_size: f64,
    pub start_freq: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub temperature: f64,
    pub bus_voltage: f64,
    pub bus_current: f64,
}

/// One frequency-domain measurement at the instrument's current tuning
#[derive(Clone, Debug, PartialEq)]
pub struct Trace {
    pub start_freq: f64,
    pub bin_size: f64,
    pub bins: Vec<f64>,
}

pub trait Instrument: Send {
    fn configure(&mut self, cfg: &AcqConfig) -> Result<(), DeviceFault>;
    fn initiate(&mut self, kind: AcqKind) -> Result<(), DeviceFault>;
    fn fetch_trace(&mut self) -> Result<Trace, DeviceFault>;
    fn fetch_raw(&mut self, buf: &mut [f64]) -> Result<(), DeviceFault>;
    fn trace_info(&mut self) -> Result<TraceInfo, DeviceFault>;
    fn diagnostics(&mut self) -> Result<Diagnostics, DeviceFault>;
    fn self_calibrate(&mut self) -> Result<(), DeviceFault>;
    fn abort(&mut self) -> Result<(), DeviceFault>;
    fn close(&mut self) -> Result<(), DeviceFault>;
}

/// Builds a fresh handle after a fault tears the old one down
pub type InstrumentFactory = Box<dyn FnMut() -> Box<dyn Instrument> + Send>;

/// Synthetic frontend: flat noise floor plus a tone pinned at the configured
/// center frequency, a slow thermal drift, and an optional injected fault
/// rate for exercising the recovery path.
pub struct SimInstrument {
    config: Option<AcqConfig>,
    temperature: f64,
    fault_rate: f64,
    rng: StdRng,
}

impl SimInstrument {
    pub fn new(fault_rate: f64) -> Self {
        Self {
            config: None,
            temperature: 34.0,
            fault_rate,
            rng: StdRng::from_entropy(),
        }
    }

    fn config(&self) -> Result<&AcqConfig, DeviceFault> {
        self.config
            .as_ref()
            .ok_or_else(|| DeviceFault("device not configured".into()))
    }

    fn maybe_fault(&mut self) -> Result<(), DeviceFault> {
        if self.fault_rate > 0.0 && self.rng.gen_bool(self.fault_rate) {
            return Err(DeviceFault("simulated USB transfer stall".into()));
        }
        Ok(())
    }

    fn geometry(cfg: &AcqConfig) -> TraceInfo {
        let bin_count = (cfg.span / cfg.rbw).ceil().max(1.0) as u32;
        TraceInfo {
            bin_count,
            bin_size: cfg.span / bin_count as f64,
            start_freq: cfg.center_freq - cfg.span / 2.0,
        }
    }
}

impl Instrument for SimInstrument {
    fn configure(&mut self, cfg: &AcqConfig) -> Result<(), DeviceFault> {
        self.maybe_fault()?;
        self.config = Some(cfg.clone());
        Ok(())
    }

    fn initiate(&mut self, _kind: AcqKind) -> Result<(), DeviceFault> {
        self.config()?;
        self.maybe_fault()
    }

    fn fetch_trace(&mut self) -> Result<Trace, DeviceFault> {
        self.maybe_fault()?;
        let info = Self::geometry(self.config()?);
        let center_bin = info.bin_count / 2;
        let bins = (0..info.bin_count)
            .map(|i| {
                let noise: f64 = self.rng.gen_range(0.0..1e-9);
                if i == center_bin {
                    noise + 1e-6
                } else {
                    noise
                }
            })
            .collect();
        Ok(Trace {
            start_freq: info.start_freq,
            bin_size: info.bin_size,
            bins,
        })
    }

    fn fetch_raw(&mut self, buf: &mut [f64]) -> Result<(), DeviceFault> {
        self.maybe_fault()?;
        self.config()?;
        for s in buf.iter_mut() {
            *s = self.rng.gen_range(-1.0..1.0);
        }
        Ok(())
    }

    fn trace_info(&mut self) -> Result<TraceInfo, DeviceFault> {
        Ok(Self::geometry(self.config()?))
    }

    fn diagnostics(&mut self) -> Result<Diagnostics, DeviceFault> {
        self.maybe_fault()?;
        // Thermal random walk, biased slightly upward like a warming frontend
        self.temperature += self.rng.gen_range(-0.05..0.08);
        Ok(Diagnostics {
            temperature: self.temperature,
            bus_voltage: 4.95 + self.rng.gen_range(-0.05..0.05),
            bus_current: 0.81 + self.rng.gen_range(-0.02..0.02),
        })
    }

    fn self_calibrate(&mut self) -> Result<(), DeviceFault> {
        self.config()?;
        self.maybe_fault()
    }

    fn abort(&mut self) -> Result<(), DeviceFault> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceFault> {
        self.config = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AcqConfig {
        AcqConfig {
            center_freq: 152e6,
            span: 20e6,
            ref_level_db: -60.0,
            attenuation_db: 10.0,
            gain: 3,
            rbw: 10e3,
            vbw: 10e3,
            sweep_time: 0.01,
            window: WindowKind::Hamming,
            units: Units::Power,
            trigger: TriggerKind::None,
        }
    }

    #[test]
    fn unconfigured_fetch_faults() {
        let mut sim = SimInstrument::new(0.0);
        assert!(sim.fetch_trace().is_err());
    }

    #[test]
    fn trace_matches_reported_geometry() {
        let mut sim = SimInstrument::new(0.0);
        sim.configure(&test_config()).unwrap();
        sim.initiate(AcqKind::RealTime).unwrap();
        let info = sim.trace_info().unwrap();
        let trace = sim.fetch_trace().unwrap();
        assert_eq!(trace.bins.len(), info.bin_count as usize);
        assert_eq!(trace.start_freq, info.start_freq);
        assert_eq!(trace.bin_size, info.bin_size);
        assert_eq!(info.bin_count, 2000);
        assert_eq!(info.start_freq, 142e6);
    }

    #[test]
    fn always_faulting_device_faults() {
        let mut sim = SimInstrument::new(1.0);
        assert!(sim.configure(&test_config()).is_err());
    }
}
