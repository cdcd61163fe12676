//! Capture stage: drives the instrument, hands data downstream, and owns the
//! fault-recovery and recalibration loop.
//!
//! State machine per acquisition configuration:
//! `Idle -> Configuring -> Streaming -> (Faulted -> Configuring) -> Stopped`.
//! A device fault never ends the stage; only the controller clearing `run`
//! does. When the requested span is wider than the frontend's native
//! bandwidth, the stage cycles a precomputed plan of overlapping sub-band
//! centers and retunes once every `bin_samples` sweeps.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    average::RunningAccumulator,
    flags::ControlFlags,
    instrument::{AcqConfig, AcqKind, Instrument, InstrumentFactory},
    ring::{RingBuffer, RingError},
    Message, SampleBlock, StatusEvent, IF_BANDWIDTH,
};

/// Temperature drift (device units) past which the IF gets recalibrated
pub const TEMP_RECAL_THRESHOLD: f64 = 2.0;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// Raw ring filled past the guard band: a capacity/throughput mismatch,
    /// surfaced rather than retried through
    #[error(transparent)]
    Overrun(#[from] RingError),
    #[error("downstream channel closed while capture was still running")]
    ChannelClosed,
}

#[derive(Clone, Debug)]
pub struct CaptureParams {
    pub config: AcqConfig,
    /// Sweeps averaged into each emitted record (sweep deployment)
    pub num_average: u32,
    /// Sweeps taken at each sub-band center before retuning; zero disables
    /// retuning
    pub bin_samples: u64,
    /// Overlap fraction between adjacent sub-bands
    pub overlap: f64,
    /// Cycles between diagnostics/calibration checks; zero disables them
    pub cal_check_cycles: u64,
    /// Cycles between loop-rate log lines; zero disables them
    pub rate_log_cycles: u64,
    /// Samples per raw block (raw deployment; must match the ring's slots)
    pub block_len: usize,
    pub poll: Duration,
}

/// Where captured data goes: averaged sweeps down the message channel, or raw
/// blocks into the ring for the FFT pool
pub enum Feed {
    Sweep,
    Raw(Arc<RingBuffer<SampleBlock>>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Configuring,
    Streaming,
    Faulted,
}

/// Fixed sequence of overlapping sub-band centers covering a span wider than
/// one native acquisition window. Consecutive sub-bands overlap so no
/// coverage gap opens up from a single window's roll-off.
#[derive(Clone, Debug)]
pub struct SweepPlan {
    centers: Vec<f64>,
    next: usize,
}

impl SweepPlan {
    pub fn new(center: f64, span: f64, if_bandwidth: f64, overlap: f64) -> Self {
        assert!(
            span > if_bandwidth,
            "band sweep needs a span wider than the native bandwidth"
        );
        assert!((0.0..1.0).contains(&overlap), "overlap fraction out of range");
        let sweep_width = if_bandwidth * (1.0 - overlap);
        let steps = (span / sweep_width + 0.5) as usize;
        let effective = sweep_width * steps as f64;
        let base = center - (effective / 2.0 + sweep_width / 2.0);
        Self {
            centers: (1..=steps).map(|i| base + i as f64 * sweep_width).collect(),
            next: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.centers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }

    /// Next center frequency, wrapping modulo plan length
    pub fn advance(&mut self) -> f64 {
        let center = self.centers[self.next];
        self.next = (self.next + 1) % self.centers.len();
        center
    }
}

pub struct Capture {
    factory: InstrumentFactory,
    params: CaptureParams,
    feed: Feed,
    messages: Sender<Message>,
    flags: Arc<ControlFlags>,
    plan: Option<SweepPlan>,
    accum: RunningAccumulator,
    scratch: Vec<f64>,
    state: State,
    cycles: u64,
    seq: u64,
    last_cal_temp: f64,
    rate_timer: Instant,
}

impl Capture {
    pub fn new(
        factory: InstrumentFactory,
        params: CaptureParams,
        feed: Feed,
        messages: Sender<Message>,
        flags: Arc<ControlFlags>,
    ) -> Self {
        // Raw blocks always come from a single native window; only the sweep
        // deployment retunes across a wider span.
        let plan = (matches!(feed, Feed::Sweep) && params.config.span > IF_BANDWIDTH).then(|| {
            SweepPlan::new(
                params.config.center_freq,
                params.config.span,
                IF_BANDWIDTH,
                params.overlap,
            )
        });
        let scratch = match &feed {
            Feed::Raw(_) => vec![0.0; params.block_len],
            Feed::Sweep => Vec::new(),
        };
        Self {
            factory,
            params,
            feed,
            messages,
            flags,
            plan,
            accum: RunningAccumulator::new(),
            scratch,
            state: State::Configuring,
            cycles: 0,
            seq: 0,
            last_cal_temp: f64::NAN,
            rate_timer: Instant::now(),
        }
    }

    /// Long-lived stage loop. Clears `capture_active` on every exit path and
    /// flushes the accumulator so a clean shutdown loses no sweeps.
    pub fn run(mut self) -> Result<(), CaptureError> {
        let res = self.run_inner();
        if let Err(e) = &res {
            error!(%e, "capture stage terminating on structural error");
            let _ = self.messages.send(Message::status(StatusEvent::Error {
                message: e.to_string(),
            }));
        }
        if let Some(rec) = self.accum.flush() {
            let _ = self.messages.send(Message::Spectrum(rec));
        }
        self.flags.capture_done();
        info!("acquisition thread exiting");
        res
    }

    fn run_inner(&mut self) -> Result<(), CaptureError> {
        let mut inst = (self.factory)();
        info!("starting sweep logger");
        while self.flags.run() {
            match self.state {
                State::Configuring => match self.configure(inst.as_mut()) {
                    Ok(()) => self.state = State::Streaming,
                    Err(fault) => {
                        warn!(%fault, "configuration failed");
                        self.state = State::Faulted;
                    }
                },
                State::Streaming => {
                    self.state = self.cycle(inst.as_mut())?;
                }
                State::Faulted => {
                    let _ = self.messages.send(Message::status(StatusEvent::Error {
                        message: "device interface crashed, reinitializing".into(),
                    }));
                    error!("resetting hardware, completely re-initializing device interface");
                    let _ = inst.abort();
                    let _ = inst.close();
                    inst = (self.factory)();
                    self.state = State::Configuring;
                    thread::sleep(self.params.poll);
                }
            }
        }
        info!("stopping acquisition loop");
        let _ = inst.abort();
        let _ = inst.close();
        Ok(())
    }

    fn configure(&mut self, inst: &mut dyn Instrument) -> Result<(), crate::instrument::DeviceFault> {
        let mut cfg = self.params.config.clone();
        if let Some(plan) = &mut self.plan {
            cfg.center_freq = plan.advance();
            cfg.span = IF_BANDWIDTH;
        }
        inst.configure(&cfg)?;
        let kind = match self.feed {
            Feed::Sweep => AcqKind::RealTime,
            Feed::Raw(_) => AcqKind::RawPipe,
        };
        inst.initiate(kind)?;
        let info = inst.trace_info()?;
        debug!(?info, "acquisition configured");
        let _ = self.messages.send(Message::status(StatusEvent::Settings {
            config: cfg,
            bin_count: info.bin_count,
            bin_size: info.bin_size,
            start_freq: info.start_freq,
            averaging_interval: self.params.num_average,
        }));
        if self.last_cal_temp.is_nan() {
            self.last_cal_temp = inst.diagnostics()?.temperature;
        }
        Ok(())
    }

    /// One streaming cycle. Device faults come back as `Ok(State::Faulted)`;
    /// only structural errors (overrun, closed channel) propagate.
    fn cycle(&mut self, inst: &mut dyn Instrument) -> Result<State, CaptureError> {
        match &self.feed {
            Feed::Sweep => {
                let trace = match inst.fetch_trace() {
                    Ok(t) => t,
                    Err(fault) => {
                        error!(%fault, "I/O error in acquisition loop");
                        return Ok(State::Faulted);
                    }
                };
                let flushed = self.accum.absorb(
                    trace.start_freq,
                    trace.bin_size,
                    &trace.bins,
                    self.params.num_average,
                );
                for rec in flushed {
                    self.send(Message::Spectrum(rec))?;
                }
            }
            Feed::Raw(ring) => {
                if let Err(fault) = inst.fetch_raw(&mut self.scratch) {
                    error!(%fault, "I/O error in acquisition loop");
                    return Ok(State::Faulted);
                }
                let mut slot = match ring.acquire_write() {
                    Ok(slot) => slot,
                    Err(e) => {
                        error!(
                            pending = ring.pending(),
                            capacity = ring.capacity(),
                            %e,
                            "raw ring overran, try a bigger capacity or fewer stalls downstream"
                        );
                        return Err(e.into());
                    }
                };
                slot.seq = self.seq;
                slot.samples.copy_from_slice(&self.scratch);
                self.seq += 1;
            }
        }
        self.cycles += 1;

        if self.params.rate_log_cycles > 0 && self.cycles % self.params.rate_log_cycles == 0 {
            let elapsed = self.rate_timer.elapsed().as_secs_f64();
            let freq = self.params.rate_log_cycles as f64 / elapsed;
            match &self.feed {
                Feed::Raw(ring) => {
                    info!(elapsed, freq, pending = ring.pending(), "acquisition rate")
                }
                Feed::Sweep => info!(elapsed, freq, accumulated = self.accum.count(), "acquisition rate"),
            }
            self.rate_timer = Instant::now();
        }

        if self.plan.is_some()
            && self.params.bin_samples > 0
            && self.cycles % self.params.bin_samples == 0
        {
            debug!("retuning frontend");
            if let Err(fault) = inst.abort() {
                error!(%fault, "abort before retune failed");
                return Ok(State::Faulted);
            }
            return Ok(State::Configuring);
        }

        if self.params.cal_check_cycles > 0 && self.cycles % self.params.cal_check_cycles == 0 {
            let diags = match inst.diagnostics() {
                Ok(d) => d,
                Err(fault) => {
                    error!(%fault, "diagnostics readout failed");
                    return Ok(State::Faulted);
                }
            };
            self.send(Message::status(StatusEvent::Diagnostics(diags)))?;
            let drift = (diags.temperature - self.last_cal_temp).abs();
            if drift > TEMP_RECAL_THRESHOLD {
                warn!(
                    drift,
                    temperature = diags.temperature,
                    "temperature drift causes IF shifts, recalibrating"
                );
                self.send(Message::status(StatusEvent::Error {
                    message: "recalibrating IF after temperature drift".into(),
                }))?;
                if let Err(fault) = inst.self_calibrate() {
                    error!(%fault, "self-calibration failed");
                    return Ok(State::Faulted);
                }
                self.last_cal_temp = diags.temperature;
                return Ok(State::Configuring);
            }
            debug!(drift, "temperature drift under recal threshold, not recalibrating");
        }

        thread::sleep(self.params.poll);
        Ok(State::Streaming)
    }

    fn send(&self, msg: Message) -> Result<(), CaptureError> {
        self.messages.send(msg).map_err(|_| CaptureError::ChannelClosed)
    }
}
