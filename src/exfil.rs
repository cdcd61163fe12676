//! Aggregation and persistence: drains the transformed record stream, applies
//! the second level of temporal averaging when configured to, and appends
//! durable rows plus a side log of status events.
//!
//! Row rate is bounded by the averaging window (a few Hz at most), so every
//! row is flushed as it lands. Storage I/O errors are terminal for this
//! stage: a failed write is never silently retried into another file.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use byte_slice_cast::AsByteSlice;
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::{
    average::RunningAccumulator, flags::ControlFlags, ring::RingBuffer, Message, SpectrumRecord,
    StatusEvent,
};

#[derive(Debug, Error)]
pub enum ExfilError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One side-log entry as stored on disk
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub timestamp: f64,
    pub event: StatusEvent,
}

#[derive(Serialize)]
struct EventRowRef<'a> {
    timestamp: f64,
    event: &'a StatusEvent,
}

/// Writes the pair of append-only logs for one rotation interval: host-endian
/// binary sweep rows and JSON-lines status events.
///
/// Row layout: `timestamp f64, start_freq f64, bin_size f64, count u32,
/// bin_count u32, bins f64 * bin_count`.
pub struct SweepWriter {
    data: BufWriter<File>,
    events: BufWriter<File>,
    data_path: PathBuf,
    opened: Instant,
}

impl SweepWriter {
    pub fn create(dir: &Path) -> Result<Self, ExfilError> {
        fs::create_dir_all(dir)?;
        let stamp = Utc::now().format("%Y-%m-%d-%H-%M-%S%.3f");
        let data_path = dir.join(format!("sweeps-{stamp}.dat"));
        let events_path = dir.join(format!("events-{stamp}.jsonl"));
        info!(data = %data_path.display(), events = %events_path.display(), "logging data");
        Ok(Self {
            data: BufWriter::new(File::create(&data_path)?),
            events: BufWriter::new(File::create(events_path)?),
            data_path,
            opened: Instant::now(),
        })
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }

    pub fn append_record(&mut self, rec: &SpectrumRecord) -> Result<(), ExfilError> {
        self.data
            .write_all([rec.timestamp, rec.start_freq, rec.bin_size].as_byte_slice())?;
        self.data
            .write_all([rec.count, rec.bins.len() as u32].as_byte_slice())?;
        self.data.write_all(rec.bins.as_byte_slice())?;
        // Flush early, flush often
        self.data.flush()?;
        Ok(())
    }

    pub fn append_event(&mut self, timestamp: f64, event: &StatusEvent) -> Result<(), ExfilError> {
        serde_json::to_writer(&mut self.events, &EventRowRef { timestamp, event })?;
        self.events.write_all(b"\n")?;
        self.events.flush()?;
        Ok(())
    }
}

/// Read a sweep-row file back. Tooling/test helper for the format
/// [`SweepWriter`] emits.
pub fn read_records(path: &Path) -> Result<Vec<SpectrumRecord>, ExfilError> {
    let bytes = fs::read(path)?;
    let mut out = Vec::new();
    let mut off = 0usize;
    let eof = || {
        ExfilError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "truncated sweep row",
        ))
    };
    while off < bytes.len() {
        if bytes.len() - off < 32 {
            return Err(eof());
        }
        let f64_at = |o: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[o..o + 8]);
            f64::from_ne_bytes(raw)
        };
        let timestamp = f64_at(off);
        let start_freq = f64_at(off + 8);
        let bin_size = f64_at(off + 16);
        let u32_at = |o: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[o..o + 4]);
            u32::from_ne_bytes(raw)
        };
        let count = u32_at(off + 24);
        let bin_count = u32_at(off + 28) as usize;
        off += 32;
        if bytes.len() - off < bin_count * 8 {
            return Err(eof());
        }
        let bins = bytes[off..off + bin_count * 8]
            .chunks_exact(8)
            .map(|c| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(c);
                f64::from_ne_bytes(raw)
            })
            .collect();
        off += bin_count * 8;
        out.push(SpectrumRecord {
            timestamp,
            start_freq,
            bin_size,
            count,
            bins,
        });
    }
    Ok(out)
}

/// Read an event side-log back
pub fn read_events(path: &Path) -> Result<Vec<EventRow>, ExfilError> {
    let text = fs::read_to_string(path)?;
    text.lines()
        .map(|line| serde_json::from_str(line).map_err(ExfilError::from))
        .collect()
}

#[derive(Clone, Debug)]
pub struct ExfilParams {
    pub out_dir: PathBuf,
    pub rotate_every: Duration,
    /// `Some(n)`: this stage performs the temporal averaging (raw deployment);
    /// `None`: records arrive pre-averaged and are stored one row each
    pub num_average: Option<u32>,
    pub poll: Duration,
}

pub struct Exfil {
    params: ExfilParams,
    messages: Receiver<Message>,
    transformed: Option<Arc<RingBuffer<SpectrumRecord>>>,
    feed: Sender<SpectrumRecord>,
    flags: Arc<ControlFlags>,
    accum: RunningAccumulator,
}

impl Exfil {
    pub fn new(
        params: ExfilParams,
        messages: Receiver<Message>,
        transformed: Option<Arc<RingBuffer<SpectrumRecord>>>,
        feed: Sender<SpectrumRecord>,
        flags: Arc<ControlFlags>,
    ) -> Self {
        Self {
            params,
            messages,
            transformed,
            feed,
            flags,
            accum: RunningAccumulator::new(),
        }
    }

    /// Long-lived stage loop; clears `persist_active` on every exit path
    pub fn run(mut self) -> Result<(), ExfilError> {
        let res = self.run_inner();
        if let Err(e) = &res {
            error!(%e, "persistence stage terminating");
        }
        self.flags.persist_done();
        info!("log thread exiting");
        res
    }

    fn run_inner(&mut self) -> Result<(), ExfilError> {
        let mut writer = SweepWriter::create(&self.params.out_dir)?;
        let mut disconnected = false;
        loop {
            let mut progress = false;
            match self.messages.try_recv() {
                Ok(Message::Spectrum(rec)) => {
                    self.take_record(&mut writer, rec)?;
                    progress = true;
                }
                Ok(Message::Status { timestamp, event }) => {
                    info!(?event, "status message");
                    writer.append_event(timestamp, &event)?;
                    progress = true;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => disconnected = true,
            }
            // Clone out of the slot so its lock is released before the
            // record is processed
            let pulled = self
                .transformed
                .as_ref()
                .and_then(|ring| ring.acquire_read().map(|slot| slot.clone()));
            if let Some(rec) = pulled {
                self.take_record(&mut writer, rec)?;
                progress = true;
            }
            if writer.age() >= self.params.rotate_every {
                writer = SweepWriter::create(&self.params.out_dir)?;
            }
            if !progress {
                let channel_done =
                    disconnected || (!self.flags.capture_active() && self.messages.is_empty());
                let ring_done = match &self.transformed {
                    None => true,
                    Some(ring) => !self.flags.transform_active() && ring.pending() == 0,
                };
                if channel_done && ring_done {
                    // Whatever is mid-average gets its own final row
                    if let Some(rec) = self.accum.flush() {
                        self.store(&mut writer, rec)?;
                    }
                    break;
                }
                thread::sleep(self.params.poll);
            }
        }
        Ok(())
    }

    fn take_record(&mut self, writer: &mut SweepWriter, rec: SpectrumRecord) -> Result<(), ExfilError> {
        match self.params.num_average {
            Some(target) => {
                let flushed = self.accum.absorb(rec.start_freq, rec.bin_size, &rec.bins, target);
                for rec in flushed {
                    self.store(writer, rec)?;
                }
            }
            None => self.store(writer, rec)?,
        }
        Ok(())
    }

    fn store(&mut self, writer: &mut SweepWriter, rec: SpectrumRecord) -> Result<(), ExfilError> {
        writer.append_record(&rec)?;
        // Best-effort live feed; a full channel just drops the record
        let _ = self.feed.try_send(rec);
        Ok(())
    }
}
