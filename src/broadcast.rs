//! Broadcast stage: republishes the record stream to at most one connected
//! TCP viewer, best-effort and lossy by design.
//!
//! Frames are length-prefixed: the old delimiter-only scheme was ambiguous
//! whenever the payload could contain the delimiter bytes. The `BEGIN_DATA`
//! marker is kept purely as a resynchronization point for a receiver that
//! joins (or corrupts) mid-stream.

use std::{
    io::{self, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{flags::ControlFlags, SpectrumRecord};

pub const FRAME_MARKER: &[u8; 10] = b"BEGIN_DATA";

/// Anything claiming to be bigger than this is treated as a corrupt length
/// prefix and resynced past
pub const MAX_FRAME_BYTES: usize = 1 << 26;

const TX_TIMEOUT: Duration = Duration::from_secs(5);

/// What goes over the wire for each record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedPayload {
    pub start_freq: f64,
    pub bin_size: f64,
    pub num_bins: u32,
    pub bins: Vec<f64>,
}

impl From<&SpectrumRecord> for FeedPayload {
    fn from(rec: &SpectrumRecord) -> Self {
        Self {
            start_freq: rec.start_freq,
            bin_size: rec.bin_size,
            num_bins: rec.bins.len() as u32,
            bins: rec.bins.clone(),
        }
    }
}

/// Marker + little-endian `u32` payload length + JSON payload
pub fn encode_frame(payload: &FeedPayload) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(payload)?;
    let mut frame = Vec::with_capacity(FRAME_MARKER.len() + 4 + body.len());
    frame.extend_from_slice(FRAME_MARKER);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Incremental receiver-side parser. Feed it arbitrary chunks; it yields each
/// complete payload and discards anything that does not sit behind a marker.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<FeedPayload> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        loop {
            let pos = match find_marker(&self.buf) {
                Some(pos) => pos,
                None => {
                    // No marker: drop everything that can no longer begin one
                    if self.buf.len() >= FRAME_MARKER.len() {
                        let cut = self.buf.len() - (FRAME_MARKER.len() - 1);
                        warn!(dropped = cut, "discarding unframed bytes");
                        self.buf.drain(..cut);
                    }
                    break;
                }
            };
            if pos > 0 {
                warn!(dropped = pos, "discarding partial fragment before marker");
                self.buf.drain(..pos);
            }
            if self.buf.len() < FRAME_MARKER.len() + 4 {
                break;
            }
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&self.buf[FRAME_MARKER.len()..FRAME_MARKER.len() + 4]);
            let body_len = u32::from_le_bytes(raw) as usize;
            if body_len > MAX_FRAME_BYTES {
                warn!(body_len, "implausible frame length, resyncing");
                self.buf.drain(..FRAME_MARKER.len());
                continue;
            }
            let total = FRAME_MARKER.len() + 4 + body_len;
            if self.buf.len() < total {
                break;
            }
            match serde_json::from_slice(&self.buf[FRAME_MARKER.len() + 4..total]) {
                Ok(payload) => out.push(payload),
                Err(e) => warn!(%e, "dropping undecodable frame"),
            }
            self.buf.drain(..total);
        }
        out
    }
}

fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_MARKER.len())
        .position(|w| w == FRAME_MARKER)
}

pub struct Broadcast {
    listener: TcpListener,
    feed: Receiver<SpectrumRecord>,
    flags: Arc<ControlFlags>,
    poll: Duration,
}

impl Broadcast {
    pub fn bind(
        addr: impl ToSocketAddrs,
        feed: Receiver<SpectrumRecord>,
        flags: Arc<ControlFlags>,
        poll: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!(addr = %listener.local_addr()?, "broadcast listening");
        Ok(Self {
            listener,
            feed,
            flags,
            poll,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Long-lived stage loop. Connection errors are always recovered locally
    /// by dropping the viewer; the loop ends when the upstream feed hangs up.
    pub fn run(self) {
        let mut client: Option<TcpStream> = None;
        loop {
            if client.is_none() {
                match self.listener.accept() {
                    Ok((stream, peer)) => {
                        info!(%peer, "viewer connected");
                        let usable = stream.set_nonblocking(false).is_ok()
                            && stream.set_write_timeout(Some(TX_TIMEOUT)).is_ok();
                        if usable {
                            client = Some(stream);
                        } else {
                            warn!(%peer, "could not configure viewer socket, dropping");
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => warn!(%e, "accept failed"),
                }
            }
            match self.feed.recv_timeout(self.poll) {
                // Without a viewer the record is simply discarded; that is
                // what keeps the channel from growing while unconnected
                Ok(rec) => {
                    if let Some(stream) = client.as_mut() {
                        match encode_frame(&FeedPayload::from(&rec)) {
                            Ok(frame) => {
                                if let Err(e) = stream.write_all(&frame) {
                                    warn!(%e, "transmit failed, closing viewer connection");
                                    client = None;
                                }
                            }
                            Err(e) => error!(%e, "payload serialization failed"),
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if !self.flags.run() && !self.flags.persist_active() && self.feed.is_empty() {
                break;
            }
        }
        self.flags.broadcast_done();
        info!("broadcast thread exiting");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn payload(bins: &[f64]) -> FeedPayload {
        FeedPayload {
            start_freq: 100.0,
            bin_size: 2.5,
            num_bins: bins.len() as u32,
            bins: bins.to_vec(),
        }
    }

    #[test]
    fn round_trips_across_arbitrary_chunk_boundaries() {
        let payloads = [payload(&[1.0, 2.0]), payload(&[3.0]), payload(&[4.0, 5.0, 6.0])];
        let mut stream = Vec::new();
        for p in &payloads {
            stream.extend(encode_frame(p).unwrap());
        }
        for chunk in [1usize, 3, 7, 11] {
            let mut parser = FrameParser::new();
            let mut got = Vec::new();
            for piece in stream.chunks(chunk) {
                got.extend(parser.push(piece));
            }
            assert_eq!(got, payloads);
        }
    }

    #[test]
    fn discards_corrupt_prefix_and_resyncs() {
        let p = payload(&[7.0]);
        let mut bytes = b"partial garbage from a torn frame".to_vec();
        bytes.extend(encode_frame(&p).unwrap());
        let mut parser = FrameParser::new();
        assert_eq!(parser.push(&bytes), vec![p]);
    }

    #[test]
    fn implausible_length_does_not_wedge_the_parser() {
        let p = payload(&[8.0]);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(FRAME_MARKER);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend(encode_frame(&p).unwrap());
        let mut parser = FrameParser::new();
        assert_eq!(parser.push(&bytes), vec![p]);
    }

    #[test]
    fn undecodable_body_is_dropped_but_later_frames_survive() {
        let p = payload(&[9.0]);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(FRAME_MARKER);
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(b"!!!!");
        bytes.extend(encode_frame(&p).unwrap());
        let mut parser = FrameParser::new();
        assert_eq!(parser.push(&bytes), vec![p]);
    }

    #[test]
    fn serves_one_viewer_over_tcp() {
        let (tx, rx) = crossbeam_channel::bounded(8);
        let flags = Arc::new(ControlFlags::new());
        let server = Broadcast::bind(
            "127.0.0.1:0",
            rx,
            Arc::clone(&flags),
            Duration::from_millis(1),
        )
        .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = std::thread::spawn(move || server.run());

        let mut viewer = TcpStream::connect(addr).unwrap();
        viewer
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let rec = SpectrumRecord {
            timestamp: 1.0,
            start_freq: 100.0,
            bin_size: 2.5,
            count: 3,
            bins: vec![1.0, 2.0, 3.0],
        };

        let mut parser = FrameParser::new();
        let mut got = Vec::new();
        let mut buf = [0u8; 4096];
        for _ in 0..500 {
            // Records sent before the accept lands are discarded, so keep
            // offering them until one makes it through
            let _ = tx.try_send(rec.clone());
            match viewer.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => got.extend(parser.push(&buf[..n])),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => panic!("viewer read failed: {e}"),
            }
            if !got.is_empty() {
                break;
            }
        }
        assert_eq!(got[0], FeedPayload::from(&rec));

        drop(tx);
        handle.join().unwrap();
        assert!(!flags.broadcast_active());
    }
}
