//! Frame transport over a byte-stream link
//!
//! This module owns everything between raw serial bytes and whole XCP
//! packets. The [`Link`] trait abstracts the byte stream so tests can run
//! against an in-process slave ([`MockSlave`](mock::MockSlave)) while
//! production uses a real serial port ([`SerialLink`](serial::SerialLink)).
//!
//! [`FrameTransport`] spawns a listener thread on start. The listener
//! busy-polls the link (with a short sleep when idle), feeds every received
//! chunk through the incremental [`FrameDecoder`](framing::FrameDecoder),
//! timestamps accepted frames, and routes them by their first byte:
//! command responses (`0xFF` positive, `0xFE` error) go to the response
//! queue, everything else is slave-initiated DAQ data and goes to the DAQ
//! queue. Corrupt frames are dropped without advancing the receive counter.

pub mod framing;
pub mod mock;
pub mod serial;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};

use crate::error::{Result, XcpError};

/// First byte of a positive command response
pub const PID_RES: u8 = 0xFF;
/// First byte of a slave error packet
pub const PID_ERR: u8 = 0xFE;

/// A byte-stream link to the slave
///
/// Implementations must be safe to hand to the listener thread; all access
/// is serialized through one mutex, so `&mut self` methods suffice.
pub trait Link: Send {
    /// Read up to `buf.len()` bytes, returning how many were read
    ///
    /// May return 0 when nothing is pending; must not block indefinitely.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write the whole buffer
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Number of bytes that can be read without blocking
    fn bytes_available(&mut self) -> Result<usize>;

    /// Flush buffered output to the wire
    fn flush(&mut self) -> Result<()>;
}

/// A received packet with its arrival timestamp
#[derive(Debug, Clone)]
pub struct TimedFrame {
    /// Unstuffed packet payload
    pub payload: Vec<u8>,
    /// Arrival time, monotonic offset applied to a wall-clock origin
    pub timestamp: DateTime<Utc>,
}

/// Frame-level transport with a background listener thread
pub struct FrameTransport {
    link: Arc<Mutex<Box<dyn Link>>>,
    resp_rx: Receiver<TimedFrame>,
    daq_rx: Option<Receiver<TimedFrame>>,
    shutdown: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    frames_received: Arc<AtomicU64>,
    frames_corrupt: Arc<AtomicU64>,
}

impl FrameTransport {
    /// Start the transport over `link`, spawning the listener thread
    pub fn start(link: Box<dyn Link>) -> Result<Self> {
        let link = Arc::new(Mutex::new(link));
        // Command responses arrive one per request; a small bound is ample.
        let (resp_tx, resp_rx) = bounded(32);
        // DAQ frames stream continuously. The queue is unbounded: if the
        // decode loop falls behind a fast slave, memory grows until it
        // catches up.
        let (daq_tx, daq_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let frames_received = Arc::new(AtomicU64::new(0));
        let frames_corrupt = Arc::new(AtomicU64::new(0));

        let listener = {
            let link = Arc::clone(&link);
            let shutdown = Arc::clone(&shutdown);
            let frames_received = Arc::clone(&frames_received);
            let frames_corrupt = Arc::clone(&frames_corrupt);
            std::thread::Builder::new()
                .name("xcp-listener".into())
                .spawn(move || {
                    listener_loop(
                        link,
                        resp_tx,
                        daq_tx,
                        shutdown,
                        frames_received,
                        frames_corrupt,
                    );
                })
                .map_err(|e| XcpError::Link(format!("failed to spawn listener: {}", e)))?
        };

        Ok(Self {
            link,
            resp_rx,
            daq_rx: Some(daq_rx),
            shutdown,
            listener: Some(listener),
            frames_received,
            frames_corrupt,
        })
    }

    /// Take the DAQ frame receiver (available exactly once)
    pub fn take_daq_receiver(&mut self) -> Option<Receiver<TimedFrame>> {
        self.daq_rx.take()
    }

    /// Send one packet, framed and stuffed
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let frame = framing::encode_frame(payload)
            .ok_or_else(|| XcpError::Link(format!("packet of {} bytes unframeable", payload.len())))?;
        let mut link = self
            .link
            .lock()
            .map_err(|_| XcpError::Link("link mutex poisoned".into()))?;
        link.write_all(&frame)?;
        link.flush()
    }

    /// Send a command packet and wait for the matching response
    ///
    /// Stale responses left over from a timed-out predecessor are drained
    /// first. The caller serializes requests; interleaved calls would pair
    /// responses with the wrong command.
    pub fn request(&self, payload: &[u8], timeout: Duration) -> Result<TimedFrame> {
        while self.resp_rx.try_recv().is_ok() {}
        self.send(payload)?;
        self.resp_rx.recv_timeout(timeout).map_err(|_| {
            XcpError::Timeout(format!(
                "no response to command 0x{:02X} within {:?}",
                payload.first().copied().unwrap_or(0),
                timeout
            ))
        })
    }

    /// Total accepted frames since start
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Total frames dropped for checksum or escape violations
    pub fn frames_corrupt(&self) -> u64 {
        self.frames_corrupt.load(Ordering::Relaxed)
    }

    /// Stop the listener thread and release the link
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.listener.take() {
            if handle.join().is_err() {
                tracing::warn!("listener thread panicked during shutdown");
            }
        }
    }
}

impl Drop for FrameTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn listener_loop(
    link: Arc<Mutex<Box<dyn Link>>>,
    resp_tx: Sender<TimedFrame>,
    daq_tx: Sender<TimedFrame>,
    shutdown: Arc<AtomicBool>,
    frames_received: Arc<AtomicU64>,
    frames_corrupt: Arc<AtomicU64>,
) {
    let origin_wall = Utc::now();
    let origin_instant = Instant::now();
    let mut decoder = framing::FrameDecoder::new();
    let mut buf = [0u8; 256];

    while !shutdown.load(Ordering::Relaxed) {
        let read = {
            let mut link = match link.lock() {
                Ok(link) => link,
                Err(_) => {
                    tracing::error!("link mutex poisoned, listener exiting");
                    return;
                }
            };
            match link.bytes_available() {
                Ok(0) => 0,
                Ok(_) => match link.read(&mut buf) {
                    Ok(n) => n,
                    Err(e) => {
                        tracing::error!(error = %e, "link read failed, listener exiting");
                        return;
                    }
                },
                Err(e) => {
                    tracing::error!(error = %e, "link poll failed, listener exiting");
                    return;
                }
            }
        };

        if read == 0 {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        decoder.push_bytes(&buf[..read]);
        frames_corrupt.store(decoder.corrupt_frames(), Ordering::Relaxed);

        while let Some(payload) = decoder.next_frame() {
            frames_received.fetch_add(1, Ordering::Relaxed);
            // Stamped per frame, so frames sharing one read chunk still
            // carry non-decreasing timestamps in arrival order.
            let timestamp = origin_wall
                + chrono::Duration::from_std(origin_instant.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero());
            let frame = TimedFrame { payload, timestamp };
            let is_response = matches!(frame.payload.first(), Some(&PID_RES) | Some(&PID_ERR));
            if is_response {
                match resp_tx.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!("response queue full, frame dropped");
                    }
                    // Owner dropped the transport, exit quietly.
                    Err(TrySendError::Disconnected(_)) => return,
                }
            } else if daq_tx.send(frame).is_err() {
                return;
            }
        }
    }
}
