//! Byte-stuffed framing for the serial link
//!
//! Each frame on the wire is `[SYNC][LEN][stuffed payload][CHECKSUM]` where
//! `LEN` is the stuffed payload length and
//! `CHECKSUM = (sum(stuffed bytes) + LEN) mod 256`. The payload is stuffed
//! so that the sync byte never appears inside a frame: `SYNC` becomes
//! `ESC, ESC_SYNC` and `ESC` becomes `ESC, ESC_ESC`.
//!
//! [`FrameDecoder`] is an incremental state machine: feed it whatever the
//! serial port returns, in chunks of any size, and collect completed
//! payloads. A frame that fails its checksum or carries a malformed escape
//! sequence is dropped and counted, and scanning resumes at the next sync
//! byte.

/// Frame start marker
pub const SYNC: u8 = 0x9A;
/// Escape marker inside a stuffed payload
pub const ESC: u8 = 0x9B;
/// Escape discriminator for a literal [`SYNC`]
pub const ESC_SYNC: u8 = 0x01;
/// Escape discriminator for a literal [`ESC`]
pub const ESC_ESC: u8 = 0x00;

/// Largest stuffed payload a single frame can carry (LEN is one byte)
pub const MAX_FRAME_PAYLOAD: usize = 255;

/// Stuff a raw payload so it contains no sync byte
pub fn stuff(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    for &b in payload {
        match b {
            SYNC => out.extend_from_slice(&[ESC, ESC_SYNC]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            other => out.push(other),
        }
    }
    out
}

/// Wrap a raw payload into a complete wire frame
///
/// Returns `None` when the stuffed payload exceeds the one-byte length
/// field. Callers size their packets well below this.
pub fn encode_frame(payload: &[u8]) -> Option<Vec<u8>> {
    let stuffed = stuff(payload);
    if stuffed.is_empty() || stuffed.len() > MAX_FRAME_PAYLOAD {
        return None;
    }
    let len = stuffed.len() as u8;
    let checksum = checksum(&stuffed, len);
    let mut frame = Vec::with_capacity(stuffed.len() + 3);
    frame.push(SYNC);
    frame.push(len);
    frame.extend_from_slice(&stuffed);
    frame.push(checksum);
    Some(frame)
}

fn checksum(stuffed: &[u8], len: u8) -> u8 {
    stuffed
        .iter()
        .fold(len as u32, |acc, &b| acc + b as u32)
        .to_le_bytes()[0]
}

fn unstuff(stuffed: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(stuffed.len());
    let mut iter = stuffed.iter();
    while let Some(&b) = iter.next() {
        match b {
            SYNC => return None,
            ESC => match iter.next() {
                Some(&ESC_SYNC) => out.push(SYNC),
                Some(&ESC_ESC) => out.push(ESC),
                _ => return None,
            },
            other => out.push(other),
        }
    }
    Some(out)
}

#[derive(Debug)]
enum DecodeState {
    /// Scanning for the sync byte
    Sync,
    /// Waiting for the length byte
    Len,
    /// Collecting `remaining` stuffed payload bytes
    Payload { len: u8, buf: Vec<u8> },
    /// Waiting for the checksum byte
    Checksum { len: u8, buf: Vec<u8> },
}

/// Incremental frame decoder
///
/// Tolerant of arbitrary chunking: bytes may arrive one at a time or many
/// frames at once. Completed payloads are queued internally and retrieved
/// with [`next_frame`](Self::next_frame).
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    ready: std::collections::VecDeque<Vec<u8>>,
    corrupt: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Sync,
            ready: std::collections::VecDeque::new(),
            corrupt: 0,
        }
    }

    /// Number of frames dropped for checksum or escape violations
    pub fn corrupt_frames(&self) -> u64 {
        self.corrupt
    }

    /// Feed a chunk of received bytes into the decoder
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push_byte(b);
        }
    }

    /// Take the next completed payload, if any
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        self.ready.pop_front()
    }

    fn push_byte(&mut self, byte: u8) {
        self.state = match std::mem::replace(&mut self.state, DecodeState::Sync) {
            DecodeState::Sync => {
                if byte == SYNC {
                    DecodeState::Len
                } else {
                    DecodeState::Sync
                }
            }
            DecodeState::Len => {
                if byte == 0 {
                    // Empty frames are not produced by any peer.
                    self.corrupt += 1;
                    DecodeState::Sync
                } else {
                    DecodeState::Payload {
                        len: byte,
                        buf: Vec::with_capacity(byte as usize),
                    }
                }
            }
            DecodeState::Payload { len, mut buf } => {
                buf.push(byte);
                if buf.len() == len as usize {
                    DecodeState::Checksum { len, buf }
                } else {
                    DecodeState::Payload { len, buf }
                }
            }
            DecodeState::Checksum { len, buf } => {
                if checksum(&buf, len) != byte {
                    tracing::warn!(len, "frame dropped: checksum mismatch");
                    self.corrupt += 1;
                } else {
                    match unstuff(&buf) {
                        Some(payload) => self.ready.push_back(payload),
                        None => {
                            tracing::warn!(len, "frame dropped: malformed escape sequence");
                            self.corrupt += 1;
                        }
                    }
                }
                DecodeState::Sync
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_stuffing_escapes_sync_and_esc() {
        assert_eq!(stuff(&[0x01, SYNC, 0x02]), vec![0x01, ESC, ESC_SYNC, 0x02]);
        assert_eq!(stuff(&[ESC]), vec![ESC, ESC_ESC]);
        assert_eq!(stuff(&[0x10, 0x20]), vec![0x10, 0x20]);
    }

    #[test]
    fn test_encode_frame_layout() {
        // payload [0xFF, 0x00] needs no stuffing
        let frame = encode_frame(&[0xFF, 0x00]).unwrap();
        assert_eq!(frame[0], SYNC);
        assert_eq!(frame[1], 2);
        assert_eq!(&frame[2..4], &[0xFF, 0x00]);
        assert_eq!(frame[4], (0xFFu32 + 0x00 + 2).to_le_bytes()[0]);
    }

    #[test]
    fn test_decoder_reassembles_across_chunks() {
        let frame = encode_frame(&[0xFF, SYNC, ESC, 0x42]).unwrap();
        let mut decoder = FrameDecoder::new();
        // one byte at a time
        for &b in &frame {
            decoder.push_bytes(&[b]);
        }
        assert_eq!(decoder.next_frame().unwrap(), vec![0xFF, SYNC, ESC, 0x42]);
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.corrupt_frames(), 0);
    }

    #[test]
    fn test_decoder_drops_corrupted_checksum_and_recovers() {
        let mut bad = encode_frame(&[0xFF, 0x01, 0x02]).unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0xA5;
        let good = encode_frame(&[0xFE, 0x22]).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push_bytes(&bad);
        decoder.push_bytes(&good);
        assert_eq!(decoder.next_frame().unwrap(), vec![0xFE, 0x22]);
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.corrupt_frames(), 1);
    }

    #[test]
    fn test_decoder_drops_malformed_escape() {
        // Stuffed payload ending in a bare ESC with a checksum that matches.
        let stuffed = [0x11, ESC];
        let len = stuffed.len() as u8;
        let checksum = super::checksum(&stuffed, len);
        let mut wire = vec![SYNC, len];
        wire.extend_from_slice(&stuffed);
        wire.push(checksum);

        let mut decoder = FrameDecoder::new();
        decoder.push_bytes(&wire);
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.corrupt_frames(), 1);
    }

    #[test]
    fn test_decoder_skips_interframe_noise() {
        let frame = encode_frame(&[0xFD, 0x00]).unwrap();
        let mut wire = vec![0x00, 0x55, 0x13];
        wire.extend_from_slice(&frame);
        let mut decoder = FrameDecoder::new();
        decoder.push_bytes(&wire);
        assert_eq!(decoder.next_frame().unwrap(), vec![0xFD, 0x00]);
    }

    proptest! {
        #[test]
        fn prop_frame_round_trip(payload in proptest::collection::vec(any::<u8>(), 1..100)) {
            let frame = encode_frame(&payload).unwrap();
            let mut decoder = FrameDecoder::new();
            decoder.push_bytes(&frame);
            prop_assert_eq!(decoder.next_frame().unwrap(), payload);
            prop_assert_eq!(decoder.corrupt_frames(), 0);
        }
    }
}
