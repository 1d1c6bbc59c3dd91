/*!
Resynchronizing frame decoder.

The sensor interleaves two frame types on one stream:

```text
Data:   AA FF 03 00 | 24-byte payload           | 55 CC
Config: FD FC FB FA | len (u16 LE) | len bytes  | 04 03 02 01
```

The decoder is resumable across calls. It never blocks: when not enough
bytes are available it returns and continues from the same position on the
next call, without re-reading or dropping anything it already consumed.
*/

use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{RadarError, Result};
use crate::protocol::{
    CONFIG_HEADER, CONFIG_TRAILER, DATA_FRAME_BODY_SIZE, DATA_HEADER, DATA_PAYLOAD_SIZE, DATA_TRAILER,
    MAX_CONFIG_PAYLOAD_SIZE,
};
use crate::transport::Transport;

/// Which header a partial match belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Config,
}

impl FrameKind {
    fn header(self) -> &'static [u8; 4] {
        match self {
            FrameKind::Data => &DATA_HEADER,
            FrameKind::Config => &CONFIG_HEADER,
        }
    }

    fn from_first_byte(byte: u8) -> Option<Self> {
        if byte == DATA_HEADER[0] {
            Some(FrameKind::Data)
        } else if byte == CONFIG_HEADER[0] {
            Some(FrameKind::Config)
        } else {
            None
        }
    }
}

/// Decoder state, preserved between calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Scanning for the first byte of either header
    Searching,
    /// First `matched` header bytes of `kind` have been consumed
    HeaderMatching { kind: FrameKind, matched: usize },
    /// Waiting for the 26-byte data body
    AccumulatingData,
    /// Waiting for the length field (`None`) or for `length + 4` bytes
    AccumulatingConfig { length: Option<usize> },
}

/// A complete, trailer-validated frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Periodic target report (3 x 8 bytes)
    Data([u8; DATA_PAYLOAD_SIZE]),
    /// Acknowledgement of a configuration command (at most 20 bytes)
    Config(Vec<u8>),
}

/// Decoder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    pub data_frames: u64,
    pub config_frames: u64,
    pub header_mismatches: u64,
    pub trailer_errors: u64,
    pub bytes_skipped: u64,
}

/// Frame decoder engine
pub struct FrameDecoder {
    state: DecoderState,
    stats: DecoderStats,
}

impl FrameDecoder {
    /// Create a new decoder in the searching state
    pub fn new() -> Self {
        Self {
            state: DecoderState::Searching,
            stats: DecoderStats::default(),
        }
    }

    /// Get current state
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Get statistics
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Drop any partial frame and resume scanning
    pub fn reset(&mut self) {
        self.state = DecoderState::Searching;
    }

    /// Advance the decoder with whatever the transport has available.
    /// Returns at most one frame; call again until `None` to drain.
    pub fn poll<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<Option<Frame>> {
        loop {
            match self.state {
                DecoderState::Searching => {
                    let Some(byte) = transport.read_byte() else {
                        return Ok(None);
                    };
                    self.scan_byte(byte);
                }

                DecoderState::HeaderMatching { kind, matched } => {
                    let Some(byte) = transport.read_byte() else {
                        return Ok(None);
                    };
                    if byte == kind.header()[matched] {
                        self.state = if matched + 1 == kind.header().len() {
                            trace!("Matched {:?} header", kind);
                            match kind {
                                FrameKind::Data => DecoderState::AccumulatingData,
                                FrameKind::Config => DecoderState::AccumulatingConfig { length: None },
                            }
                        } else {
                            DecoderState::HeaderMatching { kind, matched: matched + 1 }
                        };
                    } else {
                        // The matched prefix is forfeited; the offending byte may still open a header
                        self.stats.header_mismatches += 1;
                        self.stats.bytes_skipped += matched as u64;
                        trace!("{} after {} bytes of {:?} header", RadarError::MalformedHeader, matched, kind);
                        self.state = DecoderState::Searching;
                        self.scan_byte(byte);
                    }
                }

                DecoderState::AccumulatingData => {
                    if transport.available() < DATA_FRAME_BODY_SIZE {
                        return Ok(None);
                    }
                    let mut body = [0u8; DATA_FRAME_BODY_SIZE];
                    transport.read_exact(&mut body)?;
                    self.state = DecoderState::Searching;

                    if body[DATA_PAYLOAD_SIZE..] != DATA_TRAILER {
                        self.reject_trailer(&body[DATA_PAYLOAD_SIZE..], body.len());
                        continue;
                    }

                    let mut payload = [0u8; DATA_PAYLOAD_SIZE];
                    payload.copy_from_slice(&body[..DATA_PAYLOAD_SIZE]);
                    self.stats.data_frames += 1;
                    return Ok(Some(Frame::Data(payload)));
                }

                DecoderState::AccumulatingConfig { length: None } => {
                    if transport.available() < 2 {
                        return Ok(None);
                    }
                    let mut raw = [0u8; 2];
                    transport.read_exact(&mut raw)?;
                    let length = (u16::from_le_bytes(raw) as usize).min(MAX_CONFIG_PAYLOAD_SIZE);
                    self.state = DecoderState::AccumulatingConfig { length: Some(length) };
                }

                DecoderState::AccumulatingConfig { length: Some(length) } => {
                    let total = length + CONFIG_TRAILER.len();
                    if transport.available() < total {
                        return Ok(None);
                    }
                    let mut body = vec![0u8; total];
                    transport.read_exact(&mut body)?;
                    self.state = DecoderState::Searching;

                    if body[length..] != CONFIG_TRAILER {
                        self.reject_trailer(&body[length..], total);
                        continue;
                    }

                    body.truncate(length);
                    self.stats.config_frames += 1;
                    debug!("Config frame: {}", hex::encode(&body));
                    return Ok(Some(Frame::Config(body)));
                }
            }
        }
    }

    fn scan_byte(&mut self, byte: u8) {
        match FrameKind::from_first_byte(byte) {
            Some(kind) => self.state = DecoderState::HeaderMatching { kind, matched: 1 },
            None => self.stats.bytes_skipped += 1,
        }
    }

    fn reject_trailer(&mut self, trailer: &[u8], frame_len: usize) {
        self.stats.trailer_errors += 1;
        self.stats.bytes_skipped += frame_len as u64;
        debug!("{} (discarded {} bytes)", RadarError::MalformedTrailer(trailer.to_vec()), frame_len);
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
