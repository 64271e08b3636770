// src/protocol/frame.rs

//! Incremental parser for `KIND <len> <payload>` frames.
//!
//! Bytes arrive in arbitrary chunks from the socket; [`FrameParser`] buffers
//! them and yields complete frames. A malformed header is reported once and
//! skipped, so the caller can log it and keep reading.

use thiserror::Error;

/// Longest header (`KIND <len> `) accepted before giving up on a frame.
pub const MAX_HEADER_LEN: usize = 1024;

/// Largest payload accepted from the viewer (64 MB).
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Frame starts the parser resynchronises on after a malformed header.
const FRAME_STARTS: &[&[u8]] = &[
    b"NEWGREETING ",
    b"GREETING ",
    b"MESSAGE ",
    b"PING ",
    b"PONG ",
    b"PIXELTILE(",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame kind is not printable ASCII: {0:?}")]
    BadKind(String),
    #[error("invalid frame length {0:?}")]
    BadLength(String),
    #[error("frame header longer than {MAX_HEADER_LEN} bytes")]
    HeaderTooLong,
    #[error("frame payload of {0} bytes exceeds {MAX_PAYLOAD_LEN}")]
    PayloadTooLarge(usize),
}

/// One complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: String,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[derive(Debug, Default)]
pub struct FrameParser {
    buf: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame, `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let leading = self
            .buf
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        self.buf.drain(..leading);

        let Some(kind_end) = self.buf.iter().position(|&b| b == b' ') else {
            if self.buf.len() > MAX_HEADER_LEN {
                self.resync();
                return Err(FrameError::HeaderTooLong);
            }
            return Ok(None);
        };

        let kind_bytes = &self.buf[..kind_end];
        if !kind_bytes.iter().all(|b| b.is_ascii_graphic()) {
            let kind = String::from_utf8_lossy(kind_bytes).into_owned();
            self.resync();
            return Err(FrameError::BadKind(kind));
        }

        let len_start = kind_end + 1;
        let Some(len_end) = self.buf[len_start..]
            .iter()
            .position(|&b| b == b' ')
            .map(|p| p + len_start)
        else {
            if self.buf.len() > MAX_HEADER_LEN {
                self.resync();
                return Err(FrameError::HeaderTooLong);
            }
            return Ok(None);
        };

        let len_text = String::from_utf8_lossy(&self.buf[len_start..len_end]).into_owned();
        let len = match len_text.parse::<usize>() {
            Ok(len) => len,
            Err(_) => {
                self.resync();
                return Err(FrameError::BadLength(len_text));
            }
        };
        if len > MAX_PAYLOAD_LEN {
            self.resync();
            return Err(FrameError::PayloadTooLarge(len));
        }

        let payload_start = len_end + 1;
        if self.buf.len() < payload_start + len {
            return Ok(None);
        }

        let kind = String::from_utf8_lossy(&self.buf[..kind_end]).into_owned();
        let payload = self.buf[payload_start..payload_start + len].to_vec();
        self.buf.drain(..payload_start + len);
        Ok(Some(Frame { kind, payload }))
    }

    /// Drops bytes up to the next recognisable frame start after the current
    /// one. A trailing partial frame start is kept for the next read.
    fn resync(&mut self) {
        let next = FRAME_STARTS
            .iter()
            .filter_map(|start| {
                self.buf
                    .get(1..)?
                    .windows(start.len())
                    .position(|w| w == *start)
                    .map(|p| p + 1)
            })
            .min();
        let cut = next.unwrap_or_else(|| {
            (1..self.buf.len())
                .find(|&i| FRAME_STARTS.iter().any(|s| s.starts_with(&self.buf[i..])))
                .unwrap_or(self.buf.len())
        });
        self.buf.drain(..cut);
    }
}

/// Inbound frames the client reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Handshake acknowledgement; only its presence matters.
    Greeting,
    /// Keep-alive; must be answered with [`super::PONG`].
    Ping,
    /// Result of a `RETURNEVENT` evaluation.
    Return(String),
    /// Remote-initiated teardown.
    Disconnect,
    /// Any other message or frame kind.
    Other(Frame),
}

impl From<Frame> for Inbound {
    fn from(frame: Frame) -> Self {
        let text = frame.payload_text().into_owned();
        if frame.kind.contains("DISCONNECT") || text.contains("DISCONNECT") {
            return Inbound::Disconnect;
        }
        match frame.kind.as_str() {
            "GREETING" | "NEWGREETING" => Inbound::Greeting,
            "PING" => Inbound::Ping,
            "MESSAGE" if text == "RETURN" || text.starts_with("RETURN ") => {
                let value = text["RETURN".len()..].trim().to_string();
                Inbound::Return(value)
            }
            _ => Inbound::Other(frame),
        }
    }
}
