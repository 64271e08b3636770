// src/protocol/encoder.rs

//! Outbound command framing.
//!
//! Every length field is the byte length of the text that follows it, so the
//! viewer can skip frames it does not understand.

use std::fmt;

/// Session teardown notice. The length is fixed because the text is.
pub const DISCONNECT: &str = "MESSAGE 10 DISCONNECT";

/// Keep-alive answer to an inbound `PING 1 p`.
pub const PONG: &str = "PONG 1 p";

/// Handshake frame: `NEWGREETING <len> <text>`.
pub fn greeting(text: &str) -> String {
    format!("NEWGREETING {} {}", text.len(), text)
}

/// Generic command frame: `MESSAGE <len> <text>`.
pub fn message(text: &str) -> String {
    format!("MESSAGE {} {}", text.len(), text)
}

/// Remote evaluation whose result the viewer sends back as `RETURN <value>`.
pub fn return_event(script: &str) -> String {
    message(&format!("RETURNEVENT remote-eval * {}", script))
}

/// Header attributes of one `PIXELTILE` frame.
///
/// Rendered like a keyword-argument call; the viewer forbids spaces inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileHeader<'a> {
    pub media: &'a str,
    pub width: usize,
    pub height: usize,
    pub x: i32,
    /// Already flipped into viewer coordinates.
    pub y: i32,
    pub layer: &'a str,
    pub frame: u32,
}

impl fmt::Display for TileHeader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PIXELTILE(media={},w={},h={},x={},y={},layer={},f={})",
            self.media, self.width, self.height, self.x, self.y, self.layer, self.frame
        )
    }
}

/// Tile frame header: `PIXELTILE(...) <len> `, to be followed directly by
/// `payload_len` raw bytes.
pub fn pixel_tile(header: &TileHeader<'_>, payload_len: usize) -> String {
    format!("{} {} ", header, payload_len)
}

/// Converts a bucket's top-down y origin into the viewer's bottom-up origin.
pub fn flipped_y_origin(y_resolution: i32, bucket_y: i32, bucket_height: i32) -> i32 {
    y_resolution - bucket_y - bucket_height
}
