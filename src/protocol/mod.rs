// src/protocol/mod.rs
//
// Wire protocol spoken with the viewer: ASCII `KIND <len> <payload>` frames,
// with raw binary payloads following `PIXELTILE` headers.

pub mod encoder;
pub mod frame;
pub mod script;

pub use encoder::{
    flipped_y_origin, greeting, message, pixel_tile, return_event, TileHeader, DISCONNECT, PONG,
};
pub use frame::{Frame, FrameError, FrameParser, Inbound};
pub use script::{registration_script, ImageSourceDescriptor};
