// src/lib.rs

//! Streams rendered tiles into an RV viewer over its network protocol.

pub mod color;
pub mod config;
pub mod io;
pub mod pixels;
pub mod protocol;
pub mod session;

pub use color::{ColorCorrection, ColorMode};
pub use config::DriverConfig;
pub use pixels::{PixelData, PixelType, TileBuffer};
pub use session::{Bucket, BucketLayer, PassInfo, Session, SessionState, StreamStats};
