// src/pixels.rs
//! Frame buffer conversion for outgoing tiles.
//!
//! ## Coordinate Systems
//!
//! 1. **Bucket rows**: as produced by the renderer, row 0 is the *top* of the
//!    bucket and y grows downward.
//! 2. **Viewer rows**: the viewer's origin is bottom-left, y grows upward.
//!
//! Every tile is therefore flipped vertically inside the tile while it is
//! converted. Tile *placement* is flipped separately, see
//! [`crate::protocol::flipped_y_origin`].
//!
//! The wire format is always RGBA 32-bit float, because the viewer does not
//! accept layers with differing channel counts inside one source.

use anyhow::{bail, Result};

/// Channels per converted pixel.
pub const CHANNELS: usize = 4;

/// Bytes per converted pixel.
pub const BYTES_PER_PIXEL: usize = CHANNELS * std::mem::size_of::<f32>();

pub type Rgba = [f32; 4];
pub type Rgb = [f32; 3];

/// Source pixel layout tag of one AOV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    Rgba,
    Rgb,
    Vector,
    Point,
    Float,
}

/// Borrowed bucket data for one AOV, tagged with its layout.
#[derive(Debug, Clone, Copy)]
pub enum PixelData<'a> {
    Rgba(&'a [Rgba]),
    Rgb(&'a [Rgb]),
    Vector(&'a [Rgb]),
    Point(&'a [Rgb]),
    Float(&'a [f32]),
}

impl PixelData<'_> {
    pub fn pixel_type(&self) -> PixelType {
        match self {
            PixelData::Rgba(_) => PixelType::Rgba,
            PixelData::Rgb(_) => PixelType::Rgb,
            PixelData::Vector(_) => PixelType::Vector,
            PixelData::Point(_) => PixelType::Point,
            PixelData::Float(_) => PixelType::Float,
        }
    }

    /// Number of source pixels.
    pub fn len(&self) -> usize {
        match self {
            PixelData::Rgba(p) => p.len(),
            PixelData::Rgb(p) | PixelData::Vector(p) | PixelData::Point(p) => p.len(),
            PixelData::Float(p) => p.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An owned, converted RGBA32F tile in viewer row order.
///
/// Dropping the tile (or the byte buffer produced by [`TileBuffer::into_bytes`])
/// releases its memory; ownership moves into the write path untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct TileBuffer {
    width: usize,
    height: usize,
    pixels: Vec<Rgba>,
}

impl TileBuffer {
    /// Converts one bucket of source pixels, flipping rows vertically.
    ///
    /// 3-channel and scalar sources get alpha 0; scalars are replicated
    /// across R, G and B.
    pub fn convert(width: usize, height: usize, data: PixelData<'_>) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("Refusing to convert an empty {}x{} tile", width, height);
        }
        let expected = width * height;
        if data.len() != expected {
            bail!(
                "{:?} bucket holds {} pixels, expected {}x{}={}",
                data.pixel_type(),
                data.len(),
                width,
                height,
                expected
            );
        }

        let pixels = match data {
            PixelData::Rgba(src) => flip_rows(src, width, |p| p),
            PixelData::Rgb(src) | PixelData::Vector(src) | PixelData::Point(src) => {
                flip_rows(src, width, |[r, g, b]| [r, g, b, 0.0])
            }
            PixelData::Float(src) => flip_rows(src, width, |v| [v, v, v, 0.0]),
        };

        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[Rgba] {
        &self.pixels
    }

    /// Payload size on the wire.
    pub fn byte_len(&self) -> usize {
        self.pixels.len() * BYTES_PER_PIXEL
    }

    /// Flips the tile vertically in place. Applying it twice is a no-op.
    pub fn flip_vertical(&mut self) {
        let width = self.width;
        let height = self.height;
        for j in 0..height / 2 {
            let (top, bottom) = self.pixels.split_at_mut((height - j - 1) * width);
            top[j * width..(j + 1) * width].swap_with_slice(&mut bottom[..width]);
        }
    }

    /// Serialises the tile as little-endian f32 RGBA, row-major.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.byte_len());
        for channel in self.pixels.iter().flatten() {
            bytes.extend_from_slice(&channel.to_le_bytes());
        }
        bytes
    }
}

/// Emits `src` rows bottom-up, mapping each pixel through `to_rgba`.
fn flip_rows<T, F>(src: &[T], width: usize, to_rgba: F) -> Vec<Rgba>
where
    T: Copy,
    F: Fn(T) -> Rgba,
{
    src.chunks_exact(width)
        .rev()
        .flat_map(|row| row.iter().copied().map(&to_rgba))
        .collect()
}
