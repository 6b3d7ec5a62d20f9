//! Grid geometry for splitting large frame photos into detector-sized tiles.
//!
//! The geometry is pure. Pixel extraction goes through the `image` crate and
//! re-encodes each region as JPEG, which is what the detector backends accept.

use image::{DynamicImage, ImageFormat, ImageReader};
use serde::Serialize;
use std::io::Cursor;

/// One cell of the tiling grid, in source-image pixels.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct TileDescriptor {
    pub x: u32,
    pub y: u32,
    pub max_cuts_x: u32,
    pub max_cuts_y: u32,
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl TileDescriptor {
    /// Descriptor of a 1x1 grid covering the whole image.
    pub fn whole(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            max_cuts_x: 1,
            max_cuts_y: 1,
            left: 0,
            top: 0,
            width,
            height,
        }
    }
}

/// Number of cuts along each axis so that tiles stay within `max_tile_dim`.
///
/// Axes shorter than `max_tile_dim` get a single cut. A non-positive
/// `max_tile_dim` degrades to a 1x1 grid instead of failing.
pub fn compute_grid(width: u32, height: u32, max_tile_dim: i64) -> (u32, u32) {
    if max_tile_dim <= 0 {
        return (1, 1);
    }
    let cuts = |len: u32| -> u32 {
        let n = i64::from(len) / max_tile_dim;
        // n <= len, so it fits back into u32
        (n.max(1)) as u32
    };
    (cuts(width), cuts(height))
}

/// All tiles of the grid, row by row. The last row and column absorb the
/// remainder of the integer division so the tiles cover the image exactly.
pub fn iterate_tiles(
    width: u32,
    height: u32,
    max_cuts_x: u32,
    max_cuts_y: u32,
) -> impl Iterator<Item = TileDescriptor> {
    let max_cuts_x = max_cuts_x.max(1);
    let max_cuts_y = max_cuts_y.max(1);
    let cut_width = width / max_cuts_x;
    let cut_height = height / max_cuts_y;

    (0..max_cuts_y).flat_map(move |y| {
        (0..max_cuts_x).map(move |x| {
            let left = x * cut_width;
            let top = y * cut_height;
            let tile_width = if x == max_cuts_x - 1 { width - left } else { cut_width };
            let tile_height = if y == max_cuts_y - 1 { height - top } else { cut_height };
            TileDescriptor {
                x,
                y,
                max_cuts_x,
                max_cuts_y,
                left,
                top,
                width: tile_width,
                height: tile_height,
            }
        })
    })
}

/// Convenience for `compute_grid` followed by `iterate_tiles`.
pub fn plan_tiles(width: u32, height: u32, max_tile_dim: i64) -> Vec<TileDescriptor> {
    let (max_cuts_x, max_cuts_y) = compute_grid(width, height, max_tile_dim);
    iterate_tiles(width, height, max_cuts_x, max_cuts_y).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum TileError {
    #[error("Failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Failed to encode tile: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Tile {left},{top} {width}x{height} lies outside the {image_width}x{image_height} image")]
    OutOfBounds {
        left: u32,
        top: u32,
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
    },
}

/// Decode image bytes once so that every tile can be cut from memory.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, TileError> {
    image::load_from_memory(bytes).map_err(TileError::Decode)
}

/// Pixel dimensions of an encoded image, read from its header.
pub fn decode_dimensions(bytes: &[u8]) -> Result<(u32, u32), TileError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| TileError::Decode(image::ImageError::IoError(e)))?
        .into_dimensions()
        .map_err(TileError::Decode)
}

/// Cut a tile out of a decoded image and encode it as JPEG.
pub fn extract_region(image: &DynamicImage, tile: &TileDescriptor) -> Result<Vec<u8>, TileError> {
    let fits_x = tile.left.checked_add(tile.width).is_some_and(|r| r <= image.width());
    let fits_y = tile.top.checked_add(tile.height).is_some_and(|b| b <= image.height());
    if !fits_x || !fits_y || tile.width == 0 || tile.height == 0 {
        return Err(TileError::OutOfBounds {
            left: tile.left,
            top: tile.top,
            width: tile.width,
            height: tile.height,
            image_width: image.width(),
            image_height: image.height(),
        });
    }

    let region = image.crop_imm(tile.left, tile.top, tile.width, tile.height);
    encode_jpeg(&region)
}

/// Encode to JPEG. Alpha is dropped since JPEG has no alpha channel.
pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>, TileError> {
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut out = Cursor::new(Vec::new());
    rgb.write_to(&mut out, ImageFormat::Jpeg).map_err(TileError::Encode)?;
    Ok(out.into_inner())
}
