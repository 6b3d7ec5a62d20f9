//! Tile-relative to image-relative box conversion.
//!
//! Detector output is relative to the tile it was run on. Nothing tile-relative
//! is allowed to leave tile processing, so every raw detection passes through
//! [`normalize`] before it is merged.

use serde::{Deserialize, Serialize};

use crate::models::detection::{Detection, DetectionClass};
use crate::services::tiler::TileDescriptor;

/// Box given by its center and size, as fractions of some extent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CenterBox {
    pub cx: f64,
    pub cy: f64,
    pub w: f64,
    pub h: f64,
}

/// Box given by its edges, as fractions of the tile (classifier output).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CornerBox {
    pub top_row: f64,
    pub left_col: f64,
    pub bottom_row: f64,
    pub right_col: f64,
}

impl From<CornerBox> for CenterBox {
    fn from(b: CornerBox) -> Self {
        let w = b.right_col - b.left_col;
        let h = b.bottom_row - b.top_row;
        CenterBox {
            cx: b.left_col + w / 2.0,
            cy: b.bottom_row - h / 2.0,
            w,
            h,
        }
    }
}

/// A detection in the native convention of its backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawDetection {
    Center {
        class: DetectionClass,
        bbox: CenterBox,
        confidence: f64,
    },
    Corner {
        class: DetectionClass,
        bbox: CornerBox,
        confidence: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("invalid grid {max_cuts_x}x{max_cuts_y}")]
    InvalidGrid { max_cuts_x: u32, max_cuts_y: u32 },

    #[error("tile has zero extent ({width}x{height})")]
    EmptyTile { width: u32, height: u32 },

    #[error("non-finite coordinate in detection box")]
    NonFinite,
}

/// Map a box from tile-relative to full-image-relative coordinates.
///
/// Assumes uniform tiles, which holds except for the remainder-absorbing last
/// row and column where the error is at most one cut's remainder.
pub fn to_original_coords(bbox: CenterBox, tile: &TileDescriptor) -> Result<CenterBox, GeometryError> {
    if tile.max_cuts_x == 0 || tile.max_cuts_y == 0 {
        return Err(GeometryError::InvalidGrid {
            max_cuts_x: tile.max_cuts_x,
            max_cuts_y: tile.max_cuts_y,
        });
    }
    if tile.width == 0 || tile.height == 0 {
        return Err(GeometryError::EmptyTile {
            width: tile.width,
            height: tile.height,
        });
    }
    if ![bbox.cx, bbox.cy, bbox.w, bbox.h].iter().all(|v| v.is_finite()) {
        return Err(GeometryError::NonFinite);
    }

    let tile_w = f64::from(tile.width);
    let tile_h = f64::from(tile.height);
    let cuts_x = f64::from(tile.max_cuts_x);
    let cuts_y = f64::from(tile.max_cuts_y);

    let abs_cx = bbox.cx * tile_w + f64::from(tile.left);
    let abs_cy = bbox.cy * tile_h + f64::from(tile.top);

    Ok(CenterBox {
        cx: abs_cx / (tile_w * cuts_x),
        cy: abs_cy / (tile_h * cuts_y),
        w: bbox.w / cuts_x,
        h: bbox.h / cuts_y,
    })
}

/// Convert a raw backend detection on `tile` into a persisted [`Detection`].
pub fn normalize(raw: &RawDetection, tile: &TileDescriptor) -> Result<Detection, GeometryError> {
    let (class, bbox, confidence) = match *raw {
        RawDetection::Center { class, bbox, confidence } => (class, bbox, confidence),
        RawDetection::Corner { class, bbox, confidence } => (class, CenterBox::from(bbox), confidence),
    };
    if !confidence.is_finite() {
        return Err(GeometryError::NonFinite);
    }
    let b = to_original_coords(bbox, tile)?;
    Ok(Detection::new(class, b.cx, b.cy, b.w, b.h, confidence))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_tile() -> TileDescriptor {
        TileDescriptor {
            x: 1,
            y: 2,
            max_cuts_x: 3,
            max_cuts_y: 4,
            left: 100,
            top: 160,
            width: 100,
            height: 80,
        }
    }

    #[test]
    fn test_single_tile_grid_is_identity() {
        let tile = TileDescriptor::whole(640, 480);
        let bbox = CenterBox { cx: 0.31, cy: 0.72, w: 0.05, h: 0.08 };
        let out = to_original_coords(bbox, &tile).unwrap();
        assert!((out.cx - bbox.cx).abs() < 1e-12);
        assert!((out.cy - bbox.cy).abs() < 1e-12);
        assert_eq!((out.w, out.h), (bbox.w, bbox.h));
    }

    #[test]
    fn test_grid_transform_known_values() {
        let bbox = CenterBox { cx: 0.5, cy: 0.5, w: 0.2, h: 0.1 };
        let out = to_original_coords(bbox, &grid_tile()).unwrap();
        assert!((out.cx - 0.5).abs() < 1e-12);
        assert!((out.cy - 0.625).abs() < 1e-12);
        assert!((out.w - 0.2 / 3.0).abs() < 1e-12);
        assert!((out.h - 0.025).abs() < 1e-12);

        let raw = RawDetection::Center {
            class: DetectionClass::WorkerBee,
            bbox,
            confidence: 0.876,
        };
        let d = normalize(&raw, &grid_tile()).unwrap();
        assert_eq!((d.x, d.y, d.w, d.h, d.c), (0.5, 0.625, 0.0667, 0.025, 0.88));
    }

    #[test]
    fn test_corner_box_converts_to_center() {
        let corner = CornerBox {
            top_row: 0.2,
            left_col: 0.1,
            bottom_row: 0.6,
            right_col: 0.5,
        };
        let center = CenterBox::from(corner);
        assert!((center.cx - 0.3).abs() < 1e-12);
        assert!((center.cy - 0.4).abs() < 1e-12);
        assert!((center.w - 0.4).abs() < 1e-12);
        assert!((center.h - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_corner_detection_on_grid() {
        let raw = RawDetection::Corner {
            class: DetectionClass::Queen,
            bbox: CornerBox {
                top_row: 0.45,
                left_col: 0.4,
                bottom_row: 0.55,
                right_col: 0.6,
            },
            confidence: 0.5,
        };
        let d = normalize(&raw, &grid_tile()).unwrap();
        assert_eq!(d.x, 0.5);
        assert_eq!(d.y, 0.625);
        assert_eq!(d.class, DetectionClass::Queen);
    }

    #[test]
    fn test_invalid_geometry_is_reported() {
        let bbox = CenterBox { cx: 0.5, cy: 0.5, w: 0.1, h: 0.1 };
        let zero_grid = TileDescriptor {
            max_cuts_x: 0,
            ..grid_tile()
        };
        assert!(matches!(
            to_original_coords(bbox, &zero_grid),
            Err(GeometryError::InvalidGrid { .. })
        ));

        let empty = TileDescriptor {
            height: 0,
            ..grid_tile()
        };
        assert!(matches!(to_original_coords(bbox, &empty), Err(GeometryError::EmptyTile { .. })));

        let nan = CenterBox { cx: f64::NAN, ..bbox };
        assert_eq!(to_original_coords(nan, &grid_tile()), Err(GeometryError::NonFinite));

        let raw = RawDetection::Center {
            class: DetectionClass::Drone,
            bbox,
            confidence: f64::INFINITY,
        };
        assert_eq!(normalize(&raw, &grid_tile()), Err(GeometryError::NonFinite));
    }
}
