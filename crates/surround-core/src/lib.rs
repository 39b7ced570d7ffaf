//! Shared building blocks for the surround-view calibration pipeline.
//!
//! This crate is purely geometric. It knows nothing about fisheye models,
//! detectors or image buffers; it provides the polygon and rectangle
//! helpers, the homography estimator, the plain-text file formats exchanged
//! with the renderer, the camera slot table and the logger.

mod formats;
mod geometry;
mod homography;
mod logger;
mod slot;

pub use formats::{
    read_floats, read_mesh, read_point_pairs, read_rects, write_mesh, write_rects, FormatError,
    MeshVertex,
};
pub use geometry::{
    diagonal_intersection, is_convex, point_in_polygon, polygon_area, signed_area, PixelRect,
    Rect2,
};
pub use homography::{homography_from_4pt, Homography};
pub use slot::{next_index, previous_index, CameraSlot, ScreenTile};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::{init_with_level, parse_level};
