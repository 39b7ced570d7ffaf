//! Bowl geometry for surround-view stitching.
//!
//! Each calibrated camera gets a curvilinear grid over its angular sector
//! (flat floor disk, then a quadratic wall), textured from its fisheye frame.
//! [`SeamMaskBuilder`] turns the grids into per-camera blend masks and splits
//! every mesh into the triangles that need blending and the ones that don't.

mod grid;
mod seams;

pub use grid::{
    common_ring_count, BowlGrid, BowlGridParams, GridError, TextureProjector, SEAM_POINTS,
};
pub use seams::{
    blend_weight, vehicle_weight, BlendMask, SeamError, SeamMaskBuilder, SeamParams, SplitMesh,
};
