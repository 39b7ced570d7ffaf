//! Exposure balancing across neighbouring surround-view cameras.
//!
//! [`Compensator`] derives the overlap rectangles from the bowl seam points
//! and writes the overlap-only floor meshes the renderer samples.
//! [`GainSolver`] turns those samples into per-camera RGB gains on a
//! background thread. [`FrameStore`] holds the latest frame of each camera.

mod compensator;
mod frames;
mod gain;

pub use compensator::{Compensator, CompensatorError};
pub use frames::FrameStore;
pub use gain::{
    crop_overlaps, solve_gains, GainError, GainParams, GainSolver, OverlapPair, SignalPolicy,
};
