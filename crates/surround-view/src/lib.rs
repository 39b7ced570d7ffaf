//! Facade crate for the `surround-*` workspace.
//!
//! This crate provides:
//! - re-exports of the calibration, bowl and exposure crates
//! - a JSON [`SessionConfig`] for a whole rig
//! - [`CalibrationSession`], which walks the rig through the five calibration
//!   views and writes the stitching outputs
//! - (feature `cli`) the `surround-view` binary
//!
//! ## Quickstart
//!
//! ```no_run
//! use surround_view::{CalibrationSession, SessionConfig, ViewState};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::load_json("rig.json")?;
//! let mut frames = vec![
//!     image::open("front.png")?.to_rgb8(),
//!     image::open("right.png")?.to_rgb8(),
//!     image::open("rear.png")?.to_rgb8(),
//!     image::open("left.png")?.to_rgb8(),
//! ];
//! let mut session = CalibrationSession::new(config)?;
//! while session.state() != ViewState::Result {
//!     let report = session.advance(&mut frames)?;
//!     println!("{}: {} camera failures", report.state, report.failures.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `surround_view::core`: geometry, text formats, camera slots, logger.
//! - `surround_view::calib`: fisheye model, pattern detection, camera calibration.
//! - `surround_view::bowl`: bowl grids, blend masks and mesh split.
//! - `surround_view::exposure`: overlap regions, gain solver, frame store.

pub use surround_bowl as bowl;
pub use surround_calib as calib;
pub use surround_core as core;
pub use surround_exposure as exposure;

pub use surround_bowl::{BowlGrid, BowlGridParams, SeamParams};
pub use surround_calib::{CameraModel, CameraParams, OcamModel, PatternSize};
pub use surround_core::{CameraSlot, MeshVertex};
pub use surround_exposure::{Compensator, FrameStore, GainParams, GainSolver};

mod config;
mod session;

pub use config::{ConfigError, DisplaySize, SessionConfig, MAX_CAMERAS};
pub use session::{
    CalibrationSession, CameraFailure, FrameSource, SessionError, StageOutput, StageReport,
    ViewState,
};
