use std::path::PathBuf;

use surround_core::FormatError;

use crate::fisheye::FisheyeError;
use crate::pattern::PatternError;

/// Failures of the per-camera calibration steps.
#[derive(thiserror::Error, Debug)]
pub enum CalibError {
    #[error(transparent)]
    Model(#[from] FisheyeError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("cannot read image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error(
        "camera {camera}: frame is {found_width}x{found_height}, model expects {width}x{height}"
    )]
    FrameSize {
        camera: usize,
        found_width: u32,
        found_height: u32,
        width: u32,
        height: u32,
    },

    #[error("camera {camera}: no chessboard found in {tried} images")]
    NoChessboard { camera: usize, tried: usize },

    #[error("camera {camera}: camera matrix estimation failed")]
    CameraMatrix { camera: usize },

    #[error("camera {camera}: {source}")]
    Pattern {
        camera: usize,
        #[source]
        source: PatternError,
    },

    #[error("camera {camera}: found {found} pattern points, template has {expected}")]
    PointCount {
        camera: usize,
        found: usize,
        expected: usize,
    },

    #[error("camera {camera}: pose estimation failed")]
    Pose { camera: usize },

    #[error("camera {camera}: {what} not set")]
    NotReady { camera: usize, what: &'static str },
}
