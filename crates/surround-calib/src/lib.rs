//! Per-camera calibration for a four-camera fisheye surround-view rig.
//!
//! ## Quickstart
//!
//! ```no_run
//! use surround_calib::{CameraModel, CameraParams, PatternSize, PosterSize};
//!
//! let params = CameraParams {
//!     model: "calib_results_1.txt".into(),
//!     ..CameraParams::default()
//! };
//! let mut camera = CameraModel::load(0, &params)?;
//! let poster = PosterSize { width: 1200, height: 800 };
//! camera.set_template("templates/template_1.txt", poster)?;
//! let captures = params.chessboard_count;
//! camera.set_intrinsic("chessboard_1", "frame1_", captures, PatternSize::default())?;
//! let frame = image::open("front.png")?.to_rgb8();
//! camera.set_extrinsic(&frame)?;
//! println!("visible bowl rings: {}", camera.bowl_height(1.2 * camera.base_radius(), 0.1));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Pipeline per camera:
//! 1. Undistort fisheye frames through the OCamCalib model's LUT.
//! 2. Estimate a pinhole matrix of the undistorted view from chessboard captures.
//! 3. Detect the four pattern quads on the floor poster.
//! 4. Solve the pose against the camera's reference template.

mod camera;
mod chessboard;
mod contour;
mod error;
mod fisheye;
mod intrinsics;
mod pattern;
mod pose;
mod template;
mod threshold;

pub use camera::{CameraModel, CameraParams};
pub use chessboard::{
    detect_board_from_corners, find_chessboard_corners, planar_view_from_labels, ChessboardParams,
    PatternSize,
};
pub use error::CalibError;
pub use fisheye::{FisheyeError, OcamModel, UndistortLut};
pub use intrinsics::{init_camera_matrix, PlanarView};
pub use pattern::{
    order_corners, CalibrationPattern, CornerPosition, PatternDetector, PatternError,
    PatternParams, PatternPoint, Quad, QuadKind,
};
pub use pose::{project_point, solve_planar_pose, Pose};
pub use template::{poster_size_from_templates, PosterSize, ReferenceTemplate};
pub use threshold::adaptive_threshold_mean;
