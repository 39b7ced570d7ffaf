//! Inner-corner grid detection for intrinsic calibration.
//!
//! ChESS corner candidates go through the `calib-targets` chessboard
//! detector, which labels them with integer grid coordinates whatever the
//! board's in-plane rotation. The labels become board coordinates of a
//! [`PlanarView`]; missing corners are fine, a labelled extent larger than
//! the configured pattern is not.

use calib_targets_chessboard::{Detector, DetectorParams};
use calib_targets_core::{AxisEstimate, ChessConfig, Corner};
use chess_corners::{find_chess_corners_image, CornerDescriptor};
use image::GrayImage;
use log::debug;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::intrinsics::PlanarView;

/// Inner corners per chessboard row (`cols`) and column (`rows`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for PatternSize {
    fn default() -> Self {
        Self { cols: 7, rows: 7 }
    }
}

impl PatternSize {
    pub fn count(&self) -> usize {
        (self.cols * self.rows) as usize
    }

    fn fits(&self, span_i: u32, span_j: u32) -> bool {
        span_i < self.cols && span_j < self.rows
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChessboardParams {
    /// Smallest share of the pattern's corners a view must label.
    pub min_labelled_fraction: f64,
    /// File extension of the chessboard captures.
    pub image_extension: String,
    pub chess: ChessConfig,
    pub detector: DetectorParams,
}

impl Default for ChessboardParams {
    fn default() -> Self {
        Self {
            min_labelled_fraction: 0.6,
            image_extension: "jpg".to_string(),
            chess: ChessConfig::default(),
            detector: DetectorParams::default(),
        }
    }
}

fn to_corner(c: &CornerDescriptor) -> Corner {
    Corner {
        position: Point2::new(c.x, c.y),
        orientation_cluster: None,
        axes: c.axes.map(|a| AxisEstimate {
            angle: a.angle,
            sigma: a.sigma,
        }),
        contrast: c.contrast,
        fit_rms: c.fit_rms,
        strength: c.response,
    }
}

/// Board coordinates for grid-labelled image points.
///
/// Labels are shifted so the smallest `(i, j)` is the origin. A board seen
/// in portrait (labelled extent `rows x cols`) is transposed back onto the
/// pattern. `None` when the extent fits neither way, a label repeats, or
/// fewer than `min_fraction` of the pattern's corners are present.
pub fn planar_view_from_labels(
    labelled: &[((i32, i32), Point2<f64>)],
    size: PatternSize,
    min_fraction: f64,
) -> Option<PlanarView> {
    let needed = ((size.count() as f64 * min_fraction).ceil() as usize).max(4);
    if labelled.len() < needed || labelled.len() > size.count() {
        return None;
    }
    let min_i = labelled.iter().map(|((i, _), _)| *i).min()?;
    let min_j = labelled.iter().map(|((_, j), _)| *j).min()?;
    let span_i = (labelled.iter().map(|((i, _), _)| *i).max()? - min_i) as u32;
    let span_j = (labelled.iter().map(|((_, j), _)| *j).max()? - min_j) as u32;
    let transpose = if size.fits(span_i, span_j) {
        false
    } else if size.fits(span_j, span_i) {
        true
    } else {
        debug!("chessboard: labelled extent {span_i}x{span_j} exceeds the pattern");
        return None;
    };

    let mut view = PlanarView::default();
    let mut seen = std::collections::HashSet::new();
    for &((i, j), p) in labelled {
        let (u, v) = if transpose {
            (j - min_j, i - min_i)
        } else {
            (i - min_i, j - min_j)
        };
        if !seen.insert((u, v)) {
            return None;
        }
        view.board.push(Point2::new(u as f64, v as f64));
        view.image.push(p);
    }
    Some(view)
}

/// Label ChESS corners into a chessboard view of `size`.
pub fn detect_board_from_corners(
    corners: &[Corner],
    size: PatternSize,
    params: &ChessboardParams,
) -> Option<PlanarView> {
    let detection = Detector::new(params.detector.clone()).detect(corners)?;
    let labelled: Vec<_> = detection
        .target
        .corners
        .iter()
        .filter_map(|c| {
            let g = c.grid?;
            Some((
                (g.i, g.j),
                Point2::new(c.position.x as f64, c.position.y as f64),
            ))
        })
        .collect();
    debug!(
        "chessboard: {} of {} corners labelled",
        labelled.len(),
        size.count()
    );
    planar_view_from_labels(&labelled, size, params.min_labelled_fraction)
}

/// Detect a chessboard and return its board/image correspondences.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument(
        level = "debug",
        skip(gray, params),
        fields(width = gray.width(), height = gray.height())
    )
)]
pub fn find_chessboard_corners(
    gray: &GrayImage,
    size: PatternSize,
    params: &ChessboardParams,
) -> Option<PlanarView> {
    let chess = params.chess.to_chess_corners_config();
    let raw = match find_chess_corners_image(gray, &chess) {
        Ok(raw) => raw,
        Err(e) => {
            debug!("chessboard: corner detection failed: {e}");
            return None;
        }
    };
    let corners: Vec<Corner> = raw.iter().map(to_corner).collect();
    detect_board_from_corners(&corners, size, params)
}
