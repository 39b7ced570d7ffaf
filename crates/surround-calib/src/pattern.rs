//! Calibration pattern detection.
//!
//! The pattern printed on the floor poster is a set of nested dark square
//! outlines. Each outline contributes convex quads to the contour set;
//! detection succeeds when exactly `expected_quads` nested quads survive one
//! of the threshold attempts.

use image::{imageops, GrayImage};
use log::debug;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use surround_core::{diagonal_intersection, signed_area, ScreenTile};

use crate::contour::{extract_quads, keep_nested, QuadLimits, RawQuad};
use crate::threshold::adaptive_threshold_mean;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Parameters of the multi-pass quad search.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternParams {
    /// Minimum quad area in pixels (also applied to the contour bounding box).
    pub min_area: f64,
    /// Corners closer than this to the search region border are rejected.
    pub border_margin: f64,
    /// Threshold attempts, each with its own block size and bias.
    pub max_attempts: usize,
    /// Highest Douglas-Peucker tolerance (pixels) tried per contour.
    pub max_approx_level: u32,
    pub expected_quads: usize,
}

impl Default for PatternParams {
    fn default() -> Self {
        Self {
            min_area: 200.0,
            border_margin: 10.0,
            max_attempts: 6,
            max_approx_level: 7,
            expected_quads: 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CornerPosition {
    TopLeft,
    TopRight,
    BottomRight,
    BottomLeft,
}

impl CornerPosition {
    pub const CLOCKWISE: [CornerPosition; 4] = [
        CornerPosition::TopLeft,
        CornerPosition::TopRight,
        CornerPosition::BottomRight,
        CornerPosition::BottomLeft,
    ];
}

/// Whether the quad outlines a dark region (hole border) or a bright one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuadKind {
    Outer,
    Hole,
}

/// Quad with corners ordered top-left first, clockwise on screen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quad {
    pub corners: [Point2<f64>; 4],
    pub kind: QuadKind,
}

impl Quad {
    fn from_raw(raw: &RawQuad) -> Self {
        Self {
            corners: order_corners(raw.corners),
            kind: if raw.hole {
                QuadKind::Hole
            } else {
                QuadKind::Outer
            },
        }
    }

    pub fn min_x(&self) -> f64 {
        self.corners.iter().map(|p| p.x).fold(f64::INFINITY, f64::min)
    }
}

/// Rotate (and if needed reverse) four corners so they start top-left and
/// run clockwise in image coordinates.
///
/// The top pair is the first pair of consecutive corners lying on or above
/// the diagonal intersection.
pub fn order_corners(mut corners: [Point2<f64>; 4]) -> [Point2<f64>; 4] {
    if signed_area(&corners) < 0.0 {
        corners.reverse();
    }
    let ym = diagonal_intersection(&corners).y;
    let start = (0..4)
        .find(|&i| corners[i].y <= ym && corners[(i + 1) % 4].y <= ym)
        .unwrap_or_else(|| {
            (0..4)
                .min_by(|&a, &b| {
                    let ka = corners[a].x + corners[a].y;
                    let kb = corners[b].x + corners[b].y;
                    ka.total_cmp(&kb)
                })
                .unwrap_or(0)
        });
    corners.rotate_left(start);
    corners
}

/// One pattern corner with its provenance.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatternPoint {
    pub position: Point2<f64>,
    pub quad: usize,
    pub corner: CornerPosition,
}

/// Detected quads, sorted left to right by their minimum x.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPattern {
    pub quads: Vec<Quad>,
}

impl CalibrationPattern {
    fn from_raw(raw: &[RawQuad]) -> Self {
        let mut quads: Vec<Quad> = raw.iter().map(Quad::from_raw).collect();
        quads.sort_by(|a, b| a.min_x().total_cmp(&b.min_x()));
        Self { quads }
    }

    pub fn is_empty(&self) -> bool {
        self.quads.is_empty()
    }

    pub fn points(&self) -> Vec<PatternPoint> {
        self.quads
            .iter()
            .enumerate()
            .flat_map(|(qi, q)| {
                q.corners
                    .iter()
                    .zip(CornerPosition::CLOCKWISE)
                    .map(move |(&position, corner)| PatternPoint {
                        position,
                        quad: qi,
                        corner,
                    })
            })
            .collect()
    }

    /// Corner positions in quad order, the layout reference templates use.
    pub fn image_points(&self) -> Vec<Point2<f64>> {
        self.quads.iter().flat_map(|q| q.corners).collect()
    }

    pub fn translate(&mut self, dx: f64, dy: f64) {
        for q in &mut self.quads {
            for p in &mut q.corners {
                p.x += dx;
                p.y += dy;
            }
        }
    }

    /// Quad edges as line segments inside a camera's preview tile.
    ///
    /// `width x height` is the size of the image the corners refer to.
    pub fn outline_segments(
        &self,
        tile: ScreenTile,
        width: u32,
        height: u32,
    ) -> Vec<[[f32; 3]; 2]> {
        let (w, h) = (width.max(1) as f32, height.max(1) as f32);
        let to_tile = |p: Point2<f64>| {
            let [x, y] = tile.map(p.x as f32 / w, p.y as f32 / h);
            [x, y, 0.0]
        };
        self.quads
            .iter()
            .flat_map(|q| {
                (0..4).map(move |i| [to_tile(q.corners[i]), to_tile(q.corners[(i + 1) % 4])])
            })
            .collect()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PatternError {
    #[error("no pattern contours found")]
    NoContours,
    #[error("found {found} pattern quads, expected {expected}")]
    QuadCount {
        found: usize,
        expected: usize,
        partial: CalibrationPattern,
    },
}

impl PatternError {
    /// Whatever was found before giving up, for operator feedback.
    pub fn partial(&self) -> Option<&CalibrationPattern> {
        match self {
            PatternError::NoContours => None,
            PatternError::QuadCount { partial, .. } => Some(partial),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PatternDetector {
    pub params: PatternParams,
}

impl PatternDetector {
    pub fn new(params: PatternParams) -> Self {
        Self { params }
    }

    /// Search the whole image.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(w = gray.width(), h = gray.height()))
    )]
    pub fn detect(&self, gray: &GrayImage) -> Result<CalibrationPattern, PatternError> {
        let p = &self.params;
        let limits = QuadLimits {
            min_area: p.min_area,
            margin: p.border_margin,
            max_approx_level: p.max_approx_level,
        };
        let min_dim = gray.width().min(gray.height()) as f64;

        let mut survivors = Vec::new();
        for attempt in 0..p.max_attempts {
            let fraction = if attempt % 2 == 0 { 0.2 } else { 0.1 };
            let block = ((min_dim * fraction).round() as u32 | 1).max(3);
            let bias = (attempt / 2) as i32 * 5;

            let binary = adaptive_threshold_mean(gray, block, bias);
            let candidates = extract_quads(&binary, limits);
            let found = candidates.len();
            survivors = keep_nested(candidates);
            debug!(
                "pattern attempt {attempt}: block {block}, bias {bias}, {found} quads, {} nested",
                survivors.len()
            );
            if survivors.len() == p.expected_quads {
                break;
            }
        }

        let pattern = CalibrationPattern::from_raw(&survivors);
        if pattern.is_empty() {
            return Err(PatternError::NoContours);
        }
        if pattern.quads.len() != p.expected_quads {
            return Err(PatternError::QuadCount {
                found: pattern.quads.len(),
                expected: p.expected_quads,
                partial: pattern,
            });
        }
        Ok(pattern)
    }

    /// Search the bottom `roi` fraction of the image (`0 < roi <= 1`).
    ///
    /// The band starts `border_margin` pixels above `height * (1 - roi)` so a
    /// pattern touching the band edge is not lost to the margin check.
    /// Returned corners are in full-image coordinates, including the partial
    /// pattern carried by an error.
    pub fn detect_in_roi(
        &self,
        gray: &GrayImage,
        roi: f64,
    ) -> Result<CalibrationPattern, PatternError> {
        let (w, h) = gray.dimensions();
        let roi = roi.clamp(0.0, 1.0);
        let top = (h as f64 * (1.0 - roi) - self.params.border_margin).max(0.0) as u32;
        let band = ((h as f64 * roi) as u32).min(h - top.min(h));
        let region = imageops::crop_imm(gray, 0, top, w, band).to_image();

        let dy = top as f64;
        match self.detect(&region) {
            Ok(mut pattern) => {
                pattern.translate(0.0, dy);
                Ok(pattern)
            }
            Err(PatternError::QuadCount {
                found,
                expected,
                mut partial,
            }) => {
                partial.translate(0.0, dy);
                Err(PatternError::QuadCount {
                    found,
                    expected,
                    partial,
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Luma;

    /// Dark square outline (`thickness` px wide) on a bright background.
    pub(crate) fn draw_frame(img: &mut GrayImage, x0: u32, y0: u32, side: u32, thickness: u32) {
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                let inner = x >= x0 + thickness
                    && x < x0 + side - thickness
                    && y >= y0 + thickness
                    && y < y0 + side - thickness;
                if !inner {
                    img.put_pixel(x, y, Luma([25]));
                }
            }
        }
    }

    fn two_frames() -> GrayImage {
        let mut img = GrayImage::from_pixel(400, 300, Luma([220]));
        draw_frame(&mut img, 240, 110, 70, 10);
        draw_frame(&mut img, 60, 120, 70, 10);
        img
    }

    fn is_clockwise_from_top_left(q: &Quad) -> bool {
        let c = q.corners;
        let center_y = c.iter().map(|p| p.y).sum::<f64>() / 4.0;
        signed_area(&c) > 0.0 && c[0].y < center_y && c[1].y < center_y && c[0].x < c[1].x
    }

    #[test]
    fn finds_four_nested_quads_sorted_left_to_right() {
        let pattern = PatternDetector::default()
            .detect(&two_frames())
            .expect("pattern");
        assert_eq!(pattern.quads.len(), 4);
        let xs: Vec<f64> = pattern.quads.iter().map(Quad::min_x).collect();
        assert!(xs.windows(2).all(|w| w[0] <= w[1]), "{xs:?}");
        assert!(pattern.quads.iter().all(is_clockwise_from_top_left));
        assert_eq!(pattern.points().len(), 16);
        assert_eq!(pattern.points()[5].quad, 1);
        assert_eq!(pattern.points()[5].corner, CornerPosition::TopRight);
    }

    #[test]
    fn left_frame_corners_land_on_the_drawn_edges() {
        let pattern = PatternDetector::default()
            .detect(&two_frames())
            .expect("pattern");
        let outer = &pattern.quads[0];
        let tl = outer.corners[0];
        let br = outer.corners[2];
        assert!((tl.x - 60.0).abs() <= 2.0 && (tl.y - 120.0).abs() <= 2.0, "{tl:?}");
        assert!((br.x - 129.0).abs() <= 2.0 && (br.y - 189.0).abs() <= 2.0, "{br:?}");
    }

    #[test]
    fn solid_square_reports_partial_result() {
        let mut img = GrayImage::from_pixel(400, 300, Luma([220]));
        draw_frame(&mut img, 150, 100, 60, 30);
        let err = PatternDetector::default().detect(&img).unwrap_err();
        match &err {
            PatternError::QuadCount {
                found, expected, ..
            } => {
                assert_eq!(*expected, 4);
                assert_ne!(*found, 4);
            }
            PatternError::NoContours => panic!("expected a partial result"),
        }
    }

    #[test]
    fn blank_image_has_no_contours() {
        let img = GrayImage::from_pixel(200, 150, Luma([128]));
        assert!(matches!(
            PatternDetector::default().detect(&img),
            Err(PatternError::NoContours)
        ));
    }

    #[test]
    fn roi_search_reports_full_image_coordinates() {
        let mut img = GrayImage::from_pixel(400, 300, Luma([220]));
        draw_frame(&mut img, 60, 200, 70, 10);
        draw_frame(&mut img, 240, 200, 70, 10);
        let pattern = PatternDetector::default()
            .detect_in_roi(&img, 0.5)
            .expect("pattern");
        let tl = pattern.quads[0].corners[0];
        assert!((tl.y - 200.0).abs() <= 2.0, "{tl:?}");
    }

    #[test]
    fn corner_order_is_independent_of_input_rotation() {
        let base = [
            Point2::new(10.0, 10.0),
            Point2::new(50.0, 12.0),
            Point2::new(48.0, 40.0),
            Point2::new(12.0, 38.0),
        ];
        for shift in 0..4 {
            let mut c = base;
            c.rotate_left(shift);
            assert_eq!(order_corners(c), base);
            c.reverse();
            assert_eq!(order_corners(c), base);
        }
    }
}
