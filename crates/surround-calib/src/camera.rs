//! Per-camera calibration state.
//!
//! A [`CameraModel`] owns one fisheye model and its undistortion table, and
//! accumulates the calibration results in order: reference template, pinhole
//! intrinsics of the undistorted view, then the pose relative to the floor
//! poster. Every step works on undistorted images.

use std::path::{Path, PathBuf};

use image::{imageops, ImageBuffer, Pixel, RgbImage};
use log::{debug, info, warn};
use nalgebra::{Matrix3, Point2, Point3};
use serde::{Deserialize, Serialize};
use surround_core::{CameraSlot, MeshVertex};

use crate::chessboard::{find_chessboard_corners, ChessboardParams, PatternSize};
use crate::error::CalibError;
use crate::fisheye::{OcamModel, UndistortLut};
use crate::intrinsics::init_camera_matrix;
use crate::pattern::{CalibrationPattern, PatternDetector, PatternParams};
use crate::pose::{project_point, solve_planar_pose, Pose};
use crate::template::{PosterSize, ReferenceTemplate};

/// Bowl rings beyond this count are never tested for visibility.
const MAX_BOWL_RINGS: usize = 100;

/// Operator-tunable settings of one camera.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraParams {
    /// OCamCalib model file.
    pub model: PathBuf,
    /// Undistortion zoom; the virtual focal length is `width / scale_factor`.
    pub scale_factor: f64,
    /// Height of the pattern search band, in percent of the image height.
    pub roi_percent: f64,
    /// Minimum pattern quad area in pixels.
    pub contour_min_area: f64,
    /// Number of chessboard captures used for the intrinsics.
    pub chessboard_count: usize,
    /// Known `[fx, fy, cx, cy]` of the undistorted view. When set, the
    /// chessboard captures are not read.
    pub camera_matrix: Option<[f64; 4]>,
    pub pattern: PatternParams,
    pub chessboard: ChessboardParams,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            model: PathBuf::new(),
            scale_factor: 2.0,
            roi_percent: 50.0,
            contour_min_area: 200.0,
            chessboard_count: 5,
            camera_matrix: None,
            pattern: PatternParams::default(),
            chessboard: ChessboardParams::default(),
        }
    }
}

impl CameraParams {
    pub fn known_camera_matrix(&self) -> Option<Matrix3<f64>> {
        let [fx, fy, cx, cy] = self.camera_matrix?;
        Some(Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0))
    }
}

#[derive(Clone, Debug)]
pub struct CameraModel {
    index: usize,
    model: OcamModel,
    lut: UndistortLut,
    scale_factor: f64,
    roi: f64,
    detector: PatternDetector,
    chessboard: ChessboardParams,
    template: Option<ReferenceTemplate>,
    reference: Vec<Point3<f64>>,
    intrinsics: Option<Matrix3<f64>>,
    dist_coeffs: [f64; 4],
    pose: Option<Pose>,
    base_radius: f64,
    pattern: CalibrationPattern,
}

impl CameraModel {
    pub fn new(index: usize, model: OcamModel, params: &CameraParams) -> Self {
        let lut = model.build_lut(params.scale_factor);
        let mut detector = PatternDetector::new(params.pattern.clone());
        detector.params.min_area = params.contour_min_area;
        Self {
            index,
            model,
            lut,
            scale_factor: params.scale_factor,
            roi: (params.roi_percent / 100.0).clamp(0.0, 1.0),
            detector,
            chessboard: params.chessboard.clone(),
            template: None,
            reference: Vec::new(),
            intrinsics: None,
            dist_coeffs: [0.0; 4],
            pose: None,
            base_radius: 0.0,
            pattern: CalibrationPattern::default(),
        }
    }

    /// Load the model file named in `params` and build the LUT.
    pub fn load(index: usize, params: &CameraParams) -> Result<Self, CalibError> {
        let model = OcamModel::load(&params.model)?;
        info!(
            "camera {index}: model {} loaded, scale factor {}",
            params.model.display(),
            params.scale_factor
        );
        Ok(Self::new(index, model, params))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn slot(&self) -> Option<CameraSlot> {
        CameraSlot::from_index(self.index)
    }

    pub fn model(&self) -> &OcamModel {
        &self.model
    }

    pub fn lut(&self) -> &UndistortLut {
        &self.lut
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    /// Pattern search band as a fraction of the image height.
    pub fn roi(&self) -> f64 {
        self.roi
    }

    pub fn template(&self) -> Option<&ReferenceTemplate> {
        self.template.as_ref()
    }

    /// Normalized reference points of the last extrinsic attempt.
    pub fn reference_points(&self) -> &[Point3<f64>] {
        &self.reference
    }

    pub fn intrinsics(&self) -> Option<&Matrix3<f64>> {
        self.intrinsics.as_ref()
    }

    /// Always zero: intrinsics describe the undistorted view.
    pub fn dist_coeffs(&self) -> [f64; 4] {
        self.dist_coeffs
    }

    pub fn pose(&self) -> Option<&Pose> {
        self.pose.as_ref()
    }

    /// Distance of the first reference point from the template origin.
    pub fn base_radius(&self) -> f64 {
        self.base_radius
    }

    /// Pattern of the last extrinsic attempt, partial if detection failed.
    pub fn pattern(&self) -> &CalibrationPattern {
        &self.pattern
    }

    /// Rebuild the undistortion table for a new scale factor.
    pub fn update_lut(&mut self, scale_factor: f64) {
        self.scale_factor = scale_factor;
        self.lut = self.model.build_lut(scale_factor);
        debug!("camera {}: LUT rebuilt, scale factor {scale_factor}", self.index);
    }

    pub fn set_roi(&mut self, percent: f64) {
        self.roi = (percent / 100.0).clamp(0.0, 1.0);
    }

    pub fn set_contour_min_area(&mut self, area: f64) {
        self.detector.params.min_area = area;
    }

    /// Undistort a frame of the calibrated size.
    pub fn undistort<P>(
        &self,
        frame: &ImageBuffer<P, Vec<u8>>,
    ) -> Result<ImageBuffer<P, Vec<u8>>, CalibError>
    where
        P: Pixel<Subpixel = u8>,
    {
        let (w, h) = frame.dimensions();
        if (w, h) != (self.lut.source_width, self.lut.source_height) {
            return Err(CalibError::FrameSize {
                camera: self.index,
                found_width: w,
                found_height: h,
                width: self.lut.source_width,
                height: self.lut.source_height,
            });
        }
        Ok(self.lut.remap(frame))
    }

    pub fn set_template(
        &mut self,
        path: impl AsRef<Path>,
        poster: PosterSize,
    ) -> Result<(), CalibError> {
        let template = ReferenceTemplate::load(path, poster)?;
        debug!(
            "camera {}: template {} with {} points, {}x{}",
            self.index,
            template.path.display(),
            template.point_count,
            template.width,
            template.height
        );
        self.template = Some(template);
        Ok(())
    }

    /// Estimate the pinhole matrix of the undistorted view from chessboard
    /// captures `{dir}/{prefix}{i}.{ext}`, `i` in `0..count`.
    ///
    /// A missing capture aborts; captures without a detectable board are
    /// skipped. The principal point is the undistorted image center.
    pub fn set_intrinsic(
        &mut self,
        dir: impl AsRef<Path>,
        prefix: &str,
        count: usize,
        size: PatternSize,
    ) -> Result<(), CalibError> {
        let dir = dir.as_ref();
        let mut views = Vec::new();
        for i in 0..count {
            let path = dir.join(format!("{prefix}{i}.{}", self.chessboard.image_extension));
            let capture = image::open(&path)
                .map_err(|source| CalibError::Image {
                    path: path.clone(),
                    source,
                })?
                .to_luma8();
            let gray = self.undistort(&capture)?;
            match find_chessboard_corners(&gray, size, &self.chessboard) {
                Some(view) => views.push(view),
                None => debug!("camera {}: no chessboard in {}", self.index, path.display()),
            }
        }
        if views.is_empty() {
            warn!("camera {}: problem with chessboard corner detection", self.index);
            return Err(CalibError::NoChessboard {
                camera: self.index,
                tried: count,
            });
        }

        let k = init_camera_matrix(&views, self.lut.width, self.lut.height)
            .ok_or(CalibError::CameraMatrix { camera: self.index })?;
        info!(
            "camera {}: intrinsics from {}/{count} views, fx {:.2} fy {:.2} cx {:.1} cy {:.1}",
            self.index,
            views.len(),
            k[(0, 0)],
            k[(1, 1)],
            k[(0, 2)],
            k[(1, 2)]
        );
        self.intrinsics = Some(k);
        self.dist_coeffs = [0.0; 4];
        Ok(())
    }

    /// Use a known pinhole matrix of the undistorted view instead of
    /// chessboard captures.
    pub fn set_camera_matrix(&mut self, k: Matrix3<f64>) {
        debug!(
            "camera {}: camera matrix set, fx {:.2} fy {:.2}",
            self.index,
            k[(0, 0)],
            k[(1, 1)]
        );
        self.intrinsics = Some(k);
        self.dist_coeffs = [0.0; 4];
    }

    /// Estimate the camera pose from a frame showing the floor poster.
    ///
    /// On failure the pose and base radius keep their previous values; the
    /// detected (possibly partial) pattern is kept for preview either way.
    pub fn set_extrinsic(&mut self, frame: &RgbImage) -> Result<(), CalibError> {
        let camera = self.index;
        let template = self.template.as_ref().ok_or(CalibError::NotReady {
            camera,
            what: "template",
        })?;
        let k = self.intrinsics.ok_or(CalibError::NotReady {
            camera,
            what: "intrinsics",
        })?;

        let undistorted = self.undistort(frame)?;
        self.reference = template.normalized_points()?;
        let expected = template.point_count;

        let gray = imageops::grayscale(&undistorted);
        let pattern = match self.detector.detect_in_roi(&gray, self.roi) {
            Ok(pattern) => pattern,
            Err(source) => {
                self.pattern = source.partial().cloned().unwrap_or_default();
                warn!("camera {camera}: {source}. Change the calibration image");
                return Err(CalibError::Pattern { camera, source });
            }
        };
        self.pattern = pattern;

        let image_points = self.pattern.image_points();
        if image_points.len() != expected || self.reference.len() != expected {
            return Err(CalibError::PointCount {
                camera,
                found: image_points.len(),
                expected,
            });
        }

        let pose = solve_planar_pose(&self.reference, &image_points, &k)
            .ok_or(CalibError::Pose { camera })?;
        self.base_radius = self.reference[0].coords.xy().norm();
        let (r, t) = (pose.rvec, pose.tvec);
        info!(
            "camera {camera}: pose r = [{:.4} {:.4} {:.4}] t = [{:.4} {:.4} {:.4}]",
            r.x, r.y, r.z, t.x, t.y, t.z
        );
        info!("camera {camera}: base radius {:.4}", self.base_radius);
        self.pose = Some(pose);
        Ok(())
    }

    /// Project a template-frame point into the undistorted image.
    pub fn project(&self, p: &Point3<f64>) -> Option<Point2<f64>> {
        project_point(self.intrinsics.as_ref()?, self.pose.as_ref()?, p)
    }

    pub fn project_points(&self, points: &[Point3<f64>]) -> Vec<Option<Point2<f64>>> {
        points.iter().map(|p| self.project(p)).collect()
    }

    /// Pixel of the undistorted image hit by `p`, if it carries fisheye data.
    fn visible_pixel(&self, p: &Point3<f64>) -> Option<Point2<f64>> {
        let q = self.project(p)?;
        let (w, h) = (self.lut.width as f64, self.lut.height as f64);
        if !(q.x >= 0.0 && q.y >= 0.0 && q.x < w && q.y < h) {
            return None;
        }
        let x = (q.x.round() as u32).min(self.lut.width - 1);
        let y = (q.y.round() as u32).min(self.lut.height - 1);
        self.lut.is_valid(x, y).then_some(q)
    }

    /// Normalized fisheye texture coordinate of a template-frame point.
    pub fn texture_coord(&self, p: &Point3<f64>) -> Option<[f32; 2]> {
        let q = self.visible_pixel(p)?;
        let (sx, sy) = self.lut.source_at(q.x, q.y)?;
        Some([
            (sx / self.lut.source_width as f64) as f32,
            (sy / self.lut.source_height as f64) as f32,
        ])
    }

    /// Number of bowl wall rings this camera can see.
    ///
    /// Ring `i` is tested at `(0, -radius - i*step, -(i*step)^2)`, straight
    /// ahead of the camera; the count stops at the first ring that falls
    /// outside the undistorted image or onto a pixel without fisheye data.
    /// Zero until intrinsics and pose are known.
    pub fn bowl_height(&self, radius: f64, step: f64) -> usize {
        if self.intrinsics.is_none() || self.pose.is_none() {
            return 0;
        }
        let mut num = 1;
        let mut next = true;
        while next && num < MAX_BOWL_RINGS {
            let s = num as f64 * step;
            next = self
                .visible_pixel(&Point3::new(0.0, -radius - s, -(s * s)))
                .is_some();
            num += 1;
        }
        num.saturating_sub(2)
    }

    /// Pattern outlines in this camera's preview tile.
    pub fn contour_lines(&self) -> Vec<[[f32; 3]; 2]> {
        match self.slot() {
            Some(slot) => self
                .pattern
                .outline_segments(slot.tile(), self.lut.width, self.lut.height),
            None => Vec::new(),
        }
    }

    /// Undistorted preview of the camera in its screen tile.
    pub fn preview_mesh(&self, density: u32) -> Vec<MeshVertex> {
        match self.slot() {
            Some(slot) => self.lut.preview_mesh(density, slot.tile()),
            None => Vec::new(),
        }
    }
}
