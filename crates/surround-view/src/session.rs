//! The calibration session and its view-state machine.
//!
//! The operator walks the rig through five views, each building on the
//! previous: raw fisheye frames, undistorted previews, detected pattern
//! outlines, bowl grids, and finally the saved stitching outputs. Entering a
//! view computes what it shows; a failed entry leaves the session where it
//! was.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use image::{Rgb, RgbImage};
use log::{error, info};
use surround_bowl::{common_ring_count, BowlGrid, GridError, SeamError, SeamMaskBuilder};
use surround_calib::{poster_size_from_templates, CalibError, CameraModel, PosterSize};
use surround_core::{FormatError, MeshVertex};
use surround_exposure::{Compensator, CompensatorError, FrameStore};
#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::config::{ConfigError, SessionConfig};

/// Vertices per side of the undistorted preview meshes.
const PREVIEW_DENSITY: u32 = 10;

/// Anything that can hand over the current frame of a camera.
pub trait FrameSource {
    fn frame(&mut self, camera: usize) -> Option<RgbImage>;
}

impl FrameSource for FrameStore<Rgb<u8>> {
    fn frame(&mut self, camera: usize) -> Option<RgbImage> {
        self.latest(camera)
    }
}

impl FrameSource for Vec<RgbImage> {
    fn frame(&mut self, camera: usize) -> Option<RgbImage> {
        self.get(camera).cloned()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ViewState {
    Fisheye,
    Defisheye,
    Contours,
    Grids,
    Result,
}

impl ViewState {
    pub const ALL: [ViewState; 5] = [
        ViewState::Fisheye,
        ViewState::Defisheye,
        ViewState::Contours,
        ViewState::Grids,
        ViewState::Result,
    ];

    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self as usize + 1).copied()
    }

    pub fn prev(self) -> Option<Self> {
        (self as usize).checked_sub(1).map(|i| Self::ALL[i])
    }
}

impl fmt::Display for ViewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViewState::Fisheye => "fisheye view",
            ViewState::Defisheye => "defisheye view",
            ViewState::Contours => "contours view",
            ViewState::Grids => "grids view",
            ViewState::Result => "result view",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Calib(#[from] CalibError),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Seam(#[from] SeamError),
    #[error(transparent)]
    Compensator(#[from] CompensatorError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("camera {camera} is not calibrated")]
    NotCalibrated { camera: usize },
    #[error("no bowl grids, enter the grids view first")]
    NoGrids,
    #[error("cannot create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no view {direction} {state}")]
    Boundary {
        state: ViewState,
        direction: &'static str,
    },
    #[error("config has {found} cameras, the session was started with {expected}")]
    CameraCount { expected: usize, found: usize },
}

/// A problem that did not stop the stage.
#[derive(Clone, Debug)]
pub struct CameraFailure {
    /// `None` when the problem belongs to the whole rig.
    pub camera: Option<usize>,
    pub message: String,
}

#[derive(Clone, Debug, Default)]
pub enum StageOutput {
    #[default]
    None,
    /// Undistorted preview mesh of every camera.
    Previews(Vec<Vec<MeshVertex>>),
    /// Line segments to overlay (pattern outlines or grid wireframes).
    Lines(Vec<[[f32; 3]; 2]>),
    /// Files written by the result view.
    Saved(Vec<PathBuf>),
}

#[derive(Clone, Debug)]
pub struct StageReport {
    pub state: ViewState,
    pub output: StageOutput,
    pub failures: Vec<CameraFailure>,
}

impl StageReport {
    fn new(state: ViewState, output: StageOutput) -> Self {
        Self {
            state,
            output,
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, camera: usize, err: impl fmt::Display) {
        error!("camera {camera}: {err}");
        self.failures.push(CameraFailure {
            camera: Some(camera),
            message: err.to_string(),
        });
    }

    fn fail_rig(&mut self, what: &str, err: impl fmt::Display) {
        error!("{what}: {err}");
        self.failures.push(CameraFailure {
            camera: None,
            message: format!("{what}: {err}"),
        });
    }
}

pub struct CalibrationSession {
    config: SessionConfig,
    poster: PosterSize,
    cameras: Vec<CameraModel>,
    grids: Vec<BowlGrid>,
    compensator: Compensator,
    state: ViewState,
}

impl CalibrationSession {
    /// Validate the config, read the poster size from the first two
    /// templates and load every camera model. Any model failure is fatal.
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let poster = poster_size_from_templates(config.template_path(0), config.template_path(1))?;
        let cameras = config
            .cameras
            .iter()
            .enumerate()
            .map(|(i, params)| {
                CameraModel::load(i, params).inspect_err(|e| error!("camera {i}: {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            "session with {} cameras, poster {}x{}",
            cameras.len(),
            poster.width,
            poster.height
        );
        let compensator = Compensator::new(config.display.width, config.display.height);
        Ok(Self {
            config,
            poster,
            cameras,
            grids: Vec::new(),
            compensator,
            state: ViewState::Fisheye,
        })
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn poster(&self) -> PosterSize {
        self.poster
    }

    pub fn cameras(&self) -> &[CameraModel] {
        &self.cameras
    }

    pub fn grids(&self) -> &[BowlGrid] {
        &self.grids
    }

    pub fn compensator(&self) -> &Compensator {
        &self.compensator
    }

    /// Swap in a reloaded config. The camera count cannot change; the new
    /// values take effect on the next [`CalibrationSession::refresh`].
    pub fn set_config(&mut self, config: SessionConfig) -> Result<(), SessionError> {
        config.validate()?;
        if config.cameras.len() != self.cameras.len() {
            return Err(SessionError::CameraCount {
                expected: self.cameras.len(),
                found: config.cameras.len(),
            });
        }
        self.config = config;
        Ok(())
    }

    pub fn advance(&mut self, source: &mut impl FrameSource) -> Result<StageReport, SessionError> {
        let next = self.state.next().ok_or(SessionError::Boundary {
            state: self.state,
            direction: "after",
        })?;
        self.transition(next, source)
    }

    pub fn retreat(&mut self, source: &mut impl FrameSource) -> Result<StageReport, SessionError> {
        let prev = self.state.prev().ok_or(SessionError::Boundary {
            state: self.state,
            direction: "before",
        })?;
        self.transition(prev, source)
    }

    /// Recompute the current view with the current config.
    pub fn refresh(&mut self, source: &mut impl FrameSource) -> Result<StageReport, SessionError> {
        info!("updating {}", self.state);
        let report = self.update(self.state, source)?;
        info!("{} done", self.state);
        Ok(report)
    }

    fn transition(
        &mut self,
        state: ViewState,
        source: &mut impl FrameSource,
    ) -> Result<StageReport, SessionError> {
        info!("entering {state}");
        let report = self.enter(state, source)?;
        self.state = state;
        info!("{state} done");
        Ok(report)
    }

    /// Compute what `state` shows on entry.
    #[cfg_attr(feature = "tracing", instrument(level = "info", skip(self, source)))]
    pub fn enter(
        &mut self,
        state: ViewState,
        source: &mut impl FrameSource,
    ) -> Result<StageReport, SessionError> {
        match state {
            ViewState::Fisheye => Ok(StageReport::new(state, StageOutput::None)),
            ViewState::Defisheye => Ok(self.previews()),
            ViewState::Contours => Ok(self.contours(source)),
            ViewState::Grids => self.build_grids(),
            ViewState::Result => self.save_results(),
        }
    }

    /// Recompute `state` after a config change.
    pub fn update(
        &mut self,
        state: ViewState,
        source: &mut impl FrameSource,
    ) -> Result<StageReport, SessionError> {
        match state {
            ViewState::Defisheye => {
                for (cam, params) in self.cameras.iter_mut().zip(&self.config.cameras) {
                    cam.update_lut(params.scale_factor);
                }
                Ok(self.previews())
            }
            _ => self.enter(state, source),
        }
    }

    fn previews(&self) -> StageReport {
        StageReport::new(
            ViewState::Defisheye,
            StageOutput::Previews(
                self.cameras
                    .iter()
                    .map(|c| c.preview_mesh(PREVIEW_DENSITY))
                    .collect(),
            ),
        )
    }

    fn calibrate_camera(&mut self, index: usize, frame: &RgbImage) -> Result<(), CalibError> {
        let params = &self.config.cameras[index];
        let template = self.config.template_path(index);
        let (dir, prefix) = self.config.chessboard_captures(index);
        let cam = &mut self.cameras[index];
        cam.set_roi(params.roi_percent);
        cam.set_contour_min_area(params.contour_min_area);
        cam.set_template(template, self.poster)?;
        match params.known_camera_matrix() {
            Some(k) => cam.set_camera_matrix(k),
            None => {
                let size = self.config.pattern_size;
                cam.set_intrinsic(dir, &prefix, params.chessboard_count, size)?
            }
        }
        cam.set_extrinsic(frame)
    }

    /// Calibrate every camera against its current frame. A camera that fails
    /// is reported and contributes no outline.
    fn contours(&mut self, source: &mut impl FrameSource) -> StageReport {
        let mut report = StageReport::new(ViewState::Contours, StageOutput::None);
        let mut lines = Vec::new();
        for i in 0..self.cameras.len() {
            let Some(frame) = source.frame(i) else {
                report.fail(i, "no frame");
                continue;
            };
            match self.calibrate_camera(i, &frame) {
                Ok(()) => lines.extend(self.cameras[i].contour_lines()),
                Err(e) => report.fail(i, e),
            }
        }
        report.output = StageOutput::Lines(lines);
        report
    }

    fn build_grids(&mut self) -> Result<StageReport, SessionError> {
        if let Some(cam) = self.cameras.iter().find(|c| c.pose().is_none()) {
            return Err(SessionError::NotCalibrated {
                camera: cam.index(),
            });
        }
        let mut params = self.config.grid.clone();
        params.nop_z = common_ring_count(&self.cameras, self.config.bowl_radius, &params);
        info!("{} wall rings visible to every camera", params.nop_z);

        let grids = self
            .cameras
            .iter()
            .map(|cam| {
                BowlGrid::build(
                    cam.index(),
                    cam,
                    self.config.bowl_radius * cam.base_radius(),
                    &params,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let lines = grids.iter().flat_map(|g| g.wireframe()).collect();
        self.grids = grids;
        Ok(StageReport::new(ViewState::Grids, StageOutput::Lines(lines)))
    }

    /// Write the bowl meshes, then the blend masks, split meshes and the
    /// compensator. Only the meshes are required; later outputs are
    /// reported as failures, per camera where one is to blame.
    fn save_results(&mut self) -> Result<StageReport, SessionError> {
        if self.grids.is_empty() {
            return Err(SessionError::NoGrids);
        }
        let out = self.config.output_dir.clone();
        fs::create_dir_all(&out).map_err(|source| SessionError::CreateDir {
            path: out.clone(),
            source,
        })?;

        let mut report = StageReport::new(ViewState::Result, StageOutput::None);
        let mut saved = Vec::new();
        for grid in &self.grids {
            grid.save(&out)?;
            saved.push(out.join(format!("array{}", grid.camera() + 1)));
        }

        let blender = SeamMaskBuilder::new(self.config.seam.clone());
        match blender.build(&self.grids) {
            Ok(masks) => {
                for mask in &masks {
                    match mask.save(&out) {
                        Ok(path) => saved.push(path),
                        Err(e) => report.fail(mask.camera, e),
                    }
                }
            }
            Err(e) => report.fail_rig("blend masks not built", e),
        }
        match blender.split(&self.grids) {
            Ok(splits) => {
                for split in &splits {
                    match split.save(&out) {
                        Ok(()) => {
                            let n = split.camera + 1;
                            saved.push(out.join(format!("array{n}1")));
                            saved.push(out.join(format!("array{n}2")));
                        }
                        Err(e) => report.fail(split.camera, e),
                    }
                }
            }
            Err(e) => report.fail_rig("meshes not split", e),
        }

        let seams: Vec<_> = self.grids.iter().map(|g| g.seam_points()).collect();
        let compensator_dir = out.join("compensator");
        let compensated = self
            .compensator
            .feed(&seams)
            .and_then(|()| self.compensator.save(&compensator_dir, &out));
        match compensated {
            Ok(()) => saved.push(compensator_dir.join("compensator")),
            Err(e) => report.fail_rig("compensator grids not saved", e),
        }

        info!("{} files written to {}", saved.len(), out.display());
        report.output = StageOutput::Saved(saved);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_walk_in_order() {
        let mut state = ViewState::Fisheye;
        let mut seen = vec![state];
        while let Some(next) = state.next() {
            state = next;
            seen.push(state);
        }
        assert_eq!(seen, ViewState::ALL);
        assert_eq!(ViewState::Result.next(), None);
        assert_eq!(ViewState::Fisheye.prev(), None);
        assert_eq!(ViewState::Grids.prev(), Some(ViewState::Contours));
    }

    #[test]
    fn vec_source_hands_out_copies() {
        let mut frames = vec![RgbImage::new(2, 2)];
        assert!(frames.frame(0).is_some());
        assert!(frames.frame(1).is_none());
    }

    #[test]
    fn store_source_reads_the_latest_frame() {
        let mut store: FrameStore = FrameStore::new(1);
        assert!(store.frame(0).is_none());
        store
            .publish(0, RgbImage::from_pixel(1, 1, Rgb([7, 7, 7])))
            .expect("slot");
        assert_eq!(store.frame(0).expect("frame").get_pixel(0, 0), &Rgb([7, 7, 7]));
    }
}
