//! JSON configuration of a calibration session.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use surround_bowl::{BowlGridParams, SeamParams};
use surround_calib::{CameraParams, PatternSize};
use surround_exposure::GainParams;

/// Most cameras a rig can have; one per vehicle side.
pub const MAX_CAMERAS: usize = 4;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Output size of the stitched view, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySize {
    pub width: u32,
    pub height: u32,
}

impl Default for DisplaySize {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub display: DisplaySize,
    /// One entry per camera, in rig order (front, right, rear, left).
    pub cameras: Vec<CameraParams>,
    /// Holds `template_{n}.txt` for every camera.
    pub template_dir: PathBuf,
    /// Holds `chessboard_{n}/frame{n}_{i}.{ext}` captures.
    pub chessboard_dir: PathBuf,
    /// Meshes, masks and the compensator directory go here.
    pub output_dir: PathBuf,
    pub grid: BowlGridParams,
    /// Flat floor radius in units of each camera's base radius.
    pub bowl_radius: f64,
    pub seam: SeamParams,
    pub gain: GainParams,
    pub pattern_size: PatternSize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display: DisplaySize::default(),
            cameras: (1..=MAX_CAMERAS)
                .map(|n| CameraParams {
                    model: PathBuf::from(format!("models/calib_results_{n}.txt")),
                    ..CameraParams::default()
                })
                .collect(),
            template_dir: PathBuf::from("templates"),
            chessboard_dir: PathBuf::from("models"),
            output_dir: PathBuf::from("out"),
            grid: BowlGridParams::default(),
            bowl_radius: 1.2,
            seam: SeamParams::default(),
            gain: GainParams::default(),
            pattern_size: PatternSize::default(),
        }
    }
}

impl SessionConfig {
    /// Load a JSON config from disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Resolve every relative path against `base` (usually the directory of
    /// the config file).
    pub fn rebase(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.template_dir);
        join(&mut self.chessboard_dir);
        join(&mut self.output_dir);
        for cam in &mut self.cameras {
            join(&mut cam.model);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.cameras.is_empty() || self.cameras.len() > MAX_CAMERAS {
            return invalid(format!(
                "{} cameras, expected 1..={MAX_CAMERAS}",
                self.cameras.len()
            ));
        }
        if self.display.width == 0 || self.display.height == 0 {
            return invalid(format!(
                "display size {}x{}",
                self.display.width, self.display.height
            ));
        }
        for (i, cam) in self.cameras.iter().enumerate() {
            if !(cam.scale_factor > 0.0) {
                return invalid(format!("camera {i}: scale factor {}", cam.scale_factor));
            }
            if !(0.0..=100.0).contains(&cam.roi_percent) {
                return invalid(format!("camera {i}: roi {}%", cam.roi_percent));
            }
            if !(cam.contour_min_area >= 0.0) {
                return invalid(format!(
                    "camera {i}: contour min area {}",
                    cam.contour_min_area
                ));
            }
            if let Some([fx, fy, cx, cy]) = cam.camera_matrix {
                let finite = [fx, fy, cx, cy].iter().all(|v| v.is_finite());
                if !finite || fx <= 0.0 || fy <= 0.0 {
                    return invalid(format!("camera {i}: camera matrix {fx} {fy} {cx} {cy}"));
                }
            }
        }
        if !(self.bowl_radius > 0.0) {
            return invalid(format!("bowl radius {}", self.bowl_radius));
        }
        if self.grid.angles == 0 || !(self.grid.step_x > 0.0) {
            return invalid(format!(
                "grid angles {} step {}",
                self.grid.angles, self.grid.step_x
            ));
        }
        if !(0.0..45.0).contains(&self.grid.start_angle) {
            return invalid(format!("grid start angle {}", self.grid.start_angle));
        }
        if !(self.seam.smooth_angle >= 0.0) {
            return invalid(format!("smooth angle {}", self.seam.smooth_angle));
        }
        if !(self.gain.gamma > 0.0) {
            return invalid(format!("gain gamma {}", self.gain.gamma));
        }
        if self.pattern_size.cols < 2 || self.pattern_size.rows < 2 {
            return invalid(format!(
                "chessboard pattern {}x{}",
                self.pattern_size.cols, self.pattern_size.rows
            ));
        }
        Ok(())
    }

    pub fn template_path(&self, camera: usize) -> PathBuf {
        self.template_dir
            .join(format!("template_{}.txt", camera + 1))
    }

    /// Directory and file prefix of camera `camera`'s chessboard captures.
    pub fn chessboard_captures(&self, camera: usize) -> (PathBuf, String) {
        let n = camera + 1;
        (
            self.chessboard_dir.join(format!("chessboard_{n}")),
            format!("frame{n}_"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_and_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        let config = SessionConfig::default();
        config.validate().expect("valid");
        config.write_json(&path).expect("write");

        let loaded = SessionConfig::load_json(&path).expect("load");
        assert_eq!(loaded.cameras.len(), 4);
        assert_eq!(loaded.display, config.display);
        assert_eq!(loaded.cameras[2].model, PathBuf::from("models/calib_results_3.txt"));
        assert_eq!(loaded.grid.angles, config.grid.angles);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{ "bowl_radius": 2.0, "cameras": [{ "scale_factor": 3.0 }] }"#)
                .expect("parse");
        assert_eq!(config.bowl_radius, 2.0);
        assert_eq!(config.cameras.len(), 1);
        assert_eq!(config.cameras[0].scale_factor, 3.0);
        assert_eq!(config.cameras[0].roi_percent, 50.0);
        assert_eq!(config.display, DisplaySize::default());
        config.validate().expect("valid");
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut config = SessionConfig::default();
        config.cameras.push(CameraParams::default());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = SessionConfig::default();
        config.cameras[1].roi_percent = 120.0;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.grid.start_angle = 45.0;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.bowl_radius = -1.0;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.cameras[3].camera_matrix = Some([0.0, 320.0, 320.0, 240.0]);
        assert!(config.validate().is_err());
        config.cameras[3].camera_matrix = Some([320.0, 320.0, 320.0, 240.0]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn paths_follow_the_rig_numbering() {
        let mut config = SessionConfig::default();
        config.rebase(Path::new("/rig"));
        assert_eq!(config.template_path(1), PathBuf::from("/rig/templates/template_2.txt"));
        let (dir, prefix) = config.chessboard_captures(0);
        assert_eq!(dir, PathBuf::from("/rig/models/chessboard_1"));
        assert_eq!(prefix, "frame1_");
        assert_eq!(config.cameras[3].model, PathBuf::from("/rig/models/calib_results_4.txt"));
    }

    #[test]
    fn broken_json_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").expect("write");
        assert!(matches!(
            SessionConfig::load_json(&path),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            SessionConfig::load_json(dir.path().join("absent.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
