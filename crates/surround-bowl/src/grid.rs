//! Curvilinear bowl grid of one camera.
//!
//! The grid covers the camera's angular sector: a flat disk on the floor
//! (`z = 0`) out to the calibrated radius, then wall rings rising as
//! `z = -(j * step)^2` (the template frame points `z` down). Vertices are
//! textured by projecting them into the camera and emitted in the shared
//! vehicle frame.

use std::path::Path;

use log::{debug, info};
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use surround_calib::CameraModel;
use surround_core::{write_mesh, CameraSlot, FormatError, MeshVertex};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Number of seam points every grid reports.
pub const SEAM_POINTS: usize = 8;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BowlGridParams {
    /// Angular steps across the sector.
    pub angles: usize,
    /// Sector inset from the camera's side axis, degrees, in `[0, 45)` so
    /// neighbouring sectors overlap.
    pub start_angle: f64,
    /// Upper bound on wall rings; the rig uses the smallest count every
    /// camera can see.
    pub nop_z: usize,
    /// Radial step, in template units.
    pub step_x: f64,
}

impl Default for BowlGridParams {
    fn default() -> Self {
        Self {
            angles: 60,
            start_angle: 10.0,
            nop_z: 4,
            step_x: 0.1,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum GridError {
    #[error("camera {camera}: invalid grid parameters: {reason}")]
    InvalidParams { camera: usize, reason: String },
    #[error("camera {camera} has no slot on the rig")]
    NoSlot { camera: usize },
    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Something that can texture bowl vertices: a calibrated camera.
pub trait TextureProjector {
    /// Normalized fisheye texture coordinate of a template-frame point.
    fn texture_coord(&self, p: &Point3<f64>) -> Option<[f32; 2]>;
    /// Pixel size of the fisheye frame the coordinates refer to.
    fn texture_size(&self) -> (u32, u32);
}

impl TextureProjector for CameraModel {
    fn texture_coord(&self, p: &Point3<f64>) -> Option<[f32; 2]> {
        CameraModel::texture_coord(self, p)
    }

    fn texture_size(&self) -> (u32, u32) {
        (self.lut().source_width, self.lut().source_height)
    }
}

/// Wall rings every camera of the rig can see, capped at `params.nop_z`.
///
/// Each camera is checked at `bowl_radius` times its own base radius.
pub fn common_ring_count(
    cameras: &[CameraModel],
    bowl_radius: f64,
    params: &BowlGridParams,
) -> usize {
    cameras.iter().fold(params.nop_z, |acc, cam| {
        let visible = cam.bowl_height(bowl_radius * cam.base_radius(), params.step_x);
        debug!("camera {}: {visible} visible bowl rings", cam.index());
        acc.min(visible)
    })
}

#[derive(Clone, Copy, Debug)]
struct GridNode {
    position: Point3<f64>,
    tex: Option<[f32; 2]>,
}

#[derive(Clone, Debug)]
pub struct BowlGrid {
    camera: usize,
    slot: CameraSlot,
    params: BowlGridParams,
    radius: f64,
    texture_size: (u32, u32),
    /// `rings[0]` is the disk center, then flat rings, then wall rings; each
    /// ring holds `angles + 1` nodes from the left to the right seam ray.
    rings: Vec<Vec<GridNode>>,
    flat_rings: usize,
}

impl BowlGrid {
    /// Build the grid of camera `camera` for a flat disk of `radius`
    /// (template units) and `params.nop_z` wall rings.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip(projector, params)))]
    pub fn build(
        camera: usize,
        projector: &impl TextureProjector,
        radius: f64,
        params: &BowlGridParams,
    ) -> Result<Self, GridError> {
        let invalid = |reason: String| GridError::InvalidParams { camera, reason };
        let slot = CameraSlot::from_index(camera).ok_or(GridError::NoSlot { camera })?;
        if params.angles == 0 {
            return Err(invalid("zero angular steps".into()));
        }
        if !(params.step_x > 0.0) || !(radius > 0.0) {
            return Err(invalid(format!("step {} radius {radius}", params.step_x)));
        }
        if !(0.0..45.0).contains(&params.start_angle) {
            return Err(invalid(format!("start angle {}", params.start_angle)));
        }

        let first = (params.start_angle - 180.0).to_radians();
        let last = (-params.start_angle).to_radians();
        let azimuths: Vec<f64> = (0..=params.angles)
            .map(|a| first + (last - first) * a as f64 / params.angles as f64)
            .collect();

        let flat_rings = (radius / params.step_x).ceil().max(1.0) as usize;
        let mut profile: Vec<(f64, f64)> = (1..=flat_rings)
            .map(|k| (radius * k as f64 / flat_rings as f64, 0.0))
            .collect();
        profile.extend((1..=params.nop_z).map(|j| {
            let s = j as f64 * params.step_x;
            (radius + s, -(s * s))
        }));

        let node = |position: Point3<f64>| GridNode {
            position,
            tex: projector.texture_coord(&position),
        };
        let mut rings = vec![vec![node(Point3::origin()); azimuths.len()]];
        for (r, z) in profile {
            rings.push(
                azimuths
                    .iter()
                    .map(|phi| node(Point3::new(r * phi.cos(), r * phi.sin(), z)))
                    .collect(),
            );
        }

        let grid = Self {
            camera,
            slot,
            params: params.clone(),
            radius,
            texture_size: projector.texture_size(),
            rings,
            flat_rings,
        };
        info!(
            "camera {camera}: bowl grid with {} flat and {} wall rings, {} triangles",
            flat_rings,
            params.nop_z,
            grid.mesh().len() / 3
        );
        Ok(grid)
    }

    pub fn camera(&self) -> usize {
        self.camera
    }

    pub fn slot(&self) -> CameraSlot {
        self.slot
    }

    pub fn params(&self) -> &BowlGridParams {
        &self.params
    }

    pub fn radius(&self) -> f64 {
        self.radius
    }

    pub fn texture_size(&self) -> (u32, u32) {
        self.texture_size
    }

    pub fn wall_rings(&self) -> usize {
        self.params.nop_z
    }

    fn vertex(&self, n: &GridNode) -> Option<MeshVertex> {
        let p = self.slot.to_vehicle(n.position);
        n.tex
            .map(|tex| MeshVertex::new([p.x as f32, p.y as f32, p.z as f32], tex))
    }

    /// Textured triangle list in the vehicle frame. Triangles touching an
    /// untextured vertex are left out.
    pub fn mesh(&self) -> Vec<MeshVertex> {
        let mut out = Vec::new();
        for (ring, pair) in self.rings.windows(2).enumerate() {
            let (inner, outer) = (&pair[0], &pair[1]);
            for a in 0..inner.len() - 1 {
                let mut tris = vec![[&inner[a], &outer[a], &outer[a + 1]]];
                // around the center the inner ring is a single apex
                if ring > 0 {
                    tris.push([&inner[a], &outer[a + 1], &inner[a + 1]]);
                }
                for tri in tris {
                    if let (Some(v0), Some(v1), Some(v2)) =
                        (self.vertex(tri[0]), self.vertex(tri[1]), self.vertex(tri[2]))
                    {
                        out.extend([v0, v1, v2]);
                    }
                }
            }
        }
        out
    }

    /// Grid lines (rings and rays) in the vehicle frame, for preview.
    pub fn wireframe(&self) -> Vec<[[f32; 3]; 2]> {
        let point = |n: &GridNode| {
            n.tex.map(|_| {
                let p = self.slot.to_vehicle(n.position);
                [p.x as f32, p.y as f32, p.z as f32]
            })
        };
        let mut lines = Vec::new();
        for ring in &self.rings[1..] {
            for w in ring.windows(2) {
                if let (Some(a), Some(b)) = (point(&w[0]), point(&w[1])) {
                    lines.push([a, b]);
                }
            }
        }
        for pair in self.rings.windows(2) {
            for (a, b) in pair[0].iter().zip(&pair[1]) {
                if let (Some(a), Some(b)) = (point(a), point(b)) {
                    lines.push([a, b]);
                }
            }
        }
        lines
    }

    /// The eight seam points in the vehicle frame.
    ///
    /// Left ray: inner ring, disk edge, first wall ring, top ring; then the
    /// right ray in reverse order. Without wall rings the wall entries repeat
    /// the disk edge.
    pub fn seam_points(&self) -> [Point3<f64>; SEAM_POINTS] {
        let inner = &self.rings[1];
        let edge = &self.rings[self.flat_rings];
        let wall = &self.rings[(self.flat_rings + 1).min(self.rings.len() - 1)];
        let top = &self.rings[self.rings.len() - 1];
        let l = 0;
        let r = inner.len() - 1;
        [
            inner[l], edge[l], wall[l], top[l], top[r], wall[r], edge[r], inner[r],
        ]
        .map(|n| self.slot.to_vehicle(n.position))
    }

    /// Write the full mesh as `array{n}` (`n` counted from 1).
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<(), GridError> {
        let path = dir.as_ref().join(format!("array{}", self.camera + 1));
        write_mesh(&path, &self.mesh())?;
        debug!("camera {}: grid written to {}", self.camera, path.display());
        Ok(())
    }
}
