//! Blending masks and overlap/non-overlap mesh split.
//!
//! Adjacent camera sectors overlap by `90 - 2 * start_angle` degrees. Inside
//! an overlap each camera's weight rises from 0 at its own seam ray to 1 at
//! the neighbour's, along a smoothstep of width `smooth_angle` centered on
//! the overlap bisector, so the two weights of any overlap point sum to one.

use std::path::{Path, PathBuf};

use image::{GrayImage, Luma};
use log::{debug, warn};
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use surround_core::{previous_index, write_mesh, CameraSlot, FormatError, MeshVertex};

use crate::grid::BowlGrid;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SeamParams {
    /// Width of the blending band, degrees.
    pub smooth_angle: f64,
}

impl Default for SeamParams {
    fn default() -> Self {
        Self { smooth_angle: 10.0 }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SeamError {
    #[error("no grids to blend")]
    NoGrids,
    #[error("camera {camera}: seams do not overlap ({overlap:.2} degrees)")]
    Degenerate { camera: usize, overlap: f64 },
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("cannot write mask {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

fn smoothstep(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Blend weight of a camera at azimuth `phi` (degrees, camera template
/// frame, sector `[start - 180, -start]`).
pub fn blend_weight(phi: f64, start_angle: f64, smooth_angle: f64) -> f64 {
    let overlap = 90.0 - 2.0 * start_angle;
    let band = smooth_angle.clamp(1e-6, overlap.max(1e-6));
    let left_mid = start_angle - 180.0 + overlap / 2.0;
    let right_mid = -start_angle - overlap / 2.0;
    let rising = smoothstep((phi - (left_mid - band / 2.0)) / band);
    let falling = smoothstep((right_mid + band / 2.0 - phi) / band);
    rising.min(falling)
}

fn azimuth_deg(p: Point2<f64>) -> f64 {
    p.y.atan2(p.x).to_degrees()
}

/// Signed angle from `from` to `to` in `(-180, 180]` degrees.
fn angle_between(from: f64, to: f64) -> f64 {
    let mut d = (to - from) % 360.0;
    if d <= -180.0 {
        d += 360.0;
    } else if d > 180.0 {
        d -= 360.0;
    }
    d
}

/// Per-camera weight image in fisheye texture space (255 = this camera only).
#[derive(Clone, Debug)]
pub struct BlendMask {
    pub camera: usize,
    pub image: GrayImage,
}

impl BlendMask {
    /// Write `mask{n}.png` (`n` counted from 1).
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<PathBuf, SeamError> {
        let path = dir.as_ref().join(format!("mask{}.png", self.camera + 1));
        self.image.save(&path).map_err(|source| SeamError::Image {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// A camera mesh split by blending: triangles touching an overlap, and the
/// rest.
#[derive(Clone, Debug, Default)]
pub struct SplitMesh {
    pub camera: usize,
    pub overlap: Vec<MeshVertex>,
    pub exclusive: Vec<MeshVertex>,
}

impl SplitMesh {
    /// Write `array{n}1` (overlap) and `array{n}2` (non-overlap).
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<(), SeamError> {
        let dir = dir.as_ref();
        let n = self.camera + 1;
        write_mesh(dir.join(format!("array{n}1")), &self.overlap)?;
        write_mesh(dir.join(format!("array{n}2")), &self.exclusive)?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct SeamMaskBuilder {
    pub params: SeamParams,
}

impl SeamMaskBuilder {
    pub fn new(params: SeamParams) -> Self {
        Self { params }
    }

    fn vertex_weight(&self, grid: &BowlGrid, position: [f32; 3]) -> f64 {
        let p = Point3::new(position[0] as f64, position[1] as f64, position[2] as f64);
        vehicle_weight(
            grid.slot(),
            p,
            grid.params().start_angle,
            self.params.smooth_angle,
        )
    }

    /// Every camera's left seam ray must turn back into its left
    /// neighbour's right seam ray.
    pub fn check_seams(&self, grids: &[BowlGrid]) -> Result<(), SeamError> {
        if grids.is_empty() {
            return Err(SeamError::NoGrids);
        }
        for (i, grid) in grids.iter().enumerate() {
            let start = grid.params().start_angle;
            if grids.len() < 2 {
                if start >= 45.0 {
                    return Err(SeamError::Degenerate {
                        camera: grid.camera(),
                        overlap: 90.0 - 2.0 * start,
                    });
                }
                continue;
            }
            let prev = &grids[previous_index(i, grids.len())];
            let own_left = grid.seam_points()[1].xy();
            let prev_right = prev.seam_points()[6].xy();
            let overlap = angle_between(azimuth_deg(own_left), azimuth_deg(prev_right));
            if overlap <= 1e-6 {
                return Err(SeamError::Degenerate {
                    camera: grid.camera(),
                    overlap,
                });
            }
        }
        Ok(())
    }

    /// Rasterize each camera's blend weights into its texture space.
    pub fn build(&self, grids: &[BowlGrid]) -> Result<Vec<BlendMask>, SeamError> {
        self.check_seams(grids)?;
        Ok(grids
            .iter()
            .map(|grid| {
                let (w, h) = grid.texture_size();
                let mut image = GrayImage::new(w, h);
                let mesh = grid.mesh();
                for tri in mesh.chunks_exact(3) {
                    let corners = [tri[0], tri[1], tri[2]].map(|v| {
                        (
                            Point2::new(v.tex[0] as f64 * w as f64, v.tex[1] as f64 * h as f64),
                            self.vertex_weight(grid, v.position),
                        )
                    });
                    fill_triangle(&mut image, corners);
                }
                debug!("camera {}: blend mask {w}x{h}", grid.camera());
                BlendMask {
                    camera: grid.camera(),
                    image,
                }
            })
            .collect())
    }

    /// Split each mesh into triangles with any vertex weight below one and
    /// the rest.
    pub fn split(&self, grids: &[BowlGrid]) -> Result<Vec<SplitMesh>, SeamError> {
        if let Err(e) = self.check_seams(grids) {
            warn!("texel/vertex grids not split: {e}");
            return Err(e);
        }
        Ok(grids
            .iter()
            .map(|grid| {
                let mut split = SplitMesh {
                    camera: grid.camera(),
                    ..SplitMesh::default()
                };
                for tri in grid.mesh().chunks_exact(3) {
                    let blended = tri
                        .iter()
                        .any(|v| self.vertex_weight(grid, v.position) < 1.0);
                    if blended {
                        split.overlap.extend_from_slice(tri);
                    } else {
                        split.exclusive.extend_from_slice(tri);
                    }
                }
                debug!(
                    "camera {}: {} overlap, {} exclusive triangles",
                    grid.camera(),
                    split.overlap.len() / 3,
                    split.exclusive.len() / 3
                );
                split
            })
            .collect())
    }
}

/// Barycentric fill; overlapping triangles keep the larger weight.
fn fill_triangle(image: &mut GrayImage, tri: [(Point2<f64>, f64); 3]) {
    let [(a, wa), (b, wb), (c, wc)] = tri;
    let area = (b.x - a.x) * (c.y - a.y) - (c.x - a.x) * (b.y - a.y);
    if area.abs() < 1e-12 {
        return;
    }
    let (w, h) = image.dimensions();
    let x0 = a.x.min(b.x).min(c.x).floor().max(0.0) as u32;
    let y0 = a.y.min(b.y).min(c.y).floor().max(0.0) as u32;
    let x1 = (a.x.max(b.x).max(c.x).ceil() as i64).min(w as i64 - 1);
    let y1 = (a.y.max(b.y).max(c.y).ceil() as i64).min(h as i64 - 1);
    if x1 < 0 || y1 < 0 {
        return;
    }
    for y in y0..=y1 as u32 {
        for x in x0..=x1 as u32 {
            let p = Point2::new(x as f64 + 0.5, y as f64 + 0.5);
            let l1 = ((c.x - b.x) * (p.y - b.y) - (p.x - b.x) * (c.y - b.y)) / area;
            let l2 = ((a.x - c.x) * (p.y - c.y) - (p.x - c.x) * (a.y - c.y)) / area;
            let l3 = 1.0 - l1 - l2;
            if l1 < -1e-9 || l2 < -1e-9 || l3 < -1e-9 {
                continue;
            }
            let v = ((l1 * wa + l2 * wb + l3 * wc) * 255.0).round().clamp(0.0, 255.0) as u8;
            let px = image.get_pixel_mut(x, y);
            if v > px[0] {
                *px = Luma([v]);
            }
        }
    }
}

/// Blend weight of a vehicle-frame point for the camera in `slot`. The
/// bowl center belongs to every camera.
pub fn vehicle_weight(
    slot: CameraSlot,
    p: Point3<f64>,
    start_angle: f64,
    smooth_angle: f64,
) -> f64 {
    let local = slot.to_camera(p);
    if local.coords.xy().norm() < 1e-9 {
        return 1.0;
    }
    blend_weight(azimuth_deg(local.xy()), start_angle, smooth_angle)
}
