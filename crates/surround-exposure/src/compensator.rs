//! Overlap regions shared by neighbouring cameras.
//!
//! Positions are normalized device coordinates: the vehicle frame scaled so
//! that the floor disk of radius `R` spans `[-1, 1]` horizontally, i.e.
//! `x / (2R)` and `y / (2R * h / w)` for a `w x h` output. The mask is kept in
//! top-origin pixel coordinates of the same output.

use std::fs;
use std::path::{Path, PathBuf};

use image::{GrayImage, Luma};
use imageproc::drawing::{draw_filled_rect_mut, draw_polygon_mut};
use imageproc::point::Point;
use imageproc::rect::Rect;
use log::{debug, error, info};
use nalgebra::{Point2, Point3};
use surround_core::{
    previous_index, read_mesh, read_rects, write_mesh, write_rects, FormatError, MeshVertex,
    PixelRect, Rect2,
};

/// Seam points every camera must provide: inner, edge, wall and top on the
/// left ray, then top, wall, edge and inner on the right ray.
const SEAM_POINTS: usize = 8;

#[derive(thiserror::Error, Debug)]
pub enum CompensatorError {
    #[error("camera {camera}: {found} seam points, need 8")]
    ShortSeam { camera: usize, found: usize },
    #[error("no overlap regions, feed seam points first")]
    NoSeams,
    #[error("seam points give a zero floor radius")]
    ZeroRadius,
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("cannot create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mesh {path} not found")]
    MissingMesh { path: PathBuf },
}

#[derive(Clone, Debug)]
pub struct Compensator {
    mask: GrayImage,
    rois: Vec<Rect2>,
    /// NDC scale `(2R, 2R * h / w)`, known once seams were fed.
    gains: Option<(f64, f64)>,
}

impl Compensator {
    /// Empty compensator for a `width x height` output.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            mask: GrayImage::new(width, height),
            rois: Vec::new(),
            gains: None,
        }
    }

    pub fn mask(&self) -> &GrayImage {
        &self.mask
    }

    /// Overlap rectangles in NDC; entry `i` is the overlap on the left of
    /// camera `i`, shared with camera `i - 1`.
    pub fn rois(&self) -> &[Rect2] {
        &self.rois
    }

    /// Compute the overlap regions from every camera's seam points (vehicle
    /// frame). The floor radius is taken from camera 0's left edge point.
    pub fn feed<S>(&mut self, seams: &[S]) -> Result<(), CompensatorError>
    where
        S: AsRef<[Point3<f64>]>,
    {
        if seams.is_empty() {
            return Err(CompensatorError::NoSeams);
        }
        for (camera, s) in seams.iter().enumerate() {
            let found = s.as_ref().len();
            if found < SEAM_POINTS {
                error!("camera {camera}: only {found} seam points, compensator not fed");
                return Err(CompensatorError::ShortSeam { camera, found });
            }
        }

        let edge = seams[0].as_ref()[1];
        let radius = (edge.x * edge.x + edge.y * edge.y).sqrt();
        if !(radius.is_finite() && radius > 0.0) {
            return Err(CompensatorError::ZeroRadius);
        }
        let (w, h) = self.mask.dimensions();
        let gains = (2.0 * radius, 2.0 * radius * h as f64 / w as f64);

        self.mask.fill(0);
        self.rois.clear();
        self.gains = Some(gains);

        let count = seams.len();
        for i in 0..count {
            let own = seams[i].as_ref();
            let prev = seams[previous_index(i, count)].as_ref();
            let polygon: Vec<Point2<f64>> = [own[0], own[1], prev[6], prev[7]]
                .iter()
                .map(|p| Point2::new(p.x / gains.0, p.y / gains.1))
                .collect();
            self.paint_polygon(&polygon);
            if let Some(rect) = Rect2::bounding(&polygon) {
                self.rois.push(rect);
            }
        }
        info!(
            "compensator: {} overlap regions, floor radius {radius:.3}",
            self.rois.len()
        );
        Ok(())
    }

    fn to_pixel(&self, ndc: Point2<f64>) -> Point2<f64> {
        let (w, h) = self.mask.dimensions();
        Point2::new(
            (ndc.x + 1.0) * w as f64 / 2.0,
            (1.0 - ndc.y) * h as f64 / 2.0,
        )
    }

    fn paint_polygon(&mut self, ndc: &[Point2<f64>]) {
        let mut poly: Vec<Point<i32>> = Vec::with_capacity(ndc.len());
        for p in ndc {
            let px = self.to_pixel(*p);
            let q = Point::new(px.x.round() as i32, px.y.round() as i32);
            if poly.last() != Some(&q) {
                poly.push(q);
            }
        }
        while poly.len() > 1 && poly.first() == poly.last() {
            poly.pop();
        }
        if poly.len() < 3 {
            debug!("skipping degenerate overlap polygon {poly:?}");
            return;
        }
        draw_polygon_mut(&mut self.mask, &poly, Luma([255]));
    }

    /// Pixel rectangle of overlap `index` in top-origin output coordinates;
    /// empty when `index` is out of range.
    pub fn flip_roi(&self, index: usize) -> PixelRect {
        let Some(r) = self.rois.get(index) else {
            return PixelRect::default();
        };
        let (w, h) = self.mask.dimensions();
        let (w, h) = (w as f64, h as f64);
        PixelRect::from_corners(
            (
                ((r.min.x + 1.0) * w / 2.0) as i32,
                ((1.0 - r.max.y) * h / 2.0) as i32,
            ),
            (
                ((r.max.x + 1.0) * w / 2.0) as i32,
                ((1.0 - r.min.y) * h / 2.0) as i32,
            ),
        )
    }

    fn masked(&self, position: [f32; 3], gains: (f64, f64)) -> bool {
        let ndc = Point2::new(
            position[0] as f64 / gains.0,
            position[1] as f64 / gains.1,
        );
        let px = self.to_pixel(ndc);
        let (w, h) = self.mask.dimensions();
        if !(px.x >= 0.0 && px.y >= 0.0 && px.x < w as f64 && px.y < h as f64) {
            return false;
        }
        self.mask.get_pixel(px.x as u32, px.y as u32)[0] == 255
    }

    /// Cut every camera's floor mesh (`mesh_dir/array{n}`, `n` from 1) down
    /// to the triangles inside the overlap mask, and write them normalized to
    /// `out_dir/array{n}` under the same number, together with
    /// `out_dir/compensator`.
    pub fn save(
        &self,
        out_dir: impl AsRef<Path>,
        mesh_dir: impl AsRef<Path>,
    ) -> Result<(), CompensatorError> {
        let gains = match self.gains {
            Some(g) if !self.rois.is_empty() => g,
            _ => return Err(CompensatorError::NoSeams),
        };
        let out_dir = out_dir.as_ref();
        let mesh_dir = mesh_dir.as_ref();
        fs::create_dir_all(out_dir).map_err(|source| CompensatorError::CreateDir {
            path: out_dir.to_path_buf(),
            source,
        })?;

        for camera in 0..self.rois.len() {
            let name = format!("array{}", camera + 1);
            let src = mesh_dir.join(&name);
            let mesh = read_mesh(&src).map_err(|e| {
                if e.is_missing() {
                    CompensatorError::MissingMesh { path: src.clone() }
                } else {
                    e.into()
                }
            })?;
            let kept: Vec<MeshVertex> = mesh
                .chunks_exact(3)
                .filter(|tri| {
                    tri.iter()
                        .all(|v| v.position[2] == 0.0 && self.masked(v.position, gains))
                })
                .flatten()
                .map(|v| {
                    MeshVertex::new(
                        [
                            (v.position[0] as f64 / gains.0) as f32,
                            (v.position[1] as f64 / gains.1) as f32,
                            0.0,
                        ],
                        v.tex,
                    )
                })
                .collect();
            debug!(
                "compensator: camera {camera} keeps {} of {} triangles",
                kept.len() / 3,
                mesh.len() / 3
            );
            write_mesh(out_dir.join(&name), &kept)?;
        }
        write_rects(out_dir.join("compensator"), &self.rois)?;
        info!("compensator saved to {}", out_dir.display());
        Ok(())
    }

    /// Restore the rectangles written by [`Compensator::save`] and repaint
    /// the mask from them.
    pub fn load(&mut self, dir: impl AsRef<Path>) -> Result<(), CompensatorError> {
        let rois = read_rects(dir.as_ref().join("compensator"))?;
        self.rois = rois;
        self.mask.fill(0);
        let (w, h) = self.mask.dimensions();
        for index in 0..self.rois.len() {
            let r = self.flip_roi(index).clamp_to(w, h);
            if r.is_empty() {
                continue;
            }
            draw_filled_rect_mut(
                &mut self.mask,
                Rect::at(r.x, r.y).of_size(r.width as u32, r.height as u32),
                Luma([255]),
            );
        }
        info!("compensator: {} overlap regions loaded", self.rois.len());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use surround_core::CameraSlot;

    /// Seam points of four cameras with a floor radius of 1 and seam rays at
    /// -170 and -10 degrees in each camera's template frame.
    pub(crate) fn rig_seams() -> Vec<Vec<Point3<f64>>> {
        let ray = |deg: f64, r: f64, z: f64| {
            let a = deg.to_radians();
            Point3::new(r * a.cos(), r * a.sin(), z)
        };
        CameraSlot::ALL
            .iter()
            .map(|slot| {
                [
                    ray(-170.0, 0.1, 0.0),
                    ray(-170.0, 1.0, 0.0),
                    ray(-170.0, 1.1, -0.01),
                    ray(-170.0, 1.5, -0.25),
                    ray(-10.0, 1.5, -0.25),
                    ray(-10.0, 1.1, -0.01),
                    ray(-10.0, 1.0, 0.0),
                    ray(-10.0, 0.1, 0.0),
                ]
                .into_iter()
                .map(|p| slot.to_vehicle(p))
                .collect()
            })
            .collect()
    }

    pub(crate) fn fed() -> Compensator {
        let mut c = Compensator::new(200, 100);
        c.feed(&rig_seams()).expect("feed");
        c
    }

    fn vertex(x: f32, y: f32, z: f32) -> MeshVertex {
        MeshVertex::new([x, y, z], [0.5, 0.5])
    }

    #[test]
    fn feed_paints_overlaps_only() {
        let c = fed();
        assert_eq!(c.rois().len(), 4);
        // 0.6 units out along -45 degrees, between Front and Right.
        assert_eq!(c.mask().get_pixel(121, 71)[0], 255);
        // Straight ahead of the Right camera's exclusive sector.
        assert_eq!(c.mask().get_pixel(100, 25)[0], 0);
    }

    #[test]
    fn flipped_roi_is_top_origin() {
        let c = fed();
        assert_eq!(
            c.flip_roi(1),
            PixelRect {
                x: 100,
                y: 50,
                width: 49,
                height: 49
            }
        );
        assert!(c.flip_roi(4).is_empty());
    }

    #[test]
    fn short_seam_aborts_feed() {
        let mut seams = rig_seams();
        seams[2].truncate(5);
        let mut c = Compensator::new(200, 100);
        let err = c.feed(&seams).unwrap_err();
        assert!(matches!(
            err,
            CompensatorError::ShortSeam {
                camera: 2,
                found: 5
            }
        ));
        assert!(c.rois().is_empty());
    }

    #[test]
    fn save_keeps_floor_triangles_inside_the_mask() {
        let dir = tempfile::tempdir().expect("tempdir");
        let meshes = dir.path().join("meshes");
        fs::create_dir_all(&meshes).expect("mkdir");
        write_mesh(
            meshes.join("array1"),
            &[
                vertex(0.40, -0.40, 0.0),
                vertex(0.45, -0.40, 0.0),
                vertex(0.42, -0.45, 0.0),
                // on the wall
                vertex(0.40, -0.40, -0.01),
                vertex(0.45, -0.40, 0.0),
                vertex(0.42, -0.45, 0.0),
                // outside every overlap
                vertex(0.0, 0.5, 0.0),
                vertex(0.05, 0.5, 0.0),
                vertex(0.0, 0.45, 0.0),
            ],
        )
        .expect("write");
        for n in 2..=4 {
            write_mesh(meshes.join(format!("array{n}")), &[]).expect("write");
        }

        let c = fed();
        let out = dir.path().join("compensator");
        c.save(&out, &meshes).expect("save");

        assert!(!out.join("array0").exists());
        let kept = read_mesh(out.join("array1")).expect("read");
        assert_eq!(kept.len(), 3);
        assert_relative_eq!(kept[0].position[0], 0.2, epsilon = 1e-6);
        assert_relative_eq!(kept[0].position[1], -0.4, epsilon = 1e-6);
        for n in 2..=4 {
            let grid = read_mesh(out.join(format!("array{n}"))).expect("read");
            assert!(grid.is_empty());
        }

        let mut restored = Compensator::new(200, 100);
        restored.load(&out).expect("load");
        assert_eq!(restored.rois(), c.rois());
        for i in 0..4 {
            assert_eq!(restored.flip_roi(i), c.flip_roi(i));
        }
        assert_eq!(restored.mask().get_pixel(121, 71)[0], 255);
    }

    #[test]
    fn missing_mesh_fails_save() {
        let dir = tempfile::tempdir().expect("tempdir");
        for n in [1, 2, 4] {
            write_mesh(dir.path().join(format!("array{n}")), &[]).expect("write");
        }
        let err = fed().save(dir.path().join("out"), dir.path()).unwrap_err();
        match err {
            CompensatorError::MissingMesh { path } => assert!(path.ends_with("array3")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn load_without_summary_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut c = Compensator::new(200, 100);
        match c.load(dir.path()).unwrap_err() {
            CompensatorError::Format(e) => assert!(e.is_missing()),
            other => panic!("unexpected error: {other}"),
        }
        assert!(Compensator::new(10, 10).save(dir.path(), dir.path()).is_err());
    }
}
