//! Polynomial fisheye model (OCamCalib text format) and the undistortion LUT.
//!
//! Model file layout, after any number of `#` comment lines:
//!
//! ```text
//! n  pol[0] .. pol[n-1]        direct polynomial (cam2world)
//! m  invpol[0] .. invpol[m-1]  inverse polynomial (world2cam)
//! xc yc                        distortion center (row, column)
//! c d e                        affine coefficients
//! height width                 calibrated frame size
//! ```
//!
//! Image points produced by the model are `(row, column)` pairs, which is the
//! toolbox convention. The LUT stores plain `(x, y)` source pixels.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::{GrayImage, ImageBuffer, Luma, Pixel};
use log::debug;
use nalgebra::{Point2, Vector3};
use serde::{Deserialize, Serialize};
use surround_core::{MeshVertex, ScreenTile};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(thiserror::Error, Debug)]
pub enum FisheyeError {
    #[error("cannot read fisheye model {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed fisheye model: {0}")]
    Malformed(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OcamModel {
    pub pol: Vec<f64>,
    pub invpol: Vec<f64>,
    /// Distortion center row.
    pub xc: f64,
    /// Distortion center column.
    pub yc: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub height: u32,
    pub width: u32,
}

fn numbers(line: &str, what: &str) -> Result<Vec<f64>, FisheyeError> {
    line.split_whitespace()
        .map(|t| {
            t.parse::<f64>()
                .map_err(|_| FisheyeError::Malformed(format!("{what}: bad number `{t}`")))
        })
        .collect()
}

fn polynomial(line: &str, what: &str) -> Result<Vec<f64>, FisheyeError> {
    let values = numbers(line, what)?;
    let (count, coeffs) = values
        .split_first()
        .ok_or_else(|| FisheyeError::Malformed(format!("{what}: empty line")))?;
    let count = *count as usize;
    if count == 0 || coeffs.len() < count {
        return Err(FisheyeError::Malformed(format!(
            "{what}: expected {count} coefficients, found {}",
            coeffs.len()
        )));
    }
    Ok(coeffs[..count].to_vec())
}

fn fixed<const N: usize>(line: &str, what: &str) -> Result<[f64; N], FisheyeError> {
    let values = numbers(line, what)?;
    values
        .get(..N)
        .and_then(|v| <[f64; N]>::try_from(v).ok())
        .ok_or_else(|| FisheyeError::Malformed(format!("{what}: expected {N} values")))
}

impl FromStr for OcamModel {
    type Err = FisheyeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut lines = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'));
        let mut next = |what: &str| {
            lines
                .next()
                .ok_or_else(|| FisheyeError::Malformed(format!("missing {what} line")))
        };

        let pol = polynomial(next("polynomial")?, "polynomial")?;
        let invpol = polynomial(next("inverse polynomial")?, "inverse polynomial")?;
        let [xc, yc] = fixed::<2>(next("center")?, "center")?;
        let [c, d, e] = fixed::<3>(next("affine")?, "affine")?;
        let [height, width] = fixed::<2>(next("image size")?, "image size")?;
        if height < 1.0 || width < 1.0 {
            return Err(FisheyeError::Malformed(format!(
                "image size {width}x{height}"
            )));
        }
        if (c - d * e).abs() < f64::EPSILON {
            return Err(FisheyeError::Malformed("singular affine part".into()));
        }

        Ok(Self {
            pol,
            invpol,
            xc,
            yc,
            c,
            d,
            e,
            height: height as u32,
            width: width as u32,
        })
    }
}

impl OcamModel {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FisheyeError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| FisheyeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let model: OcamModel = text.parse()?;
        debug!(
            "loaded fisheye model {} ({}x{}, {} inverse coefficients)",
            path.display(),
            model.width,
            model.height,
            model.invpol.len()
        );
        Ok(model)
    }

    /// Project a camera-frame ray to a `(row, column)` fisheye pixel.
    pub fn world_to_cam(&self, p: Vector3<f64>) -> Point2<f64> {
        let norm = (p.x * p.x + p.y * p.y).sqrt();
        if norm == 0.0 {
            return Point2::new(self.xc, self.yc);
        }
        let theta = (p.z / norm).atan();
        let mut rho = 0.0;
        let mut t_i = 1.0;
        for coeff in &self.invpol {
            rho += coeff * t_i;
            t_i *= theta;
        }
        let x = p.x / norm * rho;
        let y = p.y / norm * rho;
        Point2::new(x * self.c + y * self.d + self.xc, x * self.e + y + self.yc)
    }

    /// Back-project a `(row, column)` fisheye pixel to a unit ray.
    pub fn cam_to_world(&self, pixel: Point2<f64>) -> Vector3<f64> {
        let inv_det = 1.0 / (self.c - self.d * self.e);
        let dr = pixel.x - self.xc;
        let dc = pixel.y - self.yc;
        let xp = inv_det * (dr - self.d * dc);
        let yp = inv_det * (-self.e * dr + self.c * dc);
        let r = (xp * xp + yp * yp).sqrt();
        let mut zp = 0.0;
        let mut r_i = 1.0;
        for coeff in &self.pol {
            zp += coeff * r_i;
            r_i *= r;
        }
        Vector3::new(xp, yp, zp).normalize()
    }

    /// Perspective undistortion table for a virtual pinhole of focal length
    /// `width / scale_factor`, sized like the calibrated frame.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self), fields(w = self.width, h = self.height))
    )]
    pub fn build_lut(&self, scale_factor: f64) -> UndistortLut {
        let (w, h) = (self.width as usize, self.height as usize);
        let nxc = h as f64 / 2.0;
        let nyc = w as f64 / 2.0;
        let nz = -(w as f64) / scale_factor;

        let mut map_x = Vec::with_capacity(w * h);
        let mut map_y = Vec::with_capacity(w * h);
        for row in 0..h {
            for col in 0..w {
                let m = self.world_to_cam(Vector3::new(row as f64 - nxc, col as f64 - nyc, nz));
                map_x.push(m.y as f32);
                map_y.push(m.x as f32);
            }
        }

        UndistortLut {
            width: self.width,
            height: self.height,
            source_width: self.width,
            source_height: self.height,
            map_x,
            map_y,
        }
    }
}

/// Per-pixel lookup from an undistorted pixel to its fisheye source pixel.
#[derive(Clone, Debug)]
pub struct UndistortLut {
    pub width: u32,
    pub height: u32,
    pub source_width: u32,
    pub source_height: u32,
    map_x: Vec<f32>,
    map_y: Vec<f32>,
}

impl UndistortLut {
    /// Source `(x, y)` of an integer destination pixel.
    pub fn source(&self, x: u32, y: u32) -> Option<(f32, f32)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = y as usize * self.width as usize + x as usize;
        Some((self.map_x[i], self.map_y[i]))
    }

    /// Source position of a sub-pixel destination point, interpolating the
    /// table bilinearly. `None` outside the table.
    pub fn source_at(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        if !(x >= 0.0 && y >= 0.0) || x > (self.width - 1) as f64 || y > (self.height - 1) as f64
        {
            return None;
        }
        let x0 = x.floor() as u32;
        let y0 = y.floor() as u32;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f64;
        let fy = y - y0 as f64;

        let (a, b, c, d) = (
            self.source(x0, y0)?,
            self.source(x1, y0)?,
            self.source(x0, y1)?,
            self.source(x1, y1)?,
        );
        let lerp = |p: f32, q: f32, r: f32, s: f32| {
            let top = p as f64 + fx * (q as f64 - p as f64);
            let bottom = r as f64 + fx * (s as f64 - r as f64);
            top + fy * (bottom - top)
        };
        Some((lerp(a.0, b.0, c.0, d.0), lerp(a.1, b.1, c.1, d.1)))
    }

    fn source_inside(&self, sx: f64, sy: f64) -> bool {
        sx >= 0.0
            && sy >= 0.0
            && sx <= (self.source_width - 1) as f64
            && sy <= (self.source_height - 1) as f64
    }

    /// True when the pixel's bilinear footprint lies inside the fisheye frame.
    pub fn is_valid(&self, x: u32, y: u32) -> bool {
        self.source(x, y)
            .is_some_and(|(sx, sy)| self.source_inside(sx as f64, sy as f64))
    }

    /// 255 where the undistorted image carries fisheye data, 0 elsewhere.
    pub fn valid_mask(&self) -> GrayImage {
        ImageBuffer::from_fn(self.width, self.height, |x, y| {
            Luma([if self.is_valid(x, y) { 255 } else { 0 }])
        })
    }

    /// Bilinear remap of a fisheye frame. Samples outside the frame read as 0.
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all))]
    pub fn remap<P>(&self, src: &ImageBuffer<P, Vec<u8>>) -> ImageBuffer<P, Vec<u8>>
    where
        P: Pixel<Subpixel = u8>,
    {
        let channels = P::CHANNEL_COUNT as usize;
        let (sw, sh) = (src.width() as i64, src.height() as i64);
        let fetch = |x: i64, y: i64, c: usize| -> f32 {
            if x < 0 || y < 0 || x >= sw || y >= sh {
                0.0
            } else {
                src.get_pixel(x as u32, y as u32).channels()[c] as f32
            }
        };

        ImageBuffer::from_fn(self.width, self.height, |x, y| {
            let i = y as usize * self.width as usize + x as usize;
            let (sx, sy) = (self.map_x[i], self.map_y[i]);
            let x0 = sx.floor();
            let y0 = sy.floor();
            let (fx, fy) = (sx - x0, sy - y0);
            let (x0, y0) = (x0 as i64, y0 as i64);

            let mut out = [0u8; 4];
            for (c, slot) in out.iter_mut().enumerate().take(channels) {
                let top = fetch(x0, y0, c) + fx * (fetch(x0 + 1, y0, c) - fetch(x0, y0, c));
                let bottom =
                    fetch(x0, y0 + 1, c) + fx * (fetch(x0 + 1, y0 + 1, c) - fetch(x0, y0 + 1, c));
                *slot = (top + fy * (bottom - top)).round().clamp(0.0, 255.0) as u8;
            }
            *P::from_slice(&out[..channels])
        })
    }

    /// Textured preview mesh showing the undistorted frame in a screen tile.
    ///
    /// The table is sampled every `density` pixels; each cell becomes two
    /// triangles, dropped when any corner samples outside the fisheye frame.
    pub fn preview_mesh(&self, density: u32, tile: ScreenTile) -> Vec<MeshVertex> {
        let step = density.max(1);
        let (w, h) = (self.width as f32, self.height as f32);
        let (sw, sh) = (self.source_width as f32, self.source_height as f32);
        let vertex = |x: u32, y: u32| -> Option<MeshVertex> {
            let (sx, sy) = self.source(x, y)?;
            if !self.source_inside(sx as f64, sy as f64) {
                return None;
            }
            let [px, py] = tile.map(x as f32 / w, y as f32 / h);
            Some(MeshVertex::new([px, py, 0.0], [sx / sw, sy / sh]))
        };

        let mut mesh = Vec::new();
        for y in (0..self.height.saturating_sub(step)).step_by(step as usize) {
            for x in (0..self.width.saturating_sub(step)).step_by(step as usize) {
                let v1 = vertex(x, y);
                let v2 = vertex(x + step, y);
                let v3 = vertex(x + step, y + step);
                let v4 = vertex(x, y + step);
                if let (Some(v4), Some(v1), Some(v2)) = (v4, v1, v2) {
                    mesh.extend([v4, v1, v2]);
                }
                if let (Some(v4), Some(v2), Some(v3)) = (v4, v2, v3) {
                    mesh.extend([v4, v2, v3]);
                }
            }
        }
        mesh
    }
}
