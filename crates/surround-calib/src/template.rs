//! Reference templates: pattern corner positions on the floor poster.

use std::path::{Path, PathBuf};

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use surround_core::{read_point_pairs, FormatError};

/// Size of the whole floor poster, in template pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PosterSize {
    pub width: u32,
    pub height: u32,
}

/// Corner list of one camera's part of the poster.
///
/// Points are `x y` integer pairs in poster pixels, listed in the same order
/// as the detected pattern corners (quad by quad, top-left first, clockwise).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceTemplate {
    pub path: PathBuf,
    pub point_count: usize,
    /// Extent of this camera's template, `(max_x, side)`.
    pub width: u32,
    pub height: u32,
    pub poster: PosterSize,
}

fn max_x(points: &[Point2<i32>]) -> u32 {
    points.iter().map(|p| p.x.max(0) as u32).max().unwrap_or(0)
}

impl ReferenceTemplate {
    /// Read a template file and derive its size.
    ///
    /// Front and rear templates span the poster width; the side cameras see
    /// the poster rotated, so their second extent is the poster width.
    pub fn load(path: impl AsRef<Path>, poster: PosterSize) -> Result<Self, FormatError> {
        let path = path.as_ref();
        let points = read_point_pairs(path)?;
        let width = max_x(&points);
        let height = if width == poster.width {
            poster.height
        } else {
            poster.width
        };
        Ok(Self {
            path: path.to_path_buf(),
            point_count: points.len(),
            width,
            height,
            poster,
        })
    }

    /// Map template pixels into the normalized template plane (`z = 0`).
    ///
    /// `x' = (2x - w) / poster_w`, `y' = (2y - h) / poster_w`; the poster
    /// width spans `[-1, 1]`.
    pub fn normalize(&self, points: &[Point2<i32>]) -> Vec<Point3<f64>> {
        let pw = self.poster.width.max(1) as f64;
        let (tw, th) = (self.width as f64, self.height as f64);
        points
            .iter()
            .map(|p| {
                Point3::new(
                    (2.0 * p.x as f64 - tw) / pw,
                    (2.0 * p.y as f64 - th) / pw,
                    0.0,
                )
            })
            .collect()
    }

    /// Re-read the template file and normalize its points.
    pub fn normalized_points(&self) -> Result<Vec<Point3<f64>>, FormatError> {
        let points = read_point_pairs(&self.path)?;
        Ok(self.normalize(&points))
    }
}

/// Poster size from the front (`template_1`) and side (`template_2`)
/// templates: each file's largest x.
pub fn poster_size_from_templates(
    front: impl AsRef<Path>,
    side: impl AsRef<Path>,
) -> Result<PosterSize, FormatError> {
    Ok(PosterSize {
        width: max_x(&read_point_pairs(front)?),
        height: max_x(&read_point_pairs(side)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("write template");
        path
    }

    #[test]
    fn square_template_normalizes_to_unit_corners() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(dir.path(), "template_1.txt", "0 0\n100 0\n100 100\n0 100\n");
        let tpl = ReferenceTemplate::load(
            &path,
            PosterSize {
                width: 100,
                height: 100,
            },
        )
        .expect("template");
        assert_eq!(tpl.point_count, 4);
        assert_eq!((tpl.width, tpl.height), (100, 100));
        let pts = tpl.normalized_points().expect("points");
        let expected = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
        for (p, (x, y)) in pts.iter().zip(expected) {
            assert_eq!((p.x, p.y, p.z), (x, y, 0.0));
        }
    }

    #[test]
    fn side_template_takes_the_poster_width_as_height() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(dir.path(), "template_2.txt", "10 5\n80 5\n80 40\n10 40\n");
        let poster = PosterSize {
            width: 120,
            height: 80,
        };
        let tpl = ReferenceTemplate::load(&path, poster).expect("template");
        // max_x equals the poster height, not its width
        assert_eq!((tpl.width, tpl.height), (80, 120));
    }

    #[test]
    fn poster_size_comes_from_front_and_side_templates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let front = write(dir.path(), "template_1.txt", "0 0\n640 10\n320 20\n");
        let side = write(dir.path(), "template_2.txt", "0 0\n480 10\n");
        let poster = poster_size_from_templates(&front, &side).expect("poster");
        assert_eq!(
            poster,
            PosterSize {
                width: 640,
                height: 480
            }
        );
        assert!(poster_size_from_templates(dir.path().join("missing.txt"), &side)
            .unwrap_err()
            .is_missing());
    }
}
