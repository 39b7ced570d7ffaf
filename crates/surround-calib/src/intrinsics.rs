use nalgebra::{DMatrix, DVector, Matrix3, Point2, Vector3};
use surround_core::Homography;

/// One planar view: board coordinates and the matching image points.
#[derive(Clone, Debug, Default)]
pub struct PlanarView {
    pub board: Vec<Point2<f64>>,
    pub image: Vec<Point2<f64>>,
}

/// Initial pinhole matrix from planar views of a board.
///
/// The principal point is fixed at the center of a `width x height` image;
/// the two focal lengths follow from the orthogonality and equal-length
/// constraints on the first two rotation columns of every view, solved in
/// the least-squares sense. `None` when no view yields a homography or the
/// system is degenerate (for example fronto-parallel views only).
pub fn init_camera_matrix(
    views: &[PlanarView],
    width: u32,
    height: u32,
) -> Option<Matrix3<f64>> {
    let cx = (width as f64 - 1.0) * 0.5;
    let cy = (height as f64 - 1.0) * 0.5;

    let mut rows: Vec<[f64; 2]> = Vec::new();
    let mut rhs: Vec<f64> = Vec::new();
    for view in views {
        let Some(hom) = Homography::fit(&view.board, &view.image) else {
            continue;
        };
        let mut h = hom.h;
        for c in 0..3 {
            h[(0, c)] -= h[(2, c)] * cx;
            h[(1, c)] -= h[(2, c)] * cy;
        }

        let hc = Vector3::new(h[(0, 0)], h[(1, 0)], h[(2, 0)]);
        let vc = Vector3::new(h[(0, 1)], h[(1, 1)], h[(2, 1)]);
        let d1 = (hc + vc) * 0.5;
        let d2 = (hc - vc) * 0.5;
        let (Some(hc), Some(vc), Some(d1), Some(d2)) = (
            hc.try_normalize(1e-15),
            vc.try_normalize(1e-15),
            d1.try_normalize(1e-15),
            d2.try_normalize(1e-15),
        ) else {
            continue;
        };

        rows.push([hc.x * vc.x, hc.y * vc.y]);
        rhs.push(-hc.z * vc.z);
        rows.push([d1.x * d2.x, d1.y * d2.y]);
        rhs.push(-d1.z * d2.z);
    }
    if rows.len() < 2 {
        return None;
    }

    let a = DMatrix::from_fn(rows.len(), 2, |r, c| rows[r][c]);
    let b = DVector::from_vec(rhs);
    let f = a.svd(true, true).solve(&b, 1e-15).ok()?;
    if f[0] == 0.0 || f[1] == 0.0 {
        return None;
    }
    let fx = (1.0 / f[0]).abs().sqrt();
    let fy = (1.0 / f[1]).abs().sqrt();
    if !(fx.is_finite() && fy.is_finite()) {
        return None;
    }

    Some(Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nalgebra::{Point3, Rotation3};

    pub(crate) fn project(
        k: &Matrix3<f64>,
        r: &Rotation3<f64>,
        t: &Vector3<f64>,
        p: Point3<f64>,
    ) -> Point2<f64> {
        let c = r * p.coords + t;
        let uv = k * (c / c.z);
        Point2::new(uv.x, uv.y)
    }

    #[test]
    fn recovers_focal_lengths_from_tilted_views() {
        let k = Matrix3::new(420.0, 0.0, 319.5, 0.0, 410.0, 239.5, 0.0, 0.0, 1.0);
        let board: Vec<_> = (0..6)
            .flat_map(|r| (0..7).map(move |c| Point2::new(c as f64, r as f64)))
            .collect();
        let poses = [
            (
                Rotation3::from_euler_angles(0.35, 0.1, 0.05),
                Vector3::new(-3.0, -2.5, 12.0),
            ),
            (
                Rotation3::from_euler_angles(-0.2, 0.4, -0.1),
                Vector3::new(-3.5, -2.0, 11.0),
            ),
            (
                Rotation3::from_euler_angles(0.15, -0.3, 0.2),
                Vector3::new(-2.5, -3.0, 13.0),
            ),
        ];
        let views: Vec<_> = poses
            .iter()
            .map(|(r, t)| PlanarView {
                board: board.clone(),
                image: board
                    .iter()
                    .map(|p| project(&k, r, t, Point3::new(p.x, p.y, 0.0)))
                    .collect(),
            })
            .collect();

        let est = init_camera_matrix(&views, 640, 480).expect("camera matrix");
        assert!((est[(0, 0)] - 420.0).abs() < 1.0, "fx = {}", est[(0, 0)]);
        assert!((est[(1, 1)] - 410.0).abs() < 1.0, "fy = {}", est[(1, 1)]);
        assert_eq!(est[(0, 2)], 319.5);
        assert_eq!(est[(1, 2)], 239.5);
    }

    #[test]
    fn no_views_means_no_matrix() {
        assert!(init_camera_matrix(&[], 640, 480).is_none());
    }
}
