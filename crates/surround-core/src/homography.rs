use nalgebra::{DMatrix, Matrix3, Point2, SMatrix, SVector, Vector3};

/// Planar projective transform, `dst ~ H * src`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    pub fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity())
    }

    #[inline]
    pub fn apply(&self, p: Point2<f64>) -> Point2<f64> {
        let v = self.h * Vector3::new(p.x, p.y, 1.0);
        Point2::new(v[0] / v[2], v[1] / v[2])
    }

    pub fn inverse(&self) -> Option<Self> {
        self.h.try_inverse().map(Self::new)
    }

    /// Least-squares DLT fit over `n >= 4` correspondences.
    ///
    /// Both point sets are Hartley-normalized before the SVD. Exactly four
    /// correspondences go through the linear 8x8 solve instead.
    pub fn fit(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Self> {
        if src.len() != dst.len() || src.len() < 4 {
            return None;
        }
        if src.len() == 4 {
            let s: &[Point2<f64>; 4] = src.try_into().ok()?;
            let d: &[Point2<f64>; 4] = dst.try_into().ok()?;
            return homography_from_4pt(s, d);
        }

        let (sn, ts) = normalize(src);
        let (dn, td) = normalize(dst);

        let mut a = DMatrix::<f64>::zeros(2 * src.len(), 9);
        for (k, (s, d)) in sn.iter().zip(&dn).enumerate() {
            let (x, y, u, v) = (s.x, s.y, d.x, d.y);
            let r = 2 * k;
            a[(r, 0)] = -x;
            a[(r, 1)] = -y;
            a[(r, 2)] = -1.0;
            a[(r, 6)] = u * x;
            a[(r, 7)] = u * y;
            a[(r, 8)] = u;

            a[(r + 1, 3)] = -x;
            a[(r + 1, 4)] = -y;
            a[(r + 1, 5)] = -1.0;
            a[(r + 1, 6)] = v * x;
            a[(r + 1, 7)] = v * y;
            a[(r + 1, 8)] = v;
        }

        // null vector of A: last row of V^T
        let svd = a.svd(false, true);
        let vt = svd.v_t?;
        let h = vt.row(vt.nrows().checked_sub(1)?);
        let hn = Matrix3::from_row_slice(&[h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]]);

        denormalize(hn, ts, td).map(Self::new)
    }
}

/// Exact homography from four correspondences (`h33 = 1`).
pub fn homography_from_4pt(src: &[Point2<f64>; 4], dst: &[Point2<f64>; 4]) -> Option<Homography> {
    let (sn, ts) = normalize(src);
    let (dn, td) = normalize(dst);

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for k in 0..4 {
        let (x, y, u, v) = (sn[k].x, sn[k].y, dn[k].x, dn[k].y);
        let r = 2 * k;
        a[(r, 0)] = x;
        a[(r, 1)] = y;
        a[(r, 2)] = 1.0;
        a[(r, 6)] = -u * x;
        a[(r, 7)] = -u * y;
        b[r] = u;

        a[(r + 1, 3)] = x;
        a[(r + 1, 4)] = y;
        a[(r + 1, 5)] = 1.0;
        a[(r + 1, 6)] = -v * x;
        a[(r + 1, 7)] = -v * y;
        b[r + 1] = v;
    }

    let x = a.lu().solve(&b)?;
    let hn = Matrix3::new(x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7], 1.0);
    denormalize(hn, ts, td).map(Homography::new)
}

/// Hartley normalization: centroid to origin, mean distance `sqrt(2)`.
fn normalize(pts: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    let n = pts.len().max(1) as f64;
    let (cx, cy) = pts
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (cx, cy) = (cx / n, cy / n);
    let mean_dist = pts
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > 1e-12 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let out = pts
        .iter()
        .map(|p| Point2::new(s * (p.x - cx), s * (p.y - cy)))
        .collect();
    (out, t)
}

fn denormalize(hn: Matrix3<f64>, ts: Matrix3<f64>, td: Matrix3<f64>) -> Option<Matrix3<f64>> {
    let h = td.try_inverse()? * hn * ts;
    let s = h[(2, 2)];
    if s.abs() < 1e-12 || !h.iter().all(|v| v.is_finite()) {
        return None;
    }
    Some(h / s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: Point2<f64>, b: Point2<f64>, tol: f64) {
        assert!(
            (a.x - b.x).abs() < tol && (a.y - b.y).abs() < tol,
            "expected ({:.6},{:.6}) ~ ({:.6},{:.6}) within {}",
            a.x,
            a.y,
            b.x,
            b.y,
            tol
        );
    }

    fn ground_truth() -> Homography {
        Homography::new(Matrix3::new(
            0.8, 0.05, 120.0, //
            -0.02, 1.1, 80.0, //
            0.0009, -0.0004, 1.0,
        ))
    }

    #[test]
    fn four_point_solve_recovers_h() {
        let gt = ground_truth();
        let src = [
            Point2::new(0.0, 0.0),
            Point2::new(180.0, 0.0),
            Point2::new(180.0, 130.0),
            Point2::new(0.0, 130.0),
        ];
        let dst = src.map(|p| gt.apply(p));
        let h = homography_from_4pt(&src, &dst).expect("solvable");
        for p in [Point2::new(60.0, 40.0), Point2::new(150.0, 120.0)] {
            assert_close(h.apply(p), gt.apply(p), 1e-6);
        }
    }

    #[test]
    fn overdetermined_fit_recovers_h() {
        let gt = ground_truth();
        let src: Vec<_> = (0..4)
            .flat_map(|y| (0..4).map(move |x| Point2::new(x as f64 * 40.0, y as f64 * 30.0)))
            .collect();
        let dst: Vec<_> = src.iter().map(|&p| gt.apply(p)).collect();
        let h = Homography::fit(&src, &dst).expect("fit");
        for p in [Point2::new(10.0, 10.0), Point2::new(100.0, 75.0)] {
            assert_close(h.apply(p), gt.apply(p), 1e-6);
        }
        let back = h.inverse().expect("invertible");
        assert_close(back.apply(h.apply(src[5])), src[5], 1e-6);
    }

    #[test]
    fn too_few_or_mismatched_points_fail() {
        let a = [Point2::new(0.0, 0.0); 4];
        let b = [Point2::new(1.0, 1.0); 3];
        assert!(Homography::fit(&a, &b).is_none());
        assert!(Homography::fit(&a[..3], &b).is_none());
    }
}
