//! Camera pose from planar correspondences.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::debug;
use nalgebra::{
    storage::Owned, DMatrix, DVector, Dyn, Matrix3, Point2, Point3, Rotation3, Vector3,
};
use serde::{Deserialize, Serialize};
use surround_core::Homography;

/// Rotation (axis-angle) and translation taking template points into the
/// camera frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rvec: Vector3<f64>,
    pub tvec: Vector3<f64>,
}

impl Pose {
    pub fn rotation(&self) -> Rotation3<f64> {
        Rotation3::from_scaled_axis(self.rvec)
    }

    pub fn transform(&self, p: &Point3<f64>) -> Point3<f64> {
        self.rotation() * p + self.tvec
    }
}

/// Pinhole projection; `None` for points at or behind the camera.
pub fn project_point(k: &Matrix3<f64>, pose: &Pose, p: &Point3<f64>) -> Option<Point2<f64>> {
    let c = pose.transform(p);
    if c.z <= 1e-12 {
        return None;
    }
    let uv = k * (c.coords / c.z);
    Some(Point2::new(uv.x, uv.y))
}

/// Closed-form pose from the object-plane homography.
fn pose_from_homography(h: &Matrix3<f64>) -> Option<Pose> {
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();
    let n1 = h1.norm();
    let n2 = h2.norm();
    if n1 < 1e-12 || n2 < 1e-12 {
        return None;
    }
    let mut lambda = 2.0 / (n1 + n2);
    if (lambda * h3).z < 0.0 {
        lambda = -lambda;
    }
    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let t = h3 * lambda;
    let r3 = r1.cross(&r2);

    // nearest rotation to [r1 r2 r3]
    let approx = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = approx.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r = u_flipped * v_t;
    }
    Some(Pose {
        rvec: Rotation3::from_matrix_unchecked(r).scaled_axis(),
        tvec: t,
    })
}

/// Reprojection error of the template points, parametrized as
/// `[rvec, tvec]`.
struct Reprojection<'a> {
    k: &'a Matrix3<f64>,
    object: &'a [Point3<f64>],
    image: &'a [Point2<f64>],
    params: DVector<f64>,
}

impl Reprojection<'_> {
    fn pose_of(x: &DVector<f64>) -> Pose {
        Pose {
            rvec: Vector3::new(x[0], x[1], x[2]),
            tvec: Vector3::new(x[3], x[4], x[5]),
        }
    }

    fn residuals_at(&self, x: &DVector<f64>) -> Option<DVector<f64>> {
        let pose = Self::pose_of(x);
        let mut r = DVector::zeros(2 * self.object.len());
        for (i, (o, m)) in self.object.iter().zip(self.image).enumerate() {
            let p = project_point(self.k, &pose, o)?;
            r[2 * i] = p.x - m.x;
            r[2 * i + 1] = p.y - m.y;
        }
        Some(r)
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for Reprojection<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        self.residuals_at(&self.params)
    }

    // central differences
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jac = DMatrix::zeros(2 * self.object.len(), 6);
        for j in 0..6 {
            let step = 1e-6 * self.params[j].abs().max(1.0);
            let mut plus = self.params.clone();
            let mut minus = self.params.clone();
            plus[j] += step;
            minus[j] -= step;
            let diff = self.residuals_at(&plus)? - self.residuals_at(&minus)?;
            jac.set_column(j, &(diff / (2.0 * step)));
        }
        Some(jac)
    }
}

fn refine(
    k: &Matrix3<f64>,
    start: Pose,
    object: &[Point3<f64>],
    image: &[Point2<f64>],
) -> Pose {
    let problem = Reprojection {
        k,
        object,
        image,
        params: DVector::from_row_slice(&[
            start.rvec.x,
            start.rvec.y,
            start.rvec.z,
            start.tvec.x,
            start.tvec.y,
            start.tvec.z,
        ]),
    };
    let seed_cost = problem.residuals().map(|r| r.norm_squared());
    let (problem, report) = LevenbergMarquardt::new().with_patience(50).minimize(problem);
    let refined_cost = problem.residuals().map(|r| r.norm_squared());
    match (seed_cost, refined_cost) {
        (Some(seed), Some(refined)) if refined <= seed => Reprojection::pose_of(&problem.params),
        _ => {
            debug!("pose refinement rejected: {:?}", report.termination);
            start
        }
    }
}

/// Pose of a camera observing planar template points (`z = 0`).
///
/// A homography between the template plane and the normalized image seeds
/// the pose, which is then refined on pixel reprojection error. `None` for
/// fewer than four points, degenerate geometry or a non-finite result.
pub fn solve_planar_pose(
    object: &[Point3<f64>],
    image: &[Point2<f64>],
    k: &Matrix3<f64>,
) -> Option<Pose> {
    if object.len() != image.len() || object.len() < 4 {
        return None;
    }
    let k_inv = k.try_inverse()?;
    let plane: Vec<_> = object.iter().map(|p| Point2::new(p.x, p.y)).collect();
    let normalized: Vec<_> = image
        .iter()
        .map(|m| {
            let v = k_inv * Vector3::new(m.x, m.y, 1.0);
            Point2::new(v.x / v.z, v.y / v.z)
        })
        .collect();

    let h = Homography::fit(&plane, &normalized)?;
    let seed = pose_from_homography(&h.h)?;
    let pose = refine(k, seed, object, image);

    let finite = pose.rvec.iter().chain(pose.tvec.iter()).all(|v| v.is_finite());
    (finite && object.iter().all(|o| pose.transform(o).z > 0.0)).then_some(pose)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intrinsics::tests::project;

    fn intrinsics() -> Matrix3<f64> {
        Matrix3::new(160.0, 0.0, 319.5, 0.0, 160.0, 239.5, 0.0, 0.0, 1.0)
    }

    fn template() -> Vec<Point3<f64>> {
        // two nested squares on either side of the origin, like a poster
        let mut pts = Vec::new();
        for (cx, s) in [(-0.6, 0.2), (-0.6, 0.12), (0.6, 0.2), (0.6, 0.12)] {
            pts.extend([
                Point3::new(cx - s, -0.8 - s, 0.0),
                Point3::new(cx + s, -0.8 - s, 0.0),
                Point3::new(cx + s, -0.8 + s, 0.0),
                Point3::new(cx - s, -0.8 + s, 0.0),
            ]);
        }
        pts
    }

    #[test]
    fn recovers_synthetic_pose() {
        let k = intrinsics();
        let truth = Pose {
            rvec: Vector3::new(1.1, 0.05, -0.08),
            tvec: Vector3::new(0.05, 0.3, 1.6),
        };
        let object = template();
        let image: Vec<_> = object
            .iter()
            .map(|p| project(&k, &truth.rotation(), &truth.tvec, *p))
            .collect();

        let pose = solve_planar_pose(&object, &image, &k).expect("pose");
        assert!((pose.rvec - truth.rvec).norm() < 1e-6, "{:?}", pose.rvec);
        assert!((pose.tvec - truth.tvec).norm() < 1e-6, "{:?}", pose.tvec);
        for (o, m) in object.iter().zip(&image) {
            let p = project_point(&k, &pose, o).expect("in front");
            assert!((p - m).norm() < 1e-6);
        }
    }

    #[test]
    fn refinement_pulls_a_rough_seed_onto_the_truth() {
        let k = intrinsics();
        let truth = Pose {
            rvec: Vector3::new(1.0, 0.1, -0.05),
            tvec: Vector3::new(0.1, 0.25, 1.8),
        };
        let object = template();
        let image: Vec<_> = object
            .iter()
            .map(|p| project(&k, &truth.rotation(), &truth.tvec, *p))
            .collect();
        let seed = Pose {
            rvec: truth.rvec + Vector3::new(0.04, -0.03, 0.02),
            tvec: truth.tvec + Vector3::new(-0.05, 0.04, 0.1),
        };

        let pose = refine(&k, seed, &object, &image);
        assert!((pose.rvec - truth.rvec).norm() < 1e-6, "{:?}", pose.rvec);
        assert!((pose.tvec - truth.tvec).norm() < 1e-6, "{:?}", pose.tvec);
    }

    #[test]
    fn noisy_points_still_converge() {
        let k = intrinsics();
        let truth = Pose {
            rvec: Vector3::new(0.9, -0.1, 0.05),
            tvec: Vector3::new(-0.1, 0.2, 2.0),
        };
        let object = template();
        let image: Vec<_> = object
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let q = project(&k, &truth.rotation(), &truth.tvec, *p);
                let jitter = if i % 2 == 0 { 0.3 } else { -0.3 };
                Point2::new(q.x + jitter, q.y - jitter)
            })
            .collect();
        let pose = solve_planar_pose(&object, &image, &k).expect("pose");
        assert!((pose.tvec - truth.tvec).norm() < 0.05);
    }

    #[test]
    fn too_few_points_fail() {
        let k = intrinsics();
        let object = &template()[..3];
        let image = vec![Point2::new(1.0, 1.0); 3];
        assert!(solve_planar_pose(object, &image, &k).is_none());
    }
}
