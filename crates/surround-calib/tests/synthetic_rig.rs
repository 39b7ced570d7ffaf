use std::f64::consts::FRAC_PI_2;
use std::fs;
use std::path::Path;

use image::{DynamicImage, GrayImage, Luma};
use nalgebra::{Matrix3, Rotation3, Vector3};
use surround_calib::{
    CalibError, CameraModel, CameraParams, ChessboardParams, OcamModel, PatternSize, PosterSize,
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;
const FISHEYE_F: f64 = 250.0;
/// Focal length of the undistorted view at scale factor 2.
const VIRTUAL_F: f64 = 320.0;

fn equidistant() -> OcamModel {
    OcamModel {
        pol: vec![-FISHEYE_F, 0.0, 1.0 / (2.0 * FISHEYE_F)],
        invpol: vec![FISHEYE_F * FRAC_PI_2, FISHEYE_F],
        xc: HEIGHT as f64 / 2.0,
        yc: WIDTH as f64 / 2.0,
        c: 1.0,
        d: 0.0,
        e: 0.0,
        height: HEIGHT,
        width: WIDTH,
    }
}

fn params() -> CameraParams {
    CameraParams {
        scale_factor: 2.0,
        chessboard: ChessboardParams {
            image_extension: "png".to_string(),
            ..ChessboardParams::default()
        },
        ..CameraParams::default()
    }
}

/// Pinhole matrix of the undistorted view at scale factor 2.
fn virtual_camera() -> Matrix3<f64> {
    Matrix3::new(
        VIRTUAL_F,
        0.0,
        WIDTH as f64 / 2.0,
        0.0,
        VIRTUAL_F,
        HEIGHT as f64 / 2.0,
        0.0,
        0.0,
        1.0,
    )
}

/// Plane-to-undistorted-image homography for a plane at pose `(r, t)`.
fn plane_homography(r: &Rotation3<f64>, t: Vector3<f64>) -> Matrix3<f64> {
    let r = r.matrix();
    let columns = [r.column(0).into_owned(), r.column(1).into_owned(), t];
    virtual_camera() * Matrix3::from_columns(&columns)
}

/// Homography of an 8x8-square board (unit squares) centered `distance`
/// units in front of the virtual pinhole.
fn board_homography(rotation: Rotation3<f64>, distance: f64) -> Matrix3<f64> {
    let t = Vector3::new(0.0, 0.0, distance) - rotation.matrix() * Vector3::new(4.0, 4.0, 0.0);
    plane_homography(&rotation, t)
}

fn checkerboard(bx: f64, by: f64) -> f64 {
    if !(0.0..8.0).contains(&bx) || !(0.0..8.0).contains(&by) {
        128.0
    } else if (bx.floor() as i64 + by.floor() as i64) % 2 == 0 {
        30.0
    } else {
        225.0
    }
}

/// Render what the fisheye camera sees of a painted plane, 3x3
/// supersampled. Rays that miss the plane read 128.
fn render_fisheye(plane_to_image: &Matrix3<f64>, paint: impl Fn(f64, f64) -> f64) -> GrayImage {
    let image_to_plane = plane_to_image.try_inverse().expect("invertible");
    let (cx, cy) = (WIDTH as f64 / 2.0, HEIGHT as f64 / 2.0);

    let shade = |x: f64, y: f64| -> f64 {
        let dx = x - cx;
        let dy = y - cy;
        let rho = (dx * dx + dy * dy).sqrt();
        let angle = rho / FISHEYE_F;
        if angle >= FRAC_PI_2 - 1e-3 {
            return 0.0;
        }
        let (ux, uy) = if rho < 1e-9 {
            (cx, cy)
        } else {
            let r = VIRTUAL_F * angle.tan();
            (cx + dx / rho * r, cy + dy / rho * r)
        };
        let b = image_to_plane * Vector3::new(ux, uy, 1.0);
        if b.z <= 0.0 {
            return 128.0;
        }
        paint(b.x / b.z, b.y / b.z)
    };

    GrayImage::from_fn(WIDTH, HEIGHT, |x, y| {
        let mut acc = 0.0;
        for sy in 0..3 {
            for sx in 0..3 {
                acc += shade(
                    x as f64 + (sx as f64 - 1.0) / 3.0,
                    y as f64 + (sy as f64 - 1.0) / 3.0,
                );
            }
        }
        Luma([(acc / 9.0).round() as u8])
    })
}

fn write_captures(dir: &Path, prefix: &str) {
    let views = [
        Rotation3::from_euler_angles(0.35, 0.1, 0.05),
        Rotation3::from_euler_angles(-0.25, 0.3, -0.08),
        Rotation3::from_euler_angles(0.15, -0.35, 0.1),
    ];
    for (i, rotation) in views.into_iter().enumerate() {
        let img = render_fisheye(&board_homography(rotation, 11.0), checkerboard);
        img.save(dir.join(format!("{prefix}{i}.png")))
            .expect("save capture");
    }
}

#[test]
fn intrinsics_of_the_undistorted_view_are_recovered() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_captures(dir.path(), "frame1_");

    let mut camera = CameraModel::new(0, equidistant(), &params());
    camera
        .set_intrinsic(dir.path(), "frame1_", 3, PatternSize::default())
        .expect("intrinsics");

    let k = camera.intrinsics().expect("camera matrix");
    let (fx, fy, cx, cy) = (k[(0, 0)], k[(1, 1)], k[(0, 2)], k[(1, 2)]);
    assert!((cx - WIDTH as f64 / 2.0).abs() <= 0.05 * WIDTH as f64, "cx = {cx}");
    assert!((cy - HEIGHT as f64 / 2.0).abs() <= 0.05 * HEIGHT as f64, "cy = {cy}");
    assert!(fx > 0.0 && fy > 0.0);
    assert!((fx - fy).abs() / fx < 0.1, "fx = {fx}, fy = {fy}");
    assert!((fx - VIRTUAL_F).abs() / VIRTUAL_F < 0.2, "fx = {fx}");
    assert_eq!(camera.dist_coeffs(), [0.0; 4]);
}

#[test]
fn missing_capture_aborts_intrinsics() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_captures(dir.path(), "frame1_");

    let mut camera = CameraModel::new(0, equidistant(), &params());
    let err = camera
        .set_intrinsic(dir.path(), "frame1_", 4, PatternSize::default())
        .unwrap_err();
    match err {
        CalibError::Image { path, .. } => assert!(path.ends_with("frame1_3.png")),
        other => panic!("unexpected error: {other}"),
    }
    assert!(camera.intrinsics().is_none());
}

#[test]
fn blank_captures_yield_no_chessboard() {
    let dir = tempfile::tempdir().expect("tempdir");
    GrayImage::from_pixel(WIDTH, HEIGHT, Luma([128]))
        .save(dir.path().join("frame2_0.png"))
        .expect("save");

    let mut camera = CameraModel::new(1, equidistant(), &params());
    let err = camera
        .set_intrinsic(dir.path(), "frame2_", 1, PatternSize::default())
        .unwrap_err();
    assert!(matches!(err, CalibError::NoChessboard { camera: 1, tried: 1 }));
}

/// Poster of two square outlines, 70 px wide with 15 px thick borders.
const POSTER: PosterSize = PosterSize {
    width: 230,
    height: 200,
};
const OUTLINES: [(f64, f64); 2] = [(30.0, 60.0), (160.0, 60.0)];

/// Template corners: per outline the outer square, then its hole, each
/// top-left first and clockwise.
fn poster_template() -> String {
    let mut lines = String::new();
    for (x0, y0) in OUTLINES {
        for (inset, side) in [(0.0, 70.0), (15.0, 40.0)] {
            let (a, b) = (x0 + inset, y0 + inset);
            for (x, y) in [(a, b), (a + side, b), (a + side, b + side), (a, b + side)] {
                lines.push_str(&format!("{x} {y}\n"));
            }
        }
    }
    lines
}

/// Gray level of the poster at a normalized template point.
fn poster(nx: f64, ny: f64) -> f64 {
    let pw = POSTER.width as f64;
    let x = (nx * pw + pw) / 2.0;
    let y = (ny * pw + POSTER.height as f64) / 2.0;
    let within = |x0: f64, y0: f64, side: f64| {
        (x0..x0 + side).contains(&x) && (y0..y0 + side).contains(&y)
    };
    let dark = OUTLINES
        .iter()
        .any(|&(x0, y0)| within(x0, y0, 70.0) && !within(x0 + 15.0, y0 + 15.0, 40.0));
    if dark {
        25.0
    } else {
        220.0
    }
}

#[test]
fn poster_pose_is_recovered_from_a_fisheye_frame() {
    let dir = tempfile::tempdir().expect("tempdir");
    let template = dir.path().join("template_1.txt");
    fs::write(&template, poster_template()).expect("template");

    // tilted towards the floor, poster in the lower half of the view
    let rotation = Rotation3::from_axis_angle(&Vector3::x_axis(), 0.35);
    let tvec = Vector3::new(-0.13, 0.6, 1.9);
    let fisheye = render_fisheye(&plane_homography(&rotation, tvec), poster);
    let frame = DynamicImage::ImageLuma8(fisheye).into_rgb8();

    let mut camera = CameraModel::new(0, equidistant(), &params());
    camera.set_template(&template, POSTER).expect("template");
    camera.set_camera_matrix(virtual_camera());
    camera.set_extrinsic(&frame).expect("extrinsics");

    let pose = camera.pose().expect("pose");
    let rvec_err = (pose.rvec - rotation.scaled_axis()).norm();
    let tvec_err = (pose.tvec - tvec).norm();
    assert!(rvec_err < 0.08, "rvec {:?}", pose.rvec);
    assert!(tvec_err < 0.1, "tvec {:?}", pose.tvec);

    // first template corner (30, 60), normalized by the poster width
    let pw = POSTER.width as f64;
    let expected = ((60.0 - pw) / pw).hypot((120.0 - POSTER.height as f64) / pw);
    assert!((camera.base_radius() - expected).abs() < 1e-12);

    let image = camera.pattern().image_points();
    assert_eq!(image.len(), 16);
    for (p, m) in camera.reference_points().iter().zip(&image) {
        let q = camera.project(p).expect("in front");
        assert!((q - m).norm() < 2.5, "{q:?} vs {m:?}");
    }
}
