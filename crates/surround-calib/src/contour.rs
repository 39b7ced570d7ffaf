//! Quadrilateral extraction from a binary image.

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use nalgebra::Point2;
use surround_core::{is_convex, point_in_polygon, polygon_area};

/// A convex four-vertex contour that passed the size and margin checks.
#[derive(Clone, Debug)]
pub(crate) struct RawQuad {
    pub corners: [Point2<f64>; 4],
    pub hole: bool,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct QuadLimits {
    pub min_area: f64,
    pub margin: f64,
    pub max_approx_level: u32,
}

fn segment_distance(p: Point2<f64>, a: Point2<f64>, b: Point2<f64>) -> f64 {
    let ab = b - a;
    let len2 = ab.norm_squared();
    if len2 == 0.0 {
        return (p - a).norm();
    }
    let t = ((p - a).dot(&ab) / len2).clamp(0.0, 1.0);
    (p - (a + ab * t)).norm()
}

/// Douglas-Peucker on an open chain, endpoints kept.
fn simplify_chain(chain: &[Point2<f64>], eps: f64, out: &mut Vec<Point2<f64>>) {
    let mut keep = vec![false; chain.len()];
    let last = chain.len() - 1;
    keep[0] = true;
    keep[last] = true;
    let mut stack = vec![(0usize, last)];
    while let Some((s, e)) = stack.pop() {
        if e <= s + 1 {
            continue;
        }
        let (idx, dist) = (s + 1..e)
            .map(|i| (i, segment_distance(chain[i], chain[s], chain[e])))
            .fold((s, -1.0), |best, cur| if cur.1 > best.1 { cur } else { best });
        if dist > eps {
            keep[idx] = true;
            stack.push((s, idx));
            stack.push((idx, e));
        }
    }
    // the last point starts the next chain
    out.extend(
        chain[..last]
            .iter()
            .zip(&keep)
            .filter_map(|(p, k)| k.then_some(*p)),
    );
}

/// Douglas-Peucker on a closed contour.
///
/// The contour is cut at two mutually distant points, found by hopping to
/// the farthest point a few times, and both halves are simplified
/// independently. Starting from an extreme point keeps arbitrary contour
/// start positions out of the result.
pub(crate) fn approx_closed(points: &[Point2<f64>], eps: f64) -> Vec<Point2<f64>> {
    let n = points.len();
    if n < 3 {
        return points.to_vec();
    }
    let farthest = |from: usize| {
        (0..n)
            .max_by(|&a, &b| {
                let da = (points[a] - points[from]).norm_squared();
                let db = (points[b] - points[from]).norm_squared();
                da.total_cmp(&db)
            })
            .unwrap_or(from)
    };
    let mut start = 0;
    let mut far = farthest(start);
    for _ in 0..3 {
        let next = farthest(far);
        if next == start {
            break;
        }
        start = far;
        far = next;
    }
    if far == start {
        return points.to_vec();
    }

    let ring: Vec<_> = points[start..].iter().chain(&points[..start]).copied().collect();
    let far = (far + n - start) % n;
    let first: Vec<_> = ring[..=far].to_vec();
    let mut second: Vec<_> = ring[far..].to_vec();
    second.push(ring[0]);

    let mut out = Vec::new();
    simplify_chain(&first, eps, &mut out);
    simplify_chain(&second, eps, &mut out);
    out
}

fn approximate_quad(points: &[Point2<f64>], max_level: u32) -> Option<Vec<Point2<f64>>> {
    for level in 1..=max_level {
        let eps = level as f64;
        let approx = approx_closed(points, eps);
        if approx.len() == 4 {
            return Some(approx);
        }
        let again = approx_closed(&approx, eps);
        if again.len() == 4 {
            return Some(again);
        }
    }
    None
}

/// Find convex quads in a binary image (non-zero = foreground).
///
/// `width x height` of the image is the region the margin is measured
/// against.
pub(crate) fn extract_quads(binary: &GrayImage, limits: QuadLimits) -> Vec<RawQuad> {
    let (w, h) = (binary.width() as f64, binary.height() as f64);
    let contours = find_contours::<i32>(binary);
    let mut quads: Vec<RawQuad> = Vec::new();

    for contour in &contours {
        if contour.points.len() < 4 {
            continue;
        }
        let (mut x0, mut y0, mut x1, mut y1) = (i32::MAX, i32::MAX, i32::MIN, i32::MIN);
        for p in &contour.points {
            x0 = x0.min(p.x);
            y0 = y0.min(p.y);
            x1 = x1.max(p.x);
            y1 = y1.max(p.y);
        }
        let box_area = ((x1 - x0 + 1) as f64) * ((y1 - y0 + 1) as f64);
        if box_area < limits.min_area {
            continue;
        }

        let points: Vec<_> = contour
            .points
            .iter()
            .map(|p| Point2::new(p.x as f64, p.y as f64))
            .collect();
        let Some(approx) = approximate_quad(&points, limits.max_approx_level) else {
            continue;
        };
        if !is_convex(&approx) || polygon_area(&approx) <= limits.min_area {
            continue;
        }
        let m = limits.margin;
        if approx
            .iter()
            .any(|p| p.x <= m || p.y <= m || p.x >= w - 1.0 - m || p.y >= h - 1.0 - m)
        {
            continue;
        }

        quads.push(RawQuad {
            corners: [approx[0], approx[1], approx[2], approx[3]],
            hole: contour.border_type == BorderType::Hole,
        });
    }
    quads
}

fn strictly_inside(inner: &RawQuad, outer: &RawQuad) -> bool {
    inner
        .corners
        .iter()
        .all(|&p| point_in_polygon(&outer.corners, p) > 0)
}

/// Keep quads that strictly contain, or lie strictly inside, another
/// accepted quad.
///
/// Pattern marks come as concentric outlines; an isolated quad is noise, and
/// so is one that only touches its neighbour.
pub(crate) fn keep_nested(quads: Vec<RawQuad>) -> Vec<RawQuad> {
    let keep: Vec<bool> = quads
        .iter()
        .enumerate()
        .map(|(i, q)| {
            quads.iter().enumerate().any(|(j, other)| {
                i != j && (strictly_inside(q, other) || strictly_inside(other, q))
            })
        })
        .collect();
    quads
        .into_iter()
        .zip(keep)
        .filter_map(|(q, k)| k.then_some(q))
        .collect()
}
