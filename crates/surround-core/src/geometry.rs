//! Small polygon and rectangle helpers.
//!
//! Image-space conventions throughout: `x` grows to the right, `y` grows
//! downward. With this orientation a positive [`signed_area`] means the
//! polygon is traversed clockwise on screen.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Shoelace area, positive for screen-clockwise winding.
pub fn signed_area(poly: &[Point2<f64>]) -> f64 {
    if poly.len() < 3 {
        return 0.0;
    }
    let mut acc = 0.0;
    for (i, p) in poly.iter().enumerate() {
        let q = poly[(i + 1) % poly.len()];
        acc += p.x * q.y - q.x * p.y;
    }
    0.5 * acc
}

pub fn polygon_area(poly: &[Point2<f64>]) -> f64 {
    signed_area(poly).abs()
}

/// True when every turn of the closed polygon has the same sign.
///
/// Collinear vertices are tolerated, fully degenerate polygons are not.
pub fn is_convex(poly: &[Point2<f64>]) -> bool {
    let n = poly.len();
    if n < 3 {
        return false;
    }
    let mut sign = 0.0_f64;
    for i in 0..n {
        let a = poly[i];
        let b = poly[(i + 1) % n];
        let c = poly[(i + 2) % n];
        let cross = (b.x - a.x) * (c.y - b.y) - (b.y - a.y) * (c.x - b.x);
        if cross == 0.0 {
            continue;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    sign != 0.0
}

/// Classify `p` against a closed polygon: `1` inside, `0` on an edge,
/// `-1` outside.
pub fn point_in_polygon(poly: &[Point2<f64>], p: Point2<f64>) -> i32 {
    let n = poly.len();
    if n < 3 {
        return -1;
    }
    let mut inside = false;
    for i in 0..n {
        let a = poly[i];
        let b = poly[(i + 1) % n];

        let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
        let within_x = p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x);
        let within_y = p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y);
        if cross.abs() <= 1e-12 && within_x && within_y {
            return 0;
        }

        if (a.y > p.y) != (b.y > p.y) {
            let x_cross = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if p.x < x_cross {
                inside = !inside;
            }
        }
    }
    if inside {
        1
    } else {
        -1
    }
}

/// Intersection of the diagonals `p0-p2` and `p1-p3` of a quadrilateral.
///
/// A vertical diagonal has no slope; in that case the midpoint of that
/// diagonal is returned.
pub fn diagonal_intersection(quad: &[Point2<f64>; 4]) -> Point2<f64> {
    let [p0, p1, p2, p3] = *quad;
    if p0.x == p2.x {
        return Point2::new(p0.x, 0.5 * (p0.y + p2.y));
    }
    if p1.x == p3.x {
        return Point2::new(p1.x, 0.5 * (p1.y + p3.y));
    }

    let a1 = (p0.y - p2.y) / (p0.x - p2.x);
    let b1 = p0.y - a1 * p0.x;
    let a2 = (p1.y - p3.y) / (p1.x - p3.x);
    let b2 = p1.y - a2 * p1.x;
    if (a1 - a2).abs() < 1e-12 {
        // parallel diagonals only happen for degenerate quads
        return Point2::new(
            0.25 * (p0.x + p1.x + p2.x + p3.x),
            0.25 * (p0.y + p1.y + p2.y + p3.y),
        );
    }
    let x = (b2 - b1) / (a1 - a2);
    let y = (a1 * b2 - a2 * b1) / (a1 - a2);
    Point2::new(x, y)
}

/// Axis-aligned rectangle with `f64` corners, always stored normalized.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rect2 {
    pub min: Point2<f64>,
    pub max: Point2<f64>,
}

impl Rect2 {
    /// Build from two opposite corners given in any order.
    pub fn from_corners(a: Point2<f64>, b: Point2<f64>) -> Self {
        Self {
            min: Point2::new(a.x.min(b.x), a.y.min(b.y)),
            max: Point2::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    /// Bounding box of a point set; `None` for an empty set.
    pub fn bounding(points: &[Point2<f64>]) -> Option<Self> {
        let first = *points.first()?;
        Some(points.iter().fold(
            Self {
                min: first,
                max: first,
            },
            |r, p| Self {
                min: Point2::new(r.min.x.min(p.x), r.min.y.min(p.y)),
                max: Point2::new(r.max.x.max(p.x), r.max.y.max(p.y)),
            },
        ))
    }

    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    pub fn contains(&self, p: Point2<f64>) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    /// `[min_x, min_y, max_x, max_y]`
    pub fn to_array(&self) -> [f64; 4] {
        [self.min.x, self.min.y, self.max.x, self.max.y]
    }
}

/// Integer pixel rectangle (`x`, `y` is the top-left corner).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl PixelRect {
    pub fn from_corners(a: (i32, i32), b: (i32, i32)) -> Self {
        let x = a.0.min(b.0);
        let y = a.1.min(b.1);
        Self {
            x,
            y,
            width: a.0.max(b.0) - x,
            height: a.1.max(b.1) - y,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    /// Clip against a `width x height` image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let x0 = self.x.clamp(0, width as i32);
        let y0 = self.y.clamp(0, height as i32);
        let x1 = (self.x + self.width).clamp(0, width as i32);
        let y1 = (self.y + self.height).clamp(0, height as i32);
        Self::from_corners((x0, y0), (x1, y1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square(x0: f64, y0: f64, side: f64) -> Vec<Point2<f64>> {
        vec![
            Point2::new(x0, y0),
            Point2::new(x0 + side, y0),
            Point2::new(x0 + side, y0 + side),
            Point2::new(x0, y0 + side),
        ]
    }

    #[test]
    fn screen_clockwise_square_has_positive_area() {
        let sq = square(0.0, 0.0, 10.0);
        assert_relative_eq!(signed_area(&sq), 100.0);
        let rev: Vec<_> = sq.iter().rev().copied().collect();
        assert_relative_eq!(signed_area(&rev), -100.0);
        assert_relative_eq!(polygon_area(&rev), 100.0);
    }

    #[test]
    fn convexity_detects_reflex_vertex() {
        assert!(is_convex(&square(0.0, 0.0, 4.0)));
        let dart = vec![
            Point2::new(0.0, 0.0),
            Point2::new(4.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(0.0, 4.0),
        ];
        assert!(!is_convex(&dart));
    }

    #[test]
    fn point_in_polygon_classifies_inside_edge_outside() {
        let sq = square(0.0, 0.0, 10.0);
        assert_eq!(point_in_polygon(&sq, Point2::new(5.0, 5.0)), 1);
        assert_eq!(point_in_polygon(&sq, Point2::new(10.0, 5.0)), 0);
        assert_eq!(point_in_polygon(&sq, Point2::new(11.0, 5.0)), -1);
    }

    #[test]
    fn diagonals_of_square_meet_at_center() {
        let quad = [
            Point2::new(0.0, 0.0),
            Point2::new(10.0, 0.0),
            Point2::new(10.0, 10.0),
            Point2::new(0.0, 10.0),
        ];
        let c = diagonal_intersection(&quad);
        assert_relative_eq!(c.x, 5.0, epsilon = 1e-9);
        assert_relative_eq!(c.y, 5.0, epsilon = 1e-9);

        let diamond = [
            Point2::new(5.0, 0.0),
            Point2::new(10.0, 5.0),
            Point2::new(5.0, 12.0),
            Point2::new(0.0, 5.0),
        ];
        assert_relative_eq!(diagonal_intersection(&diamond).y, 6.0);
    }

    #[test]
    fn rects_are_normalized() {
        let r = Rect2::from_corners(Point2::new(1.0, -1.0), Point2::new(-2.0, 3.0));
        assert_eq!(r.to_array(), [-2.0, -1.0, 1.0, 3.0]);
        let p = PixelRect::from_corners((10, 40), (2, 5));
        assert_eq!(
            p,
            PixelRect {
                x: 2,
                y: 5,
                width: 8,
                height: 35
            }
        );
        assert!(PixelRect::default().is_empty());
    }
}
