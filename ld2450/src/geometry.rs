/*!
Integer polygon geometry used by the zone engine.

Polygons are ordered corner lists in millimetres. Winding direction is
arbitrary but must be consistent. Cross products are computed in `i64` so
corner coordinates anywhere in the `i32` range cannot overflow.
*/

use serde::{Deserialize, Serialize};

/// Cartesian location in millimetres
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    fn delta(self, to: Point) -> (i64, i64) {
        (to.x as i64 - self.x as i64, to.y as i64 - self.y as i64)
    }
}

impl From<[i32; 2]> for Point {
    fn from([x, y]: [i32; 2]) -> Self {
        Self { x, y }
    }
}

impl From<(i16, i16)> for Point {
    fn from((x, y): (i16, i16)) -> Self {
        Self { x: x as i32, y: y as i32 }
    }
}

fn cross(a: (i64, i64), b: (i64, i64)) -> i64 {
    a.0 * b.1 - a.1 * b.0
}

/// Tracks the sign of the first non-zero cross product and reports flips against it
#[derive(Default)]
struct SignTracker {
    reference: i64,
}

impl SignTracker {
    /// Returns false once a cross product disagrees with the reference sign
    fn accept(&mut self, cross_product: i64) -> bool {
        let sign = cross_product.signum();
        if sign == 0 {
            return true;
        }
        if self.reference == 0 {
            self.reference = sign;
            return true;
        }
        sign == self.reference
    }

    fn has_reference(&self) -> bool {
        self.reference != 0
    }
}

/// Checks if the polygon is convex: at least 3 corners, no repeated
/// consecutive corners and all turns in the same direction.
pub fn is_convex(polygon: &[Point]) -> bool {
    let size = polygon.len();
    if size < 3 {
        return false;
    }

    let mut signs = SignTracker::default();
    for i in 0..size {
        let a = polygon[i];
        let b = polygon[(i + 1) % size];
        let c = polygon[(i + 2) % size];
        let edge_1 = a.delta(b);
        let edge_2 = b.delta(c);

        // Reject duplicate points
        if edge_1 == (0, 0) || edge_2 == (0, 0) {
            return false;
        }

        if !signs.accept(cross(edge_1, edge_2)) {
            return false;
        }
    }

    // All corners collinear
    signs.has_reference()
}

/// Distance from `point` to the segment `start..end`
pub fn segment_distance(start: Point, end: Point, point: Point) -> f64 {
    let edge = start.delta(end);
    let to_point = start.delta(point);
    let length_sq = (edge.0 * edge.0 + edge.1 * edge.1) as f64;
    if length_sq == 0.0 {
        return (to_point.0 as f64).hypot(to_point.1 as f64);
    }

    let r = (edge.0 * to_point.0 + edge.1 * to_point.1) as f64 / length_sq;
    if r < 0.0 {
        (to_point.0 as f64).hypot(to_point.1 as f64)
    } else if r > 1.0 {
        let (dx, dy) = point.delta(end);
        (dx as f64).hypot(dy as f64)
    } else {
        cross(edge, to_point).abs() as f64 / length_sq.sqrt()
    }
}

/// Result of locating a point relative to a convex polygon
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub inside: bool,
    /// Minimum distance to the perimeter, only computed when requested
    pub min_distance: Option<f64>,
}

/// Locate `point` relative to a convex `polygon`.
///
/// Without `measure_distance` the walk stops at the first edge the point lies
/// outside of. With it, the whole perimeter is walked to find the minimum
/// distance to any edge.
pub fn locate(polygon: &[Point], point: Point, measure_distance: bool) -> Location {
    let size = polygon.len();
    if size < 3 {
        return Location { inside: false, min_distance: None };
    }

    let mut signs = SignTracker::default();
    let mut inside = true;
    let mut min_distance = f64::INFINITY;

    for i in 0..size {
        let start = polygon[i];
        let end = polygon[(i + 1) % size];

        if !signs.accept(cross(start.delta(end), start.delta(point))) {
            inside = false;
            if !measure_distance {
                return Location { inside, min_distance: None };
            }
        }

        if measure_distance {
            min_distance = min_distance.min(segment_distance(start, end, point));
        }
    }

    Location { inside, min_distance: measure_distance.then_some(min_distance) }
}

/// Convenience wrapper: whether a point lies inside or on the polygon
pub fn contains(polygon: &[Point], point: Point) -> bool {
    is_convex(polygon) && locate(polygon, point, false).inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poly(points: &[(i32, i32)]) -> Vec<Point> {
        points.iter().map(|&(x, y)| Point::new(x, y)).collect()
    }

    #[test]
    fn test_convexity() {
        assert!(is_convex(&poly(&[(0, 0), (10, 0), (10, 10), (0, 10)])));
        assert!(is_convex(&poly(&[(0, 0), (0, 10), (10, 10), (10, 0)])));
        assert!(is_convex(&poly(&[(-500, 500), (500, 500), (0, 1500)])));

        // Self-intersecting bow tie
        assert!(!is_convex(&poly(&[(0, 0), (10, 10), (10, 0), (0, 10)])));
        // Concave arrow head
        assert!(!is_convex(&poly(&[(0, 0), (10, 5), (0, 10), (3, 5)])));
        // Too few points, duplicates, collinear
        assert!(!is_convex(&poly(&[(0, 0), (10, 0)])));
        assert!(!is_convex(&poly(&[(0, 0), (10, 0), (10, 0), (0, 10)])));
        assert!(!is_convex(&poly(&[(0, 0), (0, 0), (0, 0)])));
        assert!(!is_convex(&poly(&[(0, 0), (5, 0), (10, 0)])));
    }

    #[test]
    fn test_collinear_corner_is_allowed() {
        assert!(is_convex(&poly(&[(0, 0), (5, 0), (10, 0), (10, 10), (0, 10)])));
    }

    #[test]
    fn test_containment() {
        let square = poly(&[(0, 0), (1000, 0), (1000, 1000), (0, 1000)]);
        assert!(contains(&square, Point::new(500, 500)));
        assert!(contains(&square, Point::new(0, 0)));
        assert!(contains(&square, Point::new(1000, 500)));
        assert!(!contains(&square, Point::new(1001, 500)));
        assert!(!contains(&square, Point::new(-1, -1)));

        let reversed: Vec<_> = square.iter().rev().copied().collect();
        assert!(contains(&reversed, Point::new(500, 500)));
        assert!(!contains(&reversed, Point::new(500, 1200)));
    }

    #[test]
    fn test_locate_with_distance() {
        let square = poly(&[(0, 0), (1000, 0), (1000, 1000), (0, 1000)]);

        let location = locate(&square, Point::new(500, -1), true);
        assert!(!location.inside);
        assert!((location.min_distance.unwrap() - 1.0).abs() < 1e-9);

        let location = locate(&square, Point::new(1300, 1400), true);
        assert!(!location.inside);
        assert!((location.min_distance.unwrap() - 500.0).abs() < 1e-9);

        let location = locate(&square, Point::new(500, 100), true);
        assert!(location.inside);
        assert!((location.min_distance.unwrap() - 100.0).abs() < 1e-9);

        assert_eq!(locate(&square, Point::new(500, -1), false).min_distance, None);
    }

    #[test]
    fn test_segment_distance_clamps_to_endpoints() {
        let a = Point::new(0, 0);
        let b = Point::new(100, 0);
        assert_eq!(segment_distance(a, b, Point::new(50, 30)), 30.0);
        assert_eq!(segment_distance(a, b, Point::new(-30, -40)), 50.0);
        assert_eq!(segment_distance(a, b, Point::new(130, 40)), 50.0);
    }
}
