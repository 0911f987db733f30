use serde::{Deserialize, Serialize};

/// A 2D point with floating-point coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub const fn zero() -> Self {
        Self { x: 0.0, y: 0.0 }
    }
}

impl std::ops::Add for Point {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
        }
    }
}

impl std::ops::AddAssign for Point {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl std::ops::Sub for Point {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
        }
    }
}

impl std::ops::Mul<f32> for Point {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self::Output {
        Self {
            x: self.x * rhs,
            y: self.y * rhs,
        }
    }
}

/// An axis-aligned rectangle with inclusive pixel bounds.
///
/// A rectangle whose `right < left` or `bottom < top` is empty. This matches
/// the convention used by dlib, so rectangles read from or written for dlib
/// tools need no conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rectangle {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl Rectangle {
    pub const fn new(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// A `width` x `height` rectangle with its top-left corner at (`left`, `top`).
    pub const fn from_size(left: i64, top: i64, width: i64, height: i64) -> Self {
        Self::new(left, top, left + width - 1, top + height - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.left > self.right || self.top > self.bottom
    }

    pub fn width(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.right - self.left + 1
        }
    }

    pub fn height(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.bottom - self.top + 1
        }
    }

    pub fn area(&self) -> i64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> Point {
        Point::new(
            (self.left + self.right) as f32 / 2.0,
            (self.top + self.bottom) as f32 / 2.0,
        )
    }

    pub fn intersect(&self, other: &Rectangle) -> Rectangle {
        Rectangle::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        )
    }

    /// Intersection area over union area, 0 when either box is empty.
    pub fn iou(&self, other: &Rectangle) -> f64 {
        let inner = self.intersect(other).area();
        if inner == 0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inner;
        inner as f64 / union as f64
    }

    /// Fraction of the smaller box covered by the intersection.
    pub fn covered_fraction(&self, other: &Rectangle) -> f64 {
        let inner = self.intersect(other).area();
        if inner == 0 {
            return 0.0;
        }
        let smaller = self.area().min(other.area());
        inner as f64 / smaller as f64
    }

    /// Mirror the rectangle across the vertical axis of an image `image_width` pixels wide.
    pub fn flip_left_right(&self, image_width: u32) -> Rectangle {
        let last = image_width as i64 - 1;
        Rectangle::new(last - self.right, self.top, last - self.left, self.bottom)
    }

    /// Map a point from rectangle-normalized coordinates, where (0,0) is the
    /// top-left corner and (1,1) the bottom-right corner, to image coordinates.
    pub fn denormalize_point(&self, p: Point) -> Point {
        Point::new(
            self.left as f32 + p.x * (self.right - self.left) as f32,
            self.top as f32 + p.y * (self.bottom - self.top) as f32,
        )
    }

    /// Inverse of [`Rectangle::denormalize_point`]. Degenerate axes map to 0.
    pub fn normalize_point(&self, p: Point) -> Point {
        let span_x = (self.right - self.left) as f32;
        let span_y = (self.bottom - self.top) as f32;
        Point::new(
            if span_x != 0.0 { (p.x - self.left as f32) / span_x } else { 0.0 },
            if span_y != 0.0 { (p.y - self.top as f32) / span_y } else { 0.0 },
        )
    }
}

/// An ordered set of landmark points, one per semantic landmark index.
/// The standard dlib face model uses 68 landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub points: Vec<Point>,
}

impl Shape {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn num_landmarks(&self) -> usize {
        self.points.len()
    }

    /// Create a zeroed shape with n landmarks.
    pub fn zeros(n: usize) -> Self {
        Self {
            points: vec![Point::zero(); n],
        }
    }

    /// Add another shape's deltas to this shape.
    pub fn add_delta(&mut self, delta: &Shape) {
        debug_assert_eq!(self.points.len(), delta.points.len());
        for (p, d) in self.points.iter_mut().zip(delta.points.iter()) {
            *p += *d;
        }
    }
}

impl std::ops::Index<usize> for Shape {
    type Output = Point;

    fn index(&self, idx: usize) -> &Self::Output {
        &self.points[idx]
    }
}

impl std::ops::IndexMut<usize> for Shape {
    fn index_mut(&mut self, idx: usize) -> &mut Self::Output {
        &mut self.points[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_arithmetic() {
        let a = Point::new(1.0, 2.0);
        let b = Point::new(3.0, 4.0);

        let sum = a + b;
        assert_eq!(sum.x, 4.0);
        assert_eq!(sum.y, 6.0);

        let diff = b - a;
        assert_eq!(diff.x, 2.0);
        assert_eq!(diff.y, 2.0);

        let scaled = a * 2.0;
        assert_eq!(scaled.x, 2.0);
        assert_eq!(scaled.y, 4.0);
    }

    #[test]
    fn rectangle_normalization() {
        let rect = Rectangle::new(100, 100, 300, 300);

        let center_img = rect.denormalize_point(Point::new(0.5, 0.5));
        assert_eq!(center_img.x, 200.0);
        assert_eq!(center_img.y, 200.0);

        let back = rect.normalize_point(center_img);
        assert!((back.x - 0.5).abs() < 1e-6);
        assert!((back.y - 0.5).abs() < 1e-6);

        let corner = rect.denormalize_point(Point::new(1.0, 1.0));
        assert_eq!(corner, Point::new(300.0, 300.0));
    }

    #[test]
    fn rectangle_dimensions_are_inclusive() {
        let rect = Rectangle::new(10, 20, 19, 39);
        assert_eq!(rect.width(), 10);
        assert_eq!(rect.height(), 20);
        assert_eq!(rect.area(), 200);
        assert_eq!(Rectangle::from_size(10, 20, 10, 20), rect);

        let empty = Rectangle::new(5, 5, 4, 10);
        assert!(empty.is_empty());
        assert_eq!(empty.area(), 0);
    }

    #[test]
    fn rectangle_overlap_measures() {
        let a = Rectangle::from_size(0, 0, 10, 10);
        let b = Rectangle::from_size(5, 0, 10, 10);
        // 50 shared pixels, 150 in the union
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-12);
        assert!((a.covered_fraction(&b) - 0.5).abs() < 1e-12);

        let inner = Rectangle::from_size(2, 2, 4, 4);
        assert!((a.covered_fraction(&inner) - 1.0).abs() < 1e-12);

        let far = Rectangle::from_size(50, 50, 4, 4);
        assert_eq!(a.iou(&far), 0.0);
    }

    #[test]
    fn flip_is_an_involution() {
        let rect = Rectangle::new(3, 7, 12, 20);
        let flipped = rect.flip_left_right(40);
        assert_eq!(flipped, Rectangle::new(27, 7, 36, 20));
        assert_eq!(flipped.flip_left_right(40), rect);
    }

    #[test]
    fn shape_delta() {
        let mut shape = Shape::new(vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)]);
        let delta = Shape::new(vec![Point::new(0.1, 0.2), Point::new(0.3, 0.4)]);
        shape.add_delta(&delta);

        assert!((shape[0].x - 0.1).abs() < 1e-6);
        assert!((shape[0].y - 0.2).abs() < 1e-6);
        assert!((shape[1].x - 1.3).abs() < 1e-6);
        assert!((shape[1].y - 1.4).abs() < 1e-6);
    }
}
