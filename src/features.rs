//! Pixel-intensity features sampled around the current landmark estimate.

use crate::gray::ImageAccess;
use crate::tree::SplitFeature;
use crate::types::{Point, Rectangle, Shape};

/// Rotation-and-scale part of a 2D similarity transform.
///
/// Stored as the matrix `[[a, -b], [b, a]]`; the translation is dropped
/// because split offsets are relative to a landmark, not to the origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform2D {
    pub a: f32,
    pub b: f32,
}

impl SimilarityTransform2D {
    pub const fn identity() -> Self {
        Self { a: 1.0, b: 0.0 }
    }

    pub fn apply(&self, p: Point) -> Point {
        Point::new(self.a * p.x - self.b * p.y, self.b * p.x + self.a * p.y)
    }
}

/// Least-squares similarity transform taking `from` onto `to`.
///
/// Both shapes must have the same number of points. A degenerate source
/// shape (all points coincident) yields the identity.
pub fn find_similarity_transform(from: &Shape, to: &Shape) -> SimilarityTransform2D {
    debug_assert_eq!(from.num_landmarks(), to.num_landmarks());
    let n = from.num_landmarks();
    if n == 0 {
        return SimilarityTransform2D::identity();
    }

    let mean = |s: &Shape| {
        let mut acc = (0.0f64, 0.0f64);
        for p in &s.points {
            acc.0 += p.x as f64;
            acc.1 += p.y as f64;
        }
        (acc.0 / n as f64, acc.1 / n as f64)
    };
    let (fx, fy) = mean(from);
    let (tx, ty) = mean(to);

    let mut dot = 0.0f64;
    let mut cross = 0.0f64;
    let mut norm = 0.0f64;
    for (p, q) in from.points.iter().zip(&to.points) {
        let px = p.x as f64 - fx;
        let py = p.y as f64 - fy;
        let qx = q.x as f64 - tx;
        let qy = q.y as f64 - ty;
        dot += px * qx + py * qy;
        cross += px * qy - py * qx;
        norm += px * px + py * py;
    }

    if norm <= f64::EPSILON {
        return SimilarityTransform2D::identity();
    }

    SimilarityTransform2D {
        a: (dot / norm) as f32,
        b: (cross / norm) as f32,
    }
}

/// Computes the image-space pixel coordinates for a split feature.
///
/// Offsets live in the mean-shape frame; `tform` carries them into the frame
/// of the current estimate before the rectangle maps them to pixels.
pub fn compute_feature_points(
    feature: &SplitFeature,
    shape: &Shape,
    tform: &SimilarityTransform2D,
    rect: &Rectangle,
) -> (Point, Point) {
    let anchor1 = shape[feature.anchor1_idx as usize];
    let anchor2 = shape[feature.anchor2_idx as usize];

    let offset1 = tform.apply(Point::new(feature.offset1_x, feature.offset1_y));
    let offset2 = tform.apply(Point::new(feature.offset2_x, feature.offset2_y));

    (
        rect.denormalize_point(anchor1 + offset1),
        rect.denormalize_point(anchor2 + offset2),
    )
}

/// Nearest-pixel intensity; pixels outside the image read as 0.
#[inline]
fn sample_nearest<I: ImageAccess>(image: &I, p: Point) -> f32 {
    image.get_pixel(p.x.round() as i32, p.y.round() as i32) as f32
}

/// Compute the pixel intensity difference feature value.
pub fn compute_feature_value<I: ImageAccess>(
    feature: &SplitFeature,
    shape: &Shape,
    tform: &SimilarityTransform2D,
    rect: &Rectangle,
    image: &I,
) -> f32 {
    let (p1, p2) = compute_feature_points(feature, shape, tform, rect);
    sample_nearest(image, p1) - sample_nearest(image, p2)
}

/// Creates a feature extractor closure for use with tree prediction.
pub fn make_feature_extractor<'a, I: ImageAccess>(
    shape: &'a Shape,
    rect: &'a Rectangle,
    image: &'a I,
    tform: SimilarityTransform2D,
) -> impl Fn(&SplitFeature) -> f32 + 'a {
    move |feature: &SplitFeature| compute_feature_value(feature, shape, &tform, rect, image)
}
