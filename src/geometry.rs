//! Geometric primitives shared by the mask and warp engines
//!
//! Coordinates are pixel coordinates in the person canvas unless stated
//! otherwise: `x` grows to the right, `y` grows downwards.

use image::{Rgb, RgbImage};
use imageproc::{drawing, point::Point as PixelPoint};
use serde::{Deserialize, Serialize};

/// A 2D point in pixel space
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn midpoint(self, other: Self) -> Self {
        Self::new((self.x + other.x) * 0.5, (self.y + other.y) * 0.5)
    }

    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Axis-aligned pixel rectangle `(x, y, width, height)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from inclusive corner coordinates `(x1, y1)`-`(x2, y2)`
    #[must_use]
    pub fn from_corners(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        let (x1, x2) = (x1.min(x2), x1.max(x2));
        let (y1, y2) = (y1.min(y2), y1.max(y2));
        Self::new(x1, y1, x2 - x1 + 1, y2 - y1 + 1)
    }

    /// Exclusive right edge
    #[must_use]
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Exclusive bottom edge
    #[must_use]
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[must_use]
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    #[must_use]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    #[must_use]
    pub fn center(&self) -> Point {
        Point::new(
            f64::from(self.x) + f64::from(self.width) * 0.5,
            f64::from(self.y) + f64::from(self.height) * 0.5,
        )
    }

    /// Grow by `padding` on every side, clipped to a `width` x `height` canvas
    #[must_use]
    pub fn expand_clipped(&self, padding: u32, width: u32, height: u32) -> Self {
        let x1 = self.x.saturating_sub(padding).min(width);
        let y1 = self.y.saturating_sub(padding).min(height);
        let x2 = self.right().saturating_add(padding).min(width);
        let y2 = self.bottom().saturating_add(padding).min(height);
        Self::new(x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
    }

    /// Scale into a canvas of different resolution
    #[must_use]
    pub fn scaled(&self, sx: f64, sy: f64) -> Self {
        let x1 = (f64::from(self.x) * sx).floor().max(0.0) as u32;
        let y1 = (f64::from(self.y) * sy).floor().max(0.0) as u32;
        let x2 = (f64::from(self.right()) * sx).ceil().max(0.0) as u32;
        let y2 = (f64::from(self.bottom()) * sy).ceil().max(0.0) as u32;
        Self::new(x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
    }

    /// Corners in clockwise order starting top-left
    #[must_use]
    pub fn corners(&self) -> [Point; 4] {
        let (x1, y1) = (f64::from(self.x), f64::from(self.y));
        let (x2, y2) = (f64::from(self.right()), f64::from(self.bottom()));
        [
            Point::new(x1, y1),
            Point::new(x2, y1),
            Point::new(x2, y2),
            Point::new(x1, y2),
        ]
    }
}

/// 2x3 affine transform: `x' = a*x + b*y + tx`, `y' = c*x + d*y + ty`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine2 {
    pub a: f64,
    pub b: f64,
    pub tx: f64,
    pub c: f64,
    pub d: f64,
    pub ty: f64,
}

impl Default for Affine2 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Affine2 {
    #[must_use]
    pub const fn identity() -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            tx: 0.0,
            c: 0.0,
            d: 1.0,
            ty: 0.0,
        }
    }

    #[must_use]
    pub const fn translation(tx: f64, ty: f64) -> Self {
        Self {
            a: 1.0,
            b: 0.0,
            tx,
            c: 0.0,
            d: 1.0,
            ty,
        }
    }

    #[must_use]
    pub const fn scale(sx: f64, sy: f64) -> Self {
        Self {
            a: sx,
            b: 0.0,
            tx: 0.0,
            c: 0.0,
            d: sy,
            ty: 0.0,
        }
    }

    #[must_use]
    pub fn rotation(theta: f64) -> Self {
        let (s, c) = theta.sin_cos();
        Self {
            a: c,
            b: -s,
            tx: 0.0,
            c: s,
            d: c,
            ty: 0.0,
        }
    }

    /// `self` followed by `next`
    #[must_use]
    pub fn then(&self, next: &Self) -> Self {
        Self {
            a: next.a * self.a + next.b * self.c,
            b: next.a * self.b + next.b * self.d,
            tx: next.a * self.tx + next.b * self.ty + next.tx,
            c: next.c * self.a + next.d * self.c,
            d: next.c * self.b + next.d * self.d,
            ty: next.c * self.tx + next.d * self.ty + next.ty,
        }
    }

    #[must_use]
    pub fn apply(&self, p: Point) -> Point {
        Point::new(
            self.a * p.x + self.b * p.y + self.tx,
            self.c * p.x + self.d * p.y + self.ty,
        )
    }

    #[must_use]
    pub fn determinant(&self) -> f64 {
        self.a * self.d - self.b * self.c
    }

    /// Inverse transform, `None` when singular
    #[must_use]
    pub fn inverse(&self) -> Option<Self> {
        let det = self.determinant();
        if det.abs() < 1e-12 || !det.is_finite() {
            return None;
        }
        let inv = 1.0 / det;
        let a = self.d * inv;
        let b = -self.b * inv;
        let c = -self.c * inv;
        let d = self.a * inv;
        Some(Self {
            a,
            b,
            tx: -(a * self.tx + b * self.ty),
            c,
            d,
            ty: -(c * self.tx + d * self.ty),
        })
    }
}

/// OpenPose COCO-18 body landmarks, in collaborator output order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyPart {
    Nose = 0,
    Neck = 1,
    RightShoulder = 2,
    RightElbow = 3,
    RightWrist = 4,
    LeftShoulder = 5,
    LeftElbow = 6,
    LeftWrist = 7,
    RightHip = 8,
    RightKnee = 9,
    RightAnkle = 10,
    LeftHip = 11,
    LeftKnee = 12,
    LeftAnkle = 13,
    RightEye = 14,
    LeftEye = 15,
    RightEar = 16,
    LeftEar = 17,
}

impl BodyPart {
    pub const COUNT: usize = 18;

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Limb connections used for the pose map, with their drawing colors
pub const SKELETON: [(BodyPart, BodyPart, [u8; 3]); 17] = [
    (BodyPart::Neck, BodyPart::RightShoulder, [255, 0, 0]),
    (BodyPart::Neck, BodyPart::LeftShoulder, [255, 85, 0]),
    (BodyPart::RightShoulder, BodyPart::RightElbow, [255, 170, 0]),
    (BodyPart::RightElbow, BodyPart::RightWrist, [255, 255, 0]),
    (BodyPart::LeftShoulder, BodyPart::LeftElbow, [170, 255, 0]),
    (BodyPart::LeftElbow, BodyPart::LeftWrist, [85, 255, 0]),
    (BodyPart::Neck, BodyPart::RightHip, [0, 255, 0]),
    (BodyPart::RightHip, BodyPart::RightKnee, [0, 255, 85]),
    (BodyPart::RightKnee, BodyPart::RightAnkle, [0, 255, 170]),
    (BodyPart::Neck, BodyPart::LeftHip, [0, 255, 255]),
    (BodyPart::LeftHip, BodyPart::LeftKnee, [0, 170, 255]),
    (BodyPart::LeftKnee, BodyPart::LeftAnkle, [0, 85, 255]),
    (BodyPart::Neck, BodyPart::Nose, [0, 0, 255]),
    (BodyPart::Nose, BodyPart::RightEye, [85, 0, 255]),
    (BodyPart::RightEye, BodyPart::RightEar, [170, 0, 255]),
    (BodyPart::Nose, BodyPart::LeftEye, [255, 0, 255]),
    (BodyPart::LeftEye, BodyPart::LeftEar, [255, 0, 170]),
];

/// One detected landmark
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    #[must_use]
    pub const fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    #[must_use]
    pub fn point(&self) -> Point {
        Point::new(f64::from(self.x), f64::from(self.y))
    }
}

/// Ordered body landmarks produced by the pose collaborator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KeypointSet {
    pub points: Vec<Keypoint>,
}

impl KeypointSet {
    #[must_use]
    pub fn new(points: Vec<Keypoint>) -> Self {
        Self { points }
    }

    /// Build from `(part, x, y, confidence)` tuples; missing parts get zero confidence
    #[must_use]
    pub fn from_parts(parts: &[(BodyPart, f32, f32, f32)]) -> Self {
        let mut points = vec![Keypoint::default(); BodyPart::COUNT];
        for &(part, x, y, confidence) in parts {
            points[part.index()] = Keypoint::new(x, y, confidence);
        }
        Self { points }
    }

    #[must_use]
    pub fn get(&self, part: BodyPart) -> Option<&Keypoint> {
        self.points.get(part.index())
    }

    /// Landmark position if detected with at least `min_confidence`
    #[must_use]
    pub fn confident(&self, part: BodyPart, min_confidence: f32) -> Option<Point> {
        self.get(part)
            .filter(|k| k.confidence >= min_confidence && k.x.is_finite() && k.y.is_finite())
            .map(Keypoint::point)
    }

    #[must_use]
    pub fn count_confident(&self, min_confidence: f32) -> usize {
        self.points
            .iter()
            .filter(|k| k.confidence >= min_confidence)
            .count()
    }

    /// Drop landmarks that fall outside a `width` x `height` canvas
    #[must_use]
    pub fn within_canvas(mut self, width: u32, height: u32) -> Self {
        for k in &mut self.points {
            let outside = !k.x.is_finite()
                || !k.y.is_finite()
                || k.x < 0.0
                || k.y < 0.0
                || k.x >= width as f32
                || k.y >= height as f32;
            if outside {
                k.confidence = 0.0;
            }
        }
        self
    }
}

/// Draw an OpenPose-style skeleton on a black canvas
#[must_use]
pub fn render_pose_map(
    keypoints: &KeypointSet,
    width: u32,
    height: u32,
    min_confidence: f32,
) -> RgbImage {
    let mut canvas = RgbImage::new(width, height);
    let thickness = (f64::from(width.min(height)) / 128.0).max(2.0);

    for &(from, to, color) in &SKELETON {
        if let (Some(p), Some(q)) = (
            keypoints.confident(from, min_confidence),
            keypoints.confident(to, min_confidence),
        ) {
            draw_limb(&mut canvas, p, q, thickness, Rgb(color));
        }
    }
    for (i, k) in keypoints.points.iter().enumerate().take(BodyPart::COUNT) {
        if k.confidence >= min_confidence {
            let color = SKELETON[i % SKELETON.len()].2;
            let p = k.point();
            drawing::draw_filled_circle_mut(
                &mut canvas,
                (p.x.round() as i32, p.y.round() as i32),
                (thickness * 1.5).round() as i32,
                Rgb(color),
            );
        }
    }
    canvas
}

/// Thick segment: a filled quad along the limb with round caps
fn draw_limb(canvas: &mut RgbImage, p: Point, q: Point, half_width: f64, color: Rgb<u8>) {
    let corner = |c: Point| PixelPoint::new(c.x.round() as i32, c.y.round() as i32);
    let (dx, dy) = (q.x - p.x, q.y - p.y);
    let length = (dx * dx + dy * dy).sqrt();
    if length >= 1.0 {
        let (nx, ny) = (-dy / length * half_width, dx / length * half_width);
        let quad = [
            corner(Point::new(p.x + nx, p.y + ny)),
            corner(Point::new(q.x + nx, q.y + ny)),
            corner(Point::new(q.x - nx, q.y - ny)),
            corner(Point::new(p.x - nx, p.y - ny)),
        ];
        if quad[0] != quad[3] {
            drawing::draw_polygon_mut(canvas, &quad, color);
        }
    }
    let radius = half_width.round() as i32;
    for end in [p, q] {
        drawing::draw_filled_circle_mut(
            canvas,
            (end.x.round() as i32, end.y.round() as i32),
            radius,
            color,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(p: Point, q: Point) {
        assert!(p.distance(q) < 1e-9, "{p:?} != {q:?}");
    }

    #[test]
    fn test_bbox_expand_is_clipped() {
        let bbox = BoundingBox::new(5, 10, 20, 20);
        let grown = bbox.expand_clipped(30, 100, 40);
        assert_eq!(grown, BoundingBox::new(0, 0, 55, 40));
    }

    #[test]
    fn test_bbox_from_corners_is_inclusive() {
        let bbox = BoundingBox::from_corners(10, 20, 19, 29);
        assert_eq!(bbox.width, 10);
        assert_eq!(bbox.height, 10);
        assert!(bbox.contains(19, 29));
        assert!(!bbox.contains(20, 29));
    }

    #[test]
    fn test_affine_inverse_round_trip() {
        let t = Affine2::scale(2.0, 0.5)
            .then(&Affine2::rotation(0.3))
            .then(&Affine2::translation(10.0, -4.0));
        let inv = t.inverse().unwrap();
        let p = Point::new(13.0, 7.5);
        assert_close(inv.apply(t.apply(p)), p);
    }

    #[test]
    fn test_affine_composition_order() {
        let t = Affine2::scale(2.0, 2.0).then(&Affine2::translation(1.0, 0.0));
        assert_close(t.apply(Point::new(1.0, 1.0)), Point::new(3.0, 2.0));
    }

    #[test]
    fn test_singular_affine_has_no_inverse() {
        assert!(Affine2::scale(0.0, 1.0).inverse().is_none());
    }

    #[test]
    fn test_keypoints_outside_canvas_are_dropped() {
        let set = KeypointSet::from_parts(&[
            (BodyPart::Neck, 50.0, 20.0, 0.9),
            (BodyPart::LeftAnkle, 50.0, 500.0, 0.9),
        ])
        .within_canvas(100, 100);
        assert!(set.confident(BodyPart::Neck, 0.5).is_some());
        assert!(set.confident(BodyPart::LeftAnkle, 0.5).is_none());
    }

    #[test]
    fn test_pose_map_draws_confident_limbs_only() {
        let set = KeypointSet::from_parts(&[
            (BodyPart::Neck, 50.0, 20.0, 0.9),
            (BodyPart::RightShoulder, 30.0, 25.0, 0.9),
            (BodyPart::LeftShoulder, 70.0, 25.0, 0.1),
        ]);
        let map = render_pose_map(&set, 100, 100, 0.3);
        assert_ne!(map.get_pixel(40, 22).0, [0, 0, 0]);
        // Limbs are drawn wider than a hairline
        assert_ne!(map.get_pixel(40, 24).0, [0, 0, 0]);
        assert_eq!(map.get_pixel(90, 90).0, [0, 0, 0]);
        assert_eq!(map.get_pixel(64, 24).0, [0, 0, 0]);
    }
}
