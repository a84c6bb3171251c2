//! Warp engine
//!
//! Maps garment pixels onto the person canvas in two steps: an affine fit
//! of the garment silhouette box onto the body span of the category, then a
//! thin-plate spline that pulls garment landmarks onto the detected
//! keypoints. The spline is skipped, with a caveat, when keypoints are too
//! few or the correspondences are degenerate.

use crate::{
    config::TryOnConfig,
    error::{Result, TryOnError},
    geometry::{Affine2, BodyPart, BoundingBox, KeypointSet, Point},
    mask::BinaryMask,
    types::{GarmentCategory, QualityCaveat},
};
use image::{Rgb, RgbImage};
use nalgebra::DMatrix;
use tracing::{debug, warn};

/// Pixels trimmed from each side when the silhouette cannot be separated
const FALLBACK_INSET: u32 = 10;

/// Color distance from the border color that counts as garment
const SILHOUETTE_THRESHOLD: f32 = 40.0;

/// Largest tilt applied from the shoulder or hip line
const MAX_TILT: f64 = std::f64::consts::FRAC_PI_6;

/// Warp engine parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WarpSettings {
    pub min_keypoint_confidence: f32,
    pub min_tps_keypoints: usize,
}

impl Default for WarpSettings {
    fn default() -> Self {
        Self::from(&TryOnConfig::default())
    }
}

impl From<&TryOnConfig> for WarpSettings {
    fn from(config: &TryOnConfig) -> Self {
        Self {
            min_keypoint_confidence: config.min_keypoint_confidence,
            min_tps_keypoints: config.min_tps_keypoints,
        }
    }
}

/// How the garment was deformed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarpMode {
    ThinPlate,
    AffineOnly,
}

/// Garment pixels in person-canvas layout
#[derive(Debug, Clone)]
pub struct WarpedGarment {
    /// Warped garment, black where `coverage` is unset
    pub image: RgbImage,
    /// Canvas pixels that received garment pixels
    pub coverage: BinaryMask,
    pub mode: WarpMode,
    /// Set whenever `mode` is affine-only
    pub caveat: Option<QualityCaveat>,
    /// Source-to-canvas coarse alignment
    pub affine: Affine2,
}

/// Garment landmark positions in the unit square of the silhouette box
fn garment_landmarks(category: GarmentCategory) -> &'static [(BodyPart, f64, f64)] {
    match category {
        GarmentCategory::Upper => &[
            (BodyPart::Neck, 0.5, 0.0),
            (BodyPart::RightShoulder, 0.15, 0.05),
            (BodyPart::LeftShoulder, 0.85, 0.05),
            (BodyPart::RightElbow, 0.02, 0.4),
            (BodyPart::LeftElbow, 0.98, 0.4),
            (BodyPart::RightHip, 0.2, 0.97),
            (BodyPart::LeftHip, 0.8, 0.97),
        ],
        GarmentCategory::Lower => &[
            (BodyPart::RightHip, 0.2, 0.02),
            (BodyPart::LeftHip, 0.8, 0.02),
            (BodyPart::RightKnee, 0.25, 0.5),
            (BodyPart::LeftKnee, 0.75, 0.5),
            (BodyPart::RightAnkle, 0.25, 0.98),
            (BodyPart::LeftAnkle, 0.75, 0.98),
        ],
        GarmentCategory::Full => &[
            (BodyPart::RightShoulder, 0.2, 0.03),
            (BodyPart::LeftShoulder, 0.8, 0.03),
            (BodyPart::RightHip, 0.25, 0.45),
            (BodyPart::LeftHip, 0.75, 0.45),
            (BodyPart::RightKnee, 0.28, 0.72),
            (BodyPart::LeftKnee, 0.72, 0.72),
            (BodyPart::RightAnkle, 0.3, 0.98),
            (BodyPart::LeftAnkle, 0.7, 0.98),
        ],
    }
}

/// Keypoints whose span the garment box is fitted to
fn body_span_parts(category: GarmentCategory) -> &'static [BodyPart] {
    match category {
        GarmentCategory::Upper => &[
            BodyPart::RightShoulder,
            BodyPart::LeftShoulder,
            BodyPart::RightHip,
            BodyPart::LeftHip,
        ],
        GarmentCategory::Lower => &[
            BodyPart::RightHip,
            BodyPart::LeftHip,
            BodyPart::RightKnee,
            BodyPart::LeftKnee,
            BodyPart::RightAnkle,
            BodyPart::LeftAnkle,
        ],
        GarmentCategory::Full => &[
            BodyPart::RightShoulder,
            BodyPart::LeftShoulder,
            BodyPart::RightHip,
            BodyPart::LeftHip,
            BodyPart::RightAnkle,
            BodyPart::LeftAnkle,
        ],
    }
}

/// Pair whose line gives the body tilt
fn tilt_pair(category: GarmentCategory) -> (BodyPart, BodyPart) {
    match category {
        GarmentCategory::Upper | GarmentCategory::Full => {
            (BodyPart::RightShoulder, BodyPart::LeftShoulder)
        },
        GarmentCategory::Lower => (BodyPart::RightHip, BodyPart::LeftHip),
    }
}

/// Separate the garment from a flat product-photo background
///
/// The background color is the mean of the image border. Falls back to the
/// image inset by a fixed margin when the separation is implausible.
#[must_use]
pub fn garment_silhouette(garment: &RgbImage) -> BinaryMask {
    let (w, h) = garment.dimensions();
    let inset = || {
        let bbox = BoundingBox::new(FALLBACK_INSET, FALLBACK_INSET, w, h)
            .expand_clipped(0, w.saturating_sub(FALLBACK_INSET), h.saturating_sub(FALLBACK_INSET));
        BinaryMask::from_box(w, h, bbox)
    };
    if w < 3 || h < 3 {
        return BinaryMask::from_fn(w, h, |_, _| true);
    }

    let mut sum = [0f64; 3];
    let mut n = 0f64;
    for (x, y, px) in garment.enumerate_pixels() {
        if x == 0 || y == 0 || x == w - 1 || y == h - 1 {
            for c in 0..3 {
                sum[c] += f64::from(px[c]);
            }
            n += 1.0;
        }
    }
    let background = sum.map(|s| (s / n) as f32);

    let raw = BinaryMask::from_fn(w, h, |x, y| {
        let px = garment.get_pixel(x, y);
        let d: f32 = (0..3)
            .map(|c| (f32::from(px[c]) - background[c]).powi(2))
            .sum::<f32>()
            .sqrt();
        d > SILHOUETTE_THRESHOLD
    });

    let ratio = raw.count() as f64 / (f64::from(w) * f64::from(h));
    if !(0.02..=0.98).contains(&ratio) {
        debug!(ratio, "garment silhouette implausible, using inset box");
        return inset();
    }
    raw.close(3)
}

/// Thin-plate spline `R^2 -> R^2` interpolating control points
#[derive(Debug, Clone)]
pub struct ThinPlateSpline {
    centers: Vec<Point>,
    weights: Vec<[f64; 2]>,
    linear: [[f64; 2]; 3],
    scale: f64,
}

fn tps_kernel(r2: f64) -> f64 {
    if r2 <= 1e-20 {
        0.0
    } else {
        r2 * r2.ln()
    }
}

impl ThinPlateSpline {
    /// Fit a spline mapping each `from[i]` exactly onto `to[i]`
    ///
    /// Coordinates are divided by `scale` for conditioning. Returns `None`
    /// when the system is singular.
    #[must_use]
    pub fn fit(from: &[Point], to: &[Point], scale: f64) -> Option<Self> {
        let n = from.len();
        if n < 3 || n != to.len() || scale <= 0.0 {
            return None;
        }
        let norm = |p: &Point| Point::new(p.x / scale, p.y / scale);
        let centers: Vec<Point> = from.iter().map(norm).collect();
        let targets: Vec<Point> = to.iter().map(norm).collect();

        let size = n + 3;
        let mut a = DMatrix::<f64>::zeros(size, size);
        let mut b = DMatrix::<f64>::zeros(size, 2);
        for i in 0..n {
            for j in 0..n {
                let dx = centers[i].x - centers[j].x;
                let dy = centers[i].y - centers[j].y;
                a[(i, j)] = tps_kernel(dx * dx + dy * dy);
            }
            let p = [1.0, centers[i].x, centers[i].y];
            for k in 0..3 {
                a[(i, n + k)] = p[k];
                a[(n + k, i)] = p[k];
            }
            b[(i, 0)] = targets[i].x;
            b[(i, 1)] = targets[i].y;
        }

        let solution = a.lu().solve(&b)?;
        if solution.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let row = |i: usize| [solution[(i, 0)], solution[(i, 1)]];
        Some(Self {
            centers,
            weights: (0..n).map(row).collect(),
            linear: [row(n), row(n + 1), row(n + 2)],
            scale,
        })
    }

    #[must_use]
    pub fn apply(&self, p: Point) -> Point {
        let q = Point::new(p.x / self.scale, p.y / self.scale);
        let mut out = [
            self.linear[0][0] + self.linear[1][0] * q.x + self.linear[2][0] * q.y,
            self.linear[0][1] + self.linear[1][1] * q.x + self.linear[2][1] * q.y,
        ];
        for (c, w) in self.centers.iter().zip(&self.weights) {
            let dx = q.x - c.x;
            let dy = q.y - c.y;
            let u = tps_kernel(dx * dx + dy * dy);
            out[0] += w[0] * u;
            out[1] += w[1] * u;
        }
        Point::new(out[0] * self.scale, out[1] * self.scale)
    }

    /// Jacobian determinant by central differences
    #[must_use]
    pub fn jacobian_determinant(&self, p: Point, step: f64) -> f64 {
        let fx1 = self.apply(Point::new(p.x + step, p.y));
        let fx0 = self.apply(Point::new(p.x - step, p.y));
        let fy1 = self.apply(Point::new(p.x, p.y + step));
        let fy0 = self.apply(Point::new(p.x, p.y - step));
        let inv = 1.0 / (2.0 * step);
        let (dxx, dyx) = ((fx1.x - fx0.x) * inv, (fx1.y - fx0.y) * inv);
        let (dxy, dyy) = ((fy1.x - fy0.x) * inv, (fy1.y - fy0.y) * inv);
        dxx * dyy - dxy * dyx
    }
}

/// True when the points are (nearly) collinear or contain duplicates
#[must_use]
pub fn is_degenerate(points: &[Point]) -> bool {
    if points.len() < 3 {
        return true;
    }
    for (i, p) in points.iter().enumerate() {
        if points[i + 1..].iter().any(|q| p.distance(*q) < 1.0) {
            return true;
        }
    }
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
    for p in points {
        let (dx, dy) = (p.x - cx, p.y - cy);
        sxx += dx * dx;
        syy += dy * dy;
        sxy += dx * dy;
    }
    let (sxx, syy, sxy) = (sxx / n, syy / n, sxy / n);
    let mean = (sxx + syy) * 0.5;
    let spread = ((sxx - syy) * 0.5).hypot(sxy);
    let minor = mean - spread;
    let major = mean + spread;
    // Minor-axis standard deviation under a pixel means the points sit on a line
    minor < 1.0 || minor / major.max(f64::EPSILON) < 1e-3
}

/// Bilinear sample; `None` outside the image
fn sample_bilinear(image: &RgbImage, x: f64, y: f64) -> Option<[f32; 3]> {
    let (w, h) = image.dimensions();
    if x < 0.0 || y < 0.0 || x > f64::from(w - 1) || y > f64::from(h - 1) {
        return None;
    }
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = ((x - f64::from(x0)) as f32, (y - f64::from(y0)) as f32);
    let (p00, p10) = (image.get_pixel(x0, y0), image.get_pixel(x1, y0));
    let (p01, p11) = (image.get_pixel(x0, y1), image.get_pixel(x1, y1));
    let mut out = [0f32; 3];
    for c in 0..3 {
        let top = f32::from(p00[c]) * (1.0 - fx) + f32::from(p10[c]) * fx;
        let bottom = f32::from(p01[c]) * (1.0 - fx) + f32::from(p11[c]) * fx;
        out[c] = top * (1.0 - fy) + bottom * fy;
    }
    Some(out)
}

/// Aligns garment imagery to body geometry
#[derive(Debug, Clone, Default)]
pub struct WarpEngine {
    settings: WarpSettings,
}

impl WarpEngine {
    #[must_use]
    pub fn new(settings: WarpSettings) -> Self {
        Self { settings }
    }

    /// Warp `garment` onto a `canvas` sized like the person image
    ///
    /// `garment_mask` is the person-side garment region; its box is the
    /// alignment target when keypoints cannot provide a body span.
    pub fn warp(
        &self,
        garment: &RgbImage,
        keypoints: &KeypointSet,
        category: GarmentCategory,
        garment_mask: &BinaryMask,
        canvas: (u32, u32),
    ) -> Result<WarpedGarment> {
        let (cw, ch) = canvas;
        let silhouette = garment_silhouette(garment);
        let source_box = silhouette
            .bounding_box()
            .ok_or_else(|| TryOnError::invalid_input("garment image has no visible garment"))?;
        let target_box = self
            .body_span(keypoints, category, canvas)
            .or_else(|| garment_mask.bounding_box())
            .ok_or_else(|| TryOnError::internal("no alignment target for garment"))?;

        let affine = self.coarse_affine(source_box, target_box, keypoints, category);
        let inverse = affine
            .inverse()
            .ok_or_else(|| TryOnError::internal("garment alignment is singular"))?;

        let (spline, caveat) = self.refine(source_box, &affine, keypoints, category, canvas);
        let mode = if spline.is_some() {
            WarpMode::ThinPlate
        } else {
            WarpMode::AffineOnly
        };

        let mut image = RgbImage::new(cw, ch);
        let mut coverage = BinaryMask::empty(cw, ch);
        for y in 0..ch {
            for x in 0..cw {
                let p = Point::new(f64::from(x), f64::from(y));
                let aligned = spline.as_ref().map_or(p, |tps| tps.apply(p));
                let src = inverse.apply(aligned);
                let (sx, sy) = (src.x.round(), src.y.round());
                if sx < 0.0 || sy < 0.0 {
                    continue;
                }
                let (sxi, syi) = (sx as u32, sy as u32);
                if sxi >= garment.width() || syi >= garment.height() || !silhouette.get(sxi, syi) {
                    continue;
                }
                if let Some(rgb) = sample_bilinear(garment, src.x, src.y) {
                    image.put_pixel(x, y, Rgb(rgb.map(|v| v.round().clamp(0.0, 255.0) as u8)));
                    coverage.set(x, y, true);
                }
            }
        }

        debug!(?mode, covered_px = coverage.count(), "warped garment");
        Ok(WarpedGarment {
            image,
            coverage,
            mode,
            caveat,
            affine,
        })
    }

    /// Box around the confident body-span keypoints, widened for the garment
    fn body_span(
        &self,
        keypoints: &KeypointSet,
        category: GarmentCategory,
        (cw, ch): (u32, u32),
    ) -> Option<BoundingBox> {
        let points: Vec<Point> = body_span_parts(category)
            .iter()
            .filter_map(|part| keypoints.confident(*part, self.settings.min_keypoint_confidence))
            .collect();
        if points.len() < 2 {
            return None;
        }
        let (mut x1, mut y1) = (f64::MAX, f64::MAX);
        let (mut x2, mut y2) = (f64::MIN, f64::MIN);
        for p in &points {
            x1 = x1.min(p.x);
            y1 = y1.min(p.y);
            x2 = x2.max(p.x);
            y2 = y2.max(p.y);
        }
        let (bw, bh) = (x2 - x1, y2 - y1);
        if bw < 2.0 || bh < 2.0 {
            return None;
        }
        let (px, py) = (bw * 0.15, bh * 0.05);
        let left = (x1 - px).max(0.0);
        let top = (y1 - py).max(0.0);
        let right = (x2 + px).min(f64::from(cw));
        let bottom = (y2 + py).min(f64::from(ch));
        if right - left < 2.0 || bottom - top < 2.0 {
            return None;
        }
        Some(BoundingBox::new(
            left as u32,
            top as u32,
            (right - left) as u32,
            (bottom - top) as u32,
        ))
    }

    /// Scale, tilt and translate the silhouette box onto the body box
    fn coarse_affine(
        &self,
        source: BoundingBox,
        target: BoundingBox,
        keypoints: &KeypointSet,
        category: GarmentCategory,
    ) -> Affine2 {
        let (a, b) = tilt_pair(category);
        let min = self.settings.min_keypoint_confidence;
        let tilt = match (keypoints.confident(a, min), keypoints.confident(b, min)) {
            (Some(p), Some(q)) if (q.x - p.x).abs() > 1.0 => {
                ((q.y - p.y).atan2(q.x - p.x)).clamp(-MAX_TILT, MAX_TILT)
            },
            _ => 0.0,
        };
        let (sc, tc) = (source.center(), target.center());
        Affine2::translation(-sc.x, -sc.y)
            .then(&Affine2::scale(
                f64::from(target.width) / f64::from(source.width.max(1)),
                f64::from(target.height) / f64::from(source.height.max(1)),
            ))
            .then(&Affine2::rotation(tilt))
            .then(&Affine2::translation(tc.x, tc.y))
    }

    /// Backward spline from canvas pixels to affine-aligned garment space
    fn refine(
        &self,
        source: BoundingBox,
        affine: &Affine2,
        keypoints: &KeypointSet,
        category: GarmentCategory,
        (cw, ch): (u32, u32),
    ) -> (Option<ThinPlateSpline>, Option<QualityCaveat>) {
        let min = self.settings.min_keypoint_confidence;
        let (sx, sy) = (f64::from(source.x), f64::from(source.y));
        let (sw, sh) = (f64::from(source.width), f64::from(source.height));

        let mut body = Vec::new();
        let mut aligned = Vec::new();
        for &(part, u, v) in garment_landmarks(category) {
            if let Some(k) = keypoints.confident(part, min) {
                body.push(k);
                aligned.push(affine.apply(Point::new(sx + u * sw, sy + v * sh)));
            }
        }

        if body.len() < self.settings.min_tps_keypoints {
            warn!(
                confident = body.len(),
                required = self.settings.min_tps_keypoints,
                "too few keypoints, falling back to affine warp"
            );
            return (None, Some(QualityCaveat::AffineOnlyWarp));
        }
        if is_degenerate(&body) {
            warn!("degenerate keypoint correspondences, falling back to affine warp");
            return (None, Some(QualityCaveat::DegenerateCorrespondences));
        }

        let (fw, fh) = (f64::from(cw.max(1) - 1), f64::from(ch.max(1) - 1));
        let corners = [
            Point::new(0.0, 0.0),
            Point::new(fw, 0.0),
            Point::new(fw, fh),
            Point::new(0.0, fh),
        ];
        let mut from = body;
        let mut to = aligned;
        for corner in corners {
            if from.iter().all(|p| p.distance(corner) >= 1.0) {
                from.push(corner);
                to.push(corner);
            }
        }

        let scale = f64::from(cw.max(ch).max(1));
        let Some(spline) = ThinPlateSpline::fit(&from, &to, scale) else {
            warn!("thin-plate system is singular, falling back to affine warp");
            return (None, Some(QualityCaveat::DegenerateCorrespondences));
        };

        let step = (scale / 32.0).max(1.0);
        let mut y = 0.0;
        while y <= fh {
            let mut x = 0.0;
            while x <= fw {
                if spline.jacobian_determinant(Point::new(x, y), 0.5) <= 0.0 {
                    warn!(x, y, "thin-plate warp folds over, falling back to affine warp");
                    return (None, Some(QualityCaveat::DegenerateCorrespondences));
                }
                x += step;
            }
            y += step;
        }

        (Some(spline), None)
    }
}
