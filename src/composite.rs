//! Compositing engine
//!
//! Merges the generated image into the original photo in three passes:
//!
//! 1. Poisson cloning of the generated garment over the blend support,
//!    alpha-blended with the feathered mask.
//! 2. Face restoration: original pixels are pasted back over the
//!    face-exclusion region with a Gaussian ramp across its boundary.
//!    Pixels deeper than the feather width come back unchanged.
//! 3. Histogram matching of the garment region in YCbCr. The tone curve is
//!    learned on the untouched region, where the generated image should
//!    equal the photo, and applied to the blended garment.
//!
//! Every pass is deterministic; identical inputs give identical bytes.

use crate::{
    config::TryOnConfig,
    error::{Result, TryOnError},
    mask::{BinaryMask, MaskSet, SoftMask},
};
use image::{imageops::FilterType, Rgb, RgbImage};
use tracing::{debug, instrument};

/// Over-relaxation factor for the Poisson solver
const SOR_OMEGA: f32 = 1.9;

/// Largest per-pixel update that still counts as converged
const POISSON_TOLERANCE: f32 = 0.01;

/// Share of the histogram strength applied to the chroma channels
const CHROMA_SHARE: f32 = 0.5;

/// Compositing engine parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositeSettings {
    pub feather_radius: u32,
    pub poisson_iterations: u32,
    pub histogram_strength: f32,
    pub output_size: u32,
}

impl Default for CompositeSettings {
    fn default() -> Self {
        Self::from(&TryOnConfig::default())
    }
}

impl From<&TryOnConfig> for CompositeSettings {
    fn from(config: &TryOnConfig) -> Self {
        Self {
            feather_radius: config.feather_radius,
            poisson_iterations: config.poisson_iterations,
            histogram_strength: config.histogram_strength,
            output_size: config.output_size,
        }
    }
}

/// Final-stage image compositor
#[derive(Debug, Clone, Default)]
pub struct Compositor {
    settings: CompositeSettings,
}

impl Compositor {
    #[must_use]
    pub fn new(settings: CompositeSettings) -> Self {
        Self { settings }
    }

    #[must_use]
    pub fn settings(&self) -> &CompositeSettings {
        &self.settings
    }

    /// Blend `generated` into `original` under `masks`, at working resolution
    #[instrument(skip_all, fields(width = original.width(), height = original.height()))]
    pub fn compose(
        &self,
        original: &RgbImage,
        generated: &RgbImage,
        masks: &MaskSet,
    ) -> Result<RgbImage> {
        if original.dimensions() != generated.dimensions()
            || original.dimensions() != masks.soft.dimensions()
        {
            return Err(TryOnError::internal(format!(
                "compositing buffers disagree: original {:?}, generated {:?}, mask {:?}",
                original.dimensions(),
                generated.dimensions(),
                masks.soft.dimensions()
            )));
        }

        let cloned = poisson_clone(
            original,
            generated,
            &masks.support,
            self.settings.poisson_iterations,
        );
        let blended = alpha_blend(original, &cloned, &masks.soft);
        let restored = restore_face(
            original,
            &blended,
            &masks.face_exclusion,
            self.settings.feather_radius,
        );
        let untouched = untouched_region(masks);
        Ok(match_histogram(
            &restored,
            generated,
            original,
            &untouched,
            &masks.soft,
            self.settings.histogram_strength,
        ))
    }

    /// Resize to the configured output resolution when it differs
    #[must_use]
    pub fn finalize(&self, image: RgbImage) -> RgbImage {
        let size = self.settings.output_size;
        if image.dimensions() == (size, size) {
            return image;
        }
        debug!(from = ?image.dimensions(), to = size, "resizing composite");
        image::imageops::resize(&image, size, size, FilterType::Lanczos3)
    }
}

/// Gradient-domain clone of `source` into `target` over `domain`
///
/// Solves the discrete Poisson equation with the target as Dirichlet
/// boundary by successive over-relaxation in raster order. Pixels outside
/// the domain are returned unchanged.
#[must_use]
pub fn poisson_clone(
    target: &RgbImage,
    source: &RgbImage,
    domain: &BinaryMask,
    iterations: u32,
) -> RgbImage {
    let (w, h) = target.dimensions();
    let (wu, hu) = (w as usize, h as usize);
    let inside = domain.bits();
    let cells: Vec<usize> = (0..wu * hu).filter(|i| inside[*i]).collect();
    let mut out = target.clone();
    if cells.is_empty() {
        return out;
    }

    let neighbours = |i: usize| {
        let (x, y) = (i % wu, i / wu);
        let mut n = [None; 4];
        if x > 0 {
            n[0] = Some(i - 1);
        }
        if x + 1 < wu {
            n[1] = Some(i + 1);
        }
        if y > 0 {
            n[2] = Some(i - wu);
        }
        if y + 1 < hu {
            n[3] = Some(i + wu);
        }
        n
    };

    let tgt = target.as_raw();
    let src = source.as_raw();
    for c in 0..3 {
        let t = |i: usize| f32::from(tgt[i * 3 + c]);
        let s = |i: usize| f32::from(src[i * 3 + c]);

        // Seed with the source shifted by its mean mismatch on the boundary
        let (mut offset, mut count) = (0.0f32, 0.0f32);
        for &i in &cells {
            for q in neighbours(i).into_iter().flatten() {
                if !inside[q] {
                    offset += t(q) - s(q);
                    count += 1.0;
                }
            }
        }
        let offset = if count > 0.0 { offset / count } else { 0.0 };

        let mut f: Vec<f32> = (0..wu * hu).map(t).collect();
        for &i in &cells {
            f[i] = s(i) + offset;
        }

        for _ in 0..iterations {
            let mut max_delta = 0.0f32;
            for &i in &cells {
                let (mut sum, mut n) = (0.0f32, 0.0f32);
                for q in neighbours(i).into_iter().flatten() {
                    sum += f[q] + (s(i) - s(q));
                    n += 1.0;
                }
                if n == 0.0 {
                    continue;
                }
                let updated = (1.0 - SOR_OMEGA) * f[i] + SOR_OMEGA * sum / n;
                max_delta = max_delta.max((updated - f[i]).abs());
                f[i] = updated;
            }
            if max_delta < POISSON_TOLERANCE {
                break;
            }
        }

        let raw: &mut [u8] = &mut out;
        for &i in &cells {
            raw[i * 3 + c] = f[i].round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// `base * (1 - m) + top * m`, exact `base` wherever `m` is zero
fn alpha_blend(base: &RgbImage, top: &RgbImage, mask: &SoftMask) -> RgbImage {
    let mut out = base.clone();
    let weights = mask.values();
    for (i, (px, top_px)) in out.pixels_mut().zip(top.pixels()).enumerate() {
        let m = weights[i];
        if m <= 0.0 {
            continue;
        }
        for c in 0..3 {
            let v = f32::from(px[c]) * (1.0 - m) + f32::from(top_px[c]) * m;
            px[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Paste weight for the original face at signed distance `s` from the exclusion edge
///
/// One at or beyond `feather` inside the region, a Gaussian falloff across
/// the boundary, zero from `feather` outside. The ramp peaks at depth
/// `feather` so every pixel deeper than that is the exact original; with
/// `sigma = feather / 1.5` the weight at the edge itself is `e^-1.125`.
#[must_use]
pub fn face_alpha(s: f32, feather: f32) -> f32 {
    if feather <= 0.0 {
        return if s > 0.0 { 1.0 } else { 0.0 };
    }
    if s >= feather {
        1.0
    } else if s <= -feather {
        0.0
    } else {
        let sigma = feather / 1.5;
        let d = feather - s;
        (-(d * d) / (2.0 * sigma * sigma)).exp()
    }
}

/// Put original face pixels back over `blended` with a feathered edge
#[must_use]
pub fn restore_face(
    original: &RgbImage,
    blended: &RgbImage,
    face_exclusion: &BinaryMask,
    feather_radius: u32,
) -> RgbImage {
    if face_exclusion.is_empty() {
        return blended.clone();
    }
    let feather = feather_radius as f32;
    let distance = face_exclusion.signed_distance();
    let mut out = blended.clone();
    for (i, (px, orig)) in out.pixels_mut().zip(original.pixels()).enumerate() {
        let alpha = face_alpha(distance[i], feather);
        if alpha >= 1.0 {
            *px = *orig;
        } else if alpha > 0.0 {
            for c in 0..3 {
                let v = f32::from(orig[c]) * alpha + f32::from(px[c]) * (1.0 - alpha);
                px[c] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

fn rgb_to_ycbcr(px: Rgb<u8>) -> [f32; 3] {
    let [r, g, b] = px.0.map(f32::from);
    [
        0.299 * r + 0.587 * g + 0.114 * b,
        128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b,
        128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b,
    ]
}

fn ycbcr_to_rgb([y, cb, cr]: [f32; 3]) -> Rgb<u8> {
    let r = y + 1.402 * (cr - 128.0);
    let g = y - 0.344_136 * (cb - 128.0) - 0.714_136 * (cr - 128.0);
    let b = y + 1.772 * (cb - 128.0);
    Rgb([r, g, b].map(|v| v.round().clamp(0.0, 255.0) as u8))
}

fn quantize(v: f32) -> usize {
    v.round().clamp(0.0, 255.0) as usize
}

/// Pixels neither repainted nor protected: outside the inpaint region and the face
#[must_use]
pub fn untouched_region(masks: &MaskSet) -> BinaryMask {
    let (w, h) = masks.inpaint.dimensions();
    BinaryMask::from_fn(w, h, |x, y| {
        !masks.inpaint.get(x, y) && !masks.face_exclusion.get(x, y)
    })
}

/// Per-bin offsets moving the `source` distribution onto `reference`
///
/// CDF matching on the bins `source` occupies; empty bins take offsets
/// interpolated from their occupied neighbours, so identical
/// distributions give all-zero offsets.
fn tone_offsets(source: &[u32; 256], reference: &[u32; 256]) -> [f32; 256] {
    let cdf = |hist: &[u32; 256]| {
        let total: u64 = hist.iter().map(|v| u64::from(*v)).sum();
        let mut acc = 0u64;
        let mut out = [0f64; 256];
        for (i, v) in hist.iter().enumerate() {
            acc += u64::from(*v);
            out[i] = if total == 0 { 0.0 } else { acc as f64 / total as f64 };
        }
        out
    };
    let (src, reference_cdf) = (cdf(source), cdf(reference));

    let mut known: Vec<(usize, f32)> = Vec::new();
    let mut j = 0usize;
    for (i, value) in src.iter().enumerate() {
        if source[i] == 0 {
            continue;
        }
        while j < 255 && reference_cdf[j] < *value - 1e-9 {
            j += 1;
        }
        known.push((i, j as f32 - i as f32));
    }

    let mut offsets = [0f32; 256];
    let (Some(first), Some(last)) = (known.first().copied(), known.last().copied()) else {
        return offsets;
    };
    for (i, offset) in offsets.iter_mut().enumerate() {
        *offset = if i <= first.0 {
            first.1
        } else if i >= last.0 {
            last.1
        } else {
            let k = known.partition_point(|(bin, _)| *bin < i);
            let (lo, hi) = (known[k - 1], known[k]);
            let t = (i - lo.0) as f32 / (hi.0 - lo.0) as f32;
            lo.1 + (hi.1 - lo.1) * t
        };
    }
    offsets
}

/// Bring the blended garment onto the tonal scale of its surroundings
///
/// The diffusion output carries its own color distribution. Comparing
/// `generated` with `original` over `untouched` (where both should agree)
/// gives a per-channel YCbCr tone curve; it is applied where `mask` is
/// non-zero, weighted by the mask and `strength`, luminance in full and
/// chroma at a reduced share. A garment whose new color the surroundings
/// do not explain keeps it.
#[must_use]
pub fn match_histogram(
    image: &RgbImage,
    generated: &RgbImage,
    original: &RgbImage,
    untouched: &BinaryMask,
    mask: &SoftMask,
    strength: f32,
) -> RgbImage {
    if strength <= 0.0 || untouched.is_empty() {
        return image.clone();
    }
    let mut source_hist = [[0u32; 256]; 3];
    let mut reference_hist = [[0u32; 256]; 3];
    let pixels = generated.pixels().zip(original.pixels());
    for ((g, o), keep) in pixels.zip(untouched.bits()) {
        if !*keep {
            continue;
        }
        let (a, b) = (rgb_to_ycbcr(*g), rgb_to_ycbcr(*o));
        for c in 0..3 {
            source_hist[c][quantize(a[c])] += 1;
            reference_hist[c][quantize(b[c])] += 1;
        }
    }
    let offsets: Vec<[f32; 256]> = (0..3)
        .map(|c| tone_offsets(&source_hist[c], &reference_hist[c]))
        .collect();

    let strength = strength.min(1.0);
    let shares = [strength, strength * CHROMA_SHARE, strength * CHROMA_SHARE];
    let mut out = image.clone();
    let weights = mask.values();
    for (i, px) in out.pixels_mut().enumerate() {
        let m = weights[i];
        if m <= 0.0 {
            continue;
        }
        let mut ycc = rgb_to_ycbcr(*px);
        for c in 0..3 {
            ycc[c] += offsets[c][quantize(ycc[c])] * m * shares[c];
        }
        *px = ycbcr_to_rgb(ycc);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        geometry::BoundingBox,
        mask::MaskEngine,
        types::{atr, FaceRegion, GarmentCategory, SegmentationMap},
    };

    fn scene() -> (RgbImage, RgbImage, MaskSet) {
        let original = RgbImage::from_fn(64, 64, |x, y| {
            Rgb([(x * 3) as u8, (y * 3) as u8, 120])
        });
        let generated = RgbImage::from_fn(64, 64, |x, y| {
            if (20..44).contains(&x) && (4..20).contains(&y) {
                Rgb([0, 255, 0])
            } else {
                Rgb([180, 40, (x + y) as u8])
            }
        });
        let raster = SegmentationMap::from_fn(64, 64, |x, y| {
            if (8..56).contains(&x) && (16..60).contains(&y) {
                atr::UPPER_CLOTHES
            } else {
                atr::BACKGROUND
            }
        });
        let face = FaceRegion::detected(BoundingBox::new(22, 4, 20, 14), vec![]).with_padding(4);
        let masks = MaskEngine::default()
            .build(&raster, Some(&face), GarmentCategory::Upper, 64, 64)
            .unwrap();
        (original, generated, masks)
    }

    #[test]
    fn test_face_alpha_profile() {
        assert_eq!(face_alpha(10.0, 6.0), 1.0);
        assert_eq!(face_alpha(6.0, 6.0), 1.0);
        assert_eq!(face_alpha(-6.0, 6.0), 0.0);
        let mid = face_alpha(0.0, 6.0);
        assert!((mid - (-1.125f32).exp()).abs() < 1e-6);
        assert!(face_alpha(3.0, 6.0) > mid);
    }

    #[test]
    fn test_poisson_keeps_outside_pixels() {
        let target = RgbImage::from_pixel(16, 16, Rgb([100, 100, 100]));
        let source = RgbImage::from_pixel(16, 16, Rgb([10, 200, 30]));
        let domain = BinaryMask::from_fn(16, 16, |x, y| (4..12).contains(&x) && (4..12).contains(&y));
        let out = poisson_clone(&target, &source, &domain, 200);
        assert_eq!(out.get_pixel(0, 0), target.get_pixel(0, 0));
        // A flat source has no gradients, so the clone takes the boundary color
        let center = out.get_pixel(8, 8);
        for c in 0..3 {
            assert!((i32::from(center[c]) - 100).abs() <= 1, "{center:?}");
        }
    }

    #[test]
    fn test_poisson_preserves_source_gradients() {
        let target = RgbImage::from_pixel(24, 24, Rgb([50, 50, 50]));
        let source = RgbImage::from_fn(24, 24, |x, y| {
            let spot = (10..14).contains(&x) && (10..14).contains(&y);
            Rgb([if spot { 150 } else { 0 }, 0, 0])
        });
        let domain = BinaryMask::from_fn(24, 24, |x, y| (6..18).contains(&x) && (6..18).contains(&y));
        let out = poisson_clone(&target, &source, &domain, 2000);
        let center = i32::from(out.get_pixel(12, 12)[0]);
        let edge = i32::from(out.get_pixel(7, 12)[0]);
        assert!(center > edge + 100, "center {center}, edge {edge}");
    }

    #[test]
    fn test_compose_restores_face_exactly() {
        let (original, generated, masks) = scene();
        let compositor = Compositor::default();
        let out = compositor.compose(&original, &generated, &masks).unwrap();
        let core = masks.face_exclusion.erode(compositor.settings().feather_radius);
        assert!(!core.is_empty());
        for y in 0..64 {
            for x in 0..64 {
                if core.get(x, y) {
                    assert_eq!(out.get_pixel(x, y), original.get_pixel(x, y));
                }
            }
        }
    }

    #[test]
    fn test_compose_leaves_untouched_region_alone() {
        let (original, generated, masks) = scene();
        let out = Compositor::default().compose(&original, &generated, &masks).unwrap();
        assert_eq!(out.get_pixel(2, 62), original.get_pixel(2, 62));
        assert_ne!(out.get_pixel(32, 40), original.get_pixel(32, 40));
    }

    #[test]
    fn test_compose_is_deterministic() {
        let (original, generated, masks) = scene();
        let compositor = Compositor::default();
        let a = compositor.compose(&original, &generated, &masks).unwrap();
        let b = compositor.compose(&original, &generated, &masks).unwrap();
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn test_compose_rejects_mismatched_buffers() {
        let (original, _, masks) = scene();
        let small = RgbImage::new(32, 32);
        let err = Compositor::default().compose(&original, &small, &masks).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }

    /// Red shirt on a grey backdrop, no face
    fn shirt_scene(garment: Rgb<u8>, lift: u8) -> (RgbImage, RgbImage, MaskSet) {
        let in_shirt = |x: u32, y: u32| (16..48).contains(&x) && (20..56).contains(&y);
        let backdrop = |x: u32, y: u32| Rgb([90 + (x % 7) as u8 * 8, 100 + (y % 5) as u8 * 10, 110]);
        let original = RgbImage::from_fn(64, 64, |x, y| {
            if in_shirt(x, y) {
                Rgb([200, 20, 20])
            } else {
                backdrop(x, y)
            }
        });
        let generated = RgbImage::from_fn(64, 64, |x, y| {
            let px = if in_shirt(x, y) { garment } else { backdrop(x, y) };
            Rgb(px.0.map(|v| v.saturating_add(lift)))
        });
        let raster = SegmentationMap::from_fn(64, 64, |x, y| {
            if in_shirt(x, y) {
                atr::UPPER_CLOTHES
            } else {
                atr::BACKGROUND
            }
        });
        let masks = MaskEngine::default()
            .build(&raster, None, GarmentCategory::Upper, 64, 64)
            .unwrap();
        (original, generated, masks)
    }

    #[test]
    fn test_tone_offsets_are_zero_for_equal_histograms() {
        let mut hist = [0u32; 256];
        hist[40] = 10;
        hist[90] = 5;
        hist[200] = 1;
        assert!(tone_offsets(&hist, &hist).iter().all(|o| *o == 0.0));
    }

    #[test]
    fn test_tone_offsets_follow_a_shift() {
        let (mut source, mut reference) = ([0u32; 256], [0u32; 256]);
        for v in 50..100 {
            source[v + 20] = 3;
            reference[v] = 3;
        }
        let offsets = tone_offsets(&source, &reference);
        assert_eq!(offsets[70], -20.0);
        assert_eq!(offsets[119], -20.0);
        // Bins outside the sampled range extend the nearest offset
        assert_eq!(offsets[10], -20.0);
        assert_eq!(offsets[240], -20.0);
    }

    #[test]
    fn test_new_garment_color_survives_compositing() {
        let (original, generated, masks) = shirt_scene(Rgb([20, 20, 200]), 0);
        let out = Compositor::default().compose(&original, &generated, &masks).unwrap();
        let px = out.get_pixel(32, 38);
        assert!(px[2] > 150 && px[0] < 70, "garment lost its color: {px:?}");
    }

    #[test]
    fn test_histogram_match_removes_generator_tone_drift() {
        let (original, generated, masks) = shirt_scene(Rgb([20, 20, 200]), 24);
        let untouched = untouched_region(&masks);
        assert!(!untouched.is_empty());
        let out = match_histogram(&generated, &generated, &original, &untouched, &masks.soft, 1.0);

        let before = rgb_to_ycbcr(*generated.get_pixel(32, 38))[0];
        let after = rgb_to_ycbcr(*out.get_pixel(32, 38))[0];
        assert!((before - after - 24.0).abs() <= 3.0, "luma {before} -> {after}");
        assert!(out.get_pixel(32, 38)[2] > 150);
        // Outside the blend mask nothing moves
        assert_eq!(out.get_pixel(2, 2), generated.get_pixel(2, 2));
    }

    #[test]
    fn test_histogram_match_strength_zero_is_identity() {
        let (original, generated, masks) = shirt_scene(Rgb([20, 20, 200]), 24);
        let untouched = untouched_region(&masks);
        let out = match_histogram(&generated, &generated, &original, &untouched, &masks.soft, 0.0);
        assert_eq!(out, generated);
    }

    #[test]
    fn test_finalize_resizes_to_output() {
        let compositor = Compositor::new(CompositeSettings {
            output_size: 32,
            ..CompositeSettings::default()
        });
        let out = compositor.finalize(RgbImage::new(64, 64));
        assert_eq!(out.dimensions(), (32, 32));
    }
}
