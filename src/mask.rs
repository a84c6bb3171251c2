//! Geometry & mask engine
//!
//! Builds the garment, face-exclusion and blend masks for one job from the
//! segmentation raster and the face box. Every mask produced here has the
//! dimensions of the person canvas; segmentation rasters at model resolution
//! are resampled first.
//!
//! Construction order guarantees the set invariants:
//!
//! ```text
//! garment  = close(union of category classes)
//! support  = garment AND NOT face_exclusion
//! soft     = blur(support) * support          (zero outside support)
//! inpaint  = dilate(support) AND NOT face_exclusion
//! ```

use crate::{
    config::TryOnConfig,
    error::{Result, TryOnError},
    geometry::BoundingBox,
    types::{atr, FaceRegion, GarmentCategory, SegmentationMap},
};
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::{
    distance_transform::{euclidean_squared_distance_transform, Norm},
    filter::gaussian_blur_f32,
    morphology,
};
use tracing::debug;

/// Binary region on a fixed-size canvas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl BinaryMask {
    #[must_use]
    pub fn empty(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bits: vec![false; width as usize * height as usize],
        }
    }

    #[must_use]
    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> bool) -> Self {
        let mut bits = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                bits.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            bits,
        }
    }

    /// Rasterize a rectangle, clipped to the canvas
    #[must_use]
    pub fn from_box(width: u32, height: u32, bbox: BoundingBox) -> Self {
        Self::from_fn(width, height, |x, y| bbox.contains(x, y))
    }

    /// Pixels whose label is one of `classes`
    #[must_use]
    pub fn from_classes(map: &SegmentationMap, classes: &[u8]) -> Self {
        let (width, height) = map.dimensions();
        Self {
            width,
            height,
            bits: map.labels().iter().map(|l| classes.contains(l)).collect(),
        }
    }

    /// Threshold a grayscale image, `> threshold` is inside
    #[must_use]
    pub fn from_gray(image: &GrayImage, threshold: u8) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            bits: image.as_raw().iter().map(|v| *v > threshold).collect(),
        }
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> bool {
        self.bits[(y * self.width + x) as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: bool) {
        self.bits[(y * self.width + x) as usize] = value;
    }

    #[must_use]
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.bits.iter().any(|b| *b)
    }

    /// Tight bounding box of the set pixels
    #[must_use]
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) {
                    bounds = Some(match bounds {
                        None => (x, y, x, y),
                        Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
                    });
                }
            }
        }
        bounds.map(|(x1, y1, x2, y2)| BoundingBox::from_corners(x1, y1, x2, y2))
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        self.zip(other, |a, b| a || b)
    }

    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        self.zip(other, |a, b| a && b)
    }

    /// Pixels in `self` that are not in `other`
    #[must_use]
    pub fn and_not(&self, other: &Self) -> Self {
        self.zip(other, |a, b| a && !b)
    }

    /// Every set pixel of `self` is also set in `other`
    #[must_use]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.dimensions() == other.dimensions()
            && self.bits.iter().zip(&other.bits).all(|(a, b)| !*a || *b)
    }

    #[must_use]
    pub fn is_disjoint_from(&self, other: &Self) -> bool {
        self.dimensions() == other.dimensions()
            && self.bits.iter().zip(&other.bits).all(|(a, b)| !(*a && *b))
    }

    fn zip(&self, other: &Self, op: impl Fn(bool, bool) -> bool) -> Self {
        debug_assert_eq!(self.dimensions(), other.dimensions());
        Self {
            width: self.width,
            height: self.height,
            bits: self
                .bits
                .iter()
                .zip(&other.bits)
                .map(|(a, b)| op(*a, *b))
                .collect(),
        }
    }

    /// Dilation with a `(2r+1)` square structuring element
    #[must_use]
    pub fn dilate(&self, radius: u32) -> Self {
        if radius == 0 {
            return self.clone();
        }
        self.morph(|image, k| morphology::dilate(image, Norm::LInf, k), radius)
    }

    /// Erosion with a `(2r+1)` square structuring element; the canvas edge does not erode
    #[must_use]
    pub fn erode(&self, radius: u32) -> Self {
        if radius == 0 {
            return self.clone();
        }
        self.morph(|image, k| morphology::erode(image, Norm::LInf, k), radius)
    }

    /// Morphological closing: dilate then erode
    #[must_use]
    pub fn close(&self, radius: u32) -> Self {
        if radius == 0 {
            return self.clone();
        }
        self.morph(|image, k| morphology::close(image, Norm::LInf, k), radius)
    }

    /// Run a `GrayImage` morphology pass; radii past 255 saturate
    fn morph(&self, op: impl Fn(&GrayImage, u8) -> GrayImage, radius: u32) -> Self {
        let k = u8::try_from(radius).unwrap_or(u8::MAX);
        Self::from_gray(&op(&self.to_gray_image(), k), 0)
    }

    /// Signed Euclidean distance to the region boundary
    ///
    /// Positive inside (distance to the nearest outside pixel), negative
    /// outside. Pixels beyond the canvas edge count as neither.
    #[must_use]
    pub fn signed_distance(&self) -> Vec<f32> {
        let far = (self.width + self.height) as f32;
        let outside = GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([if self.get(x, y) { 0 } else { 255 }])
        });
        let to_outside = euclidean_squared_distance_transform(&outside);
        let to_inside = euclidean_squared_distance_transform(&self.to_gray_image());
        to_outside
            .as_raw()
            .iter()
            .zip(to_inside.as_raw())
            .map(|(din, dout)| (din.sqrt() as f32).min(far) - (dout.sqrt() as f32).min(far))
            .collect()
    }

    /// 255 inside, 0 outside
    #[must_use]
    pub fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([if self.get(x, y) { 255 } else { 0 }])
        })
    }
}

/// Region with per-pixel weights in `[0, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct SoftMask {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl SoftMask {
    /// Wrap raw weights, clamping them into `[0, 1]`
    #[must_use]
    pub fn new(width: u32, height: u32, values: Vec<f32>) -> Self {
        debug_assert_eq!(values.len(), width as usize * height as usize);
        Self {
            width,
            height,
            values: values
                .into_iter()
                .map(|v| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 })
                .collect(),
        }
    }

    #[must_use]
    pub fn from_binary(mask: &BinaryMask) -> Self {
        let (width, height) = mask.dimensions();
        Self {
            width,
            height,
            values: mask.bits().iter().map(|b| if *b { 1.0 } else { 0.0 }).collect(),
        }
    }

    /// Inward Gaussian feather; weights stay zero outside `mask`
    #[must_use]
    pub fn feathered(mask: &BinaryMask, radius: u32) -> Self {
        let hard = Self::from_binary(mask);
        if radius == 0 {
            return hard;
        }
        let sigma = (radius as f32 / 2.0).max(0.5);
        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(hard.width, hard.height, hard.values)
                .unwrap_or_else(|| ImageBuffer::new(mask.width, mask.height));
        let blurred = gaussian_blur_f32(&buffer, sigma);
        let values = blurred
            .as_raw()
            .iter()
            .zip(mask.bits())
            .map(|(v, inside)| if *inside { *v } else { 0.0 })
            .collect();
        Self::new(hard.width, hard.height, values)
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.values[(y * self.width + x) as usize]
    }

    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Pixels with non-zero weight
    #[must_use]
    pub fn support(&self) -> BinaryMask {
        BinaryMask {
            width: self.width,
            height: self.height,
            bits: self.values.iter().map(|v| *v > 0.0).collect(),
        }
    }

    #[must_use]
    pub fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([(self.get(x, y) * 255.0).round() as u8])
        })
    }
}

/// Mask engine parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskSettings {
    pub face_mask_padding: u32,
    pub closing_radius: u32,
    pub feather_radius: u32,
    pub inpaint_dilation: u32,
}

impl Default for MaskSettings {
    fn default() -> Self {
        Self::from(&TryOnConfig::default())
    }
}

impl From<&TryOnConfig> for MaskSettings {
    fn from(config: &TryOnConfig) -> Self {
        Self {
            face_mask_padding: config.face_mask_padding,
            closing_radius: config.closing_radius,
            feather_radius: config.feather_radius,
            inpaint_dilation: config.inpaint_dilation,
        }
    }
}

/// All masks of one job, immutable once built
#[derive(Debug, Clone)]
pub struct MaskSet {
    /// Closed union of the category's classes
    pub garment: BinaryMask,
    /// Padded face box; empty when face exclusion is off or no face was found
    pub face_exclusion: BinaryMask,
    /// Garment minus face exclusion, the Poisson cloning domain
    pub support: BinaryMask,
    /// Feathered support used for blending
    pub soft: SoftMask,
    /// Region handed to the inpainter
    pub inpaint: BinaryMask,
}

impl MaskSet {
    /// Re-check the subset and disjointness guarantees
    pub fn verify(&self) -> Result<()> {
        let soft_support = self.soft.support();
        if !soft_support.is_subset_of(&self.garment) || !self.support.is_subset_of(&self.garment) {
            return Err(TryOnError::internal("blend mask escapes the garment mask"));
        }
        if !soft_support.is_disjoint_from(&self.face_exclusion)
            || !self.inpaint.is_disjoint_from(&self.face_exclusion)
        {
            return Err(TryOnError::internal("blend mask overlaps the face exclusion"));
        }
        Ok(())
    }
}

/// Builds per-job masks from segmentation output
#[derive(Debug, Clone, Default)]
pub struct MaskEngine {
    settings: MaskSettings,
}

impl MaskEngine {
    #[must_use]
    pub fn new(settings: MaskSettings) -> Self {
        Self { settings }
    }

    #[must_use]
    pub fn settings(&self) -> &MaskSettings {
        &self.settings
    }

    /// Build garment, exclusion and blend masks on a `width` x `height` canvas
    ///
    /// `face` is `None` when face exclusion is disabled or no face was found.
    pub fn build(
        &self,
        segmentation: &SegmentationMap,
        face: Option<&FaceRegion>,
        category: GarmentCategory,
        width: u32,
        height: u32,
    ) -> Result<MaskSet> {
        let raster = segmentation.resized(width, height);
        let raw = BinaryMask::from_classes(&raster, category.class_ids());
        if raw.is_empty() {
            return Err(TryOnError::segmentation_empty(category));
        }

        let garment = raw.close(self.settings.closing_radius);
        let face_exclusion = face.map_or_else(
            || BinaryMask::empty(width, height),
            |face| BinaryMask::from_box(width, height, face.exclusion_box(width, height)),
        );

        let support = garment.and_not(&face_exclusion);
        if support.is_empty() {
            return Err(TryOnError::segmentation_empty(category));
        }
        let soft = SoftMask::feathered(&support, self.settings.feather_radius);
        let inpaint = support
            .dilate(self.settings.inpaint_dilation)
            .and_not(&face_exclusion);

        debug!(
            category = %category,
            garment_px = garment.count(),
            excluded_px = face_exclusion.count(),
            support_px = support.count(),
            "built masks"
        );

        Ok(MaskSet {
            garment,
            face_exclusion,
            support,
            soft,
            inpaint,
        })
    }
}

/// Face box recovered from the segmentation face class, in canvas coordinates
#[must_use]
pub fn face_box_from_segmentation(
    segmentation: &SegmentationMap,
    width: u32,
    height: u32,
) -> Option<BoundingBox> {
    let (map_w, map_h) = segmentation.dimensions();
    if map_w == 0 || map_h == 0 {
        return None;
    }
    segmentation.bounding_box_of(atr::FACE).map(|bbox| {
        bbox.scaled(
            f64::from(width) / f64::from(map_w),
            f64::from(height) / f64::from(map_h),
        )
        .expand_clipped(0, width, height)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person_raster(size: u32) -> SegmentationMap {
        SegmentationMap::from_fn(size, size, |x, y| {
            if (20..44).contains(&x) && (4..20).contains(&y) {
                atr::FACE
            } else if (10..54).contains(&x) && (18..40).contains(&y) {
                atr::UPPER_CLOTHES
            } else if (14..50).contains(&x) && (40..62).contains(&y) {
                atr::PANTS
            } else {
                atr::BACKGROUND
            }
        })
    }

    fn face(padding: u32) -> FaceRegion {
        FaceRegion::detected(BoundingBox::new(20, 4, 24, 16), vec![0.1; 8]).with_padding(padding)
    }

    #[test]
    fn test_dilate_and_erode_square() {
        let mut mask = BinaryMask::empty(9, 9);
        mask.set(4, 4, true);
        let grown = mask.dilate(1);
        assert_eq!(grown.count(), 9);
        assert_eq!(grown.erode(1).count(), 1);
    }

    #[test]
    fn test_closing_fills_speckle_holes() {
        let mut mask = BinaryMask::from_fn(20, 20, |x, y| (5..15).contains(&x) && (5..15).contains(&y));
        mask.set(10, 10, false);
        let closed = mask.close(1);
        assert!(closed.get(10, 10));
        assert!(!closed.get(2, 2));
    }

    #[test]
    fn test_signed_distance_sign() {
        let mask = BinaryMask::from_fn(20, 20, |x, y| (5..15).contains(&x) && (5..15).contains(&y));
        let sd = mask.signed_distance();
        assert!(sd[10 * 20 + 10] >= 5.0);
        assert!(sd[5 * 20 + 5] > 0.0);
        assert!(sd[0] < 0.0);
    }

    #[test]
    fn test_feather_stays_inside_support() {
        let mask = BinaryMask::from_fn(40, 40, |x, y| (10..30).contains(&x) && (10..30).contains(&y));
        let soft = SoftMask::feathered(&mask, 4);
        assert!(soft.support().is_subset_of(&mask));
        assert!(soft.get(20, 20) > 0.99);
        assert!(soft.get(10, 20) < 0.8);
        assert!(soft.values().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_soft_mask_clamps_values() {
        let soft = SoftMask::new(2, 1, vec![-0.5, 3.0]);
        assert_eq!(soft.values(), &[0.0, 1.0]);
    }

    #[test]
    fn test_masks_respect_face_exclusion() {
        let engine = MaskEngine::default();
        let face = face(6);
        let masks = engine
            .build(&person_raster(64), Some(&face), GarmentCategory::Upper, 64, 64)
            .unwrap();

        masks.verify().unwrap();
        assert!(masks.support.is_subset_of(&masks.garment));
        assert!(masks.soft.support().is_disjoint_from(&masks.face_exclusion));
        assert!(masks.inpaint.is_disjoint_from(&masks.face_exclusion));
        assert!(masks.face_exclusion.get(20, 24));
        assert!(!masks.support.get(30, 22));
    }

    #[test]
    fn test_masks_match_person_dimensions_when_raster_is_smaller() {
        let engine = MaskEngine::default();
        let masks = engine
            .build(&person_raster(64), None, GarmentCategory::Lower, 128, 128)
            .unwrap();
        assert_eq!(masks.soft.dimensions(), (128, 128));
        assert_eq!(masks.garment.dimensions(), (128, 128));
        assert!(masks.face_exclusion.is_empty());
    }

    #[test]
    fn test_missing_category_is_segmentation_empty() {
        let raster = SegmentationMap::from_fn(32, 32, |_, y| {
            if y < 16 { atr::UPPER_CLOTHES } else { atr::BACKGROUND }
        });
        let err = MaskEngine::default()
            .build(&raster, None, GarmentCategory::Lower, 32, 32)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SegmentationEmpty);
    }

    #[test]
    fn test_garment_entirely_under_face_is_empty() {
        let raster = SegmentationMap::from_fn(32, 32, |x, y| {
            if (10..14).contains(&x) && (10..14).contains(&y) {
                atr::UPPER_CLOTHES
            } else {
                atr::BACKGROUND
            }
        });
        let face = FaceRegion::detected(BoundingBox::new(8, 8, 8, 8), vec![]).with_padding(4);
        let err = MaskEngine::default()
            .build(&raster, Some(&face), GarmentCategory::Upper, 32, 32)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SegmentationEmpty);
    }

    #[test]
    fn test_face_box_from_segmentation_is_rescaled() {
        let bbox = face_box_from_segmentation(&person_raster(64), 128, 128).unwrap();
        assert_eq!(bbox, BoundingBox::new(40, 8, 48, 32));
    }
}
