//! Core types for try-on jobs

use crate::{
    error::{Result, TryOnError},
    geometry::BoundingBox,
    storage::StoredResult,
};
use base64::Engine as _;
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr};
use uuid::Uuid;

/// ATR human-parsing class ids produced by the segmentation collaborator
pub mod atr {
    pub const BACKGROUND: u8 = 0;
    pub const HAT: u8 = 1;
    pub const HAIR: u8 = 2;
    pub const SUNGLASSES: u8 = 3;
    pub const UPPER_CLOTHES: u8 = 4;
    pub const SKIRT: u8 = 5;
    pub const PANTS: u8 = 6;
    pub const DRESS: u8 = 7;
    pub const BELT: u8 = 8;
    pub const LEFT_SHOE: u8 = 9;
    pub const RIGHT_SHOE: u8 = 10;
    pub const FACE: u8 = 11;
    pub const LEFT_LEG: u8 = 12;
    pub const RIGHT_LEG: u8 = 13;
    pub const LEFT_ARM: u8 = 14;
    pub const RIGHT_ARM: u8 = 15;
    pub const BAG: u8 = 16;
    pub const SCARF: u8 = 17;

    /// Number of classes in the label set
    pub const NUM_CLASSES: usize = 18;
}

/// Which garment region of the person is replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GarmentCategory {
    /// Shirts, jackets, tops
    Upper,
    /// Pants and skirts
    Lower,
    /// Dresses and full outfits
    Full,
}

impl GarmentCategory {
    /// Segmentation classes that make up this garment region
    #[must_use]
    pub fn class_ids(self) -> &'static [u8] {
        match self {
            Self::Upper => &[atr::UPPER_CLOTHES, atr::SCARF],
            Self::Lower => &[atr::SKIRT, atr::PANTS],
            Self::Full => &[atr::UPPER_CLOTHES, atr::SKIRT, atr::PANTS, atr::DRESS],
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upper => "upper",
            Self::Lower => "lower",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for GarmentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GarmentCategory {
    type Err = TryOnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upper" => Ok(Self::Upper),
            "lower" => Ok(Self::Lower),
            "full" | "overall" => Ok(Self::Full),
            other => Err(TryOnError::invalid_input(format!(
                "garment_category must be one of upper, lower, full (got '{other}')"
            ))),
        }
    }
}

/// Class-indexed raster from the segmentation collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentationMap {
    width: u32,
    height: u32,
    labels: Vec<u8>,
}

impl SegmentationMap {
    /// Wrap a row-major label buffer
    pub fn new(width: u32, height: u32, labels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if labels.len() != expected {
            return Err(TryOnError::internal(format!(
                "segmentation raster has {} labels, expected {}x{}={}",
                labels.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            labels,
        })
    }

    /// Build a raster by evaluating `f(x, y)` for every pixel
    #[must_use]
    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> u8) -> Self {
        let mut labels = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                labels.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            labels,
        }
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.labels[(y * self.width + x) as usize]
    }

    /// Nearest-neighbour resample; labels are categorical so no interpolation
    #[must_use]
    pub fn resized(&self, width: u32, height: u32) -> Self {
        if (width, height) == (self.width, self.height) {
            return self.clone();
        }
        let sx = f64::from(self.width) / f64::from(width.max(1));
        let sy = f64::from(self.height) / f64::from(height.max(1));
        Self::from_fn(width, height, |x, y| {
            let src_x = ((f64::from(x) + 0.5) * sx).floor() as u32;
            let src_y = ((f64::from(y) + 0.5) * sy).floor() as u32;
            self.get(
                src_x.min(self.width.saturating_sub(1)),
                src_y.min(self.height.saturating_sub(1)),
            )
        })
    }

    /// Whether any pixel carries one of `classes`
    #[must_use]
    pub fn contains_any(&self, classes: &[u8]) -> bool {
        self.labels.iter().any(|l| classes.contains(l))
    }

    /// Tight box around pixels of `class`
    #[must_use]
    pub fn bounding_box_of(&self, class: u8) -> Option<BoundingBox> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) == class {
                    bounds = Some(match bounds {
                        None => (x, y, x, y),
                        Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
                    });
                }
            }
        }
        bounds.map(|(x1, y1, x2, y2)| BoundingBox::from_corners(x1, y1, x2, y2))
    }
}

/// Where a face box came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceSource {
    /// Face collaborator detection, with identity embedding
    Detector,
    /// Face class of the segmentation raster, no embedding
    Segmentation,
}

/// Detected face box plus identity embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub bbox: BoundingBox,
    pub embedding: Option<Vec<f32>>,
    pub padding_px: u32,
    pub source: FaceSource,
}

impl FaceRegion {
    /// A detector result with its identity embedding
    #[must_use]
    pub fn detected(bbox: BoundingBox, embedding: Vec<f32>) -> Self {
        Self {
            bbox,
            embedding: Some(embedding),
            padding_px: 0,
            source: FaceSource::Detector,
        }
    }

    /// A box recovered from the segmentation face class
    #[must_use]
    pub fn from_segmentation(bbox: BoundingBox) -> Self {
        Self {
            bbox,
            embedding: None,
            padding_px: 0,
            source: FaceSource::Segmentation,
        }
    }

    #[must_use]
    pub fn with_padding(mut self, padding_px: u32) -> Self {
        self.padding_px = padding_px;
        self
    }

    /// Face box grown by `padding_px` and clipped to the canvas
    #[must_use]
    pub fn exclusion_box(&self, width: u32, height: u32) -> BoundingBox {
        self.bbox.expand_clipped(self.padding_px, width, height)
    }
}

/// Non-fatal degradations recorded on a completed job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityCaveat {
    /// Too few confident keypoints; thin-plate refinement skipped
    AffineOnlyWarp,
    /// Correspondences were collinear or folded; thin-plate refinement skipped
    DegenerateCorrespondences,
    /// No face box was found; nothing was excluded from editing
    FaceNotDetected,
    /// Face box came from segmentation, generation ran without identity conditioning
    FaceEmbeddingUnavailable,
    /// Identity conditioning and face exclusion were turned off
    IdentityFeaturesDisabled,
}

impl QualityCaveat {
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::AffineOnlyWarp => "garment aligned with an affine warp only",
            Self::DegenerateCorrespondences => {
                "garment correspondences were degenerate, affine warp used"
            },
            Self::FaceNotDetected => "no face detected, face preservation not applied",
            Self::FaceEmbeddingUnavailable => {
                "face embedding unavailable, identity conditioning skipped"
            },
            Self::IdentityFeaturesDisabled => "identity preservation disabled by configuration",
        }
    }
}

/// Per-stage wall time of one job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingTimings {
    /// Time spent waiting for the inference gate
    pub queue_wait_ms: u64,
    /// Segmentation and face analysis, including mask construction
    pub segmentation_ms: u64,
    pub pose_ms: u64,
    pub warp_ms: u64,
    pub inpaint_ms: u64,
    /// Zero when the refiner is disabled
    pub refine_ms: u64,
    pub blend_ms: u64,
    /// Total end-to-end time, queue wait included
    pub total_ms: u64,
}

impl ProcessingTimings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Time spent in model calls and compositing, excluding queue wait
    #[must_use]
    pub fn processing_ms(&self) -> u64 {
        self.total_ms.saturating_sub(self.queue_wait_ms)
    }

    /// Share of processing spent inside the generative stages
    #[must_use]
    pub fn generation_ratio(&self) -> f64 {
        let processing = self.processing_ms();
        if processing == 0 {
            0.0
        } else {
            (self.inpaint_ms + self.refine_ms) as f64 / processing as f64
        }
    }
}

/// Completed try-on job
#[derive(Debug, Clone)]
pub struct TryOnResult {
    pub job_id: Uuid,
    pub category: GarmentCategory,
    /// Final composite at the configured output resolution
    pub image: RgbImage,
    pub caveats: Vec<QualityCaveat>,
    pub timings: ProcessingTimings,
    /// Set when the result was handed to a store
    pub stored: Option<StoredResult>,
}

impl TryOnResult {
    #[must_use]
    pub fn has_caveat(&self, caveat: QualityCaveat) -> bool {
        self.caveats.contains(&caveat)
    }

    /// Encode the composite as PNG
    pub fn to_png_bytes(&self) -> Result<Vec<u8>> {
        encode_png(&self.image)
    }

    /// PNG bytes as standard base64, for inline responses
    pub fn to_base64(&self) -> Result<String> {
        Ok(base64::engine::general_purpose::STANDARD.encode(self.to_png_bytes()?))
    }

    /// Save the composite as PNG
    pub fn save_png<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.image.save_with_format(path, ImageFormat::Png)?;
        Ok(())
    }
}

/// Encode an RGB buffer as PNG
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_parsing_accepts_overall_alias() {
        assert_eq!("upper".parse::<GarmentCategory>().unwrap(), GarmentCategory::Upper);
        assert_eq!(" LOWER ".parse::<GarmentCategory>().unwrap(), GarmentCategory::Lower);
        assert_eq!("overall".parse::<GarmentCategory>().unwrap(), GarmentCategory::Full);
        let err = "hat".parse::<GarmentCategory>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_category_classes() {
        assert!(GarmentCategory::Lower.class_ids().contains(&atr::PANTS));
        assert!(GarmentCategory::Lower.class_ids().contains(&atr::SKIRT));
        assert!(!GarmentCategory::Upper.class_ids().contains(&atr::FACE));
        assert!(GarmentCategory::Full.class_ids().contains(&atr::DRESS));
    }

    #[test]
    fn test_category_serde_is_lowercase() {
        let json = serde_json::to_string(&GarmentCategory::Full).unwrap();
        assert_eq!(json, "\"full\"");
    }

    #[test]
    fn test_segmentation_map_rejects_wrong_length() {
        assert!(SegmentationMap::new(4, 4, vec![0; 15]).is_err());
        assert!(SegmentationMap::new(4, 4, vec![0; 16]).is_ok());
    }

    #[test]
    fn test_segmentation_resize_keeps_labels() {
        let map = SegmentationMap::from_fn(4, 4, |x, _| if x < 2 { atr::FACE } else { atr::PANTS });
        let big = map.resized(8, 8);
        assert_eq!(big.dimensions(), (8, 8));
        assert_eq!(big.get(0, 0), atr::FACE);
        assert_eq!(big.get(7, 7), atr::PANTS);
        assert!(big.labels().iter().all(|l| *l == atr::FACE || *l == atr::PANTS));
    }

    #[test]
    fn test_bounding_box_of_class() {
        let map = SegmentationMap::from_fn(10, 10, |x, y| {
            if (2..5).contains(&x) && (3..7).contains(&y) {
                atr::FACE
            } else {
                atr::BACKGROUND
            }
        });
        assert_eq!(map.bounding_box_of(atr::FACE), Some(BoundingBox::new(2, 3, 3, 4)));
        assert_eq!(map.bounding_box_of(atr::HAT), None);
    }

    #[test]
    fn test_face_exclusion_box_is_padded_and_clipped() {
        let face = FaceRegion::detected(BoundingBox::new(10, 10, 20, 20), vec![0.0; 4]).with_padding(30);
        assert_eq!(face.exclusion_box(100, 100), BoundingBox::new(0, 0, 60, 60));
    }

    #[test]
    fn test_timings_ratio() {
        let timings = ProcessingTimings {
            queue_wait_ms: 100,
            inpaint_ms: 50,
            refine_ms: 25,
            total_ms: 200,
            ..ProcessingTimings::default()
        };
        assert_eq!(timings.processing_ms(), 100);
        assert!((timings.generation_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_result_base64_decodes_to_png() {
        let result = TryOnResult {
            job_id: Uuid::new_v4(),
            category: GarmentCategory::Upper,
            image: RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30])),
            caveats: vec![],
            timings: ProcessingTimings::default(),
            stored: None,
        };
        let encoded = result.to_base64().unwrap();
        let bytes = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(decoded, result.image);
    }
}
