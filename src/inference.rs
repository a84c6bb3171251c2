//! Capability interfaces for the external model collaborators
//!
//! The orchestration core only ever talks to models through these traits.
//! Calls are blocking; the resource manager runs them on the blocking pool
//! while it holds the inference gate.

use crate::{
    error::Result,
    geometry::KeypointSet,
    types::{FaceRegion, GarmentCategory, SegmentationMap},
};
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Kinds of resident model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Segmentation,
    Pose,
    Face,
    Inpaint,
    Refine,
}

impl ModelKind {
    pub const ALL: [Self; 5] = [
        Self::Segmentation,
        Self::Pose,
        Self::Face,
        Self::Inpaint,
        Self::Refine,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Segmentation => "segmentation",
            Self::Pose => "pose",
            Self::Face => "face",
            Self::Inpaint => "inpaint",
            Self::Refine => "refine",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human parsing: image to class-indexed raster
pub trait Segmenter: Send + Sync {
    /// Segment a person image. The raster may be at model resolution.
    fn segment(&self, image: &RgbImage) -> Result<SegmentationMap>;

    /// Load weights ahead of the first call
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}

/// Body landmark detection
pub trait PoseEstimator: Send + Sync {
    /// Detect keypoints in person-image pixel coordinates
    fn estimate(&self, image: &RgbImage) -> Result<KeypointSet>;

    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}

/// Face detection and identity embedding
pub trait FaceAnalyzer: Send + Sync {
    /// Largest face in the image, `None` when no face is found
    fn analyze(&self, image: &RgbImage) -> Result<Option<FaceRegion>>;

    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}

/// Sampling parameters handed to the inpainting collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub steps: u32,
    pub guidance_scale: f32,
    pub strength: f32,
    pub seed: u64,
    /// Weight of identity conditioning, ignored without an embedding
    pub identity_lock_scale: f32,
}

/// Everything an inpainting call consumes
#[derive(Debug, Clone)]
pub struct InpaintRequest {
    /// Person image with the warped garment pasted under the mask
    pub image: RgbImage,
    /// Region the model may repaint (255 = repaint)
    pub mask: GrayImage,
    pub pose_map: RgbImage,
    pub face_embedding: Option<Vec<f32>>,
    pub category: GarmentCategory,
    pub params: GenerationParams,
}

/// Diffusion-based inpainting
pub trait Inpainter: Send + Sync {
    /// Returns a full-frame image; its size may differ from the request
    fn inpaint(&self, request: &InpaintRequest) -> Result<RgbImage>;

    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}

/// Low-strength img2img texture pass
pub trait Refiner: Send + Sync {
    fn refine(&self, image: &RgbImage, strength: f32) -> Result<RgbImage>;

    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}

/// The resident collaborator set shared by every job
#[derive(Clone)]
pub struct ModelSet {
    pub segmenter: Arc<dyn Segmenter>,
    pub pose: Arc<dyn PoseEstimator>,
    pub face: Arc<dyn FaceAnalyzer>,
    pub inpainter: Arc<dyn Inpainter>,
    pub refiner: Option<Arc<dyn Refiner>>,
}

impl fmt::Debug for ModelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSet")
            .field("refiner", &self.refiner.is_some())
            .finish_non_exhaustive()
    }
}

impl ModelSet {
    #[must_use]
    pub fn new(
        segmenter: Arc<dyn Segmenter>,
        pose: Arc<dyn PoseEstimator>,
        face: Arc<dyn FaceAnalyzer>,
        inpainter: Arc<dyn Inpainter>,
    ) -> Self {
        Self {
            segmenter,
            pose,
            face,
            inpainter,
            refiner: None,
        }
    }

    #[must_use]
    pub fn with_refiner(mut self, refiner: Arc<dyn Refiner>) -> Self {
        self.refiner = Some(refiner);
        self
    }

    /// Kinds that are present in this set
    #[must_use]
    pub fn kinds(&self) -> Vec<ModelKind> {
        ModelKind::ALL
            .into_iter()
            .filter(|kind| *kind != ModelKind::Refine || self.refiner.is_some())
            .collect()
    }

    /// Load one collaborator's weights
    pub fn warm_up(&self, kind: ModelKind) -> Result<()> {
        match kind {
            ModelKind::Segmentation => self.segmenter.warm_up(),
            ModelKind::Pose => self.pose.warm_up(),
            ModelKind::Face => self.face.warm_up(),
            ModelKind::Inpaint => self.inpainter.warm_up(),
            ModelKind::Refine => self.refiner.as_ref().map_or(Ok(()), |r| r.warm_up()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::MockModels;

    #[test]
    fn test_model_kind_display() {
        assert_eq!(ModelKind::Inpaint.to_string(), "inpaint");
        assert_eq!(ModelKind::ALL.len(), 5);
    }

    #[test]
    fn test_kinds_without_refiner() {
        let models = MockModels::new(64, 64).without_refiner().model_set();
        assert!(!models.kinds().contains(&ModelKind::Refine));
        assert_eq!(models.kinds().len(), 4);
    }

    #[test]
    fn test_warm_up_reaches_collaborator() {
        let mocks = MockModels::new(64, 64);
        let models = mocks.model_set();
        models.warm_up(ModelKind::Segmentation).unwrap();
        assert_eq!(mocks.counters().warm_ups(), 1);
    }
}
