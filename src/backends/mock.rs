//! Scripted model collaborators
//!
//! Deterministic stand-ins for the segmentation, pose, face, inpainting and
//! refinement models. They render a synthetic person scene, count every
//! call and can be scripted to fail, so pipeline behavior can be exercised
//! without weights or a GPU.

use crate::{
    error::{Result, TryOnError},
    geometry::{BodyPart, BoundingBox, KeypointSet},
    inference::{
        FaceAnalyzer, GenerationParams, InpaintRequest, Inpainter, ModelKind, ModelSet,
        PoseEstimator, Refiner, Segmenter,
    },
    types::{atr, FaceRegion, GarmentCategory, SegmentationMap},
};
use image::{GrayImage, Luma, Rgb, RgbImage};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// Length of the identity embedding the mock face analyzer returns
pub const EMBEDDING_DIM: usize = 512;

/// Color the mock inpainter repaints garments with
pub const GENERATED_TINT: [u8; 3] = [30, 120, 60];

fn frac_box(width: u32, height: u32, x0: f64, y0: f64, x1: f64, y1: f64) -> BoundingBox {
    let fw = f64::from(width);
    let fh = f64::from(height);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let px = |v: f64, extent: f64| (v * extent).round() as u32;
    let (left, top) = (px(x0, fw), px(y0, fh));
    let (right, bottom) = (px(x1, fw).max(left + 1), px(y1, fh).max(top + 1));
    BoundingBox::new(left, top, right - left, bottom - top).expand_clipped(0, width, height)
}

/// Face box of the synthetic person
#[must_use]
pub fn scene_face_box(width: u32, height: u32) -> BoundingBox {
    frac_box(width, height, 0.40, 0.05, 0.60, 0.21)
}

/// Parsing raster of a front-facing person wearing a top and trousers
#[must_use]
pub fn person_segmentation(width: u32, height: u32) -> SegmentationMap {
    let face = scene_face_box(width, height);
    let hair = frac_box(width, height, 0.38, 0.02, 0.62, 0.07);
    let upper = frac_box(width, height, 0.32, 0.22, 0.68, 0.56);
    let right_arm = frac_box(width, height, 0.24, 0.26, 0.32, 0.58);
    let left_arm = frac_box(width, height, 0.68, 0.26, 0.76, 0.58);
    let pants = frac_box(width, height, 0.38, 0.56, 0.62, 0.90);
    let shoes = frac_box(width, height, 0.38, 0.90, 0.62, 0.95);
    SegmentationMap::from_fn(width, height, |x, y| {
        if face.contains(x, y) {
            atr::FACE
        } else if hair.contains(x, y) {
            atr::HAIR
        } else if upper.contains(x, y) {
            atr::UPPER_CLOTHES
        } else if right_arm.contains(x, y) {
            atr::RIGHT_ARM
        } else if left_arm.contains(x, y) {
            atr::LEFT_ARM
        } else if pants.contains(x, y) {
            atr::PANTS
        } else if shoes.contains(x, y) {
            atr::LEFT_SHOE
        } else {
            atr::BACKGROUND
        }
    })
}

/// Photo matching [`person_segmentation`]
#[must_use]
pub fn person_image(width: u32, height: u32) -> RgbImage {
    let segmentation = person_segmentation(width, height);
    RgbImage::from_fn(width, height, |x, y| {
        let shade = u8::try_from((x + y) % 16).unwrap_or(0);
        match segmentation.get(x, y) {
            atr::FACE => Rgb([224, 172 + shade, 140]),
            atr::HAIR => Rgb([60, 40, 30]),
            atr::UPPER_CLOTHES => Rgb([180, 40 + shade, 40]),
            atr::LEFT_ARM | atr::RIGHT_ARM => Rgb([214, 162, 130]),
            atr::PANTS => Rgb([40, 40, 120 + shade]),
            atr::LEFT_SHOE => Rgb([20, 20, 20]),
            _ => Rgb([230, 230, 230]),
        }
    })
}

/// Product photo of a striped garment on a white backdrop
#[must_use]
pub fn garment_image(width: u32, height: u32) -> RgbImage {
    let body = frac_box(width, height, 0.15, 0.10, 0.85, 0.90);
    RgbImage::from_fn(width, height, |x, y| {
        if body.contains(x, y) {
            if (y / 4) % 2 == 0 {
                Rgb([30, 120, 60])
            } else {
                Rgb([240, 200, 40])
            }
        } else {
            Rgb([255, 255, 255])
        }
    })
}

/// Confident COCO-18 keypoints for the synthetic person
#[must_use]
pub fn person_keypoints(width: u32, height: u32) -> KeypointSet {
    let (w, h) = (f64::from(width), f64::from(height));
    let table = [
        (BodyPart::Nose, 0.50, 0.14),
        (BodyPart::Neck, 0.50, 0.24),
        (BodyPart::RightShoulder, 0.34, 0.27),
        (BodyPart::RightElbow, 0.28, 0.42),
        (BodyPart::RightWrist, 0.26, 0.56),
        (BodyPart::LeftShoulder, 0.66, 0.27),
        (BodyPart::LeftElbow, 0.72, 0.42),
        (BodyPart::LeftWrist, 0.74, 0.56),
        (BodyPart::RightHip, 0.40, 0.55),
        (BodyPart::RightKnee, 0.41, 0.74),
        (BodyPart::RightAnkle, 0.41, 0.93),
        (BodyPart::LeftHip, 0.60, 0.55),
        (BodyPart::LeftKnee, 0.59, 0.74),
        (BodyPart::LeftAnkle, 0.59, 0.93),
        (BodyPart::RightEye, 0.46, 0.12),
        (BodyPart::LeftEye, 0.54, 0.12),
        (BodyPart::RightEar, 0.42, 0.13),
        (BodyPart::LeftEar, 0.58, 0.13),
    ];
    #[allow(clippy::cast_possible_truncation)]
    let parts: Vec<(BodyPart, f32, f32, f32)> = table
        .iter()
        .map(|&(part, fx, fy)| (part, (fx * w) as f32, (fy * h) as f32, 0.9))
        .collect();
    KeypointSet::from_parts(&parts)
}

/// Inpainting request over a white canvas with a full mask
#[must_use]
pub fn blank_inpaint_request(width: u32, height: u32) -> InpaintRequest {
    InpaintRequest {
        image: RgbImage::from_pixel(width, height, Rgb([255, 255, 255])),
        mask: GrayImage::from_pixel(width, height, Luma([255])),
        pose_map: RgbImage::new(width, height),
        face_embedding: None,
        category: GarmentCategory::Upper,
        params: GenerationParams {
            steps: 30,
            guidance_scale: 7.5,
            strength: 0.85,
            seed: 42,
            identity_lock_scale: 0.8,
        },
    }
}

/// Call counters shared by every mock collaborator
#[derive(Debug, Default)]
pub struct MockCounters {
    warm_ups: AtomicUsize,
    segment: AtomicUsize,
    pose: AtomicUsize,
    face: AtomicUsize,
    inpaint: AtomicUsize,
    refine: AtomicUsize,
}

impl MockCounters {
    pub fn warm_ups(&self) -> usize {
        self.warm_ups.load(Ordering::SeqCst)
    }

    pub fn segment_calls(&self) -> usize {
        self.segment.load(Ordering::SeqCst)
    }

    pub fn pose_calls(&self) -> usize {
        self.pose.load(Ordering::SeqCst)
    }

    pub fn face_calls(&self) -> usize {
        self.face.load(Ordering::SeqCst)
    }

    pub fn inpaint_calls(&self) -> usize {
        self.inpaint.load(Ordering::SeqCst)
    }

    pub fn refine_calls(&self) -> usize {
        self.refine.load(Ordering::SeqCst)
    }

    /// Model invocations of any kind, warm-ups excluded
    pub fn total_calls(&self) -> usize {
        self.segment_calls()
            + self.pose_calls()
            + self.face_calls()
            + self.inpaint_calls()
            + self.refine_calls()
    }

    fn counter(&self, kind: ModelKind) -> &AtomicUsize {
        match kind {
            ModelKind::Segmentation => &self.segment,
            ModelKind::Pose => &self.pose,
            ModelKind::Face => &self.face,
            ModelKind::Inpaint => &self.inpaint,
            ModelKind::Refine => &self.refine,
        }
    }
}

#[derive(Debug, Clone)]
enum ScriptedFailure {
    OutOfMemory,
    Error(String),
}

#[derive(Debug)]
struct Scene {
    segmentation: SegmentationMap,
    keypoints: KeypointSet,
    face: Option<BoundingBox>,
    inpaint_output: Option<(u32, u32)>,
    latency: Duration,
}

#[derive(Debug)]
struct MockState {
    width: u32,
    height: u32,
    scene: Mutex<Scene>,
    failures: Mutex<BTreeMap<ModelKind, ScriptedFailure>>,
    counters: MockCounters,
}

impl MockState {
    fn scene<T>(&self, read: impl FnOnce(&Scene) -> T) -> Result<T> {
        self.scene
            .lock()
            .map(|scene| read(&scene))
            .map_err(|_| TryOnError::internal("mock scene lock poisoned"))
    }

    /// Count the call, sleep for the scripted latency, then fire any failure
    fn enter(&self, kind: ModelKind) -> Result<()> {
        self.counter(kind);
        let latency = self.scene(|s| s.latency)?;
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        let failure = self
            .failures
            .lock()
            .map_err(|_| TryOnError::internal("mock failure lock poisoned"))?
            .remove(&kind);
        match failure {
            None => Ok(()),
            Some(ScriptedFailure::OutOfMemory) => Err(TryOnError::out_of_memory(
                kind,
                "CUDA out of memory. Tried to allocate 2.00 GiB",
            )),
            Some(ScriptedFailure::Error(message)) => Err(TryOnError::model_failure(kind, message)),
        }
    }

    fn counter(&self, kind: ModelKind) {
        self.counters.counter(kind).fetch_add(1, Ordering::SeqCst);
    }

    fn warm_up(&self) -> Result<()> {
        self.counters.warm_ups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn scale_for(&self, image: &RgbImage) -> (f64, f64) {
        (
            f64::from(image.width()) / f64::from(self.width.max(1)),
            f64::from(image.height()) / f64::from(self.height.max(1)),
        )
    }
}

/// Handle to a scripted collaborator set
///
/// Clones share scene, failure scripts and counters.
#[derive(Debug, Clone)]
pub struct MockModels {
    state: Arc<MockState>,
    refiner: bool,
}

impl MockModels {
    /// Synthetic person scene at `width` x `height`, refiner included
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        let scene = Scene {
            segmentation: person_segmentation(width, height),
            keypoints: person_keypoints(width, height),
            face: Some(scene_face_box(width, height)),
            inpaint_output: None,
            latency: Duration::ZERO,
        };
        Self {
            state: Arc::new(MockState {
                width,
                height,
                scene: Mutex::new(scene),
                failures: Mutex::new(BTreeMap::new()),
                counters: MockCounters::default(),
            }),
            refiner: true,
        }
    }

    fn edit_scene(self, edit: impl FnOnce(&mut Scene)) -> Self {
        if let Ok(mut scene) = self.state.scene.lock() {
            edit(&mut scene);
        }
        self
    }

    #[must_use]
    pub fn without_refiner(mut self) -> Self {
        self.refiner = false;
        self
    }

    /// Sleep this long inside every model call
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.edit_scene(|scene| scene.latency = latency)
    }

    #[must_use]
    pub fn with_segmentation(self, segmentation: SegmentationMap) -> Self {
        self.edit_scene(|scene| scene.segmentation = segmentation)
    }

    /// Remove every pixel of `classes` from the parsing raster
    #[must_use]
    pub fn without_classes(self, classes: &[u8]) -> Self {
        self.edit_scene(|scene| {
            let (w, h) = scene.segmentation.dimensions();
            let source = scene.segmentation.clone();
            scene.segmentation = SegmentationMap::from_fn(w, h, |x, y| {
                let label = source.get(x, y);
                if classes.contains(&label) {
                    atr::BACKGROUND
                } else {
                    label
                }
            });
        })
    }

    #[must_use]
    pub fn with_keypoints(self, keypoints: KeypointSet) -> Self {
        self.edit_scene(|scene| scene.keypoints = keypoints)
    }

    /// Face detector result; `None` makes the detector find nothing
    #[must_use]
    pub fn with_face(self, face: Option<BoundingBox>) -> Self {
        self.edit_scene(|scene| scene.face = face)
    }

    /// Make the inpainter return images of a different size
    #[must_use]
    pub fn with_inpaint_output(self, width: u32, height: u32) -> Self {
        self.edit_scene(|scene| scene.inpaint_output = Some((width, height)))
    }

    /// Next inpainting call runs out of device memory
    pub fn fail_inpaint_with_oom(&self) {
        if let Ok(mut failures) = self.state.failures.lock() {
            failures.insert(ModelKind::Inpaint, ScriptedFailure::OutOfMemory);
        }
    }

    /// Next call to `kind` fails with `message`
    pub fn fail_next<S: Into<String>>(&self, kind: ModelKind, message: S) {
        if let Ok(mut failures) = self.state.failures.lock() {
            failures.insert(kind, ScriptedFailure::Error(message.into()));
        }
    }

    #[must_use]
    pub fn counters(&self) -> &MockCounters {
        &self.state.counters
    }

    /// Collaborator set backed by this mock
    #[must_use]
    pub fn model_set(&self) -> ModelSet {
        let set = ModelSet::new(
            Arc::new(MockSegmenter(Arc::clone(&self.state))),
            Arc::new(MockPose(Arc::clone(&self.state))),
            Arc::new(MockFace(Arc::clone(&self.state))),
            Arc::new(MockInpainter(Arc::clone(&self.state))),
        );
        if self.refiner {
            set.with_refiner(Arc::new(MockRefiner(Arc::clone(&self.state))))
        } else {
            set
        }
    }
}

struct MockSegmenter(Arc<MockState>);

impl Segmenter for MockSegmenter {
    fn segment(&self, _image: &RgbImage) -> Result<SegmentationMap> {
        self.0.enter(ModelKind::Segmentation)?;
        self.0.scene(|s| s.segmentation.clone())
    }

    fn warm_up(&self) -> Result<()> {
        self.0.warm_up()
    }
}

struct MockPose(Arc<MockState>);

impl PoseEstimator for MockPose {
    fn estimate(&self, image: &RgbImage) -> Result<KeypointSet> {
        self.0.enter(ModelKind::Pose)?;
        let (sx, sy) = self.0.scale_for(image);
        let mut keypoints = self.0.scene(|s| s.keypoints.clone())?;
        #[allow(clippy::cast_possible_truncation)]
        for k in &mut keypoints.points {
            k.x = (f64::from(k.x) * sx) as f32;
            k.y = (f64::from(k.y) * sy) as f32;
        }
        Ok(keypoints)
    }

    fn warm_up(&self) -> Result<()> {
        self.0.warm_up()
    }
}

struct MockFace(Arc<MockState>);

impl FaceAnalyzer for MockFace {
    fn analyze(&self, image: &RgbImage) -> Result<Option<FaceRegion>> {
        self.0.enter(ModelKind::Face)?;
        let (sx, sy) = self.0.scale_for(image);
        let face = self.0.scene(|s| s.face)?;
        Ok(face.map(|bbox| {
            let bbox = bbox
                .scaled(sx, sy)
                .expand_clipped(0, image.width(), image.height());
            FaceRegion::detected(bbox, vec![0.5; EMBEDDING_DIM])
        }))
    }

    fn warm_up(&self) -> Result<()> {
        self.0.warm_up()
    }
}

/// Repaints the garment pixels under the mask and scrambles the face, like
/// an unconstrained diffusion model would; the rest of the masked context
/// comes back as it went in
struct MockInpainter(Arc<MockState>);

impl Inpainter for MockInpainter {
    fn inpaint(&self, request: &InpaintRequest) -> Result<RgbImage> {
        self.0.enter(ModelKind::Inpaint)?;
        let (face, output, segmentation) =
            self.0.scene(|s| (s.face, s.inpaint_output, s.segmentation.clone()))?;
        let (sx, sy) = self.0.scale_for(&request.image);
        let face = face.map(|bbox| bbox.scaled(sx, sy));
        let (seg_w, seg_h) = segmentation.dimensions();
        let classes = request.category.class_ids();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let is_garment = |x: u32, y: u32| {
            let gx = ((f64::from(x) / sx) as u32).min(seg_w.saturating_sub(1));
            let gy = ((f64::from(y) / sy) as u32).min(seg_h.saturating_sub(1));
            seg_w > 0 && seg_h > 0 && classes.contains(&segmentation.get(gx, gy))
        };

        let mut generated = request.image.clone();
        for (x, y, pixel) in generated.enumerate_pixels_mut() {
            if request.mask.get_pixel(x, y)[0] > 127 && is_garment(x, y) {
                for c in 0..3 {
                    let mixed = (u16::from(pixel[c]) + u16::from(GENERATED_TINT[c]) * 3) / 4;
                    pixel[c] = u8::try_from(mixed).unwrap_or(u8::MAX);
                }
            }
            if face.is_some_and(|b| b.contains(x, y)) {
                pixel.0 = [255 - pixel[0], 255 - pixel[1], 255 - pixel[2]];
            }
        }

        Ok(match output {
            Some((w, h)) if (w, h) != generated.dimensions() => {
                image::imageops::resize(&generated, w, h, image::imageops::FilterType::Triangle)
            },
            _ => generated,
        })
    }

    fn warm_up(&self) -> Result<()> {
        self.0.warm_up()
    }
}

struct MockRefiner(Arc<MockState>);

impl Refiner for MockRefiner {
    fn refine(&self, image: &RgbImage, strength: f32) -> Result<RgbImage> {
        self.0.enter(ModelKind::Refine)?;
        Ok(image::imageops::unsharpen(image, 0.5 + strength, 2))
    }

    fn warm_up(&self) -> Result<()> {
        self.0.warm_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_has_every_category() {
        let map = person_segmentation(128, 128);
        for category in [
            GarmentCategory::Upper,
            GarmentCategory::Lower,
            GarmentCategory::Full,
        ] {
            assert!(map.contains_any(category.class_ids()), "{category}");
        }
        assert_eq!(map.bounding_box_of(atr::FACE), Some(scene_face_box(128, 128)));
    }

    #[test]
    fn test_failures_fire_once() {
        let mocks = MockModels::new(32, 32);
        mocks.fail_inpaint_with_oom();
        let models = mocks.model_set();
        let request = blank_inpaint_request(32, 32);

        let err = models.inpainter.inpaint(&request).unwrap_err();
        assert!(err.is_out_of_memory());
        assert!(models.inpainter.inpaint(&request).is_ok());
        assert_eq!(mocks.counters().inpaint_calls(), 2);
    }

    #[test]
    fn test_without_classes_empties_category() {
        let mocks = MockModels::new(64, 64).without_classes(GarmentCategory::Lower.class_ids());
        let map = mocks.model_set().segmenter.segment(&RgbImage::new(64, 64)).unwrap();
        assert!(!map.contains_any(GarmentCategory::Lower.class_ids()));
        assert!(map.contains_any(GarmentCategory::Upper.class_ids()));
    }

    #[test]
    fn test_detections_follow_image_size() {
        let mocks = MockModels::new(64, 64);
        let models = mocks.model_set();
        let image = RgbImage::new(128, 128);

        let face = models.face.analyze(&image).unwrap().unwrap();
        assert_eq!(face.embedding.as_ref().map(Vec::len), Some(EMBEDDING_DIM));
        assert!(face.bbox.width >= scene_face_box(64, 64).width * 2 - 1);

        let keypoints = models.pose.estimate(&image).unwrap();
        let neck = keypoints.get(BodyPart::Neck).unwrap();
        assert!((neck.x - 64.0).abs() < 1.0);
    }

    #[test]
    fn test_inpainter_scrambles_face_and_resizes() {
        let mocks = MockModels::new(32, 32).with_inpaint_output(48, 48);
        let request = blank_inpaint_request(32, 32);
        let out = mocks.model_set().inpainter.inpaint(&request).unwrap();
        assert_eq!(out.dimensions(), (48, 48));

        let mocks = MockModels::new(32, 32);
        let out = mocks.model_set().inpainter.inpaint(&request).unwrap();
        let center = scene_face_box(32, 32).center();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let face_pixel = out.get_pixel(center.x as u32, center.y as u32);
        assert_ne!(face_pixel.0, [255, 255, 255]);
    }
}
