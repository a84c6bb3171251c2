//! Stage orchestrator
//!
//! Drives one job through `queued → segmenting → posing → warping →
//! inpainting → refining → blending → done` while holding the inference
//! gate. Stage artifacts travel in [`StageState`]; each transition consumes
//! the previous variant, so a stage can only ever see the outputs of the
//! stage before it.
//!
//! Cancellation and the whole-job deadline are checked at every stage
//! boundary. A model call that is already running is never interrupted;
//! the lease waits for it before the next job is admitted.

use crate::{
    api::TryOnRequest,
    composite::{CompositeSettings, Compositor},
    config::TryOnConfig,
    error::{Result, TryOnError},
    geometry::{render_pose_map, KeypointSet},
    inference::{GenerationParams, InpaintRequest, ModelKind},
    job::{Job, JobHandle},
    mask::{face_box_from_segmentation, MaskEngine, MaskSet, MaskSettings},
    progress::{NoOpProgressReporter, ProcessingStage, ProgressReporter, ProgressTracker},
    resources::{GpuLease, HealthReport, ModelCall, ResourceManager},
    storage::{FilesystemStore, ResultStore},
    tracing_config::spans,
    types::{
        encode_png, FaceRegion, GarmentCategory, ProcessingTimings, QualityCaveat, TryOnResult,
    },
    utils::ImagePreprocessor,
    warp::{WarpEngine, WarpSettings, WarpedGarment},
};
use image::{imageops::FilterType, RgbImage};
use instant::Instant;
use std::{future::Future, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};
use uuid::Uuid;

/// Canvas color behind letterboxed inputs
const LETTERBOX_FILL: [u8; 3] = [255, 255, 255];

/// Artifacts between stages
enum StageState {
    Queued {
        person: RgbImage,
        garment: RgbImage,
    },
    Segmented {
        person: RgbImage,
        garment: RgbImage,
        masks: MaskSet,
        face: Option<FaceRegion>,
        pose: ModelCall<KeypointSet>,
        pose_started: Instant,
    },
    Posed {
        person: RgbImage,
        garment: RgbImage,
        masks: MaskSet,
        face: Option<FaceRegion>,
        keypoints: KeypointSet,
        pose_map: RgbImage,
    },
    Warped {
        person: RgbImage,
        masks: MaskSet,
        face: Option<FaceRegion>,
        pose_map: RgbImage,
        warped: WarpedGarment,
    },
    Inpainted {
        person: RgbImage,
        masks: MaskSet,
        generated: RgbImage,
    },
    Refined {
        person: RgbImage,
        masks: MaskSet,
        generated: RgbImage,
    },
    Blended {
        image: RgbImage,
    },
}

impl StageState {
    fn name(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Segmented { .. } => "segmented",
            Self::Posed { .. } => "posed",
            Self::Warped { .. } => "warped",
            Self::Inpainted { .. } => "inpainted",
            Self::Refined { .. } => "refined",
            Self::Blended { .. } => "blended",
        }
    }
}

/// Per-job bookkeeping threaded through the stages
struct JobContext {
    job: Job,
    config: TryOnConfig,
    cancel: CancellationToken,
    deadline: tokio::time::Instant,
    started: Instant,
    tracker: ProgressTracker,
    timings: ProcessingTimings,
    caveats: Vec<QualityCaveat>,
}

impl JobContext {
    fn category(&self) -> GarmentCategory {
        self.job.category()
    }

    fn timeout_error(&self) -> TryOnError {
        TryOnError::Timeout {
            limit_ms: millis(self.config.job_timeout),
        }
    }

    /// Fail fast on cancellation or an expired deadline
    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TryOnError::Cancelled);
        }
        if tokio::time::Instant::now() >= self.deadline {
            return Err(self.timeout_error());
        }
        Ok(())
    }

    fn enter(&mut self, stage: ProcessingStage) -> Result<()> {
        self.checkpoint()?;
        self.job.advance(stage)?;
        self.tracker.report_stage(stage);
        info!(stage = %stage, progress = stage.progress_percentage(), "stage started");
        Ok(())
    }

    /// Await `work`, failing with `Timeout` once the job deadline passes
    async fn bounded<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout_at(self.deadline, work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.timeout_error()),
        }
    }

    fn caveat(&mut self, caveat: QualityCaveat) {
        if !self.caveats.contains(&caveat) {
            warn!(caveat = ?caveat, "{}", caveat.description());
            self.caveats.push(caveat);
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn elapsed_ms(since: Instant) -> u64 {
    millis(since.elapsed())
}

/// Run CPU-heavy work on the blocking pool
async fn offload<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| TryOnError::internal(format!("worker task failed: {e}")))?
}

/// Resize a collaborator output onto the working canvas when it differs
fn conform(image: RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image;
    }
    debug!(from = ?image.dimensions(), to = ?(width, height), "resampling model output");
    image::imageops::resize(&image, width, height, FilterType::Lanczos3)
}

/// Person image with the warped garment pasted where it may be repainted
fn guide_composite(person: &RgbImage, warped: &WarpedGarment, masks: &MaskSet) -> RgbImage {
    let mut guide = person.clone();
    for (x, y, pixel) in guide.enumerate_pixels_mut() {
        if warped.coverage.get(x, y) && masks.inpaint.get(x, y) {
            *pixel = *warped.image.get_pixel(x, y);
        }
    }
    guide
}

/// Runs try-on jobs against a shared [`ResourceManager`]
#[derive(Clone)]
pub struct TryOnOrchestrator {
    config: Arc<TryOnConfig>,
    resources: Arc<ResourceManager>,
    store: Option<Arc<dyn ResultStore>>,
    reporter: Arc<dyn ProgressReporter>,
}

impl std::fmt::Debug for TryOnOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TryOnOrchestrator")
            .field("config", &self.config)
            .field("resources", &self.resources)
            .field("store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl TryOnOrchestrator {
    /// Orchestrator over `resources` with a validated process configuration
    ///
    /// A configured `result_dir` gets a [`FilesystemStore`]; otherwise results
    /// are returned inline until [`Self::with_store`] is called.
    pub fn new(config: TryOnConfig, resources: Arc<ResourceManager>) -> Result<Self> {
        config.validate()?;
        let store = config.result_dir.as_ref().map(|dir| {
            info!(dir = %dir.display(), "storing results on disk");
            Arc::new(FilesystemStore::new(dir)) as Arc<dyn ResultStore>
        });
        Ok(Self {
            config: Arc::new(config),
            resources,
            store,
            reporter: Arc::new(NoOpProgressReporter),
        })
    }

    /// Hand finished results to `store` instead of returning them inline only
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    #[must_use]
    pub fn config(&self) -> &TryOnConfig {
        &self.config
    }

    #[must_use]
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    #[must_use]
    pub fn health(&self) -> HealthReport {
        self.resources.health()
    }

    /// Merge and validate per-job overrides before any resource is touched
    fn admit(&self, request: &TryOnRequest) -> Result<TryOnConfig> {
        let config = self.config.for_job(&request.options)?;
        if config.refiner_enabled && self.resources.models().refiner.is_none() {
            return Err(TryOnError::invalid_config(
                "refiner requested but no refiner model is configured",
            ));
        }
        Ok(config)
    }

    /// Execute a job to completion
    ///
    /// Invalid per-job configuration is rejected before the job is queued.
    #[instrument(skip_all, fields(category = %request.category()))]
    pub async fn run(&self, request: TryOnRequest) -> Result<TryOnResult> {
        let config = self.admit(&request)?;
        let (job, _status) = Job::new(Uuid::new_v4(), request.category());
        let span = spans::job(job.id(), job.category());
        self.execute(job, config, request, CancellationToken::new())
            .instrument(span)
            .await
    }

    /// Submit a job and return a handle to observe or cancel it
    ///
    /// Must be called inside a Tokio runtime.
    #[instrument(skip_all, fields(category = %request.category()))]
    pub fn spawn(&self, request: TryOnRequest) -> Result<JobHandle> {
        let config = self.admit(&request)?;
        let job_id = Uuid::new_v4();
        let (job, status) = Job::new(job_id, request.category());
        let cancel = CancellationToken::new();
        let span = spans::job(job_id, job.category());

        let this = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(
            async move { this.execute(job, config, request, token).await }.instrument(span),
        );
        Ok(JobHandle::new(job_id, status, cancel, task))
    }

    async fn execute(
        &self,
        job: Job,
        config: TryOnConfig,
        request: TryOnRequest,
        cancel: CancellationToken,
    ) -> Result<TryOnResult> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + config.job_timeout;
        let tracker = ProgressTracker::new(Arc::clone(&self.reporter), job.id(), started);
        let mut ctx = JobContext {
            job,
            config,
            cancel,
            deadline,
            started,
            tracker,
            timings: ProcessingTimings::default(),
            caveats: Vec::new(),
        };
        ctx.tracker.report_stage(ProcessingStage::Queued);
        info!("job queued");

        let mut lease = None;
        match self.drive(&mut ctx, request, &mut lease).await {
            Ok(result) => Ok(result),
            Err(err) => {
                let err = err.into_taxonomy();
                if let Some(lease) = lease.take() {
                    if let Err(release_err) = lease.release().await {
                        error!(error = %release_err, "device recycle after failure failed");
                    }
                }
                ctx.job.fail(&err);
                ctx.tracker.report_error(&err.to_string());
                error!(kind = %err.kind(), error = %err, stage = %ctx.tracker.current_stage(), "job failed");
                Err(err)
            },
        }
    }

    async fn drive(
        &self,
        ctx: &mut JobContext,
        request: TryOnRequest,
        lease_slot: &mut Option<GpuLease>,
    ) -> Result<TryOnResult> {
        let size = ctx.config.working_size;
        let person = ImagePreprocessor::letterbox(&request.person, size, LETTERBOX_FILL)?.0;
        let garment = ImagePreprocessor::letterbox(&request.garment, size, LETTERBOX_FILL)?.0;

        let lease = lease_slot.insert(self.acquire(ctx).await?);

        let mut state = StageState::Queued { person, garment };
        let image = loop {
            state = match state {
                StageState::Blended { image } => break image,
                other => {
                    ctx.checkpoint()?;
                    let span = spans::stage(other.name());
                    self.step(ctx, lease, other).instrument(span).await?
                },
            };
        };

        if let Some(lease) = lease_slot.take() {
            if let Err(e) = lease.release().await {
                warn!(error = %e, "device recycle after job failed");
            }
        }
        self.finish(ctx, image).await
    }

    /// Wait for the gate, bounded by the gate timeout and the job deadline
    async fn acquire(&self, ctx: &mut JobContext) -> Result<GpuLease> {
        let remaining = ctx
            .deadline
            .saturating_duration_since(tokio::time::Instant::now());
        let deadline_binds = remaining < ctx.config.gate_timeout;
        let wait_limit = remaining.min(ctx.config.gate_timeout);
        let queued = Instant::now();

        let lease = match self.resources.acquire(wait_limit, &ctx.cancel).await {
            Ok(lease) => lease,
            Err(TryOnError::ResourceBusyTimeout { .. }) if deadline_binds => {
                return Err(ctx.timeout_error());
            },
            Err(e) => return Err(e),
        };
        ctx.timings.queue_wait_ms = elapsed_ms(queued);
        debug!(waited_ms = ctx.timings.queue_wait_ms, "gate acquired");
        Ok(lease)
    }

    async fn step(
        &self,
        ctx: &mut JobContext,
        lease: &GpuLease,
        state: StageState,
    ) -> Result<StageState> {
        match state {
            StageState::Queued { person, garment } => {
                self.segment(ctx, lease, person, garment).await
            },
            StageState::Segmented {
                person,
                garment,
                masks,
                face,
                pose,
                pose_started,
            } => {
                ctx.enter(ProcessingStage::Posing)?;
                let (width, height) = person.dimensions();
                let keypoints = ctx.bounded(pose.join()).await?.within_canvas(width, height);
                let pose_map =
                    render_pose_map(&keypoints, width, height, ctx.config.min_keypoint_confidence);
                ctx.timings.pose_ms = elapsed_ms(pose_started);
                debug!(
                    confident = keypoints.count_confident(ctx.config.min_keypoint_confidence),
                    "pose estimated"
                );
                Ok(StageState::Posed {
                    person,
                    garment,
                    masks,
                    face,
                    keypoints,
                    pose_map,
                })
            },
            StageState::Posed {
                person,
                garment,
                masks,
                face,
                keypoints,
                pose_map,
            } => {
                ctx.enter(ProcessingStage::Warping)?;
                let start = Instant::now();
                let engine = WarpEngine::new(WarpSettings::from(&ctx.config));
                let category = ctx.category();
                let canvas = person.dimensions();
                let garment_mask = masks.garment.clone();
                let warped = ctx
                    .bounded(offload(move || {
                        engine.warp(&garment, &keypoints, category, &garment_mask, canvas)
                    }))
                    .await?;
                if let Some(caveat) = warped.caveat {
                    ctx.caveat(caveat);
                }
                ctx.timings.warp_ms = elapsed_ms(start);
                Ok(StageState::Warped {
                    person,
                    masks,
                    face,
                    pose_map,
                    warped,
                })
            },
            StageState::Warped {
                person,
                masks,
                face,
                pose_map,
                warped,
            } => {
                ctx.enter(ProcessingStage::Inpainting)?;
                let start = Instant::now();
                let config = &ctx.config;
                let face_embedding = if config.face_identity_enabled {
                    face.and_then(|f| f.embedding)
                } else {
                    None
                };
                let request = InpaintRequest {
                    image: guide_composite(&person, &warped, &masks),
                    mask: masks.inpaint.to_gray_image(),
                    pose_map,
                    face_embedding,
                    category: ctx.category(),
                    params: GenerationParams {
                        steps: config.num_inference_steps,
                        guidance_scale: config.guidance_scale,
                        strength: config.inpaint_strength,
                        seed: config.seed,
                        identity_lock_scale: config.identity_lock_scale,
                    },
                };
                let generated = ctx
                    .bounded(lease.invoke(ModelKind::Inpaint, move |m| {
                        m.inpainter.inpaint(&request)
                    }))
                    .await?;
                let (width, height) = person.dimensions();
                let generated = conform(generated, width, height);
                ctx.timings.inpaint_ms = elapsed_ms(start);
                Ok(StageState::Inpainted {
                    person,
                    masks,
                    generated,
                })
            },
            StageState::Inpainted {
                person,
                masks,
                generated,
            } => {
                if !ctx.config.refiner_enabled {
                    return Ok(StageState::Refined {
                        person,
                        masks,
                        generated,
                    });
                }
                ctx.enter(ProcessingStage::Refining)?;
                let start = Instant::now();
                let strength = ctx.config.refiner_strength;
                let refined = ctx
                    .bounded(lease.invoke(ModelKind::Refine, move |m| {
                        let refiner = m.refiner.as_ref().ok_or_else(|| {
                            TryOnError::model_failure(ModelKind::Refine, "no refiner loaded")
                        })?;
                        refiner.refine(&generated, strength)
                    }))
                    .await?;
                let (width, height) = person.dimensions();
                ctx.timings.refine_ms = elapsed_ms(start);
                Ok(StageState::Refined {
                    generated: conform(refined, width, height),
                    person,
                    masks,
                })
            },
            StageState::Refined {
                person,
                masks,
                generated,
            } => {
                ctx.enter(ProcessingStage::Blending)?;
                let start = Instant::now();
                let compositor = Compositor::new(CompositeSettings::from(&ctx.config));
                let image = ctx
                    .bounded(offload(move || {
                        let composed = compositor.compose(&person, &generated, &masks)?;
                        Ok(compositor.finalize(composed))
                    }))
                    .await?;
                ctx.timings.blend_ms = elapsed_ms(start);
                Ok(StageState::Blended { image })
            },
            StageState::Blended { .. } => Err(TryOnError::internal("job already blended")),
        }
    }

    /// Segmentation, face analysis and mask construction, with pose in flight
    async fn segment(
        &self,
        ctx: &mut JobContext,
        lease: &GpuLease,
        person: RgbImage,
        garment: RgbImage,
    ) -> Result<StageState> {
        ctx.enter(ProcessingStage::Segmenting)?;
        let start = Instant::now();
        let (width, height) = person.dimensions();

        let pose_input = person.clone();
        let pose = lease.spawn(ModelKind::Pose, move |m| m.pose.estimate(&pose_input))?;
        let pose_started = Instant::now();

        let seg_input = person.clone();
        let segmentation = ctx
            .bounded(lease.invoke(ModelKind::Segmentation, move |m| {
                m.segmenter.segment(&seg_input)
            }))
            .await?;

        let face = if ctx.config.face_identity_enabled {
            let face_input = person.clone();
            let detected = ctx
                .bounded(lease.invoke(ModelKind::Face, move |m| m.face.analyze(&face_input)))
                .await?;
            let padding = ctx.config.face_mask_padding;
            match detected {
                Some(mut face) if !face.bbox.expand_clipped(0, width, height).is_empty() => {
                    face.bbox = face.bbox.expand_clipped(0, width, height);
                    if face.embedding.is_none() {
                        ctx.caveat(QualityCaveat::FaceEmbeddingUnavailable);
                    }
                    Some(face.with_padding(padding))
                },
                _ => match face_box_from_segmentation(&segmentation, width, height) {
                    Some(bbox) => {
                        ctx.caveat(QualityCaveat::FaceEmbeddingUnavailable);
                        Some(FaceRegion::from_segmentation(bbox).with_padding(padding))
                    },
                    None => {
                        ctx.caveat(QualityCaveat::FaceNotDetected);
                        None
                    },
                },
            }
        } else {
            ctx.caveat(QualityCaveat::IdentityFeaturesDisabled);
            None
        };

        let engine = MaskEngine::new(MaskSettings::from(&ctx.config));
        let masks = engine.build(&segmentation, face.as_ref(), ctx.category(), width, height)?;
        masks.verify()?;
        ctx.timings.segmentation_ms = elapsed_ms(start);

        Ok(StageState::Segmented {
            person,
            garment,
            masks,
            face,
            pose,
            pose_started,
        })
    }

    /// Hand the composite over and close the job
    async fn finish(&self, ctx: &mut JobContext, image: RgbImage) -> Result<TryOnResult> {
        let job_id = ctx.job.id();
        let stored = match &self.store {
            Some(store) => {
                let png = offload({
                    let image = image.clone();
                    move || encode_png(&image)
                })
                .await?;
                Some(store.put(job_id, png).await?)
            },
            None => None,
        };

        ctx.job.advance(ProcessingStage::Done)?;
        ctx.tracker.report_stage(ProcessingStage::Done);
        ctx.timings.total_ms = elapsed_ms(ctx.started);
        ctx.tracker.report_completion(&ctx.timings);
        info!(
            total_ms = ctx.timings.total_ms,
            queue_wait_ms = ctx.timings.queue_wait_ms,
            caveats = ctx.caveats.len(),
            stored = stored.is_some(),
            "job done"
        );

        Ok(TryOnResult {
            job_id,
            category: ctx.category(),
            image,
            caveats: std::mem::take(&mut ctx.caveats),
            timings: ctx.timings.clone(),
            stored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backends::mock::{garment_image, person_image, MockModels},
        config::JobOptions,
        error::ErrorKind,
    };

    const SIZE: u32 = 64;

    fn config() -> TryOnConfig {
        TryOnConfig::builder()
            .working_size(SIZE)
            .output_size(SIZE)
            .face_mask_padding(2)
            .feather_radius(2)
            .inpaint_dilation(2)
            .poisson_iterations(50)
            .build()
            .unwrap()
    }

    fn orchestrator(mocks: &MockModels) -> TryOnOrchestrator {
        let config = config();
        let resources = Arc::new(ResourceManager::new(mocks.model_set(), &config));
        TryOnOrchestrator::new(config, resources).unwrap()
    }

    fn request(category: GarmentCategory) -> TryOnRequest {
        TryOnRequest::new(person_image(SIZE, SIZE), garment_image(48, 64), category)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_upper_job_completes() {
        let mocks = MockModels::new(SIZE, SIZE);
        let result = orchestrator(&mocks)
            .run(request(GarmentCategory::Upper))
            .await
            .unwrap();

        assert_eq!(result.image.dimensions(), (SIZE, SIZE));
        assert_eq!(result.category, GarmentCategory::Upper);
        assert!(result.stored.is_none());
        assert_eq!(mocks.counters().inpaint_calls(), 1);
        assert_eq!(mocks.counters().refine_calls(), 0);
        assert!(!result.has_caveat(QualityCaveat::IdentityFeaturesDisabled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_job_reports_done() {
        let mocks = MockModels::new(SIZE, SIZE);
        let handle = orchestrator(&mocks)
            .spawn(request(GarmentCategory::Full).with_options(
                JobOptions::new(GarmentCategory::Full).refiner(0.2),
            ))
            .unwrap();
        let status = handle.subscribe();
        handle.wait().await.unwrap();

        let final_status = status.borrow().clone();
        assert_eq!(final_status.stage, ProcessingStage::Done);
        assert_eq!(final_status.progress, 100);
        assert_eq!(mocks.counters().refine_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refiner_without_model_is_rejected() {
        let mocks = MockModels::new(SIZE, SIZE).without_refiner();
        let err = orchestrator(&mocks)
            .run(request(GarmentCategory::Upper).with_options(
                JobOptions::new(GarmentCategory::Upper).refiner(0.2),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert_eq!(mocks.counters().total_calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_model_failure_fails_job_and_frees_gate() {
        let mocks = MockModels::new(SIZE, SIZE);
        mocks.fail_next(ModelKind::Segmentation, "parser crashed");
        let orchestrator = orchestrator(&mocks);

        let err = orchestrator
            .run(request(GarmentCategory::Upper))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelFailure);
        assert_eq!(orchestrator.resources().holders(), 0);
        assert_eq!(mocks.counters().inpaint_calls(), 0);

        orchestrator.run(request(GarmentCategory::Upper)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inpaint_output_is_conformed() {
        let mocks = MockModels::new(SIZE, SIZE).with_inpaint_output(96, 96);
        let result = orchestrator(&mocks)
            .run(request(GarmentCategory::Lower))
            .await
            .unwrap();
        assert_eq!(result.image.dimensions(), (SIZE, SIZE));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_result_dir_enables_store() {
        let dir = tempfile::tempdir().unwrap();
        let mocks = MockModels::new(SIZE, SIZE);
        let config = TryOnConfig {
            result_dir: Some(dir.path().to_path_buf()),
            ..config()
        };
        let resources = Arc::new(ResourceManager::new(mocks.model_set(), &config));
        let result = TryOnOrchestrator::new(config, resources)
            .unwrap()
            .run(request(GarmentCategory::Upper))
            .await
            .unwrap();

        let stored = result.stored.unwrap();
        assert!(dir.path().join(&stored.key).is_file());
    }

    #[test]
    fn test_conform_keeps_matching_size() {
        let image = RgbImage::from_pixel(8, 8, image::Rgb([1, 2, 3]));
        assert_eq!(conform(image.clone(), 8, 8), image);
        assert_eq!(conform(image, 4, 6).dimensions(), (4, 6));
    }
}
