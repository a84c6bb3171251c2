//! Progress reporting for try-on jobs
//!
//! Stage changes are pushed to a [`ProgressReporter`] so frontends can show
//! liveness for what is otherwise a single blocking call.

use crate::types::ProcessingTimings;
use instant::Instant;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Pipeline stages in execution order, plus the failure state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    /// Accepted, waiting for the inference gate
    Queued,
    /// Segmentation and face analysis
    Segmenting,
    /// Pose estimation and pose-map rendering
    Posing,
    /// Garment alignment
    Warping,
    /// Diffusion inpainting
    Inpainting,
    /// Optional texture refinement
    Refining,
    /// Compositing into the original photo
    Blending,
    /// Result handed to the caller
    Done,
    /// Terminal failure
    Failed,
}

impl ProcessingStage {
    /// Non-failure stages in the only order a job may visit them
    pub const ORDER: [Self; 8] = [
        Self::Queued,
        Self::Segmenting,
        Self::Posing,
        Self::Warping,
        Self::Inpainting,
        Self::Refining,
        Self::Blending,
        Self::Done,
    ];

    /// Get a human-readable description of the processing stage
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Queued => "Waiting for inference gate",
            Self::Segmenting => "Segmenting person and locating face",
            Self::Posing => "Estimating body pose",
            Self::Warping => "Warping garment to body",
            Self::Inpainting => "Generating garment region",
            Self::Refining => "Refining texture",
            Self::Blending => "Blending into original photo",
            Self::Done => "Try-on completed",
            Self::Failed => "Try-on failed",
        }
    }

    /// Fixed progress percentage reported when the stage starts
    #[must_use]
    pub fn progress_percentage(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Segmenting => 10,
            Self::Posing => 25,
            Self::Warping => 40,
            Self::Inpainting => 55,
            Self::Refining => 70,
            Self::Blending => 85,
            Self::Done | Self::Failed => 100,
        }
    }

    /// Position in [`Self::ORDER`], `None` for `Failed`
    #[must_use]
    pub fn ordinal(&self) -> Option<usize> {
        Self::ORDER.iter().position(|s| s == self)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether a job in `self` may move to `next`
    #[must_use]
    pub fn can_advance_to(&self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Self::Failed {
            return true;
        }
        match (self.ordinal(), next.ordinal()) {
            (Some(from), Some(to)) => to > from,
            _ => false,
        }
    }
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Segmenting => "segmenting",
            Self::Posing => "posing",
            Self::Warping => "warping",
            Self::Inpainting => "inpainting",
            Self::Refining => "refining",
            Self::Blending => "blending",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Progress update containing stage and timing information
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_id: Uuid,
    pub stage: ProcessingStage,
    /// Progress percentage (0-100)
    pub progress: u8,
    pub description: String,
    /// Elapsed time since the job was accepted (milliseconds)
    pub elapsed_ms: u64,
}

impl ProgressUpdate {
    #[must_use]
    pub fn new(job_id: Uuid, stage: ProcessingStage, start_time: Instant) -> Self {
        Self {
            job_id,
            progress: stage.progress_percentage(),
            description: stage.description().to_string(),
            elapsed_ms: start_time.elapsed().as_millis() as u64,
            stage,
        }
    }
}

/// Trait for reporting progress during try-on jobs
pub trait ProgressReporter: Send + Sync {
    /// Report a stage change
    fn report_progress(&self, update: ProgressUpdate);

    /// Report a finished job with its timings
    fn report_completion(&self, job_id: Uuid, timings: &ProcessingTimings);

    /// Report a failure in `stage`
    fn report_error(&self, job_id: Uuid, stage: ProcessingStage, error: &str);
}

/// Discards every report
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn report_progress(&self, _update: ProgressUpdate) {}

    fn report_completion(&self, _job_id: Uuid, _timings: &ProcessingTimings) {}

    fn report_error(&self, _job_id: Uuid, _stage: ProcessingStage, _error: &str) {}
}

/// Logs progress through the `log` facade
#[derive(Debug, Clone, Copy)]
pub struct ConsoleProgressReporter {
    verbose: bool,
}

impl ConsoleProgressReporter {
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressReporter for ConsoleProgressReporter {
    fn report_progress(&self, update: ProgressUpdate) {
        if self.verbose {
            log::info!(
                "[{}] [{}%] {} ({}ms elapsed)",
                update.job_id,
                update.progress,
                update.description,
                update.elapsed_ms
            );
        } else {
            log::info!("[{}%] {}", update.progress, update.description);
        }
    }

    fn report_completion(&self, job_id: Uuid, timings: &ProcessingTimings) {
        log::info!("Try-on {} completed in {}ms", job_id, timings.total_ms);

        if self.verbose {
            log::info!("  Queue wait: {}ms", timings.queue_wait_ms);
            log::info!("  Segmentation: {}ms", timings.segmentation_ms);
            log::info!("  Pose: {}ms", timings.pose_ms);
            log::info!("  Warp: {}ms", timings.warp_ms);
            log::info!("  Inpainting: {}ms", timings.inpaint_ms);
            log::info!("  Refinement: {}ms", timings.refine_ms);
            log::info!("  Blending: {}ms", timings.blend_ms);
        }
    }

    fn report_error(&self, job_id: Uuid, stage: ProcessingStage, error: &str) {
        log::error!("Try-on {} failed during {}: {}", job_id, stage, error);
    }
}

/// Per-job progress bookkeeping in front of a shared reporter
pub struct ProgressTracker {
    reporter: Arc<dyn ProgressReporter>,
    job_id: Uuid,
    start_time: Instant,
    current_stage: ProcessingStage,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(reporter: Arc<dyn ProgressReporter>, job_id: Uuid, start_time: Instant) -> Self {
        Self {
            reporter,
            job_id,
            start_time,
            current_stage: ProcessingStage::Queued,
        }
    }

    /// Tracker that reports nowhere
    #[must_use]
    pub fn no_op(job_id: Uuid) -> Self {
        Self::new(Arc::new(NoOpProgressReporter), job_id, Instant::now())
    }

    pub fn report_stage(&mut self, stage: ProcessingStage) {
        self.current_stage = stage;
        self.reporter
            .report_progress(ProgressUpdate::new(self.job_id, stage, self.start_time));
    }

    pub fn report_completion(&self, timings: &ProcessingTimings) {
        self.reporter.report_completion(self.job_id, timings);
    }

    /// Report a failure in the last reported stage
    pub fn report_error(&self, error: &str) {
        self.reporter
            .report_error(self.job_id, self.current_stage, error);
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    #[must_use]
    pub fn current_stage(&self) -> ProcessingStage {
        self.current_stage
    }
}
