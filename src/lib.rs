#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # Try-On Compose
//!
//! Orchestration and compositing core for identity-preserving virtual
//! try-on. Given a person photo and a garment photo, the pipeline segments
//! the person, estimates pose, warps the garment onto the body, asks a
//! diffusion inpainter to render the garment region, and composites the
//! result back into the original photo so that the face is bit-for-bit the
//! person's own.
//!
//! The models themselves are external collaborators behind the traits in
//! [`inference`]. This crate owns what happens around them: masks, warping,
//! blending, face restoration, the single-GPU inference gate, the job state
//! machine, deadlines and cancellation.
//!
//! ## Features
//!
//! - **Mask Engine**: garment and face-exclusion masks that are disjoint by construction
//! - **Warp Engine**: affine fit plus thin-plate spline refinement, with affine fallback
//! - **Compositing**: Poisson cloning, feathered face restoration, histogram matching
//! - **Resource Gate**: FIFO single-holder GPU lease with device recycling after each job
//! - **Job Tracking**: observable stage and progress, cancellation, whole-job deadline
//! - **Tract Backend**: pure Rust ONNX human parsing (enable with `tract` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tryon_compose::{
//!     backends::MockModels, GarmentCategory, ResourceManager, TryOnConfig, TryOnOrchestrator,
//!     TryOnRequest,
//! };
//!
//! # async fn example(person: image::RgbImage, garment: image::RgbImage) -> anyhow::Result<()> {
//! let config = TryOnConfig::from_env()?;
//! let models = MockModels::new(config.working_size, config.working_size).model_set();
//! let resources = Arc::new(ResourceManager::new(models, &config));
//! resources.warm_up().await?;
//!
//! let orchestrator = TryOnOrchestrator::new(config, resources)?;
//! let result = orchestrator
//!     .run(TryOnRequest::new(person, garment, GarmentCategory::Upper))
//!     .await?;
//! result.save_png("tryon.png")?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `tract` (default): Pure Rust ONNX segmentation backend
//! - `tracing-init` (default): subscriber setup helpers in [`tracing_config`]
//! - `tracing-json`: JSON log output
//! - `webp-support` (default): WebP uploads

pub mod api;
pub mod backends;
pub mod composite;
pub mod config;
pub mod error;
pub mod geometry;
pub mod inference;
pub mod job;
pub mod mask;
pub mod orchestrator;
pub mod progress;
pub mod resources;
pub mod storage;
pub mod tracing_config;
pub mod types;
pub mod utils;
pub mod warp;

// Public API exports
pub use api::{ErrorBody, HealthBody, TryOnRequest, TryOnResponse};
pub use composite::Compositor;
pub use config::{Device, JobOptions, Precision, TryOnConfig, TryOnConfigBuilder};
pub use error::{ErrorKind, Result, TryOnError};
pub use geometry::{BodyPart, BoundingBox, Keypoint, KeypointSet};
pub use inference::{
    FaceAnalyzer, Inpainter, InpaintRequest, ModelKind, ModelSet, PoseEstimator, Refiner,
    Segmenter,
};
pub use job::{JobHandle, JobStatus};
pub use mask::{BinaryMask, MaskEngine, MaskSet, SoftMask};
pub use orchestrator::TryOnOrchestrator;
pub use progress::{
    ConsoleProgressReporter, NoOpProgressReporter, ProcessingStage, ProgressReporter,
    ProgressTracker, ProgressUpdate,
};
pub use resources::{DeviceController, GpuLease, HealthReport, ResourceManager};
pub use storage::{FilesystemStore, ResultStore, StoredResult};
pub use types::{
    FaceRegion, GarmentCategory, ProcessingTimings, QualityCaveat, SegmentationMap, TryOnResult,
};
pub use warp::WarpEngine;

#[cfg(feature = "tracing-init")]
pub use tracing_config::{init_library_tracing, TracingConfig, TracingFormat};

/// Run a try-on job from raw upload bytes
///
/// Decodes and validates both images against the orchestrator's upload
/// limit, then runs the job to completion.
///
/// # Examples
///
/// ```rust,no_run
/// use tryon_compose::{try_on_from_bytes, TryOnOrchestrator};
///
/// # async fn example(orchestrator: TryOnOrchestrator, person: Vec<u8>, garment: Vec<u8>) -> anyhow::Result<()> {
/// let result = try_on_from_bytes(&orchestrator, &person, &garment, "upper").await?;
/// let png = result.to_png_bytes()?;
/// # Ok(())
/// # }
/// ```
pub async fn try_on_from_bytes(
    orchestrator: &TryOnOrchestrator,
    person_image: &[u8],
    clothing_image: &[u8],
    category: &str,
) -> Result<TryOnResult> {
    let request = TryOnRequest::from_parts_with_limit(
        person_image,
        clothing_image,
        category,
        orchestrator.config().max_upload_bytes,
    )?;
    orchestrator.run(request).await
}
