//! Job records and caller-side handles

use crate::{
    error::{ErrorKind, Result, TryOnError},
    progress::ProcessingStage,
    types::{GarmentCategory, TryOnResult},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Failure recorded on a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Stage the job was in when it failed
    pub stage: ProcessingStage,
}

/// Observable snapshot of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub category: GarmentCategory,
    pub stage: ProcessingStage,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<JobFailure>,
}

/// One try-on request, owned by the orchestrator
///
/// The stage only moves forward through [`ProcessingStage::ORDER`], or to
/// `Failed`. Every change is published to subscribers.
#[derive(Debug)]
pub struct Job {
    id: Uuid,
    category: GarmentCategory,
    created_at: DateTime<Utc>,
    stage: ProcessingStage,
    progress: u8,
    error: Option<JobFailure>,
    publisher: watch::Sender<JobStatus>,
}

impl Job {
    /// Create a queued job and a receiver for its status
    #[must_use]
    pub fn new(id: Uuid, category: GarmentCategory) -> (Self, watch::Receiver<JobStatus>) {
        let now = Utc::now();
        let status = JobStatus {
            job_id: id,
            category,
            stage: ProcessingStage::Queued,
            progress: 0,
            created_at: now,
            updated_at: now,
            error: None,
        };
        let (publisher, receiver) = watch::channel(status);
        (
            Self {
                id,
                category,
                created_at: now,
                stage: ProcessingStage::Queued,
                progress: 0,
                error: None,
                publisher,
            },
            receiver,
        )
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn category(&self) -> GarmentCategory {
        self.category
    }

    #[must_use]
    pub fn stage(&self) -> ProcessingStage {
        self.stage
    }

    /// Move to a later stage
    pub fn advance(&mut self, next: ProcessingStage) -> Result<()> {
        if next == ProcessingStage::Failed || !self.stage.can_advance_to(next) {
            return Err(TryOnError::internal(format!(
                "illegal job transition {} -> {}",
                self.stage, next
            )));
        }
        self.stage = next;
        self.progress = next.progress_percentage();
        self.publish();
        Ok(())
    }

    /// Record a terminal failure; ignored once the job is terminal
    pub fn fail(&mut self, error: &TryOnError) {
        if self.stage.is_terminal() {
            return;
        }
        self.error = Some(JobFailure {
            kind: error.kind(),
            message: error.to_string(),
            stage: self.stage,
        });
        self.stage = ProcessingStage::Failed;
        self.publish();
    }

    #[must_use]
    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id,
            category: self.category,
            stage: self.stage,
            progress: self.progress,
            created_at: self.created_at,
            updated_at: Utc::now(),
            error: self.error.clone(),
        }
    }

    fn publish(&self) {
        // No subscribers left is fine
        let _ = self.publisher.send(self.status());
    }
}

/// Caller-side handle to a spawned job
#[derive(Debug)]
pub struct JobHandle {
    job_id: Uuid,
    status: watch::Receiver<JobStatus>,
    cancel: CancellationToken,
    task: JoinHandle<Result<TryOnResult>>,
}

impl JobHandle {
    pub(crate) fn new(
        job_id: Uuid,
        status: watch::Receiver<JobStatus>,
        cancel: CancellationToken,
        task: JoinHandle<Result<TryOnResult>>,
    ) -> Self {
        Self {
            job_id,
            status,
            cancel,
            task,
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.job_id
    }

    /// Latest published status
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    /// Independent receiver for status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status.clone()
    }

    /// Request cancellation; honoured while queued and at stage boundaries
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the job has left `Queued`, or ended
    pub async fn started(&mut self) -> JobStatus {
        let _ = self
            .status
            .wait_for(|s| s.stage != ProcessingStage::Queued)
            .await;
        self.status()
    }

    /// Wait for the job to finish
    pub async fn wait(self) -> Result<TryOnResult> {
        self.task
            .await
            .map_err(|e| TryOnError::internal(format!("job task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_advances_monotonically() {
        let (mut job, rx) = Job::new(Uuid::new_v4(), GarmentCategory::Upper);
        job.advance(ProcessingStage::Segmenting).unwrap();
        job.advance(ProcessingStage::Posing).unwrap();
        assert_eq!(rx.borrow().stage, ProcessingStage::Posing);
        assert_eq!(rx.borrow().progress, 25);

        let err = job.advance(ProcessingStage::Segmenting).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(job.stage(), ProcessingStage::Posing);
    }

    #[test]
    fn test_stages_may_be_skipped_forward() {
        let (mut job, _rx) = Job::new(Uuid::new_v4(), GarmentCategory::Full);
        job.advance(ProcessingStage::Inpainting).unwrap();
        job.advance(ProcessingStage::Blending).unwrap();
        job.advance(ProcessingStage::Done).unwrap();
        assert!(job.advance(ProcessingStage::Done).is_err());
    }

    #[test]
    fn test_failure_is_terminal_and_keeps_progress() {
        let (mut job, rx) = Job::new(Uuid::new_v4(), GarmentCategory::Lower);
        job.advance(ProcessingStage::Segmenting).unwrap();
        job.fail(&TryOnError::segmentation_empty("lower"));

        let status = rx.borrow().clone();
        assert_eq!(status.stage, ProcessingStage::Failed);
        assert_eq!(status.progress, 10);
        let failure = status.error.unwrap();
        assert_eq!(failure.kind, ErrorKind::SegmentationEmpty);
        assert_eq!(failure.stage, ProcessingStage::Segmenting);

        assert!(job.advance(ProcessingStage::Posing).is_err());
        job.fail(&TryOnError::Cancelled);
        assert_eq!(job.status().error.unwrap().kind, ErrorKind::SegmentationEmpty);
    }

    #[test]
    fn test_advancing_to_failed_requires_fail() {
        let (mut job, _rx) = Job::new(Uuid::new_v4(), GarmentCategory::Upper);
        assert!(job.advance(ProcessingStage::Failed).is_err());
    }
}
