//! Resource lifecycle manager
//!
//! Owns the resident model set and the single inference gate. A job holds a
//! [`GpuLease`] for as long as it may issue model calls; releasing the lease
//! waits for in-flight calls, recycles device memory and only then admits
//! the next FIFO waiter.

use crate::{
    config::{Device, Precision, TryOnConfig},
    error::{Result, TryOnError},
    inference::{ModelKind, ModelSet},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A model resident on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelHandle {
    pub kind: ModelKind,
    pub device: Device,
    pub precision: Precision,
    pub loaded_at: DateTime<Utc>,
}

/// Device memory counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub allocated_bytes: u64,
    pub reserved_bytes: u64,
    pub total_bytes: Option<u64>,
}

/// Device memory management hooks
pub trait DeviceController: Send + Sync {
    /// Free intermediate allocations left by the last job
    fn release_transient(&self) -> Result<()>;

    /// Drop every allocation outside the resident weights after a failure
    fn reset(&self) -> Result<()>;

    fn memory_stats(&self) -> MemoryStats;
}

/// CPU device, nothing to recycle
#[derive(Debug, Clone, Copy, Default)]
pub struct HostDevice;

impl DeviceController for HostDevice {
    fn release_transient(&self) -> Result<()> {
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        Ok(())
    }

    fn memory_stats(&self) -> MemoryStats {
        MemoryStats::default()
    }
}

/// Device controller that counts recycle operations
#[derive(Debug, Default)]
pub struct RecordingDevice {
    releases: AtomicUsize,
    resets: AtomicUsize,
}

impl RecordingDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl DeviceController for RecordingDevice {
    fn release_transient(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn memory_stats(&self) -> MemoryStats {
        MemoryStats {
            allocated_bytes: 0,
            reserved_bytes: 0,
            total_bytes: Some(0),
        }
    }
}

/// Load state of one model kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub kind: ModelKind,
    pub loaded: bool,
    pub loaded_at: Option<DateTime<Utc>>,
}

/// Snapshot for health endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub device: Device,
    pub precision: Precision,
    pub models: Vec<ModelStatus>,
    pub all_models_loaded: bool,
    /// A job currently holds the inference gate
    pub gate_busy: bool,
    pub waiting_jobs: usize,
    pub jobs_served: u64,
    pub memory: MemoryStats,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Counts a caller queued on the gate until it is dropped
struct QueueSlot<'a>(&'a AtomicUsize);

impl<'a> QueueSlot<'a> {
    fn enter(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::SeqCst);
        Self(waiting)
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owner of the resident models and the inference gate
pub struct ResourceManager {
    models: Arc<ModelSet>,
    controller: Arc<dyn DeviceController>,
    device: Device,
    precision: Precision,
    handles: Mutex<BTreeMap<ModelKind, ModelHandle>>,
    gate: Arc<Semaphore>,
    waiting: AtomicUsize,
    holders: AtomicUsize,
    max_holders: AtomicUsize,
    served: AtomicU64,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("device", &self.device)
            .field("precision", &self.precision)
            .field("waiting", &self.waiting())
            .field("holders", &self.holders())
            .finish_non_exhaustive()
    }
}

impl ResourceManager {
    /// Manager for `models` on the configured device, with host memory hooks
    #[must_use]
    pub fn new(models: ModelSet, config: &TryOnConfig) -> Self {
        Self {
            models: Arc::new(models),
            controller: Arc::new(HostDevice),
            device: config.device,
            precision: config.precision,
            handles: Mutex::new(BTreeMap::new()),
            gate: Arc::new(Semaphore::new(1)),
            waiting: AtomicUsize::new(0),
            holders: AtomicUsize::new(0),
            max_holders: AtomicUsize::new(0),
            served: AtomicU64::new(0),
        }
    }

    /// Replace the device memory hooks
    #[must_use]
    pub fn with_device_controller(mut self, controller: Arc<dyn DeviceController>) -> Self {
        self.controller = controller;
        self
    }

    #[must_use]
    pub fn models(&self) -> &ModelSet {
        &self.models
    }

    /// Jobs queued for the gate right now
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Jobs holding the gate right now
    #[must_use]
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous holders ever observed
    #[must_use]
    pub fn max_concurrent_holders(&self) -> usize {
        self.max_holders.load(Ordering::SeqCst)
    }

    /// Leases released since startup
    #[must_use]
    pub fn jobs_served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    /// Load every model eagerly instead of on first use
    pub async fn warm_up(self: &Arc<Self>) -> Result<()> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| TryOnError::internal("inference gate closed"))?;
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            for kind in manager.models.kinds() {
                manager.ensure_loaded(kind)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| TryOnError::internal(format!("warm-up task failed: {e}")))?
    }

    fn ensure_loaded(&self, kind: ModelKind) -> Result<()> {
        let mut handles = self
            .handles
            .lock()
            .map_err(|_| TryOnError::internal("model registry lock poisoned"))?;
        if handles.contains_key(&kind) {
            return Ok(());
        }
        let start = instant::Instant::now();
        self.models
            .warm_up(kind)
            .map_err(|e| into_model_failure(kind, e))?;
        info!(
            model = %kind,
            device = %self.device,
            precision = %self.precision,
            load_ms = start.elapsed().as_millis() as u64,
            "model loaded"
        );
        handles.insert(
            kind,
            ModelHandle {
                kind,
                device: self.device,
                precision: self.precision,
                loaded_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Handles of the models loaded so far
    #[must_use]
    pub fn handles(&self) -> Vec<ModelHandle> {
        self.handles
            .lock()
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Wait in FIFO order for the gate
    ///
    /// Fails with `ResourceBusyTimeout` after `wait_limit`, or `Cancelled`
    /// when `cancel` fires first.
    pub async fn acquire(
        self: &Arc<Self>,
        wait_limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<GpuLease> {
        let slot = QueueSlot::enter(&self.waiting);
        let start = instant::Instant::now();
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TryOnError::Cancelled),
            permit = tokio::time::timeout(wait_limit, Arc::clone(&self.gate).acquire_owned()) => {
                match permit {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(TryOnError::internal("inference gate closed")),
                    Err(_) => Err(TryOnError::ResourceBusyTimeout {
                        waited_ms: start.elapsed().as_millis() as u64,
                    }),
                }
            }
        };
        drop(slot);
        let permit = outcome?;

        let holders = self.holders.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_holders.fetch_max(holders, Ordering::SeqCst);
        debug!(
            waited_ms = start.elapsed().as_millis() as u64,
            "inference gate acquired"
        );

        Ok(GpuLease {
            state: Some(LeaseState {
                manager: Arc::clone(self),
                permit,
                in_flight: Arc::new(InFlight::default()),
                out_of_memory: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    /// Current load and device state
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let handles = self.handles.lock().map(|h| h.clone()).unwrap_or_default();
        let models: Vec<ModelStatus> = self
            .models
            .kinds()
            .into_iter()
            .map(|kind| ModelStatus {
                kind,
                loaded: handles.contains_key(&kind),
                loaded_at: handles.get(&kind).map(|h| h.loaded_at),
            })
            .collect();
        HealthReport {
            device: self.device,
            precision: self.precision,
            all_models_loaded: models.iter().all(|m| m.loaded),
            models,
            gate_busy: self.gate.available_permits() == 0,
            waiting_jobs: self.waiting(),
            jobs_served: self.jobs_served(),
            memory: self.controller.memory_stats(),
        }
    }
}

fn into_model_failure(kind: ModelKind, error: TryOnError) -> TryOnError {
    match error {
        e @ TryOnError::ModelFailure { .. } => e,
        other => TryOnError::model_failure(kind, other.to_string()),
    }
}

struct LeaseState {
    manager: Arc<ResourceManager>,
    permit: OwnedSemaphorePermit,
    in_flight: Arc<InFlight>,
    out_of_memory: Arc<AtomicBool>,
}

impl LeaseState {
    async fn recycle(self) -> Result<()> {
        self.in_flight.wait_idle().await;
        self.finish()
    }

    /// Recycle device memory, then hand the gate on
    fn finish(self) -> Result<()> {
        let manager = &self.manager;
        let outcome = if self.out_of_memory.load(Ordering::SeqCst) {
            warn!("resetting device after out-of-memory failure");
            manager.controller.reset()
        } else {
            manager.controller.release_transient()
        };
        if let Err(e) = &outcome {
            error!(error = %e, "device recycle failed");
        }
        manager.holders.fetch_sub(1, Ordering::SeqCst);
        manager.served.fetch_add(1, Ordering::SeqCst);
        drop(self.permit);
        debug!("inference gate released");
        outcome
    }
}

/// Proof of holding the inference gate
pub struct GpuLease {
    state: Option<LeaseState>,
}

impl std::fmt::Debug for GpuLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuLease")
            .field("held", &self.state.is_some())
            .finish()
    }
}

/// A model call running on the blocking pool
pub struct ModelCall<T> {
    kind: ModelKind,
    handle: tokio::task::JoinHandle<Result<T>>,
}

impl<T> ModelCall<T> {
    /// Wait for the call to finish
    pub async fn join(self) -> Result<T> {
        self.handle.await.map_err(|e| {
            TryOnError::model_failure(self.kind, format!("model call aborted: {e}"))
        })?
    }
}

impl GpuLease {
    fn state(&self) -> Result<&LeaseState> {
        self.state
            .as_ref()
            .ok_or_else(|| TryOnError::internal("lease already released"))
    }

    /// Start a blocking model call without waiting for it
    ///
    /// The lease will not hand the gate on until the call has returned.
    pub fn spawn<T, F>(&self, kind: ModelKind, call: F) -> Result<ModelCall<T>>
    where
        T: Send + 'static,
        F: FnOnce(&ModelSet) -> Result<T> + Send + 'static,
    {
        let state = self.state()?;
        let manager = Arc::clone(&state.manager);
        let guard = state.in_flight.enter();
        let oom = Arc::clone(&state.out_of_memory);
        debug!(model = %kind, "model call started");

        let handle = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            manager.ensure_loaded(kind)?;
            call(&manager.models).map_err(|e| {
                let e = into_model_failure(kind, e);
                if e.is_out_of_memory() {
                    oom.store(true, Ordering::SeqCst);
                }
                e
            })
        });
        Ok(ModelCall { kind, handle })
    }

    /// Run a blocking model call to completion
    pub async fn invoke<T, F>(&self, kind: ModelKind, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ModelSet) -> Result<T> + Send + 'static,
    {
        self.spawn(kind, call)?.join().await
    }

    /// Whether a call under this lease ran the device out of memory
    #[must_use]
    pub fn out_of_memory(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.out_of_memory.load(Ordering::SeqCst))
    }

    /// Wait for in-flight calls, recycle device memory and admit the next waiter
    pub async fn release(mut self) -> Result<()> {
        match self.state.take() {
            Some(state) => state.recycle().await,
            None => Ok(()),
        }
    }
}

impl Drop for GpuLease {
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        warn!("inference lease dropped without release");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = state.recycle().await;
                });
            },
            Err(_) => {
                let _ = state.finish();
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::MockModels;

    fn manager(device: Arc<RecordingDevice>) -> Arc<ResourceManager> {
        let models = MockModels::new(32, 32).model_set();
        Arc::new(
            ResourceManager::new(models, &TryOnConfig::default()).with_device_controller(device),
        )
    }

    #[tokio::test]
    async fn test_release_recycles_and_admits_next() {
        let device = Arc::new(RecordingDevice::new());
        let manager = manager(Arc::clone(&device));
        let cancel = CancellationToken::new();

        let lease = manager.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        assert_eq!(manager.holders(), 1);
        assert!(manager.health().gate_busy);
        lease.release().await.unwrap();

        assert_eq!(device.release_count(), 1);
        assert_eq!(device.reset_count(), 0);
        assert_eq!(manager.holders(), 0);
        assert_eq!(manager.jobs_served(), 1);

        let again = manager.acquire(Duration::from_millis(50), &cancel).await.unwrap();
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_waiter_times_out() {
        let manager = manager(Arc::new(RecordingDevice::new()));
        let cancel = CancellationToken::new();
        let lease = manager.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        let err = manager
            .acquire(Duration::from_millis(30), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ResourceBusyTimeout);
        assert_eq!(manager.waiting(), 0);
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let manager = manager(Arc::new(RecordingDevice::new()));
        let holder_cancel = CancellationToken::new();
        let lease = manager.acquire(Duration::from_secs(1), &holder_cancel).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = manager.acquire(Duration::from_secs(5), &cancel).await.unwrap_err();
        assert!(matches!(err, TryOnError::Cancelled));
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_waiter_leaves_queue() {
        let manager = manager(Arc::new(RecordingDevice::new()));
        let cancel = CancellationToken::new();
        let lease = manager.acquire(Duration::from_secs(1), &cancel).await.unwrap();

        // The caller stops polling while still queued
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            manager.acquire(Duration::from_secs(5), &cancel),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(manager.waiting(), 0);

        lease.release().await.unwrap();
        assert_eq!(manager.health().waiting_jobs, 0);
        let next = manager.acquire(Duration::from_millis(50), &cancel).await.unwrap();
        next.release().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_out_of_memory_resets_device() {
        let device = Arc::new(RecordingDevice::new());
        let mocks = MockModels::new(32, 32);
        mocks.fail_inpaint_with_oom();
        let manager = Arc::new(
            ResourceManager::new(mocks.model_set(), &TryOnConfig::default())
                .with_device_controller(Arc::clone(&device) as Arc<dyn DeviceController>),
        );
        let lease = manager
            .acquire(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();

        let request = crate::backends::mock::blank_inpaint_request(32, 32);
        let err = lease
            .invoke(ModelKind::Inpaint, move |m| m.inpainter.inpaint(&request))
            .await
            .unwrap_err();
        assert!(err.is_out_of_memory());
        assert!(lease.out_of_memory());

        lease.release().await.unwrap();
        assert_eq!(device.reset_count(), 1);
        assert_eq!(device.release_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_release_waits_for_spawned_calls() {
        let mocks = MockModels::new(32, 32).with_latency(Duration::from_millis(80));
        let manager = Arc::new(ResourceManager::new(mocks.model_set(), &TryOnConfig::default()));
        let lease = manager
            .acquire(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        let image = image::RgbImage::new(32, 32);
        let _pending = lease
            .spawn(ModelKind::Pose, move |m| m.pose.estimate(&image))
            .unwrap();

        lease.release().await.unwrap();
        assert_eq!(mocks.counters().pose_calls(), 1);
        assert_eq!(manager.holders(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_models_load_lazily_once() {
        let mocks = MockModels::new(32, 32);
        let manager = Arc::new(ResourceManager::new(mocks.model_set(), &TryOnConfig::default()));
        assert!(!manager.health().all_models_loaded);

        let lease = manager
            .acquire(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        for _ in 0..2 {
            let image = image::RgbImage::new(32, 32);
            lease
                .invoke(ModelKind::Segmentation, move |m| m.segmenter.segment(&image))
                .await
                .unwrap();
        }
        lease.release().await.unwrap();

        let health = manager.health();
        let seg = health
            .models
            .iter()
            .find(|m| m.kind == ModelKind::Segmentation)
            .unwrap();
        assert!(seg.loaded);
        assert_eq!(mocks.counters().warm_ups(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_warm_up_loads_everything() {
        let manager = manager(Arc::new(RecordingDevice::new()));
        manager.warm_up().await.unwrap();
        assert!(manager.health().all_models_loaded);
        assert_eq!(manager.handles().len(), 5);
    }

    #[tokio::test]
    async fn test_dropped_lease_frees_gate() {
        let manager = manager(Arc::new(RecordingDevice::new()));
        let cancel = CancellationToken::new();
        let lease = manager.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        drop(lease);
        let next = manager.acquire(Duration::from_secs(1), &cancel).await.unwrap();
        next.release().await.unwrap();
    }
}
