//! Process-facing entry point.
//!
//! The coordinator owns the queue and the per-device worker
//! lifecycles. Devices progress independently: each worker runs on
//! its own supervised thread, and a crash in one never stops the
//! others.

use crate::applier::RemoteApplier;
use crate::config::EngineConfig;
use crate::error::SyncResult;
use crate::queue::{Escalation, PendingEntry, SyncQueue};
use crate::worker::{DrainReport, SyncWorker};
use fieldsync_protocol::{DeviceId, OperationId, OperationType, Payload};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Owns queues and workers across devices.
pub struct SyncCoordinator {
    queue: Arc<SyncQueue>,
    applier: Arc<dyn RemoteApplier>,
    config: EngineConfig,
    stop: Arc<AtomicBool>,
    running: AtomicBool,
    workers: Mutex<HashMap<DeviceId, JoinHandle<()>>>,
}

impl SyncCoordinator {
    /// Creates a coordinator over a queue and a remote-apply
    /// capability.
    pub fn new(queue: SyncQueue, applier: Arc<dyn RemoteApplier>, config: EngineConfig) -> Self {
        Self {
            queue: Arc::new(queue),
            applier,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying queue.
    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Durably records an operation and returns its id immediately,
    /// without waiting for remote application.
    pub fn submit(
        &self,
        device: &DeviceId,
        op_type: OperationType,
        payload: Payload,
    ) -> SyncResult<OperationId> {
        let record = self.queue.enqueue(device, op_type, payload)?;
        if self.running.load(Ordering::SeqCst) {
            self.ensure_worker(device)?;
        }
        Ok(record.id)
    }

    /// Status report for a device's operations, including terminal
    /// Failed/ManualReview markers.
    pub fn pending_for(&self, device: &DeviceId) -> Vec<PendingEntry> {
        self.queue.pending_for(device)
    }

    /// All conflicts escalated for manual review.
    pub fn escalations(&self) -> Vec<Escalation> {
        self.queue.escalations()
    }

    /// Starts one supervised worker per device with outstanding work.
    ///
    /// Devices that first appear in later `submit` calls get their
    /// worker spawned at submit time.
    pub fn run_workers(&self) -> SyncResult<()> {
        self.running.store(true, Ordering::SeqCst);
        for device in self.queue.devices() {
            self.ensure_worker(&device)?;
        }
        Ok(())
    }

    fn ensure_worker(&self, device: &DeviceId) -> SyncResult<()> {
        let mut workers = self.workers.lock();
        if let Some(handle) = workers.get(device) {
            if !handle.is_finished() {
                return Ok(());
            }
        }

        let worker = SyncWorker::new(
            device.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.applier),
            self.config.clone(),
            Arc::clone(&self.stop),
        );
        let stop = Arc::clone(&self.stop);
        let device_name = device.clone();

        let handle = std::thread::Builder::new()
            .name(format!("fieldsync-{device}"))
            .spawn(move || loop {
                let result = catch_unwind(AssertUnwindSafe(|| worker.run()));
                if result.is_ok() || stop.load(Ordering::SeqCst) {
                    break;
                }
                tracing::error!(device = %device_name, "worker panicked, restarting");
            })?;

        workers.insert(device.clone(), handle);
        Ok(())
    }

    /// Synchronously processes every currently runnable record to
    /// quiescence and reports the counts.
    ///
    /// Records requeued with a still-future backoff are left for a
    /// later pass.
    pub fn drain_once(&self) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();
        for device in self.queue.devices() {
            let worker = SyncWorker::new(
                device,
                Arc::clone(&self.queue),
                Arc::clone(&self.applier),
                self.config.clone(),
                Arc::clone(&self.stop),
            );
            report.merge(&worker.drain()?);
        }
        Ok(report)
    }

    /// Cooperatively stops all workers and joins their threads.
    ///
    /// Workers stop between state-machine steps; an in-flight remote
    /// call completes first.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.queue.notify_all();

        let handles: Vec<_> = self.workers.lock().drain().collect();
        for (device, handle) in handles {
            if handle.join().is_err() {
                tracing::error!(device = %device, "worker thread panicked during shutdown");
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
