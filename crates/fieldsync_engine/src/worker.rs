//! Per-device sync worker.
//!
//! A worker drains one device's queue: fetch the oldest runnable
//! record, apply it remotely, and report the outcome back to the
//! queue. One worker per device is the mechanism that preserves
//! per-device causal order.

use crate::applier::{ApplyOutcome, RemoteApplier};
use crate::config::EngineConfig;
use crate::error::SyncResult;
use crate::queue::{AttemptOutcome, Disposition, SyncQueue};
use fieldsync_protocol::{DeviceId, OperationRecord};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on a single park before re-checking for work and the
/// stop flag.
const PARK_INTERVAL: Duration = Duration::from_millis(500);

/// Pause after an engine-level step error, to avoid a hot loop on a
/// persistently failing journal.
const ERROR_PAUSE: Duration = Duration::from_millis(100);

/// The current state of a worker's per-record state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Parked; no runnable record.
    Idle,
    /// Fetching the next pending record.
    Fetching,
    /// Applying a record remotely.
    Applying,
    /// Settling a successful or superseded record.
    Committing,
    /// Requeueing a record after a transient failure.
    Retrying,
    /// Escalating a conflict to manual review.
    Escalating,
    /// Dead-lettering a record.
    DeadLettering,
}

impl WorkerState {
    /// Returns true while the worker is processing a record.
    pub fn is_active(&self) -> bool {
        !matches!(self, WorkerState::Idle)
    }
}

/// What one worker step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing runnable right now.
    Parked,
    /// A record was applied remotely.
    Applied,
    /// A record was superseded by the remote version.
    Superseded,
    /// A record was requeued with backoff.
    Retried,
    /// A record was escalated to manual review.
    Escalated,
    /// A record was dead-lettered.
    DeadLettered,
}

/// Counts from a drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Records applied or superseded.
    pub succeeded: u64,
    /// Transient requeues performed.
    pub retried: u64,
    /// Records escalated to manual review.
    pub escalated: u64,
    /// Records dead-lettered.
    pub failed: u64,
}

impl DrainReport {
    /// Accumulates another report into this one.
    pub fn merge(&mut self, other: &DrainReport) {
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.escalated += other.escalated;
        self.failed += other.failed;
    }
}

/// A worker bound to one device's queue.
pub struct SyncWorker {
    device: DeviceId,
    queue: Arc<SyncQueue>,
    applier: Arc<dyn RemoteApplier>,
    config: EngineConfig,
    state: RwLock<WorkerState>,
    stop: Arc<AtomicBool>,
}

impl SyncWorker {
    /// Creates a worker for a device.
    ///
    /// `stop` is the cooperative cancellation flag, checked between
    /// state-machine steps; an in-flight remote call is allowed to
    /// finish.
    pub fn new(
        device: DeviceId,
        queue: Arc<SyncQueue>,
        applier: Arc<dyn RemoteApplier>,
        config: EngineConfig,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            device,
            queue,
            applier,
            config,
            state: RwLock::new(WorkerState::Idle),
            stop,
        }
    }

    /// The device this worker serves.
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    /// The worker's current state.
    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.write() = state;
    }

    /// Runs one attempt against the remote applier and classifies the
    /// result.
    ///
    /// A panicking applier is contained here as a transient failure;
    /// otherwise the record would be stranded InFlight.
    fn attempt(&self, record: &OperationRecord) -> AttemptOutcome {
        let applied = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.applier.apply(record, self.config.apply_timeout)
        }));
        let Ok(result) = applied else {
            tracing::error!(id = %record.id, "applier panicked during apply");
            return AttemptOutcome::TransientFailure;
        };
        match result {
            Ok(ApplyOutcome::Applied) => AttemptOutcome::Success,
            Ok(ApplyOutcome::Rejected { reason, permanent }) => {
                if permanent {
                    tracing::warn!(id = %record.id, reason, "operation rejected permanently");
                    AttemptOutcome::PermanentFailure
                } else {
                    tracing::debug!(id = %record.id, reason, "transient rejection");
                    AttemptOutcome::TransientFailure
                }
            }
            Ok(ApplyOutcome::Conflict(remote)) => AttemptOutcome::ConflictDetected(remote),
            Err(e) if e.is_transient() => {
                tracing::debug!(id = %record.id, error = %e, "transient apply error");
                AttemptOutcome::TransientFailure
            }
            Err(e) => {
                tracing::warn!(id = %record.id, error = %e, "fatal apply error");
                AttemptOutcome::PermanentFailure
            }
        }
    }

    /// Performs one fetch-apply-settle cycle.
    pub fn step(&self) -> SyncResult<StepOutcome> {
        self.set_state(WorkerState::Fetching);
        let Some(record) = self.queue.next_pending(&self.device)? else {
            self.set_state(WorkerState::Idle);
            return Ok(StepOutcome::Parked);
        };

        let mut forced = false;
        loop {
            self.set_state(WorkerState::Applying);
            let mut outcome = self.attempt(&record);

            // A forced re-apply that conflicts again is bounded by the
            // normal retry cap instead of looping on the resolver.
            if forced && matches!(outcome, AttemptOutcome::ConflictDetected(_)) {
                outcome = AttemptOutcome::TransientFailure;
            }

            let step = match self.queue.mark_result(&record.id, outcome)? {
                Disposition::Reapply => {
                    forced = true;
                    continue;
                }
                Disposition::Done => {
                    self.set_state(WorkerState::Committing);
                    StepOutcome::Applied
                }
                Disposition::Superseded => {
                    self.set_state(WorkerState::Committing);
                    StepOutcome::Superseded
                }
                Disposition::RetryAt(_) => {
                    self.set_state(WorkerState::Retrying);
                    StepOutcome::Retried
                }
                Disposition::Escalated => {
                    self.set_state(WorkerState::Escalating);
                    StepOutcome::Escalated
                }
                Disposition::DeadLettered => {
                    self.set_state(WorkerState::DeadLettering);
                    StepOutcome::DeadLettered
                }
            };
            self.set_state(WorkerState::Idle);
            return Ok(step);
        }
    }

    /// Steps until the device has no currently runnable record, then
    /// returns the counters.
    ///
    /// Records whose backoff has not yet elapsed are left for a later
    /// pass.
    pub fn drain(&self) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();
        while !self.stop.load(Ordering::SeqCst) {
            match self.step()? {
                StepOutcome::Parked => break,
                StepOutcome::Applied | StepOutcome::Superseded => report.succeeded += 1,
                StepOutcome::Retried => report.retried += 1,
                StepOutcome::Escalated => report.escalated += 1,
                StepOutcome::DeadLettered => report.failed += 1,
            }
        }
        Ok(report)
    }

    /// Runs until the stop flag is set, parking between bursts of
    /// work.
    ///
    /// Per-record failures are contained by `step`; engine-level
    /// errors (journal I/O) are logged and the loop continues, so one
    /// device's trouble never halts the process.
    pub fn run(&self) {
        tracing::debug!(device = %self.device, "worker started");
        while !self.stop.load(Ordering::SeqCst) {
            match self.step() {
                Ok(StepOutcome::Parked) => {
                    if self.stop.load(Ordering::SeqCst) {
                        break;
                    }
                    self.queue.park(&self.device, PARK_INTERVAL);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(device = %self.device, error = %e, "worker step failed");
                    self.queue.park(&self.device, ERROR_PAUSE);
                }
            }
        }
        self.set_state(WorkerState::Idle);
        tracing::debug!(device = %self.device, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::MockApplier;
    use crate::config::RetryPolicy;
    use crate::error::SyncError;
    use crate::journal::{Journal, JournalContents, JournalFrame, MemoryJournal};
    use crate::queue::Escalation;
    use fieldsync_protocol::{
        OperationId, OperationStatus, OperationType, Payload, Timestamp,
    };
    use std::sync::atomic::AtomicU32;

    /// Journal wrapper whose nth `update` call fails.
    struct BlinkingJournal {
        inner: MemoryJournal,
        updates_seen: AtomicU32,
        fail_at: u32,
    }

    impl BlinkingJournal {
        fn failing_at(fail_at: u32) -> Self {
            Self {
                inner: MemoryJournal::new(),
                updates_seen: AtomicU32::new(0),
                fail_at,
            }
        }
    }

    impl Journal for BlinkingJournal {
        fn append(&self, record: &OperationRecord) -> crate::SyncResult<()> {
            self.inner.append(record)
        }

        fn update(
            &self,
            id: &OperationId,
            status: OperationStatus,
            retry_count: u32,
        ) -> crate::SyncResult<()> {
            let n = self.updates_seen.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_at {
                return Err(SyncError::Io(std::io::Error::other("journal unavailable")));
            }
            self.inner.update(id, status, retry_count)
        }

        fn escalate(&self, escalation: &Escalation) -> crate::SyncResult<()> {
            self.inner.escalate(escalation)
        }

        fn rewrite(&self, frames: &[JournalFrame]) -> crate::SyncResult<()> {
            self.inner.rewrite(frames)
        }

        fn load(&self) -> crate::SyncResult<JournalContents> {
            self.inner.load()
        }
    }

    struct Fixture {
        queue: Arc<SyncQueue>,
        applier: Arc<MockApplier>,
        worker: SyncWorker,
        device: DeviceId,
    }

    fn fixture(device: &str, retry: RetryPolicy) -> Fixture {
        let device = DeviceId::new(device);
        let queue = Arc::new(SyncQueue::new(Arc::new(MemoryJournal::new()), retry));
        let applier = Arc::new(MockApplier::new());
        let worker = SyncWorker::new(
            device.clone(),
            Arc::clone(&queue),
            Arc::clone(&applier) as Arc<dyn RemoteApplier>,
            EngineConfig::new(),
            Arc::new(AtomicBool::new(false)),
        );
        Fixture {
            queue,
            applier,
            worker,
            device,
        }
    }

    fn submit(fx: &Fixture) -> OperationId {
        fx.queue
            .enqueue(&fx.device, OperationType::UpdateVisit, Payload::new())
            .unwrap()
            .id
    }

    fn remote_conflict(created_ms: u64) -> SyncResult<ApplyOutcome> {
        Ok(ApplyOutcome::Conflict(OperationRecord::new(
            OperationId::new(DeviceId::new("SERVER"), 1),
            OperationType::UpdateVisit,
            Payload::new(),
            Timestamp::from_millis(created_ms),
        )))
    }

    #[test]
    fn empty_queue_parks() {
        let fx = fixture("TECH-1", RetryPolicy::default());
        assert_eq!(fx.worker.step().unwrap(), StepOutcome::Parked);
        assert_eq!(fx.worker.state(), WorkerState::Idle);
    }

    #[test]
    fn successful_apply_commits() {
        let fx = fixture("TECH-1", RetryPolicy::default());
        let id = submit(&fx);

        assert_eq!(fx.worker.step().unwrap(), StepOutcome::Applied);
        assert_eq!(
            fx.queue.snapshot(&fx.device)[0].status,
            OperationStatus::Succeeded
        );
        assert_eq!(fx.applier.calls(), vec![id]);
    }

    #[test]
    fn transient_error_retries() {
        let fx = fixture("TECH-1", RetryPolicy::default());
        submit(&fx);
        fx.applier
            .push_reply(&fx.device, Err(SyncError::remote_retryable("offline")));

        assert_eq!(fx.worker.step().unwrap(), StepOutcome::Retried);
        let snapshot = fx.queue.snapshot(&fx.device);
        assert_eq!(snapshot[0].status, OperationStatus::Pending);
        assert_eq!(snapshot[0].retry_count, 1);
    }

    #[test]
    fn timeout_is_transient() {
        let fx = fixture("TECH-1", RetryPolicy::default());
        submit(&fx);
        fx.applier.push_reply(&fx.device, Err(SyncError::Timeout));

        assert_eq!(fx.worker.step().unwrap(), StepOutcome::Retried);
    }

    #[test]
    fn permanent_rejection_dead_letters() {
        let fx = fixture("TECH-1", RetryPolicy::default());
        submit(&fx);
        fx.applier.push_reply(
            &fx.device,
            Ok(ApplyOutcome::Rejected {
                reason: "unknown customer_id".into(),
                permanent: true,
            }),
        );

        assert_eq!(fx.worker.step().unwrap(), StepOutcome::DeadLettered);
        assert_eq!(
            fx.queue.snapshot(&fx.device)[0].status,
            OperationStatus::Failed
        );
    }

    #[test]
    fn keep_local_conflict_forces_reapply() {
        let fx = fixture("ADMIN-1", RetryPolicy::default());
        let id = submit(&fx);

        // Remote older than local: keep local, re-apply, succeed.
        fx.applier.push_reply(&fx.device, remote_conflict(0));

        assert_eq!(fx.worker.step().unwrap(), StepOutcome::Applied);
        assert_eq!(fx.applier.calls(), vec![id.clone(), id]);
        assert_eq!(
            fx.queue.snapshot(&fx.device)[0].status,
            OperationStatus::Succeeded
        );
    }

    #[test]
    fn repeated_conflict_after_forced_reapply_becomes_transient() {
        let fx = fixture("ADMIN-1", RetryPolicy::default());
        submit(&fx);

        fx.applier.push_reply(&fx.device, remote_conflict(0));
        fx.applier.push_reply(&fx.device, remote_conflict(0));

        assert_eq!(fx.worker.step().unwrap(), StepOutcome::Retried);
        let snapshot = fx.queue.snapshot(&fx.device);
        assert_eq!(snapshot[0].status, OperationStatus::Pending);
        assert_eq!(snapshot[0].retry_count, 1);
    }

    #[test]
    fn field_device_conflict_escalates() {
        let fx = fixture("TECH-7", RetryPolicy::default());
        submit(&fx);
        fx.applier
            .push_reply(&fx.device, remote_conflict(u64::MAX / 2));

        assert_eq!(fx.worker.step().unwrap(), StepOutcome::Escalated);
        assert_eq!(fx.queue.escalations().len(), 1);
    }

    #[test]
    fn drain_runs_to_quiescence() {
        let fx = fixture("TECH-1", RetryPolicy::immediate(3));
        submit(&fx);
        submit(&fx);
        fx.applier
            .push_reply(&fx.device, Err(SyncError::remote_retryable("offline")));

        let report = fx.worker.drain().unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.retried, 1);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn journal_blip_costs_one_retry_not_the_device() {
        // Update call 1 marks the record InFlight at fetch; call 2,
        // the settle after a successful apply, fails once.
        let journal = Arc::new(BlinkingJournal::failing_at(2));
        let queue = Arc::new(SyncQueue::new(
            journal as Arc<dyn Journal>,
            RetryPolicy::immediate(3),
        ));
        let device = DeviceId::new("TECH-1");
        let applier = Arc::new(MockApplier::new());
        let worker = SyncWorker::new(
            device.clone(),
            Arc::clone(&queue),
            Arc::clone(&applier) as Arc<dyn RemoteApplier>,
            EngineConfig::new(),
            Arc::new(AtomicBool::new(false)),
        );

        let first = queue
            .enqueue(&device, OperationType::UpdateVisit, Payload::new())
            .unwrap();
        queue
            .enqueue(&device, OperationType::UpdateVisit, Payload::new())
            .unwrap();

        assert!(worker.step().is_err());

        // The lost outcome costs one extra attempt of the first
        // record; both records still settle.
        assert_eq!(worker.step().unwrap(), StepOutcome::Applied);
        assert_eq!(worker.step().unwrap(), StepOutcome::Applied);
        assert_eq!(worker.step().unwrap(), StepOutcome::Parked);

        let snapshot = queue.snapshot(&device);
        assert!(snapshot
            .iter()
            .all(|r| r.status == OperationStatus::Succeeded));
        let first_attempts = applier
            .calls_for(&device)
            .iter()
            .filter(|id| **id == first.id)
            .count();
        assert_eq!(first_attempts, 2);
    }
}
