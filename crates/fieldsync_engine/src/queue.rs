//! Durable, ordered per-device operation queues.
//!
//! Insertion order is the effective causal order for a single
//! device's operations. The queue exclusively owns record lifecycle;
//! workers borrow records for processing and report results back via
//! [`SyncQueue::mark_result`]. Each device's state sits behind its
//! own mutex so devices never contend with each other.

use crate::config::RetryPolicy;
use crate::error::{SyncError, SyncResult};
use crate::journal::{Journal, JournalFrame};
use fieldsync_protocol::{
    ConflictResolver, DeviceId, OperationId, OperationRecord, OperationStatus, OperationType,
    Payload, Resolution, Timestamp,
};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of one remote-apply attempt, as reported by a worker.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The operation was applied remotely.
    Success,
    /// The attempt failed but can be retried (network/server
    /// temporarily unavailable, deadline exceeded).
    TransientFailure,
    /// The server rejected the operation as invalid; never retried.
    PermanentFailure,
    /// The server reported a divergent remote version of the same
    /// entity.
    ConflictDetected(OperationRecord),
}

/// What the queue decided after a reported attempt outcome. Tells the
/// worker how to proceed.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// The record succeeded and is settled.
    Done,
    /// The record was requeued; it becomes eligible again at the
    /// given instant.
    RetryAt(Instant),
    /// The record was dead-lettered.
    DeadLettered,
    /// The local record was superseded by the remote version and
    /// settled as a no-op.
    Superseded,
    /// The local record won the conflict; re-apply it now as a forced
    /// overwrite.
    Reapply,
    /// The conflict was escalated to manual review.
    Escalated,
}

/// A conflict escalated for human reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    /// Id of the escalated local operation.
    pub operation_id: OperationId,
    /// The local operation as it was when the conflict was detected.
    pub local: OperationRecord,
    /// The divergent remote version.
    pub remote: OperationRecord,
    /// When the conflict was detected.
    pub detected_at: Timestamp,
}

/// One row of the pending-sync status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    /// Operation id.
    pub id: OperationId,
    /// Operation type.
    pub op_type: OperationType,
    /// Current status, including terminal markers.
    pub status: OperationStatus,
    /// Failed attempts so far.
    pub retry_count: u32,
}

#[derive(Debug, Default)]
struct DeviceState {
    /// Records in enqueue order.
    records: Vec<OperationRecord>,
    /// Next sequence number to assign.
    next_sequence: u64,
    /// The single record currently borrowed by a worker, if any.
    in_flight: Option<OperationId>,
    /// Backoff gate: sequence -> earliest next attempt.
    eligible_at: HashMap<u64, Instant>,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            next_sequence: 1,
            ..Self::default()
        }
    }

    fn position_of(&self, id: &OperationId) -> Option<usize> {
        self.records.iter().position(|r| &r.id == id)
    }

    /// Index of the oldest Pending record whose backoff has elapsed.
    fn runnable_index(&self, now: Instant) -> Option<usize> {
        if self.in_flight.is_some() {
            return None;
        }
        self.records.iter().position(|r| {
            r.status == OperationStatus::Pending
                && self
                    .eligible_at
                    .get(&r.id.sequence)
                    .is_none_or(|at| *at <= now)
        })
    }

    /// Earliest future eligibility among Pending records.
    fn next_eligibility(&self, now: Instant) -> Option<Instant> {
        self.records
            .iter()
            .filter(|r| r.status == OperationStatus::Pending)
            .filter_map(|r| self.eligible_at.get(&r.id.sequence))
            .filter(|at| **at > now)
            .min()
            .copied()
    }
}

struct DeviceQueue {
    state: Mutex<DeviceState>,
    wake: Condvar,
}

impl DeviceQueue {
    fn new(state: DeviceState) -> Self {
        Self {
            state: Mutex::new(state),
            wake: Condvar::new(),
        }
    }
}

/// The durable sync queue: one ordered record sequence per device.
pub struct SyncQueue {
    devices: RwLock<HashMap<DeviceId, Arc<DeviceQueue>>>,
    journal: Arc<dyn Journal>,
    resolver: ConflictResolver,
    retry: RetryPolicy,
    escalations: Mutex<Vec<Escalation>>,
}

impl SyncQueue {
    /// Creates an empty queue on top of a journal.
    pub fn new(journal: Arc<dyn Journal>, retry: RetryPolicy) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            journal,
            resolver: ConflictResolver,
            retry,
            escalations: Mutex::new(Vec::new()),
        }
    }

    /// Rebuilds queue state from the journal.
    ///
    /// Records that were InFlight when the process died are requeued
    /// as Pending: the remote apply may or may not have landed, and
    /// the applier contract makes re-applying the same operation id
    /// safe.
    pub fn recover(journal: Arc<dyn Journal>, retry: RetryPolicy) -> SyncResult<Self> {
        let contents = journal.load()?;

        let mut devices: HashMap<DeviceId, DeviceState> = HashMap::new();
        for mut record in contents.records {
            if record.status == OperationStatus::InFlight {
                tracing::info!(id = %record.id, "requeueing operation left in flight");
                record.status = OperationStatus::Pending;
                journal.update(&record.id, OperationStatus::Pending, record.retry_count)?;
            }
            let state = devices
                .entry(record.device_id().clone())
                .or_insert_with(DeviceState::new);
            state.next_sequence = state.next_sequence.max(record.id.sequence + 1);
            state.records.push(record);
        }
        for (device_id, floor) in contents.sequence_floors {
            let state = devices.entry(device_id).or_insert_with(DeviceState::new);
            state.next_sequence = state.next_sequence.max(floor);
        }

        let devices = devices
            .into_iter()
            .map(|(id, state)| (id, Arc::new(DeviceQueue::new(state))))
            .collect();

        Ok(Self {
            devices: RwLock::new(devices),
            journal,
            resolver: ConflictResolver,
            retry,
            escalations: Mutex::new(contents.escalations),
        })
    }

    /// The retry policy in effect.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn device_queue(&self, device: &DeviceId) -> Arc<DeviceQueue> {
        if let Some(queue) = self.devices.read().get(device) {
            return Arc::clone(queue);
        }
        // Unknown device implicitly creates its queue.
        let mut devices = self.devices.write();
        Arc::clone(
            devices
                .entry(device.clone())
                .or_insert_with(|| Arc::new(DeviceQueue::new(DeviceState::new()))),
        )
    }

    fn existing_queue(&self, device: &DeviceId) -> Option<Arc<DeviceQueue>> {
        self.devices.read().get(device).cloned()
    }

    /// Appends a new operation to a device's queue.
    ///
    /// The record is journaled before this returns; that append is
    /// the durability boundary of `submit`.
    pub fn enqueue(
        &self,
        device: &DeviceId,
        op_type: OperationType,
        payload: Payload,
    ) -> SyncResult<OperationRecord> {
        let queue = self.device_queue(device);
        let mut state = queue.state.lock();

        let sequence = state.next_sequence;
        let record = OperationRecord::new(
            OperationId::new(device.clone(), sequence),
            op_type,
            payload,
            Timestamp::now(),
        );

        self.journal.append(&record)?;
        state.next_sequence += 1;
        state.records.push(record.clone());
        queue.wake.notify_all();

        tracing::debug!(id = %record.id, op_type = %op_type, "enqueued operation");
        Ok(record)
    }

    /// Returns the oldest runnable Pending record for a device and
    /// marks it InFlight.
    ///
    /// At most one record per device is InFlight at a time; returns
    /// `None` while one is, when nothing is pending, or while all
    /// pending records are still backing off.
    pub fn next_pending(&self, device: &DeviceId) -> SyncResult<Option<OperationRecord>> {
        let Some(queue) = self.existing_queue(device) else {
            return Ok(None);
        };
        let mut state = queue.state.lock();

        let Some(idx) = state.runnable_index(Instant::now()) else {
            return Ok(None);
        };

        let id = state.records[idx].id.clone();
        let retry_count = state.records[idx].retry_count;
        self.journal
            .update(&id, OperationStatus::InFlight, retry_count)?;

        let state = &mut *state;
        state.records[idx].status = OperationStatus::InFlight;
        state.eligible_at.remove(&id.sequence);
        state.in_flight = Some(id);
        Ok(Some(state.records[idx].clone()))
    }

    /// Records the outcome of a remote-apply attempt and applies the
    /// resulting state transition.
    ///
    /// Conflicts are resolved here, under the device mutex, so the
    /// transition and the escalation-list append are atomic.
    pub fn mark_result(
        &self,
        id: &OperationId,
        outcome: AttemptOutcome,
    ) -> SyncResult<Disposition> {
        let queue = self
            .existing_queue(&id.device_id)
            .ok_or_else(|| SyncError::UnknownOperation { id: id.clone() })?;
        let mut guard = queue.state.lock();
        let state = &mut *guard;

        let idx = state
            .position_of(id)
            .ok_or_else(|| SyncError::UnknownOperation { id: id.clone() })?;

        if state.records[idx].status != OperationStatus::InFlight
            || state.in_flight.as_ref() != Some(id)
        {
            return Err(SyncError::QueueCorruption {
                id: id.clone(),
                detail: format!(
                    "result reported for record in status {}",
                    state.records[idx].status
                ),
            });
        }

        let disposition = match self.settle(state, idx, outcome) {
            Ok(disposition) => disposition,
            Err(e) => {
                // A journal write failed mid-settle and the attempt
                // outcome is lost. Requeue the record so the blip
                // costs one extra attempt, not the whole device.
                state.records[idx].status = OperationStatus::Pending;
                state.in_flight = None;
                queue.wake.notify_all();
                return Err(e);
            }
        };

        queue.wake.notify_all();
        Ok(disposition)
    }

    /// Applies one attempt outcome to the record at `idx`. Caller
    /// holds the device mutex and has validated the InFlight state.
    fn settle(
        &self,
        state: &mut DeviceState,
        idx: usize,
        outcome: AttemptOutcome,
    ) -> SyncResult<Disposition> {
        let id = state.records[idx].id.clone();
        let id = &id;
        let disposition = match outcome {
            AttemptOutcome::Success => {
                self.journal.update(
                    id,
                    OperationStatus::Succeeded,
                    state.records[idx].retry_count,
                )?;
                state.records[idx].status = OperationStatus::Succeeded;
                state.in_flight = None;
                tracing::debug!(id = %id, "operation applied");
                Disposition::Done
            }
            AttemptOutcome::TransientFailure => {
                let retry_count = state.records[idx].retry_count + 1;
                if retry_count > self.retry.max_retries {
                    self.journal
                        .update(id, OperationStatus::Failed, retry_count)?;
                    state.records[idx].status = OperationStatus::Failed;
                    state.records[idx].retry_count = retry_count;
                    state.in_flight = None;
                    tracing::warn!(id = %id, retry_count, "retries exhausted, dead-lettering");
                    Disposition::DeadLettered
                } else {
                    self.journal
                        .update(id, OperationStatus::Pending, retry_count)?;
                    let at = Instant::now() + self.retry.delay_for(retry_count);
                    state.records[idx].status = OperationStatus::Pending;
                    state.records[idx].retry_count = retry_count;
                    state.eligible_at.insert(id.sequence, at);
                    state.in_flight = None;
                    tracing::debug!(id = %id, retry_count, "transient failure, requeued");
                    Disposition::RetryAt(at)
                }
            }
            AttemptOutcome::PermanentFailure => {
                self.journal
                    .update(id, OperationStatus::Failed, state.records[idx].retry_count)?;
                state.records[idx].status = OperationStatus::Failed;
                state.in_flight = None;
                tracing::warn!(id = %id, "permanent rejection, dead-lettering");
                Disposition::DeadLettered
            }
            AttemptOutcome::ConflictDetected(remote) => {
                match self.resolver.resolve(&state.records[idx], &remote) {
                    Resolution::KeepLocal => {
                        // Record stays InFlight; the worker re-applies
                        // the same record as a forced overwrite.
                        tracing::debug!(id = %id, "conflict resolved keep-local, re-applying");
                        Disposition::Reapply
                    }
                    Resolution::KeepRemote => {
                        self.journal.update(
                            id,
                            OperationStatus::Succeeded,
                            state.records[idx].retry_count,
                        )?;
                        state.records[idx].status = OperationStatus::Succeeded;
                        state.in_flight = None;
                        tracing::debug!(id = %id, "conflict resolved keep-remote, superseded");
                        Disposition::Superseded
                    }
                    Resolution::ManualReview => {
                        self.journal.update(
                            id,
                            OperationStatus::ManualReview,
                            state.records[idx].retry_count,
                        )?;
                        state.records[idx].status = OperationStatus::ManualReview;
                        let escalation = Escalation {
                            operation_id: id.clone(),
                            local: state.records[idx].clone(),
                            remote,
                            detected_at: Timestamp::now(),
                        };
                        self.journal.escalate(&escalation)?;
                        state.in_flight = None;
                        self.escalations.lock().push(escalation);
                        tracing::warn!(id = %id, "conflict escalated to manual review");
                        Disposition::Escalated
                    }
                }
            }
        };
        Ok(disposition)
    }

    /// Read-only view of a device's records in enqueue order.
    pub fn snapshot(&self, device: &DeviceId) -> Vec<OperationRecord> {
        match self.existing_queue(device) {
            Some(queue) => queue.state.lock().records.clone(),
            None => Vec::new(),
        }
    }

    /// Status report for the pending-sync query.
    pub fn pending_for(&self, device: &DeviceId) -> Vec<PendingEntry> {
        self.snapshot(device)
            .into_iter()
            .map(|r| PendingEntry {
                id: r.id,
                op_type: r.op_type,
                status: r.status,
                retry_count: r.retry_count,
            })
            .collect()
    }

    /// All conflicts escalated for manual review.
    pub fn escalations(&self) -> Vec<Escalation> {
        self.escalations.lock().clone()
    }

    /// Devices with a queue, in no particular order.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.read().keys().cloned().collect()
    }

    /// Drops Succeeded records and rewrites the journal to the
    /// surviving state, returning how many records were removed.
    ///
    /// A maintenance operation: run it while no workers are active.
    /// Failed and ManualReview records are kept, since both are
    /// surfaced to callers. Each device's sequence floor is journaled
    /// so a fully drained device never reuses ids after a restart.
    pub fn compact(&self) -> SyncResult<usize> {
        let devices = self.devices.read();
        let mut frames = Vec::new();
        let mut removed = 0usize;

        for (device_id, queue) in devices.iter() {
            let mut guard = queue.state.lock();
            let state = &mut *guard;
            state.records.retain(|r| {
                if r.status == OperationStatus::Succeeded {
                    removed += 1;
                    false
                } else {
                    true
                }
            });
            frames.push(JournalFrame::SequenceFloor {
                device_id: device_id.clone(),
                next_sequence: state.next_sequence,
            });
            for record in &state.records {
                frames.push(JournalFrame::Enqueued(record.clone()));
            }
        }
        for escalation in self.escalations.lock().iter() {
            frames.push(JournalFrame::Escalated(escalation.clone()));
        }

        self.journal.rewrite(&frames)?;
        tracing::info!(removed, "journal compacted");
        Ok(removed)
    }

    /// Returns true if the device has a record a worker could pick up
    /// right now.
    pub fn has_runnable(&self, device: &DeviceId) -> bool {
        match self.existing_queue(device) {
            Some(queue) => queue.state.lock().runnable_index(Instant::now()).is_some(),
            None => false,
        }
    }

    /// Blocks until the device plausibly has work, a notification
    /// arrives, or `max_wait` elapses.
    ///
    /// Wakes early at the next backoff eligibility instant so retries
    /// run on schedule without busy-waiting.
    pub fn park(&self, device: &DeviceId, max_wait: Duration) {
        let queue = self.device_queue(device);
        let mut state = queue.state.lock();

        let now = Instant::now();
        if state.runnable_index(now).is_some() {
            return;
        }
        let deadline = state
            .next_eligibility(now)
            .unwrap_or(now + max_wait)
            .min(now + max_wait);
        queue.wake.wait_until(&mut state, deadline);
    }

    /// Wakes any worker parked on the device.
    pub fn notify(&self, device: &DeviceId) {
        if let Some(queue) = self.existing_queue(device) {
            queue.wake.notify_all();
        }
    }

    /// Wakes all parked workers.
    pub fn notify_all(&self) {
        for queue in self.devices.read().values() {
            queue.wake.notify_all();
        }
    }
}
