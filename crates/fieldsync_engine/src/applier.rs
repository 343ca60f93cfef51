//! The remote-apply seam.
//!
//! The engine treats the server side (HTTP API, CRM integration,
//! document storage) as a single narrow capability: apply one
//! operation and report what happened.

use crate::error::SyncResult;
use fieldsync_protocol::{DeviceId, OperationId, OperationRecord};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Outcome of applying one operation against the server.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// The operation was applied.
    Applied,
    /// The server rejected the operation.
    Rejected {
        /// Server-supplied reason code or message.
        reason: String,
        /// True for validation-class rejections that will never
        /// succeed; false for outages and other transient causes.
        permanent: bool,
    },
    /// The server holds a divergent version of the target entity.
    Conflict(OperationRecord),
}

/// Capability for applying operations against the remote server.
///
/// Implementations must be idempotent-safe: the engine re-applies the
/// same operation id after a keep-local conflict resolution and after
/// crash recovery of an in-flight record.
///
/// `timeout` is the caller-supplied deadline for the attempt;
/// exceeding it should surface as [`crate::SyncError::Timeout`],
/// which the engine classifies as a transient failure.
pub trait RemoteApplier: Send + Sync {
    /// Applies one operation, blocking up to `timeout`.
    fn apply(&self, record: &OperationRecord, timeout: Duration) -> SyncResult<ApplyOutcome>;
}

/// A scripted applier for tests.
///
/// Replies are queued per device and consumed in order; once a
/// device's script is exhausted every further apply succeeds. All
/// apply calls are recorded so tests can assert ordering.
#[derive(Default)]
pub struct MockApplier {
    scripts: Mutex<HashMap<DeviceId, VecDeque<SyncResult<ApplyOutcome>>>>,
    calls: Mutex<Vec<OperationId>>,
}

impl MockApplier {
    /// Creates a mock applier with no scripted replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the next reply for a device.
    pub fn push_reply(&self, device: &DeviceId, reply: SyncResult<ApplyOutcome>) {
        self.scripts
            .lock()
            .entry(device.clone())
            .or_default()
            .push_back(reply);
    }

    /// Every apply call seen, in order.
    pub fn calls(&self) -> Vec<OperationId> {
        self.calls.lock().clone()
    }

    /// Apply calls seen for one device, in order.
    pub fn calls_for(&self, device: &DeviceId) -> Vec<OperationId> {
        self.calls
            .lock()
            .iter()
            .filter(|id| &id.device_id == device)
            .cloned()
            .collect()
    }
}

impl RemoteApplier for MockApplier {
    fn apply(&self, record: &OperationRecord, _timeout: Duration) -> SyncResult<ApplyOutcome> {
        self.calls.lock().push(record.id.clone());
        match self
            .scripts
            .lock()
            .get_mut(record.device_id())
            .and_then(VecDeque::pop_front)
        {
            Some(reply) => reply,
            None => Ok(ApplyOutcome::Applied),
        }
    }
}
