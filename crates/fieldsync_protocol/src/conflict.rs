//! Deterministic conflict resolution.
//!
//! When a local pending operation and the server's version of the
//! same entity have diverged, the resolver decides which side wins.
//! The policy is last-write-wins with a device-priority escalation:
//! a field technician's edit is never silently discarded, because
//! field corrections often carry domain knowledge a timestamp can't
//! capture.

use crate::operation::OperationRecord;
use serde::{Deserialize, Serialize};

/// Outcome of resolving a (local, remote) conflict pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The local operation wins; re-apply it as a forced overwrite.
    KeepLocal,
    /// The remote version wins; the local operation is superseded.
    KeepRemote,
    /// Neither side can be auto-discarded; escalate to a human.
    ManualReview,
}

/// The conflict-resolution policy.
///
/// `resolve` is a pure, total function over its inputs: the same
/// (local, remote) pair always yields the same [`Resolution`], and it
/// never mutates or takes ownership of either record.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolves a conflict between a local operation and the remote
    /// version of the same entity.
    ///
    /// Rules, in order:
    ///
    /// 1. Local strictly newer than remote wins outright, regardless
    ///    of device.
    /// 2. Otherwise (remote newer *or equal*), a field device's edit
    ///    escalates to manual review.
    /// 3. Otherwise the remote version wins.
    ///
    /// Equal timestamps are treated as "remote not older" and fall
    /// through to rules 2/3: ties favor the server except when the
    /// losing side is a field device, which always escalates.
    pub fn resolve(&self, local: &OperationRecord, remote: &OperationRecord) -> Resolution {
        if local.created_at > remote.created_at {
            return Resolution::KeepLocal;
        }
        if local.device_id().is_field_device() {
            return Resolution::ManualReview;
        }
        Resolution::KeepRemote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{DeviceId, OperationId, OperationType, Payload, Timestamp};
    use proptest::prelude::*;

    fn record(device: &str, created_ms: u64) -> OperationRecord {
        OperationRecord::new(
            OperationId::new(DeviceId::new(device), 1),
            OperationType::UpdateVisit,
            Payload::new(),
            Timestamp::from_millis(created_ms),
        )
    }

    #[test]
    fn local_newer_wins_regardless_of_device() {
        let resolver = ConflictResolver;

        let local = record("TECH-7", 2_000);
        let remote = record("SERVER", 1_000);
        assert_eq!(resolver.resolve(&local, &remote), Resolution::KeepLocal);

        let local = record("ADMIN-1", 2_000);
        assert_eq!(resolver.resolve(&local, &remote), Resolution::KeepLocal);
    }

    #[test]
    fn remote_newer_field_device_escalates() {
        let resolver = ConflictResolver;

        let local = record("TECH-7", 1_000);
        let remote = record("SERVER", 2_000);
        assert_eq!(resolver.resolve(&local, &remote), Resolution::ManualReview);
    }

    #[test]
    fn remote_newer_back_office_yields() {
        let resolver = ConflictResolver;

        let local = record("ADMIN-1", 1_000);
        let remote = record("SERVER", 2_000);
        assert_eq!(resolver.resolve(&local, &remote), Resolution::KeepRemote);
    }

    #[test]
    fn equal_timestamps_treated_as_remote_not_older() {
        let resolver = ConflictResolver;

        let remote = record("SERVER", 1_000);

        let local = record("TECH-7", 1_000);
        assert_eq!(resolver.resolve(&local, &remote), Resolution::ManualReview);

        let local = record("ADMIN-1", 1_000);
        assert_eq!(resolver.resolve(&local, &remote), Resolution::KeepRemote);
    }

    fn device_id_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            (0u32..1_000).prop_map(|n| format!("TECH-{n}")),
            (0u32..1_000).prop_map(|n| format!("ADMIN-{n}")),
            "[A-Z]{2,8}-[0-9]{1,4}",
        ]
    }

    proptest! {
        #[test]
        fn resolver_is_deterministic(
            device in device_id_strategy(),
            local_ms in 0u64..u64::MAX / 2,
            remote_ms in 0u64..u64::MAX / 2,
        ) {
            let resolver = ConflictResolver;
            let local = record(&device, local_ms);
            let remote = record("SERVER", remote_ms);

            let first = resolver.resolve(&local, &remote);
            let second = resolver.resolve(&local, &remote);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn resolver_follows_the_three_rules(
            device in device_id_strategy(),
            local_ms in 0u64..u64::MAX / 2,
            remote_ms in 0u64..u64::MAX / 2,
        ) {
            let resolver = ConflictResolver;
            let local = record(&device, local_ms);
            let remote = record("SERVER", remote_ms);

            let expected = if local_ms > remote_ms {
                Resolution::KeepLocal
            } else if device.starts_with("TECH-") {
                Resolution::ManualReview
            } else {
                Resolution::KeepRemote
            };
            prop_assert_eq!(resolver.resolve(&local, &remote), expected);
        }
    }
}
